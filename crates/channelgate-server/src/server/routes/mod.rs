//! API handlers. Each one runs behind the session middleware and finds its
//! [`ProvidedSession`] in the request extensions.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use channelgate_xmpp::{Connector, FeedItem, Gateway, ProvidedSession};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::ApiError;

#[derive(Debug, Serialize)]
pub struct DiscoverResponse {
    pub domain: String,
    pub server: String,
}

/// GET /api/v1/discover/:domain
///
/// Channel server responsible for `domain`.
pub async fn discover<C: Connector>(
    State(gateway): State<Arc<Gateway<C>>>,
    Extension(provided): Extension<ProvidedSession>,
    Path(domain): Path<String>,
) -> Result<Json<DiscoverResponse>, ApiError> {
    let server = gateway
        .resolver()
        .discover(&provided.session, &domain)
        .await?;
    Ok(Json(DiscoverResponse {
        domain,
        server: server.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct UpdatesQuery {
    /// Id of the last item the client has seen
    pub since: Option<String>,
    /// Long-poll wait in seconds, capped by the configured maximum
    pub timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct UpdatesResponse {
    pub channel: String,
    pub node: String,
    pub cursor: Option<String>,
    pub items: Vec<ItemResponse>,
}

#[derive(Debug, Serialize)]
pub struct ItemResponse {
    pub id: String,
    /// Milliseconds since the epoch
    pub published: i64,
    /// Item payload as serialized XML
    pub payload: Option<String>,
}

impl From<FeedItem> for ItemResponse {
    fn from(item: FeedItem) -> Self {
        Self {
            id: item.id,
            published: item.published,
            payload: item.payload.as_ref().and_then(|payload| {
                let mut xml = Vec::new();
                payload.write_to(&mut xml).ok()?;
                String::from_utf8(xml).ok()
            }),
        }
    }
}

/// GET /api/v1/channels/:channel/:node/updates
///
/// Subscribe the session to the channel node (once) and long-poll for items
/// newer than `since`.
pub async fn updates<C: Connector>(
    State(gateway): State<Arc<Gateway<C>>>,
    Extension(provided): Extension<ProvidedSession>,
    Path((channel, node)): Path<(String, String)>,
    Query(query): Query<UpdatesQuery>,
) -> Result<Json<UpdatesResponse>, ApiError> {
    let Some((_, domain)) = channel.split_once('@').filter(|(user, domain)| {
        !user.is_empty() && !domain.is_empty()
    }) else {
        return Err(ApiError::BadRequest(format!(
            "channel '{channel}' is not of the form user@domain"
        )));
    };

    let server = gateway
        .resolver()
        .discover(&provided.session, domain)
        .await?;
    let node = format!("/user/{channel}/{node}");
    let feed = provided.session.subscribe(&server.to_bare(), &node).await?;

    let limit = gateway.config().timeouts.long_poll();
    let wait = query
        .timeout
        .map(Duration::from_secs)
        .map_or(limit, |requested| requested.min(limit));
    let items = feed
        .wait_for_items_after(query.since.as_deref(), wait)
        .await;
    debug!(%node, count = items.len(), "Returning channel items");

    Ok(Json(UpdatesResponse {
        channel,
        node,
        cursor: feed.cursor(),
        items: items.into_iter().map(ItemResponse::from).collect(),
    }))
}
