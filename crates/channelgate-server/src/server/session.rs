//! Per-request session resolution.
//!
//! Every API request carries an XMPP session: the one named by the
//! `X-Session-Id` header, the one belonging to the `Authorization: Basic`
//! credential, or the shared anonymous session when neither is present.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine};
use channelgate_xmpp::{Connector, Credential, Gateway};
use tracing::debug;

use super::error::ApiError;

/// Header carrying the session key in both directions.
pub const SESSION_HEADER: &str = "x-session-id";

/// Resolve the request's session and store it as a
/// [`ProvidedSession`](channelgate_xmpp::ProvidedSession) extension.
pub async fn require_session<C: Connector>(
    State(gateway): State<Arc<Gateway<C>>>,
    mut request: Request,
    next: Next,
) -> Response {
    let credential = match basic_credential(request.headers()) {
        Ok(credential) => credential,
        Err(error) => return error.into_response(),
    };
    let key = request
        .headers()
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let provided = match gateway.session_for(credential.as_ref(), key.as_deref()).await {
        Ok(provided) => provided,
        Err(error) => return ApiError::from(error).into_response(),
    };
    debug!(jid = %provided.session.jid(), created = provided.created, "Session resolved");

    let echo = (!provided.is_anonymous())
        .then(|| HeaderValue::from_str(&provided.key).ok())
        .flatten();
    request.extensions_mut().insert(provided);

    let mut response = next.run(request).await;
    if let Some(value) = echo {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

/// Decode `Authorization: Basic`. No header is no credential; anything
/// else that does not decode to `user:password` is rejected.
fn basic_credential(headers: &HeaderMap) -> Result<Option<Credential>, ApiError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let malformed = || ApiError::Unauthorized("malformed Authorization header".into());

    let value = value.to_str().map_err(|_| malformed())?;
    let encoded = value
        .strip_prefix("Basic ")
        .or_else(|| value.strip_prefix("basic "))
        .ok_or_else(malformed)?;
    let decoded = STANDARD.decode(encoded.trim()).map_err(|_| malformed())?;
    let decoded = String::from_utf8(decoded).map_err(|_| malformed())?;
    let (user, password) = decoded.split_once(':').ok_or_else(malformed)?;
    if user.is_empty() {
        return Err(malformed());
    }

    Ok(Some(Credential::new(user, password)))
}
