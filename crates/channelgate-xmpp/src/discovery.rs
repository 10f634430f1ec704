//! Channel server discovery (XEP-0030).
//!
//! A domain either is its own channel server, identified by a
//! `pubsub/channels` disco identity, or lists the server among its disco
//! items. Candidates are probed in advertised order and the first match
//! wins. Only positive answers are cached.

use std::time::Duration;

use jid::Jid;
use tracing::{debug, info, instrument};

use crate::cache::ExpiringCache;
use crate::error::DiscoveryError;
use crate::session::Session;
use crate::stanza;

pub struct DiscoveryResolver {
    cache: ExpiringCache<String, Jid>,
}

impl DiscoveryResolver {
    /// `ttl` is how long a resolved server is trusted.
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: ExpiringCache::new(ttl),
        }
    }

    /// Cached server for `domain`, if any.
    pub fn cached(&self, domain: &str) -> Option<Jid> {
        self.cache.get(&normalize(domain))
    }

    /// Drop the cached answer for `domain`.
    pub fn forget(&self, domain: &str) {
        self.cache.remove(&normalize(domain));
    }

    /// Find the channel server for `domain`, querying over `session`.
    #[instrument(skip(self, session))]
    pub async fn discover(&self, session: &Session, domain: &str) -> Result<Jid, DiscoveryError> {
        let domain = normalize(domain);
        if let Some(server) = self.cache.get(&domain) {
            debug!(%server, "Discovery cache hit");
            return Ok(server);
        }

        let target = Jid::new(&domain).map_err(|_| DiscoveryError::NotFound {
            domain: domain.clone(),
        })?;

        if probe(session, &domain, &target).await? {
            return Ok(self.remember(domain, target));
        }

        let items = session
            .send_query(stanza::disco_items_query(), Some(&target))
            .await;
        if items.is_synthesized() {
            return Err(DiscoveryError::transport(&domain, "disco#items went unanswered"));
        }
        let candidates = stanza::disco_item_jids(&items);
        debug!(count = candidates.len(), "Probing advertised items");

        for candidate in candidates {
            if probe(session, &domain, &candidate).await? {
                return Ok(self.remember(domain, candidate));
            }
        }

        info!("No channel server found");
        Err(DiscoveryError::NotFound { domain })
    }

    fn remember(&self, domain: String, server: Jid) -> Jid {
        info!(%domain, %server, "Resolved channel server");
        self.cache.put(domain, server.clone());
        server
    }
}

/// Ask `candidate` for its identity. An error reply is a non-match; no
/// reply at all aborts discovery.
async fn probe(session: &Session, domain: &str, candidate: &Jid) -> Result<bool, DiscoveryError> {
    let reply = session
        .send_query(stanza::disco_info_query(), Some(candidate))
        .await;
    if reply.is_synthesized() {
        return Err(DiscoveryError::transport(
            domain,
            format!("disco#info to {candidate} went unanswered"),
        ));
    }
    let matched = stanza::is_channel_server(&reply);
    debug!(%candidate, matched, error = reply.is_error(), "Probed candidate");
    Ok(matched)
}

fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}
