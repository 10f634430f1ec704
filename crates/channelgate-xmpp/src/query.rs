//! Request/reply correlation over one connection.
//!
//! Each outgoing IQ gets a fresh id from the pending cache; the reply sink
//! waits under that id until the matching `result`/`error` arrives or the
//! cache times it out.

use std::time::Duration;

use jid::Jid;
use minidom::Element;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

use crate::cache::ExpiringCache;
use crate::stanza::{self, Reply};

struct PendingQuery {
    sink: oneshot::Sender<Reply>,
    peer: Option<Jid>,
}

/// Correlates outgoing queries with their replies for one session.
pub struct QueryCorrelator {
    own_jid: Jid,
    pending: ExpiringCache<String, PendingQuery>,
    outbound: mpsc::UnboundedSender<Element>,
}

impl QueryCorrelator {
    /// `outbound` feeds the connection writer; `timeout` bounds every query.
    pub fn new(own_jid: Jid, outbound: mpsc::UnboundedSender<Element>, timeout: Duration) -> Self {
        let pending = ExpiringCache::with_expiry_hook(timeout, |id: String, query: PendingQuery| {
            warn!(%id, peer = ?query.peer, "Query timed out");
            let _ = query.sink.send(Reply::timed_out(&id, query.peer.as_ref()));
        });
        Self {
            own_jid,
            pending,
            outbound,
        }
    }

    /// Number of queries still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send `request` and wait for its reply.
    ///
    /// Always resolves: with the correlated stanza, with a synthesized
    /// `service-unavailable` error on timeout, or immediately with one if the
    /// connection is already gone. Error replies are returned as-is.
    #[instrument(skip(self, request))]
    pub async fn send_query(&self, mut request: Element, to: Option<&Jid>) -> Reply {
        let id = self.pending.generate_key();
        let (sink, reply) = oneshot::channel();

        request.set_attr("from", self.own_jid.to_string());
        if let Some(to) = to {
            request.set_attr("to", to.to_string());
        }
        request.set_attr("id", id.as_str());

        self.pending.put(
            id.clone(),
            PendingQuery {
                sink,
                peer: to.cloned(),
            },
        );

        if self.outbound.send(request).is_err() {
            debug!(%id, "Connection closed, failing query");
            self.pending.remove(&id);
            return Reply::connection_closed(&id, to);
        }
        debug!(%id, "Query sent");

        reply
            .await
            .unwrap_or_else(|_| Reply::connection_closed(&id, to))
    }

    /// Route an inbound stanza to its waiting query.
    ///
    /// Returns `false` when the stanza is not an IQ reply to a pending query.
    pub fn dispatch(&self, stanza: &Element) -> bool {
        if !stanza::is_iq_reply(stanza) {
            return false;
        }
        let Some(id) = stanza.attr("id") else {
            return false;
        };
        let Some(query) = self.pending.remove(id) else {
            debug!(%id, "Reply for unknown or expired query");
            return false;
        };
        debug!(%id, "Query answered");
        let _ = query.sink.send(Reply::new(stanza.clone()));
        true
    }

    /// Fail every pending query with a synthesized error. Called once the
    /// connection is gone.
    pub fn close(&self) {
        for (id, query) in self.pending.drain() {
            let _ = query
                .sink
                .send(Reply::connection_closed(&id, query.peer.as_ref()));
        }
    }
}
