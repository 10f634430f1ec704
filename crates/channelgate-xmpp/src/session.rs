//! One live XMPP connection and everything scoped to it.
//!
//! A spawned driver task owns the transport. It writes whatever the session
//! queues on its outbound channel and routes inbound stanzas: IQ replies to
//! the query correlator, pubsub event messages to the subscription table.
//! When the driver stops, for whatever reason, the outbound channel is
//! closed so that later queries fail immediately, and queries in flight
//! and queued subscription waiters are released.

use std::sync::Arc;
use std::time::Duration;

use jid::{BareJid, Jid};
use minidom::Element;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::error::SubscribeError;
use crate::presence::PresenceTracker;
use crate::query::QueryCorrelator;
use crate::stanza::{self, Reply};
use crate::subscription::{NodeFeed, SubscriptionTable};
use crate::transport::XmppTransport;

/// An authenticated connection handed out to request handlers.
pub struct Session {
    key: String,
    jid: Jid,
    correlator: Arc<QueryCorrelator>,
    subscriptions: Arc<SubscriptionTable>,
    presence: Arc<PresenceTracker>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("jid", &self.jid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Take ownership of `transport` and start driving it.
    pub fn start<T: XmppTransport>(key: String, transport: T, query_timeout: Duration) -> Arc<Self> {
        let jid = transport.bound_jid().clone();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let correlator = Arc::new(QueryCorrelator::new(
            jid.clone(),
            outbound_tx.clone(),
            query_timeout,
        ));
        let presence = Arc::new(PresenceTracker::new(outbound_tx));
        let subscriptions = Arc::new(SubscriptionTable::new(
            jid.to_bare(),
            Arc::clone(&correlator),
            Arc::clone(&presence),
        ));
        let shutdown = CancellationToken::new();

        let driver = Driver {
            transport,
            outbound: outbound_rx,
            correlator: Arc::clone(&correlator),
            subscriptions: Arc::clone(&subscriptions),
            shutdown: shutdown.clone(),
        };
        let span = tracing::info_span!("session", jid = %jid);
        tokio::spawn(driver.run().instrument(span));

        info!(%jid, "Session started");
        Arc::new(Self {
            key,
            jid,
            correlator,
            subscriptions,
            presence,
            shutdown,
        })
    }

    /// Key clients present to reuse this session.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Full JID bound at login.
    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    pub fn bare_jid(&self) -> BareJid {
        self.jid.to_bare()
    }

    /// Send an IQ and wait for its reply. See [`QueryCorrelator::send_query`].
    pub async fn send_query(&self, request: Element, to: Option<&Jid>) -> Reply {
        self.correlator.send_query(request, to).await
    }

    /// Subscribe to `node` on `server` for the lifetime of this session.
    pub async fn subscribe(
        &self,
        server: &BareJid,
        node: &str,
    ) -> Result<Arc<NodeFeed>, SubscribeError> {
        self.subscriptions.subscribe(server, node).await
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Reference-counted broadcast presence; the first caller makes the
    /// session available.
    pub fn send_presence_online(&self) {
        self.presence.online();
    }

    /// Undo one [`send_presence_online`](Self::send_presence_online); the
    /// last caller makes the session unavailable.
    pub fn send_presence_offline(&self) {
        self.presence.offline();
    }

    /// End the connection. Idempotent.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            info!(jid = %self.jid, "Closing session");
        }
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the session has ended.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Driver<T> {
    transport: T,
    outbound: mpsc::UnboundedReceiver<Element>,
    correlator: Arc<QueryCorrelator>,
    subscriptions: Arc<SubscriptionTable>,
    shutdown: CancellationToken,
}

impl<T: XmppTransport> Driver<T> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                queued = self.outbound.recv() => {
                    let Some(stanza) = queued else { break };
                    if let Err(error) = self.transport.send(stanza).await {
                        warn!(%error, "Failed to write stanza");
                        break;
                    }
                }
                inbound = self.transport.recv() => match inbound {
                    Some(Ok(stanza)) => {
                        let Some(answer) = self.route(stanza) else { continue };
                        if let Err(error) = self.transport.send(answer).await {
                            warn!(%error, "Failed to answer request");
                            break;
                        }
                    }
                    Some(Err(error)) => {
                        warn!(%error, "Connection failed");
                        break;
                    }
                    None => {
                        info!("Connection closed by server");
                        break;
                    }
                },
            }
        }

        self.shutdown.cancel();
        self.outbound.close();
        self.correlator.close();
        self.subscriptions.close();
        if let Err(error) = self.transport.close().await {
            debug!(%error, "Error while closing connection");
        }
        info!("Session ended");
    }

    /// Hand an inbound stanza to whoever waits for it. Returns the answer
    /// owed to the server for IQ requests.
    fn route(&self, stanza: Element) -> Option<Element> {
        if self.correlator.dispatch(&stanza) {
            return None;
        }

        if let Some(event) = stanza::parse_event_items(&stanza) {
            let from = stanza
                .attr("from")
                .and_then(|from| Jid::new(from).ok())
                .map(|from| from.to_bare());
            match from {
                Some(from) if self.subscriptions.deliver(&from, event) => {}
                _ => debug!("Pushed items for an unknown subscription"),
            }
            return None;
        }

        let answer = stanza::answer_request(&stanza);
        if answer.is_some() {
            debug!(id = stanza.attr("id"), "Answering inbound request");
        } else {
            debug!(name = stanza.name(), "Ignoring inbound stanza");
        }
        answer
    }
}
