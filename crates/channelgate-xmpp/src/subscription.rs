//! Temporary, presence-backed node subscriptions and their item buffers.
//!
//! The first interest in a `(server, node)` pair takes a presence reference
//! on the server and sends a subscribe request whose options tie its
//! lifetime to our presence. Everyone who asks while that request is in
//! flight waits on the same outcome. Once subscribed, pushed items land in
//! the shared [`NodeFeed`], which long-poll handlers read with a cursor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use jid::{BareJid, Jid};
use minidom::Element;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn, Instrument};

use crate::error::SubscribeError;
use crate::presence::PresenceTracker;
use crate::query::QueryCorrelator;
use crate::stanza::{self, EventItems};

/// One buffered item.
#[derive(Debug, Clone)]
pub struct FeedItem {
    pub id: String,
    /// Milliseconds since the epoch
    pub published: i64,
    pub payload: Option<Element>,
}

#[derive(Debug, Default)]
struct FeedBuffer {
    items: Vec<FeedItem>,
    cursor: Option<String>,
}

/// Shared per-node state: publisher, append-only item buffer and the id of
/// the last item delivered to it.
#[derive(Debug)]
pub struct NodeFeed {
    publisher: BareJid,
    node: String,
    buffer: Mutex<FeedBuffer>,
    appended: Notify,
}

impl NodeFeed {
    pub fn new(publisher: BareJid, node: impl Into<String>) -> Self {
        Self {
            publisher,
            node: node.into(),
            buffer: Mutex::new(FeedBuffer::default()),
            appended: Notify::new(),
        }
    }

    fn buffer(&self) -> MutexGuard<'_, FeedBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publisher(&self) -> &BareJid {
        &self.publisher
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn len(&self) -> usize {
        self.buffer().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id of the most recently appended item.
    pub fn cursor(&self) -> Option<String> {
        self.buffer().cursor.clone()
    }

    /// Items appended after the item with id `cursor`.
    ///
    /// With no cursor, or one that is not in the buffer, every item is
    /// returned.
    pub fn items_after(&self, cursor: Option<&str>) -> Vec<FeedItem> {
        let buffer = self.buffer();
        let start = cursor
            .and_then(|cursor| buffer.items.iter().rposition(|item| item.id == cursor))
            .map(|position| position + 1)
            .unwrap_or(0);
        buffer.items[start..].to_vec()
    }

    /// Like [`items_after`](Self::items_after), but waits up to `timeout`
    /// for something new when nothing is buffered yet.
    pub async fn wait_for_items_after(&self, cursor: Option<&str>, timeout: Duration) -> Vec<FeedItem> {
        let deadline = Instant::now() + timeout;
        loop {
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let items = self.items_after(cursor);
            if !items.is_empty() {
                return items;
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Vec::new();
            }
        }
    }

    pub(crate) fn append(&self, items: impl IntoIterator<Item = FeedItem>) {
        let mut buffer = self.buffer();
        for item in items {
            buffer.cursor = Some(item.id.clone());
            buffer.items.push(item);
        }
        drop(buffer);
        self.appended.notify_waiters();
    }
}

type Waiter = oneshot::Sender<Result<Arc<NodeFeed>, SubscribeError>>;
type SubscriptionKey = (BareJid, String);

enum Subscription {
    /// Subscribe request in flight. The feed already buffers pushes so that
    /// items racing the acknowledgement are kept.
    Subscribing {
        feed: Arc<NodeFeed>,
        waiters: Vec<Waiter>,
    },
    Subscribed {
        feed: Arc<NodeFeed>,
    },
}

impl Subscription {
    fn feed(&self) -> &Arc<NodeFeed> {
        match self {
            Subscription::Subscribing { feed, .. } | Subscription::Subscribed { feed } => feed,
        }
    }
}

/// The subscriptions of one session.
pub struct SubscriptionTable {
    subscriber: BareJid,
    correlator: Arc<QueryCorrelator>,
    presence: Arc<PresenceTracker>,
    entries: Mutex<HashMap<SubscriptionKey, Subscription>>,
}

impl SubscriptionTable {
    pub fn new(
        subscriber: BareJid,
        correlator: Arc<QueryCorrelator>,
        presence: Arc<PresenceTracker>,
    ) -> Self {
        Self {
            subscriber,
            correlator,
            presence,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<SubscriptionKey, Subscription>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of subscriptions in either state.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_subscribed(&self, server: &BareJid, node: &str) -> bool {
        matches!(
            self.entries().get(&(server.clone(), node.to_string())),
            Some(Subscription::Subscribed { .. })
        )
    }

    /// Subscribe to `node` on `server`, or join the subscription already
    /// established or in progress.
    ///
    /// The subscribe exchange runs on its own task, so it completes even if
    /// the caller goes away.
    #[instrument(skip(self, server), fields(server = %server))]
    pub async fn subscribe(
        self: &Arc<Self>,
        server: &BareJid,
        node: &str,
    ) -> Result<Arc<NodeFeed>, SubscribeError> {
        let key = (server.clone(), node.to_string());
        let (waiter, outcome) = oneshot::channel();

        let start = {
            let mut entries = self.entries();
            match entries.get_mut(&key) {
                Some(Subscription::Subscribed { feed }) => {
                    debug!("Already subscribed");
                    return Ok(Arc::clone(feed));
                }
                Some(Subscription::Subscribing { waiters, .. }) => {
                    debug!(queued = waiters.len() + 1, "Subscription in progress, queueing");
                    waiters.push(waiter);
                    false
                }
                None => {
                    entries.insert(
                        key.clone(),
                        Subscription::Subscribing {
                            feed: Arc::new(NodeFeed::new(server.clone(), node)),
                            waiters: vec![waiter],
                        },
                    );
                    true
                }
            }
        };

        if start {
            let table = Arc::clone(self);
            tokio::spawn(
                async move { table.establish(key).await }.instrument(tracing::Span::current()),
            );
        }

        outcome.await.unwrap_or(Err(SubscribeError::Closed))
    }

    async fn establish(&self, key: SubscriptionKey) {
        let (server, node) = &key;
        self.presence.acquire(server);

        let request = stanza::subscribe_request(node, &self.subscriber);
        let reply = self
            .correlator
            .send_query(request, Some(&Jid::from(server.clone())))
            .await;

        let outcome = if reply.is_error() {
            warn!(condition = ?reply.error_condition(), "Subscribe rejected");
            self.presence.release(server);
            Err(SubscribeError::Rejected(reply))
        } else {
            info!("Subscribed");
            Ok(())
        };
        self.complete(&key, outcome);
    }

    fn complete(&self, key: &SubscriptionKey, outcome: Result<(), SubscribeError>) {
        let mut entries = self.entries();
        let Some(Subscription::Subscribing { feed, waiters }) = entries.remove(key) else {
            // Torn down while the request was in flight.
            return;
        };

        match outcome {
            Ok(()) => {
                entries.insert(
                    key.clone(),
                    Subscription::Subscribed {
                        feed: Arc::clone(&feed),
                    },
                );
                for waiter in waiters {
                    let _ = waiter.send(Ok(Arc::clone(&feed)));
                }
            }
            Err(error) => {
                for waiter in waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
            }
        }
    }

    /// Append pushed items to the matching feed. Returns `false` when the
    /// message does not belong to any subscription.
    pub fn deliver(&self, from: &BareJid, event: EventItems) -> bool {
        let feed = {
            let entries = self.entries();
            match entries.get(&(from.clone(), event.node.clone())) {
                Some(subscription) => Arc::clone(subscription.feed()),
                None => return false,
            }
        };

        let arrived = chrono::Utc::now().timestamp_millis();
        let count = event.items.len();
        feed.append(event.items.into_iter().map(|item| FeedItem {
            id: item
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
            published: item
                .payload
                .as_ref()
                .and_then(stanza::item_timestamp)
                .unwrap_or(arrived),
            payload: item.payload,
        }));
        debug!(node = %event.node, count, "Buffered pushed items");
        true
    }

    /// Drop every subscription; waiters still queued get
    /// [`SubscribeError::Closed`].
    pub fn close(&self) {
        let drained: Vec<Subscription> = self.entries().drain().map(|(_, s)| s).collect();
        for subscription in drained {
            if let Subscription::Subscribing { waiters, .. } = subscription {
                for waiter in waiters {
                    let _ = waiter.send(Err(SubscribeError::Closed));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StanzaErrorCondition;
    use tokio::sync::mpsc;

    struct Harness {
        table: Arc<SubscriptionTable>,
        correlator: Arc<QueryCorrelator>,
        presence: Arc<PresenceTracker>,
        outbound: mpsc::UnboundedReceiver<Element>,
    }

    fn harness() -> Harness {
        let (tx, outbound) = mpsc::unbounded_channel();
        let own = Jid::new("alice@example.org/gw").unwrap();
        let correlator = Arc::new(QueryCorrelator::new(
            own,
            tx.clone(),
            Duration::from_secs(60),
        ));
        let presence = Arc::new(PresenceTracker::new(tx));
        let table = Arc::new(SubscriptionTable::new(
            BareJid::new("alice@example.org").unwrap(),
            Arc::clone(&correlator),
            Arc::clone(&presence),
        ));
        Harness {
            table,
            correlator,
            presence,
            outbound,
        }
    }

    fn server() -> BareJid {
        BareJid::new("channels.example.org").unwrap()
    }

    fn reply(request: &Element, kind: &str) -> Element {
        let mut builder = Element::builder("iq", stanza::NS_CLIENT)
            .attr("type", kind)
            .attr("id", request.attr("id").unwrap())
            .attr("from", "channels.example.org");
        if kind == "error" {
            builder = builder.append(
                Element::builder("error", stanza::NS_CLIENT)
                    .attr("type", "auth")
                    .append(Element::builder("forbidden", stanza::NS_STANZAS).build())
                    .build(),
            );
        }
        builder.build()
    }

    fn item(id: &str, published: &str) -> stanza::EventItem {
        let entry = Element::builder("entry", stanza::NS_ATOM)
            .append(
                Element::builder("published", stanza::NS_ATOM)
                    .append(published)
                    .build(),
            )
            .build();
        stanza::EventItem {
            id: Some(id.to_string()),
            payload: Some(entry),
        }
    }

    #[tokio::test]
    async fn concurrent_subscribers_share_one_request_and_one_feed() {
        let mut h = harness();
        let node = "/user/bob@example.org/posts";

        let first = tokio::spawn({
            let table = Arc::clone(&h.table);
            async move { table.subscribe(&server(), node).await }
        });
        let presence = h.outbound.recv().await.unwrap();
        assert_eq!(presence.name(), "presence");
        let request = h.outbound.recv().await.unwrap();
        assert_eq!(request.attr("type"), Some("set"));

        let second = tokio::spawn({
            let table = Arc::clone(&h.table);
            async move { table.subscribe(&server(), node).await }
        });
        tokio::task::yield_now().await;
        assert!(!h.table.is_subscribed(&server(), node));

        assert!(h.correlator.dispatch(&reply(&request, "result")));
        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(h.table.is_subscribed(&server(), node));

        // A third caller is answered without network traffic.
        let third = h.table.subscribe(&server(), node).await.unwrap();
        assert!(Arc::ptr_eq(&first, &third));
        assert!(h.outbound.try_recv().is_err());
        assert_eq!(h.presence.server_count(&server()), 1);
    }

    #[tokio::test]
    async fn rejected_subscription_fails_every_waiter_and_releases_presence() {
        let mut h = harness();
        let node = "/user/bob@example.org/posts";

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let table = Arc::clone(&h.table);
                tokio::spawn(async move { table.subscribe(&server(), node).await })
            })
            .collect();

        let _presence = h.outbound.recv().await.unwrap();
        let request = h.outbound.recv().await.unwrap();
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert!(h.correlator.dispatch(&reply(&request, "error")));

        for waiter in waiters {
            let error = waiter.await.unwrap().unwrap_err();
            assert_eq!(error.condition(), Some(StanzaErrorCondition::Forbidden));
        }
        assert!(h.table.is_empty());
        assert_eq!(h.presence.server_count(&server()), 0);

        let unavailable = h.outbound.recv().await.unwrap();
        assert_eq!(unavailable.attr("type"), Some("unavailable"));
    }

    #[tokio::test]
    async fn pushed_items_are_buffered_in_arrival_order() {
        let mut h = harness();
        let node = "/user/bob@example.org/posts";
        let pending = tokio::spawn({
            let table = Arc::clone(&h.table);
            async move { table.subscribe(&server(), node).await }
        });
        let _presence = h.outbound.recv().await.unwrap();
        let request = h.outbound.recv().await.unwrap();
        h.correlator.dispatch(&reply(&request, "result"));
        let feed = pending.await.unwrap().unwrap();

        let delivered = h.table.deliver(
            &server(),
            EventItems {
                node: node.to_string(),
                items: vec![
                    item("b", "2024-03-01T12:00:00Z"),
                    item("a", "2024-01-01T00:00:00Z"),
                ],
            },
        );
        assert!(delivered);

        let ids: Vec<String> = feed.items_after(None).into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(feed.cursor().as_deref(), Some("a"));
        assert_eq!(feed.items_after(Some("b")).len(), 1);
        assert!(feed.items_after(Some("a")).is_empty());
        assert_eq!(feed.items_after(None)[0].published, 1_709_294_400_000);

        let unknown = EventItems {
            node: "/user/carol@example.org/posts".to_string(),
            items: vec![item("c", "2024-03-01T12:00:00Z")],
        };
        assert!(!h.table.deliver(&server(), unknown));
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_wakes_on_append_and_times_out_empty() {
        let feed = Arc::new(NodeFeed::new(server(), "/user/bob@example.org/posts"));

        let empty = feed
            .wait_for_items_after(None, Duration::from_secs(30))
            .await;
        assert!(empty.is_empty());

        let waiting = tokio::spawn({
            let feed = Arc::clone(&feed);
            async move { feed.wait_for_items_after(None, Duration::from_secs(30)).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        feed.append([FeedItem {
            id: "x".into(),
            published: 0,
            payload: None,
        }]);

        let items = waiting.await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "x");
    }

    #[tokio::test]
    async fn close_fails_in_flight_waiters() {
        let mut h = harness();
        let pending = tokio::spawn({
            let table = Arc::clone(&h.table);
            async move { table.subscribe(&server(), "n").await }
        });
        let _presence = h.outbound.recv().await.unwrap();
        let _request = h.outbound.recv().await.unwrap();

        h.table.close();
        assert!(matches!(
            pending.await.unwrap(),
            Err(SubscribeError::Closed)
        ));
        assert!(h.table.is_empty());
    }
}
