//! Shared test harness: an in-memory connector whose far end is driven by
//! the test acting as the XMPP server.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use channelgate_xmpp::stanza::{NS_CLIENT, NS_DISCO_INFO, NS_DISCO_ITEMS, NS_STANZAS};
use channelgate_xmpp::{
    ConnectOptions, ConnectionError, Connector, GatewayConfig, TimeoutConfig, XmppConfig,
    XmppTransport,
};
use jid::Jid;
use minidom::Element;
use tokio::sync::mpsc;

/// Install a test subscriber once so `RUST_LOG` works under `cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn config(session_idle_secs: u64) -> GatewayConfig {
    GatewayConfig {
        xmpp: XmppConfig {
            domain: "example.org".into(),
            anonymous_domain: "anon.example.org".into(),
            ..Default::default()
        },
        timeouts: TimeoutConfig {
            session_idle_secs,
            query_secs: 60,
            discovery_cache_secs: 3600,
            long_poll_secs: 30,
        },
        ..Default::default()
    }
}

/// The server side of one accepted connection.
pub struct RemoteEnd {
    pub jid: Jid,
    from_client: mpsc::UnboundedReceiver<Element>,
    to_client: mpsc::UnboundedSender<Element>,
}

impl RemoteEnd {
    /// Next stanza written by the client; `None` once it hung up.
    pub async fn next(&mut self) -> Option<Element> {
        self.from_client.recv().await
    }

    /// Next stanza with the given element name, skipping others.
    pub async fn next_named(&mut self, name: &str) -> Element {
        loop {
            let stanza = self.next().await.expect("client hung up");
            if stanza.name() == name {
                return stanza;
            }
        }
    }

    pub fn try_next(&mut self) -> Option<Element> {
        self.from_client.try_recv().ok()
    }

    pub fn push(&self, stanza: Element) {
        let _ = self.to_client.send(stanza);
    }

    pub fn reply(&self, request: &Element, payload: Option<Element>) {
        self.push(result_for(request, payload));
    }

    pub fn reply_error(&self, request: &Element, condition: &str) {
        self.push(error_for(request, condition));
    }
}

pub fn result_for(request: &Element, payload: Option<Element>) -> Element {
    let mut builder = Element::builder("iq", NS_CLIENT)
        .attr("type", "result")
        .attr("id", request.attr("id").unwrap_or_default());
    if let Some(to) = request.attr("to") {
        builder = builder.attr("from", to);
    }
    if let Some(payload) = payload {
        builder = builder.append(payload);
    }
    builder.build()
}

pub fn error_for(request: &Element, condition: &str) -> Element {
    let mut builder = Element::builder("iq", NS_CLIENT)
        .attr("type", "error")
        .attr("id", request.attr("id").unwrap_or_default());
    if let Some(to) = request.attr("to") {
        builder = builder.attr("from", to);
    }
    builder
        .append(
            Element::builder("error", NS_CLIENT)
                .attr("type", "cancel")
                .append(Element::builder(condition, NS_STANZAS).build())
                .build(),
        )
        .build()
}

pub fn disco_info(identities: &[(&str, &str)]) -> Element {
    identities
        .iter()
        .fold(Element::builder("query", NS_DISCO_INFO), |query, (category, kind)| {
            query.append(
                Element::builder("identity", NS_DISCO_INFO)
                    .attr("category", *category)
                    .attr("type", *kind)
                    .build(),
            )
        })
        .build()
}

pub fn disco_items(jids: &[&str]) -> Element {
    jids.iter()
        .fold(Element::builder("query", NS_DISCO_ITEMS), |query, jid| {
            query.append(
                Element::builder("item", NS_DISCO_ITEMS)
                    .attr("jid", *jid)
                    .build(),
            )
        })
        .build()
}

pub struct MockTransport {
    jid: Jid,
    inbound: mpsc::UnboundedReceiver<Element>,
    outbound: mpsc::UnboundedSender<Element>,
}

impl XmppTransport for MockTransport {
    fn bound_jid(&self) -> &Jid {
        &self.jid
    }

    async fn send(&mut self, stanza: Element) -> Result<(), ConnectionError> {
        self.outbound
            .send(stanza)
            .map_err(|_| ConnectionError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<Element, ConnectionError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }
}

/// Accepts logins for a fixed set of accounts plus anonymous ones.
pub struct MockConnector {
    accounts: HashMap<String, String>,
    delay: Option<Duration>,
    failure: Option<ConnectionError>,
    attempts: Arc<AtomicUsize>,
    accepted: mpsc::UnboundedSender<RemoteEnd>,
}

/// Test-side view of a [`MockConnector`].
pub struct MockServer {
    attempts: Arc<AtomicUsize>,
    accepted: mpsc::UnboundedReceiver<RemoteEnd>,
}

impl MockServer {
    /// Connection attempts seen so far, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The next connection the gateway opened.
    pub async fn accept(&mut self) -> RemoteEnd {
        self.accepted.recv().await.expect("connector dropped")
    }

    pub fn try_accept(&mut self) -> Option<RemoteEnd> {
        self.accepted.try_recv().ok()
    }
}

impl MockConnector {
    pub fn new(accounts: &[(&str, &str)]) -> (Self, MockServer) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector = Self {
            accounts: accounts
                .iter()
                .map(|(jid, password)| (jid.to_string(), password.to_string()))
                .collect(),
            delay: None,
            failure: None,
            attempts: Arc::clone(&attempts),
            accepted: accepted_tx,
        };
        (
            connector,
            MockServer {
                attempts,
                accepted: accepted_rx,
            },
        )
    }

    /// Make every connect take `delay` before completing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make every connect fail with `error`.
    pub fn failing_with(mut self, error: ConnectionError) -> Self {
        self.failure = Some(error);
        self
    }
}

impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&self, options: &ConnectOptions) -> Result<MockTransport, ConnectionError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }

        let jid = if options.is_anonymous() {
            format!("guest{attempt}@{}/anon", options.jid)
        } else {
            let bare = options.jid.to_bare().to_string();
            match self.accounts.get(&bare) {
                Some(password) if *password == options.password => {
                    format!("{bare}/gateway{attempt}")
                }
                _ => return Err(ConnectionError::AuthenticationFailed("not-authorized".into())),
            }
        };
        let jid = Jid::new(&jid).map_err(|e| ConnectionError::Transport(e.to_string()))?;

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let _ = self.accepted.send(RemoteEnd {
            jid: jid.clone(),
            from_client,
            to_client,
        });
        Ok(MockTransport {
            jid,
            inbound,
            outbound,
        })
    }
}

/// How a scripted server answers disco#info for one JID.
#[derive(Debug, Clone, Copy)]
pub enum InfoAnswer {
    Identity(&'static str, &'static str),
    Error,
    Silent,
}

/// Answers disco queries from a fixed script and records every query as
/// `"info <to>"` or `"items <to>"`. Unknown JIDs answer info with
/// `item-not-found` and items with an empty list.
pub fn spawn_disco_responder(
    mut remote: RemoteEnd,
    info: HashMap<&'static str, InfoAnswer>,
    items: HashMap<&'static str, Vec<&'static str>>,
) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&log);
    tokio::spawn(async move {
        while let Some(stanza) = remote.next().await {
            if stanza.name() != "iq" {
                continue;
            }
            let to = stanza.attr("to").unwrap_or_default().to_string();
            if stanza.get_child("query", NS_DISCO_INFO).is_some() {
                record.lock().unwrap().push(format!("info {to}"));
                match info.get(to.as_str()).copied() {
                    Some(InfoAnswer::Identity(category, kind)) => {
                        remote.reply(&stanza, Some(disco_info(&[(category, kind)])))
                    }
                    Some(InfoAnswer::Silent) => {}
                    Some(InfoAnswer::Error) | None => remote.reply_error(&stanza, "item-not-found"),
                }
            } else if stanza.get_child("query", NS_DISCO_ITEMS).is_some() {
                record.lock().unwrap().push(format!("items {to}"));
                let listed = items.get(to.as_str()).cloned().unwrap_or_default();
                remote.reply(&stanza, Some(disco_items(&listed)));
            }
        }
    });
    log
}
