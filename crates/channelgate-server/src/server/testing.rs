//! In-memory XMPP server for router tests.
//!
//! `example.org` lists `channels.example.org`, which answers as a channel
//! server. Subscribing to any node succeeds and is followed by one pushed
//! Atom entry, except nodes of `private@example.org`, which are forbidden.
//! Any password but `wrong` is accepted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use channelgate_xmpp::stanza::{
    NS_ATOM, NS_CLIENT, NS_DISCO_INFO, NS_DISCO_ITEMS, NS_PUBSUB, NS_PUBSUB_EVENT, NS_STANZAS,
};
use channelgate_xmpp::{
    ConnectOptions, ConnectionError, Connector, Gateway, GatewayConfig, XmppConfig, XmppTransport,
};
use jid::Jid;
use minidom::Element;
use tokio::sync::mpsc;

pub fn basic_auth(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

/// A gateway backed by [`ScriptedConnector`], plus its connect counter.
pub fn test_gateway() -> (Arc<Gateway<ScriptedConnector>>, Arc<AtomicUsize>) {
    let config = GatewayConfig {
        xmpp: XmppConfig {
            domain: "example.org".into(),
            anonymous_domain: "anon.example.org".into(),
            ..Default::default()
        },
        ..Default::default()
    };
    let attempts = Arc::new(AtomicUsize::new(0));
    let connector = ScriptedConnector {
        attempts: Arc::clone(&attempts),
    };
    (Arc::new(Gateway::new(config, connector)), attempts)
}

pub struct ScriptedConnector {
    attempts: Arc<AtomicUsize>,
}

impl Connector for ScriptedConnector {
    type Transport = ScriptedTransport;

    async fn connect(&self, options: &ConnectOptions) -> Result<ScriptedTransport, ConnectionError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if options.password == "wrong" {
            return Err(ConnectionError::AuthenticationFailed("not-authorized".into()));
        }
        let jid = if options.is_anonymous() {
            format!("guest{attempt}@{}/web", options.jid)
        } else {
            format!("{}/web", options.jid.to_bare())
        };
        let jid = Jid::new(&jid).map_err(|e| ConnectionError::Transport(e.to_string()))?;

        let (pushed, inbound) = mpsc::unbounded_channel();
        Ok(ScriptedTransport {
            jid,
            inbound,
            pushed,
        })
    }
}

pub struct ScriptedTransport {
    jid: Jid,
    inbound: mpsc::UnboundedReceiver<Element>,
    pushed: mpsc::UnboundedSender<Element>,
}

impl XmppTransport for ScriptedTransport {
    fn bound_jid(&self) -> &Jid {
        &self.jid
    }

    async fn send(&mut self, stanza: Element) -> Result<(), ConnectionError> {
        for scripted in answer(&stanza) {
            let _ = self.pushed.send(scripted);
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Element, ConnectionError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }
}

fn answer(stanza: &Element) -> Vec<Element> {
    if stanza.name() != "iq" {
        return Vec::new();
    }
    let to = stanza.attr("to").unwrap_or_default();

    if stanza.get_child("query", NS_DISCO_INFO).is_some() {
        return vec![match to {
            "channels.example.org" => reply(stanza, Some(identity("pubsub", "channels"))),
            "example.org" => reply(stanza, Some(identity("server", "im"))),
            _ => error(stanza, "item-not-found"),
        }];
    }
    if stanza.get_child("query", NS_DISCO_ITEMS).is_some() {
        let mut query = Element::builder("query", NS_DISCO_ITEMS);
        if to == "example.org" {
            query = query.append(
                Element::builder("item", NS_DISCO_ITEMS)
                    .attr("jid", "channels.example.org")
                    .build(),
            );
        }
        return vec![reply(stanza, Some(query.build()))];
    }

    let node = stanza
        .get_child("pubsub", NS_PUBSUB)
        .and_then(|pubsub| pubsub.get_child("subscribe", NS_PUBSUB))
        .and_then(|subscribe| subscribe.attr("node"));
    match node {
        Some(node) if node.starts_with("/user/private@") => vec![error(stanza, "forbidden")],
        Some(node) => vec![reply(stanza, None), event(to, node)],
        None => vec![error(stanza, "feature-not-implemented")],
    }
}

fn reply(request: &Element, payload: Option<Element>) -> Element {
    let mut builder = Element::builder("iq", NS_CLIENT)
        .attr("type", "result")
        .attr("id", request.attr("id").unwrap_or_default())
        .attr("from", request.attr("to").unwrap_or_default());
    if let Some(payload) = payload {
        builder = builder.append(payload);
    }
    builder.build()
}

fn error(request: &Element, condition: &str) -> Element {
    Element::builder("iq", NS_CLIENT)
        .attr("type", "error")
        .attr("id", request.attr("id").unwrap_or_default())
        .attr("from", request.attr("to").unwrap_or_default())
        .append(
            Element::builder("error", NS_CLIENT)
                .attr("type", "cancel")
                .append(Element::builder(condition, NS_STANZAS).build())
                .build(),
        )
        .build()
}

fn identity(category: &str, kind: &str) -> Element {
    Element::builder("query", NS_DISCO_INFO)
        .append(
            Element::builder("identity", NS_DISCO_INFO)
                .attr("category", category)
                .attr("type", kind)
                .build(),
        )
        .build()
}

fn event(from: &str, node: &str) -> Element {
    let entry = Element::builder("entry", NS_ATOM)
        .append(Element::builder("title", NS_ATOM).append("hello").build())
        .append(
            Element::builder("published", NS_ATOM)
                .append("2024-01-01T12:00:00Z")
                .build(),
        )
        .build();
    Element::builder("message", NS_CLIENT)
        .attr("from", from)
        .append(
            Element::builder("event", NS_PUBSUB_EVENT)
                .append(
                    Element::builder("items", NS_PUBSUB_EVENT)
                        .attr("node", node)
                        .append(
                            Element::builder("item", NS_PUBSUB_EVENT)
                                .attr("id", "entry-1")
                                .append(entry)
                                .build(),
                        )
                        .build(),
                )
                .build(),
        )
        .build()
}
