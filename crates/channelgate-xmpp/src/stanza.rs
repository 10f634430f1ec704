//! Stanza building and inspection.
//!
//! Builders for the handful of IQ and presence stanzas the gateway sends
//! itself (service discovery, temporary subscriptions, presence) and
//! accessors for the replies and push notifications it receives.

use chrono::DateTime;
use jid::{BareJid, Jid};
use minidom::Element;
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::error::{StanzaErrorCondition, StanzaErrorType};

/// Client stanza namespace.
pub const NS_CLIENT: &str = "jabber:client";

/// Stanza error condition namespace (RFC 6120).
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Service Discovery info namespace (XEP-0030).
pub const NS_DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";

/// Service Discovery items namespace (XEP-0030).
pub const NS_DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";

/// Main PubSub namespace (XEP-0060).
pub const NS_PUBSUB: &str = "http://jabber.org/protocol/pubsub";

/// PubSub event namespace for notifications.
pub const NS_PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";

/// Subscribe options form type.
pub const NS_SUBSCRIBE_OPTIONS: &str = "http://jabber.org/protocol/pubsub#subscribe_options";

/// Data forms namespace (XEP-0004).
pub const NS_DATA_FORMS: &str = "jabber:x:data";

/// Atom syndication namespace, used by channel item payloads.
pub const NS_ATOM: &str = "http://www.w3.org/2005/Atom";

/// XMPP ping namespace (XEP-0199).
pub const NS_PING: &str = "urn:xmpp:ping";

/// Disco identity advertised by channel servers.
pub const CHANNELS_IDENTITY: (&str, &str) = ("pubsub", "channels");

/// Where a [`Reply`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyOrigin {
    Remote,
    Timeout,
    Closed,
}

/// The outcome of a query: the stanza that answered it, or a locally
/// synthesized `service-unavailable` error when nothing did.
#[derive(Debug, Clone)]
pub struct Reply {
    stanza: Element,
    origin: ReplyOrigin,
}

impl Reply {
    /// Wrap a stanza received from the network.
    pub fn new(stanza: Element) -> Self {
        Self {
            stanza,
            origin: ReplyOrigin::Remote,
        }
    }

    /// The reply delivered when a query's timeout elapses.
    pub fn timed_out(id: &str, peer: Option<&Jid>) -> Self {
        Self {
            stanza: service_unavailable(id, peer, "query timed out"),
            origin: ReplyOrigin::Timeout,
        }
    }

    /// The reply delivered when the connection ended before an answer arrived.
    pub fn connection_closed(id: &str, peer: Option<&Jid>) -> Self {
        Self {
            stanza: service_unavailable(id, peer, "connection closed"),
            origin: ReplyOrigin::Closed,
        }
    }

    pub fn is_error(&self) -> bool {
        self.stanza.attr("type") == Some("error")
    }

    /// Whether this reply was produced by the query timeout.
    pub fn is_timeout(&self) -> bool {
        self.origin == ReplyOrigin::Timeout
    }

    /// Whether the remote end never answered (timeout or closed connection).
    pub fn is_synthesized(&self) -> bool {
        self.origin != ReplyOrigin::Remote
    }

    pub fn id(&self) -> Option<&str> {
        self.stanza.attr("id")
    }

    pub fn from(&self) -> Option<&str> {
        self.stanza.attr("from")
    }

    fn error_element(&self) -> Option<&Element> {
        if !self.is_error() {
            return None;
        }
        self.stanza.get_child("error", NS_CLIENT)
    }

    /// Defined condition of an error reply.
    pub fn error_condition(&self) -> Option<StanzaErrorCondition> {
        self.error_element()?
            .children()
            .filter(|child| child.ns() == NS_STANZAS)
            .find_map(|child| StanzaErrorCondition::from_name(child.name()))
    }

    pub fn error_type(&self) -> Option<StanzaErrorType> {
        StanzaErrorType::from_name(self.error_element()?.attr("type")?)
    }

    /// First child that is not an `<error/>`.
    pub fn payload(&self) -> Option<&Element> {
        self.stanza
            .children()
            .find(|child| !(child.name() == "error" && child.ns() == NS_CLIENT))
    }

    pub fn stanza(&self) -> &Element {
        &self.stanza
    }

    pub fn into_stanza(self) -> Element {
        self.stanza
    }
}

fn service_unavailable(id: &str, peer: Option<&Jid>, text: &str) -> Element {
    let condition = StanzaErrorCondition::ServiceUnavailable;
    let error = Element::builder("error", NS_CLIENT)
        .attr("type", StanzaErrorType::Cancel.as_str())
        .append(Element::builder(condition.as_str(), NS_STANZAS).build())
        .append(
            Element::builder("text", NS_STANZAS)
                .append(text)
                .build(),
        )
        .build();

    let mut builder = Element::builder("iq", NS_CLIENT)
        .attr("type", "error")
        .attr("id", id);
    if let Some(peer) = peer {
        builder = builder.attr("from", peer.to_string());
    }
    builder.append(error).build()
}

/// Whether the stanza is an IQ answer (`result` or `error`).
pub fn is_iq_reply(stanza: &Element) -> bool {
    stanza.name() == "iq" && matches!(stanza.attr("type"), Some("result") | Some("error"))
}

/// Answer for an inbound `get`/`set` IQ. Pings get an empty result, every
/// other request `service-unavailable`. `None` for anything that is not an
/// IQ request.
pub fn answer_request(request: &Element) -> Option<Element> {
    if request.name() != "iq" || !matches!(request.attr("type"), Some("get") | Some("set")) {
        return None;
    }
    let id = request.attr("id").unwrap_or_default();

    if request.get_child("ping", NS_PING).is_some() {
        let mut builder = Element::builder("iq", NS_CLIENT)
            .attr("type", "result")
            .attr("id", id);
        if let Some(from) = request.attr("from") {
            builder = builder.attr("to", from);
        }
        return Some(builder.build());
    }

    let condition = StanzaErrorCondition::ServiceUnavailable;
    let mut builder = Element::builder("iq", NS_CLIENT)
        .attr("type", "error")
        .attr("id", id);
    if let Some(from) = request.attr("from") {
        builder = builder.attr("to", from);
    }
    Some(
        builder
            .append(
                Element::builder("error", NS_CLIENT)
                    .attr("type", StanzaErrorType::Cancel.as_str())
                    .append(Element::builder(condition.as_str(), NS_STANZAS).build())
                    .build(),
            )
            .build(),
    )
}

fn iq(kind: &str, payload: Element) -> Element {
    Element::builder("iq", NS_CLIENT)
        .attr("type", kind)
        .append(payload)
        .build()
}

/// `<iq type="get"><query xmlns="disco#info"/></iq>`
pub fn disco_info_query() -> Element {
    iq("get", Element::builder("query", NS_DISCO_INFO).build())
}

/// `<iq type="get"><query xmlns="disco#items"/></iq>`
pub fn disco_items_query() -> Element {
    iq("get", Element::builder("query", NS_DISCO_ITEMS).build())
}

/// A temporary subscription that lasts as long as `subscriber` stays
/// available to the publisher.
pub fn subscribe_request(node: &str, subscriber: &BareJid) -> Element {
    let subscriber = subscriber.to_string();

    let form = Element::builder("x", NS_DATA_FORMS)
        .attr("type", "submit")
        .append(form_field("FORM_TYPE", Some("hidden"), NS_SUBSCRIBE_OPTIONS))
        .append(form_field("pubsub#expire", None, "presence"))
        .build();

    let pubsub = Element::builder("pubsub", NS_PUBSUB)
        .append(
            Element::builder("subscribe", NS_PUBSUB)
                .attr("node", node)
                .attr("jid", subscriber.as_str())
                .build(),
        )
        .append(
            Element::builder("options", NS_PUBSUB)
                .attr("node", node)
                .attr("jid", subscriber.as_str())
                .append(form)
                .build(),
        )
        .build();

    iq("set", pubsub)
}

fn form_field(var: &str, kind: Option<&str>, value: &str) -> Element {
    let mut builder = Element::builder("field", NS_DATA_FORMS).attr("var", var);
    if let Some(kind) = kind {
        builder = builder.attr("type", kind);
    }
    builder
        .append(Element::builder("value", NS_DATA_FORMS).append(value).build())
        .build()
}

/// Available or unavailable presence, directed when `to` is given.
pub fn presence(to: Option<&BareJid>, available: bool) -> Element {
    let kind = if available {
        PresenceType::None
    } else {
        PresenceType::Unavailable
    };
    let mut presence = Presence::new(kind);
    if let Some(to) = to {
        presence = presence.with_to(Jid::from(to.clone()));
    }
    presence.into()
}

/// Whether a disco#info reply advertises the channel server identity.
pub fn is_channel_server(reply: &Reply) -> bool {
    if reply.is_error() {
        return false;
    }
    let Some(query) = reply.stanza().get_child("query", NS_DISCO_INFO) else {
        return false;
    };
    query
        .children()
        .filter(|child| child.is("identity", NS_DISCO_INFO))
        .any(|identity| {
            identity.attr("category") == Some(CHANNELS_IDENTITY.0)
                && identity.attr("type") == Some(CHANNELS_IDENTITY.1)
        })
}

/// JIDs listed by a disco#items reply, in advertised order. Unparseable
/// entries are skipped.
pub fn disco_item_jids(reply: &Reply) -> Vec<Jid> {
    let Some(query) = reply.stanza().get_child("query", NS_DISCO_ITEMS) else {
        return Vec::new();
    };
    query
        .children()
        .filter(|child| child.is("item", NS_DISCO_ITEMS))
        .filter_map(|item| item.attr("jid"))
        .filter_map(|jid| Jid::new(jid).ok())
        .collect()
}

/// One published item from a push notification.
#[derive(Debug, Clone)]
pub struct EventItem {
    pub id: Option<String>,
    pub payload: Option<Element>,
}

/// The `<items/>` part of a pubsub event message.
#[derive(Debug, Clone)]
pub struct EventItems {
    pub node: String,
    pub items: Vec<EventItem>,
}

/// Extract published items from a pubsub event `<message/>`.
///
/// Retractions and other event kinds yield `None`.
pub fn parse_event_items(message: &Element) -> Option<EventItems> {
    if message.name() != "message" {
        return None;
    }
    let items = message
        .get_child("event", NS_PUBSUB_EVENT)?
        .get_child("items", NS_PUBSUB_EVENT)?;
    let node = items.attr("node")?.to_string();

    let items: Vec<EventItem> = items
        .children()
        .filter(|child| child.is("item", NS_PUBSUB_EVENT))
        .map(|item| EventItem {
            id: item.attr("id").map(String::from),
            payload: item.children().next().cloned(),
        })
        .collect();

    if items.is_empty() {
        return None;
    }
    Some(EventItems { node, items })
}

/// Milliseconds since the epoch taken from an Atom entry's `published`
/// (or, failing that, `updated`) child.
pub fn item_timestamp(payload: &Element) -> Option<i64> {
    ["published", "updated"].iter().find_map(|name| {
        let text = payload.get_child(name, NS_ATOM)?.text();
        DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|time| time.timestamp_millis())
    })
}
