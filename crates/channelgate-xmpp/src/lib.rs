//! # channelgate-xmpp
//!
//! Session and protocol-correlation core of the Channelgate HTTP-to-XMPP
//! gateway for federated Pub-Sub channels.
//!
//! ## Architecture
//!
//! - **Expiring Cache**: per-key TTL store with sliding expiration and an
//!   eviction hook. Sessions, pending queries and discovery results are all
//!   instances of it, parameterized by different TTLs.
//! - **Session**: one authenticated XMPP connection driven by a background
//!   task, with its own query correlator, subscription table and presence
//!   reference counts.
//! - **Session Manager**: one session per credential plus a lazily created
//!   shared anonymous session.
//! - **Discovery Resolver**: XEP-0030 lookup of the channel server that is
//!   authoritative for a domain.
//! - **Subscription Engine**: temporary, presence-backed XEP-0060
//!   subscriptions that buffer pushed items for long-polling.
//!
//! The [`Gateway`] context object owns all of the above so that tests can
//! build fully isolated instances.

pub mod cache;
pub mod config;
pub mod discovery;
pub mod gateway;
pub mod manager;
pub mod presence;
pub mod query;
pub mod session;
pub mod stanza;
pub mod subscription;
pub mod transport;

mod error;

pub use cache::ExpiringCache;
pub use config::{GatewayConfig, HttpConfig, TimeoutConfig, XmppConfig};
pub use discovery::DiscoveryResolver;
pub use error::{
    ConnectionError, DiscoveryError, SessionError, StanzaErrorCondition, StanzaErrorType,
    SubscribeError,
};
pub use gateway::Gateway;
pub use manager::{Credential, ProvidedSession, SessionManager, ANONYMOUS_SESSION_KEY};
pub use presence::PresenceTracker;
pub use query::QueryCorrelator;
pub use session::Session;
pub use stanza::Reply;
pub use subscription::{FeedItem, NodeFeed, SubscriptionTable};
pub use transport::{ConnectOptions, Connector, TokioXmppConnector, XmppTransport};
