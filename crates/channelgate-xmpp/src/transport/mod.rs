//! Connection boundary.
//!
//! A [`Connector`] opens and authenticates a connection and hands back an
//! [`XmppTransport`] that moves whole stanzas. The session driver is the only
//! user of a transport, so the trait takes `&mut self` throughout.

use std::future::Future;
use std::time::Duration;

use jid::Jid;
use minidom::Element;

use crate::error::ConnectionError;

mod native;
mod sasl;

pub use native::{TokioXmppConnector, TokioXmppTransport};

/// Everything needed to open one client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Account JID, or a bare domain JID for anonymous login
    pub jid: Jid,
    pub password: String,
    /// Explicit server host; SRV lookup on the JID's domain when unset
    pub host: Option<String>,
    pub port: u16,
    /// Upper bound on connect + authenticate + bind
    pub timeout: Duration,
}

impl ConnectOptions {
    /// Anonymous logins are requested by a JID without a local part.
    pub fn is_anonymous(&self) -> bool {
        self.jid.node().is_none()
    }
}

/// An established, authenticated and bound client stream.
pub trait XmppTransport: Send + 'static {
    /// Full JID assigned by the server at resource binding.
    fn bound_jid(&self) -> &Jid;

    fn send(&mut self, stanza: Element) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    /// Next inbound stanza. `None` once the stream has ended.
    ///
    /// Must be cancel safe: the session driver races it against outbound
    /// traffic.
    fn recv(&mut self) -> impl Future<Output = Option<Result<Element, ConnectionError>>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

/// Opens connections.
pub trait Connector: Send + Sync + 'static {
    type Transport: XmppTransport;

    /// Connect and authenticate. Bad credentials must surface as
    /// [`ConnectionError::AuthenticationFailed`].
    fn connect(
        &self,
        options: &ConnectOptions,
    ) -> impl Future<Output = Result<Self::Transport, ConnectionError>> + Send;
}
