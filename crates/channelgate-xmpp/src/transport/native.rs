//! STARTTLS client connections via tokio-xmpp.

use futures::{SinkExt, StreamExt};
use jid::Jid;
use minidom::Element;
use tokio::time::timeout;
use tokio_xmpp::connect::ServerConnector;
use tokio_xmpp::parsers::ns;
use tokio_xmpp::starttls::ServerConfig;
use tokio_xmpp::xmpp_stream::XMPPStream;
use tokio_xmpp::Packet;
use tracing::{debug, info, instrument};

use super::{sasl, ConnectOptions, Connector, XmppTransport};
use crate::error::ConnectionError;

type TlsStream = XMPPStream<<ServerConfig as ServerConnector>::Stream>;

/// Connects over TCP with STARTTLS and authenticates with SASL.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioXmppConnector;

impl TokioXmppConnector {
    pub fn new() -> Self {
        Self
    }
}

fn server_config(options: &ConnectOptions) -> ServerConfig {
    match &options.host {
        Some(host) => ServerConfig::Manual {
            host: host.clone(),
            port: options.port,
        },
        None => ServerConfig::UseSrv,
    }
}

async fn open(options: &ConnectOptions) -> Result<TlsStream, ConnectionError> {
    let stream = server_config(options)
        .connect(&options.jid, ns::JABBER_CLIENT)
        .await
        .map_err(|e| ConnectionError::Transport(e.to_string()))?;

    let username = options
        .jid
        .node()
        .map(|node| node.to_string())
        .unwrap_or_default();
    sasl::authenticate(stream, &username, &options.password).await
}

impl Connector for TokioXmppConnector {
    type Transport = TokioXmppTransport;

    #[instrument(skip(self, options), fields(jid = %options.jid))]
    async fn connect(&self, options: &ConnectOptions) -> Result<TokioXmppTransport, ConnectionError> {
        let stream = timeout(options.timeout, open(options))
            .await
            .map_err(|_| ConnectionError::Timeout)??;

        let bound_jid = stream.jid.clone();
        info!(%bound_jid, "XMPP stream established");
        Ok(TokioXmppTransport { stream, bound_jid })
    }
}

/// An authenticated STARTTLS client stream.
pub struct TokioXmppTransport {
    stream: TlsStream,
    bound_jid: Jid,
}

impl XmppTransport for TokioXmppTransport {
    fn bound_jid(&self) -> &Jid {
        &self.bound_jid
    }

    async fn send(&mut self, stanza: Element) -> Result<(), ConnectionError> {
        self.stream
            .send_stanza(stanza)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Element, ConnectionError>> {
        loop {
            match self.stream.next().await? {
                Ok(Packet::Stanza(stanza)) => return Some(Ok(stanza)),
                Ok(Packet::StreamEnd) => {
                    debug!("Peer ended the stream");
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(ConnectionError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.stream
            .send(Packet::StreamEnd)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        SinkExt::close(&mut self.stream)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }
}
