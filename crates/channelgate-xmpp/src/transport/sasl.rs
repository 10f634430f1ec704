//! SASL negotiation and resource binding over a freshly opened stream.
//!
//! Two kinds of login reach this module: account sessions, which carry the
//! user's password from the `Authorization` header, and guest sessions on the
//! anonymous domain, which arrive with an empty username. A server that does
//! not offer a mechanism for the requested kind fails the login as an
//! authentication error, so the HTTP layer answers 401 rather than 502.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use futures::StreamExt;
use minidom::Element;
use sasl::client::mechanisms::{Anonymous, Plain, Scram};
use sasl::client::Mechanism;
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::{ChannelBinding, Credentials};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_xmpp::parsers::{
    bind::{BindQuery, BindResponse},
    iq::{Iq, IqType},
    sasl::{Auth, Challenge, Failure, Mechanism as SaslMechanism, Response, Success},
};
use tokio_xmpp::xmpp_stream::XMPPStream;
use tokio_xmpp::Packet;
use tracing::{debug, warn};

use crate::error::ConnectionError;

const BIND_REQUEST_ID: &str = "resource-bind";

/// A SASL mechanism the gateway knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Login {
    ScramSha256,
    ScramSha1,
    Plain,
    Anonymous,
}

impl Login {
    /// Candidates for account logins, strongest first.
    const WITH_PASSWORD: &'static [Login] =
        &[Login::ScramSha256, Login::ScramSha1, Login::Plain];

    /// Guest sessions on the anonymous domain.
    const GUEST: &'static [Login] = &[Login::Anonymous];

    fn wire_name(self) -> &'static str {
        match self {
            Login::ScramSha256 => "SCRAM-SHA-256",
            Login::ScramSha1 => "SCRAM-SHA-1",
            Login::Plain => "PLAIN",
            Login::Anonymous => "ANONYMOUS",
        }
    }

    /// First candidate the server offers. A guest never falls back to a
    /// password mechanism and an account never falls back to ANONYMOUS.
    pub(crate) fn negotiate(offered: &HashSet<String>, guest: bool) -> Option<Login> {
        let candidates = if guest { Self::GUEST } else { Self::WITH_PASSWORD };
        candidates
            .iter()
            .copied()
            .find(|login| offered.contains(login.wire_name()))
    }

    fn client(
        self,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn Mechanism + Send>, ConnectionError> {
        let credentials = Credentials::default()
            .with_username(username)
            .with_password(password)
            .with_channel_binding(ChannelBinding::Unsupported);

        let client: Result<Box<dyn Mechanism + Send>, String> = match self {
            Login::Anonymous => return Ok(Box::new(Anonymous::new())),
            Login::ScramSha256 => Scram::<Sha256>::from_credentials(credentials)
                .map(|scram| Box::new(scram) as Box<dyn Mechanism + Send>)
                .map_err(|e| format!("{e:?}")),
            Login::ScramSha1 => Scram::<Sha1>::from_credentials(credentials)
                .map(|scram| Box::new(scram) as Box<dyn Mechanism + Send>)
                .map_err(|e| format!("{e:?}")),
            Login::Plain => Plain::from_credentials(credentials)
                .map(|plain| Box::new(plain) as Box<dyn Mechanism + Send>)
                .map_err(|e| format!("{e:?}")),
        };
        client.map_err(|reason| {
            ConnectionError::AuthenticationFailed(format!("cannot start {self}: {reason}"))
        })
    }
}

impl fmt::Display for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// `<failure/>` from the server. The first non-empty text, if any, is kept
/// next to the condition.
pub(crate) fn rejected(failure: &Failure) -> ConnectionError {
    let condition = format!("{:?}", failure.defined_condition);
    let reason = match failure.texts.values().find(|text| !text.is_empty()) {
        Some(text) => format!("{condition}: {text}"),
        None => condition,
    };
    ConnectionError::AuthenticationFailed(reason)
}

fn stream_error(context: &str, error: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::Transport(format!("{context}: {error}"))
}

/// Next stanza on `stream`, skipping non-stanza packets.
async fn next_stanza<S>(stream: &mut XMPPStream<S>, phase: &str) -> Result<Element, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Packet::Stanza(stanza))) => return Ok(stanza),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(stream_error(phase, e)),
            None => return Err(ConnectionError::Transport(format!("stream ended during {phase}"))),
        }
    }
}

async fn restart_and_bind<S>(stream: XMPPStream<S>) -> Result<XMPPStream<S>, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = stream
        .restart()
        .await
        .map_err(|e| stream_error("stream restart", e))?;
    if !stream.stream_features.can_bind() {
        return Ok(stream);
    }

    let resource = stream.jid.resource().map(|resource| resource.to_string());
    stream
        .send_stanza(Iq::from_set(BIND_REQUEST_ID, BindQuery::new(resource)))
        .await
        .map_err(|e| stream_error("bind request", e))?;

    let answer = loop {
        let stanza = next_stanza(&mut stream, "resource binding").await?;
        match Iq::try_from(stanza) {
            Ok(iq) if iq.id == BIND_REQUEST_ID => break iq,
            _ => continue,
        }
    };

    match answer.payload {
        IqType::Result(Some(payload)) => {
            let bound = BindResponse::try_from(payload)
                .map_err(|e| stream_error("bind response", e))?;
            stream.jid = bound.into();
            Ok(stream)
        }
        IqType::Result(None) => Ok(stream),
        _ => Err(ConnectionError::Transport("server refused resource binding".into())),
    }
}

/// Run SASL on `stream`, then restart it and bind a resource.
///
/// An empty `username` requests an anonymous login.
pub(crate) async fn authenticate<S>(
    mut stream: XMPPStream<S>,
    username: &str,
    password: &str,
) -> Result<XMPPStream<S>, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let offered: HashSet<String> = stream
        .stream_features
        .sasl_mechanisms()
        .map_err(|_| ConnectionError::AuthenticationFailed("no SASL mechanisms offered".into()))?
        .collect();

    let guest = username.is_empty();
    let login = Login::negotiate(&offered, guest).ok_or_else(|| {
        let mut names: Vec<&str> = offered.iter().map(String::as_str).collect();
        names.sort_unstable();
        ConnectionError::AuthenticationFailed(format!(
            "no usable SASL mechanism among [{}]",
            names.join(", ")
        ))
    })?;
    debug!(mechanism = %login, guest, "Authenticating");

    let mut mechanism = login.client(username, password)?;
    let auth = Auth {
        mechanism: SaslMechanism::from_str(login.wire_name())
            .map_err(|e| ConnectionError::AuthenticationFailed(format!("{login}: {e}")))?,
        data: mechanism.initial(),
    };
    stream
        .send_stanza(auth)
        .await
        .map_err(|e| stream_error("SASL auth", e))?;

    loop {
        let stanza = next_stanza(&mut stream, "SASL negotiation").await?;
        if let Ok(challenge) = Challenge::try_from(stanza.clone()) {
            let data = mechanism.response(&challenge.data).map_err(|e| {
                ConnectionError::AuthenticationFailed(format!("{login} challenge: {e:?}"))
            })?;
            stream
                .send_stanza(Response { data })
                .await
                .map_err(|e| stream_error("SASL response", e))?;
        } else if let Ok(success) = Success::try_from(stanza.clone()) {
            mechanism.success(&success.data).map_err(|e| {
                warn!(error = ?e, "Server signature did not verify");
                ConnectionError::AuthenticationFailed(format!("{login} server proof: {e:?}"))
            })?;
            break;
        } else if let Ok(failure) = Failure::try_from(stanza) {
            debug!(condition = ?failure.defined_condition, "SASL rejected");
            return Err(rejected(&failure));
        }
    }

    restart_and_bind(stream).await
}
