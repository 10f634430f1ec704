//! Error types for the gateway core.

use std::fmt;

use thiserror::Error;

use crate::stanza::Reply;

/// Failures while opening or driving an XMPP connection.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// SASL rejected the credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// DNS, TCP, TLS or stream-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection attempt did not complete in time.
    #[error("connection timeout")]
    Timeout,

    /// The connection has already been ended.
    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ConnectionError::AuthenticationFailed(_))
    }
}

/// Failures surfaced by the session manager to the HTTP layer.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// Bad credentials. Maps to an unauthorized response.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A session key was presented but no live session matches it.
    #[error("session not found or expired")]
    Expired,

    /// Any other connect failure.
    #[error("connection failed: {0}")]
    Connection(ConnectionError),
}

impl SessionError {
    /// Whether the caller should answer with an unauthorized status.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            SessionError::AuthenticationFailed(_) | SessionError::Expired
        )
    }
}

impl From<ConnectionError> for SessionError {
    fn from(error: ConnectionError) -> Self {
        match error {
            ConnectionError::AuthenticationFailed(reason) => {
                SessionError::AuthenticationFailed(reason)
            }
            other => SessionError::Connection(other),
        }
    }
}

/// Channel server discovery failures. Neither variant is cached.
#[derive(Debug, Clone, Error)]
pub enum DiscoveryError {
    #[error("no channel server found for {domain}")]
    NotFound { domain: String },

    #[error("discovery for {domain} failed: {reason}")]
    Transport { domain: String, reason: String },
}

impl DiscoveryError {
    pub fn transport(domain: &str, reason: impl Into<String>) -> Self {
        Self::Transport {
            domain: domain.to_string(),
            reason: reason.into(),
        }
    }
}

/// Outcome delivered to every waiter of a failed subscription.
#[derive(Debug, Clone, Error)]
pub enum SubscribeError {
    /// The publisher answered the subscribe request with an error (or it timed out).
    #[error("subscription rejected: {}", .0.error_condition().map(|c| c.as_str()).unwrap_or("unknown"))]
    Rejected(Reply),

    /// The owning session ended before the transition completed.
    #[error("session closed before the subscription completed")]
    Closed,
}

impl SubscribeError {
    pub fn condition(&self) -> Option<StanzaErrorCondition> {
        match self {
            SubscribeError::Rejected(reply) => reply.error_condition(),
            SubscribeError::Closed => None,
        }
    }
}

/// Defined stanza error conditions (RFC 6120 §8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaErrorCondition {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    Gone,
    InternalServerError,
    ItemNotFound,
    JidMalformed,
    NotAcceptable,
    NotAllowed,
    NotAuthorized,
    PolicyViolation,
    RecipientUnavailable,
    Redirect,
    RegistrationRequired,
    RemoteServerNotFound,
    RemoteServerTimeout,
    ResourceConstraint,
    ServiceUnavailable,
    SubscriptionRequired,
    UndefinedCondition,
    UnexpectedRequest,
}

const CONDITIONS: &[(StanzaErrorCondition, &str)] = &[
    (StanzaErrorCondition::BadRequest, "bad-request"),
    (StanzaErrorCondition::Conflict, "conflict"),
    (StanzaErrorCondition::FeatureNotImplemented, "feature-not-implemented"),
    (StanzaErrorCondition::Forbidden, "forbidden"),
    (StanzaErrorCondition::Gone, "gone"),
    (StanzaErrorCondition::InternalServerError, "internal-server-error"),
    (StanzaErrorCondition::ItemNotFound, "item-not-found"),
    (StanzaErrorCondition::JidMalformed, "jid-malformed"),
    (StanzaErrorCondition::NotAcceptable, "not-acceptable"),
    (StanzaErrorCondition::NotAllowed, "not-allowed"),
    (StanzaErrorCondition::NotAuthorized, "not-authorized"),
    (StanzaErrorCondition::PolicyViolation, "policy-violation"),
    (StanzaErrorCondition::RecipientUnavailable, "recipient-unavailable"),
    (StanzaErrorCondition::Redirect, "redirect"),
    (StanzaErrorCondition::RegistrationRequired, "registration-required"),
    (StanzaErrorCondition::RemoteServerNotFound, "remote-server-not-found"),
    (StanzaErrorCondition::RemoteServerTimeout, "remote-server-timeout"),
    (StanzaErrorCondition::ResourceConstraint, "resource-constraint"),
    (StanzaErrorCondition::ServiceUnavailable, "service-unavailable"),
    (StanzaErrorCondition::SubscriptionRequired, "subscription-required"),
    (StanzaErrorCondition::UndefinedCondition, "undefined-condition"),
    (StanzaErrorCondition::UnexpectedRequest, "unexpected-request"),
];

impl StanzaErrorCondition {
    /// Element name of this condition.
    pub fn as_str(&self) -> &'static str {
        CONDITIONS
            .iter()
            .find(|(condition, _)| condition == self)
            .map(|(_, name)| *name)
            .unwrap_or("undefined-condition")
    }

    /// Look up a condition by its element name.
    pub fn from_name(name: &str) -> Option<Self> {
        CONDITIONS
            .iter()
            .find(|(_, candidate)| *candidate == name)
            .map(|(condition, _)| *condition)
    }
}

impl fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stanza error types (RFC 6120 §8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    Auth,
    Cancel,
    Continue,
    Modify,
    Wait,
}

impl StanzaErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Continue => "continue",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "auth" => Some(Self::Auth),
            "cancel" => Some(Self::Cancel),
            "continue" => Some(Self::Continue),
            "modify" => Some(Self::Modify),
            "wait" => Some(Self::Wait),
            _ => None,
        }
    }
}

impl fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
