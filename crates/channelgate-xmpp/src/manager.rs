//! Session lookup and creation.
//!
//! User sessions live in an [`ExpiringCache`] keyed by a random session key
//! and are closed by its eviction hook once idle. A second index maps each
//! credential to the key of its live session so that one credential never
//! holds two connections. The anonymous session sits outside the cache and
//! is only replaced if its connection drops.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use jid::Jid;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::cache::ExpiringCache;
use crate::config::{TimeoutConfig, XmppConfig};
use crate::error::{ConnectionError, SessionError};
use crate::session::Session;
use crate::transport::{ConnectOptions, Connector};

/// Key under which the shared anonymous session is known.
pub const ANONYMOUS_SESSION_KEY: &str = "anonymous";

/// Identity and secret taken from a request.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub jid: String,
    pub secret: String,
}

impl Credential {
    pub fn new(jid: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("jid", &self.jid)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Credential identity as indexed: the qualified JID plus a digest of the
/// secret, so a changed password yields a different session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CredentialId {
    jid: String,
    secret_digest: [u8; 32],
}

impl CredentialId {
    fn new(jid: &str, secret: &str) -> Self {
        Self {
            jid: jid.to_string(),
            secret_digest: Sha256::digest(secret.as_bytes()).into(),
        }
    }
}

#[derive(Clone)]
struct SessionEntry {
    session: Arc<Session>,
    credential: CredentialId,
}

/// A session handed to a request, with the key to echo back to the client.
#[derive(Debug, Clone)]
pub struct ProvidedSession {
    pub session: Arc<Session>,
    pub key: String,
    /// Whether a new connection was opened for this request.
    pub created: bool,
}

impl ProvidedSession {
    pub fn is_anonymous(&self) -> bool {
        self.key == ANONYMOUS_SESSION_KEY
    }
}

pub struct SessionManager<C: Connector> {
    connector: Arc<C>,
    xmpp: XmppConfig,
    timeouts: TimeoutConfig,
    sessions: ExpiringCache<String, SessionEntry>,
    by_credential: Arc<DashMap<CredentialId, String>>,
    connecting: DashMap<CredentialId, Arc<Mutex<()>>>,
    anonymous: Mutex<Option<Arc<Session>>>,
}

impl<C: Connector> SessionManager<C> {
    pub fn new(connector: Arc<C>, xmpp: XmppConfig, timeouts: TimeoutConfig) -> Self {
        let by_credential: Arc<DashMap<CredentialId, String>> = Arc::new(DashMap::new());
        let index = Arc::clone(&by_credential);
        let sessions = ExpiringCache::with_expiry_hook(
            timeouts.session_idle(),
            move |key: String, entry: SessionEntry| {
                info!(jid = %entry.session.jid(), "Session idle, expiring");
                index.remove_if(&entry.credential, |_, indexed| *indexed == key);
                entry.session.close();
            },
        );

        Self {
            connector,
            xmpp,
            timeouts,
            sessions,
            by_credential,
            connecting: DashMap::new(),
            anonymous: Mutex::new(None),
        }
    }

    /// Number of live user sessions, not counting the anonymous one.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Resolve the session for a request.
    ///
    /// A live `key` wins and has its idle timer reset. Otherwise a credential
    /// yields its existing session or a newly authenticated one. A key with
    /// no live session and no credential is [`SessionError::Expired`].
    /// Without either, the shared anonymous session is returned.
    #[instrument(skip_all, fields(has_key = key.is_some(), has_credential = credential.is_some()))]
    pub async fn provide(
        &self,
        key: Option<&str>,
        credential: Option<&Credential>,
    ) -> Result<ProvidedSession, SessionError> {
        if let Some(key) = key {
            if let Some(session) = self.lookup(key) {
                debug!("Reusing session by key");
                return Ok(ProvidedSession {
                    session,
                    key: key.to_string(),
                    created: false,
                });
            }
        }

        match (credential, key) {
            (Some(credential), _) => self.for_credential(credential).await,
            (None, Some(key)) if key != ANONYMOUS_SESSION_KEY => {
                debug!("Session key unknown or expired");
                Err(SessionError::Expired)
            }
            (None, _) => self.anonymous().await,
        }
    }

    fn lookup(&self, key: &str) -> Option<Arc<Session>> {
        let entry = self.sessions.get(key)?;
        if entry.session.is_closed() {
            self.sessions.remove(key);
            self.by_credential
                .remove_if(&entry.credential, |_, indexed| indexed == key);
            return None;
        }
        Some(entry.session)
    }

    async fn for_credential(&self, credential: &Credential) -> Result<ProvidedSession, SessionError> {
        let jid = self.xmpp.qualify(&credential.jid);
        let id = CredentialId::new(&jid, &credential.secret);

        let lock = Arc::clone(self.connecting.entry(id.clone()).or_default().value());
        let result = {
            let _guard = lock.lock().await;
            self.reuse_or_connect(&id, &jid, &credential.secret).await
        };
        drop(lock);
        self.connecting
            .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn reuse_or_connect(
        &self,
        id: &CredentialId,
        jid: &str,
        secret: &str,
    ) -> Result<ProvidedSession, SessionError> {
        let existing = self.by_credential.get(id).map(|key| key.value().clone());
        if let Some(key) = existing {
            if let Some(session) = self.lookup(&key) {
                debug!("Reusing session for credential");
                return Ok(ProvidedSession {
                    session,
                    key,
                    created: false,
                });
            }
        }

        let jid = Jid::new(jid).map_err(|e| {
            SessionError::AuthenticationFailed(format!("invalid JID '{jid}': {e}"))
        })?;
        let options = self.connect_options(jid, secret.to_string());

        let transport = self.connect(&options).await?;
        let key = self.sessions.generate_key();
        let session = Session::start(key.clone(), transport, self.timeouts.query());

        self.sessions.put(
            key.clone(),
            SessionEntry {
                session: Arc::clone(&session),
                credential: id.clone(),
            },
        );
        self.by_credential.insert(id.clone(), key.clone());
        info!(jid = %session.jid(), "User session created");

        Ok(ProvidedSession {
            session,
            key,
            created: true,
        })
    }

    async fn anonymous(&self) -> Result<ProvidedSession, SessionError> {
        let mut slot = self.anonymous.lock().await;
        if let Some(session) = slot.as_ref().filter(|session| !session.is_closed()) {
            return Ok(ProvidedSession {
                session: Arc::clone(session),
                key: ANONYMOUS_SESSION_KEY.to_string(),
                created: false,
            });
        }

        let domain = Jid::new(&self.xmpp.anonymous_domain).map_err(|e| {
            SessionError::Connection(ConnectionError::Transport(format!(
                "invalid anonymous domain '{}': {e}",
                self.xmpp.anonymous_domain
            )))
        })?;
        let options = self.connect_options(domain, String::new());

        let transport = self.connect(&options).await?;
        let session = Session::start(
            ANONYMOUS_SESSION_KEY.to_string(),
            transport,
            self.timeouts.query(),
        );
        *slot = Some(Arc::clone(&session));
        info!(jid = %session.jid(), "Anonymous session created");

        Ok(ProvidedSession {
            session,
            key: ANONYMOUS_SESSION_KEY.to_string(),
            created: true,
        })
    }

    fn connect_options(&self, jid: Jid, password: String) -> ConnectOptions {
        ConnectOptions {
            jid,
            password,
            host: self.xmpp.host.clone(),
            port: self.xmpp.port,
            timeout: self.xmpp.connect_timeout(),
        }
    }

    async fn connect(&self, options: &ConnectOptions) -> Result<C::Transport, SessionError> {
        self.connector.connect(options).await.map_err(|error| {
            if error.is_auth_failure() {
                info!(jid = %options.jid, %error, "Authentication failed");
            } else {
                warn!(jid = %options.jid, %error, "Connection failed");
            }
            SessionError::from(error)
        })
    }

    /// Close every session, the anonymous one included.
    pub async fn shutdown(&self) {
        for (_, entry) in self.sessions.drain() {
            entry.session.close();
        }
        self.by_credential.clear();
        if let Some(session) = self.anonymous.lock().await.take() {
            session.close();
        }
    }
}
