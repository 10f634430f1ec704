//! Gateway configuration.
//!
//! Values come from built-in defaults, an optional TOML file and then
//! `CHANNELGATE__`-prefixed environment variables, in that order of
//! precedence (lowest first). Nested keys use a double underscore:
//!
//! ```bash
//! CHANNELGATE__XMPP__DOMAIN=example.org
//! CHANNELGATE__TIMEOUTS__SESSION_IDLE_SECS=300
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "CHANNELGATE";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub http: HttpConfig,
    pub xmpp: XmppConfig,
    pub timeouts: TimeoutConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Address the HTTP server binds to
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".into(),
        }
    }
}

/// Upstream XMPP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XmppConfig {
    /// Domain appended to identities given without one
    pub domain: String,
    /// Explicit server host. When unset the host is found through SRV records.
    pub host: Option<String>,
    /// Port used together with `host`
    pub port: u16,
    /// Domain the shared anonymous session logs into
    pub anonymous_domain: String,
    /// Upper bound on connect + authenticate
    pub connect_timeout_secs: u64,
}

impl Default for XmppConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".into(),
            host: None,
            port: 5222,
            anonymous_domain: "anon.localhost".into(),
            connect_timeout_secs: 30,
        }
    }
}

impl XmppConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Turn a login name into a JID string, adding the default domain to
    /// bare usernames.
    pub fn qualify(&self, identity: &str) -> String {
        if identity.contains('@') {
            identity.to_string()
        } else {
            format!("{}@{}", identity, self.domain)
        }
    }
}

/// Expiration windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Idle time after which a user session is closed
    pub session_idle_secs: u64,
    /// Time a query waits for its reply
    pub query_secs: u64,
    /// Lifetime of a positive discovery result
    pub discovery_cache_secs: u64,
    /// Default wait of a long-poll request
    pub long_poll_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            session_idle_secs: 600,
            query_secs: 60,
            discovery_cache_secs: 6 * 60 * 60,
            long_poll_secs: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    pub fn query(&self) -> Duration {
        Duration::from_secs(self.query_secs)
    }

    pub fn discovery_cache(&self) -> Duration {
        Duration::from_secs(self.discovery_cache_secs)
    }

    pub fn long_poll(&self) -> Duration {
        Duration::from_secs(self.long_poll_secs)
    }
}

impl GatewayConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!(
            listen = %self.http.listen,
            domain = %self.xmpp.domain,
            host = ?self.xmpp.host,
            port = self.xmpp.port,
            anonymous_domain = %self.xmpp.anonymous_domain,
            "Gateway configuration"
        );
        info!(
            session_idle_secs = self.timeouts.session_idle_secs,
            query_secs = self.timeouts.query_secs,
            discovery_cache_secs = self.timeouts.discovery_cache_secs,
            long_poll_secs = self.timeouts.long_poll_secs,
            "Expiration windows"
        );
    }
}
