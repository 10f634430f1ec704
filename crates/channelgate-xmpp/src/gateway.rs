//! Process-scoped context tying sessions and discovery together.

use std::sync::Arc;

use jid::Jid;
use tracing::info;

use crate::config::GatewayConfig;
use crate::discovery::DiscoveryResolver;
use crate::error::{DiscoveryError, SessionError};
use crate::manager::{Credential, ProvidedSession, SessionManager};
use crate::transport::{Connector, TokioXmppConnector};

/// Owns every cache the gateway uses. Build one per process, or one per
/// test for full isolation.
pub struct Gateway<C: Connector = TokioXmppConnector> {
    config: GatewayConfig,
    sessions: SessionManager<C>,
    discovery: DiscoveryResolver,
}

impl Gateway<TokioXmppConnector> {
    /// Gateway connecting over STARTTLS.
    pub fn with_default_connector(config: GatewayConfig) -> Self {
        Self::new(config, TokioXmppConnector::new())
    }
}

impl<C: Connector> Gateway<C> {
    pub fn new(config: GatewayConfig, connector: C) -> Self {
        let sessions = SessionManager::new(
            Arc::new(connector),
            config.xmpp.clone(),
            config.timeouts.clone(),
        );
        let discovery = DiscoveryResolver::new(config.timeouts.discovery_cache());
        Self {
            config,
            sessions,
            discovery,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager<C> {
        &self.sessions
    }

    pub fn resolver(&self) -> &DiscoveryResolver {
        &self.discovery
    }

    /// Session for an inbound request; see [`SessionManager::provide`].
    pub async fn session_for(
        &self,
        credential: Option<&Credential>,
        key: Option<&str>,
    ) -> Result<ProvidedSession, SessionError> {
        self.sessions.provide(key, credential).await
    }

    /// Channel server for `domain`. Lookups run on the anonymous session.
    pub async fn discover(&self, domain: &str) -> Result<Jid, DiscoveryError> {
        if let Some(server) = self.discovery.cached(domain) {
            return Ok(server);
        }
        let provided = self
            .sessions
            .provide(None, None)
            .await
            .map_err(|error| DiscoveryError::transport(domain, error.to_string()))?;
        self.discovery.discover(&provided.session, domain).await
    }

    /// Close all connections.
    pub async fn shutdown(&self) {
        info!("Shutting down gateway sessions");
        self.sessions.shutdown().await;
    }
}
