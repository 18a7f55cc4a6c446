use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::auth::{CredentialVerifier, TokenIssuer, TokenVerifier};
use crate::config::ServerConfig;
use crate::id::IdGenerator;
use crate::monitor::HeartbeatConfig;
use crate::registry::ConnectionRegistry;
use crate::router::SignalRouter;
use crate::session::SessionConfig;

/// Shared state handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub router: Arc<SignalRouter>,
    pub verifier: Arc<dyn CredentialVerifier>,
    /// Present only when the development token endpoints are mounted.
    pub issuer: Option<Arc<TokenIssuer>>,
    pub ids: Arc<IdGenerator>,
    pub session: SessionConfig,
    pub heartbeat: HeartbeatConfig,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn from_config(
        config: &ServerConfig,
        metrics: Option<PrometheusHandle>,
    ) -> anyhow::Result<Self> {
        let registry = ConnectionRegistry::new();
        let router = SignalRouter::new(
            registry.clone(),
            config.offer_policy.matcher(),
            config.evict_unreachable,
        );
        let secret = config.secret_key.as_bytes();
        let issuer = config.issuer_enabled.then(|| {
            Arc::new(TokenIssuer::new(
                secret,
                config.access_token_ttl,
                config.refresh_token_ttl,
            ))
        });

        let ids = IdGenerator::new(config.machine_id).context("failed to start id generator")?;

        Ok(Self {
            registry,
            router: Arc::new(router),
            verifier: Arc::new(TokenVerifier::new(secret)),
            issuer,
            ids: Arc::new(ids),
            session: config.session.clone(),
            heartbeat: config.heartbeat,
            metrics,
        })
    }
}
