pub mod config;
pub mod error;
/// Portico - backend routing registry and origin connection policy layer
/// for HTTP reverse proxies
///
/// Portico owns everything between "a request arrived with this path" and
/// "a usable origin connection exists": the atomically-updatable routing
/// table, longest-prefix resolution, origin selection with sticky-session
/// affinity, per-origin connection pooling and TLS protocol negotiation
/// towards the origins.
pub mod connect;
pub mod core;
pub mod health;

use std::sync::Arc;

use crate::connect::{Dialer, OriginConnector, PooledConnection, TokioDialer};
use crate::core::registry::BackendRegistry;
use crate::core::router::Router;
use crate::core::session::StickySessionManager;
use crate::health::{HealthMonitor, HealthRegistry, HttpHealthChecker};

pub use crate::config::RoutesConfig;
pub use crate::connect::{forwarded_proto, GatewayResponse, GATEWAY_UNAVAILABLE_BODY};
pub use crate::core::backend::BackendDescriptor;
pub use crate::core::{Origin, OriginSet};
pub use crate::error::{ConfigError, ConnectError, PorticoError, PorticoResult};

/// The assembled routing layer: registry, router, health state and
/// origin connector sharing one set of backends
pub struct Gateway {
    registry: Arc<BackendRegistry>,
    router: Router,
    connector: OriginConnector,
    health: Arc<HealthRegistry>,
}

impl Gateway {
    pub fn new(registry: Arc<BackendRegistry>, dialer: Arc<dyn Dialer>) -> Self {
        let health = Arc::new(HealthRegistry::new());
        let sessions = Arc::new(StickySessionManager::new());
        Self {
            router: Router::new(Arc::clone(&registry)),
            connector: OriginConnector::new(dialer, sessions, Arc::clone(&health)),
            registry,
            health,
        }
    }

    /// Assemble a gateway from a route configuration, using the
    /// production dialer
    pub fn from_config(config: RoutesConfig) -> PorticoResult<Self> {
        Ok(Self::new(config.into_registry()?, Arc::new(TokioDialer)))
    }

    /// Resolve a request path and connect to one of the matched
    /// backend's origins
    pub async fn connect_for_path(
        &self,
        path: &str,
        session_token: Option<&str>,
    ) -> PorticoResult<PooledConnection> {
        let backend = self.router.resolve(path)?;
        self.connector.connect(&backend, session_token).await
    }

    /// Spawn probe loops for every backend that configures health
    /// checking. Call once after the registry is populated; routes
    /// added later need their own `HealthMonitor::watch`.
    pub fn start_health_monitors(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let monitor = HealthMonitor::new(Arc::clone(&self.health), Arc::new(HttpHealthChecker));
        let mut handles = Vec::new();
        let table = self.registry.snapshot();
        for (_, backend) in table.iter() {
            if let Some(policy) = &backend.connection_policy.health_check {
                handles.extend(monitor.watch(&backend.origins, policy));
            }
        }
        handles
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn connector(&self) -> &OriginConnector {
        &self.connector
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }
}
