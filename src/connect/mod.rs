/// Origin selection and connection establishment
///
/// The connector owns everything between "a request resolved to this
/// backend" and "a usable origin connection": origin eligibility,
/// sticky-session affinity, round-robin selection, per-origin pool
/// caps and the dial itself. Selection state lives here, never in the
/// registry, so routing-table swaps cannot disturb in-flight connects.
pub mod dialer;
pub mod pool;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::backend::BackendDescriptor;
use crate::core::policy::ConnectionPolicy;
use crate::core::session::StickySessionManager;
use crate::core::Origin;
use crate::error::{ConnectError, PorticoError, PorticoResult};
use crate::health::HealthRegistry;

pub use dialer::{Connection, Dialer, TokioDialer, TransportStream};
pub use pool::{OriginPools, PoolPermit};

/// Canonical header carrying the client-facing scheme to the origin
pub const X_FORWARDED_PROTO: &str = "X-Forwarded-Proto";

/// Body served when no origin connection could be established
pub const GATEWAY_UNAVAILABLE_BODY: &str = "Site temporarily unavailable.";

/// The `X-Forwarded-Proto` value for a request: the scheme the client
/// used on the front leg, regardless of how the origin leg is carried
pub fn forwarded_proto(client_tls: bool) -> &'static str {
    if client_tls {
        "https"
    } else {
        "http"
    }
}

/// What the gateway serves the client when a backend is unreachable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: String,
}

impl GatewayResponse {
    pub fn unavailable() -> Self {
        Self::unavailable_with_body(GATEWAY_UNAVAILABLE_BODY)
    }

    /// The standard 502 with a site-specific body; the status class is
    /// not configurable
    pub fn unavailable_with_body(body: impl Into<String>) -> Self {
        Self {
            status: 502,
            body: body.into(),
        }
    }

    /// Collapse a connect-path failure into the client-facing response.
    /// Routing and configuration errors are not gateway failures and
    /// map to nothing here.
    pub fn from_error(error: &PorticoError) -> Option<Self> {
        error.is_gateway_failure().then(Self::unavailable)
    }
}

/// An origin connection together with its pool slot; dropping it
/// returns the slot to the origin's pool
#[derive(Debug)]
pub struct PooledConnection {
    connection: Connection,
    _permit: PoolPermit,
}

impl PooledConnection {
    pub fn origin(&self) -> &Origin {
        &self.connection.origin
    }

    pub fn negotiated_protocol(&self) -> Option<&str> {
        self.connection.negotiated_protocol()
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }
}

/// Establishes connections to a backend's origins under its policies
pub struct OriginConnector {
    dialer: Arc<dyn Dialer>,
    sessions: Arc<StickySessionManager>,
    health: Arc<HealthRegistry>,
    pools: OriginPools,
    next: AtomicUsize,
}

impl OriginConnector {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        sessions: Arc<StickySessionManager>,
        health: Arc<HealthRegistry>,
    ) -> Self {
        Self {
            dialer,
            sessions,
            health,
            pools: OriginPools::new(),
            next: AtomicUsize::new(0),
        }
    }

    /// Connect to one of the backend's origins.
    ///
    /// Selection prefers a live sticky binding when the backend has
    /// sticky sessions enabled and the caller presents a session token;
    /// otherwise origins are rotated round-robin over the currently
    /// eligible members. The whole acquire-and-dial sequence is bounded
    /// by the backend's response timeout.
    pub async fn connect(
        &self,
        backend: &BackendDescriptor,
        session_token: Option<&str>,
    ) -> PorticoResult<PooledConnection> {
        self.connect_with_policy(backend, &backend.connection_policy, session_token)
            .await
    }

    /// Like [`connect`](Self::connect), but with the backend's
    /// connection policy overridden for this call
    pub async fn connect_with_policy(
        &self,
        backend: &BackendDescriptor,
        policy: &ConnectionPolicy,
        session_token: Option<&str>,
    ) -> PorticoResult<PooledConnection> {
        let eligible: Vec<&Origin> = backend
            .origins
            .iter()
            .filter(|origin| self.health.is_eligible(&origin.id))
            .collect();
        if eligible.is_empty() {
            warn!("no eligible origins for application {}", backend.app_id);
            return Err(PorticoError::no_origins(&backend.app_id));
        }

        let sticky = &policy.sticky_session;
        let origin = match session_token.filter(|_| sticky.enabled) {
            Some(token) => match self
                .sessions
                .lookup(token, |id| {
                    backend.origins.contains(id) && self.health.is_eligible(id)
                })
                .await
            {
                Some(bound_id) => backend
                    .origins
                    .get(&bound_id)
                    .cloned()
                    .unwrap_or_else(|| self.rotate(&eligible)),
                None => self.rotate(&eligible),
            },
            None => self.rotate(&eligible),
        };

        let connect_timeout = policy.connect_timeout.min(policy.response_timeout);

        let established = timeout(policy.response_timeout, async {
            let permit = self.pools.acquire(&origin.id, policy).await?;
            let connection = self
                .dialer
                .dial(&origin, backend.tls_policy.as_ref(), connect_timeout)
                .await?;
            Ok::<_, ConnectError>(PooledConnection {
                connection,
                _permit: permit,
            })
        })
        .await
        .map_err(|_| ConnectError::timeout(&origin.id, policy.response_timeout))??;

        if sticky.enabled {
            if let Some(token) = session_token {
                self.sessions.bind(token, &origin.id, sticky.timeout).await;
            }
        }

        debug!(
            "connected to origin {} for application {}",
            origin.id, backend.app_id
        );
        Ok(established)
    }

    /// Round-robin over the eligible origins; the cursor is shared
    /// across backends, which only skews rotation, never starves it
    fn rotate(&self, eligible: &[&Origin]) -> Origin {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % eligible.len();
        eligible[index].clone()
    }

    pub fn pools(&self) -> &OriginPools {
        &self.pools
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    pub fn sessions(&self) -> &Arc<StickySessionManager> {
        &self.sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::core::policy::{
        ConnectionPolicy, PendingStrategy, StickySessionPolicy, TlsPolicy,
    };

    /// In-memory dialer scripted with each origin's supported TLS
    /// versions; counts only handshakes that reached the origin
    struct ScriptedDialer {
        supported: HashMap<String, Vec<String>>,
        hits: Mutex<HashMap<String, usize>>,
    }

    impl ScriptedDialer {
        fn new(supported: Vec<(&str, Vec<&str>)>) -> Self {
            Self {
                supported: supported
                    .into_iter()
                    .map(|(id, versions)| {
                        (
                            id.to_string(),
                            versions.into_iter().map(String::from).collect(),
                        )
                    })
                    .collect(),
                hits: Mutex::new(HashMap::new()),
            }
        }

        fn hits(&self, origin_id: &str) -> usize {
            self.hits.lock().unwrap().get(origin_id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Dialer for ScriptedDialer {
        async fn dial(
            &self,
            origin: &Origin,
            tls: Option<&TlsPolicy>,
            _connect_timeout: Duration,
        ) -> Result<Connection, ConnectError> {
            let negotiated = match tls {
                Some(policy) => {
                    let supported = self.supported.get(&origin.id).cloned().unwrap_or_default();
                    // First offered version the origin also supports,
                    // honoring the policy's preference order
                    match policy
                        .protocols
                        .iter()
                        .find(|version| supported.contains(version))
                    {
                        Some(version) => Some(version.clone()),
                        None => {
                            // Handshake fails before any request bytes flow
                            return Err(ConnectError::tls_negotiation(
                                &origin.id,
                                policy.protocols.clone(),
                            ));
                        }
                    }
                }
                None => None,
            };

            *self
                .hits
                .lock()
                .unwrap()
                .entry(origin.id.clone())
                .or_insert(0) += 1;
            let (local, _remote) = tokio::io::duplex(1024);
            Ok(Connection::new(origin.clone(), Box::new(local), negotiated))
        }
    }

    fn connector(dialer: Arc<dyn Dialer>) -> OriginConnector {
        OriginConnector::new(
            dialer,
            Arc::new(StickySessionManager::new()),
            Arc::new(HealthRegistry::new()),
        )
    }

    fn origins(ids: &[&str]) -> Vec<Origin> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| Origin::new(*id, "", "localhost", 9090 + i as u16))
            .collect()
    }

    #[tokio::test]
    async fn test_round_robin_rotates_origins() {
        let dialer = Arc::new(ScriptedDialer::new(vec![]));
        let connector = connector(dialer.clone());
        let backend =
            BackendDescriptor::http("app", "/app/", origins(&["o1", "o2", "o3"])).unwrap();

        for _ in 0..6 {
            connector.connect(&backend, None).await.unwrap();
        }

        assert_eq!(dialer.hits("o1"), 2);
        assert_eq!(dialer.hits("o2"), 2);
        assert_eq!(dialer.hits("o3"), 2);
    }

    #[tokio::test]
    async fn test_unhealthy_origin_is_skipped() {
        let dialer = Arc::new(ScriptedDialer::new(vec![]));
        let connector = connector(dialer.clone());
        let backend = BackendDescriptor::http("app", "/app/", origins(&["o1", "o2"])).unwrap();

        connector.health().ensure("o1").record_failure(1);

        for _ in 0..4 {
            connector.connect(&backend, None).await.unwrap();
        }
        assert_eq!(dialer.hits("o1"), 0);
        assert_eq!(dialer.hits("o2"), 4);
    }

    #[tokio::test]
    async fn test_no_origins_fails_with_app_id() {
        let connector = connector(Arc::new(ScriptedDialer::new(vec![])));
        let backend = BackendDescriptor::http("empty-app", "/x/", vec![]).unwrap();

        let result = connector.connect(&backend, None).await;
        assert!(
            matches!(result, Err(PorticoError::NoOriginsAvailable { ref app_id })
                if app_id == "empty-app")
        );
    }

    #[tokio::test]
    async fn test_all_origins_unhealthy_fails() {
        let connector = connector(Arc::new(ScriptedDialer::new(vec![])));
        let backend = BackendDescriptor::http("app", "/app/", origins(&["o1"])).unwrap();

        connector.health().ensure("o1").record_failure(1);
        let result = connector.connect(&backend, None).await;
        assert!(matches!(result, Err(PorticoError::NoOriginsAvailable { .. })));
    }

    fn sticky_backend(origin_ids: &[&str]) -> BackendDescriptor {
        let policy = ConnectionPolicy {
            sticky_session: StickySessionPolicy {
                enabled: true,
                timeout: Duration::from_secs(60),
            },
            ..Default::default()
        };
        BackendDescriptor::new("app", "/app/", origins(origin_ids), policy, None).unwrap()
    }

    #[tokio::test]
    async fn test_sticky_session_pins_origin() {
        let dialer = Arc::new(ScriptedDialer::new(vec![]));
        let connector = connector(dialer.clone());
        let backend = sticky_backend(&["o1", "o2", "o3"]);

        let first = connector.connect(&backend, Some("session-1")).await.unwrap();
        let pinned = first.origin().id.clone();
        drop(first);

        for _ in 0..5 {
            let next = connector.connect(&backend, Some("session-1")).await.unwrap();
            assert_eq!(next.origin().id, pinned);
        }
        assert_eq!(dialer.hits(&pinned), 6);
    }

    #[tokio::test]
    async fn test_sticky_session_rebinds_when_origin_leaves() {
        let dialer = Arc::new(ScriptedDialer::new(vec![]));
        let connector = connector(dialer.clone());
        let backend = sticky_backend(&["o1", "o2"]);

        let first = connector.connect(&backend, Some("session-1")).await.unwrap();
        let pinned = first.origin().id.clone();
        drop(first);

        connector.health().ensure(&pinned).record_failure(1);

        let rebound = connector.connect(&backend, Some("session-1")).await.unwrap();
        assert_ne!(rebound.origin().id, pinned);

        // The new binding persists once made
        let again = connector.connect(&backend, Some("session-1")).await.unwrap();
        assert_eq!(again.origin().id, rebound.origin().id);
    }

    #[tokio::test]
    async fn test_token_without_sticky_policy_is_ignored() {
        let dialer = Arc::new(ScriptedDialer::new(vec![]));
        let connector = connector(dialer.clone());
        let backend = BackendDescriptor::http("app", "/app/", origins(&["o1", "o2"])).unwrap();

        for _ in 0..4 {
            connector.connect(&backend, Some("session-1")).await.unwrap();
        }
        // Plain round-robin: the token created no affinity
        assert_eq!(dialer.hits("o1"), 2);
        assert_eq!(dialer.hits("o2"), 2);
        assert_eq!(connector.sessions().binding_count().await, 0);
    }

    #[tokio::test]
    async fn test_tls_version_mismatch_sends_nothing_to_origin() {
        // Backend offers only TLSv1.1; the origin speaks only TLSv1.2
        let dialer = Arc::new(ScriptedDialer::new(vec![("o1", vec!["TLSv1.2"])]));
        let connector = connector(dialer.clone());
        let backend = BackendDescriptor::https(
            "secure-app",
            "/secure/",
            origins(&["o1"]),
            TlsPolicy::new(vec!["TLSv1.1".to_string()]).unwrap(),
        )
        .unwrap();

        let result = connector.connect(&backend, None).await;

        let error = result.unwrap_err();
        assert!(matches!(
            error,
            PorticoError::Connect(ConnectError::TlsNegotiation { .. })
        ));
        assert_eq!(dialer.hits("o1"), 0);

        // The client sees a 502 with the standard body
        let response = GatewayResponse::from_error(&error).unwrap();
        assert_eq!(response.status, 502);
        assert_eq!(response.body, GATEWAY_UNAVAILABLE_BODY);
    }

    #[tokio::test]
    async fn test_tls_negotiates_common_version() {
        // Backend offers both versions; the origin only speaks the older
        let dialer = Arc::new(ScriptedDialer::new(vec![("o1", vec!["TLSv1.1"])]));
        let connector = connector(dialer.clone());
        let backend = BackendDescriptor::https(
            "secure-app",
            "/secure/",
            origins(&["o1"]),
            TlsPolicy::new(vec!["TLSv1.1".to_string(), "TLSv1.2".to_string()]).unwrap(),
        )
        .unwrap();

        let connection = connector.connect(&backend, None).await.unwrap();
        assert_eq!(connection.negotiated_protocol(), Some("TLSv1.1"));
        assert_eq!(dialer.hits("o1"), 1);
    }

    #[tokio::test]
    async fn test_pool_slot_released_on_drop() {
        let dialer = Arc::new(ScriptedDialer::new(vec![]));
        let connector = connector(dialer);
        let policy = ConnectionPolicy {
            max_connections_per_origin: 1,
            pending_strategy: PendingStrategy::FailFast,
            ..Default::default()
        };
        let backend =
            BackendDescriptor::new("app", "/app/", origins(&["o1"]), policy, None).unwrap();

        let held = connector.connect(&backend, None).await.unwrap();
        let blocked = connector.connect(&backend, None).await;
        assert!(matches!(
            blocked,
            Err(PorticoError::Connect(ConnectError::PoolExhausted { .. }))
        ));

        drop(held);
        assert!(connector.connect(&backend, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_policy_override_applies_per_call() {
        let dialer = Arc::new(ScriptedDialer::new(vec![]));
        let connector = connector(dialer);
        let backend = BackendDescriptor::http("app", "/app/", origins(&["o1"])).unwrap();
        let tight = ConnectionPolicy {
            max_connections_per_origin: 1,
            pending_strategy: PendingStrategy::FailFast,
            ..Default::default()
        };

        let held = connector
            .connect_with_policy(&backend, &tight, None)
            .await
            .unwrap();
        let blocked = connector.connect_with_policy(&backend, &tight, None).await;
        assert!(matches!(
            blocked,
            Err(PorticoError::Connect(ConnectError::PoolExhausted { .. }))
        ));
        drop(held);
    }

    #[tokio::test]
    async fn test_override_cap_binds_even_after_looser_dial() {
        let dialer = Arc::new(ScriptedDialer::new(vec![]));
        let connector = connector(dialer);
        let backend = BackendDescriptor::http("app", "/app/", origins(&["o1"])).unwrap();
        let tight = ConnectionPolicy {
            max_connections_per_origin: 1,
            pending_strategy: PendingStrategy::FailFast,
            ..Default::default()
        };

        // The origin is first dialed under the backend's default cap of
        // 50; the override's cap of 1 must still apply afterwards
        let held = connector.connect(&backend, None).await.unwrap();
        let blocked = connector.connect_with_policy(&backend, &tight, None).await;
        assert!(matches!(
            blocked,
            Err(PorticoError::Connect(ConnectError::PoolExhausted { .. }))
        ));

        drop(held);
        assert!(connector
            .connect_with_policy(&backend, &tight, None)
            .await
            .is_ok());
    }

    #[test]
    fn test_forwarded_proto_reflects_client_leg() {
        assert_eq!(forwarded_proto(false), "http");
        assert_eq!(forwarded_proto(true), "https");
        assert_eq!(X_FORWARDED_PROTO, "X-Forwarded-Proto");
    }

    #[test]
    fn test_gateway_response_only_for_gateway_failures() {
        assert!(GatewayResponse::from_error(&PorticoError::no_route("/x")).is_none());
        assert!(GatewayResponse::from_error(&PorticoError::no_origins("app")).is_some());
    }
}
