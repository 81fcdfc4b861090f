/// Connection, sticky-session, health-check and TLS policy value types
///
/// These are pure, immutable values attached to a backend descriptor.
/// Every field has a documented default; validating constructors reject
/// inconsistent combinations up front instead of relying on builder
/// overloads.
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Pool sizing, timeouts and per-backend request policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPolicy {
    /// Hard cap on concurrent connections to a single origin (default 50)
    pub max_connections_per_origin: usize,
    /// Cap on callers waiting for a pool slot per origin (default 25)
    pub max_pending_per_origin: usize,
    /// What to do when the pool is at capacity (default: queue)
    pub pending_strategy: PendingStrategy,
    /// Bound on a single TCP/TLS dial (default 2s)
    pub connect_timeout: Duration,
    /// Overall budget for establishing a usable connection (default 35s)
    pub response_timeout: Duration,
    /// Largest header block accepted from the origin, bytes (default 8192)
    pub max_header_size: usize,
    /// Client affinity configuration (default disabled)
    pub sticky_session: StickySessionPolicy,
    /// Active health checking; absent means all origins stay eligible
    pub health_check: Option<HealthCheckPolicy>,
}

/// Behavior when an origin's connection pool is at its hard cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStrategy {
    /// Wait for a slot, subject to `max_pending_per_origin` and the
    /// connect timeout
    Queue,
    /// Fail immediately with a pool-exhausted error
    FailFast,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            max_connections_per_origin: 50,
            max_pending_per_origin: 25,
            pending_strategy: PendingStrategy::Queue,
            connect_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(35),
            max_header_size: 8192,
            sticky_session: StickySessionPolicy::default(),
            health_check: None,
        }
    }
}

impl ConnectionPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections_per_origin == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections_per_origin must be greater than 0".to_string(),
            ));
        }
        if self.response_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "connect and response timeouts must be greater than 0".to_string(),
            ));
        }
        if self.max_header_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_header_size must be greater than 0".to_string(),
            ));
        }
        if let Some(health) = &self.health_check {
            health.validate()?;
        }
        if self.sticky_session.enabled && self.sticky_session.timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "sticky session timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Client affinity binding a session token to one origin for a bounded time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StickySessionPolicy {
    /// Default disabled
    pub enabled: bool,
    /// How long a binding lives without renewal (default 12 hours)
    pub timeout: Duration,
}

impl Default for StickySessionPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout: Duration::from_secs(60 * 60 * 12),
        }
    }
}

/// Active health-check cadence and thresholds for one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckPolicy {
    /// URL path probed on each origin
    pub path: String,
    /// Probe interval (default 5s)
    pub interval: Duration,
    /// Per-probe timeout (default 2s)
    pub timeout: Duration,
    /// Consecutive passes before an unhealthy origin is readmitted (default 2)
    pub healthy_threshold: u32,
    /// Consecutive failures before an origin is excluded (default 2)
    pub unhealthy_threshold: u32,
}

impl HealthCheckPolicy {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            healthy_threshold: 2,
            unhealthy_threshold: 2,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.path.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "health check path must start with '/': {}",
                self.path
            )));
        }
        if self.interval.is_zero() || self.timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "health check interval and timeout must be greater than 0".to_string(),
            ));
        }
        if self.timeout >= self.interval {
            return Err(ConfigError::ValidationError(
                "health check timeout must be less than the interval".to_string(),
            ));
        }
        if self.healthy_threshold == 0 || self.unhealthy_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "health check thresholds must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// TLS implementation used for the origin leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsProvider {
    /// Pure-Rust provider (default)
    #[default]
    Rustls,
    /// Platform/native provider
    Native,
}

/// Protocol and trust policy for a secure backend.
///
/// Present on a descriptor exactly when the origin leg is TLS. Whether an
/// origin actually supports one of the offered protocol versions is only
/// known at handshake time, so a disjoint protocol set surfaces as a
/// connect failure, not a configuration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPolicy {
    /// Verify the origin certificate (default false: test origins are
    /// typically self-signed)
    pub authenticate: bool,
    /// PEM bundle used as trust roots when `authenticate` is set
    pub trusted_certs_path: Option<PathBuf>,
    pub provider: TlsProvider,
    /// Protocol versions offered during the handshake, in preference
    /// order; never empty
    pub protocols: Vec<String>,
    /// Optional cipher suite restriction
    pub ciphers: Option<Vec<String>>,
}

impl TlsPolicy {
    /// A policy offering exactly the given protocol versions.
    /// Rejects an empty list: a secure backend with nothing to offer
    /// could never negotiate.
    pub fn new(protocols: Vec<String>) -> Result<Self, ConfigError> {
        let policy = Self {
            authenticate: false,
            trusted_certs_path: None,
            provider: TlsProvider::default(),
            protocols,
            ciphers: None,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocols.is_empty() {
            return Err(ConfigError::ValidationError(
                "TLS policy must offer at least one protocol version".to_string(),
            ));
        }
        if self.authenticate && self.trusted_certs_path.is_none() {
            return Err(ConfigError::ValidationError(
                "authenticate requires trusted_certs_path".to_string(),
            ));
        }
        if let Some(ciphers) = &self.ciphers {
            if ciphers.is_empty() {
                return Err(ConfigError::ValidationError(
                    "cipher restriction must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}
