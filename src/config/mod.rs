/// Configuration management for portico
///
/// TOML route files declare backends, their origins and per-backend
/// policies. Every policy field carries the documented default, so a
/// minimal route needs only an app id, a path prefix and origins.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::core::backend::BackendDescriptor;
use crate::core::policy::{
    ConnectionPolicy, HealthCheckPolicy, PendingStrategy, StickySessionPolicy, TlsPolicy,
    TlsProvider,
};
use crate::core::registry::BackendRegistry;
use crate::core::Origin;
use crate::error::{ConfigError, PorticoResult};

/// Top-level route configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutesConfig {
    /// One entry per path prefix
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One backend: a path prefix, its origins and policies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Application identifier
    pub app_id: String,
    /// Path prefix this backend serves
    pub path_prefix: String,
    /// Origin servers
    #[serde(default)]
    pub origins: Vec<OriginConfig>,
    /// Connection pool sizing and timeouts
    #[serde(default)]
    pub pool: PoolConfig,
    /// Session affinity
    #[serde(default)]
    pub sticky_session: StickySessionConfig,
    /// Active health checking; omitted means every origin stays eligible
    pub health_check: Option<HealthCheckConfig>,
    /// TLS towards the origins; omitted means plain HTTP
    pub tls: Option<TlsConfig>,
}

/// One origin server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginConfig {
    /// Origin identifier; omitted origins are named host:port
    pub id: Option<String>,
    pub host: String,
    pub port: u16,
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum concurrent connections per origin
    pub max_connections_per_origin: usize,
    /// Maximum queued waiters per origin
    pub max_pending_per_origin: usize,
    /// Behavior at the connection cap (queue, fail_fast)
    pub pending_strategy: PendingStrategyConfig,
    /// Dial timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Overall connect budget in milliseconds
    pub response_timeout_ms: u64,
    /// Largest accepted origin header block in bytes
    pub max_header_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PendingStrategyConfig {
    #[default]
    Queue,
    FailFast,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_origin: 50,
            max_pending_per_origin: 25,
            pending_strategy: PendingStrategyConfig::Queue,
            connect_timeout_ms: 2000,
            response_timeout_ms: 35000,
            max_header_size: 8192,
        }
    }
}

/// Session affinity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StickySessionConfig {
    pub enabled: bool,
    /// Binding lifetime in seconds
    pub timeout_sec: u64,
}

impl Default for StickySessionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_sec: 43200,
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Path probed on each origin
    pub path: String,
    /// Probe interval in seconds
    #[serde(default = "default_health_interval_sec")]
    pub interval_sec: u64,
    /// Per-probe timeout in seconds
    #[serde(default = "default_health_timeout_sec")]
    pub timeout_sec: u64,
    /// Consecutive successes before marking healthy
    #[serde(default = "default_health_threshold")]
    pub healthy_threshold: u32,
    /// Consecutive failures before marking unhealthy
    #[serde(default = "default_health_threshold")]
    pub unhealthy_threshold: u32,
}

fn default_health_interval_sec() -> u64 {
    5
}

fn default_health_timeout_sec() -> u64 {
    2
}

fn default_health_threshold() -> u32 {
    2
}

/// TLS configuration for the origin leg
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Verify the origin certificate
    #[serde(default)]
    pub authenticate: bool,
    /// PEM trust-root bundle, required when authenticate is set
    pub trusted_certs_path: Option<PathBuf>,
    /// TLS implementation (rustls, native)
    #[serde(default)]
    pub provider: TlsProviderConfig,
    /// Protocol versions offered, in preference order
    #[serde(default = "default_protocols")]
    pub protocols: Vec<String>,
    /// Optional cipher suite restriction
    pub ciphers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsProviderConfig {
    #[default]
    Rustls,
    Native,
}

fn default_protocols() -> Vec<String> {
    vec!["TLSv1.2".to_string(), "TLSv1.3".to_string()]
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl RoutesConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: RoutesConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for route in &self.routes {
            route.to_descriptor()?;
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Build a populated registry from the configured routes
    pub fn into_registry(self) -> PorticoResult<Arc<BackendRegistry>> {
        let registry = BackendRegistry::new();
        registry.put_all(
            self.routes
                .iter()
                .map(|route| Ok((route.path_prefix.clone(), route.to_descriptor()?)))
                .collect::<Result<Vec<_>, ConfigError>>()?,
        )?;
        Ok(Arc::new(registry))
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = RoutesConfig {
            routes: vec![
                RouteConfig {
                    app_id: "landing".to_string(),
                    path_prefix: "/".to_string(),
                    origins: vec![
                        OriginConfig {
                            id: Some("landing-01".to_string()),
                            host: "10.0.1.10".to_string(),
                            port: 9090,
                        },
                        OriginConfig {
                            id: None,
                            host: "10.0.1.11".to_string(),
                            port: 9090,
                        },
                    ],
                    pool: PoolConfig::default(),
                    sticky_session: StickySessionConfig::default(),
                    health_check: Some(HealthCheckConfig {
                        path: "/version/healthcheck".to_string(),
                        interval_sec: default_health_interval_sec(),
                        timeout_sec: default_health_timeout_sec(),
                        healthy_threshold: default_health_threshold(),
                        unhealthy_threshold: default_health_threshold(),
                    }),
                    tls: None,
                },
                RouteConfig {
                    app_id: "checkout".to_string(),
                    path_prefix: "/checkout/".to_string(),
                    origins: vec![OriginConfig {
                        id: None,
                        host: "10.0.2.10".to_string(),
                        port: 8443,
                    }],
                    pool: PoolConfig::default(),
                    sticky_session: StickySessionConfig {
                        enabled: true,
                        timeout_sec: 43200,
                    },
                    health_check: None,
                    tls: Some(TlsConfig {
                        authenticate: false,
                        trusted_certs_path: None,
                        provider: TlsProviderConfig::Rustls,
                        protocols: default_protocols(),
                        ciphers: None,
                    }),
                },
            ],
            logging: LoggingConfig::default(),
        };

        config.save_to_file(path)
    }
}

impl RouteConfig {
    /// External representation of a runtime descriptor; the inverse of
    /// [`RouteConfig::to_descriptor`]
    pub fn from_descriptor(descriptor: &BackendDescriptor) -> Self {
        let policy = &descriptor.connection_policy;
        Self {
            app_id: descriptor.app_id.clone(),
            path_prefix: descriptor.path_prefix.clone(),
            origins: descriptor
                .origins
                .iter()
                .map(|origin| OriginConfig {
                    id: Some(origin.id.clone()),
                    host: origin.host.clone(),
                    port: origin.port,
                })
                .collect(),
            pool: PoolConfig {
                max_connections_per_origin: policy.max_connections_per_origin,
                max_pending_per_origin: policy.max_pending_per_origin,
                pending_strategy: match policy.pending_strategy {
                    PendingStrategy::Queue => PendingStrategyConfig::Queue,
                    PendingStrategy::FailFast => PendingStrategyConfig::FailFast,
                },
                connect_timeout_ms: policy.connect_timeout.as_millis() as u64,
                response_timeout_ms: policy.response_timeout.as_millis() as u64,
                max_header_size: policy.max_header_size,
            },
            sticky_session: StickySessionConfig {
                enabled: policy.sticky_session.enabled,
                timeout_sec: policy.sticky_session.timeout.as_secs(),
            },
            health_check: policy.health_check.as_ref().map(|health| HealthCheckConfig {
                path: health.path.clone(),
                interval_sec: health.interval.as_secs(),
                timeout_sec: health.timeout.as_secs(),
                healthy_threshold: health.healthy_threshold,
                unhealthy_threshold: health.unhealthy_threshold,
            }),
            tls: descriptor.tls_policy.as_ref().map(|tls| TlsConfig {
                authenticate: tls.authenticate,
                trusted_certs_path: tls.trusted_certs_path.clone(),
                provider: match tls.provider {
                    TlsProvider::Rustls => TlsProviderConfig::Rustls,
                    TlsProvider::Native => TlsProviderConfig::Native,
                },
                protocols: tls.protocols.clone(),
                ciphers: tls.ciphers.clone(),
            }),
        }
    }

    /// Build the runtime descriptor, validating every policy
    pub fn to_descriptor(&self) -> Result<BackendDescriptor, ConfigError> {
        let origins = self.origins.iter().map(|origin| match &origin.id {
            Some(id) => Origin::new(id, "", &origin.host, origin.port),
            None => Origin::anonymous(&origin.host, origin.port),
        });

        let policy = ConnectionPolicy {
            max_connections_per_origin: self.pool.max_connections_per_origin,
            max_pending_per_origin: self.pool.max_pending_per_origin,
            pending_strategy: match self.pool.pending_strategy {
                PendingStrategyConfig::Queue => PendingStrategy::Queue,
                PendingStrategyConfig::FailFast => PendingStrategy::FailFast,
            },
            connect_timeout: Duration::from_millis(self.pool.connect_timeout_ms),
            response_timeout: Duration::from_millis(self.pool.response_timeout_ms),
            max_header_size: self.pool.max_header_size,
            sticky_session: StickySessionPolicy {
                enabled: self.sticky_session.enabled,
                timeout: Duration::from_secs(self.sticky_session.timeout_sec),
            },
            health_check: self.health_check.as_ref().map(|health| HealthCheckPolicy {
                path: health.path.clone(),
                interval: Duration::from_secs(health.interval_sec),
                timeout: Duration::from_secs(health.timeout_sec),
                healthy_threshold: health.healthy_threshold,
                unhealthy_threshold: health.unhealthy_threshold,
            }),
        };

        let tls = self.tls.as_ref().map(|tls| TlsPolicy {
            authenticate: tls.authenticate,
            trusted_certs_path: tls.trusted_certs_path.clone(),
            provider: match tls.provider {
                TlsProviderConfig::Rustls => TlsProvider::Rustls,
                TlsProviderConfig::Native => TlsProvider::Native,
            },
            protocols: tls.protocols.clone(),
            ciphers: tls.ciphers.clone(),
        });

        BackendDescriptor::new(&self.app_id, &self.path_prefix, origins, policy, tls)
    }
}
