/// Unified error handling for the portico routing layer
///
/// This module provides the error taxonomy shared by the registry, router
/// and origin connector: configuration-time errors (duplicate routes,
/// invalid policies), resolution-time errors (no matching route) and
/// connect-time errors (dial, TLS negotiation, pool exhaustion).
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for portico operations
#[derive(Debug, Error)]
pub enum PorticoError {
    /// Two routes registered under the same path prefix
    #[error("duplicate route for path prefix '{prefix}'")]
    DuplicateRoute { prefix: String },

    /// No registered prefix matches the request path
    #[error("no route matches request path '{path}'")]
    NoRoute { path: String },

    /// The resolved backend has no origins, or none are healthy
    #[error("no origins available for application '{app_id}'")]
    NoOriginsAvailable { app_id: String },

    /// Connection establishment errors
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised while establishing a connection to an origin
#[derive(Debug, Error)]
pub enum ConnectError {
    /// TCP-level failure reaching the origin
    #[error("network error dialing origin '{origin}': {source}")]
    Network {
        origin: String,
        #[source]
        source: io::Error,
    },

    /// The dial did not complete within the configured timeout
    #[error("timed out dialing origin '{origin}' after {timeout:?}")]
    Timeout { origin: String, timeout: Duration },

    /// The origin supports none of the protocol versions the policy offers
    #[error("TLS negotiation with origin '{origin}' failed, offered {offered:?}")]
    TlsNegotiation { origin: String, offered: Vec<String> },

    /// Per-origin connection cap reached and no pending slot available
    #[error("connection pool for origin '{origin}' exhausted")]
    PoolExhausted { origin: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for portico operations
pub type PorticoResult<T> = Result<T, PorticoError>;

/// Convenience methods for creating specific error types
impl PorticoError {
    /// Create a duplicate route error
    pub fn duplicate_route<S: Into<String>>(prefix: S) -> Self {
        PorticoError::DuplicateRoute {
            prefix: prefix.into(),
        }
    }

    /// Create a no-route error
    pub fn no_route<S: Into<String>>(path: S) -> Self {
        PorticoError::NoRoute { path: path.into() }
    }

    /// Create a no-origins-available error
    pub fn no_origins<S: Into<String>>(app_id: S) -> Self {
        PorticoError::NoOriginsAvailable {
            app_id: app_id.into(),
        }
    }

    /// Whether the caller should surface this as a gateway failure
    /// (the proxy could not reach or negotiate with an origin)
    pub fn is_gateway_failure(&self) -> bool {
        matches!(
            self,
            PorticoError::NoOriginsAvailable { .. } | PorticoError::Connect(_)
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PorticoError::DuplicateRoute { .. } => ErrorSeverity::Critical,
            PorticoError::Config(_) => ErrorSeverity::Critical,
            PorticoError::NoRoute { .. } => ErrorSeverity::Info,
            PorticoError::NoOriginsAvailable { .. } => ErrorSeverity::Warning,
            PorticoError::Connect(_) => ErrorSeverity::Warning,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

impl ConnectError {
    pub fn network<S: Into<String>>(origin: S, source: io::Error) -> Self {
        ConnectError::Network {
            origin: origin.into(),
            source,
        }
    }

    pub fn timeout<S: Into<String>>(origin: S, timeout: Duration) -> Self {
        ConnectError::Timeout {
            origin: origin.into(),
            timeout,
        }
    }

    pub fn tls_negotiation<S: Into<String>>(origin: S, offered: Vec<String>) -> Self {
        ConnectError::TlsNegotiation {
            origin: origin.into(),
            offered,
        }
    }

    pub fn pool_exhausted<S: Into<String>>(origin: S) -> Self {
        ConnectError::PoolExhausted {
            origin: origin.into(),
        }
    }
}
