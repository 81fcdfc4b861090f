/// Backend descriptors: the unit of routing configuration
use std::sync::Arc;

use crate::core::policy::{ConnectionPolicy, TlsPolicy};
use crate::core::{Origin, OriginSet};
use crate::error::ConfigError;

/// Full routing and policy configuration for one path prefix.
///
/// Descriptors are immutable: reconfiguration registers a replacement,
/// never edits fields in place, so in-flight requests keep observing a
/// consistent snapshot until they drop their reference.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendDescriptor {
    pub app_id: String,
    pub path_prefix: String,
    pub origins: OriginSet,
    pub connection_policy: ConnectionPolicy,
    /// Present exactly when the origin leg is TLS
    pub tls_policy: Option<TlsPolicy>,
}

impl BackendDescriptor {
    /// Build a descriptor, admitting `origins` under `app_id` and
    /// validating every attached policy.
    pub fn new(
        app_id: impl Into<String>,
        path_prefix: impl Into<String>,
        origins: impl IntoIterator<Item = Origin>,
        connection_policy: ConnectionPolicy,
        tls_policy: Option<TlsPolicy>,
    ) -> Result<Self, ConfigError> {
        let app_id = app_id.into();
        let path_prefix = path_prefix.into();

        if app_id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "application id cannot be empty".to_string(),
            ));
        }
        if !path_prefix.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "path prefix must start with '/': {path_prefix}"
            )));
        }
        connection_policy.validate()?;
        if let Some(tls) = &tls_policy {
            tls.validate()?;
        }

        Ok(Self {
            origins: OriginSet::admit(&app_id, origins),
            app_id,
            path_prefix,
            connection_policy,
            tls_policy,
        })
    }

    /// Plain-HTTP backend with default policies
    pub fn http(
        app_id: impl Into<String>,
        path_prefix: impl Into<String>,
        origins: impl IntoIterator<Item = Origin>,
    ) -> Result<Self, ConfigError> {
        Self::new(app_id, path_prefix, origins, ConnectionPolicy::default(), None)
    }

    /// TLS backend with default connection policy
    pub fn https(
        app_id: impl Into<String>,
        path_prefix: impl Into<String>,
        origins: impl IntoIterator<Item = Origin>,
        tls_policy: TlsPolicy,
    ) -> Result<Self, ConfigError> {
        Self::new(
            app_id,
            path_prefix,
            origins,
            ConnectionPolicy::default(),
            Some(tls_policy),
        )
    }

    pub fn is_secure(&self) -> bool {
        self.tls_policy.is_some()
    }

    pub fn into_shared(self) -> Arc<BackendDescriptor> {
        Arc::new(self)
    }
}
