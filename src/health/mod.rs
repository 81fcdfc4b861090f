/// Health checking for backend origins
///
/// Health checks run on their own periodic schedule per origin,
/// decoupled from request serving, and only ever mutate an origin's
/// health state. An origin starts `Unknown` (eligible for selection),
/// is excluded after `unhealthy_threshold` consecutive failures and
/// readmitted after `healthy_threshold` consecutive passes.
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::policy::HealthCheckPolicy;
use crate::core::{Origin, OriginSet};

/// Selection eligibility of one origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(value: u8) -> Self {
        match value {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

/// Mutable health state of one origin; identity fields never change here
#[derive(Debug, Default)]
pub struct OriginHealth {
    state: AtomicU8,
    consecutive_successes: AtomicU32,
    consecutive_failures: AtomicU32,
}

impl OriginHealth {
    pub fn state(&self) -> HealthState {
        self.state.load(Ordering::SeqCst).into()
    }

    /// Unknown origins are eligible; only probed-and-failed ones are not
    pub fn is_eligible(&self) -> bool {
        self.state() != HealthState::Unhealthy
    }

    /// Record a passed probe; returns the resulting state
    pub fn record_success(&self, healthy_threshold: u32) -> HealthState {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        let successes = self.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;
        if successes >= healthy_threshold {
            self.state.store(HealthState::Healthy as u8, Ordering::SeqCst);
        }
        self.state()
    }

    /// Record a failed probe; returns the resulting state
    pub fn record_failure(&self, unhealthy_threshold: u32) -> HealthState {
        self.consecutive_successes.store(0, Ordering::SeqCst);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= unhealthy_threshold {
            self.state.store(HealthState::Unhealthy as u8, Ordering::SeqCst);
        }
        self.state()
    }
}

/// Shared health state across all origins, keyed by origin id
#[derive(Default)]
pub struct HealthRegistry {
    origins: DashMap<String, Arc<OriginHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure(&self, origin_id: &str) -> Arc<OriginHealth> {
        self.origins
            .entry(origin_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Origins never probed are eligible by default
    pub fn is_eligible(&self, origin_id: &str) -> bool {
        self.origins
            .get(origin_id)
            .map(|health| health.is_eligible())
            .unwrap_or(true)
    }

    pub fn state(&self, origin_id: &str) -> HealthState {
        self.origins
            .get(origin_id)
            .map(|health| health.state())
            .unwrap_or(HealthState::Unknown)
    }
}

/// Probe primitive; implementations decide what "healthy" means
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self, origin: &Origin, policy: &HealthCheckPolicy) -> HealthStatus;
}

/// Minimal HTTP/1.1 status-line probe over TCP
pub struct HttpHealthChecker;

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn check(&self, origin: &Origin, policy: &HealthCheckPolicy) -> HealthStatus {
        match self.probe(origin, policy).await {
            Ok(code) if (200..300).contains(&code) => HealthStatus::Healthy,
            Ok(code) => HealthStatus::Unhealthy {
                reason: format!("status {}", code),
            },
            Err(e) => HealthStatus::Unhealthy {
                reason: e.to_string(),
            },
        }
    }
}

impl HttpHealthChecker {
    async fn probe(
        &self,
        origin: &Origin,
        policy: &HealthCheckPolicy,
    ) -> Result<u16, std::io::Error> {
        let mut stream = TcpStream::connect((origin.host.as_str(), origin.port)).await?;
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: portico-health-check\r\nConnection: close\r\n\r\n",
            policy.path, origin.host
        );
        stream.write_all(request.as_bytes()).await?;

        // A slow origin may deliver the status line in several reads;
        // keep reading until the first CRLF, EOF, or 512 bytes
        let mut buf = Vec::with_capacity(512);
        let mut chunk = [0u8; 256];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(2).any(|w| w == b"\r\n") || buf.len() >= 512 {
                break;
            }
        }
        parse_status_line(&buf).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed status line")
        })
    }
}

/// Extract the status code from an HTTP/1.x status line
fn parse_status_line(bytes: &[u8]) -> Option<u16> {
    let line = std::str::from_utf8(bytes).ok()?.lines().next()?;
    if !line.starts_with("HTTP/1.") {
        return None;
    }
    line.split_whitespace().nth(1)?.parse().ok()
}

/// Drives one periodic probe loop per origin
pub struct HealthMonitor {
    registry: Arc<HealthRegistry>,
    checker: Arc<dyn HealthChecker>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<HealthRegistry>, checker: Arc<dyn HealthChecker>) -> Self {
        Self { registry, checker }
    }

    /// Spawn probe loops for every origin in the set
    pub fn watch(&self, origins: &OriginSet, policy: &HealthCheckPolicy) -> Vec<JoinHandle<()>> {
        origins
            .iter()
            .map(|origin| self.spawn(origin.clone(), policy.clone()))
            .collect()
    }

    /// Spawn the probe loop for one origin
    pub fn spawn(&self, origin: Origin, policy: HealthCheckPolicy) -> JoinHandle<()> {
        let health = self.registry.ensure(&origin.id);
        let checker = Arc::clone(&self.checker);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(policy.interval);
            loop {
                ticker.tick().await;

                let status = match timeout(policy.timeout, checker.check(&origin, &policy)).await {
                    Ok(status) => status,
                    Err(_) => HealthStatus::Timeout,
                };

                let before = health.state();
                let after = if status.is_healthy() {
                    health.record_success(policy.healthy_threshold)
                } else {
                    health.record_failure(policy.unhealthy_threshold)
                };

                if before != after {
                    warn!("origin {} health changed {:?} -> {:?}", origin.id, before, after);
                } else {
                    debug!("origin {} probe: {}", origin.id, status);
                }
            }
        })
    }
}
