//! Probe module for service monitoring.
//!
//! Supports HTTP, TCP and Ping probes.

mod http;
mod ping;
mod tcp;

pub use http::*;
pub use ping::*;
pub use tcp::*;

use crate::db::{FailureKind, ProbeType, Service};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Probe error types. Every variant maps onto a stored [`FailureKind`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("could not resolve host: {0}")]
    DnsFailure(String),
    #[error("expected status {expected}, got {actual}")]
    StatusMismatch { expected: u16, actual: u16 },
    #[error("response body did not match {expected:?}")]
    ContentMismatch { expected: String, status: u16, snippet: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

impl ProbeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProbeError::Timeout(_) => FailureKind::Timeout,
            ProbeError::ConnectionRefused(_) => FailureKind::ConnectionRefused,
            ProbeError::DnsFailure(_) => FailureKind::DnsFailure,
            ProbeError::StatusMismatch { .. } => FailureKind::StatusMismatch,
            ProbeError::ContentMismatch { .. } => FailureKind::ContentMismatch,
            ProbeError::Network(_) | ProbeError::Command(_) => FailureKind::Network,
            ProbeError::Config(_) => FailureKind::Config,
        }
    }

    /// HTTP status observed before the failure was decided, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProbeError::StatusMismatch { actual, .. } => Some(*actual),
            ProbeError::ContentMismatch { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Leading part of the response body, kept for content mismatches.
    pub fn snippet(&self) -> Option<&str> {
        match self {
            ProbeError::ContentMismatch { snippet, .. } => Some(snippet),
            _ => None,
        }
    }
}

/// Timing of a successful probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Send to full response
    pub latency: Duration,
    /// Send to first response
    pub ping: Duration,
}

impl Reading {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ping: latency,
        }
    }
}

/// Result of probing one service once.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// When the probe was sent
    pub time: DateTime<Utc>,
    pub result: Result<Reading, ProbeError>,
}

impl ProbeOutcome {
    pub fn success(time: DateTime<Utc>, reading: Reading) -> Self {
        Self {
            time,
            result: Ok(reading),
        }
    }

    pub fn failure(time: DateTime<Utc>, error: ProbeError) -> Self {
        Self {
            time,
            result: Err(error),
        }
    }
}

/// Something that can check a service. Safe to call concurrently for different services.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, service: &Service) -> ProbeOutcome;
}

/// Prober that talks to the network.
#[derive(Debug, Default, Clone)]
pub struct NetworkProber;

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, service: &Service) -> ProbeOutcome {
        run_probe(service).await
    }
}

/// Probe configuration derived from a service.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub probe_type: ProbeType,
    pub address: String,
    pub port: u16,
    pub method: String,
    pub body: String,
    pub expected: String,
    pub expected_status: u16,
    pub timeout: Duration,
}

impl ProbeConfig {
    pub fn from_service(service: &Service) -> Result<Self, ProbeError> {
        if service.address.trim().is_empty() {
            return Err(ProbeError::Config("empty address".to_string()));
        }
        if !service.timeout.is_finite() || service.timeout <= 0.0 {
            return Err(ProbeError::Config(format!("invalid timeout {}", service.timeout)));
        }
        let timeout = Duration::try_from_secs_f64(service.timeout)
            .map_err(|_| ProbeError::Config(format!("timeout {} is out of range", service.timeout)))?;

        Ok(Self {
            probe_type: service.probe_type,
            address: service.address.trim().to_string(),
            port: service.port,
            method: service.method.clone(),
            body: service.post_data.clone(),
            expected: service.expected.clone(),
            expected_status: service.expected_status,
            timeout,
        })
    }
}

/// Run a probe for the given service.
///
/// Never fails: transport problems come back as a failed outcome.
pub async fn run_probe(service: &Service) -> ProbeOutcome {
    // Add jitter to avoid thundering herd
    let jitter = rand::random::<u64>() % 100;
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    let time = Utc::now();
    let config = match ProbeConfig::from_service(service) {
        Ok(c) => c,
        Err(e) => return ProbeOutcome::failure(time, e),
    };

    let probe = async {
        match config.probe_type {
            ProbeType::Http => run_http_probe(&config).await,
            ProbeType::Tcp => run_tcp_probe(&config.address, config.port, config.timeout).await,
            ProbeType::Ping => run_ping_probe(&config.address, config.timeout)
                .await
                .map(Reading::new),
        }
    };

    // Hard bound in case a transport ignores its own timeout
    let result = match tokio::time::timeout(config.timeout, probe).await {
        Ok(r) => r,
        Err(_) => Err(ProbeError::Timeout(config.timeout)),
    };

    // Enforce timeout check
    let result = result.and_then(|reading| {
        if reading.latency >= config.timeout {
            Err(ProbeError::Timeout(config.timeout))
        } else {
            Ok(reading)
        }
    });

    ProbeOutcome { time, result }
}
