//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Protocol used to probe a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeType {
    Http,
    Tcp,
    #[serde(alias = "icmp")]
    Ping,
}

impl ProbeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeType::Http => "http",
            ProbeType::Tcp => "tcp",
            ProbeType::Ping => "ping",
        }
    }
}

impl fmt::Display for ProbeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" | "https" => Ok(ProbeType::Http),
            "tcp" => Ok(ProbeType::Tcp),
            "ping" | "icmp" => Ok(ProbeType::Ping),
            other => Err(format!("unknown probe type: {}", other)),
        }
    }
}

/// A monitored service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub address: String,
    #[serde(rename = "type")]
    pub probe_type: ProbeType,
    /// TCP port, 0 when the address already carries one
    pub port: u16,
    /// HTTP method
    pub method: String,
    /// HTTP request body
    pub post_data: String,
    /// Regular expression the HTTP body must match, empty to skip
    pub expected: String,
    /// Required HTTP status, 0 accepts any response
    pub expected_status: u16,
    /// Seconds between probes
    pub check_interval: f64,
    /// Seconds before a probe is classified as timed out
    pub timeout: f64,
    pub public: bool,
    pub order_id: i64,
    pub enabled: bool,
    pub notify: bool,
    pub created_at: DateTime<Utc>,
    /// Display grouping, opaque to the monitor. 0 means ungrouped
    pub group_id: i64,
}

impl Default for Service {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            address: String::new(),
            probe_type: ProbeType::Http,
            port: 0,
            method: "GET".to_string(),
            post_data: String::new(),
            expected: String::new(),
            expected_status: 0,
            check_interval: 60.0,
            timeout: 10.0,
            public: true,
            order_id: 0,
            enabled: true,
            notify: true,
            created_at: Utc::now(),
            group_id: 0,
        }
    }
}

/// A successful probe.
#[derive(Debug, Clone, Serialize)]
pub struct Hit {
    pub id: i64,
    pub service_id: i64,
    pub time: DateTime<Utc>,
    /// Send to full response, in nanoseconds
    pub latency_ns: i64,
    /// Send to first response, in nanoseconds
    pub ping_ns: i64,
}

/// Classification of a failed probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ConnectionRefused,
    DnsFailure,
    StatusMismatch,
    ContentMismatch,
    Network,
    Config,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionRefused => "connection_refused",
            FailureKind::DnsFailure => "dns_failure",
            FailureKind::StatusMismatch => "status_mismatch",
            FailureKind::ContentMismatch => "content_mismatch",
            FailureKind::Network => "network",
            FailureKind::Config => "config",
        }
    }

    /// Unknown stored values degrade to `Network` rather than failing the read.
    pub fn parse(s: &str) -> Self {
        match s {
            "timeout" => FailureKind::Timeout,
            "connection_refused" => FailureKind::ConnectionRefused,
            "dns_failure" => FailureKind::DnsFailure,
            "status_mismatch" => FailureKind::StatusMismatch,
            "content_mismatch" => FailureKind::ContentMismatch,
            "config" => FailureKind::Config,
            _ => FailureKind::Network,
        }
    }
}

/// An unsuccessful probe.
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub id: i64,
    pub service_id: i64,
    pub time: DateTime<Utc>,
    pub kind: FailureKind,
    pub issue: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Stored configuration of one notification channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifierConfig {
    pub method: String,
    pub enabled: bool,
    /// Lower values are notified first
    pub priority: i64,
    pub fields: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl NotifierConfig {
    pub fn new(method: &str) -> Self {
        Self {
            method: method.to_string(),
            enabled: false,
            priority: 0,
            fields: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Trimmed field value, `None` when absent or blank.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Event-log volume, reported by the retention sweep and health endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventStats {
    pub hits: i64,
    pub failures: i64,
}
