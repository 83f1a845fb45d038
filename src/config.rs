//! Configuration module for uptrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "uptrail.db")
    pub db_path: String,
    /// Bearer secret that marks a caller as an administrator
    pub api_secret: String,
    /// True when `api_secret` was generated at startup rather than configured
    pub api_secret_generated: bool,
    /// Consecutive failed probes before a service is marked down (default: 1)
    pub failure_threshold: u32,
    /// Upper bound on a single notifier delivery (default: 10s)
    pub notifier_timeout: Duration,
    /// Age after which hits and failures are purged, in days (0 disables)
    pub remove_after_days: u32,
    /// How often the retention sweep runs (default: 1h)
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "uptrail.db".to_string(),
            api_secret: String::new(),
            api_secret_generated: false,
            failure_threshold: 1,
            notifier_timeout: Duration::from_secs(10),
            remove_after_days: 90,
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `UPTRAIL_HTTP_PORT`: HTTP port (default: 8080)
    /// - `UPTRAIL_DB_PATH`: Database file path (default: "uptrail.db")
    /// - `UPTRAIL_API_SECRET`: admin bearer secret (default: random, logged at startup)
    /// - `UPTRAIL_FAILURE_THRESHOLD`: failures before a down transition (default: 1)
    /// - `UPTRAIL_NOTIFIER_TIMEOUT`: seconds per notifier delivery (default: 10)
    /// - `UPTRAIL_REMOVE_AFTER_DAYS`: event retention in days (default: 90)
    /// - `UPTRAIL_CLEANUP_INTERVAL`: seconds between retention sweeps (default: 3600)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = env_parse("UPTRAIL_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Ok(db_path) = env::var("UPTRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }

        (cfg.api_secret, cfg.api_secret_generated) = resolve_secret(env::var("UPTRAIL_API_SECRET").ok());

        if let Some(threshold) = env_parse::<u32>("UPTRAIL_FAILURE_THRESHOLD") {
            cfg.failure_threshold = threshold.max(1);
        }

        if let Some(secs) = env_parse::<u64>("UPTRAIL_NOTIFIER_TIMEOUT") {
            if secs > 0 {
                cfg.notifier_timeout = Duration::from_secs(secs);
            }
        }

        if let Some(days) = env_parse("UPTRAIL_REMOVE_AFTER_DAYS") {
            cfg.remove_after_days = days;
        }

        if let Some(secs) = env_parse::<u64>("UPTRAIL_CLEANUP_INTERVAL") {
            if secs > 0 {
                cfg.cleanup_interval = Duration::from_secs(secs);
            }
        }

        cfg
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Use the configured secret, or generate one when it is missing or blank.
fn resolve_secret(configured: Option<String>) -> (String, bool) {
    match configured {
        Some(secret) if !secret.trim().is_empty() => (secret.trim().to_string(), false),
        _ => (generate_secret(), true),
    }
}

fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "uptrail.db");
        assert_eq!(cfg.failure_threshold, 1);
        assert_eq!(cfg.notifier_timeout, Duration::from_secs(10));
        assert_eq!(cfg.remove_after_days, 90);
    }

    #[test]
    fn test_generated_secret() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_resolve_secret() {
        assert_eq!(resolve_secret(Some(" s3cret ".into())), ("s3cret".to_string(), false));

        for configured in [None, Some(String::new()), Some("   ".into())] {
            let (secret, generated) = resolve_secret(configured);
            assert!(generated);
            assert_eq!(secret.len(), 32);
        }
    }
}
