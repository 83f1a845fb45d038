//! HTTP probe implementation.

use regex::Regex;
use reqwest::Method;
use std::error::Error as StdError;
use std::time::{Duration, Instant};

use super::{ProbeConfig, ProbeError, Reading};

const SNIPPET_CHARS: usize = 200;

/// Run an HTTP probe for the given configuration.
///
/// `ping` is measured to the response headers, `latency` to the end of the body.
pub async fn run_http_probe(config: &ProbeConfig) -> Result<Reading, ProbeError> {
    let url = if config.address.starts_with("http://") || config.address.starts_with("https://") {
        config.address.clone()
    } else {
        format!("http://{}", config.address)
    };

    let method = Method::from_bytes(config.method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| ProbeError::Config(format!("invalid HTTP method {:?}", config.method)))?;

    let expected = if config.expected.is_empty() {
        None
    } else {
        Some(
            Regex::new(&config.expected)
                .map_err(|e| ProbeError::Config(format!("invalid expected pattern: {}", e)))?,
        )
    };

    let client = reqwest::Client::builder()
        .timeout(config.timeout)
        .build()
        .map_err(|e| ProbeError::Config(e.to_string()))?;

    let mut request = client.request(method, &url);
    if !config.body.is_empty() {
        request = request.body(config.body.clone());
    }

    let start = Instant::now();

    let response = request
        .send()
        .await
        .map_err(|e| classify_reqwest_error(&e, config.timeout))?;
    let ping = start.elapsed();
    let status = response.status().as_u16();

    // Read the full body to measure complete transfer time
    let body = response
        .bytes()
        .await
        .map_err(|e| classify_reqwest_error(&e, config.timeout))?;
    let latency = start.elapsed();

    if config.expected_status != 0 && status != config.expected_status {
        return Err(ProbeError::StatusMismatch {
            expected: config.expected_status,
            actual: status,
        });
    }

    if let Some(pattern) = expected {
        let text = String::from_utf8_lossy(&body);
        if !pattern.is_match(&text) {
            return Err(ProbeError::ContentMismatch {
                expected: config.expected.clone(),
                status,
                snippet: text.chars().take(SNIPPET_CHARS).collect(),
            });
        }
    }

    Ok(Reading { latency, ping })
}

fn classify_reqwest_error(e: &reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        return ProbeError::Timeout(timeout);
    }

    // reqwest wraps hyper and io errors; the useful detail is in the source chain
    let mut detail = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        detail.push_str(": ");
        detail.push_str(&inner.to_string());
        source = inner.source();
    }

    let lower = detail.to_lowercase();
    if lower.contains("dns error")
        || lower.contains("failed to lookup")
        || lower.contains("name or service not known")
        || lower.contains("no such host")
    {
        ProbeError::DnsFailure(detail)
    } else if lower.contains("connection refused") {
        ProbeError::ConnectionRefused(detail)
    } else if e.is_builder() {
        ProbeError::Config(detail)
    } else {
        ProbeError::Network(detail)
    }
}
