//! Notification channels and the state dispatcher that drives them.
//!
//! A channel is selected by the stored method name. Each one declares the
//! fields it reads from its [`NotifierConfig`], which of those are required
//! and which are secrets that must not leave the server.

mod command;
mod discord;
mod dispatcher;
mod slack;
mod webhook;

pub use command::CommandNotifier;
pub use discord::DiscordNotifier;
pub use dispatcher::*;
pub use slack::SlackNotifier;
pub use webhook::WebhookNotifier;

use crate::db::{NotifierConfig, Service};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Notifier error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NotifyError {
    #[error("unknown notifier {0:?}")]
    UnknownMethod(String),
    #[error("missing required field {0:?}")]
    MissingField(String),
    #[error("invalid field {field:?}: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

/// One configuration field a notifier understands.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FieldSpec {
    pub key: &'static str,
    pub title: &'static str,
    pub required: bool,
    /// Never returned by listings
    pub secret: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Down,
    Recovered,
    Test,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Down => "down",
            EventKind::Recovered => "recovered",
            EventKind::Test => "test",
        }
    }
}

/// What a notifier is asked to deliver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub service_id: i64,
    pub service_name: String,
    pub address: String,
    pub time: DateTime<Utc>,
    /// Failure reason for down events
    pub issue: Option<String>,
    /// Length of the outage for recovery events
    pub downtime_secs: Option<i64>,
}

impl Event {
    pub fn down(service: &Service, time: DateTime<Utc>, issue: String) -> Self {
        Self {
            kind: EventKind::Down,
            service_id: service.id,
            service_name: service.name.clone(),
            address: service.address.clone(),
            time,
            issue: Some(issue),
            downtime_secs: None,
        }
    }

    pub fn recovered(service: &Service, time: DateTime<Utc>, downtime_secs: Option<i64>) -> Self {
        Self {
            kind: EventKind::Recovered,
            service_id: service.id,
            service_name: service.name.clone(),
            address: service.address.clone(),
            time,
            issue: None,
            downtime_secs,
        }
    }

    /// Synthetic event used when an admin tests a channel.
    pub fn test() -> Self {
        Self {
            kind: EventKind::Test,
            service_id: 0,
            service_name: "Test Service".to_string(),
            address: "https://example.com".to_string(),
            time: Utc::now(),
            issue: None,
            downtime_secs: None,
        }
    }

    /// Human readable one-liner.
    pub fn message(&self) -> String {
        match self.kind {
            EventKind::Down => format!(
                "{} is down: {}",
                self.service_name,
                self.issue.as_deref().unwrap_or("unknown error")
            ),
            EventKind::Recovered => match self.downtime_secs {
                Some(secs) => format!(
                    "{} is back online after {}",
                    self.service_name,
                    format_downtime(secs)
                ),
                None => format!("{} is back online", self.service_name),
            },
            EventKind::Test => "Test notification from uptrail".to_string(),
        }
    }
}

fn format_downtime(secs: i64) -> String {
    let secs = secs.max(0);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {}m", h, m)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}

/// A delivery channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Stored method name, e.g. `slack`.
    fn method(&self) -> &'static str;

    fn title(&self) -> &'static str;

    fn fields(&self) -> &'static [FieldSpec];

    /// Check a configuration before it is saved or used.
    fn validate(&self, config: &NotifierConfig) -> Result<(), NotifyError> {
        for spec in self.fields() {
            if spec.required && config.field(spec.key).is_none() {
                return Err(NotifyError::MissingField(spec.key.to_string()));
            }
        }
        Ok(())
    }

    async fn send(&self, config: &NotifierConfig, event: &Event) -> Result<(), NotifyError>;

    /// Deliver a test event with `config`, without any state transition.
    async fn test(&self, config: &NotifierConfig) -> Result<(), NotifyError> {
        self.validate(config)?;
        self.send(config, &Event::test()).await
    }
}

/// Every channel this build can deliver to.
pub fn default_catalog() -> Vec<Arc<dyn Notifier>> {
    let client = reqwest::Client::new();
    vec![
        Arc::new(WebhookNotifier::new(client.clone())),
        Arc::new(SlackNotifier::new(client.clone())),
        Arc::new(DiscordNotifier::new(client)),
        Arc::new(CommandNotifier),
    ]
}

/// Copy of `config` without the notifier's secret fields.
pub fn strip_secrets(notifier: &dyn Notifier, config: &NotifierConfig) -> NotifierConfig {
    let mut stripped = config.clone();
    for spec in notifier.fields().iter().filter(|f| f.secret) {
        stripped.fields.remove(spec.key);
    }
    stripped
}

/// Substitute `{{placeholder}}` tokens with event values.
pub(crate) fn render_template(template: &str, event: &Event) -> String {
    template
        .replace("{{service.id}}", &event.service_id.to_string())
        .replace("{{service.name}}", &event.service_name)
        .replace("{{service.address}}", &event.address)
        .replace("{{event}}", event.kind.as_str())
        .replace("{{message}}", &event.message())
        .replace("{{issue}}", event.issue.as_deref().unwrap_or(""))
        .replace("{{time}}", &event.time.to_rfc3339())
}

/// Require `key` to hold an absolute http(s) URL.
pub(crate) fn validate_url(config: &NotifierConfig, key: &str) -> Result<reqwest::Url, NotifyError> {
    let raw = config
        .field(key)
        .ok_or_else(|| NotifyError::MissingField(key.to_string()))?;
    let url = reqwest::Url::parse(raw).map_err(|e| NotifyError::InvalidField {
        field: key.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(NotifyError::InvalidField {
            field: key.to_string(),
            reason: format!("unsupported scheme {}", other),
        }),
    }
}

/// Send a prepared request and treat non-2xx answers as delivery failures.
pub(crate) async fn deliver(request: reqwest::RequestBuilder) -> Result<(), NotifyError> {
    let response = request
        .send()
        .await
        .map_err(|e| NotifyError::Delivery(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    Err(NotifyError::Delivery(format!(
        "server answered {}: {}",
        status,
        body.chars().take(200).collect::<String>()
    )))
}
