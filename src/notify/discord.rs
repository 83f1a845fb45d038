//! Discord webhook.

use async_trait::async_trait;
use serde_json::json;

use super::{deliver, validate_url, Event, FieldSpec, Notifier, NotifyError};
use crate::db::NotifierConfig;

/// Discord rejects longer message content.
const MAX_CONTENT: usize = 2000;

const FIELDS: &[FieldSpec] = &[
    FieldSpec { key: "webhook_url", title: "Webhook URL", required: true, secret: true },
    FieldSpec { key: "username", title: "Display Name", required: false, secret: false },
];

pub struct DiscordNotifier {
    client: reqwest::Client,
}

impl DiscordNotifier {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    fn method(&self) -> &'static str {
        "discord"
    }

    fn title(&self) -> &'static str {
        "Discord"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn validate(&self, config: &NotifierConfig) -> Result<(), NotifyError> {
        validate_url(config, "webhook_url").map(|_| ())
    }

    async fn send(&self, config: &NotifierConfig, event: &Event) -> Result<(), NotifyError> {
        let url = validate_url(config, "webhook_url")?;

        let content: String = event.message().chars().take(MAX_CONTENT).collect();
        let mut payload = json!({ "content": content });
        if let Some(username) = config.field("username") {
            payload["username"] = json!(username);
        }

        deliver(self.client.post(url).json(&payload)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::sample_service;
    use chrono::Utc;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_discord_down_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/webhooks/1/abc"))
            .and(body_json(json!({ "content": "shop is down: connection refused: 10.0.0.1:80" })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let mut cfg = NotifierConfig::new("discord");
        cfg.fields.insert("webhook_url".into(), format!("{}/api/webhooks/1/abc", server.uri()));

        let event = Event::down(
            &sample_service("shop"),
            Utc::now(),
            "connection refused: 10.0.0.1:80".into(),
        );
        let notifier = DiscordNotifier::new(reqwest::Client::new());
        tokio_test::assert_ok!(notifier.send(&cfg, &event).await);
    }

    #[tokio::test]
    async fn test_discord_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let mut cfg = NotifierConfig::new("discord");
        cfg.fields.insert("webhook_url".into(), server.uri());

        let notifier = DiscordNotifier::new(reqwest::Client::new());
        assert!(matches!(notifier.test(&cfg).await, Err(NotifyError::Delivery(_))));
    }
}
