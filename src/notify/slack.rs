//! Slack incoming webhook.

use async_trait::async_trait;
use serde_json::json;

use super::{deliver, validate_url, Event, FieldSpec, Notifier, NotifyError};
use crate::db::NotifierConfig;

const FIELDS: &[FieldSpec] = &[
    FieldSpec { key: "webhook_url", title: "Incoming Webhook URL", required: true, secret: true },
    FieldSpec { key: "username", title: "Display Name", required: false, secret: false },
];

pub struct SlackNotifier {
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn method(&self) -> &'static str {
        "slack"
    }

    fn title(&self) -> &'static str {
        "Slack"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn validate(&self, config: &NotifierConfig) -> Result<(), NotifyError> {
        validate_url(config, "webhook_url").map(|_| ())
    }

    async fn send(&self, config: &NotifierConfig, event: &Event) -> Result<(), NotifyError> {
        let url = validate_url(config, "webhook_url")?;

        let mut payload = json!({ "text": event.message() });
        if let Some(username) = config.field("username") {
            payload["username"] = json!(username);
        }

        deliver(self.client.post(url).json(&payload)).await
    }
}
