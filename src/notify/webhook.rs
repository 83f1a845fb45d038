//! Generic HTTP webhook.

use async_trait::async_trait;
use reqwest::Method;

use super::{deliver, render_template, validate_url, Event, FieldSpec, Notifier, NotifyError};
use crate::db::NotifierConfig;

const FIELDS: &[FieldSpec] = &[
    FieldSpec { key: "url", title: "Webhook URL", required: true, secret: false },
    FieldSpec { key: "method", title: "HTTP Method", required: false, secret: false },
    FieldSpec { key: "body", title: "Body Template", required: false, secret: false },
    FieldSpec { key: "content_type", title: "Content Type", required: false, secret: false },
    FieldSpec { key: "authorization", title: "Authorization Header", required: false, secret: true },
];

/// Calls an arbitrary URL. Without a body template the event is sent as JSON.
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn method_of(config: &NotifierConfig) -> Result<Method, NotifyError> {
    let raw = config.field("method").unwrap_or("POST").to_ascii_uppercase();
    Method::from_bytes(raw.as_bytes()).map_err(|_| NotifyError::InvalidField {
        field: "method".to_string(),
        reason: format!("{:?} is not an HTTP method", raw),
    })
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn method(&self) -> &'static str {
        "webhook"
    }

    fn title(&self) -> &'static str {
        "HTTP Webhook"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn validate(&self, config: &NotifierConfig) -> Result<(), NotifyError> {
        validate_url(config, "url")?;
        method_of(config)?;
        Ok(())
    }

    async fn send(&self, config: &NotifierConfig, event: &Event) -> Result<(), NotifyError> {
        let url = validate_url(config, "url")?;
        let method = method_of(config)?;

        let body = match config.field("body") {
            Some(template) => render_template(template, event),
            None => serde_json::to_string(event).map_err(|e| NotifyError::Delivery(e.to_string()))?,
        };
        let content_type = config.field("content_type").unwrap_or("application/json");

        let mut request = self
            .client
            .request(method.clone(), url)
            .header(reqwest::header::CONTENT_TYPE, content_type);
        if method != Method::GET {
            request = request.body(body);
        }
        if let Some(auth) = config.field("authorization") {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }

        deliver(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: String) -> NotifierConfig {
        let mut config = NotifierConfig::new("webhook");
        config.enabled = true;
        config.fields.insert("url".into(), url);
        config
    }

    #[tokio::test]
    async fn test_webhook_sends_event_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("authorization", "Bearer abc"))
            .and(body_partial_json(serde_json::json!({"kind": "test", "service_name": "Test Service"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let mut cfg = config(format!("{}/hook", server.uri()));
        cfg.fields.insert("authorization".into(), "Bearer abc".into());

        let notifier = WebhookNotifier::new(reqwest::Client::new());
        tokio_test::assert_ok!(notifier.test(&cfg).await);
    }

    #[tokio::test]
    async fn test_webhook_body_template() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(header("content-type", "text/plain"))
            .and(body_string("test: Test Service"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut cfg = config(server.uri());
        cfg.fields.insert("method".into(), "put".into());
        cfg.fields.insert("content_type".into(), "text/plain".into());
        cfg.fields.insert("body".into(), "{{event}}: {{service.name}}".into());

        let notifier = WebhookNotifier::new(reqwest::Client::new());
        tokio_test::assert_ok!(notifier.send(&cfg, &Event::test()).await);
    }

    #[tokio::test]
    async fn test_webhook_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(reqwest::Client::new());
        match notifier.send(&config(server.uri()), &Event::test()).await {
            Err(NotifyError::Delivery(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected delivery error, got {:?}", other),
        }
    }

    #[test]
    fn test_webhook_validate() {
        let notifier = WebhookNotifier::new(reqwest::Client::new());
        assert!(notifier.validate(&NotifierConfig::new("webhook")).is_err());

        let mut cfg = config("https://example.com/hook".into());
        assert!(notifier.validate(&cfg).is_ok());

        cfg.fields.insert("method".into(), "NOT A METHOD".into());
        assert!(matches!(notifier.validate(&cfg), Err(NotifyError::InvalidField { .. })));
    }
}
