//! Local command execution.
//!
//! The command runs under `sh -c` with the event exposed through
//! `UPTRAIL_*` environment variables.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

use super::{Event, FieldSpec, Notifier, NotifyError};
use crate::db::NotifierConfig;

const FIELDS: &[FieldSpec] = &[
    FieldSpec { key: "command", title: "Shell Command", required: true, secret: false },
];

pub struct CommandNotifier;

#[async_trait]
impl Notifier for CommandNotifier {
    fn method(&self) -> &'static str {
        "command"
    }

    fn title(&self) -> &'static str {
        "Shell Command"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    async fn send(&self, config: &NotifierConfig, event: &Event) -> Result<(), NotifyError> {
        let command = config
            .field("command")
            .ok_or_else(|| NotifyError::MissingField("command".to_string()))?;

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("UPTRAIL_EVENT", event.kind.as_str())
            .env("UPTRAIL_SERVICE_ID", event.service_id.to_string())
            .env("UPTRAIL_SERVICE_NAME", &event.service_name)
            .env("UPTRAIL_SERVICE_ADDRESS", &event.address)
            .env("UPTRAIL_MESSAGE", event.message())
            .env("UPTRAIL_ISSUE", event.issue.as_deref().unwrap_or(""))
            .env("UPTRAIL_TIME", event.time.to_rfc3339())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| NotifyError::Delivery(format!("failed to spawn command: {}", e)))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(NotifyError::Delivery(format!(
            "command exited with {}: {}",
            output.status,
            stderr.trim().chars().take(200).collect::<String>()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: &str) -> NotifierConfig {
        let mut cfg = NotifierConfig::new("command");
        cfg.fields.insert("command".into(), command.into());
        cfg
    }

    #[tokio::test]
    async fn test_command_sees_event_env() {
        let cfg = config(r#"test "$UPTRAIL_EVENT" = test && test "$UPTRAIL_SERVICE_NAME" = "Test Service""#);
        tokio_test::assert_ok!(CommandNotifier.test(&cfg).await);
    }

    #[tokio::test]
    async fn test_command_failure_reports_stderr() {
        let cfg = config("echo broken >&2; exit 3");
        match CommandNotifier.test(&cfg).await {
            Err(NotifyError::Delivery(msg)) => assert!(msg.contains("broken")),
            other => panic!("expected delivery error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_required() {
        let err = CommandNotifier.test(&config("   ")).await.unwrap_err();
        assert_eq!(err, NotifyError::MissingField("command".into()));
    }
}
