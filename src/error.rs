//! Errors surfaced by the engine to its callers.

use crate::aggregate::AggregateError;
use crate::db::DbError;
use crate::notify::NotifyError;

use thiserror::Error;

/// Engine error types. Probe failures are recorded as data and never appear here.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("storage error: {0}")]
    Storage(DbError),
    #[error("{0}")]
    NotifierDelivery(NotifyError),
}

impl From<DbError> for CoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound => CoreError::NotFound("record".to_string()),
            other => CoreError::Storage(other),
        }
    }
}

impl From<AggregateError> for CoreError {
    fn from(e: AggregateError) -> Self {
        match e {
            AggregateError::Storage(db) => db.into(),
            other => CoreError::Validation(other.to_string()),
        }
    }
}

impl From<NotifyError> for CoreError {
    fn from(e: NotifyError) -> Self {
        match e {
            NotifyError::UnknownMethod(method) => CoreError::NotFound(format!("notifier {}", method)),
            NotifyError::MissingField(_) | NotifyError::InvalidField { .. } => {
                CoreError::Validation(e.to_string())
            }
            NotifyError::Delivery(_) | NotifyError::Timeout(_) => CoreError::NotifierDelivery(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_mapping() {
        assert!(matches!(CoreError::from(DbError::NotFound), CoreError::NotFound(_)));
        assert!(matches!(CoreError::from(DbError::Poisoned), CoreError::Storage(_)));
        assert!(matches!(
            CoreError::from(AggregateError::InvalidGroup("x".into())),
            CoreError::Validation(_)
        ));
        assert!(matches!(
            CoreError::from(AggregateError::Storage(DbError::Poisoned)),
            CoreError::Storage(_)
        ));
        assert!(matches!(
            CoreError::from(NotifyError::UnknownMethod("fax".into())),
            CoreError::NotFound(_)
        ));
        assert!(matches!(
            CoreError::from(NotifyError::MissingField("url".into())),
            CoreError::Validation(_)
        ));
        assert!(matches!(
            CoreError::from(NotifyError::Timeout(Duration::from_secs(1))),
            CoreError::NotifierDelivery(_)
        ));
        assert_eq!(CoreError::NotAuthenticated.to_string(), "not authenticated");
    }
}
