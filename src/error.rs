use serde::Serialize;
use thiserror::Error;

/// A single rejected configuration field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Every problem found in a candidate configuration, reported together.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid automation config: {}", describe(.0))]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn contains(&self, field: &str) -> bool {
        self.0.iter().any(|e| e.field == field)
    }

    pub fn fields(&self) -> Vec<&'static str> {
        self.0.iter().map(|e| e.field).collect()
    }
}

fn describe(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors returned synchronously by the automation controller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error("fee automation is already running")]
    AlreadyRunning,

    #[error("fee automation is not running")]
    NotRunning,

    #[error("a fee update pass is already in progress")]
    PassInProgress,

    #[error("channel {0} not found")]
    ChannelNotFound(String),

    #[error("channel provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for ControlError {
    fn from(err: anyhow::Error) -> Self {
        ControlError::Storage(format!("{:#}", err))
    }
}

/// Why a single channel's fee update did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("timed out")]
    Timeout,

    #[error("node rejected update: {0}")]
    Node(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_display_lists_every_field() {
        let errors = ValidationErrors(vec![
            FieldError::new("update_interval_secs", "must be at least 60"),
            FieldError::new("flow_weight", "weights must sum to 1.0"),
        ]);
        let text = errors.to_string();
        assert!(text.contains("update_interval_secs: must be at least 60"));
        assert!(text.contains("flow_weight: weights must sum to 1.0"));
        assert!(errors.contains("flow_weight"));
        assert!(!errors.contains("strategy"));
    }

    #[test]
    fn test_validation_converts_into_control_error() {
        let errors = ValidationErrors(vec![FieldError::new("strategy", "unknown")]);
        let err: ControlError = errors.clone().into();
        assert_eq!(err, ControlError::Validation(errors));
    }
}
