//! Error types for voxagent.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoxError {
    // Configuration errors
    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("No LLM provider credentials found (tried: {})", tried.join(", "))]
    NoLlmCredentials { tried: Vec<String> },

    // Service errors
    #[error("{service} service unavailable: {message}")]
    ServiceUnavailable { service: String, message: String },

    // Stream errors
    #[error("Stream integrity violation in {stage}: {message}")]
    StreamIntegrity { stage: String, message: String },

    #[error("Turn analyzer did not respond within {timeout_ms}ms")]
    TurnDetectionTimeout { timeout_ms: u64 },

    #[error("Cancellation raced with {operation}")]
    CancellationRace { operation: String },

    // Task lifecycle errors
    #[error("Task is not accepting frames (status: {status})")]
    TaskNotRunning { status: String },

    #[error("Pipeline requires at least one stage")]
    EmptyPipeline,

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl VoxError {
    /// Shorthand for a [`VoxError::ServiceUnavailable`].
    pub fn unavailable(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            message: message.into(),
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoxError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_invalid_value_display() {
        let error = VoxError::ConfigInvalidValue {
            key: "session.audio_out_sample_rate".to_string(),
            message: "must be positive".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for session.audio_out_sample_rate: must be positive"
        );
    }

    #[test]
    fn test_no_llm_credentials_lists_tried_providers() {
        let error = VoxError::NoLlmCredentials {
            tried: vec!["CEREBRAS_API_KEY".to_string(), "GOOGLE_API_KEY".to_string()],
        };
        assert_eq!(
            error.to_string(),
            "No LLM provider credentials found (tried: CEREBRAS_API_KEY, GOOGLE_API_KEY)"
        );
    }

    #[test]
    fn test_service_unavailable_display() {
        let error = VoxError::unavailable("llm", "connection refused");
        assert_eq!(
            error.to_string(),
            "llm service unavailable: connection refused"
        );
    }

    #[test]
    fn test_stream_integrity_display() {
        let error = VoxError::StreamIntegrity {
            stage: "LocalTransportInput".to_string(),
            message: "empty audio chunk".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Stream integrity violation in LocalTransportInput: empty audio chunk"
        );
    }

    #[test]
    fn test_turn_detection_timeout_display() {
        let error = VoxError::TurnDetectionTimeout { timeout_ms: 500 };
        assert_eq!(
            error.to_string(),
            "Turn analyzer did not respond within 500ms"
        );
    }

    #[test]
    fn test_task_not_running_display() {
        let error = VoxError::TaskNotRunning {
            status: "cancelling".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Task is not accepting frames (status: cancelling)"
        );
    }

    #[test]
    fn test_io_error_from_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: VoxError = io_error.into();
        assert!(matches!(error, VoxError::Io(_)));
        assert!(error.to_string().starts_with("I/O error:"));
    }

    #[test]
    fn test_toml_error_from_conversion() {
        let parse_error = toml::from_str::<toml::Table>("not = [valid").unwrap_err();
        let error: VoxError = parse_error.into();
        assert!(matches!(error, VoxError::Config(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(returns_result().unwrap(), 42);
    }
}
