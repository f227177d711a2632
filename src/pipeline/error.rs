//! Error types for pipeline stages.

use crate::error::VoxError;
use std::fmt;

/// Errors that can occur while a stage handles a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// The stage absorbed the failure and keeps processing.
    Recoverable(String),
    /// The session cannot continue; the task fails.
    Fatal(String),
}

impl StageError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageError::Fatal(_))
    }

    pub fn message(&self) -> &str {
        match self {
            StageError::Recoverable(msg) | StageError::Fatal(msg) => msg,
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::Recoverable(msg) => write!(f, "Recoverable error: {}", msg),
            StageError::Fatal(msg) => write!(f, "Fatal error: {}", msg),
        }
    }
}

impl std::error::Error for StageError {}

impl From<VoxError> for StageError {
    /// Service outages are fatal; malformed input and analyzer timeouts are not.
    fn from(error: VoxError) -> Self {
        match error {
            VoxError::StreamIntegrity { .. } | VoxError::TurnDetectionTimeout { .. } => {
                StageError::Recoverable(error.to_string())
            }
            other => StageError::Fatal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_display() {
        let recoverable = StageError::Recoverable("temporary failure".to_string());
        assert_eq!(
            recoverable.to_string(),
            "Recoverable error: temporary failure"
        );

        let fatal = StageError::Fatal("critical failure".to_string());
        assert_eq!(fatal.to_string(), "Fatal error: critical failure");
    }

    #[test]
    fn test_service_unavailable_is_fatal() {
        let error: StageError = VoxError::unavailable("tts", "503").into();
        assert!(error.is_fatal());
        assert_eq!(error.message(), "tts service unavailable: 503");
    }

    #[test]
    fn test_stream_integrity_is_recoverable() {
        let error: StageError = VoxError::StreamIntegrity {
            stage: "input".into(),
            message: "empty chunk".into(),
        }
        .into();
        assert!(!error.is_fatal());
    }
}
