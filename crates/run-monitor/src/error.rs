use std::fmt;

use thiserror::Error;

use crate::session::SessionState;

pub type Result<T> = std::result::Result<T, MonitorError>;

#[derive(Debug, Clone, Error)]
pub enum MonitorError {
    /// Connect or reconnect failure of the push channel.
    #[error("transport error: {0}")]
    Transport(String),

    /// Run creation, cancel or history call rejected or unreachable.
    #[error("{message}")]
    Request {
        status: Option<u16>,
        message: String,
    },

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("config error: {0}")]
    Config(String),
}

impl MonitorError {
    pub fn transport(err: impl fmt::Display) -> Self {
        MonitorError::Transport(err.to_string())
    }

    pub fn request(status: Option<u16>, message: impl Into<String>) -> Self {
        MonitorError::Request {
            status,
            message: message.into(),
        }
    }

    pub(crate) fn timed_out(operation: &str, limit: std::time::Duration) -> Self {
        MonitorError::Request {
            status: None,
            message: format!("{operation} timed out after {}ms", limit.as_millis()),
        }
    }

    /// Request failures and timeouts may be retried by the user.
    pub fn is_retryable(&self) -> bool {
        match self {
            MonitorError::Request { status, .. } => status.map(|code| code >= 500).unwrap_or(true),
            MonitorError::Transport(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn request_error_displays_collaborator_message() {
        let err = MonitorError::request(Some(400), "no test suites selected");
        assert_eq!(err.to_string(), "no test suites selected");
        assert!(!err.is_retryable());
    }

    #[test]
    fn timeouts_are_retryable() {
        let err = MonitorError::timed_out("run creation", Duration::from_secs(5));
        assert_eq!(err.to_string(), "run creation timed out after 5000ms");
        assert!(err.is_retryable());
    }

    #[test]
    fn invalid_state_names_operation() {
        let err = MonitorError::InvalidState {
            operation: "cancel",
            state: SessionState::Idle,
        };
        assert_eq!(err.to_string(), "cannot cancel while session is idle");
        assert!(!MonitorError::Validation("empty".to_string()).is_retryable());
    }
}
