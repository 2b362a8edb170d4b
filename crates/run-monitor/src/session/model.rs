use std::fmt;
use std::time::SystemTime;

use serde::Serialize;

use run_protocol::{CreateRunRequest, RunStatus};

use crate::aggregator::ProgressSnapshot;
use crate::config::RunDefaults;
use crate::error::{MonitorError, Result};
use crate::log_buffer::LogEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    /// States from which a new run may be started or resumed.
    pub fn can_start(&self) -> bool {
        *self == SessionState::Idle || self.is_terminal()
    }

    pub(crate) fn from_run_status(status: RunStatus) -> Self {
        match status {
            RunStatus::Running => SessionState::Running,
            RunStatus::Completed => SessionState::Completed,
            RunStatus::Failed => SessionState::Failed,
            RunStatus::Cancelled => SessionState::Cancelled,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionIndicator {
    Live,
    Reconnecting,
}

/// What to run. Unset fields fall back to the configured run defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSelection {
    pub name: Option<String>,
    pub environment: Option<String>,
    pub browser: Option<String>,
    /// Test suite ids handed to the execution backend.
    pub target_ids: Vec<String>,
    pub functional_requirement_id: Option<String>,
}

impl RunSelection {
    pub fn new(target_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            target_ids: target_ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.target_ids.iter().all(|id| id.trim().is_empty()) {
            return Err(MonitorError::Validation(
                "select at least one test suite to run".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn to_request(&self, defaults: &RunDefaults) -> CreateRunRequest {
        let run_name = self
            .name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| {
                format!(
                    "{} - {}",
                    defaults.name_prefix,
                    humantime::format_rfc3339_seconds(SystemTime::now())
                )
            });
        CreateRunRequest {
            run_name,
            environment: non_empty_or(&self.environment, &defaults.environment),
            browser: non_empty_or(&self.browser, &defaults.browser),
            test_suite_ids: self
                .target_ids
                .iter()
                .map(|id| id.trim())
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect(),
            functional_requirement_id: self.functional_requirement_id.clone(),
        }
    }
}

fn non_empty_or(value: &Option<String>, fallback: &str) -> String {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

/// Published to every [`super::RunSession::subscribe`] receiver.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionUpdate {
    State { state: SessionState },
    Progress { snapshot: ProgressSnapshot },
    Log { entry: LogEntry },
    Connection { indicator: ConnectionIndicator },
    Error { message: String },
}
