use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::RunId;

/// Hub targets pushed by the server. Matching is case-insensitive.
pub const TARGET_TEST_UPDATE: &str = "TestUpdate";
pub const TARGET_RECEIVE_TEST_UPDATE: &str = "ReceiveTestUpdate";
pub const TARGET_EXECUTION_LOG: &str = "ExecutionLog";
pub const TARGET_RUN_UPDATED: &str = "TestRunUpdated";
pub const TARGET_RUN_COMPLETED: &str = "TestRunCompleted";
pub const TARGET_RESULT_ADDED: &str = "TestResultAdded";

/// Cumulative counters reported while a run is in progress. Absent fields
/// mean "unchanged", not zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProgress {
    #[serde(default)]
    pub total_tests: Option<u32>,
    #[serde(default)]
    pub completed_tests: Option<u32>,
    #[serde(default)]
    pub passed_tests: Option<u32>,
    #[serde(default)]
    pub failed_tests: Option<u32>,
}

/// Authoritative totals of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTotals {
    #[serde(default, deserialize_with = "crate::null_as_zero")]
    pub total_tests: u32,
    #[serde(default, deserialize_with = "crate::null_as_zero")]
    pub passed_tests: u32,
    #[serde(default, deserialize_with = "crate::null_as_zero")]
    pub failed_tests: u32,
    #[serde(default)]
    pub status: Option<String>,
}

impl RunTotals {
    pub fn new(total_tests: u32, passed_tests: u32, failed_tests: u32) -> Self {
        Self {
            total_tests,
            passed_tests,
            failed_tests,
            status: None,
        }
    }
}

/// Outcome of a single test case, pushed as `TestResultAdded`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultUpdate {
    #[serde(default)]
    pub test_case_name: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl TestResultUpdate {
    pub fn describe(&self) -> String {
        let name = self.test_case_name.as_deref().unwrap_or("unnamed test");
        let mut line = format!("[{}] {}", self.status, name);
        if let Some(duration) = self.duration_ms {
            line.push_str(&format!(" ({duration}ms)"));
        }
        if let Some(error) = self.error_message.as_deref().filter(|e| !e.is_empty()) {
            line.push_str(&format!(": {error}"));
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    LogLine { text: String },
    ProgressDelta(RunProgress),
    RunCompleted(RunTotals),
    TestResult(TestResultUpdate),
}

/// A decoded push event together with the run it names, when the payload
/// carries one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub run_id: Option<RunId>,
    pub event: RunEvent,
}

#[derive(Debug)]
pub enum EventDecodeError {
    UnknownTarget(String),
    MissingPayload { target: String },
    InvalidPayload {
        target: String,
        source: serde_json::Error,
    },
}

impl fmt::Display for EventDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventDecodeError::UnknownTarget(target) => write!(f, "unknown hub target {target}"),
            EventDecodeError::MissingPayload { target } => {
                write!(f, "hub target {target} carried no arguments")
            }
            EventDecodeError::InvalidPayload { target, source } => {
                write!(f, "invalid payload for hub target {target}: {source}")
            }
        }
    }
}

impl std::error::Error for EventDecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EventDecodeError::InvalidPayload { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Decodes one hub invocation into a run event.
pub fn decode_push(target: &str, arguments: &[Value]) -> Result<PushEvent, EventDecodeError> {
    let payload = arguments
        .first()
        .ok_or_else(|| EventDecodeError::MissingPayload {
            target: target.to_string(),
        })?;
    let run_id = payload_run_id(payload);
    let invalid = |source: serde_json::Error| EventDecodeError::InvalidPayload {
        target: target.to_string(),
        source,
    };
    let event = match target.to_ascii_lowercase().as_str() {
        "testupdate" | "receivetestupdate" | "executionlog" => RunEvent::LogLine {
            text: log_text(payload),
        },
        "testrunupdated" => {
            RunEvent::ProgressDelta(serde_json::from_value(payload.clone()).map_err(invalid)?)
        }
        "testruncompleted" => {
            RunEvent::RunCompleted(serde_json::from_value(payload.clone()).map_err(invalid)?)
        }
        "testresultadded" => {
            RunEvent::TestResult(serde_json::from_value(payload.clone()).map_err(invalid)?)
        }
        _ => return Err(EventDecodeError::UnknownTarget(target.to_string())),
    };
    Ok(PushEvent { run_id, event })
}

fn log_text(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        Value::Object(map) => match map.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => payload.to_string(),
        },
        other => other.to_string(),
    }
}

fn payload_run_id(payload: &Value) -> Option<RunId> {
    payload
        .get("testRunId")
        .or_else(|| payload.get("runId"))
        .and_then(|value| match value {
            Value::String(id) if !id.is_empty() => Some(RunId::new(id.clone())),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn target_matching_ignores_case() {
        let upper = decode_push(TARGET_RUN_COMPLETED, &[json!({"totalTests": 3})]).expect("upper");
        let lower = decode_push("testruncompleted", &[json!({"totalTests": 3})]).expect("lower");
        assert_eq!(upper, lower);
        assert_eq!(
            upper.event,
            RunEvent::RunCompleted(RunTotals::new(3, 0, 0))
        );
    }

    #[test]
    fn progress_fields_may_be_absent_or_null() {
        let pushed = decode_push(
            TARGET_RUN_UPDATED,
            &[json!({"status": "Running", "totalTests": 10, "passedTests": null})],
        )
        .expect("decode");
        assert_eq!(
            pushed.event,
            RunEvent::ProgressDelta(RunProgress {
                total_tests: Some(10),
                ..RunProgress::default()
            })
        );
        assert_eq!(pushed.run_id, None);
    }

    #[test]
    fn test_update_falls_back_to_payload_json() {
        let with_message = decode_push(
            TARGET_RECEIVE_TEST_UPDATE,
            &[json!({"testRunId": "r1", "status": "failed", "message": "runner down"})],
        )
        .expect("message");
        assert_eq!(with_message.run_id, Some(RunId::new("r1")));
        assert_eq!(
            with_message.event,
            RunEvent::LogLine {
                text: "runner down".to_string()
            }
        );

        let without_message =
            decode_push(TARGET_TEST_UPDATE, &[json!({"progress": 0})]).expect("json");
        assert_eq!(
            without_message.event,
            RunEvent::LogLine {
                text: "{\"progress\":0}".to_string()
            }
        );

        let plain = decode_push(TARGET_EXECUTION_LOG, &[json!("npm test")]).expect("string");
        assert_eq!(
            plain.event,
            RunEvent::LogLine {
                text: "npm test".to_string()
            }
        );
    }

    #[test]
    fn result_added_describes_outcome() {
        let pushed = decode_push(
            TARGET_RESULT_ADDED,
            &[json!({
                "testCaseName": "login works",
                "status": "Failed",
                "durationMs": 120,
                "errorMessage": "timeout"
            })],
        )
        .expect("decode");
        let RunEvent::TestResult(result) = pushed.event else {
            panic!("expected test result");
        };
        assert_eq!(result.describe(), "[Failed] login works (120ms): timeout");
    }

    #[test]
    fn malformed_payloads_are_reported() {
        assert!(matches!(
            decode_push("SomethingElse", &[json!({})]),
            Err(EventDecodeError::UnknownTarget(_))
        ));
        assert!(matches!(
            decode_push(TARGET_RUN_UPDATED, &[]),
            Err(EventDecodeError::MissingPayload { .. })
        ));
        assert!(matches!(
            decode_push(TARGET_RUN_UPDATED, &[json!({"totalTests": "ten"})]),
            Err(EventDecodeError::InvalidPayload { .. })
        ));
    }
}
