use serde::Serialize;

use run_protocol::{RunEvent, RunProgress, RunTotals};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub total_tests: Option<u32>,
    pub completed_tests: Option<u32>,
    pub passed_tests: Option<u32>,
    pub failed_tests: Option<u32>,
    pub percent: f64,
    pub is_terminal: bool,
}

impl ProgressSnapshot {
    pub fn new(
        total_tests: Option<u32>,
        completed_tests: Option<u32>,
        passed_tests: Option<u32>,
        failed_tests: Option<u32>,
        is_terminal: bool,
    ) -> Self {
        let completed_tests = match (passed_tests, failed_tests) {
            (Some(passed), Some(failed)) => Some(passed.saturating_add(failed)),
            _ => completed_tests,
        };
        Self {
            total_tests,
            completed_tests,
            passed_tests,
            failed_tests,
            percent: percent_of(completed_tests, total_tests),
            is_terminal,
        }
    }

    /// Snapshot of a finished run built from its authoritative totals.
    pub fn terminal(totals: &RunTotals) -> Self {
        Self::new(
            Some(totals.total_tests),
            None,
            Some(totals.passed_tests),
            Some(totals.failed_tests),
            true,
        )
    }

    pub fn failed_count(&self) -> u32 {
        self.failed_tests.unwrap_or(0)
    }
}

/// Reported counters are cumulative and overwrite the previous value. A
/// terminal snapshot never changes again.
pub fn reduce(current: &ProgressSnapshot, event: &RunEvent) -> ProgressSnapshot {
    if current.is_terminal {
        return *current;
    }
    match event {
        RunEvent::ProgressDelta(delta) => apply_delta(current, delta),
        RunEvent::RunCompleted(totals) => ProgressSnapshot::terminal(totals),
        RunEvent::LogLine { .. } | RunEvent::TestResult(_) => *current,
    }
}

fn apply_delta(current: &ProgressSnapshot, delta: &RunProgress) -> ProgressSnapshot {
    ProgressSnapshot::new(
        delta.total_tests.or(current.total_tests),
        delta.completed_tests.or(current.completed_tests),
        delta.passed_tests.or(current.passed_tests),
        delta.failed_tests.or(current.failed_tests),
        false,
    )
}

fn percent_of(completed: Option<u32>, total: Option<u32>) -> f64 {
    match (completed, total) {
        (Some(completed), Some(total)) if total > 0 => {
            (f64::from(completed) / f64::from(total) * 100.0).clamp(0.0, 100.0)
        }
        _ => 0.0,
    }
}
