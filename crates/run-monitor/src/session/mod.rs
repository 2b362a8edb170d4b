mod model;

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use run_protocol::{RunEvent, RunId, RunProgress, RunStatus, RunSummary, RunTotals};

use crate::aggregator::{reduce, ProgressSnapshot};
use crate::api::{with_timeout, RunApi};
use crate::channel::{ChannelEvent, ChannelStatus, EventChannel, EventKind, HandlerId, Subscription};
use crate::config::{MonitorConfig, RunDefaults};
use crate::error::{MonitorError, Result};
use crate::history::RunHistoryView;
use crate::log_buffer::{LogBuffer, LogEntry};

pub use model::{ConnectionIndicator, RunSelection, SessionState, SessionUpdate};

const UPDATE_CAPACITY: usize = 256;
const RUN_EVENT_KINDS: [EventKind; 4] = [
    EventKind::LogLine,
    EventKind::TestResult,
    EventKind::ProgressDelta,
    EventKind::RunCompleted,
];

struct SessionCore {
    state: SessionState,
    run_id: Option<RunId>,
    snapshot: ProgressSnapshot,
    logs: LogBuffer,
    connection: ConnectionIndicator,
    last_error: Option<String>,
    /// Bumped by every start/resume; callbacks from an older run compare
    /// against it and bail out.
    generation: u64,
}

impl SessionCore {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.state == SessionState::Running
    }

    fn begin(&mut self, state: SessionState, run_id: Option<RunId>) -> u64 {
        self.generation += 1;
        self.state = state;
        self.snapshot = ProgressSnapshot::default();
        self.logs.clear();
        self.last_error = None;
        self.run_id = run_id;
        self.generation
    }
}

struct SessionShared {
    api: Arc<dyn RunApi>,
    channel: EventChannel,
    history: Option<Arc<RunHistoryView>>,
    request_timeout: Duration,
    defaults: RunDefaults,
    core: Mutex<SessionCore>,
    updates: broadcast::Sender<SessionUpdate>,
    connection_handlers: Mutex<Vec<HandlerId>>,
    /// Topic subscription of the followed run, tagged with its generation.
    subscription: Mutex<Option<(u64, Subscription)>>,
}

/// Outcome of folding one event, applied after the core lock is released.
#[derive(Default)]
struct Effects {
    updates: Vec<SessionUpdate>,
    finished: Option<RunId>,
}

impl SessionShared {
    fn publish(&self, updates: Vec<SessionUpdate>) {
        for update in updates {
            // No receivers is fine; the getters still reflect the state.
            let _ = self.updates.send(update);
        }
    }

    fn apply(&self, generation: u64, effects: Effects) {
        let Effects { updates, finished } = effects;
        self.publish(updates);
        if finished.is_some() {
            self.release(Some(generation));
            self.refresh_history();
        }
    }

    /// Releases the held subscription; with a generation, only if it belongs
    /// to that run.
    fn release(&self, generation: Option<u64>) {
        let held = {
            let mut slot = self.subscription.lock();
            let stale = matches!(
                (slot.as_ref(), generation),
                (Some((held, _)), Some(generation)) if *held != generation
            );
            if stale {
                None
            } else {
                slot.take()
            }
        };
        if let Some((_, subscription)) = held {
            self.channel.leave(subscription);
        }
    }

    fn on_run_event(&self, generation: u64, event: &RunEvent) {
        let effects = {
            let mut core = self.core.lock();
            if !core.is_current(generation) {
                return;
            }
            fold_event(&mut core, event)
        };
        self.apply(generation, effects);
    }

    /// Applies a backend run record fetched after a reconnect or on resume.
    fn on_summary(&self, generation: u64, summary: &RunSummary, adopt_counts: bool) {
        let effects = {
            let mut core = self.core.lock();
            if !core.is_current(generation) {
                return;
            }
            match summary.status {
                RunStatus::Running if adopt_counts => fold_event(
                    &mut core,
                    &RunEvent::ProgressDelta(RunProgress {
                        total_tests: Some(summary.total_tests),
                        completed_tests: None,
                        passed_tests: Some(summary.passed_tests),
                        failed_tests: Some(summary.failed_tests),
                    }),
                ),
                RunStatus::Running => Effects::default(),
                RunStatus::Completed | RunStatus::Failed => finish(
                    &mut core,
                    &RunTotals::new(
                        summary.total_tests,
                        summary.passed_tests,
                        summary.failed_tests,
                    ),
                    SessionState::from_run_status(summary.status),
                ),
                RunStatus::Cancelled => {
                    core.state = SessionState::Cancelled;
                    Effects {
                        updates: vec![SessionUpdate::State {
                            state: SessionState::Cancelled,
                        }],
                        finished: core.run_id.clone(),
                    }
                }
            }
        };
        if let Some(run_id) = effects.finished.as_ref() {
            info!(
                event = "session.reconciled",
                run_id = %run_id,
                status = %summary.status,
                "run finished while disconnected"
            );
        }
        self.apply(generation, effects);
    }

    fn on_connection(self: &Arc<Self>, event: &ChannelEvent) {
        let indicator = match event {
            ChannelEvent::Connected => ConnectionIndicator::Live,
            ChannelEvent::Reconnecting { .. } => ConnectionIndicator::Reconnecting,
            ChannelEvent::Run(_) => return,
        };
        let running = {
            let mut core = self.core.lock();
            let changed = core.connection != indicator;
            core.connection = indicator;
            let running = match (&core.state, &core.run_id) {
                (SessionState::Running, Some(run_id)) => Some((core.generation, run_id.clone())),
                _ => None,
            };
            if !changed {
                return;
            }
            running
        };
        self.publish(vec![SessionUpdate::Connection { indicator }]);
        if indicator == ConnectionIndicator::Live {
            if let Some((generation, run_id)) = running {
                debug!(run_id = %run_id, "reconciling run after reconnect");
                spawn_reconcile(Arc::downgrade(self), generation, run_id);
            }
        }
    }

    /// Joins the run topic, replacing the subscription of a previous run.
    fn attach(self: &Arc<Self>, run_id: &RunId, generation: u64) {
        let subscription = self.channel.join(run_id);
        for kind in RUN_EVENT_KINDS {
            let weak = Arc::downgrade(self);
            self.channel.on_topic(&subscription, kind, move |event| {
                if let (Some(shared), Some(run_event)) = (weak.upgrade(), event.run_event()) {
                    shared.on_run_event(generation, run_event);
                }
            });
        }
        let previous = self.subscription.lock().replace((generation, subscription));
        if let Some((_, previous)) = previous {
            self.channel.leave(previous);
        }
    }

    fn refresh_history(&self) {
        let Some(history) = self.history.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = history.refresh().await {
                warn!(event = "history.refresh.failed", error = %err, "run history refresh failed");
            }
        });
    }

    fn record_error(&self, err: &MonitorError, state: Option<SessionState>) {
        let message = err.to_string();
        let mut updates = Vec::new();
        {
            let mut core = self.core.lock();
            core.last_error = Some(message.clone());
            if let Some(state) = state {
                core.state = state;
                updates.push(SessionUpdate::State { state });
            }
        }
        updates.push(SessionUpdate::Error { message });
        self.publish(updates);
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        for id in self.connection_handlers.get_mut().drain(..) {
            self.channel.off(id);
        }
        if let Some((_, subscription)) = self.subscription.get_mut().take() {
            self.channel.leave(subscription);
        }
    }
}

fn fold_event(core: &mut SessionCore, event: &RunEvent) -> Effects {
    match event {
        RunEvent::LogLine { text } => Effects {
            updates: vec![SessionUpdate::Log {
                entry: core.logs.append(text.clone()),
            }],
            finished: None,
        },
        RunEvent::TestResult(result) => Effects {
            updates: vec![SessionUpdate::Log {
                entry: core.logs.append(result.describe()),
            }],
            finished: None,
        },
        RunEvent::ProgressDelta(_) => {
            let next = reduce(&core.snapshot, event);
            if next == core.snapshot {
                return Effects::default();
            }
            core.snapshot = next;
            Effects {
                updates: vec![SessionUpdate::Progress { snapshot: next }],
                finished: None,
            }
        }
        RunEvent::RunCompleted(totals) => {
            let state = if totals.failed_tests == 0 {
                SessionState::Completed
            } else {
                SessionState::Failed
            };
            finish(core, totals, state)
        }
    }
}

fn finish(core: &mut SessionCore, totals: &RunTotals, state: SessionState) -> Effects {
    core.snapshot = reduce(&core.snapshot, &RunEvent::RunCompleted(totals.clone()));
    core.state = state;
    if let Some(run_id) = core.run_id.as_ref() {
        info!(
            event = "session.finished",
            run_id = %run_id,
            state = %state,
            total = totals.total_tests,
            passed = totals.passed_tests,
            failed = totals.failed_tests,
            "run finished"
        );
    }
    let entry = core.logs.append(format!(
        "Test run completed: {} passed, {} failed",
        totals.passed_tests, totals.failed_tests
    ));
    Effects {
        updates: vec![
            SessionUpdate::Log { entry },
            SessionUpdate::Progress {
                snapshot: core.snapshot,
            },
            SessionUpdate::State { state },
        ],
        finished: core.run_id.clone(),
    }
}

fn spawn_reconcile(weak: Weak<SessionShared>, generation: u64, run_id: RunId) {
    tokio::spawn(async move {
        let Some((api, limit)) = weak
            .upgrade()
            .map(|shared| (Arc::clone(&shared.api), shared.request_timeout))
        else {
            return;
        };
        match with_timeout("run status", limit, api.get_run(&run_id)).await {
            Ok(summary) => {
                if let Some(shared) = weak.upgrade() {
                    shared.on_summary(generation, &summary, false);
                }
            }
            Err(err) => warn!(
                event = "session.reconcile.failed",
                run_id = %run_id,
                error = %err,
                "run status fetch failed, relying on live events"
            ),
        }
    });
}

/// Drives one run at a time against the run API and the push channel.
/// Observers subscribe to [`SessionUpdate`]s; the getters return copies.
pub struct RunSession {
    shared: Arc<SessionShared>,
}

impl RunSession {
    pub fn new(
        api: Arc<dyn RunApi>,
        channel: EventChannel,
        history: Option<Arc<RunHistoryView>>,
        config: &MonitorConfig,
    ) -> Self {
        let connection = match channel.status() {
            ChannelStatus::Connected => ConnectionIndicator::Live,
            _ => ConnectionIndicator::Reconnecting,
        };
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let shared = Arc::new(SessionShared {
            api,
            channel,
            history,
            request_timeout: config.request_timeout(),
            defaults: config.run.clone(),
            core: Mutex::new(SessionCore {
                state: SessionState::Idle,
                run_id: None,
                snapshot: ProgressSnapshot::default(),
                logs: LogBuffer::new(),
                connection,
                last_error: None,
                generation: 0,
            }),
            updates,
            connection_handlers: Mutex::new(Vec::new()),
            subscription: Mutex::new(None),
        });
        let ids: Vec<HandlerId> = [EventKind::Connected, EventKind::Reconnecting]
            .into_iter()
            .map(|kind| {
                let weak = Arc::downgrade(&shared);
                shared.channel.on(kind, move |event| {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_connection(event);
                    }
                })
            })
            .collect();
        *shared.connection_handlers.lock() = ids;
        Self { shared }
    }

    /// Requests a new run and starts following it. Allowed from `Idle` or a
    /// terminal state; buffers of the previous run are discarded.
    pub async fn start(&self, selection: RunSelection) -> Result<RunId> {
        selection.validate()?;
        let shared = &self.shared;
        let generation = {
            let mut core = shared.core.lock();
            if !core.state.can_start() {
                return Err(MonitorError::InvalidState {
                    operation: "start",
                    state: core.state,
                });
            }
            core.begin(SessionState::Starting, None)
        };
        shared.release(None);
        shared.publish(vec![
            SessionUpdate::State {
                state: SessionState::Starting,
            },
            SessionUpdate::Progress {
                snapshot: ProgressSnapshot::default(),
            },
        ]);

        let request = selection.to_request(&shared.defaults);
        info!(
            event = "session.start",
            run_name = %request.run_name,
            suites = request.test_suite_ids.len(),
            "requesting test run"
        );
        let created = with_timeout(
            "run creation",
            shared.request_timeout,
            shared.api.create_run(&request),
        )
        .await;
        let run_id = match created {
            Ok(run_id) => run_id,
            Err(err) => {
                warn!(event = "session.start.failed", error = %err, "run creation failed");
                shared.record_error(&err, Some(SessionState::Idle));
                return Err(err);
            }
        };
        {
            let mut core = shared.core.lock();
            core.run_id = Some(run_id.clone());
            core.state = SessionState::Running;
        }
        shared.attach(&run_id, generation);
        shared.publish(vec![SessionUpdate::State {
            state: SessionState::Running,
        }]);
        info!(event = "session.running", run_id = %run_id, "test run started");
        Ok(run_id)
    }

    /// Requests cancellation of the running run. A `RunCompleted` that
    /// arrives before the cancel response wins and the session keeps its
    /// completed state.
    pub async fn cancel(&self) -> Result<()> {
        let shared = &self.shared;
        let (generation, run_id) = {
            let core = shared.core.lock();
            match (&core.state, &core.run_id) {
                (SessionState::Running, Some(run_id)) => (core.generation, run_id.clone()),
                _ => {
                    return Err(MonitorError::InvalidState {
                        operation: "cancel",
                        state: core.state,
                    })
                }
            }
        };
        info!(event = "session.cancel", run_id = %run_id, "cancelling test run");
        let result = with_timeout(
            "run cancel",
            shared.request_timeout,
            shared.api.cancel_run(&run_id),
        )
        .await;
        if let Err(err) = result {
            warn!(event = "session.cancel.failed", run_id = %run_id, error = %err, "cancel failed");
            shared.record_error(&err, None);
            return Err(err);
        }
        let cancelled = {
            let mut core = shared.core.lock();
            if core.is_current(generation) {
                core.state = SessionState::Cancelled;
                true
            } else {
                false
            }
        };
        if cancelled {
            shared.apply(
                generation,
                Effects {
                    updates: vec![SessionUpdate::State {
                        state: SessionState::Cancelled,
                    }],
                    finished: Some(run_id),
                },
            );
        } else {
            debug!(run_id = %run_id, "run finished before cancel was acknowledged");
        }
        Ok(())
    }

    /// Attaches to a run that is already known to the backend, e.g. after a
    /// restart. A run that already finished is shown with its final totals
    /// and no topic is joined.
    pub async fn resume(&self, run_id: RunId) -> Result<()> {
        let shared = &self.shared;
        {
            let core = shared.core.lock();
            if !core.state.can_start() {
                return Err(MonitorError::InvalidState {
                    operation: "resume",
                    state: core.state,
                });
            }
        }
        let summary = with_timeout(
            "run status",
            shared.request_timeout,
            shared.api.get_run(&run_id),
        )
        .await
        .map_err(|err| {
            shared.record_error(&err, None);
            err
        })?;

        let generation = {
            let mut core = shared.core.lock();
            if !core.state.can_start() {
                return Err(MonitorError::InvalidState {
                    operation: "resume",
                    state: core.state,
                });
            }
            core.begin(SessionState::Running, Some(run_id.clone()))
        };
        shared.publish(vec![SessionUpdate::State {
            state: SessionState::Running,
        }]);
        info!(
            event = "session.resume",
            run_id = %run_id,
            status = %summary.status,
            "resuming test run"
        );
        if summary.status.is_terminal() {
            shared.release(None);
        } else {
            shared.attach(&run_id, generation);
        }
        shared.on_summary(generation, &summary, true);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.shared.updates.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.shared.core.lock().state
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.shared.core.lock().run_id.clone()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.shared.core.lock().snapshot
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.shared.core.lock().logs.snapshot()
    }

    pub fn logs_since(&self, sequence_no: u64) -> Vec<LogEntry> {
        self.shared.core.lock().logs.since(sequence_no).to_vec()
    }

    pub fn connection(&self) -> ConnectionIndicator {
        self.shared.core.lock().connection
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.core.lock().last_error.clone()
    }

    pub fn channel(&self) -> &EventChannel {
        &self.shared.channel
    }
}
