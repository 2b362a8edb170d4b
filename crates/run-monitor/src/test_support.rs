//! In-memory collaborators shared by the unit tests of this crate.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify, Semaphore};

use run_protocol::hub::{self, HubMessage};
use run_protocol::{CreateRunRequest, RunId, RunStatus, RunSummary};

use crate::channel::{Backoff, ChannelOptions, Connector, EventChannel, Transport};
use crate::error::{MonitorError, Result};

const WAIT: Duration = Duration::from_secs(5);

pub(crate) fn log_frame(run_id: &str, text: &str) -> String {
    hub::encode_invocation(
        "ReceiveTestUpdate",
        vec![json!({"testRunId": run_id, "message": text})],
    )
    .expect("encode log")
}

pub(crate) fn progress_frame(run_id: &str, mut payload: Value) -> String {
    payload["testRunId"] = Value::String(run_id.to_string());
    hub::encode_invocation("TestRunUpdated", vec![payload]).expect("encode progress")
}

pub(crate) fn completed_frame(run_id: &str, total: u32, passed: u32, failed: u32) -> String {
    hub::encode_invocation(
        "TestRunCompleted",
        vec![json!({
            "testRunId": run_id,
            "totalTests": total,
            "passedTests": passed,
            "failedTests": failed,
        })],
    )
    .expect("encode completion")
}

pub(crate) fn summary(id: &str, status: RunStatus, total: u32, passed: u32, failed: u32) -> RunSummary {
    RunSummary {
        id: RunId::from(id),
        name: format!("Run {id}"),
        status,
        started_at: "2024-05-01T10:00:00Z".to_string(),
        completed_at: None,
        total_tests: total,
        passed_tests: passed,
        failed_tests: failed,
        environment: None,
        browser: None,
    }
}

enum ConnectPlan {
    Accept,
    Refuse(String),
}

/// Hub double. Every connect attempt of the channel waits until the test
/// either accepts it (yielding a [`FakeLink`]) or refuses it.
pub(crate) struct FakeHub {
    plans: mpsc::UnboundedSender<ConnectPlan>,
    links: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeLink>>,
    connector: Arc<FakeConnector>,
}

impl FakeHub {
    pub(crate) fn new() -> Self {
        let (plans, plan_rx) = mpsc::unbounded_channel();
        let (link_tx, links) = mpsc::unbounded_channel();
        Self {
            plans,
            links: tokio::sync::Mutex::new(links),
            connector: Arc::new(FakeConnector {
                plans: tokio::sync::Mutex::new(plan_rx),
                links: link_tx,
            }),
        }
    }

    pub(crate) fn channel(&self) -> EventChannel {
        EventChannel::connect(
            "ws://hub.test/hubs/testrun",
            Some("token".to_string()),
            self.connector.clone(),
            ChannelOptions {
                backoff: Backoff::new(Duration::from_millis(5), Duration::from_millis(20)),
                keepalive: Duration::from_secs(3600),
            },
        )
    }

    pub(crate) async fn accept(&self) -> FakeLink {
        let _ = self.plans.send(ConnectPlan::Accept);
        tokio::time::timeout(WAIT, async { self.links.lock().await.recv().await })
            .await
            .expect("channel did not connect")
            .expect("connector dropped")
    }

    pub(crate) fn refuse(&self, error: &str) {
        let _ = self.plans.send(ConnectPlan::Refuse(error.to_string()));
    }
}

struct FakeConnector {
    plans: tokio::sync::Mutex<mpsc::UnboundedReceiver<ConnectPlan>>,
    links: mpsc::UnboundedSender<FakeLink>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _url: &str, _token: Option<&str>) -> Result<Box<dyn Transport>> {
        let plan = self.plans.lock().await.recv().await;
        match plan {
            Some(ConnectPlan::Accept) => {
                let (to_client, inbound) = mpsc::unbounded_channel();
                let (outbound, from_client) = mpsc::unbounded_channel();
                let failing = Arc::new(AtomicBool::new(false));
                let _ = self.links.send(FakeLink {
                    to_client: Some(to_client),
                    from_client,
                    failing: Arc::clone(&failing),
                });
                Ok(Box::new(FakeTransport {
                    inbound,
                    outbound,
                    failing,
                }))
            }
            Some(ConnectPlan::Refuse(error)) => Err(MonitorError::Transport(error)),
            None => Err(MonitorError::Transport("hub gone".to_string())),
        }
    }
}

struct FakeTransport {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
    failing: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&mut self, record: String) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MonitorError::Transport("broken pipe".to_string()));
        }
        self.outbound
            .send(record)
            .map_err(|_| MonitorError::Transport("peer gone".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

/// Server side of one accepted connection.
pub(crate) struct FakeLink {
    to_client: Option<mpsc::UnboundedSender<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
    failing: Arc<AtomicBool>,
}

impl FakeLink {
    pub(crate) fn push(&self, frame: String) {
        if let Some(to_client) = self.to_client.as_ref() {
            let _ = to_client.send(frame);
        }
    }

    /// Simulates the server going away; the client sees end of stream.
    pub(crate) fn drop_connection(&mut self) {
        self.to_client = None;
    }

    pub(crate) fn fail_sends(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    /// Next hub invocation sent by the client as `(target, first argument)`,
    /// skipping pings.
    pub(crate) async fn next_invocation(&mut self) -> (String, String) {
        tokio::time::timeout(WAIT, async {
            loop {
                let frame = self.from_client.recv().await.expect("client closed");
                for record in hub::split_records(&frame) {
                    if let Ok(HubMessage::Invocation { target, arguments }) =
                        hub::parse_record(record)
                    {
                        let argument = arguments
                            .first()
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        return (target, argument);
                    }
                }
            }
        })
        .await
        .expect("no invocation from client")
    }

    pub(crate) async fn wait_closed(&mut self) {
        tokio::time::timeout(WAIT, async {
            while self.from_client.recv().await.is_some() {}
        })
        .await
        .expect("client did not close");
    }
}

/// Run API double with scripted responses.
pub(crate) struct FakeRunApi {
    pub(crate) created: Mutex<Vec<CreateRunRequest>>,
    pub(crate) list_calls: AtomicUsize,
    run_ids: Mutex<VecDeque<RunId>>,
    create_error: Mutex<Option<MonitorError>>,
    create_hangs: AtomicBool,
    cancel_error: Mutex<Option<MonitorError>>,
    cancel_holds: AtomicBool,
    cancel_started: Notify,
    cancel_permits: Semaphore,
    list_error: Mutex<Option<MonitorError>>,
    runs: Mutex<Vec<RunSummary>>,
    records: Mutex<HashMap<RunId, RunSummary>>,
}

impl FakeRunApi {
    pub(crate) fn new() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            list_calls: AtomicUsize::new(0),
            run_ids: Mutex::new(VecDeque::new()),
            create_error: Mutex::new(None),
            create_hangs: AtomicBool::new(false),
            cancel_error: Mutex::new(None),
            cancel_holds: AtomicBool::new(false),
            cancel_started: Notify::new(),
            cancel_permits: Semaphore::new(0),
            list_error: Mutex::new(None),
            runs: Mutex::new(Vec::new()),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Id handed out by the next create call; `run-1` otherwise.
    pub(crate) fn next_run_id(&self, id: &str) {
        self.run_ids.lock().push_back(RunId::from(id));
    }

    pub(crate) fn fail_create(&self, error: MonitorError) {
        *self.create_error.lock() = Some(error);
    }

    pub(crate) fn hang_create(&self) {
        self.create_hangs.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_cancel(&self, error: MonitorError) {
        *self.cancel_error.lock() = Some(error);
    }

    /// Makes cancel calls block until [`FakeRunApi::release_cancel`].
    pub(crate) fn hold_cancel(&self) {
        self.cancel_holds.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release_cancel(&self) {
        self.cancel_permits.add_permits(1);
    }

    pub(crate) async fn cancel_started(&self) {
        tokio::time::timeout(WAIT, self.cancel_started.notified())
            .await
            .expect("cancel was not requested");
    }

    pub(crate) fn fail_list(&self, error: MonitorError) {
        *self.list_error.lock() = Some(error);
    }

    pub(crate) fn set_runs(&self, runs: Vec<RunSummary>) {
        *self.runs.lock() = runs;
    }

    pub(crate) fn insert_run(&self, summary: RunSummary) {
        self.records.lock().insert(summary.id.clone(), summary);
    }
}

#[async_trait]
impl crate::api::RunApi for FakeRunApi {
    async fn create_run(&self, request: &CreateRunRequest) -> Result<RunId> {
        self.created.lock().push(request.clone());
        if self.create_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(error) = self.create_error.lock().clone() {
            return Err(error);
        }
        let next = self.run_ids.lock().pop_front();
        Ok(next.unwrap_or_else(|| RunId::from("run-1")))
    }

    async fn cancel_run(&self, _run_id: &RunId) -> Result<()> {
        self.cancel_started.notify_one();
        if self.cancel_holds.load(Ordering::SeqCst) {
            self.cancel_permits
                .acquire()
                .await
                .expect("semaphore open")
                .forget();
        }
        match self.cancel_error.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn list_runs(&self) -> Result<Vec<RunSummary>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.list_error.lock().clone() {
            return Err(error);
        }
        Ok(self.runs.lock().clone())
    }

    async fn get_run(&self, run_id: &RunId) -> Result<RunSummary> {
        self.records
            .lock()
            .get(run_id)
            .cloned()
            .ok_or_else(|| MonitorError::request(Some(404), format!("run {run_id} not found")))
    }
}
