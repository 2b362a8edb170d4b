mod backoff;
mod registry;
mod transport;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use run_protocol::events::decode_push;
use run_protocol::hub::{self, HubMessage};
use run_protocol::{PushEvent, RunEvent, RunId};

use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};

use registry::{Handler, JoinEffect, LeaveEffect, Registry, Scope};

pub use backoff::Backoff;
pub use transport::{Connector, Transport, WsConnector};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Reconnecting,
    LogLine,
    ProgressDelta,
    RunCompleted,
    TestResult,
}

/// Accepts kind names as well as the hub targets that produce them, in any
/// case (`"logline"`, `"ExecutionLog"`, `"TESTRUNCOMPLETED"`).
impl FromStr for EventKind {
    type Err = MonitorError;

    fn from_str(raw: &str) -> Result<Self> {
        let normalized: String = raw
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "connected" => Ok(EventKind::Connected),
            "reconnecting" => Ok(EventKind::Reconnecting),
            "logline" | "testupdate" | "receivetestupdate" | "executionlog" => {
                Ok(EventKind::LogLine)
            }
            "progressdelta" | "testrunupdated" => Ok(EventKind::ProgressDelta),
            "runcompleted" | "testruncompleted" => Ok(EventKind::RunCompleted),
            "testresult" | "testresultadded" => Ok(EventKind::TestResult),
            _ => Err(MonitorError::Validation(format!("unknown event kind {raw}"))),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Connected => "connected",
            EventKind::Reconnecting => "reconnecting",
            EventKind::LogLine => "log_line",
            EventKind::ProgressDelta => "progress_delta",
            EventKind::RunCompleted => "run_completed",
            EventKind::TestResult => "test_result",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// One holder of a joined topic, returned by [`EventChannel::join`]. Handlers
/// registered through [`EventChannel::on_topic`] live as long as it does; the
/// topic is left on the hub when its last subscription is released.
#[derive(Debug, PartialEq, Eq)]
pub struct Subscription {
    id: SubscriptionId,
    run_id: RunId,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected,
    Reconnecting { attempt: u32, error: String },
    Run(PushEvent),
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::Connected => EventKind::Connected,
            ChannelEvent::Reconnecting { .. } => EventKind::Reconnecting,
            ChannelEvent::Run(push) => match push.event {
                RunEvent::LogLine { .. } => EventKind::LogLine,
                RunEvent::ProgressDelta(_) => EventKind::ProgressDelta,
                RunEvent::RunCompleted(_) => EventKind::RunCompleted,
                RunEvent::TestResult(_) => EventKind::TestResult,
            },
        }
    }

    pub fn is_run_event(&self) -> bool {
        matches!(self, ChannelEvent::Run(_))
    }

    pub fn run_event(&self) -> Option<&RunEvent> {
        match self {
            ChannelEvent::Run(push) => Some(&push.event),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub backoff: Backoff,
    pub keepalive: Duration,
}

impl ChannelOptions {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            backoff: Backoff::from_config(&config.reconnect),
            keepalive: KEEPALIVE_INTERVAL,
        }
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default())
    }
}

#[derive(Debug)]
enum Command {
    Join { run_id: RunId, epoch: u64 },
    Leave { run_id: RunId, epoch: u64 },
}

struct Shared {
    registry: Mutex<Registry>,
    /// Held for the whole of a dispatch and by every teardown. Re-entrant so
    /// that handlers may call `leave`/`off`/`disconnect` themselves.
    gate: ReentrantMutex<()>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
}

impl Shared {
    fn dispatch(&self, event: &ChannelEvent) {
        let _gate = self.gate.lock();
        let candidates = self.registry.lock().candidates(event);
        for (id, handler) in candidates {
            if !self.registry.lock().is_live(id, event) {
                continue;
            }
            handler(event);
        }
    }

    fn teardown(&self) {
        self.shutdown.cancel();
        let _gate = self.gate.lock();
        let retired = {
            let mut registry = self.registry.lock();
            if registry.status() == ChannelStatus::Closed {
                return;
            }
            registry.close()
        };
        info!(
            event = "channel.closed",
            handlers = retired.len(),
            "event channel disconnected"
        );
    }
}

struct Owner {
    shared: Arc<Shared>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        self.shared.teardown();
    }
}

/// Cheap-clone handle over one hub connection. The connection is closed by
/// [`EventChannel::disconnect`] or when the last handle is dropped.
#[derive(Clone)]
pub struct EventChannel {
    owner: Arc<Owner>,
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("status", &self.status())
            .field("topics", &self.joined_topics())
            .finish()
    }
}

impl EventChannel {
    /// Spawns the driver task; must be called inside a Tokio runtime. The
    /// first connect attempt starts immediately and `Connected` fires once it
    /// succeeds.
    pub fn connect(
        url: impl Into<String>,
        token: Option<String>,
        connector: Arc<dyn Connector>,
        options: ChannelOptions,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::new()),
            gate: ReentrantMutex::new(()),
            commands,
            shutdown: CancellationToken::new(),
        });
        let driver = Driver {
            shared: Arc::downgrade(&shared),
            shutdown: shared.shutdown.clone(),
            connector,
            url: url.into(),
            token,
            options,
        };
        tokio::spawn(driver.run(command_rx));
        Self {
            owner: Arc::new(Owner { shared }),
        }
    }

    /// Connects over WebSocket to the hub configured in `config`.
    pub fn connect_websocket(config: &MonitorConfig, token: Option<String>) -> Result<Self> {
        let url = config.hub_url()?;
        let connector = Arc::new(WsConnector::new(config.connect_timeout()));
        Ok(Self::connect(
            url,
            token,
            connector,
            ChannelOptions::from_config(config),
        ))
    }

    fn shared(&self) -> &Shared {
        &self.owner.shared
    }

    pub fn status(&self) -> ChannelStatus {
        self.shared().registry.lock().status()
    }

    pub fn is_joined(&self, run_id: &RunId) -> bool {
        self.shared().registry.lock().is_joined(run_id)
    }

    pub fn joined_topics(&self) -> Vec<RunId> {
        self.shared().registry.lock().topics()
    }

    /// Number of live subscriptions holding `run_id`.
    pub fn holders(&self, run_id: &RunId) -> usize {
        self.shared().registry.lock().holders(run_id)
    }

    /// Subscribes to a run topic. Only the first subscription of a topic is
    /// sent to the hub; later ones share it.
    pub fn join(&self, run_id: &RunId) -> Subscription {
        let (id, effect) = self.shared().registry.lock().join(run_id.clone());
        match effect {
            JoinEffect::Send { epoch } => {
                debug!(run_id = %run_id, epoch, "join sent");
                self.send_command(Command::Join {
                    run_id: run_id.clone(),
                    epoch,
                });
            }
            JoinEffect::Queued => debug!(run_id = %run_id, "join queued until connected"),
            JoinEffect::AlreadyJoined => debug!(run_id = %run_id, "topic already joined"),
            JoinEffect::Closed => warn!(run_id = %run_id, "join ignored on closed channel"),
        }
        Subscription {
            id,
            run_id: run_id.clone(),
        }
    }

    /// Releases a subscription and drops the handlers bound to it. Other
    /// subscriptions of the same topic keep receiving events.
    pub fn leave(&self, subscription: Subscription) {
        let Subscription { id, run_id } = subscription;
        let shared = self.shared();
        let _gate = shared.gate.lock();
        let (effect, retired) = shared.registry.lock().leave(&run_id, id);
        match effect {
            LeaveEffect::Send { epoch } => {
                self.send_command(Command::Leave {
                    run_id: run_id.clone(),
                    epoch,
                });
                debug!(run_id = %run_id, handlers = retired.len(), "topic left");
            }
            LeaveEffect::Removed => debug!(run_id = %run_id, handlers = retired.len(), "topic left"),
            LeaveEffect::StillHeld { holders } => {
                debug!(run_id = %run_id, holders, handlers = retired.len(), "subscription released")
            }
            LeaveEffect::NotJoined => {}
        }
    }

    /// Registers a connection-wide handler for `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.register(kind, None, Arc::new(handler))
    }

    /// Registers a handler that only sees events of the subscribed topic. It
    /// is removed when the subscription is released.
    pub fn on_topic<F>(&self, subscription: &Subscription, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        let scope = Scope {
            run_id: subscription.run_id.clone(),
            subscription: subscription.id,
        };
        self.register(kind, Some(scope), Arc::new(handler))
    }

    fn register(&self, kind: EventKind, scope: Option<Scope>, handler: Handler) -> HandlerId {
        self.shared().registry.lock().register(kind, scope, handler)
    }

    pub fn off(&self, id: HandlerId) -> bool {
        let shared = self.shared();
        let _gate = shared.gate.lock();
        let retired = shared.registry.lock().remove(id);
        retired.is_some()
    }

    pub fn disconnect(&self) {
        self.shared().teardown();
    }

    fn send_command(&self, command: Command) {
        // The receiver only goes away with the driver, after shutdown.
        if self.shared().commands.send(command).is_err() {
            debug!("channel driver already stopped");
        }
    }
}

struct Driver {
    shared: std::sync::Weak<Shared>,
    shutdown: CancellationToken,
    connector: Arc<dyn Connector>,
    url: String,
    token: Option<String>,
    options: ChannelOptions,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut attempt: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.connector.connect(&self.url, self.token.as_deref()) => result,
            };
            let error = match connected {
                Ok(mut transport) => {
                    self.options.backoff.reset();
                    attempt = 0;
                    let result = self.serve(transport.as_mut(), &mut commands).await;
                    transport.close().await;
                    match result {
                        Ok(()) => break,
                        Err(err) => err,
                    }
                }
                Err(err) => err,
            };
            attempt = attempt.saturating_add(1);
            let delay = self.options.backoff.next_delay();
            let Some(shared) = self.shared.upgrade() else {
                break;
            };
            shared.registry.lock().mark_down();
            warn!(
                event = "channel.reconnect",
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err_text(&error),
                "event channel down, reconnecting"
            );
            shared.dispatch(&ChannelEvent::Reconnecting {
                attempt,
                error: err_text(&error),
            });
            drop(shared);
            if wait_reconnect_or_shutdown(&self.shutdown, delay).await {
                break;
            }
        }
        info!(event = "channel.driver.stopped", "event channel driver stopped");
    }

    /// Runs one established connection. `Ok` means shutdown was requested.
    async fn serve(
        &self,
        transport: &mut dyn Transport,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<()> {
        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };
        let (epoch, topics) = shared.registry.lock().mark_connected();
        drop(shared);
        for run_id in &topics {
            transport
                .send(invocation(hub::JOIN_TEST_RUN, run_id)?)
                .await?;
        }
        info!(
            event = "channel.connected",
            epoch,
            topics = topics.len(),
            "event channel connected"
        );
        self.dispatch(&ChannelEvent::Connected);

        let mut keepalive = interval_at(
            Instant::now() + self.options.keepalive,
            self.options.keepalive,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                Some(command) = commands.recv() => {
                    let (target, run_id, command_epoch) = match command {
                        Command::Join { run_id, epoch } => (hub::JOIN_TEST_RUN, run_id, epoch),
                        Command::Leave { run_id, epoch } => (hub::LEAVE_TEST_RUN, run_id, epoch),
                    };
                    if command_epoch != epoch {
                        debug!(run_id = %run_id, command_epoch, epoch, "stale channel command dropped");
                        continue;
                    }
                    transport.send(invocation(target, &run_id)?).await?;
                }
                _ = keepalive.tick() => {
                    let ping = hub::encode_ping().map_err(MonitorError::transport)?;
                    transport.send(ping).await?;
                }
                frame = transport.recv() => match frame {
                    Some(Ok(text)) => self.handle_frame(&text)?,
                    Some(Err(err)) => return Err(err),
                    None => return Err(MonitorError::Transport("connection closed by server".to_string())),
                },
            }
        }
    }

    fn handle_frame(&self, text: &str) -> Result<()> {
        for record in hub::split_records(text) {
            match hub::parse_record(record) {
                Ok(HubMessage::Invocation { target, arguments }) => {
                    self.handle_invocation(&target, &arguments)
                }
                Ok(HubMessage::Ping) => {}
                Ok(HubMessage::Close { error }) => {
                    let reason = error.unwrap_or_else(|| "server closed the hub".to_string());
                    return Err(MonitorError::Transport(reason));
                }
                Ok(HubMessage::Other(kind)) => debug!(kind, "ignoring hub record"),
                Err(err) => {
                    let err = MonitorError::MalformedEvent(err.to_string());
                    warn!(event = "channel.frame.dropped", error = %err, "dropping malformed hub record");
                }
            }
        }
        Ok(())
    }

    fn handle_invocation(&self, target: &str, arguments: &[Value]) {
        match decode_push(target, arguments) {
            Ok(push) => self.dispatch(&ChannelEvent::Run(push)),
            Err(err) => {
                let err = MonitorError::MalformedEvent(err.to_string());
                warn!(event = "channel.event.dropped", hub_target = %target, error = %err, "dropping hub event");
            }
        }
    }

    fn dispatch(&self, event: &ChannelEvent) {
        if let Some(shared) = self.shared.upgrade() {
            shared.dispatch(event);
        }
    }
}

fn invocation(target: &str, run_id: &RunId) -> Result<String> {
    hub::encode_invocation(target, vec![Value::String(run_id.as_str().to_string())])
        .map_err(MonitorError::transport)
}

fn err_text(err: &MonitorError) -> String {
    match err {
        MonitorError::Transport(message) => message.clone(),
        other => other.to_string(),
    }
}

async fn wait_reconnect_or_shutdown(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
