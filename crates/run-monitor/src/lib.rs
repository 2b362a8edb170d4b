pub mod aggregator;
pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod history;
pub mod log_buffer;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use aggregator::{reduce, ProgressSnapshot};
pub use api::{HttpRunApi, RunApi};
pub use channel::{
    ChannelEvent, ChannelOptions, ChannelStatus, EventChannel, EventKind, HandlerId, Subscription,
    SubscriptionId,
};
pub use config::{load_monitor_config, parse_monitor_config, MonitorConfig};
pub use error::{MonitorError, Result};
pub use history::{HistoryPage, RunHistoryView};
pub use log_buffer::{LogBuffer, LogEntry};
pub use session::{ConnectionIndicator, RunSelection, RunSession, SessionState, SessionUpdate};

pub use run_protocol::{RunId, RunStatus, RunSummary};
