mod http;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use run_protocol::{CreateRunRequest, RunId, RunSummary};

use crate::error::{MonitorError, Result};

pub use http::HttpRunApi;

#[async_trait]
pub trait RunApi: Send + Sync {
    async fn create_run(&self, request: &CreateRunRequest) -> Result<RunId>;

    async fn cancel_run(&self, run_id: &RunId) -> Result<()>;

    async fn list_runs(&self) -> Result<Vec<RunSummary>>;

    /// Current backend record of one run, used to reconcile after a
    /// reconnect or when resuming a run.
    async fn get_run(&self, run_id: &RunId) -> Result<RunSummary>;
}

/// Bounds a collaborator call; expiry surfaces as a `Request` error.
pub(crate) async fn with_timeout<T, F>(operation: &str, limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| MonitorError::timed_out(operation, limit))?
}
