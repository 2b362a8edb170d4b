use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use run_protocol::RunSummary;

use crate::api::{with_timeout, RunApi};
use crate::config::MonitorConfig;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub rows: Vec<RunSummary>,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub total_rows: usize,
}

/// Client-side mirror of the backend run list. Every fetch replaces the
/// cache wholesale; live session state is never merged in.
pub struct RunHistoryView {
    api: Arc<dyn RunApi>,
    cache: RwLock<Vec<RunSummary>>,
    request_timeout: Duration,
    default_page_size: usize,
}

impl RunHistoryView {
    pub fn new(api: Arc<dyn RunApi>, config: &MonitorConfig) -> Self {
        Self {
            api,
            cache: RwLock::new(Vec::new()),
            request_timeout: config.request_timeout(),
            default_page_size: config.history.page_size.max(1),
        }
    }

    pub fn default_page_size(&self) -> usize {
        self.default_page_size
    }

    /// Refetches the run list and returns the requested page of it.
    pub async fn load(&self, page: usize, page_size: usize) -> Result<HistoryPage> {
        self.refresh().await?;
        Ok(self.page(page, page_size).await)
    }

    /// Refetches the run list without paging it. Returns the row count.
    pub async fn refresh(&self) -> Result<usize> {
        let runs = with_timeout("run history", self.request_timeout, self.api.list_runs()).await?;
        let rows = runs.len();
        *self.cache.write().await = runs;
        debug!(rows, "run history refreshed");
        Ok(rows)
    }

    /// Pages the cached list without fetching.
    pub async fn page(&self, page: usize, page_size: usize) -> HistoryPage {
        let cache = self.cache.read().await;
        paginate(&cache, page, page_size)
    }

    pub async fn runs(&self) -> Vec<RunSummary> {
        self.cache.read().await.clone()
    }

    /// Refetches every `interval` until `shutdown` fires. Failed fetches keep
    /// the previous rows.
    pub fn spawn_polling(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let view = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_ms = interval.as_millis() as u64,
                "run history polling started"
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = view.refresh().await {
                            warn!(event = "history.refresh.failed", error = %err, "run history refresh failed");
                        }
                    }
                }
            }
            info!("run history polling stopped");
        })
    }
}

/// `page_size` is clamped to at least 1 and `page` into `1..=total_pages`.
/// An empty list still has one (empty) page.
pub fn paginate(rows: &[RunSummary], page: usize, page_size: usize) -> HistoryPage {
    let page_size = page_size.max(1);
    let total_rows = rows.len();
    let total_pages = total_rows.div_ceil(page_size).max(1);
    let page = page.clamp(1, total_pages);
    let start = (page - 1) * page_size;
    let end = (start + page_size).min(total_rows);
    HistoryPage {
        rows: rows[start.min(total_rows)..end].to_vec(),
        page,
        page_size,
        total_pages,
        total_rows,
    }
}
