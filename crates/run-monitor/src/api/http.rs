use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use run_protocol::{CreateRunRequest, CreateRunResponse, ErrorBody, RunId, RunSummary};

use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};

use super::RunApi;

const RUN_PATH: &str = "/api/test-execution/run";
const CANCEL_PATH: &str = "/api/test-execution/cancel";
const HISTORY_PATH: &str = "/api/test-execution/runs";
const RUN_STATUS_PATH: &str = "/api/test-runs";

static HTTP_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// [`RunApi`] over the test-automation REST endpoints.
pub struct HttpRunApi {
    client: Client,
    base_url: String,
    token: Option<String>,
    io_timeout: Duration,
}

impl HttpRunApi {
    pub fn new(config: &MonitorConfig, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|err| MonitorError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self::with_client(client, config, token))
    }

    pub fn with_client(client: Client, config: &MonitorConfig, token: Option<String>) -> Self {
        Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: token.filter(|value| !value.trim().is_empty()),
            io_timeout: config.request_timeout(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .request(method, url)
            .header(ACCEPT, "application/json")
            .timeout(self.io_timeout);
        if let Some(token) = self.token.as_deref() {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        request
    }

    async fn send(&self, label: &str, request: RequestBuilder) -> Result<String> {
        let request_id = HTTP_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        debug!(request = %label, request_id, "http request start");
        let response = request.send().await.map_err(|err| {
            warn!(
                request = %label,
                request_id,
                timeout = err.is_timeout(),
                connect = err.is_connect(),
                error = %err,
                "http request failed"
            );
            if err.is_timeout() {
                MonitorError::timed_out(label, self.io_timeout)
            } else {
                MonitorError::request(None, format!("{label} failed: {err}"))
            }
        })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| MonitorError::request(Some(status.as_u16()), err.to_string()))?;
        info!(
            request = %label,
            request_id,
            status = status.as_u16(),
            body_len = body.len(),
            "http request done"
        );
        if !status.is_success() {
            let message = serde_json::from_str::<ErrorBody>(&body)
                .ok()
                .and_then(ErrorBody::into_message)
                .unwrap_or_else(|| format!("{label} failed with status {}", status.as_u16()));
            return Err(MonitorError::request(Some(status.as_u16()), message));
        }
        Ok(body)
    }

    async fn send_json<T: DeserializeOwned>(&self, label: &str, request: RequestBuilder) -> Result<T> {
        let body = self.send(label, request).await?;
        serde_json::from_str(&body).map_err(|err| {
            warn!(request = %label, error = %err, "http response parse error");
            MonitorError::request(None, format!("{label} returned an unexpected body: {err}"))
        })
    }
}

#[async_trait]
impl RunApi for HttpRunApi {
    async fn create_run(&self, request: &CreateRunRequest) -> Result<RunId> {
        let payload = serde_json::to_string(request)
            .map_err(|err| MonitorError::Validation(err.to_string()))?;
        let builder = self
            .request(Method::POST, RUN_PATH)
            .header(CONTENT_TYPE, "application/json")
            .body(payload);
        let created: CreateRunResponse = self.send_json("run creation", builder).await?;
        Ok(created.id)
    }

    async fn cancel_run(&self, run_id: &RunId) -> Result<()> {
        let path = format!("{CANCEL_PATH}/{}", urlencoding::encode(run_id.as_str()));
        self.send("run cancel", self.request(Method::POST, &path))
            .await
            .map(|_| ())
    }

    async fn list_runs(&self) -> Result<Vec<RunSummary>> {
        self.send_json("run history", self.request(Method::GET, HISTORY_PATH))
            .await
    }

    async fn get_run(&self, run_id: &RunId) -> Result<RunSummary> {
        let path = format!("{RUN_STATUS_PATH}/{}", urlencoding::encode(run_id.as_str()));
        self.send_json("run status", self.request(Method::GET, &path))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use run_protocol::RunStatus;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    /// Serves one canned response and hands back the raw request.
    async fn serve_once(status: &str, body: &str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let base = format!("http://{}", listener.local_addr().expect("addr"));
        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let request = read_request(&mut stream).await;
            stream.write_all(response.as_bytes()).await.expect("write");
            let _ = stream.shutdown().await;
            request
        });
        (base, handle)
    }

    async fn read_request(stream: &mut TcpStream) -> String {
        let mut raw = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let read = stream.read(&mut chunk).await.expect("read");
            if read == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..read]);
            let text = String::from_utf8_lossy(&raw);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if raw.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&raw).into_owned()
    }

    fn api_for(base: &str, token: Option<&str>, request_timeout_ms: u64) -> HttpRunApi {
        let config = MonitorConfig {
            api_base_url: base.to_string(),
            request_timeout_ms,
            ..MonitorConfig::default()
        };
        let client = Client::builder().no_proxy().build().expect("client");
        HttpRunApi::with_client(client, &config, token.map(str::to_string))
    }

    fn request() -> CreateRunRequest {
        CreateRunRequest {
            run_name: "nightly".to_string(),
            environment: "staging".to_string(),
            browser: "chrome".to_string(),
            test_suite_ids: vec!["suite-1".to_string()],
            functional_requirement_id: None,
        }
    }

    #[tokio::test]
    async fn create_run_posts_selection_with_bearer_token() {
        let (base, server) = serve_once("200 OK", r#"{"id":"run-42"}"#).await;
        let api = api_for(&base, Some("token-1"), 5_000);
        let run_id = api.create_run(&request()).await.expect("created");
        assert_eq!(run_id, RunId::from("run-42"));

        let raw = server.await.expect("server");
        assert!(raw.starts_with("POST /api/test-execution/run HTTP/1.1\r\n"), "{raw}");
        let lowered = raw.to_ascii_lowercase();
        assert!(lowered.contains("authorization: bearer token-1\r\n"), "{raw}");
        assert!(lowered.contains("content-type: application/json\r\n"), "{raw}");
        assert!(raw.contains(r#""runName":"nightly""#), "{raw}");
        assert!(raw.contains(r#""testSuiteIds":["suite-1"]"#), "{raw}");
    }

    #[tokio::test]
    async fn rejection_surfaces_backend_message() {
        let (base, server) = serve_once("400 Bad Request", r#"{"message":"No test suites found"}"#).await;
        let api = api_for(&base, None, 5_000);
        let err = api.create_run(&request()).await.expect_err("rejected");
        match err {
            MonitorError::Request { status, message } => {
                assert_eq!(status, Some(400));
                assert_eq!(message, "No test suites found");
            }
            other => panic!("unexpected {other:?}"),
        }
        let raw = server.await.expect("server");
        assert!(!raw.to_ascii_lowercase().contains("authorization:"), "{raw}");
    }

    #[tokio::test]
    async fn non_json_failure_falls_back_to_status_message() {
        let (base, server) = serve_once("500 Internal Server Error", "upstream exploded").await;
        let api = api_for(&base, None, 5_000);
        let err = api.list_runs().await.expect_err("server error");
        assert!(err.is_retryable());
        match err {
            MonitorError::Request { status, message } => {
                assert_eq!(status, Some(500));
                assert_eq!(message, "run history failed with status 500");
            }
            other => panic!("unexpected {other:?}"),
        }
        let raw = server.await.expect("server");
        assert!(raw.starts_with("GET /api/test-execution/runs HTTP/1.1\r\n"), "{raw}");
    }

    #[tokio::test]
    async fn cancel_posts_to_run_path() {
        let (base, server) = serve_once("200 OK", "").await;
        let api = api_for(&base, Some("token-1"), 5_000);
        api.cancel_run(&RunId::from("run-7")).await.expect("cancelled");
        let raw = server.await.expect("server");
        assert!(raw.starts_with("POST /api/test-execution/cancel/run-7 HTTP/1.1\r\n"), "{raw}");
    }

    #[tokio::test]
    async fn get_run_reads_run_record() {
        let body = r#"{"id":"run-7","runName":"smoke","status":"Running","startedAt":"2024-05-01T10:00:00Z","totalTests":4,"passedTests":1,"failedTests":null}"#;
        let (base, server) = serve_once("200 OK", body).await;
        let api = api_for(&base, None, 5_000);
        let summary = api.get_run(&RunId::from("run-7")).await.expect("record");
        assert_eq!(summary.status, RunStatus::Running);
        assert_eq!(summary.name, "smoke");
        assert_eq!(summary.total_tests, 4);
        assert_eq!(summary.failed_tests, 0);
        let raw = server.await.expect("server");
        assert!(raw.starts_with("GET /api/test-runs/run-7 HTTP/1.1\r\n"), "{raw}");
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let base = format!("http://{}", listener.local_addr().expect("addr"));
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });
        let api = api_for(&base, None, 50);
        let err = api.list_runs().await.expect_err("timeout");
        assert!(matches!(err, MonitorError::Request { status: None, .. }));
        assert_eq!(err.to_string(), "run history timed out after 50ms");
    }
}
