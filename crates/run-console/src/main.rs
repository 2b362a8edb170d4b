mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use run_monitor::{
    load_monitor_config, ConnectionIndicator, EventChannel, HttpRunApi, MonitorConfig,
    ProgressSnapshot, RunApi, RunHistoryView, RunId, RunSelection, RunSession, RunSummary,
    SessionState, SessionUpdate,
};

use crate::cli::{Args, Command, StartArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_to_stderr)?;

    let mut config = match args.config.as_ref() {
        Some(path) => load_monitor_config(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => MonitorConfig::default(),
    };
    if let Some(base) = args.api_base_url.clone() {
        config.api_base_url = base;
    }
    info!(api = %config.api_base_url, "run console starting");

    let api: Arc<dyn RunApi> = Arc::new(
        HttpRunApi::new(&config, args.token.clone()).context("failed to build run api client")?,
    );
    let history = Arc::new(RunHistoryView::new(Arc::clone(&api), &config));
    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(shutdown.clone()));

    match args.command {
        Command::Start(start) => {
            let session = open_session(&config, args.token.clone(), api, &history)?;
            let updates = session.subscribe();
            let run_id = session
                .start(selection(start))
                .await
                .context("failed to start test run")?;
            println!("started run {run_id}");
            finish(follow(&session, updates, shutdown).await?)
        }
        Command::Watch { run_id } => {
            let session = open_session(&config, args.token.clone(), api, &history)?;
            let updates = session.subscribe();
            session
                .resume(RunId::new(run_id.clone()))
                .await
                .with_context(|| format!("failed to resume run {run_id}"))?;
            finish(follow(&session, updates, shutdown).await?)
        }
        Command::History {
            page,
            page_size,
            follow,
        } => {
            let size = page_size.unwrap_or_else(|| history.default_page_size());
            let rows = history
                .load(page, size)
                .await
                .context("failed to load run history")?;
            print_history(&rows.rows, rows.page, rows.total_pages);
            if follow {
                let poller = history.spawn_polling(config.history_poll_interval(), shutdown.clone());
                let mut ticker = tokio::time::interval(config.history_poll_interval());
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            let rows = history.page(page, size).await;
                            print_history(&rows.rows, rows.page, rows.total_pages);
                        }
                    }
                }
                if let Err(err) = poller.await {
                    warn!(error = %err, "history poller stopped abnormally");
                }
            }
            Ok(())
        }
    }
}

fn open_session(
    config: &MonitorConfig,
    token: Option<String>,
    api: Arc<dyn RunApi>,
    history: &Arc<RunHistoryView>,
) -> anyhow::Result<RunSession> {
    let channel =
        EventChannel::connect_websocket(config, token).context("failed to open event channel")?;
    Ok(RunSession::new(api, channel, Some(Arc::clone(history)), config))
}

fn selection(args: StartArgs) -> RunSelection {
    RunSelection {
        name: args.name,
        environment: args.environment,
        browser: args.browser,
        target_ids: args.suites,
        functional_requirement_id: args.requirement,
    }
}

/// Prints updates until the run reaches a terminal state. The first
/// interrupt requests cancellation; the run is still followed to its end.
async fn follow(
    session: &RunSession,
    mut updates: tokio::sync::broadcast::Receiver<SessionUpdate>,
    shutdown: CancellationToken,
) -> anyhow::Result<SessionState> {
    let mut cancel_requested = false;
    loop {
        tokio::select! {
            _ = shutdown.cancelled(), if !cancel_requested => {
                cancel_requested = true;
                if session.state() != SessionState::Running {
                    return Ok(session.state());
                }
                println!("cancelling run...");
                if let Err(err) = session.cancel().await {
                    warn!(error = %err, "cancel request failed");
                    return Ok(session.state());
                }
            }
            update = updates.recv() => match update {
                Ok(update) => {
                    render(&update);
                    if let SessionUpdate::State { state } = update {
                        if state.is_terminal() {
                            return Ok(state);
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "console fell behind session updates");
                    if session.state().is_terminal() {
                        return Ok(session.state());
                    }
                }
                Err(RecvError::Closed) => anyhow::bail!("session closed"),
            },
        }
    }
}

fn finish(state: SessionState) -> anyhow::Result<()> {
    match state {
        SessionState::Completed => Ok(()),
        other => anyhow::bail!("run ended {other}"),
    }
}

fn render(update: &SessionUpdate) {
    match update {
        SessionUpdate::State { state } => println!("state: {state}"),
        SessionUpdate::Progress { snapshot } => println!("progress: {}", describe(snapshot)),
        SessionUpdate::Log { entry } => {
            println!("{} | {}", entry.received_at_rfc3339(), entry.text)
        }
        SessionUpdate::Connection { indicator } => match indicator {
            ConnectionIndicator::Live => println!("connection: live"),
            ConnectionIndicator::Reconnecting => println!("connection: reconnecting..."),
        },
        SessionUpdate::Error { message } => eprintln!("error: {message}"),
    }
}

fn describe(snapshot: &ProgressSnapshot) -> String {
    let count = |value: Option<u32>| value.map_or_else(|| "?".to_string(), |n| n.to_string());
    format!(
        "{}/{} done, {} passed, {} failed ({:.0}%)",
        count(snapshot.completed_tests),
        count(snapshot.total_tests),
        count(snapshot.passed_tests),
        count(snapshot.failed_tests),
        snapshot.percent
    )
}

fn print_history(rows: &[RunSummary], page: usize, total_pages: usize) {
    println!(
        "{:<38} {:<32} {:<10} {:<22} {:>9} {:>7}",
        "ID", "NAME", "STATUS", "STARTED", "PASSED", "RATE"
    );
    for row in rows {
        println!(
            "{:<38} {:<32} {:<10} {:<22} {:>9} {:>6.1}%",
            row.id.as_str(),
            truncate(&row.name, 32),
            row.status.as_str(),
            row.started_at,
            format!("{}/{}", row.passed_tests, row.total_tests),
            row.success_rate()
        );
    }
    println!("page {page} of {total_pages}");
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    let mut out: String = value.chars().take(width.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

fn init_tracing(log_to_stderr: bool) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
    );
    if log_to_stderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn wait_for_shutdown(shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    shutdown.cancel();
}
