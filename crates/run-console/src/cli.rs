use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "run-console", version, about = "Start and follow remote test runs")]
pub(crate) struct Args {
    /// TOML monitor config; built-in defaults are used when omitted.
    #[arg(long)]
    pub(crate) config: Option<PathBuf>,
    /// Overrides `api_base_url` from the config.
    #[arg(long)]
    pub(crate) api_base_url: Option<String>,
    #[arg(long, env = "RUN_MONITOR_TOKEN", hide_env_values = true)]
    pub(crate) token: Option<String>,
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Request a new run and follow it until it finishes.
    Start(StartArgs),
    /// Attach to a run that is already in progress.
    Watch {
        run_id: String,
    },
    /// Print the run history.
    History {
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long)]
        page_size: Option<usize>,
        /// Keep polling until interrupted.
        #[arg(long, default_value_t = false)]
        follow: bool,
    },
}

#[derive(ClapArgs, Debug)]
pub(crate) struct StartArgs {
    /// Test suite id; repeat for several suites.
    #[arg(long = "suite", required = true)]
    pub(crate) suites: Vec<String>,
    #[arg(long)]
    pub(crate) name: Option<String>,
    #[arg(long)]
    pub(crate) environment: Option<String>,
    #[arg(long)]
    pub(crate) browser: Option<String>,
    #[arg(long)]
    pub(crate) requirement: Option<String>,
}
