use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "crawlctl", version, about = "Crawl platform control CLI")]
pub struct Cli {
    /// Data root holding the database, run outputs, PID files, and logs.
    #[arg(long, env = "CTL_DATA_ROOT", default_value = "./data", global = true)]
    pub data_root: PathBuf,

    #[command(subcommand)]
    pub command: CommandKind,
}

#[derive(Debug, Subcommand)]
pub enum CommandKind {
    /// Start the supervised services (spawns the watchdog detached).
    Start(ServiceArgs),
    /// Stop supervised services, watchdog first.
    Stop(ServiceArgs),
    /// Stop and start again.
    Restart(ServiceArgs),
    /// Report per-service liveness and health.
    Status(ServiceArgs),
    /// Follow run progress and print updates until interrupted.
    Monitor {
        /// Poll interval in seconds.
        #[arg(long, default_value_t = 2)]
        interval_sec: u64,
    },
    /// Run the execution control plane in the foreground.
    Serve,
    /// Run the process supervisor in the foreground. `start` launches this
    /// detached; it is not meant to be invoked by hand.
    #[command(hide = true)]
    Supervise(ServiceArgs),
}

#[derive(Debug, Args)]
pub struct ServiceArgs {
    /// Comma-separated service names to act on (default: all configured).
    #[arg(long, value_delimiter = ',')]
    pub services: Vec<String>,
}
