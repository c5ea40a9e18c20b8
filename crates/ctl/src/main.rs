mod cli;
mod commands;
mod logging;
mod pidfile;
mod services;
mod supervise;

use clap::Parser;

use crate::cli::{Cli, CommandKind};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let data_root = cli.data_root;
    match cli.command {
        CommandKind::Start(args) => commands::start(&data_root, &args.services).await,
        CommandKind::Stop(args) => commands::stop(&data_root, &args.services).await,
        CommandKind::Restart(args) => commands::restart(&data_root, &args.services).await,
        CommandKind::Status(args) => commands::status(&data_root, &args.services).await,
        CommandKind::Monitor { interval_sec } => commands::monitor(&data_root, interval_sec).await,
        CommandKind::Serve => commands::serve(&data_root).await,
        CommandKind::Supervise(args) => {
            let services = match services::select(
                services::load_services(&data_root)?,
                &args.services,
            ) {
                Ok(services) => services,
                Err(msg) => {
                    eprintln!("error: {msg}");
                    return Ok(2);
                }
            };
            let cfg = crawlctl_core::ControlConfig::from_env(&data_root)?;
            supervise::run(&data_root, services, &cfg).await
        }
    }
}
