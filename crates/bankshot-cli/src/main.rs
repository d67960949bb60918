//! bankshot: the client and remote-side binary.

mod cli;
mod commands;
mod process;

use clap::Parser;

use bankshot_core::{init_logging, Config, LogFormat, Result};

use crate::cli::{Cli, Commands, ConfigCommands, DaemonCommands};
use crate::commands::Context;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("bankshot: {}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(socket) = &cli.socket {
        config.network = "unix".into();
        config.address = socket.display().to_string();
    }

    let verbosity = if cli.quiet {
        0
    } else if cli.verbose > 0 {
        2 + cli.verbose
    } else {
        match cli.command {
            // Long-running services log at their configured level.
            Commands::Monitor { .. } | Commands::Daemon { .. } => config.verbosity(),
            // One-shot commands stay quiet unless asked.
            _ => 1,
        }
    };
    let format: LogFormat = cli.log_format.parse()?;
    init_logging(verbosity, None, format)?;

    let ctx = Context::new(config, cli.quiet);

    match cli.command {
        Commands::Open { url } => commands::open::run(&ctx, &url).await.map(|_| 0),
        Commands::Forward {
            remote_port,
            local_port,
            connection,
            host,
        } => commands::forward::run(&ctx, remote_port, local_port, connection, host)
            .await
            .map(|_| 0),
        Commands::Unforward {
            remote_port,
            connection,
            host,
        } => commands::unforward::run(&ctx, remote_port, connection, host)
            .await
            .map(|_| 0),
        Commands::List => commands::list::run(&ctx).await.map(|_| 0),
        Commands::Status => commands::status::run(&ctx).await.map(|_| 0),
        Commands::Watch { interval } => commands::watch::run(&ctx, interval).await.map(|_| 0),
        Commands::Monitor {
            connection,
            pid_file,
        } => commands::monitor::run(&ctx, connection, pid_file)
            .await
            .map(|_| 0),
        Commands::Reconcile { connection } => {
            commands::reconcile::run(&ctx, connection).await.map(|_| 0)
        }
        Commands::Wrap { connection, argv } => commands::wrap::run(&ctx, connection, argv).await,
        Commands::Daemon {
            command: DaemonCommands::Run,
        } => commands::daemon::run(&ctx).await.map(|_| 0),
        Commands::Config {
            command: ConfigCommands::Show,
        } => commands::config::run(&ctx).map(|_| 0),
    }
}
