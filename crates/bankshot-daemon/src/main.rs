//! bankshotd: the workstation daemon binary.

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;

use bankshot_core::{init_logging, Config, LogFormat, Result};
use bankshot_daemon::Daemon;

/// bankshot daemon - executes SSH port forwards on behalf of remote sessions.
#[derive(Debug, Parser)]
#[command(
    name = "bankshotd",
    version,
    about = "bankshot daemon - executes SSH port forwards on behalf of remote sessions"
)]
struct Cli {
    /// Config file (default: ~/.config/bankshot/config.toml)
    #[arg(long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Socket path override
    #[arg(short = 's', long = "socket", value_name = "PATH", env = "BANKSHOT_SOCKET")]
    socket: Option<PathBuf>,

    /// Increase verbosity (can be repeated: -v, -vv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", default_value = "text", env = "BANKSHOT_LOG_FORMAT")]
    log_format: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("bankshotd: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(socket) = &cli.socket {
        config.network = "unix".into();
        config.address = socket.display().to_string();
    }

    let verbosity = if cli.verbose > 0 {
        2 + cli.verbose
    } else {
        config.verbosity()
    };
    let format: LogFormat = cli.log_format.parse()?;
    init_logging(verbosity, cli.log_file.as_deref(), format)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        network = %config.network,
        address = %config.address,
        "starting bankshotd"
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    Daemon::new(config).run(cancel).await
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = interrupt.recv() => tracing::info!("received SIGINT"),
            _ = terminate.recv() => tracing::info!("received SIGTERM"),
        }
        cancel.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn socket_override() {
        let cli = Cli::try_parse_from(["bankshotd", "-s", "/tmp/test.sock"]).unwrap();
        assert_eq!(cli.socket, Some(PathBuf::from("/tmp/test.sock")));
    }

    #[test]
    fn verbosity_counts() {
        let cli = Cli::try_parse_from(["bankshotd", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }
}
