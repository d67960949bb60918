//! CLI argument definitions.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

/// bankshot - opens URLs and manages SSH port forwards from remote sessions.
#[derive(Debug, Parser)]
#[command(
    name = "bankshot",
    version,
    about = "bankshot - opens URLs and manages SSH port forwards from remote sessions",
    long_about = "bankshot talks to the bankshot daemon to:\n\
                  - open URLs in your local browser from remote sessions\n\
                  - manage SSH port forwards dynamically\n\
                  - monitor remote ports and auto-forward them"
)]
pub struct Cli {
    /// Path to the bankshot socket
    #[arg(
        short = 's',
        long = "socket",
        global = true,
        value_name = "PATH",
        env = "BANKSHOT_SOCKET"
    )]
    pub socket: Option<PathBuf>,

    /// Config file (default: ~/.config/bankshot/config.toml)
    #[arg(long = "config", global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (can be repeated: -v, -vv)
    #[arg(short = 'v', long = "verbose", global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short = 'q', long = "quiet", global = true)]
    pub quiet: bool,

    /// Log output format
    #[arg(
        long = "log-format",
        global = true,
        default_value = "text",
        env = "BANKSHOT_LOG_FORMAT"
    )]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Open a URL in the local browser
    Open {
        /// URL to open
        url: String,
    },

    /// Forward a remote port to the workstation
    Forward {
        /// Port on the remote machine
        remote_port: u16,
        /// Port on the workstation (defaults to the remote port)
        local_port: Option<u16>,
        /// SSH connection identifier (defaults to this hostname)
        #[arg(short = 'c', long = "connection")]
        connection: Option<String>,
        /// Target host on the remote side of the tunnel
        #[arg(long = "host", default_value = "localhost")]
        host: String,
    },

    /// Remove a port forward
    Unforward {
        /// Remote port of the forward to remove
        remote_port: u16,
        /// SSH connection identifier (defaults to this hostname)
        #[arg(short = 'c', long = "connection")]
        connection: Option<String>,
        /// Target host of the forward
        #[arg(long = "host", default_value = "localhost")]
        host: String,
    },

    /// List active forwards
    List,

    /// Show daemon status
    Status,

    /// Watch forward status continuously
    Watch {
        /// Update interval in seconds
        #[arg(short = 'i', long = "interval", default_value_t = 2)]
        interval: u64,
    },

    /// Monitor listening ports and auto-forward them (remote side)
    Monitor {
        /// SSH connection identifier (defaults to this hostname)
        #[arg(short = 'c', long = "connection")]
        connection: Option<String>,
        /// Write the monitor's PID to this file
        #[arg(long = "pid-file", value_name = "PATH")]
        pid_file: Option<PathBuf>,
    },

    /// Reconcile forwards with the current listening set (remote side)
    Reconcile {
        /// SSH connection identifier (defaults to this hostname)
        #[arg(short = 'c', long = "connection")]
        connection: Option<String>,
    },

    /// Wrap a command and auto-forward the ports it opens
    #[command(
        after_help = "Examples:\n  \
                      bankshot wrap -- npm run dev\n  \
                      bankshot wrap -- python -m http.server 8080\n  \
                      bankshot wrap -c myserver -- ./myapp --port 3000"
    )]
    Wrap {
        /// SSH connection identifier (defaults to this hostname)
        #[arg(short = 'c', long = "connection")]
        connection: Option<String>,
        /// Command to run
        #[arg(required = true, trailing_var_arg = true, value_name = "COMMAND")]
        argv: Vec<String>,
    },

    /// Daemon management
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum DaemonCommands {
    /// Run the daemon in the foreground
    Run,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
}
