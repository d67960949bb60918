//! Configuration loading.
//!
//! Config lives at `~/.config/bankshot/config.toml`; every key is optional
//! and a missing file yields the defaults. Paths beginning with `~/` are
//! expanded against `$HOME` during validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_GRACE_PERIOD, DEFAULT_IGNORE_PROCESSES, DEFAULT_POLL_INTERVAL, DEFAULT_SOCKET_NAME,
};
use crate::error::{Error, Result};
use crate::policy::{PortPolicy, PortRange};

/// Daemon and supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener type: "unix" or "tcp".
    pub network: String,

    /// Socket path (unix) or host:port (tcp).
    pub address: String,

    /// Log level: debug, info, warn, error.
    pub log_level: String,

    /// Path to the ssh binary.
    pub ssh_command: String,

    /// Remote-side monitor settings.
    pub monitor: MonitorConfig,
}

/// Settings for `bankshot monitor` on the remote host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Ranges eligible for auto-forwarding; empty means every port >= 1024.
    pub port_ranges: Vec<PortRange>,

    /// Individual ports never auto-forwarded.
    pub ignore_ports: Vec<u16>,

    /// Process names (substring match) never auto-forwarded.
    pub ignore_processes: Vec<String>,

    /// Polling observer interval, e.g. "5s". Fallback backend only.
    pub poll_interval: Option<String>,

    /// Delay between a port closing and its forward removal, e.g. "30s".
    pub grace_period: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: "unix".into(),
            address: format!("~/{}", DEFAULT_SOCKET_NAME),
            log_level: "info".into(),
            ssh_command: "ssh".into(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location when
    /// `path` is `None`. A missing file yields defaults; a malformed file is
    /// an error. The returned config is already validated.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };

        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            toml::from_str(&contents).map_err(|e| Error::Config {
                message: format!("failed to parse {}: {}", path.display(), e),
            })?
        } else {
            Config::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate field values and expand `~` in the unix socket address.
    pub fn validate(&mut self) -> Result<()> {
        match self.network.as_str() {
            "unix" | "tcp" => {}
            other => {
                return Err(Error::Config {
                    message: format!("invalid network type: {} (must be 'unix' or 'tcp')", other),
                });
            }
        }

        match self.log_level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(Error::Config {
                    message: format!("invalid log level: {}", other),
                });
            }
        }

        if self.network == "unix" {
            self.address = expand_home(&self.address)?;
        }

        // Fail early on malformed durations rather than at first use.
        self.monitor.poll_interval()?;
        self.monitor.grace_period()?;

        Ok(())
    }

    /// Socket path for the unix listener.
    pub fn socket_path(&self) -> PathBuf {
        PathBuf::from(&self.address)
    }

    /// Verbosity level derived from `log_level`, for `init_logging`.
    pub fn verbosity(&self) -> u8 {
        match self.log_level.as_str() {
            "error" => 0,
            "warn" => 1,
            "debug" => 3,
            _ => 2,
        }
    }
}

impl MonitorConfig {
    /// Effective polling interval.
    pub fn poll_interval(&self) -> Result<Duration> {
        match &self.poll_interval {
            Some(s) => parse_duration(s),
            None => Ok(DEFAULT_POLL_INTERVAL),
        }
    }

    /// Effective grace period.
    pub fn grace_period(&self) -> Result<Duration> {
        match &self.grace_period {
            Some(s) => parse_duration(s),
            None => Ok(DEFAULT_GRACE_PERIOD),
        }
    }

    /// Build the auto-forward policy from this config.
    pub fn policy(&self) -> PortPolicy {
        let ignore_processes = if self.ignore_processes.is_empty() {
            DEFAULT_IGNORE_PROCESSES
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            self.ignore_processes.clone()
        };
        PortPolicy::new(
            self.port_ranges.clone(),
            self.ignore_ports.iter().copied(),
            ignore_processes,
        )
    }
}

/// Default config file location: `~/.config/bankshot/config.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").map_err(|_| Error::Config {
        message: "HOME is not set".into(),
    })?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("bankshot")
        .join("config.toml"))
}

/// Default daemon socket path: `~/.bankshot.sock`.
pub fn default_socket_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").map_err(|_| Error::Config {
        message: "HOME is not set".into(),
    })?;
    Ok(PathBuf::from(home).join(DEFAULT_SOCKET_NAME))
}

/// Expand a leading `~/` against `$HOME`.
fn expand_home(path: &str) -> Result<String> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var("HOME").map_err(|_| Error::Config {
            message: "HOME is not set, cannot expand ~ in address".into(),
        })?;
        Ok(format!("{}/{}", home.trim_end_matches('/'), rest))
    } else {
        Ok(path.to_string())
    }
}

/// Parse a humane duration string: `"100ms"`, `"5s"`, `"2m"`, `"1h"`, or a
/// bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let err = || Error::Config {
        message: format!("invalid duration: {:?}", s),
    };

    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = digits.parse().map_err(|_| err())?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(err()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.network, "unix");
        assert_eq!(config.ssh_command, "ssh");
        assert_eq!(config.log_level, "info");
        assert!(config.monitor.port_ranges.is_empty());
        assert_eq!(config.monitor.poll_interval().unwrap(), DEFAULT_POLL_INTERVAL);
        assert_eq!(config.monitor.grace_period().unwrap(), DEFAULT_GRACE_PERIOD);
    }

    #[test]
    fn parse_full_file() {
        let toml = r#"
            network = "unix"
            address = "/tmp/test.sock"
            log_level = "debug"
            ssh_command = "/usr/local/bin/ssh"

            [monitor]
            ignore_ports = [5432, 6379]
            ignore_processes = ["postgres"]
            poll_interval = "2s"
            grace_period = "1m"

            [[monitor.port_ranges]]
            start = 3000
            end = 9999
        "#;
        let mut config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.address, "/tmp/test.sock");
        assert_eq!(config.verbosity(), 3);
        assert_eq!(config.monitor.ignore_ports, vec![5432, 6379]);
        assert_eq!(
            config.monitor.port_ranges,
            vec![PortRange {
                start: 3000,
                end: 9999
            }]
        );
        assert_eq!(
            config.monitor.poll_interval().unwrap(),
            Duration::from_secs(2)
        );
        assert_eq!(
            config.monitor.grace_period().unwrap(),
            Duration::from_secs(60)
        );

        let policy = config.monitor.policy();
        assert!(policy.should_forward(3000, "127.0.0.1"));
        assert!(!policy.should_forward(5432, "127.0.0.1"));
        assert!(policy.ignores_process("postgres: writer"));
    }

    #[test]
    fn invalid_network_rejected() {
        let mut config = Config {
            network: "udp".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_log_level_rejected() {
        let mut config = Config {
            log_level: "loud".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("nope.toml"))).unwrap();
        assert_eq!(config.network, "unix");
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("5 parsecs").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn home_expansion() {
        // Serialized: relies on HOME, which the test runner sets.
        let home = std::env::var("HOME").unwrap();
        let expanded = expand_home("~/.bankshot.sock").unwrap();
        assert_eq!(expanded, format!("{}/.bankshot.sock", home.trim_end_matches('/')));
        assert_eq!(expand_home("/tmp/x.sock").unwrap(), "/tmp/x.sock");
    }
}
