//! Configuration for the sticky cluster
//!
//! Sources, lowest precedence first: built-in defaults, optional TOML file,
//! environment variables / command line flags.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{ClusterError, Result};

/// Upper bound on worker processes per cluster
pub const MAX_CONCURRENCY: usize = 1024;

pub const DEFAULT_PREFIX: &str = "sticky-cluster";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HARD_SHUTDOWN_DELAY_MS: u64 = 60_000;

/// Command line arguments
#[derive(Parser, Debug, Clone)]
#[command(name = "sticky-cluster")]
#[command(about = "Sticky process-cluster load balancer")]
#[command(version)]
pub struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "STICKY_CLUSTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Namespace for IPC message tags
    #[arg(long, env = "STICKY_CLUSTER_PREFIX")]
    pub prefix: Option<String>,

    /// Number of worker processes (0 = logical CPU count)
    #[arg(short = 'n', long, env = "STICKY_CLUSTER_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Address to listen on
    #[arg(long, env = "STICKY_CLUSTER_HOST")]
    pub host: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long, env = "STICKY_CLUSTER_PORT")]
    pub port: Option<u16>,

    /// Deadline for graceful shutdown before the master is killed
    #[arg(long, env = "STICKY_CLUSTER_HARD_SHUTDOWN_DELAY_MS")]
    pub hard_shutdown_delay_ms: Option<u64>,

    /// Serve in a single process without workers
    #[arg(long, env = "STICKY_CLUSTER_STANDALONE", default_value = "false")]
    pub standalone: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormat>,
}

impl Args {
    /// Load the config file (if any) and apply flag overrides on top.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        let cluster = &mut config.cluster;
        if let Some(prefix) = &self.prefix {
            cluster.prefix = prefix.clone();
        }
        if let Some(concurrency) = self.concurrency {
            cluster.concurrency = concurrency;
        }
        if let Some(host) = self.host {
            cluster.host = host;
        }
        if let Some(port) = self.port {
            cluster.port = port;
        }
        if let Some(delay) = self.hard_shutdown_delay_ms {
            cluster.hard_shutdown_delay_ms = delay;
        }
        if self.standalone {
            cluster.clustered = false;
        }

        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }

        Ok(config)
    }
}

/// Top-level configuration file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterOptions,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
            .map_err(|e| ClusterError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

/// Cluster options, immutable once the cluster starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterOptions {
    /// Namespace for IPC tags (`<prefix>:connection`)
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Number of workers; 0 means one per logical CPU
    #[serde(default)]
    pub concurrency: usize,

    /// Listen address
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Listen port; 0 means the default port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Hard shutdown deadline in milliseconds
    #[serde(default = "default_hard_shutdown_delay_ms")]
    pub hard_shutdown_delay_ms: u64,

    /// Fork workers (true) or serve everything in one process (false)
    #[serde(default = "default_true")]
    pub clustered: bool,
}

fn default_prefix() -> String { DEFAULT_PREFIX.to_string() }
fn default_host() -> IpAddr { IpAddr::V4(Ipv4Addr::UNSPECIFIED) }
fn default_port() -> u16 { DEFAULT_PORT }
fn default_hard_shutdown_delay_ms() -> u64 { DEFAULT_HARD_SHUTDOWN_DELAY_MS }
fn default_true() -> bool { true }

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            concurrency: 0,
            host: default_host(),
            port: default_port(),
            hard_shutdown_delay_ms: default_hard_shutdown_delay_ms(),
            clustered: true,
        }
    }
}

impl ClusterOptions {
    /// Replace unset or zero values with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.prefix.trim().is_empty() {
            self.prefix = default_prefix();
        }
        if self.concurrency == 0 {
            self.concurrency = num_cpus::get().max(1);
        }
        if self.port == 0 {
            self.port = DEFAULT_PORT;
        }
        self
    }

    /// Check the options are usable as-is.
    ///
    /// Port 0 passes (ephemeral bind); normalization is what rules it out for
    /// real deployments.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(ClusterError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.concurrency > MAX_CONCURRENCY {
            return Err(ClusterError::Config(format!(
                "concurrency {} exceeds the maximum of {}",
                self.concurrency, MAX_CONCURRENCY
            )));
        }
        if self.prefix.is_empty() || self.prefix.chars().any(char::is_whitespace) {
            return Err(ClusterError::Config(format!(
                "prefix {:?} must be non-empty and contain no whitespace",
                self.prefix
            )));
        }
        Ok(())
    }

    pub fn hard_shutdown_delay(&self) -> Duration {
        Duration::from_millis(self.hard_shutdown_delay_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = ClusterOptions::default();
        assert_eq!(options.prefix, "sticky-cluster");
        assert_eq!(options.port, 3000);
        assert_eq!(options.hard_shutdown_delay(), Duration::from_secs(60));
        assert!(options.clustered);
    }

    #[test]
    fn test_normalization_fills_zero_values() {
        let options = ClusterOptions {
            prefix: String::new(),
            concurrency: 0,
            port: 0,
            ..ClusterOptions::default()
        }
        .normalized();

        assert_eq!(options.prefix, DEFAULT_PREFIX);
        assert_eq!(options.concurrency, num_cpus::get().max(1));
        assert_eq!(options.port, DEFAULT_PORT);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_normalization_keeps_explicit_values() {
        let options = ClusterOptions {
            prefix: "app".to_string(),
            concurrency: 3,
            port: 8080,
            ..ClusterOptions::default()
        }
        .normalized();

        assert_eq!(options.prefix, "app");
        assert_eq!(options.concurrency, 3);
        assert_eq!(options.port, 8080);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let options = ClusterOptions::default();
        assert!(matches!(options.validate(), Err(ClusterError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_oversized_cluster() {
        let options = ClusterOptions {
            concurrency: MAX_CONCURRENCY + 1,
            ..ClusterOptions::default()
        };
        assert!(matches!(options.validate(), Err(ClusterError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_whitespace_prefix() {
        let options = ClusterOptions {
            prefix: "my app".to_string(),
            concurrency: 2,
            ..ClusterOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_args_override_defaults() {
        let args = Args::parse_from([
            "sticky-cluster",
            "--concurrency",
            "4",
            "--port",
            "8081",
            "--standalone",
            "--log-format",
            "json",
        ]);
        let config = args.load_config().unwrap();
        assert_eq!(config.cluster.concurrency, 4);
        assert_eq!(config.cluster.port, 8081);
        assert!(!config.cluster.clustered);
        assert_eq!(config.logging.format, LogFormat::Json);
    }
}
