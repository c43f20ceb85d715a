//! Process configuration.
//!
//! Values come from, in order of precedence: command-line flags (or their `ODISK_*` environment
//! variables), a JSON configuration file, then built-in defaults.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::server::ServerConfig;

pub const DEFAULT_PORT: u16 = 49152;
pub const DEFAULT_IMAGE_ROOT: &str = "/mnt/images";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 10;
const DEFAULT_LOG_LEVEL: &str = "info";

const SYSTEM_CONFIG_FILE: &str = "/etc/odisk/config.json";
const USER_CONFIG_FILE: &str = ".odisk/config.json";

#[derive(Debug, Clone, Default, Parser)]
#[command(name = "odisk-server", version, about)]
pub struct Args {
    /// JSON configuration file. Defaults to the first of `/etc/odisk/config.json` and
    /// `~/.odisk/config.json` that exists.
    ///
    /// Environment variable: `ODISK_CONFIG`.
    #[arg(long, env = "ODISK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on and to advertise. Defaults to this machine's outbound IPv4 address.
    ///
    /// Environment variable: `ODISK_HOST`.
    #[arg(long, env = "ODISK_HOST")]
    pub host: Option<IpAddr>,

    /// Environment variable: `ODISK_PORT`.
    #[arg(long, env = "ODISK_PORT")]
    pub port: Option<u16>,

    /// Directory searched (recursively) for disk images.
    ///
    /// Environment variable: `ODISK_ROOT`.
    #[arg(long, env = "ODISK_ROOT")]
    pub root: Option<PathBuf>,

    /// Seconds between registry refreshes.
    ///
    /// Environment variable: `ODISK_POLL_INTERVAL_SECS`.
    #[arg(long, env = "ODISK_POLL_INTERVAL_SECS")]
    pub poll_interval_secs: Option<u64>,

    /// Seconds an external tool (`setcd`, `isoinfo`, `wodim`) may run before it is killed.
    ///
    /// Environment variable: `ODISK_TOOL_TIMEOUT_SECS`.
    #[arg(long, env = "ODISK_TOOL_TIMEOUT_SECS")]
    pub tool_timeout_secs: Option<u64>,

    /// Also share removable USB block devices.
    ///
    /// Environment variable: `ODISK_INCLUDE_REMOVABLE`.
    #[arg(
        long,
        env = "ODISK_INCLUDE_REMOVABLE",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub include_removable: Option<bool>,

    /// Log filter (tracing-subscriber EnvFilter syntax).
    ///
    /// Environment variable: `ODISK_LOG_LEVEL`.
    #[arg(long, env = "ODISK_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Do not mount the Prometheus `/metrics` endpoint.
    ///
    /// Environment variable: `ODISK_DISABLE_METRICS`.
    #[arg(long, env = "ODISK_DISABLE_METRICS")]
    pub disable_metrics: bool,
}

/// On-disk configuration document. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_removable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub root: PathBuf,
    pub poll_interval: Duration,
    pub tool_timeout: Duration,
    pub include_removable: bool,
    pub log_level: String,
    pub disable_metrics: bool,
    /// File the configuration was read from, if any.
    pub source: Option<PathBuf>,
}

impl Config {
    /// Parse the command line and merge in the configuration file.
    pub fn load() -> anyhow::Result<Self> {
        let args = Args::parse();
        let path = match &args.config {
            Some(path) => Some(path.clone()),
            None => candidate_files().into_iter().find(|path| path.is_file()),
        };
        let file = match &path {
            Some(path) if path.is_file() => Some(read_config_file(path)?),
            _ => None,
        };
        let mut config = Self::resolve(args, file.unwrap_or_default(), outbound_ipv4);
        config.source = path.filter(|path| path.is_file());
        Ok(config)
    }

    /// Merge flags over file values over defaults. `default_host` is only consulted when neither
    /// source names a host.
    pub fn resolve(args: Args, file: FileConfig, default_host: impl FnOnce() -> IpAddr) -> Self {
        let poll_interval_secs = args
            .poll_interval_secs
            .or(file.poll_interval_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS)
            .max(1);
        let tool_timeout_secs = args
            .tool_timeout_secs
            .or(file.tool_timeout_secs)
            .unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS)
            .max(1);
        let log_level = args
            .log_level
            .or(file.log_level)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        Self {
            host: args.host.or(file.host).unwrap_or_else(default_host),
            port: args.port.or(file.port).unwrap_or(DEFAULT_PORT),
            root: args
                .root
                .or(file.root)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGE_ROOT)),
            poll_interval: Duration::from_secs(poll_interval_secs),
            tool_timeout: Duration::from_secs(tool_timeout_secs),
            include_removable: args
                .include_removable
                .or(file.include_removable)
                .unwrap_or(false),
            log_level,
            disable_metrics: args.disable_metrics,
            source: None,
        }
    }

    pub fn to_file_config(&self) -> FileConfig {
        FileConfig {
            host: Some(self.host),
            port: Some(self.port),
            root: Some(self.root.clone()),
            poll_interval_secs: Some(self.poll_interval.as_secs()),
            tool_timeout_secs: Some(self.tool_timeout.as_secs()),
            include_removable: Some(self.include_removable),
            log_level: Some(self.log_level.clone()),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: SocketAddr::new(self.host, self.port),
            advertise_host: self.host,
            image_root: self.root.clone(),
            include_removable: self.include_removable,
            poll_interval: self.poll_interval,
            tool_timeout: self.tool_timeout,
            disable_metrics: self.disable_metrics,
        }
    }

    /// When no configuration file was found, write the effective values to the first candidate
    /// location that can be written. Returns the path written, if any.
    pub fn persist_if_missing(&self) -> Option<PathBuf> {
        if self.source.is_some() {
            return None;
        }
        let document = self.to_file_config();
        for path in candidate_files() {
            match write_config_file(&path, &document) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "wrote configuration file");
                    return Some(path);
                }
                Err(err) => {
                    tracing::debug!(path = %path.display(), error = %err, "configuration file not writable")
                }
            }
        }
        None
    }
}

fn candidate_files() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(SYSTEM_CONFIG_FILE)];
    if let Some(home) = std::env::var_os("HOME").filter(|home| !home.is_empty()) {
        paths.push(PathBuf::from(home).join(USER_CONFIG_FILE));
    }
    paths
}

pub fn read_config_file(path: &Path) -> anyhow::Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse config file {}", path.display()))
}

pub fn write_config_file(path: &Path, config: &FileConfig) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create config dir {}", parent.display()))?;
    }
    let mut raw = serde_json::to_string_pretty(config).context("serialize config")?;
    raw.push('\n');
    std::fs::write(path, raw).with_context(|| format!("write config file {}", path.display()))
}

/// IPv4 address of the interface that routes to the outside world, or loopback when there is
/// none. No packets are sent: connecting a UDP socket only selects a route.
pub fn outbound_ipv4() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };
    probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
