//! Daemon configuration (spec §6 "CLI and configuration") and the CLI
//! surface that overrides it, in the style of the teacher's service
//! binaries: a `clap`-derived `Opts` layered on top of a `serde`-deserialised
//! config file.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::io_scheduler::PairingPolicy;
use crate::model::ResourceFamily;

/// Per-family sync thresholds (spec §4.7 "Sync trigger").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncThresholds {
    pub entries: u64,
    pub bytes: u64,
    #[serde(with = "humantime_serde")]
    pub age: std::time::Duration,
}

impl Default for SyncThresholds {
    fn default() -> Self {
        Self { entries: 16, bytes: 1 << 30, age: std::time::Duration::from_secs(60) }
    }
}

/// Static daemon configuration, read from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// This host's identifier, used to stamp every DSS lock.
    pub host: String,
    /// The single resource family this daemon instance manages.
    pub family: ResourceFamily,
    /// Unix socket path for the Communication Boundary.
    pub socket_path: PathBuf,
    /// Lock-file path preventing two daemons for the same family.
    pub lock_file: PathBuf,
    /// Mount point prefix; a device's mount path is `{prefix}/{device_id}`.
    pub mount_prefix: PathBuf,
    /// Device/medium pairing policy used by the I/O scheduler.
    pub policy: PairingPolicy,
    /// Per-family sync thresholds.
    pub sync: SyncThresholds,
    /// tape model -> compatible drive models, used by select-drive-to-free
    /// and by the medium selector's compatibility check.
    #[serde(default)]
    pub drive_compat: HashMap<String, Vec<String>>,
    /// DSS (etcd) endpoint; absent means use the in-memory test double.
    #[serde(default)]
    pub dss_endpoint: Option<String>,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_owned(), source })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_owned(), source })
    }

    /// Compatibility check between a tape model and a drive model (spec §4.4
    /// "select-drive-to-free": "tape<=>drive compatibility from
    /// configuration"). Non-tape families compare resource names directly.
    pub fn tape_compatible(&self, tape_model: &str, drive_model: &str) -> bool {
        match self.drive_compat.get(tape_model) {
            Some(models) => models.iter().any(|m| m == drive_model),
            None => tape_model == drive_model,
        }
    }
}

#[derive(Debug, snafu::Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to read config file '{}': {}", path.display(), source))]
    Read { path: PathBuf, source: std::io::Error },
    #[snafu(display("failed to parse config file '{}': {}", path.display(), source))]
    Parse { path: PathBuf, source: toml::de::Error },
}

/// CLI surface overriding the config file, matching the teacher's
/// `clap`-derive binaries.
#[derive(Debug, clap::Parser)]
#[command(name = "phobosd", about = "Phobos Local Resource Scheduler daemon")]
pub struct Opts {
    /// Path to the TOML configuration file.
    #[arg(long, env = "PHOBOSD_CONFIG", default_value = "/etc/phobos/lrs.toml")]
    pub config: PathBuf,

    /// Override the configured Unix socket path.
    #[arg(long, env = "PHOBOSD_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Override the configured resource family.
    #[arg(long, value_enum)]
    pub family: Option<CliFamily>,

    /// Log level filter, e.g. "info" or "phobos_lrs=debug".
    #[arg(long, env = "PHOBOSD_LOG", default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CliFamily {
    Tape,
    Directory,
    RadosPool,
}

impl From<CliFamily> for ResourceFamily {
    fn from(value: CliFamily) -> Self {
        match value {
            CliFamily::Tape => ResourceFamily::Tape,
            CliFamily::Directory => ResourceFamily::Directory,
            CliFamily::RadosPool => ResourceFamily::RadosPool,
        }
    }
}

impl Opts {
    /// Load the config file and apply CLI overrides on top of it.
    pub fn resolve(self) -> Result<Config, ConfigError> {
        let mut config = Config::from_file(&self.config)?;
        if let Some(socket) = self.socket {
            config.socket_path = socket;
        }
        if let Some(family) = self.family {
            config.family = family.into();
        }
        Ok(config)
    }
}
