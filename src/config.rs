//! Configuration file loading and validation.
//!
//! The TOML file is deserialized into [`ConfigFile`] (one struct per table,
//! every field defaulted the same way the shipped `config.example.toml` is),
//! then validated into a [`Config`] whose [`TargetConfig`] and [`SyncConfig`]
//! are what the orchestrator consumes. Nothing downstream re-validates.
//!
//! ```toml
//! [nas]
//! mac_address = "00:11:32:AA:BB:CC"
//! ip = "192.168.1.50"
//!
//! [backup]
//! local_dir = "/var/lib/vz/dump"
//! nas_dir = "/volume1/pve-backup"
//! ```

use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable consulted when no config path is passed on the command line.
pub const CONFIG_ENV: &str = "NAS_WAKE_SYNC_CONFIG";

/// Exit codes rsync uses for "partial transfer due to error" and
/// "partial transfer due to vanished source files".
pub const DEFAULT_PARTIAL_EXIT_CODES: [i32; 2] = [23, 24];

/// Errors that can occur while loading or validating the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}\nPlease create config.toml from config.example.toml")]
    NotFound(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid MAC address '{0}': expected six hex octets")]
    InvalidMac(String),

    #[error("Invalid broadcast address '{0}': expected an IPv4 address")]
    InvalidBroadcast(String),

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{interval} ({interval_secs}s) must be shorter than {budget} ({budget_secs}s)")]
    IntervalTooLong {
        interval: &'static str,
        interval_secs: u64,
        budget: &'static str,
        budget_secs: u64,
    },

    #[error("backup.rsync_options could not be split: {0}")]
    InvalidOptions(String),

    #[error("notification.enabled requires notification.discord_webhook")]
    MissingWebhook,

    #[error("No configuration path given, {CONFIG_ENV} unset, and no platform config directory")]
    NoDefaultPath,
}

// =============================================================================
// Hardware address
// =============================================================================

/// A 48-bit hardware (MAC) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddress {
    type Err = ConfigError;

    /// Accepts `AA:BB:CC:DD:EE:FF`, `AA-BB-CC-DD-EE-FF` or `AABBCCDDEEFF`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidMac(s.to_string());
        let trimmed = s.trim();

        let hex: String = if trimmed.contains([':', '-']) {
            let parts: Vec<&str> = trimmed.split([':', '-']).collect();
            if parts.len() != 6 || parts.iter().any(|p| p.len() != 2) {
                return Err(invalid());
            }
            parts.concat()
        } else {
            trimmed.to_string()
        };

        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }

        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

// =============================================================================
// File schema
// =============================================================================

/// Raw configuration file, one field per TOML table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub nas: NasSection,
    pub backup: BackupSection,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
}

/// `[nas]` table. Durations are whole seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NasSection {
    pub mac_address: String,
    pub ip: String,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub ssh_key: Option<String>,
    pub max_wait_time: u64,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    pub ssh_ready_wait: u64,
    pub ssh_poll_interval: u64,
    pub ssh_max_wait: u64,
    pub ssh_connect_timeout: u64,
    pub broadcast_address: String,
    pub wol_port: u16,
    pub shutdown_after_sync: bool,
    pub shutdown_command: String,
}

impl Default for NasSection {
    fn default() -> Self {
        Self {
            mac_address: String::new(),
            ip: String::new(),
            ssh_user: "admin".to_string(),
            ssh_port: 22,
            ssh_key: None,
            max_wait_time: 300,
            ping_interval: 5,
            ping_timeout: 1,
            ssh_ready_wait: 30,
            ssh_poll_interval: 5,
            ssh_max_wait: 50,
            ssh_connect_timeout: 5,
            broadcast_address: "255.255.255.255".to_string(),
            wol_port: 9,
            shutdown_after_sync: true,
            shutdown_command: "sudo shutdown -h now".to_string(),
        }
    }
}

/// `[backup]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupSection {
    pub local_dir: String,
    pub nas_dir: String,
    pub rsync_options: String,
    pub rsync_path: String,
    pub partial_exit_codes: Vec<i32>,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            local_dir: String::new(),
            nas_dir: String::new(),
            rsync_options: "-avhP --delete --checksum".to_string(),
            rsync_path: "rsync".to_string(),
            partial_exit_codes: DEFAULT_PARTIAL_EXIT_CODES.to_vec(),
        }
    }
}

/// `[log]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Optional file that receives a copy of every log line.
    pub log_file: Option<PathBuf>,
    /// Default filter directive when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            log_level: "info".to_string(),
        }
    }
}

/// `[notification]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotificationConfig {
    pub enabled: bool,
    /// Kept out of `check-config --json` output.
    #[serde(skip_serializing)]
    pub discord_webhook: Option<String>,
    pub on_success: bool,
    pub on_failure: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            discord_webhook: None,
            on_success: true,
            on_failure: true,
        }
    }
}

// =============================================================================
// Validated records
// =============================================================================

/// Who to log in as when talking to the NAS over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Credential {
    pub user: String,
    pub port: u16,
    /// Identity file; `None` leaves key selection to ssh (agent, defaults).
    pub key_path: Option<PathBuf>,
}

impl Credential {
    /// `user@host` for ssh and rsync.
    pub fn login(&self, host: &str) -> String {
        format!("{}@{}", self.user, host)
    }

    /// The `ssh` invocation used as rsync's remote shell.
    pub fn remote_shell(&self) -> String {
        match &self.key_path {
            Some(key) => format!(
                "ssh -i {} -p {}",
                shell_words::quote(&key.to_string_lossy()),
                self.port
            ),
            None => format!("ssh -p {}", self.port),
        }
    }
}

/// Everything needed to wake the NAS and decide when it is ready.
#[derive(Debug, Clone, Serialize)]
pub struct TargetConfig {
    #[serde(serialize_with = "serialize_display")]
    pub mac: MacAddress,
    pub ip: String,
    pub credential: Credential,
    pub broadcast: Ipv4Addr,
    pub wol_port: u16,
    /// Budget for the device to answer pings.
    pub max_wait: Duration,
    pub poll_interval: Duration,
    pub ping_timeout: Duration,
    /// Pause between first ping reply and the first readiness check.
    pub settle_delay: Duration,
    pub ready_poll_interval: Duration,
    pub ready_max_wait: Duration,
    pub ssh_connect_timeout: Duration,
    pub shutdown_after_sync: bool,
    pub shutdown_command: String,
}

/// What to transfer and how.
#[derive(Debug, Clone, Serialize)]
pub struct SyncConfig {
    pub source: PathBuf,
    /// Remote directory on the NAS (without the `user@host:` prefix).
    pub destination: String,
    /// Option string exactly as configured.
    pub raw_options: String,
    /// `raw_options` split shell-style.
    pub options: Vec<String>,
    pub tool: String,
    pub partial_exit_codes: Vec<i32>,
}

/// Fully validated configuration for one run.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub path: PathBuf,
    pub target: TargetConfig,
    pub sync: SyncConfig,
    pub log: LogConfig,
    pub notification: NotificationConfig,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Parse and validate TOML text; `path` is only used for messages.
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_file(file, path)
    }

    /// Validate a deserialized file.
    pub fn from_file(file: ConfigFile, path: &Path) -> Result<Self, ConfigError> {
        let ConfigFile {
            nas,
            backup,
            log,
            notification,
        } = file;

        let mac: MacAddress = nas.mac_address.parse()?;
        require("nas.ip", &nas.ip)?;
        require("nas.ssh_user", &nas.ssh_user)?;
        require("backup.local_dir", &backup.local_dir)?;
        require("backup.nas_dir", &backup.nas_dir)?;
        require("backup.rsync_path", &backup.rsync_path)?;

        shorter_than(
            "nas.ping_interval",
            nas.ping_interval,
            "nas.max_wait_time",
            nas.max_wait_time,
        )?;
        shorter_than(
            "nas.ssh_poll_interval",
            nas.ssh_poll_interval,
            "nas.ssh_max_wait",
            nas.ssh_max_wait,
        )?;

        let broadcast: Ipv4Addr = nas
            .broadcast_address
            .parse()
            .map_err(|_| ConfigError::InvalidBroadcast(nas.broadcast_address.clone()))?;

        let options = shell_words::split(&backup.rsync_options)
            .map_err(|e| ConfigError::InvalidOptions(e.to_string()))?;

        if notification.enabled
            && notification
                .discord_webhook
                .as_deref()
                .is_none_or(|url| url.trim().is_empty())
        {
            return Err(ConfigError::MissingWebhook);
        }

        let target = TargetConfig {
            mac,
            ip: nas.ip.trim().to_string(),
            credential: Credential {
                user: nas.ssh_user,
                port: nas.ssh_port,
                key_path: nas.ssh_key.as_deref().map(expand_tilde),
            },
            broadcast,
            wol_port: nas.wol_port,
            max_wait: Duration::from_secs(nas.max_wait_time),
            poll_interval: Duration::from_secs(nas.ping_interval),
            ping_timeout: Duration::from_secs(nas.ping_timeout),
            settle_delay: Duration::from_secs(nas.ssh_ready_wait),
            ready_poll_interval: Duration::from_secs(nas.ssh_poll_interval),
            ready_max_wait: Duration::from_secs(nas.ssh_max_wait),
            ssh_connect_timeout: Duration::from_secs(nas.ssh_connect_timeout),
            shutdown_after_sync: nas.shutdown_after_sync,
            shutdown_command: nas.shutdown_command,
        };

        let sync = SyncConfig {
            source: expand_tilde(trim_trailing_slashes(&backup.local_dir)),
            destination: trim_trailing_slashes(&backup.nas_dir).to_string(),
            raw_options: backup.rsync_options,
            options,
            tool: backup.rsync_path,
            partial_exit_codes: backup.partial_exit_codes,
        };

        Ok(Self {
            path: path.to_path_buf(),
            target,
            sync,
            log,
            notification,
        })
    }
}

/// Resolve the config path: explicit argument, then [`CONFIG_ENV`] (which
/// may come from a `.env` file), then the platform config directory.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    if let Ok(path) = dotenvy::var(CONFIG_ENV)
        && !path.trim().is_empty()
    {
        return Ok(PathBuf::from(path));
    }
    default_config_path().ok_or(ConfigError::NoDefaultPath)
}

/// `<config dir>/nas-wake-sync/config.toml`, e.g. `~/.config/nas-wake-sync/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "nas-wake-sync")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

fn require(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::Empty(field))
    } else {
        Ok(())
    }
}

fn shorter_than(
    interval: &'static str,
    interval_secs: u64,
    budget: &'static str,
    budget_secs: u64,
) -> Result<(), ConfigError> {
    if interval_secs < budget_secs {
        Ok(())
    } else {
        Err(ConfigError::IntervalTooLong {
            interval,
            interval_secs,
            budget,
            budget_secs,
        })
    }
}

/// Drop trailing `/`, but keep a bare root as `/`.
fn trim_trailing_slashes(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" if path.starts_with('/') => "/",
        trimmed => trimmed,
    }
}

/// Expand a leading `~` to the home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

fn serialize_display<T: fmt::Display, S: serde::Serializer>(
    value: &T,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}
