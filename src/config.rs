//! Daemon configuration.
//!
//! Loaded once at startup from a TOML file named on argv (or the
//! compiled-in default path). Every section and field has a default, so
//! an empty file is a valid configuration.
//!
//! ```toml
//! [daemon]
//! socket_path = "/run/paddockd.socket"
//! workers = 16
//!
//! [container]
//! start_timeout_ms = 120000
//! aging_time_ms = 86400000
//! ```

use crate::constants::*;
use crate::error::{Error, ErrorKind, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub daemon: DaemonSection,
    pub container: ContainerSection,
    pub log: LogSection,
    pub keyvalue: KeyValueSection,
}

/// Socket and thread-pool settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonSection {
    /// Control socket path.
    pub socket_path: PathBuf,
    /// Group name that owns the control socket.
    pub socket_group: String,
    /// RPC worker threads.
    pub workers: usize,
    /// Event-queue worker threads.
    pub event_workers: usize,
    /// Maximum simultaneously connected clients.
    pub max_clients: usize,
    /// Maximum request frame length in bytes.
    pub max_msg_len: usize,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            socket_group: DEFAULT_SOCKET_GROUP.to_string(),
            workers: DEFAULT_WORKERS,
            event_workers: DEFAULT_EVENT_WORKERS,
            max_clients: DEFAULT_MAX_CLIENTS,
            max_msg_len: DEFAULT_MAX_MSG_LEN,
        }
    }
}

/// Per-container policy defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerSection {
    /// Launcher handshake deadline.
    pub start_timeout_ms: u64,
    /// Grace period between SIGTERM and SIGKILL.
    pub kill_timeout_ms: u64,
    /// Delay before a dead container respawns.
    pub respawn_delay_ms: u64,
    /// How long dead containers are kept before the aging reap.
    pub aging_time_ms: u64,
    /// Cap on live containers.
    pub max_total: usize,
    /// On-disk cap for stdout/stderr streams.
    pub stdout_limit: u64,
    /// Parent directory for container working directories.
    pub tmp_dir: PathBuf,
    /// Give every container a scope named after itself.
    pub default_scope: bool,
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            start_timeout_ms: DEFAULT_START_TIMEOUT_MS,
            kill_timeout_ms: DEFAULT_KILL_TIMEOUT_MS,
            respawn_delay_ms: DEFAULT_RESPAWN_DELAY_MS,
            aging_time_ms: DEFAULT_AGING_TIME_MS,
            max_total: DEFAULT_MAX_CONTAINERS,
            stdout_limit: DEFAULT_STDOUT_LIMIT,
            tmp_dir: PathBuf::from(DEFAULT_TMP_DIR),
            default_scope: false,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSection {
    /// Filter directive for the subscriber, e.g. `paddock=debug`.
    pub filter: String,
    /// Log verbose lock/event traffic.
    pub verbose: bool,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            filter: "paddock=info".to_string(),
            verbose: false,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeyValueSection {
    /// Root directory for per-container records.
    pub root: PathBuf,
}

impl Default for KeyValueSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_KEYVALUE_ROOT),
        }
    }
}

impl Config {
    /// Loads configuration from `path`. A missing file yields defaults;
    /// a malformed file is a hard error.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(Error::from(err).context(format!("read config {}", path.display())))
            }
        };
        toml::from_str(&text).map_err(|err| {
            Error::new(
                ErrorKind::InvalidValue,
                format!("parse config {}: {}", path.display(), err),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.daemon.workers, DEFAULT_WORKERS);
        assert_eq!(cfg.container.start_timeout_ms, DEFAULT_START_TIMEOUT_MS);
        assert_eq!(cfg.keyvalue.root, PathBuf::from(DEFAULT_KEYVALUE_ROOT));
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let cfg: Config = toml::from_str("[daemon]\nworkers = 4\n").unwrap();
        assert_eq!(cfg.daemon.workers, 4);
        assert_eq!(cfg.daemon.max_clients, DEFAULT_MAX_CLIENTS);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: std::result::Result<Config, _> = toml::from_str("[daemon]\nbogus = 1\n");
        assert!(result.is_err());
    }
}
