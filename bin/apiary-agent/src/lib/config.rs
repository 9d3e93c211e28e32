// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Describes the agent config which may be parsed from a TOML file.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use apiary_monitor::MonitorTimeouts;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config at {}: {}", .0.display(), .1)]
    Parse(PathBuf, #[source] toml::de::Error),
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub monitor: MonitorConfig,
    pub migration: MigrationConfig,
}

impl AgentConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_owned(), e))?;
        toml::from_str(&raw)
            .map_err(|e| ConfigError::Parse(path.to_owned(), e))
    }
}

/// Budgets for the control-channel connections the agent opens.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    /// Total budget for a freshly launched instance's control socket to
    /// appear and accept the handshake.
    pub ready_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            connect_timeout_ms: 5_000,
            command_timeout_ms: 30_000,
            lock_timeout_ms: 30_000,
            ready_timeout_ms: 10_000,
        }
    }
}

impl MonitorConfig {
    pub fn timeouts(&self) -> MonitorTimeouts {
        MonitorTimeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            command: Duration::from_millis(self.command_timeout_ms),
            lock: Duration::from_millis(self.lock_timeout_ms),
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MigrationConfig {
    /// Address incoming-migration listen points bind on when the caller
    /// leaves it unset.
    pub listen_ip: IpAddr,
    /// Directory for generated unix-transport migration sockets.
    pub socket_dir: PathBuf,
    /// Overall budget for one migration's transfer phase.
    pub timeout_secs: u64,
    /// Interval between migration status polls.
    pub poll_interval_ms: u64,
    /// How long a graceful stop waits for the guest before forcing
    /// termination.
    pub stop_timeout_secs: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        MigrationConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            socket_dir: PathBuf::from("/var/run/apiary"),
            timeout_secs: 3_600,
            poll_interval_ms: 2_000,
            stop_timeout_secs: 60,
        }
    }
}

impl MigrationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_sections() {
        let config: AgentConfig = toml::from_str("").unwrap();
        assert_eq!(config, AgentConfig::default());
        assert_eq!(config.migration.poll_interval_ms, 2_000);
        assert_eq!(config.migration.timeout_secs, 3_600);
    }

    #[test]
    fn partial_overrides_keep_other_defaults() {
        let config: AgentConfig = toml::from_str(
            r#"
            [migration]
            poll_interval_ms = 50
            timeout_secs = 2

            [monitor]
            command_timeout_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.migration.poll_interval_ms, 50);
        assert_eq!(config.migration.stop_timeout_secs, 60);
        assert_eq!(config.monitor.command_timeout_ms, 1_000);
        assert_eq!(config.monitor.connect_timeout_ms, 5_000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<AgentConfig>("[migrations]\n").is_err());
    }
}
