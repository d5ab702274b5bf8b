use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sched::{SchedulerError, delay_from_secs};

pub const DEFAULT_MASTER_PORT: u16 = 27016;
pub const DEFAULT_TICK_RATE: u32 = 60;

/// Broker configuration as read from disk. Delays are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub listen_port: u16,
    pub max_connections: usize,
    /// Cap on punch-through requests in flight at once.
    pub max_nat_punchthrough_connections: usize,
    pub drop_server_delay: f32,
    pub clear_contact_delay: f32,
    pub max_connection_duration: f32,
    pub tick_rate: u32,
    pub newer_version_notice: String,
    /// Shell command run whenever a listed server gains players.
    pub new_player_cmd: Option<String>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_MASTER_PORT,
            max_connections: 256,
            max_nat_punchthrough_connections: 256,
            drop_server_delay: 30.0,
            clear_contact_delay: 5.0,
            max_connection_duration: 20.0,
            tick_rate: DEFAULT_TICK_RATE,
            newer_version_notice: String::from(
                "There is a new version available. Please update to see all servers.",
            ),
            new_player_cmd: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{field}: {source}")]
    Delay {
        field: &'static str,
        source: SchedulerError,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Validated timings and limits the broker runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerSettings {
    pub drop_server_delay: Duration,
    pub clear_contact_delay: Duration,
    pub max_connection_duration: Duration,
    pub max_punch_requests: usize,
    pub newer_version_notice: String,
}

impl MasterConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn tick_interval(&self) -> Result<Duration, ConfigError> {
        if self.tick_rate == 0 {
            return Err(ConfigError::Zero("tick_rate"));
        }
        Ok(Duration::from_secs(1) / self.tick_rate)
    }

    pub fn settings(&self) -> Result<BrokerSettings, ConfigError> {
        let delay = |field: &'static str, secs: f32| {
            delay_from_secs(secs).map_err(|source| ConfigError::Delay { field, source })
        };
        if self.max_connections == 0 {
            return Err(ConfigError::Zero("max_connections"));
        }
        if self.max_nat_punchthrough_connections == 0 {
            return Err(ConfigError::Zero("max_nat_punchthrough_connections"));
        }

        Ok(BrokerSettings {
            drop_server_delay: delay("drop_server_delay", self.drop_server_delay)?,
            clear_contact_delay: delay("clear_contact_delay", self.clear_contact_delay)?,
            max_connection_duration: delay("max_connection_duration", self.max_connection_duration)?,
            max_punch_requests: self.max_nat_punchthrough_connections,
            newer_version_notice: self.newer_version_notice.clone(),
        })
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        let config = MasterConfig::default();
        Self {
            drop_server_delay: Duration::from_secs(30),
            clear_contact_delay: Duration::from_secs(5),
            max_connection_duration: Duration::from_secs(20),
            max_punch_requests: config.max_nat_punchthrough_connections,
            newer_version_notice: config.newer_version_notice,
        }
    }
}
