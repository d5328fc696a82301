use crate::alert::DEFAULT_MAX_ALERT_DURATION;
use crate::pipeline::PipelineSettings;
use crate::reliability::LoopSettings;
use crate::supervisor::SupervisorSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::info;

pub const CONFIG_ENV: &str = "RESCUE_MONITOR_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "monitor.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid YAML in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub data_dir: PathBuf,
    pub tick_interval_secs: u64,
    pub stale_threshold_ms: u64,
    pub cooldown_ms: u64,
    pub dedup_retention_hours: u64,
    pub dedup_purge_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub event_queue_capacity: usize,
    pub http: HttpConf,
    pub alert: AlertConf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConf {
    /// ex: "paplay /usr/share/sounds/alarm.oga" or "notify-send 'Cancelled at {location}'"
    pub command: Option<String>,
    pub max_duration_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            tick_interval_secs: 30,
            stale_threshold_ms: 120_000,
            cooldown_ms: 180_000,
            dedup_retention_hours: 10,
            dedup_purge_interval_secs: 3600,
            connect_timeout_secs: 30,
            event_queue_capacity: 64,
            http: HttpConf::default(),
            alert: AlertConf::default(),
        }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".into(),
        }
    }
}

impl Default for AlertConf {
    fn default() -> Self {
        Self {
            command: None,
            max_duration_secs: DEFAULT_MAX_ALERT_DURATION.as_secs(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("tick_interval_secs", self.tick_interval_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("dedup_retention_hours", self.dedup_retention_hours),
            ("dedup_purge_interval_secs", self.dedup_purge_interval_secs),
            ("event_queue_capacity", self.event_queue_capacity as u64),
            ("alert.max_duration_secs", self.alert.max_duration_secs),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
        }
        if self.http.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "http.bind '{}' is not a socket address",
                self.http.bind
            )));
        }
        Ok(())
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn dedup_path(&self) -> PathBuf {
        self.data_dir.join("dedup.json")
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            stale_threshold: Duration::from_millis(self.stale_threshold_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            dedup_retention: Duration::from_secs(self.dedup_retention_hours * 3600),
            dedup_purge_interval: Duration::from_secs(self.dedup_purge_interval_secs),
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            event_queue_capacity: self.event_queue_capacity,
        }
    }

    pub fn alert_max_duration(&self) -> Duration {
        Duration::from_secs(self.alert.max_duration_secs)
    }
}

/// Loads the file named by `RESCUE_MONITOR_CONFIG` (default `monitor.yaml`).
pub async fn load_config() -> Result<MonitorConfig, ConfigError> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    load_config_from(Path::new(&path)).await
}

/// A missing or empty file gives the defaults.
pub async fn load_config_from(path: &Path) -> Result<MonitorConfig, ConfigError> {
    if !path.exists() {
        info!(path = %path.display(), "no config file, using defaults");
        return Ok(MonitorConfig::default());
    }

    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if txt.trim().is_empty() {
        return Ok(MonitorConfig::default());
    }

    let config: MonitorConfig = serde_yaml::from_str(&txt).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    info!(path = %path.display(), "config loaded");
    Ok(config)
}
