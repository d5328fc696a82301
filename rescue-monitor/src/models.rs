use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds since the Unix epoch.
pub type EpochMillis = i64;

/// Place being watched. The id is opaque to the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub name: String,
}

/// Everything needed to open the MQTT subscription. Supplied by whoever
/// activates monitoring, stored verbatim in the persisted record.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub broker_host: String,
    pub broker_port: u16,
    #[serde(default)]
    pub tls: bool,
    pub channel: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
}

fn default_qos() -> u8 {
    1
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_client_id_prefix() -> String {
    "rescue-monitor".into()
}

impl ChannelConfig {
    /// Returns the first reason this config cannot open a subscription.
    pub fn validate(&self) -> Result<(), String> {
        if self.broker_host.trim().is_empty() {
            return Err("broker host is empty".into());
        }
        if self.broker_port == 0 {
            return Err("broker port is 0".into());
        }
        if self.channel.trim().is_empty() {
            return Err("channel name is empty".into());
        }
        if self.qos > 2 {
            return Err(format!("qos {} is not in 0..=2", self.qos));
        }
        // rumqttc rejects keep-alive intervals below 5s
        if self.keep_alive_secs < 5 {
            return Err(format!("keep-alive {}s is below 5s", self.keep_alive_secs));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err("username and password must be given together".into());
        }
        if self.client_id_prefix.trim().is_empty() {
            return Err("client id prefix is empty".into());
        }
        Ok(())
    }

    pub fn mqtt_qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("broker_host", &self.broker_host)
            .field("broker_port", &self.broker_port)
            .field("tls", &self.tls)
            .field("channel", &self.channel)
            .field("qos", &self.qos)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("client_id_prefix", &self.client_id_prefix)
            .finish()
    }
}

/// The persisted monitoring record. Exists only while monitoring is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorState {
    pub location: Location,
    pub channel_config: ChannelConfig,
    pub started_at: EpochMillis,
    pub cancelled_count: u64,
    pub claimed_count: u64,
    pub reconnect_count: u64,
    pub last_alert_at: EpochMillis,
}

impl MonitorState {
    pub fn summary(&self) -> StateSummary {
        StateSummary {
            location: self.location.clone(),
            channel: self.channel_config.channel.clone(),
            broker: format!("{}:{}", self.channel_config.broker_host, self.channel_config.broker_port),
            started_at: self.started_at,
            cancelled_count: self.cancelled_count,
            claimed_count: self.claimed_count,
            reconnect_count: self.reconnect_count,
            last_alert_at: self.last_alert_at,
        }
    }
}

/// Credential-free view of [`MonitorState`] for logs and the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateSummary {
    pub location: Location,
    pub channel: String,
    pub broker: String,
    pub started_at: EpochMillis,
    pub cancelled_count: u64,
    pub claimed_count: u64,
    pub reconnect_count: u64,
    pub last_alert_at: EpochMillis,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorStatus {
    Inactive,
    Active(MonitorState),
}

impl MonitorStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, MonitorStatus::Active(_))
    }

    pub fn into_state(self) -> Option<MonitorState> {
        match self {
            MonitorStatus::Active(state) => Some(state),
            MonitorStatus::Inactive => None,
        }
    }

    pub fn as_state(&self) -> Option<&MonitorState> {
        match self {
            MonitorStatus::Active(state) => Some(state),
            MonitorStatus::Inactive => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChannelConfig {
        ChannelConfig {
            broker_host: "broker.local".into(),
            broker_port: 8883,
            tls: true,
            channel: "rescue/downtown".into(),
            qos: 1,
            username: Some("watcher".into()),
            password: Some("hunter2".into()),
            keep_alive_secs: 30,
            client_id_prefix: "rescue".into(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let mut c = config();
        c.broker_host = " ".into();
        assert!(c.validate().is_err());

        let mut c = config();
        c.channel.clear();
        assert!(c.validate().is_err());

        let mut c = config();
        c.qos = 3;
        assert!(c.validate().is_err());

        let mut c = config();
        c.password = None;
        assert!(c.validate().is_err());

        let mut c = config();
        c.keep_alive_secs = 1;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", config());
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn test_defaults_applied_when_deserializing() {
        let c: ChannelConfig = serde_json::from_str(
            r#"{"broker_host":"h","broker_port":1883,"channel":"c"}"#,
        )
        .unwrap();
        assert_eq!(c.qos, 1);
        assert_eq!(c.keep_alive_secs, 30);
        assert!(!c.tls);
        assert_eq!(c.mqtt_qos(), QoS::AtLeastOnce);
    }
}
