use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;

use crate::utils::error::AgentError;

pub const DEFAULT_FULL_REFRESH_INTERVAL_MS: u64 = 300_000;
pub const DEFAULT_BATCH_WINDOW_MS: u64 = 2_000;
pub const DEFAULT_HISTORICAL_BATCH_INTERVAL_MS: u64 = 60_000;

/// Response from the active-config endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ActiveConfigResponse {
    #[serde(rename = "hasConfig", alias = "has_config", default)]
    pub has_config: bool,
    #[serde(default)]
    pub config: Option<RemoteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(rename = "config_name", alias = "configName", default)]
    pub config_name: Option<String>,
    #[serde(rename = "polling_config", alias = "pollingConfig")]
    pub polling_config: PollingConfig,
}

/// The full polling configuration pushed by the control plane. At most one
/// is active at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(
        rename = "fullRefreshIntervalMs",
        alias = "full_refresh_interval_ms",
        default = "default_full_refresh"
    )]
    pub full_refresh_interval_ms: u64,
    #[serde(
        rename = "batchWindowMs",
        alias = "batch_window_ms",
        default = "default_batch_window"
    )]
    pub batch_window_ms: u64,
    #[serde(
        rename = "historicalBatchIntervalMs",
        alias = "historical_batch_interval_ms",
        default = "default_historical_batch"
    )]
    pub historical_batch_interval_ms: u64,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_full_refresh() -> u64 {
    DEFAULT_FULL_REFRESH_INTERVAL_MS
}

fn default_batch_window() -> u64 {
    DEFAULT_BATCH_WINDOW_MS
}

fn default_historical_batch() -> u64 {
    DEFAULT_HISTORICAL_BATCH_INTERVAL_MS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(rename = "deviceId", alias = "device_id", alias = "id")]
    pub device_id: String,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(
        rename = "connectionParams",
        alias = "connection_params",
        alias = "connection",
        default
    )]
    pub connection: ConnectionParams,
    #[serde(rename = "pollGroups", alias = "poll_groups", alias = "groups", default)]
    pub poll_groups: Vec<PollGroupConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Rtu,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Rtu => write!(f, "rtu"),
        }
    }
}

/// Raw connection parameters as sent by the control plane. Both snake_case
/// and camelCase field spellings are accepted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParams {
    #[serde(default, alias = "deviceIp", skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(
        rename = "serialPort",
        alias = "serial_port",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub serial_port: Option<String>,
    #[serde(
        rename = "baudRate",
        alias = "baud_rate",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub baud_rate: Option<u32>,
    #[serde(
        rename = "unitId",
        alias = "unit_id",
        alias = "slaveId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub unit_id: Option<u8>,
    #[serde(
        rename = "timeoutMs",
        alias = "timeout_ms",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout_ms: Option<u64>,
}

impl ConnectionParams {
    /// Resolve the protocol: an explicit value wins, otherwise infer from
    /// which address fields are present.
    pub fn resolve_protocol(&self, explicit: Option<Protocol>) -> Result<Protocol, AgentError> {
        if let Some(protocol) = explicit {
            return Ok(protocol);
        }
        if self.ip.is_some() {
            return Ok(Protocol::Tcp);
        }
        if self.serial_port.is_some() {
            return Ok(Protocol::Rtu);
        }
        Err(AgentError::ConfigError(
            "cannot infer protocol: neither ip nor serialPort is set".to_string(),
        ))
    }

    /// Canonical pool key. Tuning fields such as timeoutMs are deliberately
    /// excluded so equivalent configs share one pooled handle.
    pub fn canonical_key(&self, protocol: Protocol) -> String {
        match protocol {
            Protocol::Tcp => format!(
                "tcp:{}:{}:{}",
                self.ip.as_deref().unwrap_or(""),
                self.port.unwrap_or(502),
                self.unit_id.unwrap_or(1)
            ),
            Protocol::Rtu => format!(
                "rtu:{}:{}:{}",
                self.serial_port.as_deref().unwrap_or(""),
                self.baud_rate.unwrap_or(9600),
                self.unit_id.unwrap_or(1)
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollGroupConfig {
    #[serde(rename = "groupId", alias = "group_id", alias = "id")]
    pub group_id: String,
    #[serde(rename = "intervalMs", alias = "interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub registers: Vec<RegisterConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterConfig {
    #[serde(rename = "registerId", alias = "register_id", alias = "id")]
    pub register_id: String,
    pub address: u16,
    #[serde(
        rename = "functionCode",
        alias = "function_code",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub function_code: Option<u8>,
}

impl PollingConfig {
    /// Schema checks the control plane should already guarantee, revalidated
    /// here so a malformed push fails the command instead of the scheduler.
    pub fn validate(&self) -> Result<(), AgentError> {
        let mut device_ids = HashSet::new();
        for device in &self.devices {
            if !device_ids.insert(device.device_id.as_str()) {
                return Err(AgentError::ConfigError(format!(
                    "duplicate deviceId: {}",
                    device.device_id
                )));
            }
            device.connection.resolve_protocol(device.protocol)?;

            let mut group_ids = HashSet::new();
            for group in &device.poll_groups {
                if !group_ids.insert(group.group_id.as_str()) {
                    return Err(AgentError::ConfigError(format!(
                        "duplicate groupId {} in device {}",
                        group.group_id, device.device_id
                    )));
                }
                if group.interval_ms == 0 {
                    return Err(AgentError::ConfigError(format!(
                        "group {} has zero intervalMs",
                        group.group_id
                    )));
                }
                let mut register_ids = HashSet::new();
                for register in &group.registers {
                    if !register_ids.insert(register.register_id.as_str()) {
                        return Err(AgentError::ConfigError(format!(
                            "duplicate registerId {} in group {}",
                            register.register_id, group.group_id
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "config id must be a string or number, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_inference() {
        let tcp = ConnectionParams {
            ip: Some("10.0.0.5".to_string()),
            ..Default::default()
        };
        assert_eq!(tcp.resolve_protocol(None).unwrap(), Protocol::Tcp);

        let rtu = ConnectionParams {
            serial_port: Some("/dev/ttyUSB0".to_string()),
            ..Default::default()
        };
        assert_eq!(rtu.resolve_protocol(None).unwrap(), Protocol::Rtu);

        let neither = ConnectionParams::default();
        assert!(neither.resolve_protocol(None).is_err());
        assert_eq!(
            neither.resolve_protocol(Some(Protocol::Tcp)).unwrap(),
            Protocol::Tcp
        );
    }

    #[test]
    fn test_canonical_key_ignores_timeout() {
        let a = ConnectionParams {
            ip: Some("10.0.0.5".to_string()),
            port: Some(502),
            timeout_ms: Some(5_000),
            ..Default::default()
        };
        let b = ConnectionParams {
            ip: Some("10.0.0.5".to_string()),
            port: Some(502),
            timeout_ms: None,
            ..Default::default()
        };
        assert_eq!(
            a.canonical_key(Protocol::Tcp),
            b.canonical_key(Protocol::Tcp)
        );
    }

    #[test]
    fn test_accepts_both_field_conventions() {
        let camel = serde_json::json!({
            "fullRefreshIntervalMs": 60000,
            "devices": [{
                "deviceId": "dev-1",
                "connectionParams": { "deviceIp": "10.0.0.9", "unitId": 3 },
                "pollGroups": [{
                    "groupId": "g1",
                    "intervalMs": 1000,
                    "registers": [{ "registerId": "r1", "address": 40001 }]
                }]
            }]
        });
        let config: PollingConfig = serde_json::from_value(camel).unwrap();
        assert_eq!(config.full_refresh_interval_ms, 60_000);
        assert_eq!(config.devices[0].connection.ip.as_deref(), Some("10.0.0.9"));
        assert_eq!(config.devices[0].connection.unit_id, Some(3));

        let snake = serde_json::json!({
            "devices": [{
                "device_id": "dev-2",
                "connection": { "serial_port": "/dev/ttyS1", "baud_rate": 19200 },
                "poll_groups": [{
                    "group_id": "g1",
                    "interval_ms": 500,
                    "registers": [{ "register_id": "r1", "address": 30001 }]
                }]
            }]
        });
        let config: PollingConfig = serde_json::from_value(snake).unwrap();
        assert_eq!(config.batch_window_ms, DEFAULT_BATCH_WINDOW_MS);
        assert_eq!(
            config.devices[0].connection.serial_port.as_deref(),
            Some("/dev/ttyS1")
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_duplicates_and_zero_interval() {
        let bad = serde_json::json!({
            "devices": [{
                "deviceId": "dev-1",
                "connectionParams": { "ip": "10.0.0.9" },
                "pollGroups": [{
                    "groupId": "g1",
                    "intervalMs": 0,
                    "registers": []
                }]
            }]
        });
        let config: PollingConfig = serde_json::from_value(bad).unwrap();
        assert!(config.validate().is_err());
    }
}
