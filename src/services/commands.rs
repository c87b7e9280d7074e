use futures_util::stream::{self, StreamExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::buffer::Sample;
use crate::config::polling::{ConnectionParams, Protocol, RemoteConfig};
use crate::modbus::connection::ConnectionPool;
use crate::modbus::ops::{self, ReadFunction, WriteRequest};
use crate::modbus::optimizer::normalize_address;
use crate::services::watcher::ConfigWatcher;
use crate::utils::error::AgentError;

const SCAN_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const SCAN_CONCURRENCY: usize = 32;

/// Everything the control plane can push down the socket.
#[derive(Debug)]
pub enum InboundMessage {
    Connected { agent_id: String },
    HeartbeatAck,
    Command(Command),
    Unknown(String),
}

#[derive(Debug)]
pub struct Command {
    pub command_id: Option<String>,
    pub kind: CommandKind,
}

#[derive(Debug)]
pub enum CommandKind {
    SetPollingConfig(SetPollingConfigParams),
    NetworkScan(NetworkScanParams),
    ModbusRead(ModbusReadParams),
    ModbusWrite(ModbusWriteParams),
    TestCommunication(TestCommunicationParams),
}

#[derive(Debug, Deserialize)]
pub struct SetPollingConfigParams {
    pub config: RemoteConfig,
}

#[derive(Debug, Deserialize)]
pub struct NetworkScanParams {
    /// First three octets, e.g. "192.168.1".
    #[serde(rename = "ipBase", alias = "ip_base", alias = "subnet")]
    pub ip_base: String,
    #[serde(rename = "rangeStart", alias = "range_start", default = "default_range_start")]
    pub range_start: u8,
    #[serde(rename = "rangeEnd", alias = "range_end", default = "default_range_end")]
    pub range_end: u8,
    #[serde(default = "default_scan_port")]
    pub port: u16,
}

fn default_range_start() -> u8 {
    1
}

fn default_range_end() -> u8 {
    254
}

fn default_scan_port() -> u16 {
    502
}

#[derive(Debug, Deserialize)]
pub struct ModbusReadParams {
    #[serde(
        rename = "connectionParams",
        alias = "connection_params",
        alias = "connection",
        default
    )]
    pub connection: ConnectionParams,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    pub address: u16,
    #[serde(default = "default_read_count")]
    pub count: u16,
    #[serde(rename = "functionCode", alias = "function_code", alias = "fc", default)]
    pub function_code: Option<u8>,
}

fn default_read_count() -> u16 {
    1
}

#[derive(Debug, Deserialize)]
pub struct ModbusWriteParams {
    #[serde(
        rename = "connectionParams",
        alias = "connection_params",
        alias = "connection",
        default
    )]
    pub connection: ConnectionParams,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    pub address: u16,
    #[serde(rename = "functionCode", alias = "function_code", alias = "fc", default)]
    pub function_code: Option<u8>,
    pub value: Value,
}

#[derive(Debug, Deserialize)]
pub struct TestCommunicationParams {
    #[serde(
        rename = "connectionParams",
        alias = "connection_params",
        alias = "connection",
        default
    )]
    pub connection: ConnectionParams,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub address: Option<u16>,
}

/// Parse an inbound frame, accepting both the `command`/`commandId` and the
/// `type`/`command_id` field conventions.
pub fn parse_inbound(text: &str) -> Result<InboundMessage, AgentError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| AgentError::CommandError(format!("invalid JSON frame: {}", e)))?;

    let kind = value
        .get("command")
        .and_then(Value::as_str)
        .or_else(|| value.get("type").and_then(Value::as_str))
        .ok_or_else(|| AgentError::CommandError("frame has no command or type".to_string()))?
        .to_string();

    let command_id = ["commandId", "command_id"]
        .iter()
        .find_map(|field| value.get(*field))
        .map(|id| match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });

    // Params may arrive nested or at the top level of the frame.
    let params = value
        .get("params")
        .filter(|p| p.is_object())
        .cloned()
        .unwrap_or_else(|| value.clone());

    let message = match kind.as_str() {
        "connected" => {
            let agent_id = value
                .get("agentId")
                .or_else(|| value.get("agent_id"))
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    AgentError::CommandError("connected frame has no agentId".to_string())
                })?;
            InboundMessage::Connected {
                agent_id: agent_id.to_string(),
            }
        }
        "heartbeat_ack" => InboundMessage::HeartbeatAck,
        "set_polling_config" => InboundMessage::Command(Command {
            command_id,
            kind: CommandKind::SetPollingConfig(parse_params(params)?),
        }),
        "network_scan" => InboundMessage::Command(Command {
            command_id,
            kind: CommandKind::NetworkScan(parse_params(params)?),
        }),
        "modbus_read" => InboundMessage::Command(Command {
            command_id,
            kind: CommandKind::ModbusRead(parse_params(params)?),
        }),
        "modbus_write" => InboundMessage::Command(Command {
            command_id,
            kind: CommandKind::ModbusWrite(parse_params(params)?),
        }),
        "test_communication" => InboundMessage::Command(Command {
            command_id,
            kind: CommandKind::TestCommunication(parse_params(params)?),
        }),
        other => InboundMessage::Unknown(other.to_string()),
    };
    Ok(message)
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, AgentError> {
    serde_json::from_value(params)
        .map_err(|e| AgentError::CommandError(format!("invalid command params: {}", e)))
}

pub fn result_frame(command_id: &Option<String>, result_type: &str, payload: Value) -> Value {
    let mut frame = json!({
        "commandId": command_id,
        "type": result_type,
    });
    if let (Some(frame_obj), Some(payload_obj)) = (frame.as_object_mut(), payload.as_object()) {
        for (key, entry) in payload_obj {
            frame_obj.insert(key.clone(), entry.clone());
        }
    }
    frame
}

pub fn error_frame(command_id: &Option<String>, error: &str) -> Value {
    json!({
        "commandId": command_id,
        "type": "error",
        "error": error,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateEntry {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "registerId")]
    pub register_id: String,
    pub value: u16,
}

pub fn data_update_frame(is_full_refresh: bool, updates: Vec<UpdateEntry>) -> Value {
    json!({
        "type": "data_update",
        "timestamp": Sample::iteration_timestamp(),
        "isFullRefresh": is_full_refresh,
        "updates": updates,
    })
}

pub fn heartbeat_frame() -> Value {
    json!({ "type": "heartbeat" })
}

/// Executes control-plane commands against the local pool and scheduler.
/// Every command resolves to exactly one outbound frame: a typed result or a
/// typed error.
pub struct CommandExecutor {
    pool: Arc<ConnectionPool>,
    watcher: Arc<ConfigWatcher>,
}

impl CommandExecutor {
    pub fn new(pool: Arc<ConnectionPool>, watcher: Arc<ConfigWatcher>) -> Self {
        Self { pool, watcher }
    }

    pub async fn execute(&self, command: Command) -> Value {
        let command_id = command.command_id.clone();
        let outcome = match command.kind {
            CommandKind::SetPollingConfig(params) => self.set_polling_config(params).await,
            CommandKind::NetworkScan(params) => self.network_scan(params).await,
            CommandKind::ModbusRead(params) => self.modbus_read(params).await,
            CommandKind::ModbusWrite(params) => self.modbus_write(params).await,
            CommandKind::TestCommunication(params) => self.test_communication(params).await,
        };
        match outcome {
            Ok((result_type, payload)) => result_frame(&command_id, result_type, payload),
            Err(e) => {
                warn!("❌ Command failed: {}", e);
                error_frame(&command_id, &e.to_string())
            }
        }
    }

    async fn set_polling_config(
        &self,
        params: SetPollingConfigParams,
    ) -> Result<(&'static str, Value), AgentError> {
        info!("📋 Applying pushed polling config '{}'", params.config.id);
        self.watcher.apply_remote(&params.config).await?;
        Ok((
            "config_applied",
            json!({ "configId": params.config.id }),
        ))
    }

    async fn modbus_read(
        &self,
        params: ModbusReadParams,
    ) -> Result<(&'static str, Value), AgentError> {
        let function = ReadFunction::from_code(params.function_code)?;
        let handle = self.pool.acquire(&params.connection, params.protocol).await?;
        let start = normalize_address(params.address);
        let values = ops::read(&handle, function, start, params.count).await?;
        Ok((
            "modbus_read_result",
            json!({
                "address": params.address,
                "count": params.count,
                "functionCode": function.code(),
                "values": values.to_json(),
            }),
        ))
    }

    async fn modbus_write(
        &self,
        params: ModbusWriteParams,
    ) -> Result<(&'static str, Value), AgentError> {
        let request = write_request_from(params.function_code, &params.value)?;
        let function_code = request.code();
        let handle = self.pool.acquire(&params.connection, params.protocol).await?;
        let start = normalize_address(params.address);
        ops::write(&handle, start, request).await?;
        Ok((
            "modbus_write_result",
            json!({
                "address": params.address,
                "functionCode": function_code,
                "success": true,
            }),
        ))
    }

    /// A failed probe is still a completed command: the outcome rides in the
    /// result payload instead of an error frame.
    async fn test_communication(
        &self,
        params: TestCommunicationParams,
    ) -> Result<(&'static str, Value), AgentError> {
        let address = normalize_address(params.address.unwrap_or(40001));
        let started = Instant::now();
        let outcome = match self.pool.acquire(&params.connection, params.protocol).await {
            Ok(handle) => ops::read(&handle, ReadFunction::HoldingRegisters, address, 1)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        let round_trip_ms = started.elapsed().as_millis() as u64;
        let payload = match outcome {
            Ok(()) => json!({ "success": true, "roundTripMs": round_trip_ms }),
            Err(e) => json!({
                "success": false,
                "roundTripMs": round_trip_ms,
                "error": e.to_string(),
            }),
        };
        Ok(("test_communication_result", payload))
    }

    async fn network_scan(
        &self,
        params: NetworkScanParams,
    ) -> Result<(&'static str, Value), AgentError> {
        let base = params.ip_base.trim_end_matches('.').to_string();
        if base.split('.').count() != 3 || base.split('.').any(|o| o.parse::<u8>().is_err()) {
            return Err(AgentError::CommandError(format!(
                "ipBase must be the first three octets, got '{}'",
                params.ip_base
            )));
        }
        if params.range_end < params.range_start {
            return Err(AgentError::CommandError(
                "rangeEnd is below rangeStart".to_string(),
            ));
        }

        let port = params.port;
        info!(
            "🔍 Scanning {}.{}-{} on port {}",
            base, params.range_start, params.range_end, port
        );

        let mut hosts: Vec<String> = stream::iter(params.range_start..=params.range_end)
            .map(|host| {
                let base = base.clone();
                async move {
                    let addr = format!("{}.{}:{}", base, host, port);
                    match timeout(SCAN_CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
                        Ok(Ok(_)) => Some(format!("{}.{}", base, host)),
                        _ => None,
                    }
                }
            })
            .buffer_unordered(SCAN_CONCURRENCY)
            .filter_map(|found| async move { found })
            .collect()
            .await;
        hosts.sort();

        let scanned = (params.range_end - params.range_start) as usize + 1;
        info!("🔍 Scan finished: {}/{} hosts reachable", hosts.len(), scanned);
        Ok((
            "network_scan_result",
            json!({ "port": port, "scanned": scanned, "hosts": hosts }),
        ))
    }
}

fn write_request_from(function_code: Option<u8>, value: &Value) -> Result<WriteRequest, AgentError> {
    let code = function_code.unwrap_or(6);
    match code {
        5 => Ok(WriteRequest::SingleCoil(coerce_bool(value)?)),
        6 => Ok(WriteRequest::SingleRegister(coerce_word(value)?)),
        15 => {
            let items = value.as_array().ok_or_else(|| {
                AgentError::CommandError("FC15 requires an array of booleans".to_string())
            })?;
            let bits = items.iter().map(coerce_bool).collect::<Result<_, _>>()?;
            Ok(WriteRequest::MultipleCoils(bits))
        }
        16 => {
            let items = value.as_array().ok_or_else(|| {
                AgentError::CommandError("FC16 requires an array of register words".to_string())
            })?;
            let words = items.iter().map(coerce_word).collect::<Result<_, _>>()?;
            Ok(WriteRequest::MultipleRegisters(words))
        }
        other => Err(AgentError::CommandError(format!(
            "unsupported write function code: {}",
            other
        ))),
    }
}

fn coerce_bool(value: &Value) -> Result<bool, AgentError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_u64().unwrap_or(0) != 0),
        other => Err(AgentError::CommandError(format!(
            "expected boolean, got {}",
            other
        ))),
    }
}

fn coerce_word(value: &Value) -> Result<u16, AgentError> {
    value
        .as_u64()
        .filter(|&n| n <= u16::MAX as u64)
        .map(|n| n as u16)
        .ok_or_else(|| {
            AgentError::CommandError(format!("expected 16-bit register value, got {}", value))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_welcome_frame() {
        let message =
            parse_inbound(r#"{"type":"connected","agentId":"agent-42"}"#).unwrap();
        match message {
            InboundMessage::Connected { agent_id } => assert_eq!(agent_id, "agent-42"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_command_in_both_conventions() {
        let camel = parse_inbound(
            r#"{"command":"modbus_read","commandId":"c-1","connection":{"ip":"10.0.0.9"},"address":40001,"count":2}"#,
        )
        .unwrap();
        match camel {
            InboundMessage::Command(Command {
                command_id,
                kind: CommandKind::ModbusRead(params),
            }) => {
                assert_eq!(command_id.as_deref(), Some("c-1"));
                assert_eq!(params.address, 40001);
                assert_eq!(params.count, 2);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let snake = parse_inbound(
            r#"{"type":"modbus_read","command_id":"c-2","params":{"connection":{"ip":"10.0.0.9"},"address":40001}}"#,
        )
        .unwrap();
        match snake {
            InboundMessage::Command(Command {
                command_id,
                kind: CommandKind::ModbusRead(params),
            }) => {
                assert_eq!(command_id.as_deref(), Some("c-2"));
                assert_eq!(params.count, 1, "count defaults to 1");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_command_is_ignored_not_error() {
        let message = parse_inbound(r#"{"type":"reboot_agent","commandId":"c-3"}"#).unwrap();
        assert!(matches!(message, InboundMessage::Unknown(kind) if kind == "reboot_agent"));
    }

    #[test]
    fn test_result_and_error_frames() {
        let id = Some("c-9".to_string());
        let frame = result_frame(&id, "modbus_write_result", json!({"success": true}));
        assert_eq!(frame["commandId"], "c-9");
        assert_eq!(frame["type"], "modbus_write_result");
        assert_eq!(frame["success"], true);

        let err = error_frame(&id, "boom");
        assert_eq!(err["type"], "error");
        assert_eq!(err["error"], "boom");
    }

    #[test]
    fn test_write_request_coercion() {
        assert_eq!(
            write_request_from(None, &json!(123)).unwrap(),
            WriteRequest::SingleRegister(123)
        );
        assert_eq!(
            write_request_from(Some(5), &json!(1)).unwrap(),
            WriteRequest::SingleCoil(true)
        );
        assert_eq!(
            write_request_from(Some(15), &json!([true, false])).unwrap(),
            WriteRequest::MultipleCoils(vec![true, false])
        );
        assert_eq!(
            write_request_from(Some(16), &json!([1, 2, 3])).unwrap(),
            WriteRequest::MultipleRegisters(vec![1, 2, 3])
        );
        assert!(write_request_from(Some(16), &json!([70000])).is_err());
        assert!(write_request_from(Some(3), &json!(1)).is_err());
    }

    #[test]
    fn test_data_update_frame_shape() {
        let frame = data_update_frame(
            true,
            vec![UpdateEntry {
                device_id: "dev-1".to_string(),
                register_id: "r1".to_string(),
                value: 7,
            }],
        );
        assert_eq!(frame["type"], "data_update");
        assert_eq!(frame["isFullRefresh"], true);
        assert_eq!(frame["updates"][0]["deviceId"], "dev-1");
        assert_eq!(frame["updates"][0]["value"], 7);
    }
}
