use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Modbus error: {0}")]
    ModbusError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Auth error: {0}")]
    AuthError(String),

    #[error("Buffer error: {0}")]
    BufferError(String),

    #[error("Command error: {0}")]
    CommandError(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),
}

/// Case-insensitive markers that classify a read failure as a broken
/// transport rather than a device-side fault. A match triggers pool eviction
/// and a single retry on a fresh handle.
const CONNECTION_ERROR_MARKERS: &[&str] = &[
    "port not open",
    "econn",
    "epipe",
    "reset",
    "closed",
    "socket",
    "timeout",
];

impl AgentError {
    pub fn is_connection_error(&self) -> bool {
        let message = self.to_string().to_lowercase();
        CONNECTION_ERROR_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_predicate_matches() {
        let cases = [
            AgentError::ModbusError("ECONNRESET while reading".to_string()),
            AgentError::ModbusError("broken pipe (EPIPE)".to_string()),
            AgentError::ConnectionError("Port Not Open".to_string()),
            AgentError::ModbusError("connection reset by peer".to_string()),
            AgentError::ModbusError("socket is not writable".to_string()),
            AgentError::Timeout,
        ];
        for err in &cases {
            assert!(err.is_connection_error(), "expected match: {}", err);
        }
    }

    #[test]
    fn test_connection_error_predicate_rejects_device_faults() {
        let cases = [
            AgentError::ModbusError("Exception: IllegalDataAddress".to_string()),
            AgentError::ConfigError("missing protocol".to_string()),
        ];
        for err in &cases {
            assert!(!err.is_connection_error(), "unexpected match: {}", err);
        }
    }
}
