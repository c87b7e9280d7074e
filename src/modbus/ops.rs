use log::debug;
use serde_json::json;
use tokio::time::timeout;
use tokio_modbus::client::{Reader, Writer};

use crate::modbus::connection::{PooledConnection, MODBUS_TIMEOUT};
use crate::utils::error::AgentError;

/// Supported read function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFunction {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl ReadFunction {
    /// FC3 is the default when no code is given.
    pub fn from_code(code: Option<u8>) -> Result<Self, AgentError> {
        match code.unwrap_or(3) {
            1 => Ok(Self::Coils),
            2 => Ok(Self::DiscreteInputs),
            3 => Ok(Self::HoldingRegisters),
            4 => Ok(Self::InputRegisters),
            other => Err(AgentError::CommandError(format!(
                "unsupported read function code: {}",
                other
            ))),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Coils => 1,
            Self::DiscreteInputs => 2,
            Self::HoldingRegisters => 3,
            Self::InputRegisters => 4,
        }
    }
}

/// A write request carrying its values. FC6 is the default write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    SingleCoil(bool),
    SingleRegister(u16),
    MultipleCoils(Vec<bool>),
    MultipleRegisters(Vec<u16>),
}

impl WriteRequest {
    pub fn code(&self) -> u8 {
        match self {
            Self::SingleCoil(_) => 5,
            Self::SingleRegister(_) => 6,
            Self::MultipleCoils(_) => 15,
            Self::MultipleRegisters(_) => 16,
        }
    }
}

/// Read results, bit- or word-valued depending on the function code.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadValues {
    Bits(Vec<bool>),
    Words(Vec<u16>),
}

impl ReadValues {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bits(bits) => json!(bits),
            Self::Words(words) => json!(words),
        }
    }
}

/// Collapse the timeout / transport / exception layers into one error.
/// A timed-out or transport-level failure marks the handle broken so the
/// pool health check catches it; a device exception leaves it healthy.
macro_rules! issue {
    ($handle:expr, $request:expr) => {
        timeout(MODBUS_TIMEOUT, $request)
            .await
            .map_err(|_| {
                $handle.mark_broken();
                AgentError::Timeout
            })?
            .map_err(|e| {
                $handle.mark_broken();
                AgentError::ModbusError(e.to_string())
            })?
            .map_err(|e| AgentError::ModbusError(format!("Exception: {:?}", e)))
    };
}

/// Issue one read against a pooled handle, bounded by the Modbus timeout.
/// `address` must already be normalized.
pub async fn read(
    handle: &PooledConnection,
    function: ReadFunction,
    address: u16,
    count: u16,
) -> Result<ReadValues, AgentError> {
    debug!(
        "FC{} read {}+{} on {}",
        function.code(),
        address,
        count,
        handle.key()
    );
    let mut context = handle.context().await;
    match function {
        ReadFunction::Coils => {
            let bits = issue!(handle, context.read_coils(address, count))?;
            Ok(ReadValues::Bits(bits))
        }
        ReadFunction::DiscreteInputs => {
            let bits = issue!(handle, context.read_discrete_inputs(address, count))?;
            Ok(ReadValues::Bits(bits))
        }
        ReadFunction::HoldingRegisters => {
            let words = issue!(handle, context.read_holding_registers(address, count))?;
            Ok(ReadValues::Words(words))
        }
        ReadFunction::InputRegisters => {
            let words = issue!(handle, context.read_input_registers(address, count))?;
            Ok(ReadValues::Words(words))
        }
    }
}

/// Scheduled polling always reads holding registers (FC3), whatever bank the
/// engineering address came from.
pub async fn read_holding_block(
    handle: &PooledConnection,
    address: u16,
    count: u16,
) -> Result<Vec<u16>, AgentError> {
    match read(handle, ReadFunction::HoldingRegisters, address, count).await? {
        ReadValues::Words(words) => Ok(words),
        ReadValues::Bits(_) => unreachable!("FC3 returns words"),
    }
}

/// Issue one write against a pooled handle, bounded by the Modbus timeout.
pub async fn write(
    handle: &PooledConnection,
    address: u16,
    request: WriteRequest,
) -> Result<(), AgentError> {
    debug!("FC{} write @{} on {}", request.code(), address, handle.key());
    let mut context = handle.context().await;
    match request {
        WriteRequest::SingleCoil(value) => {
            issue!(handle, context.write_single_coil(address, value))?;
        }
        WriteRequest::SingleRegister(value) => {
            issue!(handle, context.write_single_register(address, value))?;
        }
        WriteRequest::MultipleCoils(values) => {
            issue!(handle, context.write_multiple_coils(address, &values))?;
        }
        WriteRequest::MultipleRegisters(values) => {
            issue!(handle, context.write_multiple_registers(address, &values))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_function_codes() {
        assert_eq!(
            ReadFunction::from_code(None).unwrap(),
            ReadFunction::HoldingRegisters
        );
        assert_eq!(
            ReadFunction::from_code(Some(1)).unwrap(),
            ReadFunction::Coils
        );
        assert_eq!(
            ReadFunction::from_code(Some(4)).unwrap(),
            ReadFunction::InputRegisters
        );
        assert!(ReadFunction::from_code(Some(7)).is_err());
    }

    #[test]
    fn test_write_request_codes() {
        assert_eq!(WriteRequest::SingleCoil(true).code(), 5);
        assert_eq!(WriteRequest::SingleRegister(7).code(), 6);
        assert_eq!(WriteRequest::MultipleCoils(vec![true]).code(), 15);
        assert_eq!(WriteRequest::MultipleRegisters(vec![1, 2]).code(), 16);
    }
}
