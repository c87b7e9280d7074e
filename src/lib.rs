//! Modbus Cloud Polling Agent
//!
//! A local agent that bridges industrial Modbus devices (TCP and serial RTU)
//! to a cloud control plane: per-group polling with register-block
//! coalescing, report-by-exception streaming over a persistent WebSocket,
//! bulk historical uploads, and a disk-backed offline buffer that survives
//! disconnections.

pub mod agent;
pub mod buffer;
pub mod config;
pub mod modbus;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use agent::Agent;
pub use buffer::{HistoricalBuffer, OfflineBuffer, Quality, Sample, TransmitBuffer, ValueCache};
pub use config::{AgentSettings, PollingConfig};
pub use modbus::{ConnectionPool, ReadBlock};
pub use services::{ControlChannel, PollingScheduler};
pub use utils::error::AgentError;

pub const VERSION: &str = "1.2.0";
