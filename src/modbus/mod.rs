pub mod connection;
pub mod ops;
pub mod optimizer;

pub use connection::{ConnectionPool, PooledConnection, MODBUS_TIMEOUT};
pub use ops::{ReadFunction, ReadValues, WriteRequest};
pub use optimizer::{normalize_address, optimize, ReadBlock, MAX_BLOCK_SIZE};
