pub mod historical;
pub mod offline;
pub mod sample;
pub mod transmit;
pub mod value_cache;

pub use historical::HistoricalBuffer;
pub use offline::OfflineBuffer;
pub use sample::{Quality, Sample};
pub use transmit::TransmitBuffer;
pub use value_cache::{CachedValue, ValueCache};
