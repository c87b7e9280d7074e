pub mod polling;
pub mod settings;

pub use polling::{
    ActiveConfigResponse, ConnectionParams, DeviceConfig, PollGroupConfig, PollingConfig, Protocol,
    RegisterConfig, RemoteConfig,
};
pub use settings::AgentSettings;
