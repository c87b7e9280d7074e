pub mod auth;
pub mod commands;
pub mod poller;
pub mod status;
pub mod uploader;
pub mod uplink;
pub mod watcher;

pub use auth::AuthClient;
pub use commands::CommandExecutor;
pub use poller::PollingScheduler;
pub use status::StatusReporter;
pub use uploader::BulkUploader;
pub use uplink::ControlChannel;
pub use watcher::{ConfigWatcher, TuningState};
