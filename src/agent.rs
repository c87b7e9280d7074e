use log::info;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::buffer::{HistoricalBuffer, OfflineBuffer, TransmitBuffer, ValueCache};
use crate::config::settings::AgentSettings;
use crate::modbus::connection::ConnectionPool;
use crate::services::auth::AuthClient;
use crate::services::commands::CommandExecutor;
use crate::services::poller::PollingScheduler;
use crate::services::status::StatusReporter;
use crate::services::uploader::BulkUploader;
use crate::services::uplink::ControlChannel;
use crate::services::watcher::{ConfigWatcher, TuningState};
use crate::utils::error::AgentError;

/// Wires the buffers, pool, scheduler, and cloud services together and owns
/// their lifetime.
pub struct Agent {
    channel: Arc<ControlChannel>,
    scheduler: Arc<PollingScheduler>,
    pool: Arc<ConnectionPool>,
}

impl Agent {
    pub fn new(settings: AgentSettings, registration_token: String) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.http_timeout_secs.max(1)))
            .build()
            .map_err(|e| AgentError::ConfigError(format!("failed to build HTTP client: {}", e)))?;

        let auth = Arc::new(AuthClient::new(
            http.clone(),
            settings.auth_url.clone(),
            registration_token,
        ));
        let agent_id = Arc::new(RwLock::new(None));
        let channel_open = Arc::new(AtomicBool::new(false));

        let value_cache = Arc::new(ValueCache::new());
        let transmit = Arc::new(TransmitBuffer::new());
        let historical = Arc::new(HistoricalBuffer::new(settings.historical_buffer_cap));
        let offline = Arc::new(OfflineBuffer::new(
            &settings.buffer_dir,
            settings.offline_buffer_max_bytes,
        )?);

        let pool = Arc::new(ConnectionPool::new());
        let tuning = Arc::new(TuningState::new());
        let scheduler = Arc::new(PollingScheduler::new(
            Arc::clone(&pool),
            Arc::clone(&value_cache),
            Arc::clone(&transmit),
            Arc::clone(&historical),
        ));

        let status = Arc::new(StatusReporter::new(
            http.clone(),
            settings.agent_status_url.clone(),
            settings.api_key.clone(),
            Arc::clone(&auth),
            Arc::clone(&agent_id),
        ));
        let uploader = Arc::new(BulkUploader::new(
            http.clone(),
            settings.ingest_url.clone(),
            Arc::clone(&auth),
            Arc::clone(&agent_id),
            Arc::clone(&channel_open),
            Arc::clone(&historical),
            Arc::clone(&offline),
            Arc::clone(&status),
        ));
        let watcher = Arc::new(ConfigWatcher::new(
            http.clone(),
            settings.config_url.clone(),
            Arc::clone(&auth),
            Arc::clone(&scheduler),
            Arc::clone(&tuning),
            Arc::clone(&historical),
        ));
        let executor = Arc::new(CommandExecutor::new(
            Arc::clone(&pool),
            Arc::clone(&watcher),
        ));

        let channel = Arc::new(ControlChannel::new(
            settings,
            auth,
            agent_id,
            channel_open,
            value_cache,
            transmit,
            offline,
            tuning,
            watcher,
            uploader,
            executor,
            status,
        ));

        Ok(Self {
            channel,
            scheduler,
            pool,
        })
    }

    /// Run until the process is interrupted.
    pub async fn run(&self) {
        Arc::clone(&self.channel).run().await;
    }

    /// Cancel all polling timers and close every pooled connection.
    pub async fn shutdown(&self) {
        info!("🛑 Shutting down agent");
        self.scheduler.stop().await;
        self.pool.close_all().await;
    }
}
