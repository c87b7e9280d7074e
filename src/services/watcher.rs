use log::{error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffer::HistoricalBuffer;
use crate::config::polling::{
    ActiveConfigResponse, PollingConfig, RemoteConfig, DEFAULT_BATCH_WINDOW_MS,
    DEFAULT_HISTORICAL_BATCH_INTERVAL_MS,
};
use crate::services::auth::AuthClient;
use crate::services::poller::PollingScheduler;
use crate::utils::error::AgentError;

/// Config-driven timer periods, readable lock-free from the channel's
/// housekeeping loops.
pub struct TuningState {
    batch_window_ms: AtomicU64,
    historical_batch_interval_ms: AtomicU64,
}

impl TuningState {
    pub fn new() -> Self {
        Self {
            batch_window_ms: AtomicU64::new(DEFAULT_BATCH_WINDOW_MS),
            historical_batch_interval_ms: AtomicU64::new(DEFAULT_HISTORICAL_BATCH_INTERVAL_MS),
        }
    }

    pub fn apply(&self, config: &PollingConfig) {
        self.batch_window_ms
            .store(config.batch_window_ms.max(1), Ordering::SeqCst);
        self.historical_batch_interval_ms
            .store(config.historical_batch_interval_ms.max(1), Ordering::SeqCst);
    }

    pub fn batch_window_ms(&self) -> u64 {
        self.batch_window_ms.load(Ordering::SeqCst)
    }

    pub fn historical_batch_interval_ms(&self) -> u64 {
        self.historical_batch_interval_ms.load(Ordering::SeqCst)
    }
}

impl Default for TuningState {
    fn default() -> Self {
        Self::new()
    }
}

/// Pulls the active polling config and applies it when its id differs from
/// the one currently running. Also the single entry point for configs pushed
/// over the command channel, so both paths share the diff-and-apply rule.
pub struct ConfigWatcher {
    http: reqwest::Client,
    config_url: String,
    auth: Arc<AuthClient>,
    scheduler: Arc<PollingScheduler>,
    tuning: Arc<TuningState>,
    historical: Arc<HistoricalBuffer>,
}

impl ConfigWatcher {
    pub fn new(
        http: reqwest::Client,
        config_url: String,
        auth: Arc<AuthClient>,
        scheduler: Arc<PollingScheduler>,
        tuning: Arc<TuningState>,
        historical: Arc<HistoricalBuffer>,
    ) -> Self {
        Self {
            http,
            config_url,
            auth,
            scheduler,
            tuning,
            historical,
        }
    }

    /// One fetch-compare-apply pass. Network failures are logged and leave
    /// the running schedule untouched.
    pub async fn check_now(&self) {
        let response = match self.fetch_active_config().await {
            Ok(response) => response,
            Err(e) => {
                warn!("⚠️  Config check failed: {}", e);
                return;
            }
        };

        let applied = self.scheduler.active_config_id().await;
        match (response.has_config, response.config) {
            (true, Some(remote)) => {
                if applied.as_deref() == Some(remote.id.as_str()) {
                    return;
                }
                info!(
                    "🔄 Active config changed ({} -> {}), applying",
                    applied.as_deref().unwrap_or("none"),
                    remote.id
                );
                if let Err(e) = self.apply_remote(&remote).await {
                    error!("❌ Failed to apply config '{}': {}", remote.id, e);
                }
            }
            (true, None) => warn!("⚠️  Config endpoint reported hasConfig without a config body"),
            (false, _) => {
                if applied.is_some() {
                    info!("🛑 No active config on the control plane, stopping polling");
                    self.scheduler.stop().await;
                }
            }
        }
    }

    /// Validate and install a config: scheduler timers, full-refresh clock,
    /// and the housekeeping timer periods.
    pub async fn apply_remote(&self, remote: &RemoteConfig) -> Result<(), AgentError> {
        remote.polling_config.validate()?;
        self.scheduler
            .apply(&remote.id, &remote.polling_config)
            .await?;
        self.tuning.apply(&remote.polling_config);
        if let Some(name) = &remote.config_name {
            info!("📋 Running config '{}' ({})", name, remote.id);
        }
        // A reconfigure never discards collected history.
        let pending = self.historical.len();
        if pending > 0 {
            info!("💾 {} historical samples pending upload across reconfigure", pending);
        }
        Ok(())
    }

    async fn fetch_active_config(&self) -> Result<ActiveConfigResponse, AgentError> {
        let jwt = self.auth.current_jwt().await?;
        let response = self
            .http
            .get(&self.config_url)
            .bearer_auth(jwt)
            .send()
            .await
            .map_err(|e| AgentError::TransportError(format!("config fetch failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AgentError::TransportError(format!(
                "config endpoint returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| AgentError::TransportError(format!("invalid config response: {}", e)))
    }
}
