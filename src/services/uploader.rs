use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::buffer::{HistoricalBuffer, OfflineBuffer, Sample};
use crate::services::auth::AuthClient;
use crate::services::status::StatusReporter;
use crate::utils::error::AgentError;

/// Offline drain chunk size.
const DRAIN_CHUNK: usize = 1_000;

#[derive(Debug, Deserialize)]
struct IngestResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    inserted: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

/// Periodically drains the historical buffer to the ingest endpoint and
/// spills to the offline buffer whenever the channel or the upload fails.
pub struct BulkUploader {
    http: reqwest::Client,
    ingest_url: String,
    auth: Arc<AuthClient>,
    agent_id: Arc<RwLock<Option<String>>>,
    channel_open: Arc<AtomicBool>,
    historical: Arc<HistoricalBuffer>,
    offline: Arc<OfflineBuffer>,
    status: Arc<StatusReporter>,
}

impl BulkUploader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: reqwest::Client,
        ingest_url: String,
        auth: Arc<AuthClient>,
        agent_id: Arc<RwLock<Option<String>>>,
        channel_open: Arc<AtomicBool>,
        historical: Arc<HistoricalBuffer>,
        offline: Arc<OfflineBuffer>,
        status: Arc<StatusReporter>,
    ) -> Self {
        Self {
            http,
            ingest_url,
            auth,
            agent_id,
            channel_open,
            historical,
            offline,
            status,
        }
    }

    /// One bulk-upload cycle. The drained snapshot always ends up somewhere:
    /// uploaded on success, in the offline buffer otherwise.
    pub async fn run_cycle(&self) {
        let snapshot = self.historical.drain();
        if snapshot.is_empty() {
            return;
        }
        let channel_open = self.channel_open.load(Ordering::SeqCst);

        if !channel_open {
            self.spill(&snapshot).await;
            self.status
                .report(false, self.offline.get_record_count())
                .await;
            return;
        }

        match self.upload(&snapshot).await {
            Ok(inserted) => {
                info!(
                    "📤 Uploaded {} historical samples ({} inserted)",
                    snapshot.len(),
                    inserted
                );
                self.status
                    .report(true, self.offline.get_record_count())
                    .await;
            }
            Err(e) => {
                warn!("⚠️  Bulk upload failed, spilling to disk: {}", e);
                self.spill(&snapshot).await;
                self.status
                    .report(true, self.offline.get_record_count())
                    .await;
            }
        }
    }

    /// Drain the offline buffer in order, in chunks. All-or-nothing: the
    /// file is only cleared after every chunk uploaded; any failure leaves
    /// it intact for the next opportunity.
    pub async fn drain_offline(&self) -> Result<(), AgentError> {
        let records = self.offline.get_buffered_data().await?;
        if records.is_empty() {
            return Ok(());
        }
        info!(
            "📤 Draining offline buffer: {} records in {} chunks",
            records.len(),
            records.len().div_ceil(DRAIN_CHUNK)
        );

        for chunk in records.chunks(DRAIN_CHUNK) {
            self.upload(chunk).await?;
        }

        self.offline.clear_buffer().await?;
        self.status.report(true, 0).await;
        info!("✅ Offline buffer drained");
        Ok(())
    }

    async fn spill(&self, samples: &[Sample]) {
        if let Err(e) = self.offline.spill(samples).await {
            // Both the upload and the disk failed; these samples are gone.
            error!("❌ Failed to spill {} samples to disk: {}", samples.len(), e);
        }
    }

    async fn upload(&self, samples: &[Sample]) -> Result<u64, AgentError> {
        let agent_id = self
            .agent_id
            .read()
            .await
            .clone()
            .ok_or_else(|| AgentError::TransportError("agent identity not known yet".to_string()))?;
        let jwt = self.auth.current_jwt().await?;

        let response = self
            .http
            .post(&self.ingest_url)
            .bearer_auth(jwt)
            .json(&json!({ "agentId": agent_id, "dataPoints": samples }))
            .send()
            .await
            .map_err(|e| AgentError::TransportError(format!("ingest POST failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AgentError::TransportError(format!(
                "ingest endpoint returned {}",
                response.status()
            )));
        }

        let body: IngestResponse = response
            .json()
            .await
            .map_err(|e| AgentError::TransportError(format!("invalid ingest response: {}", e)))?;
        if !body.success {
            return Err(AgentError::TransportError(format!(
                "ingest rejected batch: {}",
                body.error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }
        Ok(body.inserted.unwrap_or(samples.len() as u64))
    }
}
