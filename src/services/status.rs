use log::{debug, warn};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::services::auth::AuthClient;

/// Pushes buffering state and counters to the agent record on the control
/// plane. Fire-and-forget: failures are logged, never retried inline.
pub struct StatusReporter {
    http: reqwest::Client,
    agent_status_url: String,
    api_key: String,
    auth: Arc<AuthClient>,
    agent_id: Arc<RwLock<Option<String>>>,
    last_sent: std::sync::Mutex<Option<(bool, usize)>>,
}

impl StatusReporter {
    pub fn new(
        http: reqwest::Client,
        agent_status_url: String,
        api_key: String,
        auth: Arc<AuthClient>,
        agent_id: Arc<RwLock<Option<String>>>,
    ) -> Self {
        Self {
            http,
            agent_status_url,
            api_key,
            auth,
            agent_id,
            last_sent: std::sync::Mutex::new(None),
        }
    }

    /// PATCH `{buffering_status, buffered_records}`. `online` whenever the
    /// channel is up, `buffering` otherwise. Unchanged state is not re-sent.
    pub async fn report(&self, channel_open: bool, buffered_records: usize) {
        if *self.last_sent.lock().unwrap() == Some((channel_open, buffered_records)) {
            return;
        }

        let Some(agent_id) = self.agent_id.read().await.clone() else {
            debug!("Status report skipped: agent identity not known yet");
            return;
        };
        let jwt = match self.auth.current_jwt().await {
            Ok(jwt) => jwt,
            Err(e) => {
                warn!("⚠️  Status report skipped: {}", e);
                return;
            }
        };

        let buffering_status = if channel_open { "online" } else { "buffering" };
        let url = format!("{}?id=eq.{}", self.agent_status_url, agent_id);
        let result = self
            .http
            .patch(&url)
            .bearer_auth(jwt)
            .header("apikey", &self.api_key)
            .json(&json!({
                "buffering_status": buffering_status,
                "buffered_records": buffered_records,
            }))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                *self.last_sent.lock().unwrap() = Some((channel_open, buffered_records));
                debug!(
                    "📊 Status reported: {} ({} buffered)",
                    buffering_status, buffered_records
                );
            }
            Ok(response) => warn!(
                "⚠️  Status report rejected: {}",
                response.status()
            ),
            Err(e) => warn!("⚠️  Status report failed: {}", e),
        }
    }
}
