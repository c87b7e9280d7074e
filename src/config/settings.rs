use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::utils::error::AgentError;

/// Local agent settings: control-plane endpoints and buffer tuning.
/// Loaded from a TOML file, then overridden by environment variables so a
/// packaged install can repoint endpoints without editing the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    // Control-plane endpoints
    pub auth_url: String,
    pub ws_url: String,
    pub config_url: String,
    pub ingest_url: String,
    pub agent_status_url: String,
    pub api_key: String,

    // Buffering
    pub buffer_dir: String,
    pub historical_buffer_cap: usize,
    pub offline_buffer_max_bytes: u64,

    // Channel timing
    pub reconnect_delay_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub config_check_interval_secs: u64,
    pub jwt_refresh_interval_secs: u64,
    pub http_timeout_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            auth_url: "https://cloud.example.com/functions/v1/agent-auth".to_string(),
            ws_url: "wss://cloud.example.com/functions/v1/agent-ws".to_string(),
            config_url: "https://cloud.example.com/functions/v1/agent-config".to_string(),
            ingest_url: "https://cloud.example.com/functions/v1/agent-ingest".to_string(),
            agent_status_url: "https://cloud.example.com/rest/v1/agents".to_string(),
            api_key: String::new(),
            buffer_dir: ".modbus-agent-buffer".to_string(),
            historical_buffer_cap: 10_000,
            offline_buffer_max_bytes: 50 * 1024 * 1024,
            reconnect_delay_secs: 5,
            heartbeat_interval_secs: 30,
            config_check_interval_secs: 120,
            jwt_refresh_interval_secs: 55 * 60,
            http_timeout_secs: 30,
        }
    }
}

impl AgentSettings {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, AgentError> {
        let path_ref = path.as_ref();
        info!("📖 Reading settings file: {}", path_ref.display());

        let content = std::fs::read_to_string(path_ref).map_err(|e| {
            AgentError::ConfigError(format!(
                "Failed to read settings file {}: {}",
                path_ref.display(),
                e
            ))
        })?;

        let settings: AgentSettings = toml::from_str(&content).map_err(|e| {
            error!("❌ TOML parsing error in {}: {}", path_ref.display(), e);
            AgentError::ConfigError(format!("Invalid TOML in {}: {}", path_ref.display(), e))
        })?;

        info!("✅ Settings loaded from {}", path_ref.display());
        Ok(settings)
    }

    /// Environment variables win over the settings file.
    pub fn apply_env_overrides(&mut self) {
        let overrides: [(&str, &mut String); 6] = [
            ("MODBUS_AGENT_AUTH_URL", &mut self.auth_url),
            ("MODBUS_AGENT_WS_URL", &mut self.ws_url),
            ("MODBUS_AGENT_CONFIG_URL", &mut self.config_url),
            ("MODBUS_AGENT_INGEST_URL", &mut self.ingest_url),
            ("MODBUS_AGENT_STATUS_URL", &mut self.agent_status_url),
            ("MODBUS_AGENT_API_KEY", &mut self.api_key),
        ];
        for (var, slot) in overrides {
            if let Ok(value) = std::env::var(var) {
                if !value.is_empty() {
                    *slot = value;
                }
            }
        }
        if let Ok(dir) = std::env::var("MODBUS_AGENT_BUFFER_DIR") {
            if !dir.is_empty() {
                self.buffer_dir = dir;
            }
        }
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        for (name, url) in [
            ("auth_url", &self.auth_url),
            ("ws_url", &self.ws_url),
            ("config_url", &self.config_url),
            ("ingest_url", &self.ingest_url),
            ("agent_status_url", &self.agent_status_url),
        ] {
            if url.is_empty() {
                return Err(AgentError::ConfigError(format!("{} is not set", name)));
            }
        }
        if self.historical_buffer_cap == 0 {
            warn!("⚠️  historical_buffer_cap is 0, falling back to 10000");
        }
        Ok(())
    }
}
