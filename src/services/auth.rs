use log::info;
use serde::Deserialize;
use serde_json::json;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::utils::error::AgentError;

/// A token is treated as expiring soon when less than this remains.
const EXPIRY_MARGIN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Deserialize)]
struct AuthResponse {
    jwt: String,
    expires_in: u64,
}

struct TokenState {
    jwt: String,
    expires_at: Instant,
}

/// Exchanges the long-lived registration token for short-lived JWTs and
/// tracks their expiry.
pub struct AuthClient {
    http: reqwest::Client,
    auth_url: String,
    registration_token: String,
    state: Mutex<Option<TokenState>>,
}

impl AuthClient {
    pub fn new(http: reqwest::Client, auth_url: String, registration_token: String) -> Self {
        Self {
            http,
            auth_url,
            registration_token,
            state: Mutex::new(None),
        }
    }

    /// A JWT with comfortable validity left, refreshing first if the cached
    /// one is missing or expiring soon.
    pub async fn current_jwt(&self) -> Result<String, AgentError> {
        if let Some(jwt) = self.valid_jwt() {
            return Ok(jwt);
        }
        self.refresh().await
    }

    /// Force a token exchange, replacing whatever was cached.
    pub async fn refresh(&self) -> Result<String, AgentError> {
        info!("🔑 Exchanging registration token for JWT");
        let response = self
            .http
            .post(&self.auth_url)
            .json(&json!({ "registration_token": self.registration_token }))
            .send()
            .await
            .map_err(|e| AgentError::AuthError(format!("auth request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(AgentError::AuthError(format!(
                "auth endpoint returned {}",
                response.status()
            )));
        }

        let body: AuthResponse = response
            .json()
            .await
            .map_err(|e| AgentError::AuthError(format!("invalid auth response: {}", e)))?;

        let expires_at = Instant::now() + Duration::from_secs(body.expires_in);
        *self.state.lock().unwrap() = Some(TokenState {
            jwt: body.jwt.clone(),
            expires_at,
        });
        info!("✅ JWT obtained (expires in {} s)", body.expires_in);
        Ok(body.jwt)
    }

    pub fn expiring_soon(&self) -> bool {
        self.valid_jwt().is_none()
    }

    fn valid_jwt(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .as_ref()
            .filter(|token| token.expires_at.saturating_duration_since(Instant::now()) > EXPIRY_MARGIN)
            .map(|token| token.jwt.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_token_is_expiring() {
        let auth = AuthClient::new(
            reqwest::Client::new(),
            "https://example.invalid/auth".to_string(),
            "reg-token".to_string(),
        );
        assert!(auth.expiring_soon());
    }

    #[test]
    fn test_token_within_margin_is_expiring() {
        let auth = AuthClient::new(
            reqwest::Client::new(),
            "https://example.invalid/auth".to_string(),
            "reg-token".to_string(),
        );
        *auth.state.lock().unwrap() = Some(TokenState {
            jwt: "abc".to_string(),
            expires_at: Instant::now() + Duration::from_secs(60),
        });
        assert!(auth.expiring_soon());

        *auth.state.lock().unwrap() = Some(TokenState {
            jwt: "abc".to_string(),
            expires_at: Instant::now() + Duration::from_secs(3600),
        });
        assert!(!auth.expiring_soon());
        assert_eq!(auth.valid_jwt().as_deref(), Some("abc"));
    }
}
