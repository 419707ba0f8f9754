//! HTTP client for the backend service.
//!
//! Every call carries `Authorization: Bearer <token>`. The backend is a black
//! box: it lists sources, serves notification settings, and runs detection on
//! submitted frames.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::BackendError;
use crate::notify::Settings;
use crate::registry::{Source, SourceCatalog};

pub const CAMERAS_PATH: &str = "/api/cameras";
pub const SETTINGS_PATH: &str = "/api/settings";
pub const PROCESS_FRAME_PATH: &str = "/api/process-frame";
pub const TOKEN_PATH: &str = "/token";

/// Default per-request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Source of notification settings.
pub trait SettingsProvider: Send + Sync {
    fn fetch_settings(&self) -> Result<Settings, BackendError>;
}

#[derive(Clone)]
pub struct BackendClient {
    base_url: String,
    token: String,
    agent: ureq::Agent,
}

impl BackendClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            agent,
        }
    }

    /// Obtain a bearer token from the backend login form.
    pub fn login(
        base_url: &str,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<String, BackendError> {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let url = format!("{}{}", base_url.trim_end_matches('/'), TOKEN_PATH);
        let response = agent
            .post(&url)
            .send_form(&[("username", username), ("password", password)])?;
        let token: TokenResponse = response
            .into_json()
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(token.access_token)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        let response = self
            .agent
            .get(&self.url(path))
            .set("Authorization", &self.bearer())
            .call()?;
        response
            .into_json()
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    /// POST a JSON body and decode the JSON reply.
    pub fn post_json<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, BackendError> {
        let response = self
            .agent
            .post(&self.url(path))
            .set("Authorization", &self.bearer())
            .send_json(body)?;
        response
            .into_json()
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}

impl SourceCatalog for BackendClient {
    fn list_sources(&self) -> Result<Vec<Source>, BackendError> {
        self.get_json(CAMERAS_PATH)
    }
}

impl SettingsProvider for BackendClient {
    fn fetch_settings(&self) -> Result<Settings, BackendError> {
        self.get_json(SETTINGS_PATH)
    }
}
