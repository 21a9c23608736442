//! Runtime configuration.
//!
//! All fields have defaults, so an empty JSON object or TOML document is a
//! valid configuration. The attempt budget and request timeout are settings
//! rather than constants.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

const DEFAULT_STORE_PATH: &str = "offline_sync";
const DEFAULT_MAP_SIZE_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:3000";
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// LMDB environment name; data lives in `<store_path>.lmdb`.
    pub store_path: String,
    pub map_size_bytes: usize,
    pub api_base_url: String,
    /// Bearer token sent with every API request.
    pub auth_token: Option<String>,
    pub max_attempts: u32,
    pub request_timeout_ms: u64,
    pub endpoints: EndpointConfig,
}

/// Paths (relative to `api_base_url`) that replays POST to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub events: String,
    pub registrations: String,
    pub check_ins: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            store_path: DEFAULT_STORE_PATH.to_string(),
            map_size_bytes: DEFAULT_MAP_SIZE_BYTES,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            auth_token: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            endpoints: EndpointConfig::default(),
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            events: "/events".to_string(),
            registrations: "/registrations".to_string(),
            check_ins: "/check-ins".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(raw)
            .map_err(|e| SyncError::Config(format!("invalid JSON config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: SyncConfig =
            toml::from_str(raw).map_err(|e| SyncError::Config(format!("invalid TOML config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a `.toml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read {}: {e}", path.display())))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&raw),
            Some("json") => Self::from_json_str(&raw),
            other => Err(SyncError::Config(format!(
                "unsupported config extension {other:?} for {}",
                path.display()
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.store_path.trim().is_empty() {
            return Err(SyncError::Config("store_path must not be empty".into()));
        }
        if self.max_attempts == 0 {
            return Err(SyncError::Config("max_attempts must be at least 1".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(SyncError::Config("request_timeout_ms must be positive".into()));
        }
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://")) {
            return Err(SyncError::Config(format!(
                "api_base_url must be an http(s) URL: {}",
                self.api_base_url
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Full URL for an endpoint path.
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url.trim_end_matches('/'), path)
    }
}
