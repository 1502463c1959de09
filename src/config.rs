//! Client configuration loading.
//!
//! Settings come from an optional JSON file and are then overridden by
//! environment variables:
//!
//! | Field | Environment variable |
//! |---|---|
//! | `server_url` | `LIVEQUERY_SERVER_URL` |
//! | `live_query_url` | `LIVEQUERY_URL` |
//! | `application_id` | `LIVEQUERY_APPLICATION_ID` |
//! | `client_key` | `LIVEQUERY_CLIENT_KEY` |

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::LiveQueryError;
use crate::ws::to_websocket_url;

/// Settings needed to build a [`LiveQueryClient`](crate::LiveQueryClient).
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Base HTTP(S) URL of the REST server; the live query endpoint is
    /// derived from it when `live_query_url` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    /// Explicit `ws://` or `wss://` endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_query_url: Option<String>,
    /// Application identifier sent with `connect`.
    pub application_id: String,
    /// Optional client key sent with `connect`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
}

impl ClientConfig {
    /// Read a JSON config file, then apply environment overrides.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server_url) = lookup("LIVEQUERY_SERVER_URL") {
            self.server_url = Some(server_url);
        }

        if let Some(url) = lookup("LIVEQUERY_URL") {
            self.live_query_url = Some(url);
        }

        if let Some(application_id) = lookup("LIVEQUERY_APPLICATION_ID") {
            self.application_id = application_id;
        }

        if let Some(client_key) = lookup("LIVEQUERY_CLIENT_KEY") {
            self.client_key = Some(client_key);
        }
    }

    /// The endpoint to connect to.
    ///
    /// An explicit `live_query_url` wins. Otherwise `server_url` is converted
    /// (`https` to `wss`, `http` to `ws`, host and path kept).
    pub fn endpoint(&self) -> Result<String, LiveQueryError> {
        if let Some(url) = &self.live_query_url {
            return validate_endpoint(url);
        }
        let server_url = self.server_url.as_deref().ok_or_else(|| {
            LiveQueryError::Configuration(
                "no live query endpoint: set live_query_url or server_url".to_string(),
            )
        })?;
        validate_endpoint(server_url)
    }
}

/// Convert `url` to a WebSocket URL or reject its scheme.
fn validate_endpoint(url: &str) -> Result<String, LiveQueryError> {
    to_websocket_url(url).ok_or_else(|| {
        LiveQueryError::Configuration(format!(
            "unsupported endpoint scheme (expected http, https, ws or wss): {url}"
        ))
    })
}
