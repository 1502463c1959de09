//! Construction of [`LiveQueryClient`].

use std::fmt;
use std::sync::Arc;

use super::{ClientParts, LiveQueryClient};
use crate::config::ClientConfig;
use crate::error::{LiveQueryError, Result};
use crate::object::{DefaultObjectDecoder, ObjectDecoder};
use crate::session::{SessionTokenProvider, StaticSessionToken};
use crate::transport::{TransportFactory, WebSocketTransportFactory};

/// Builder for [`LiveQueryClient`].
///
/// Collaborators default to a [`WebSocketTransportFactory`], an anonymous
/// [`StaticSessionToken`] and the [`DefaultObjectDecoder`].
///
/// ```no_run
/// # async fn demo() -> livequery::Result<()> {
/// let client = livequery::LiveQueryClient::builder()
///     .server_url("https://api.example.com/parse")
///     .application_id("my-app")
///     .build()?;
/// assert_eq!(client.endpoint(), "wss://api.example.com/parse");
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct LiveQueryClientBuilder {
    config: ClientConfig,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    session_provider: Option<Arc<dyn SessionTokenProvider>>,
    decoder: Option<Arc<dyn ObjectDecoder>>,
}

impl LiveQueryClientBuilder {
    /// Take endpoint and credentials from `config`.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Base HTTP(S) URL the endpoint is derived from.
    #[must_use]
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.config.server_url = Some(url.into());
        self
    }

    /// Explicit `ws://` or `wss://` endpoint.
    #[must_use]
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.live_query_url = Some(url.into());
        self
    }

    /// Application identifier sent with `connect`.
    #[must_use]
    pub fn application_id(mut self, application_id: impl Into<String>) -> Self {
        self.config.application_id = application_id.into();
        self
    }

    /// Client key sent with `connect`.
    #[must_use]
    pub fn client_key(mut self, client_key: impl Into<String>) -> Self {
        self.config.client_key = Some(client_key.into());
        self
    }

    /// Transport used for every connection.
    #[must_use]
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// Source of the session token.
    #[must_use]
    pub fn session_provider(mut self, provider: Arc<dyn SessionTokenProvider>) -> Self {
        self.session_provider = Some(provider);
        self
    }

    /// Decoder for object payloads.
    #[must_use]
    pub fn decoder(mut self, decoder: Arc<dyn ObjectDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Build the client and start its dispatcher.
    ///
    /// Must be called inside a tokio runtime. No connection is opened until
    /// the first subscription or an explicit connect.
    ///
    /// # Errors
    ///
    /// [`LiveQueryError::Configuration`] when no endpoint can be derived or
    /// the application id is empty.
    pub fn build(self) -> Result<LiveQueryClient> {
        let endpoint = self.config.endpoint()?;
        if self.config.application_id.is_empty() {
            return Err(LiveQueryError::Configuration(
                "application id must not be empty".to_string(),
            ));
        }

        Ok(LiveQueryClient::start(ClientParts {
            endpoint,
            application_id: self.config.application_id,
            client_key: self.config.client_key,
            transport_factory: self
                .transport_factory
                .unwrap_or_else(|| Arc::new(WebSocketTransportFactory::new())),
            session_provider: self
                .session_provider
                .unwrap_or_else(|| Arc::new(StaticSessionToken::anonymous())),
            decoder: self
                .decoder
                .unwrap_or_else(|| Arc::new(DefaultObjectDecoder)),
        }))
    }
}

impl fmt::Debug for LiveQueryClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQueryClientBuilder")
            .field("config", &self.config)
            .field("transport_factory", &self.transport_factory)
            .field("session_provider", &self.session_provider)
            .field("decoder", &self.decoder)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_endpoint() {
        let err = LiveQueryClient::builder()
            .application_id("app")
            .build()
            .unwrap_err();
        assert!(matches!(err, LiveQueryError::Configuration(_)));
    }

    #[test]
    fn test_build_requires_application_id() {
        let err = LiveQueryClient::builder()
            .server_url("https://api.example.com")
            .build()
            .unwrap_err();
        assert!(matches!(err, LiveQueryError::Configuration(_)));
    }

    #[test]
    fn test_build_rejects_unknown_scheme() {
        let err = LiveQueryClient::builder()
            .endpoint("tcp://api.example.com")
            .application_id("app")
            .build()
            .unwrap_err();
        assert!(matches!(err, LiveQueryError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_build_derives_endpoint() {
        let client = LiveQueryClient::builder()
            .server_url("https://api.example.com/parse")
            .application_id("app")
            .build()
            .unwrap();
        assert_eq!(client.endpoint(), "wss://api.example.com/parse");
        assert_eq!(client.subscription_count(), 0);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_config_is_applied() {
        let config = ClientConfig {
            live_query_url: Some("ws://localhost:1337".to_string()),
            application_id: "app".to_string(),
            ..ClientConfig::default()
        };
        let client = LiveQueryClient::builder().config(config).build().unwrap();
        assert_eq!(client.endpoint(), "ws://localhost:1337");
    }
}
