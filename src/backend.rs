use crate::credentials::CredentialManager;
use crate::discovery::DiscoveryClient;
use crate::error::{BridgeError, Result};
use crate::protocol::Directive;
use crate::types::{BackendDeviceRecord, Verb};
use async_trait::async_trait;
use std::sync::Arc;

/// A system that owns the real speakers
///
/// The command bridge and the refresh worker only see this trait, so the
/// cloud API and the home-automation REST layer are interchangeable.
#[async_trait]
pub trait PlaybackBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Current backend device listing
    async fn list_devices(&self) -> Result<Vec<BackendDeviceRecord>>;

    /// Relay one playback verb to a backend entity
    async fn execute(&self, entity_id: &str, verb: &Verb) -> Result<()>;
}

/// Cloud backend: device discovery plus directives
pub struct AlexaBackend {
    http: reqwest::Client,
    credentials: Arc<CredentialManager>,
    discovery: DiscoveryClient,
    api_base: String,
}

impl AlexaBackend {
    pub fn new(
        http: reqwest::Client,
        credentials: Arc<CredentialManager>,
        api_base: impl Into<String>,
    ) -> Self {
        let api_base = api_base.into().trim_end_matches('/').to_string();
        Self {
            discovery: DiscoveryClient::new(http.clone(), credentials.clone(), api_base.clone()),
            http,
            credentials,
            api_base,
        }
    }

    /// Replace the discovery client (custom endpoint list)
    pub fn with_discovery(mut self, discovery: DiscoveryClient) -> Self {
        self.discovery = discovery;
        self
    }

    /// Post a directive to the directives endpoint
    pub async fn send_directive(&self, directive: &Directive) -> Result<()> {
        let token = self.credentials.ensure_valid().await?;
        let header = &directive.directive.header;
        tracing::debug!(
            namespace = %header.namespace,
            directive = %header.name,
            endpoint = %directive.directive.endpoint.endpoint_id,
            message_id = %directive.id(),
            "sending directive"
        );

        let resp = self
            .http
            .post(format!("{}/v1/directives", self.api_base))
            .bearer_auth(token)
            .json(directive)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(BridgeError::from_status(status, body))
    }
}

#[async_trait]
impl PlaybackBackend for AlexaBackend {
    fn name(&self) -> &'static str {
        "alexa"
    }

    async fn list_devices(&self) -> Result<Vec<BackendDeviceRecord>> {
        self.discovery.list_devices().await
    }

    async fn execute(&self, entity_id: &str, verb: &Verb) -> Result<()> {
        self.send_directive(&Directive::for_verb(verb, entity_id)).await
    }
}
