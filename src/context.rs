use crate::backend::{AlexaBackend, PlaybackBackend};
use crate::bridge::CommandBridge;
use crate::config::{BackendKind, Config};
use crate::credentials::{CredentialManager, OAuthSettings};
use crate::error::Result;
use crate::home_assistant::{HaClient, HomeAssistantBackend};
use crate::registry::DeviceRegistry;
use crate::storage::Storage;
use std::sync::Arc;

/// Process-wide collaborators, built once at startup and shared by handle
pub struct BridgeContext {
    pub config: Config,
    pub storage: Arc<Storage>,
    pub registry: Arc<DeviceRegistry>,
    pub credentials: Arc<CredentialManager>,
    pub backend: Arc<dyn PlaybackBackend>,
    pub bridge: Arc<CommandBridge>,
}

impl BridgeContext {
    /// Build every collaborator from configuration
    ///
    /// Restores the device registry and any persisted tokens from disk.
    pub fn build(config: Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()?;
        let storage = Arc::new(Storage::new(&config.config_dir, &config.data_dir));
        let registry = Arc::new(DeviceRegistry::load(storage.clone()));
        let credentials = Arc::new(CredentialManager::new(
            http.clone(),
            OAuthSettings::from_config(&config),
            storage.clone(),
        ));

        let backend: Arc<dyn PlaybackBackend> = match config.backend {
            BackendKind::Alexa => Arc::new(AlexaBackend::new(
                http,
                credentials.clone(),
                config.amazon_api_base.as_str(),
            )),
            BackendKind::HomeAssistant => Arc::new(HomeAssistantBackend::new(
                HaClient::new(http, config.ha_url.as_str(), config.ha_token.as_str()),
                config.echo_only,
            )),
        };
        tracing::info!(backend = backend.name(), "backend selected");

        Ok(Self::from_parts(config, storage, registry, credentials, backend))
    }

    /// Assemble a context from already-built collaborators
    pub fn from_parts(
        config: Config,
        storage: Arc<Storage>,
        registry: Arc<DeviceRegistry>,
        credentials: Arc<CredentialManager>,
        backend: Arc<dyn PlaybackBackend>,
    ) -> Self {
        let bridge = Arc::new(
            CommandBridge::new(registry.clone(), backend.clone(), config.http_timeout())
                .with_auto_register(config.auto_register),
        );
        Self {
            config,
            storage,
            registry,
            credentials,
            backend,
            bridge,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Context over a temp dir and an arbitrary backend
    pub(crate) fn context(
        dir: &tempfile::TempDir,
        backend: Arc<dyn PlaybackBackend>,
        config: Config,
    ) -> Arc<BridgeContext> {
        let storage = Arc::new(Storage::new(dir.path(), dir.path()));
        let registry = Arc::new(DeviceRegistry::new(storage.clone()));
        let settings = OAuthSettings::from_config(&config);
        let credentials = Arc::new(CredentialManager::new(
            reqwest::Client::new(),
            settings,
            storage.clone(),
        ));
        Arc::new(BridgeContext::from_parts(
            config,
            storage,
            registry,
            credentials,
            backend,
        ))
    }
}
