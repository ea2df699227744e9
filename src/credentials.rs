//! OAuth credential lifecycle for the cloud backend.
//!
//! Tokens are exchanged from a one-time authorization code, restored from
//! disk on startup, and refreshed transparently when they expire.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::protocol::TokenResponse;
use crate::storage::Storage;

const DEFAULT_TTL_SECS: i64 = 3600;
const OAUTH_SCOPE: &str = "alexa:all";

/// Access/refresh token pair with its expiry
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    /// Unix seconds
    #[serde(default)]
    pub expiry_ts: i64,
}

impl Credential {
    /// True iff a refresh token is held
    pub fn is_authenticated(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    /// Whether the access token is unusable at `now` plus `margin` seconds
    pub fn expires_within(&self, now: i64, margin: i64) -> bool {
        self.access_token.is_empty() || self.expiry_ts <= now + margin
    }
}

/// OAuth client settings
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub auth_url: String,
    pub token_url: String,
}

impl OAuthSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            client_id: config.amazon_client_id.clone(),
            client_secret: config.amazon_client_secret.clone(),
            redirect_uri: config.amazon_redirect_uri.clone(),
            auth_url: config.amazon_auth_url.clone(),
            token_url: config.amazon_token_url.clone(),
        }
    }
}

/// Owns the backend credential and keeps it valid
pub struct CredentialManager {
    http: reqwest::Client,
    settings: OAuthSettings,
    storage: Arc<Storage>,
    credential: RwLock<Credential>,
    /// One refresh in flight at a time
    refresh_lock: Mutex<()>,
}

impl CredentialManager {
    /// Create a manager, restoring any persisted tokens
    pub fn new(http: reqwest::Client, settings: OAuthSettings, storage: Arc<Storage>) -> Self {
        let credential = match storage.load_tokens() {
            Ok(Some(credential)) => {
                tracing::info!(
                    authenticated = credential.is_authenticated(),
                    "restored persisted OAuth tokens"
                );
                credential
            }
            Ok(None) => Credential::default(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to load persisted tokens");
                Credential::default()
            }
        };

        Self {
            http,
            settings,
            storage,
            credential: RwLock::new(credential),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Login URL the user visits to obtain an authorization code
    pub fn authorization_url(&self) -> String {
        format!(
            "{}?client_id={}&scope={}&response_type=code&redirect_uri={}",
            self.settings.auth_url,
            urlencoding::encode(&self.settings.client_id),
            urlencoding::encode(OAUTH_SCOPE),
            urlencoding::encode(&self.settings.redirect_uri),
        )
    }

    pub async fn is_authenticated(&self) -> bool {
        self.credential.read().await.is_authenticated()
    }

    /// Copy of the current credential
    pub async fn snapshot(&self) -> Credential {
        self.credential.read().await.clone()
    }

    /// Exchange a one-time authorization code for a token pair
    pub async fn authorize(&self, code: &str) -> Result<()> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("redirect_uri", self.settings.redirect_uri.as_str()),
        ];
        let resp = self
            .http
            .post(&self.settings.token_url)
            .form(&form)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::error!(status = %status, "failed to exchange authorization code");
            return Err(BridgeError::from_status(status, body));
        }

        let token: TokenResponse = resp.json().await?;
        let (Some(access_token), Some(refresh_token)) = (token.access_token, token.refresh_token)
        else {
            return Err(BridgeError::BackendRejected {
                status: status.as_u16(),
                detail: token
                    .error
                    .unwrap_or_else(|| "token response missing tokens".to_string()),
            });
        };

        let credential = Credential {
            access_token,
            refresh_token,
            expiry_ts: now() + token.expires_in.unwrap_or(DEFAULT_TTL_SECS),
        };
        self.store(credential).await;
        tracing::info!("authenticated with backend");
        Ok(())
    }

    /// Return a usable access token, refreshing first if it has expired
    pub async fn ensure_valid(&self) -> Result<String> {
        {
            let credential = self.credential.read().await;
            if credential.access_token.is_empty() && !credential.is_authenticated() {
                return Err(BridgeError::Unauthenticated);
            }
            if !credential.expires_within(now(), 0) {
                return Ok(credential.access_token.clone());
            }
        }

        if self.refresh_if_expiring(Duration::ZERO).await {
            Ok(self.credential.read().await.access_token.clone())
        } else {
            Err(BridgeError::BackendUnavailable(
                "access token expired and could not be refreshed".to_string(),
            ))
        }
    }

    /// Force a refresh. Fails softly: `false` means "not possible right now".
    pub async fn refresh(&self) -> bool {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Refresh only if the token expires within `margin`.
    ///
    /// The expiry is rechecked under the refresh lock so callers racing on
    /// the same expired token trigger a single refresh.
    pub async fn refresh_if_expiring(&self, margin: Duration) -> bool {
        let _guard = self.refresh_lock.lock().await;
        let expiring = self
            .credential
            .read()
            .await
            .expires_within(now(), margin.as_secs() as i64);
        if !expiring {
            return true;
        }
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> bool {
        let refresh_token = self.credential.read().await.refresh_token.clone();
        if refresh_token.is_empty() {
            tracing::debug!("no refresh token held, cannot refresh");
            return false;
        }

        tracing::info!("refreshing access token");
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
        ];
        let resp = match self
            .http
            .post(&self.settings.token_url)
            .form(&form)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(error = %e, "token refresh request failed");
                return false;
            }
        };

        if !resp.status().is_success() {
            tracing::error!(status = %resp.status(), "failed to refresh token");
            return false;
        }

        let token: TokenResponse = match resp.json().await {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(error = %e, "unparseable token refresh response");
                return false;
            }
        };
        let Some(access_token) = token.access_token else {
            tracing::error!(error = ?token.error, "refresh response missing access_token");
            return false;
        };

        let credential = Credential {
            access_token,
            // a rotated refresh token replaces the old one, otherwise keep it
            refresh_token: token.refresh_token.unwrap_or(refresh_token),
            expiry_ts: now() + token.expires_in.unwrap_or(DEFAULT_TTL_SECS),
        };
        self.store(credential).await;
        tracing::info!("token refreshed successfully");
        true
    }

    async fn store(&self, credential: Credential) {
        if let Err(e) = self.storage.save_tokens(&credential) {
            tracing::error!(error = %e, "failed to save tokens");
        }
        *self.credential.write().await = credential;
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
