//! Home Assistant REST backend.
//!
//! Speakers are `media_player` entities; verbs become `media_player.*`
//! service calls.

use crate::backend::PlaybackBackend;
use crate::error::{BridgeError, Result};
use crate::registry::clamp_volume;
use crate::types::{BackendDeviceRecord, PlaybackState, RemoteState, Verb};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

const MEDIA_PLAYER: &str = "media_player";

/// Substrings that identify an Echo/Alexa entity
const ECHO_MARKERS: &[&str] = &[
    "echo", "alexa", "fire_tv", "fire tv", "amazon", "show", "dot", "studio", "plus", "pop",
    "sub",
];

/// One entry of `GET /states`
#[derive(Debug, Clone, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl EntityState {
    fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    pub fn friendly_name(&self) -> &str {
        self.attr_str("friendly_name").unwrap_or(&self.entity_id)
    }

    /// Heuristic match on entity id, friendly name and source
    pub fn looks_like_echo(&self) -> bool {
        let text = format!(
            "{} {} {}",
            self.entity_id,
            self.attr_str("friendly_name").unwrap_or(""),
            self.attr_str("source").unwrap_or("")
        )
        .to_lowercase();
        ECHO_MARKERS.iter().any(|m| text.contains(m))
    }

    /// Playback snapshot in registry terms
    pub fn remote_state(&self) -> RemoteState {
        let volume = self
            .attributes
            .get("volume_level")
            .and_then(Value::as_f64)
            .map(|level| clamp_volume((level * 100.0).round() as i64));
        RemoteState {
            playback_state: PlaybackState::from_backend(&self.state),
            volume,
            track: self.attr_str("media_title").map(str::to_string),
            artist: self.attr_str("media_artist").map(str::to_string),
        }
    }
}

/// Thin client for the Home Assistant REST API
pub struct HaClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HaClient {
    /// `base_url` is the API root, e.g. `http://supervisor/core/api`
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// All entity states
    pub async fn states(&self) -> Result<Vec<EntityState>> {
        if self.token.is_empty() {
            return Err(BridgeError::Unauthenticated);
        }
        let resp = self
            .http
            .get(format!("{}/states", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BridgeError::from_status(status, body));
        }
        Ok(resp.json().await?)
    }

    /// Invoke `domain.service` with `data`
    pub async fn call_service(&self, domain: &str, service: &str, data: Value) -> Result<()> {
        if self.token.is_empty() {
            return Err(BridgeError::Unauthenticated);
        }
        let resp = self
            .http
            .post(format!("{}/services/{}/{}", self.base_url, domain, service))
            .bearer_auth(&self.token)
            .json(&data)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            tracing::debug!(domain, service, "service called");
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        tracing::error!(domain, service, status = %status, "service call failed");
        Err(BridgeError::from_status(status, body))
    }
}

/// Backend over `media_player` entities
pub struct HomeAssistantBackend {
    client: HaClient,
    echo_only: bool,
}

impl HomeAssistantBackend {
    pub fn new(client: HaClient, echo_only: bool) -> Self {
        Self { client, echo_only }
    }
}

#[async_trait]
impl PlaybackBackend for HomeAssistantBackend {
    fn name(&self) -> &'static str {
        "home_assistant"
    }

    async fn list_devices(&self) -> Result<Vec<BackendDeviceRecord>> {
        let states = self.client.states().await?;
        let players: Vec<BackendDeviceRecord> = states
            .iter()
            .filter(|s| s.entity_id.starts_with("media_player."))
            .filter(|s| !self.echo_only || s.looks_like_echo())
            .map(|s| BackendDeviceRecord {
                id: s.entity_id.clone(),
                name: s.friendly_name().to_string(),
                device_type: MEDIA_PLAYER.to_string(),
                source_endpoint: "/states".to_string(),
                state: Some(s.remote_state()),
            })
            .collect();
        tracing::info!(count = players.len(), "discovered Home Assistant media players");
        Ok(players)
    }

    async fn execute(&self, entity_id: &str, verb: &Verb) -> Result<()> {
        let (service, extra) = verb.media_player_service();
        let mut data = Map::new();
        data.insert("entity_id".to_string(), Value::String(entity_id.to_string()));
        if let Some((key, value)) = extra {
            data.insert(key.to_string(), value);
        }
        self.client
            .call_service(MEDIA_PLAYER, service, Value::Object(data))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn states_body() -> String {
        json!([
            {"entity_id": "media_player.kitchen_echo", "state": "playing",
             "attributes": {"friendly_name": "Kitchen Echo", "volume_level": 0.42,
                            "media_title": "Song", "media_artist": "Band"}},
            {"entity_id": "media_player.tv", "state": "idle",
             "attributes": {"friendly_name": "Living TV"}},
            {"entity_id": "light.hall", "state": "on", "attributes": {}}
        ])
        .to_string()
    }

    #[tokio::test]
    async fn lists_echo_media_players_with_state() {
        let mut server = mockito::Server::new_async().await;
        let _states = server
            .mock("GET", "/states")
            .match_header("authorization", "Bearer ha-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(states_body())
            .create_async()
            .await;
        let backend = HomeAssistantBackend::new(
            HaClient::new(reqwest::Client::new(), server.url(), "ha-token"),
            true,
        );

        let devices = backend.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "media_player.kitchen_echo");
        assert_eq!(devices[0].name, "Kitchen Echo");
        let state = devices[0].state.clone().unwrap();
        assert_eq!(state.playback_state, PlaybackState::Playing);
        assert_eq!(state.volume, Some(42));
        assert_eq!(state.artist.as_deref(), Some("Band"));
    }

    #[tokio::test]
    async fn echo_filter_can_be_disabled() {
        let mut server = mockito::Server::new_async().await;
        let _states = server
            .mock("GET", "/states")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(states_body())
            .create_async()
            .await;
        let backend = HomeAssistantBackend::new(
            HaClient::new(reqwest::Client::new(), server.url(), "ha-token"),
            false,
        );
        assert_eq!(backend.list_devices().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn volume_set_scales_to_level() {
        let mut server = mockito::Server::new_async().await;
        let call = server
            .mock("POST", "/services/media_player/volume_set")
            .match_body(Matcher::Json(json!({
                "entity_id": "media_player.kitchen_echo",
                "volume_level": 0.25
            })))
            .with_status(200)
            .with_body("[]")
            .expect(1)
            .create_async()
            .await;
        let backend = HomeAssistantBackend::new(
            HaClient::new(reqwest::Client::new(), server.url(), "ha-token"),
            true,
        );

        backend
            .execute("media_player.kitchen_echo", &Verb::SetVolume(25))
            .await
            .unwrap();
        call.assert_async().await;
    }

    #[tokio::test]
    async fn missing_token_is_unauthenticated() {
        let client = HaClient::new(reqwest::Client::new(), "http://127.0.0.1:9", "");
        assert!(matches!(client.states().await, Err(BridgeError::Unauthenticated)));
    }

    #[test]
    fn echo_heuristic_checks_source_too() {
        let state: EntityState = serde_json::from_value(json!({
            "entity_id": "media_player.speaker_1",
            "state": "off",
            "attributes": {"friendly_name": "Bedroom", "source": "Amazon Music"}
        }))
        .unwrap();
        assert!(state.looks_like_echo());
        assert_eq!(state.remote_state().playback_state, PlaybackState::Stopped);
    }
}
