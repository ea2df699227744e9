use crate::credentials::CredentialManager;
use crate::error::Result;
use crate::types::BackendDeviceRecord;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Device-listing endpoints, in priority order
pub const DEVICE_ENDPOINTS: &[&str] = &[
    "/v1/devices",
    "/v2/devices",
    "/v1/endpoints",
    "/api/devices-v2/device?cached=true",
];

const CONTAINER_KEYS: &[&str] = &["devices", "device", "endpoints"];
const ID_KEYS: &[&str] = &[
    "id",
    "serialNumber",
    "deviceSerialNumber",
    "endpointId",
    "accountName",
];
const NAME_KEYS: &[&str] = &["name", "accountName", "deviceFamily", "friendlyName"];
const TYPE_KEYS: &[&str] = &["type", "deviceType", "deviceFamily"];

/// Backend discovery client
///
/// Walks the known device-listing endpoints in order until one yields at
/// least one device. The backend has exposed different shapes across API
/// versions, so every response goes through [`normalize_devices`].
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use alexa_airplay_bridge::{CredentialManager, DiscoveryClient};
/// # async fn example(credentials: Arc<CredentialManager>) {
/// let client = DiscoveryClient::new(
///     reqwest::Client::new(),
///     credentials,
///     "https://api.amazonalexa.com",
/// );
/// for device in client.list_devices().await.unwrap_or_default() {
///     println!("{} ({}) via {}", device.name, device.id, device.source_endpoint);
/// }
/// # }
/// ```
pub struct DiscoveryClient {
    http: reqwest::Client,
    credentials: Arc<CredentialManager>,
    api_base: String,
    endpoints: Vec<String>,
}

impl DiscoveryClient {
    pub fn new(
        http: reqwest::Client,
        credentials: Arc<CredentialManager>,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            http,
            credentials,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            endpoints: DEVICE_ENDPOINTS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Replace the endpoint list
    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// List backend devices
    ///
    /// Only a missing credential is an error. An exhausted endpoint list
    /// returns an empty vector.
    pub async fn list_devices(&self) -> Result<Vec<BackendDeviceRecord>> {
        let mut token = self.credentials.ensure_valid().await?;

        for endpoint in &self.endpoints {
            let url = self.request_url(endpoint);
            let mut resp = match self.get(&url, &token).await {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, error = %e, "discovery request failed");
                    continue;
                }
            };

            if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
                tracing::info!(endpoint = %endpoint, "401 from discovery, refreshing token and retrying");
                if !self.credentials.refresh().await {
                    tracing::warn!(endpoint = %endpoint, "token refresh failed, skipping endpoint");
                    continue;
                }
                token = self.credentials.ensure_valid().await?;
                resp = match self.get(&url, &token).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        tracing::warn!(endpoint = %endpoint, error = %e, "discovery retry failed");
                        continue;
                    }
                };
            }

            let status = resp.status();
            if status == reqwest::StatusCode::FORBIDDEN {
                tracing::warn!(endpoint = %endpoint, "403 (insufficient scope), skipping endpoint");
                continue;
            }
            if !status.is_success() {
                tracing::warn!(endpoint = %endpoint, status = %status, "discovery endpoint failed");
                continue;
            }

            let body: Value = match resp.json().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, error = %e, "unparseable discovery response");
                    continue;
                }
            };

            let devices = normalize_devices(&body, endpoint);
            if devices.is_empty() {
                tracing::debug!(endpoint = %endpoint, "no devices returned");
                continue;
            }
            tracing::info!(count = devices.len(), endpoint = %endpoint, "discovered devices");
            return Ok(devices);
        }

        tracing::warn!("no devices found on any discovery endpoint");
        Ok(Vec::new())
    }

    fn request_url(&self, endpoint: &str) -> String {
        let mut url = format!("{}{}", self.api_base, endpoint);
        // the legacy listing is cached aggressively upstream
        if endpoint.contains("cached=true") {
            url.push_str(&format!("&_={}", chrono::Utc::now().timestamp_millis()));
        }
        url
    }

    async fn get(&self, url: &str, token: &str) -> Result<reqwest::Response> {
        Ok(self
            .http
            .get(url)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?)
    }
}

/// Normalize a device-listing payload into canonical records
///
/// Records are deduplicated by the first non-empty identifier field; entries
/// with no identifier are dropped.
pub fn normalize_devices(payload: &Value, source_endpoint: &str) -> Vec<BackendDeviceRecord> {
    let entries: &[Value] = match payload {
        Value::Array(items) => items,
        Value::Object(map) => CONTAINER_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    };

    let mut seen = HashSet::new();
    let mut records = Vec::new();
    for entry in entries {
        let Some(map) = entry.as_object() else {
            continue;
        };
        let Some(id) = first_field(map, ID_KEYS) else {
            continue;
        };
        if !seen.insert(id.clone()) {
            continue;
        }
        let name = first_field(map, NAME_KEYS).unwrap_or_else(|| format!("Echo {}", id));
        let device_type = first_field(map, TYPE_KEYS).unwrap_or_else(|| "device".to_string());
        records.push(BackendDeviceRecord {
            id,
            name,
            device_type,
            source_endpoint: source_endpoint.to_string(),
            state: None,
        });
    }
    records
}

/// First non-empty string (or number) among `keys`
fn first_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credential, OAuthSettings};
    use crate::storage::Storage;
    use serde_json::json;

    #[test]
    fn normalizes_endpoint_shape() {
        let payload = json!({"endpoints": [{"endpointId": "X", "friendlyName": "Y"}]});
        let records = normalize_devices(&payload, "/v1/endpoints");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "X");
        assert_eq!(records[0].name, "Y");
        assert_eq!(records[0].device_type, "device");
        assert_eq!(records[0].source_endpoint, "/v1/endpoints");
    }

    #[test]
    fn normalizes_legacy_shape_and_dedups() {
        let payload = json!({"devices": [
            {"serialNumber": "S1", "accountName": "Kitchen", "deviceFamily": "ECHO"},
            {"deviceSerialNumber": "S1", "accountName": "Kitchen again"},
            {"id": 7, "deviceType": "WHA"},
            {"name": "no id at all"},
            "not an object"
        ]});
        let records = normalize_devices(&payload, "/v1/devices");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "Kitchen");
        assert_eq!(records[0].device_type, "ECHO");
        assert_eq!(records[1].id, "7");
        assert_eq!(records[1].name, "Echo 7");
        assert_eq!(records[1].kind(), crate::types::DeviceKind::Group);
    }

    #[test]
    fn accepts_bare_arrays_and_ignores_unknown_shapes() {
        assert_eq!(normalize_devices(&json!([{"id": "a"}]), "/x").len(), 1);
        assert!(normalize_devices(&json!({"items": [{"id": "a"}]}), "/x").is_empty());
        assert!(normalize_devices(&json!("nope"), "/x").is_empty());
    }

    fn credentials(dir: &tempfile::TempDir, token_url: String, expiry_ts: i64) -> Arc<CredentialManager> {
        let storage = Arc::new(Storage::new(dir.path(), dir.path()));
        storage
            .save_tokens(&Credential {
                access_token: "tok".into(),
                refresh_token: "ref".into(),
                expiry_ts,
            })
            .unwrap();
        let settings = OAuthSettings {
            client_id: "id".into(),
            client_secret: "secret".into(),
            redirect_uri: "http://localhost/cb".into(),
            auth_url: "http://localhost/auth".into(),
            token_url,
        };
        Arc::new(CredentialManager::new(reqwest::Client::new(), settings, storage))
    }

    fn far_future() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[tokio::test]
    async fn falls_back_past_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let a = server
            .mock("GET", "/v1/devices")
            .with_status(500)
            .create_async()
            .await;
        let b = server
            .mock("GET", "/v2/devices")
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"devices":[{"id":"D1","name":"Den"}]}"#)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let client = DiscoveryClient::new(
            reqwest::Client::new(),
            credentials(&dir, format!("{}/token", server.url()), far_future()),
            server.url(),
        )
        .with_endpoints(vec!["/v1/devices".into(), "/v2/devices".into()]);

        let devices = client.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "D1");
        assert_eq!(devices[0].source_endpoint, "/v2/devices");
        a.assert_async().await;
        b.assert_async().await;
    }

    #[tokio::test]
    async fn unauthorized_refreshes_and_retries_once() {
        let mut server = mockito::Server::new_async().await;
        let stale = server
            .mock("GET", "/v1/devices")
            .match_header("authorization", "Bearer tok")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"new","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;
        let fresh = server
            .mock("GET", "/v1/devices")
            .match_header("authorization", "Bearer new")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id":"D2"}]"#)
            .expect(1)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let client = DiscoveryClient::new(
            reqwest::Client::new(),
            credentials(&dir, format!("{}/token", server.url()), far_future()),
            server.url(),
        )
        .with_endpoints(vec!["/v1/devices".into()]);

        let devices = client.list_devices().await.unwrap();
        assert_eq!(devices[0].id, "D2");
        stale.assert_async().await;
        refresh.assert_async().await;
        fresh.assert_async().await;
    }

    #[tokio::test]
    async fn exhausted_endpoints_yield_empty_list() {
        let mut server = mockito::Server::new_async().await;
        let _forbidden = server
            .mock("GET", "/v1/devices")
            .with_status(403)
            .create_async()
            .await;
        let _garbage = server
            .mock("GET", "/v2/devices")
            .with_status(200)
            .with_body("<html>")
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let client = DiscoveryClient::new(
            reqwest::Client::new(),
            credentials(&dir, format!("{}/token", server.url()), far_future()),
            server.url(),
        )
        .with_endpoints(vec!["/v1/devices".into(), "/v2/devices".into()]);

        assert!(client.list_devices().await.unwrap().is_empty());
    }

    #[test]
    fn cache_buster_is_appended_to_legacy_listing() {
        let dir = tempfile::tempdir().unwrap();
        let client = DiscoveryClient::new(
            reqwest::Client::new(),
            credentials(&dir, "http://unused".into(), far_future()),
            "https://alexa.example/",
        );
        assert_eq!(client.request_url("/v1/devices"), "https://alexa.example/v1/devices");
        assert!(client
            .request_url("/api/devices-v2/device?cached=true")
            .starts_with("https://alexa.example/api/devices-v2/device?cached=true&_="));
    }
}
