use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::Verb;

/// Cloud directive envelope posted to `/v1/directives`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directive {
    pub directive: DirectiveBody,
}

/// Directive body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectiveBody {
    pub header: DirectiveHeader,
    pub endpoint: DirectiveEndpoint,
    #[serde(default)]
    pub payload: Value,
}

/// Directive header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectiveHeader {
    pub namespace: String,
    pub name: String,
    #[serde(rename = "messageId")]
    pub message_id: Uuid,
    #[serde(rename = "payloadVersion")]
    pub payload_version: String,
}

/// Directive target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectiveEndpoint {
    #[serde(rename = "endpointId")]
    pub endpoint_id: String,
}

impl Directive {
    /// Create a new directive with the given namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            directive: DirectiveBody {
                header: DirectiveHeader {
                    namespace: namespace.into(),
                    name: name.into(),
                    message_id: Uuid::new_v4(),
                    payload_version: "3".to_string(),
                },
                endpoint: DirectiveEndpoint {
                    endpoint_id: String::new(),
                },
                payload: Value::Object(Default::default()),
            },
        }
    }

    /// Build the directive for a playback verb
    pub fn for_verb(verb: &Verb, endpoint_id: impl Into<String>) -> Self {
        let (namespace, name, payload) = verb.directive();
        Self::new(namespace, name)
            .with_endpoint(endpoint_id)
            .with_payload(payload)
    }

    /// Set the target endpoint
    pub fn with_endpoint(mut self, endpoint_id: impl Into<String>) -> Self {
        self.directive.endpoint.endpoint_id = endpoint_id.into();
        self
    }

    /// Set the directive payload
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.directive.payload = payload;
        self
    }

    /// Get the message ID
    pub fn id(&self) -> Uuid {
        self.directive.header.message_id
    }
}

/// Token endpoint response for both code exchange and refresh
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}
