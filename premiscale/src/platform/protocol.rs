//! Wire shapes for the platform protocol (spec.md §4.5, §6). The spec
//! defines message directionality only, not the full wire format, so these
//! are the minimal envelopes the registration and websocket exchanges need.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationRequest {
    pub version: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub registration_key: String,
}

impl RegistrationRequest {
    pub fn new(registration_key: &SecretString) -> Self {
        RegistrationRequest {
            version: env!("CARGO_PKG_VERSION").to_string(),
            kind: "agent".to_string(),
            registration_key: registration_key.expose_secret().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub agent_id: String,
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// Persisted to `registration.json`, keyed by the host URL that produced
/// it (spec.md §4.5 "Registration"; restart idempotence scenario §8.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationEnvelope {
    pub host: String,
    pub response: RegistrationResponse,
}

/// Inbound configuration-override message delivered to the Reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
}
