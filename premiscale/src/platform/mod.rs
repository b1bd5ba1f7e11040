//! PlatformLink (spec.md §4.5): the single outbound websocket to the
//! remote platform. A missing or empty token puts the controller into
//! standalone mode — no link is started and the platform queue is simply
//! drained and discarded.

pub mod protocol;

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::configuration::PlatformSettings;
use crate::queues::{PlatformMessage, PlatformQueueReceiver};
use protocol::{InboundMessage, RegistrationEnvelope, RegistrationRequest, RegistrationResponse};

#[derive(thiserror::Error, Debug)]
pub enum PlatformError {
    #[error("registration failed: {0}")]
    Registration(String),
    #[error("rate limited, retry after {0}s")]
    RateLimited(u64),
    #[error("websocket error: {0}")]
    Websocket(String),
}

/// Reads/writes `registration.json`, keyed by the host URL that produced
/// the cached response (spec.md design: restart-idempotent registration).
pub struct RegistrationStore {
    path: PathBuf,
}

impl RegistrationStore {
    pub fn new(path: PathBuf) -> Self {
        RegistrationStore { path }
    }

    pub fn load(&self) -> Option<RegistrationEnvelope> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    pub fn save(&self, envelope: &RegistrationEnvelope) -> std::io::Result<()> {
        let contents = serde_json::to_string_pretty(envelope).map_err(std::io::Error::other)?;
        std::fs::write(&self.path, contents)
    }
}

async fn register(domain: &str, token: &SecretString, store: &RegistrationStore) -> Result<(), PlatformError> {
    if let Some(cached) = store.load() {
        if cached.host == domain {
            info!(%domain, "registration already cached for this host, skipping registration POST");
            return Ok(());
        }
    }

    let client = reqwest::Client::new();
    let url = format!("https://{}/api/v1/register", domain.trim_end_matches('/'));
    let request = RegistrationRequest::new(token);

    let response = client
        .post(&url)
        .json(&request)
        .send()
        .await
        .map_err(|e| PlatformError::Registration(e.to_string()))?;

    if response.status().as_u16() == 429 {
        let reset: u64 = response
            .headers()
            .get("x-rate-limit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);
        return Err(PlatformError::RateLimited(reset));
    }

    if !response.status().is_success() {
        return Err(PlatformError::Registration(format!("registration POST returned {}", response.status())));
    }

    let body: RegistrationResponse =
        response.json().await.map_err(|e| PlatformError::Registration(e.to_string()))?;

    store
        .save(&RegistrationEnvelope { host: domain.to_string(), response: body })
        .map_err(|e| PlatformError::Registration(e.to_string()))?;

    Ok(())
}

/// Registers (idempotently) then runs reconnect loop forever, sending
/// queued outbound messages and forwarding inbound ones, until the process
/// shuts down. In standalone mode the caller should never construct this
/// and instead just drain the platform queue (see `drain_standalone`).
pub struct PlatformLink {
    domain: String,
    token: SecretString,
    registration_store: RegistrationStore,
    platform_queue: PlatformQueueReceiver,
    inbound_tx: tokio::sync::mpsc::Sender<InboundMessage>,
}

impl PlatformLink {
    /// Builds a link when the platform is configured, handing the queue
    /// receiver back to the caller untouched otherwise (standalone mode),
    /// so it can still be drained with `drain_standalone`.
    pub fn new(
        settings: &PlatformSettings,
        registration_path: &Path,
        platform_queue: PlatformQueueReceiver,
        inbound_tx: tokio::sync::mpsc::Sender<InboundMessage>,
    ) -> Result<Self, PlatformQueueReceiver> {
        let (domain, token) = match (settings.domain.clone(), settings.token.clone()) {
            (Some(domain), Some(token)) if !token.expose_secret().is_empty() => (domain, token),
            _ => return Err(platform_queue),
        };
        Ok(PlatformLink {
            domain,
            token,
            registration_store: RegistrationStore::new(registration_path.to_path_buf()),
            platform_queue,
            inbound_tx,
        })
    }

    pub async fn run(mut self) -> Result<(), crate::errors::FatalError> {
        loop {
            match register(&self.domain, &self.token, &self.registration_store).await {
                Ok(()) => break,
                Err(PlatformError::RateLimited(reset)) => {
                    let jitter = rand::thread_rng().gen_range(0..5);
                    warn!(reset, "registration rate limited, backing off");
                    sleep(Duration::from_secs(reset + jitter)).await;
                }
                Err(e) => {
                    warn!(error = %e, "registration failed, retrying shortly");
                    sleep(Duration::from_secs(5)).await;
                }
            }
        }

        let mut backoff = Duration::from_secs(1);
        loop {
            match self.connect_and_serve().await {
                Ok(()) => backoff = Duration::from_secs(1),
                Err(e) => {
                    warn!(error = %e, ?backoff, "platform connection lost, reconnecting");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(60));
                }
            }
        }
    }

    async fn connect_and_serve(&mut self) -> Result<(), PlatformError> {
        let url = format!("wss://{}/ws", self.domain.trim_end_matches('/'));
        let (stream, _response) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| PlatformError::Websocket(e.to_string()))?;
        info!(%url, "platform websocket connected");

        let (mut write, mut read) = stream.split();

        loop {
            tokio::select! {
                outbound = self.platform_queue.recv() => {
                    let Some(message) = outbound else { return Ok(()) };
                    let json = match &message {
                        PlatformMessage::Audit(record) => serde_json::to_string(record),
                        PlatformMessage::Telemetry(value) => serde_json::to_string(value),
                    };
                    match json {
                        Ok(text) => {
                            if let Err(e) = write.send(Message::Text(text.into())).await {
                                return Err(PlatformError::Websocket(e.to_string()));
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to serialize outbound platform message"),
                    }
                }
                inbound = read.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<InboundMessage>(&text) {
                                Ok(parsed) => {
                                    if self.inbound_tx.send(parsed).await.is_err() {
                                        warn!("inbound message receiver dropped");
                                    }
                                }
                                Err(e) => warn!(error = %e, "failed to parse inbound platform message"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return Err(PlatformError::Websocket("connection closed".into())),
                        Some(Err(e)) => return Err(PlatformError::Websocket(e.to_string())),
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Standalone mode: no PlatformLink runs, so the platform queue must still
/// be drained or producers would block on a full queue forever.
pub async fn drain_standalone(mut platform_queue: PlatformQueueReceiver) {
    while platform_queue.recv().await.is_some() {
        // discarded; spec.md §9 leaves standalone-mode audit persistence as
        // an open question, resolved here as "not persisted" (see DESIGN.md).
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registration.json");
        let store = RegistrationStore::new(path);
        let envelope = RegistrationEnvelope {
            host: "platform.example.com".into(),
            response: RegistrationResponse { agent_id: "abc123".into(), extra: serde_json::Value::Null },
        };
        store.save(&envelope).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.host, envelope.host);
        assert_eq!(loaded.response.agent_id, envelope.response.agent_id);
    }

    #[test]
    fn registration_store_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistrationStore::new(dir.path().join("missing.json"));
        assert!(store.load().is_none());
    }
}
