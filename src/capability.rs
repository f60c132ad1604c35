//! Relay capability negotiation.
//!
//! Fetches and caches each relay's NIP-11 information document (over HTTP
//! with ws->http scheme substitution) and runs the NIP-42 challenge/response
//! handshake on relays that require authentication.

use crate::error::{EngineError, Result};
use crate::event::{unix_now, EventTemplate, KIND_RELAY_AUTH};
use crate::relay::RelayConnection;
use crate::signer::Signer;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

/// A relay's NIP-11 information document. Fields the engine does not act on
/// are kept for callers that want to inspect them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayDescriptor {
    /// Relay name
    #[serde(default)]
    pub name: Option<String>,
    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,
    /// Relay software identifier
    #[serde(default)]
    pub software: Option<String>,
    /// Supported NIP numbers
    #[serde(default)]
    pub supported_nips: Option<Vec<u16>>,
    /// Server limitations
    #[serde(default)]
    pub limitation: Option<RelayLimitation>,
}

/// The `limitation` object of a NIP-11 document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayLimitation {
    /// Whether the relay requires NIP-42 auth before serving requests
    #[serde(default)]
    pub auth_required: Option<bool>,
}

/// Cached capability record for one relay.
#[derive(Debug, Clone)]
pub struct RelayCapability {
    /// Normalized relay URL
    pub url: String,
    /// Whether the relay requires authentication
    pub auth_required: bool,
    /// Raw descriptor, when the relay served one
    pub descriptor: Option<RelayDescriptor>,
}

/// Negotiator configuration
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Timeout for the NIP-11 document fetch
    pub fetch_timeout: Duration,
    /// How long to wait for a challenge and for the auth OK
    pub auth_timeout: Duration,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(10),
        }
    }
}

/// Fetches, caches and acts on relay capabilities. Sole mutator of the
/// capability cache.
pub struct CapabilityNegotiator {
    http: reqwest::Client,
    config: NegotiatorConfig,
    signer: Arc<dyn Signer>,
    cache: RwLock<HashMap<String, RelayCapability>>,
}

/// Derive the NIP-11 document URL from a relay URL by scheme substitution.
pub fn descriptor_url(relay_url: &str) -> Result<String> {
    let mut url = Url::parse(relay_url)?;
    let scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        other => {
            return Err(EngineError::InvalidUrl(format!(
                "cannot derive descriptor URL from scheme {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| EngineError::InvalidUrl(relay_url.to_string()))?;
    Ok(url.to_string())
}

impl CapabilityNegotiator {
    /// Create a negotiator backed by the given signer.
    pub fn new(signer: Arc<dyn Signer>, config: NegotiatorConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            signer,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Capability record for a relay, fetching and caching it on first use.
    ///
    /// A missing or unparsable descriptor is not an error: plenty of
    /// production relays serve none. Those relays get a default record with
    /// `auth_required = false`, and the handshake still runs if they
    /// volunteer a challenge.
    pub async fn capability(&self, relay_url: &str) -> RelayCapability {
        if let Some(cached) = self.cache.read().await.get(relay_url) {
            return cached.clone();
        }

        let capability = match self.fetch_descriptor(relay_url).await {
            Ok(descriptor) => {
                let auth_required = descriptor
                    .limitation
                    .as_ref()
                    .and_then(|l| l.auth_required)
                    .unwrap_or(false);
                RelayCapability {
                    url: relay_url.to_string(),
                    auth_required,
                    descriptor: Some(descriptor),
                }
            }
            Err(e) => {
                debug!("no descriptor from {}: {}", relay_url, e);
                RelayCapability {
                    url: relay_url.to_string(),
                    auth_required: false,
                    descriptor: None,
                }
            }
        };

        self.cache
            .write()
            .await
            .insert(relay_url.to_string(), capability.clone());
        capability
    }

    async fn fetch_descriptor(&self, relay_url: &str) -> Result<RelayDescriptor> {
        let doc_url = descriptor_url(relay_url)?;
        let response = self
            .http
            .get(&doc_url)
            .header("Accept", "application/nostr+json")
            .timeout(self.config.fetch_timeout)
            .send()
            .await
            .map_err(|e| EngineError::Connection(format!("descriptor fetch: {}", e)))?;
        response
            .json::<RelayDescriptor>()
            .await
            .map_err(|e| EngineError::Protocol(format!("descriptor parse: {}", e)))
    }

    /// Drop the cached capability for a relay, forcing a refetch.
    pub async fn reset(&self, relay_url: &str) {
        self.cache.write().await.remove(relay_url);
    }

    /// Make a freshly opened connection usable: fetch capabilities and, if
    /// the relay requires (or volunteers) authentication, complete the
    /// NIP-42 handshake.
    ///
    /// The handshake runs at most once per session; repeat calls on an
    /// already-authenticated connection are no-ops, so signers are not
    /// prompted again on every request.
    pub async fn ensure_ready(&self, conn: &RelayConnection) -> Result<()> {
        if conn.is_authenticated() {
            return Ok(());
        }
        let relay_url = conn.url().to_string();
        let capability = self.capability(&relay_url).await;

        let challenge = if capability.auth_required {
            // Advertised auth: the challenge must arrive, or connecting to
            // this relay has failed.
            Some(conn.await_challenge(self.config.auth_timeout).await?)
        } else {
            // Opportunistic: some relays send AUTH without advertising it.
            conn.challenge()
        };

        if let Some(challenge) = challenge {
            self.answer_challenge(conn, &relay_url, &challenge).await?;
            conn.mark_authenticated();
        }
        Ok(())
    }

    async fn answer_challenge(
        &self,
        conn: &RelayConnection,
        relay_url: &str,
        challenge: &str,
    ) -> Result<()> {
        let template = EventTemplate {
            created_at: unix_now(),
            kind: KIND_RELAY_AUTH,
            tags: vec![
                vec!["relay".to_string(), relay_url.to_string()],
                vec!["challenge".to_string(), challenge.to_string()],
            ],
            content: String::new(),
        };
        let event = self.signer.sign(template).await?;
        let ack = conn.authenticate(&event, self.config.auth_timeout).await?;
        if !ack.accepted {
            warn!("auth rejected by {}: {}", relay_url, ack.message);
            return Err(EngineError::AuthRejected(ack.message));
        }
        info!("authenticated to {}", relay_url);
        Ok(())
    }
}
