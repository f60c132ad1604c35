//! Relay connection registry.
//!
//! Owns exactly one `RelayConnection` per normalized relay URL. Connections
//! are created lazily and dialed on demand; a per-URL gate makes concurrent
//! `connect` calls share one dial instead of racing for the socket. The
//! registry is the sole mutator of connection lifecycle state.

use crate::capability::CapabilityNegotiator;
use crate::error::{EngineError, Result};
use crate::relay::{RelayConfig, RelayConnection};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use url::Url;

/// Normalize a relay URL to its canonical form.
///
/// Lowercases scheme and host and restores the root path, so `WSS://X` and
/// `wss://x/` register as the same relay. Only `ws` and `wss` are accepted.
pub fn normalize_relay_url(raw: &str) -> Result<String> {
    let url = Url::parse(raw.trim())?;
    match url.scheme() {
        "ws" | "wss" => Ok(url.to_string()),
        other => Err(EngineError::InvalidUrl(format!(
            "relay URL must use ws:// or wss://, got {}",
            other
        ))),
    }
}

/// Registry of relay connections, one per normalized URL.
pub struct ConnectionRegistry {
    relay_config: RelayConfig,
    negotiator: Arc<CapabilityNegotiator>,
    connections: RwLock<HashMap<String, Arc<RelayConnection>>>,
    dial_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConnectionRegistry {
    /// Create a registry with the given per-connection config and
    /// capability negotiator.
    pub fn new(relay_config: RelayConfig, negotiator: Arc<CapabilityNegotiator>) -> Self {
        Self {
            relay_config,
            negotiator,
            connections: RwLock::new(HashMap::new()),
            dial_gates: Mutex::new(HashMap::new()),
        }
    }

    /// The negotiator this registry drives during `connect`.
    pub fn negotiator(&self) -> &Arc<CapabilityNegotiator> {
        &self.negotiator
    }

    /// Return the connection for a URL, registering a new not-yet-connected
    /// one if none exists.
    pub async fn get(&self, url: &str) -> Result<Arc<RelayConnection>> {
        let url = normalize_relay_url(url)?;

        if let Some(conn) = self.connections.read().await.get(&url) {
            return Ok(Arc::clone(conn));
        }

        let mut connections = self.connections.write().await;
        // Re-check under the write lock so concurrent callers cannot
        // register two objects for the same relay.
        if let Some(conn) = connections.get(&url) {
            return Ok(Arc::clone(conn));
        }
        debug!("registering relay {}", url);
        let conn = Arc::new(RelayConnection::new(&url, self.relay_config.clone())?);
        connections.insert(url, Arc::clone(&conn));
        Ok(conn)
    }

    /// Return the connection for a URL, guaranteed open and authenticated.
    ///
    /// Dials if necessary; concurrent calls for the same URL share a single
    /// dial. Capability checks run as a side effect and populate the
    /// negotiator's cache.
    pub async fn connect(&self, url: &str) -> Result<Arc<RelayConnection>> {
        let conn = self.get(url).await?;
        let gate = self.dial_gate(conn.url().as_str()).await;
        let _guard = gate.lock().await;

        if !conn.is_open().await {
            conn.connect().await?;
        }
        self.negotiator.ensure_ready(&conn).await?;
        Ok(conn)
    }

    /// Disconnect and drop a relay from the registry.
    pub async fn remove(&self, url: &str) -> Result<()> {
        let url = normalize_relay_url(url)?;
        let removed = self.connections.write().await.remove(&url);
        if let Some(conn) = removed {
            conn.disconnect().await;
        }
        self.dial_gates.lock().await.remove(&url);
        self.negotiator.reset(&url).await;
        Ok(())
    }

    /// URLs of all registered relays.
    pub async fn urls(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    async fn dial_gate(&self, url: &str) -> Arc<Mutex<()>> {
        let mut gates = self.dial_gates.lock().await;
        Arc::clone(gates.entry(url.to_string()).or_default())
    }
}
