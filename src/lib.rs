//! Client-side engine for the Nostr relay protocol.
//!
//! This crate provides:
//! - WebSocket connections to Nostr relays with NIP-11 capability discovery
//!   and NIP-42 authentication
//! - Message parsing (NIP-01 relay protocol)
//! - Fan-out queries and publishes across relay sets with per-relay timeout
//!   isolation
//! - Replaceable-event resolution (last-writer-wins plus NIP-09 deletion)
//! - Reconnection supervision for relays that drop
//! - An encrypted key/value store on NIP-78 application data
//!
//! Signing and payload encryption are injected through the [`Signer`] trait;
//! the engine never touches key material.
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_engine::{Engine, EngineConfig, Filter, Signer};
//! use std::sync::Arc;
//!
//! # async fn run(signer: Arc<dyn Signer>) {
//! let engine = Engine::new(signer, EngineConfig::default());
//! let relays = vec![
//!     "wss://relay.damus.io".to_string(),
//!     "wss://nos.lol".to_string(),
//! ];
//!
//! // Fan a query out and drain batches until end-of-stream.
//! let filter = Filter::new().kinds(vec![1]).limit(10);
//! let mut stream = engine.query(vec![filter], &relays);
//! while let Some(update) = stream.next().await {
//!     for relay_event in &update.events {
//!         println!("{} from {}", relay_event.event.id, relay_event.origin);
//!     }
//!     if update.end_of_stream {
//!         break;
//!     }
//! }
//!
//! // Encrypted key/value storage on the same relays.
//! engine
//!     .app_data()
//!     .put("settings", &serde_json::json!({"theme": "dark"}), &relays)
//!     .await
//!     .unwrap();
//! # }
//! ```

pub mod cache;
pub mod capability;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod message;
pub mod registry;
pub mod relay;
pub mod signer;
pub mod store;
pub mod supervisor;

pub use cache::EventStore;
pub use capability::{CapabilityNegotiator, NegotiatorConfig, RelayCapability, RelayDescriptor};
pub use coordinator::{Coordinator, CoordinatorConfig, QueryStream, QueryUpdate};
pub use error::{EngineError, Result};
pub use event::{Event, EventTemplate, KindClass, RelayEvent};
pub use message::{ClientMessage, Filter, RelayMessage};
pub use registry::ConnectionRegistry;
pub use relay::{CommandAck, ConnectionState, RelayConfig, RelayConnection, SubscriptionUpdate};
pub use signer::Signer;
pub use store::{EncryptedStore, StoredEntry};
pub use supervisor::{HealthStatus, ReconnectionSupervisor, RelayHealth, SupervisorPolicy};

use std::sync::Arc;

/// Engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Per-connection settings (dial timeout)
    pub relay: RelayConfig,
    /// Capability negotiation settings (descriptor fetch, auth timeouts)
    pub negotiator: NegotiatorConfig,
    /// Fan-out settings (per-relay window)
    pub coordinator: CoordinatorConfig,
    /// Reconnection retry schedule
    pub supervisor: SupervisorPolicy,
}

/// Facade wiring the engine's components together.
///
/// Connections, cache and capability records are shared across every request
/// made through the same engine. The relay set is per call: callers pass the
/// relays each query, publish or store operation should span.
pub struct Engine {
    registry: Arc<ConnectionRegistry>,
    coordinator: Arc<Coordinator>,
    supervisor: ReconnectionSupervisor,
    app_data: EncryptedStore,
    event_store: Arc<EventStore>,
}

impl Engine {
    /// Build an engine around the given signing capability.
    pub fn new(signer: Arc<dyn Signer>, config: EngineConfig) -> Self {
        let negotiator = Arc::new(CapabilityNegotiator::new(
            Arc::clone(&signer),
            config.negotiator,
        ));
        let registry = Arc::new(ConnectionRegistry::new(config.relay, negotiator));
        let event_store = Arc::new(EventStore::new());
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&registry),
            Arc::clone(&event_store),
            config.coordinator,
        ));
        let supervisor = ReconnectionSupervisor::new(Arc::clone(&registry), config.supervisor);
        let app_data = EncryptedStore::new(Arc::clone(&coordinator), signer);

        Self {
            registry,
            coordinator,
            supervisor,
            app_data,
            event_store,
        }
    }

    /// Query a set of relays. See [`Coordinator::query`].
    pub fn query(&self, filters: Vec<Filter>, relays: &[String]) -> QueryStream {
        self.coordinator.query(filters, relays)
    }

    /// Publish an event to a set of relays. See [`Coordinator::publish`].
    pub async fn publish(&self, event: &Event, relays: &[String]) -> Vec<RelayEvent> {
        self.coordinator.publish(event, relays).await
    }

    /// Resolve a replaceable event across relays.
    pub async fn resolve_replaceable(
        &self,
        kind: u16,
        pubkey: &str,
        relays: &[String],
    ) -> Result<Option<Event>> {
        self.coordinator
            .resolve_replaceable(kind, pubkey, relays)
            .await
    }

    /// Resolve a parameterized-replaceable event across relays.
    pub async fn resolve_parameterized(
        &self,
        kind: u16,
        pubkey: &str,
        d_tag: &str,
        relays: &[String],
    ) -> Result<Option<Event>> {
        self.coordinator
            .resolve_parameterized(kind, pubkey, d_tag, relays)
            .await
    }

    /// Dial a relay (idempotent) and complete its capability handshake.
    pub async fn connect(&self, url: &str) -> Result<Arc<RelayConnection>> {
        self.registry.connect(url).await
    }

    /// Start supervising a relay; `on_recovered` fires once it is reachable.
    pub async fn ensure_healthy<F>(&self, url: &str, on_recovered: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.supervisor.ensure_healthy(url, on_recovered).await
    }

    /// Health record of a supervised relay.
    pub async fn health(&self, url: &str) -> Result<RelayHealth> {
        self.supervisor.health(url).await
    }

    /// The encrypted key/value store.
    pub fn app_data(&self) -> &EncryptedStore {
        &self.app_data
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The shared event cache.
    pub fn cache(&self) -> &Arc<EventStore> {
        &self.event_store
    }
}
