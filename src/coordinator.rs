//! Multi-relay request coordination.
//!
//! A query or publish fans out as one task per relay and fans the partial
//! results back into a single channel. Each relay gets a bounded time window;
//! a relay that fails or never answers is logged and dropped from the
//! contributing set without failing the request. The end-of-stream marker is
//! emitted strictly after every relay has replied or timed out, tracked by a
//! remaining-relay counter.

use crate::cache::EventStore;
use crate::error::{EngineError, Result};
use crate::event::{
    is_param_replaceable_kind, is_replaceable_kind, param_coordinate, replaceable_coordinate,
    Event, RelayEvent, KIND_DELETION,
};
use crate::message::Filter;
use crate::registry::ConnectionRegistry;
use crate::relay::{RelayConnection, SubscriptionUpdate};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Time window each relay gets to connect, answer and drain
    pub per_relay_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            per_relay_timeout: Duration::from_secs(5),
        }
    }
}

/// One batch of fan-in results.
#[derive(Debug, Clone)]
pub struct QueryUpdate {
    /// Events one relay contributed (empty on the final update)
    pub events: Vec<RelayEvent>,
    /// Set on the last update of the request, after every relay replied or
    /// timed out
    pub end_of_stream: bool,
}

/// Receiving side of a fan-out query.
///
/// Dropping the stream cancels the request: relay tasks observe the
/// cancellation and close their subscriptions.
pub struct QueryStream {
    rx: mpsc::Receiver<QueryUpdate>,
    cancel_tx: watch::Sender<bool>,
}

impl QueryStream {
    /// Next batch, or `None` after the end-of-stream update was consumed.
    pub async fn next(&mut self) -> Option<QueryUpdate> {
        self.rx.recv().await
    }

    /// Stop delivery and tell relay tasks to close their subscriptions.
    pub fn close(&mut self) {
        let _ = self.cancel_tx.send(true);
        self.rx.close();
    }

    /// Drain the stream to completion and collect every contributed event.
    pub async fn collect(mut self) -> Vec<RelayEvent> {
        let mut events = Vec::new();
        while let Some(update) = self.next().await {
            events.extend(update.events);
            if update.end_of_stream {
                break;
            }
        }
        events
    }
}

/// Fans queries and publishes out to relay sets and folds the partial
/// results back in, recording everything observed into the event store.
pub struct Coordinator {
    registry: Arc<ConnectionRegistry>,
    store: Arc<EventStore>,
    config: CoordinatorConfig,
}

impl Coordinator {
    /// Create a coordinator over the given registry and event store.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<EventStore>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    /// The event store queries record into.
    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Query a set of relays with the same filters.
    ///
    /// Each relay runs in its own task: connect, subscribe, drain stored
    /// events until EOSE, then contribute one batch. The stream ends with an
    /// empty `end_of_stream` update once every relay has replied or its
    /// window expired. An empty relay set yields the end-of-stream update
    /// immediately.
    pub fn query(&self, filters: Vec<Filter>, relays: &[String]) -> QueryStream {
        let (tx, rx) = mpsc::channel(relays.len().max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        if relays.is_empty() {
            let _ = tx.try_send(QueryUpdate {
                events: Vec::new(),
                end_of_stream: true,
            });
            return QueryStream { rx, cancel_tx };
        }

        let remaining = Arc::new(AtomicUsize::new(relays.len()));
        for url in relays {
            tokio::spawn(Self::relay_query_task(
                Arc::clone(&self.registry),
                Arc::clone(&self.store),
                url.clone(),
                filters.clone(),
                self.config.per_relay_timeout,
                tx.clone(),
                Arc::clone(&remaining),
                cancel_rx.clone(),
            ));
        }
        QueryStream { rx, cancel_tx }
    }

    #[allow(clippy::too_many_arguments)]
    async fn relay_query_task(
        registry: Arc<ConnectionRegistry>,
        store: Arc<EventStore>,
        url: String,
        filters: Vec<Filter>,
        window: Duration,
        tx: mpsc::Sender<QueryUpdate>,
        remaining: Arc<AtomicUsize>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let deadline = Instant::now() + window;
        let outcome = timeout_at(
            deadline,
            Self::drain_relay(&registry, &store, &url, &filters, &mut cancel_rx),
        )
        .await;

        match outcome {
            Ok(Ok(events)) => {
                if !events.is_empty() {
                    let _ = tx.send(QueryUpdate {
                        events,
                        end_of_stream: false,
                    })
                    .await;
                }
            }
            Ok(Err(e)) => warn!("query against {} failed: {}", url, e),
            Err(_) => warn!("query against {} timed out after {:?}", url, window),
        }

        // Counted-completion barrier: the last task out emits the terminal
        // update, so end_of_stream is strictly ordered after every batch.
        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = tx.send(QueryUpdate {
                events: Vec::new(),
                end_of_stream: true,
            })
            .await;
        }
    }

    async fn drain_relay(
        registry: &ConnectionRegistry,
        store: &EventStore,
        url: &str,
        filters: &[Filter],
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<Vec<RelayEvent>> {
        let conn = registry.connect(url).await?;
        let origin = conn.url().to_string();
        let (subscription_id, mut updates) = conn.subscribe(filters).await?;

        let mut events = Vec::new();
        loop {
            tokio::select! {
                update = updates.recv() => match update {
                    Some(SubscriptionUpdate::Event(event)) => {
                        let relay_event = RelayEvent {
                            event,
                            origin: origin.clone(),
                        };
                        store.record(&relay_event);
                        events.push(relay_event);
                    }
                    Some(SubscriptionUpdate::EndOfStored) => break,
                    Some(SubscriptionUpdate::Closed(reason)) => {
                        debug!("subscription on {} closed early: {}", origin, reason);
                        break;
                    }
                    None => break,
                },
                changed = cancel_rx.changed() => {
                    // A send of `true` or a dropped QueryStream both cancel.
                    if changed.is_err() || *cancel_rx.borrow() {
                        debug!("query against {} cancelled", origin);
                        events.clear();
                        break;
                    }
                }
            }
        }

        let _ = conn.unsubscribe(&subscription_id).await;
        Ok(events)
    }

    /// Publish an event to a set of relays.
    ///
    /// Per relay: submit, await the OK, then re-fetch the event by id from
    /// that same relay so the confirmation reflects what the relay actually
    /// stored rather than what it acknowledged. The result is the set of
    /// server-confirmed copies; relays that reject, fail or time out are
    /// absorbed.
    pub async fn publish(&self, event: &Event, relays: &[String]) -> Vec<RelayEvent> {
        let tasks = relays.iter().map(|url| {
            let registry = Arc::clone(&self.registry);
            let store = Arc::clone(&self.store);
            let event = event.clone();
            let window = self.config.per_relay_timeout;
            let url = url.clone();
            async move {
                let deadline = Instant::now() + window;
                match timeout_at(
                    deadline,
                    Self::publish_to_relay(&registry, &store, &url, &event, window),
                )
                .await
                {
                    Ok(Ok(confirmed)) => Some(confirmed),
                    Ok(Err(e)) => {
                        warn!("publish to {} failed: {}", url, e);
                        None
                    }
                    Err(_) => {
                        warn!("publish to {} timed out after {:?}", url, window);
                        None
                    }
                }
            }
        });

        futures::future::join_all(tasks)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn publish_to_relay(
        registry: &ConnectionRegistry,
        store: &EventStore,
        url: &str,
        event: &Event,
        window: Duration,
    ) -> Result<RelayEvent> {
        let conn = registry.connect(url).await?;
        let origin = conn.url().to_string();

        let ack = conn.publish(event, window).await?;
        if !ack.accepted {
            return Err(EngineError::Protocol(format!(
                "relay {} rejected event {}: {}",
                origin, event.id, ack.message
            )));
        }

        let stored = Self::fetch_by_id(&conn, &event.id).await?.ok_or_else(|| {
            EngineError::Protocol(format!(
                "relay {} acknowledged event {} but does not serve it",
                origin, event.id
            ))
        })?;
        let relay_event = RelayEvent {
            event: stored,
            origin,
        };
        store.record(&relay_event);
        Ok(relay_event)
    }

    async fn fetch_by_id(conn: &RelayConnection, event_id: &str) -> Result<Option<Event>> {
        let filter = Filter::new().ids(vec![event_id.to_string()]).limit(1);
        let (subscription_id, mut updates) = conn.subscribe(&[filter]).await?;

        let mut found = None;
        while let Some(update) = updates.recv().await {
            match update {
                SubscriptionUpdate::Event(event) if event.id == event_id => {
                    found = Some(event);
                }
                SubscriptionUpdate::Event(_) => {}
                SubscriptionUpdate::EndOfStored | SubscriptionUpdate::Closed(_) => break,
            }
        }
        let _ = conn.unsubscribe(&subscription_id).await;
        Ok(found)
    }

    /// Resolve the current state of a replaceable event across relays.
    ///
    /// Queries the data kind and its `a`-addressed deletions in one request,
    /// waits for end-of-stream, then resolves against the cache. Zero
    /// reachable relays resolve to `None`.
    pub async fn resolve_replaceable(
        &self,
        kind: u16,
        pubkey: &str,
        relays: &[String],
    ) -> Result<Option<Event>> {
        if !is_replaceable_kind(kind) {
            return Err(EngineError::InvalidKindRange {
                kind,
                expected: "replaceable",
            });
        }
        let coordinate = replaceable_coordinate(kind, pubkey);
        let candidates = self
            .query(Self::paired_filters(kind, pubkey, &coordinate), relays)
            .collect()
            .await;
        let events: Vec<Event> = candidates.into_iter().map(|re| re.event).collect();
        self.store.resolve_replaceable(kind, pubkey, &events)
    }

    /// Resolve the current state of a parameterized-replaceable event,
    /// scoped to its `(kind, pubkey, d)` coordinate.
    pub async fn resolve_parameterized(
        &self,
        kind: u16,
        pubkey: &str,
        d_tag: &str,
        relays: &[String],
    ) -> Result<Option<Event>> {
        if !is_param_replaceable_kind(kind) {
            return Err(EngineError::InvalidKindRange {
                kind,
                expected: "parameterized-replaceable",
            });
        }
        let coordinate = param_coordinate(kind, pubkey, d_tag);
        let mut filters = Self::paired_filters(kind, pubkey, &coordinate);
        // Scope the data filter to the entry's d tag; deletions stay
        // coordinate-addressed. The empty discriminator also covers events
        // carrying no d tag at all, which a `#d` relay filter would miss,
        // so those rely on cache-side resolution instead.
        if !d_tag.is_empty() {
            filters[0] = filters[0].clone().tag("d", vec![d_tag.to_string()]);
        }
        let candidates = self.query(filters, relays).collect().await;
        let events: Vec<Event> = candidates.into_iter().map(|re| re.event).collect();
        self.store.resolve_parameterized(kind, pubkey, d_tag, &events)
    }

    fn paired_filters(kind: u16, pubkey: &str, coordinate: &str) -> Vec<Filter> {
        vec![
            Filter::new()
                .authors(vec![pubkey.to_string()])
                .kinds(vec![kind]),
            Filter::new()
                .authors(vec![pubkey.to_string()])
                .kinds(vec![KIND_DELETION])
                .tag("a", vec![coordinate.to_string()]),
        ]
    }
}
