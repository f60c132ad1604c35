//! Event cache and resolution engine.
//!
//! Every event observed on any relay is recorded here, keyed by id with the
//! set of relays it was seen on. Deletion events (kind 5) go to their own
//! store with their targets parsed up front. Resolution picks the
//! authoritative member of a replaceable or parameterized-replaceable family
//! under last-writer-wins, excluding anything covered by a live deletion.
//!
//! The stores are append-only; repeated inserts of the same
//! `(event.id, origin)` pair are idempotent no-ops. Inserts from concurrent
//! relay tasks are serialized per store by an `RwLock` write guard, and
//! resolution reads see a consistent snapshot under the read guard.

use crate::error::{EngineError, Result};
use crate::event::{
    classify_kind, is_param_replaceable_kind, is_replaceable_kind, Event, KindClass, RelayEvent,
    KIND_DELETION,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;
use tracing::debug;

struct StoredEvent {
    event: Event,
    seen_on: BTreeSet<String>,
}

struct StoredDeletion {
    event: Event,
    target_ids: HashSet<String>,
    target_coordinates: HashSet<String>,
    seen_on: BTreeSet<String>,
}

/// Append-only store of events and deletions with deletion-aware
/// replaceable-event resolution. Sole mutator of the event/deletion stores.
#[derive(Default)]
pub struct EventStore {
    events: RwLock<HashMap<String, StoredEvent>>,
    deletions: RwLock<HashMap<String, StoredDeletion>>,
}

impl EventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event observed on a relay.
    ///
    /// Returns `true` if this exact `(event.id, origin)` pair was new,
    /// `false` if it had been recorded before.
    pub fn record(&self, relay_event: &RelayEvent) -> bool {
        let event = &relay_event.event;
        if event.kind == KIND_DELETION {
            return self.record_deletion(relay_event);
        }

        let mut events = match self.events.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match events.get_mut(&event.id) {
            Some(stored) => stored.seen_on.insert(relay_event.origin.clone()),
            None => {
                events.insert(
                    event.id.clone(),
                    StoredEvent {
                        event: event.clone(),
                        seen_on: BTreeSet::from([relay_event.origin.clone()]),
                    },
                );
                true
            }
        }
    }

    fn record_deletion(&self, relay_event: &RelayEvent) -> bool {
        let event = &relay_event.event;
        let mut deletions = match self.deletions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match deletions.get_mut(&event.id) {
            Some(stored) => stored.seen_on.insert(relay_event.origin.clone()),
            None => {
                let mut target_ids = HashSet::new();
                let mut target_coordinates = HashSet::new();
                for tag in &event.tags {
                    if tag.len() < 2 {
                        continue;
                    }
                    match tag[0].as_str() {
                        "e" => {
                            target_ids.insert(tag[1].clone());
                        }
                        "a" => {
                            target_coordinates.insert(tag[1].clone());
                        }
                        _ => {}
                    }
                }
                debug!(
                    "recorded deletion {} ({} ids, {} coordinates)",
                    event.id,
                    target_ids.len(),
                    target_coordinates.len()
                );
                deletions.insert(
                    event.id.clone(),
                    StoredDeletion {
                        event: event.clone(),
                        target_ids,
                        target_coordinates,
                        seen_on: BTreeSet::from([relay_event.origin.clone()]),
                    },
                );
                true
            }
        }
    }

    /// Check whether an event is covered by a live deletion.
    ///
    /// Only replaceable-class events can be deleted; regular and deletion
    /// events always return `false`. A deletion covers the event when it is
    /// strictly newer, comes from the same author, and references either the
    /// event's id or its identity-class coordinate.
    pub fn is_deleted(&self, event: &Event) -> bool {
        let coordinate = match classify_kind(event.kind) {
            KindClass::Replaceable | KindClass::ParamReplaceable => match event.coordinate() {
                Some(c) => c,
                None => return false,
            },
            _ => return false,
        };

        let deletions = match self.deletions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        deletions.values().any(|deletion| {
            deletion.event.created_at > event.created_at
                && deletion.event.pubkey == event.pubkey
                && (deletion.target_ids.contains(&event.id)
                    || deletion.target_coordinates.contains(&coordinate))
        })
    }

    /// Resolve the authoritative member of a replaceable family.
    ///
    /// Among candidates matching `(kind, pubkey)` and not deleted, the one
    /// with the greatest `created_at` wins; ties break toward the
    /// lexicographically greatest id.
    pub fn resolve_replaceable(
        &self,
        kind: u16,
        pubkey: &str,
        candidates: &[Event],
    ) -> Result<Option<Event>> {
        if !is_replaceable_kind(kind) {
            return Err(EngineError::InvalidKindRange {
                kind,
                expected: "replaceable",
            });
        }
        Ok(self.pick_winner(candidates, |e| e.kind == kind && e.pubkey == pubkey))
    }

    /// Resolve the authoritative member of a parameterized-replaceable
    /// family, scoped to the `(kind, pubkey, d_tag)` coordinate.
    pub fn resolve_parameterized(
        &self,
        kind: u16,
        pubkey: &str,
        d_tag: &str,
        candidates: &[Event],
    ) -> Result<Option<Event>> {
        if !is_param_replaceable_kind(kind) {
            return Err(EngineError::InvalidKindRange {
                kind,
                expected: "parameterized-replaceable",
            });
        }
        Ok(self.pick_winner(candidates, |e| {
            e.kind == kind && e.pubkey == pubkey && e.d_tag() == d_tag
        }))
    }

    fn pick_winner(&self, candidates: &[Event], matches: impl Fn(&Event) -> bool) -> Option<Event> {
        candidates
            .iter()
            .filter(|e| matches(e) && !self.is_deleted(e))
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned()
    }

    /// Relays on which an event id was independently observed.
    pub fn sources_for(&self, event_id: &str) -> Vec<String> {
        let events = match self.events.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        events
            .get(event_id)
            .map(|stored| stored.seen_on.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Get a cached event by id.
    pub fn get(&self, event_id: &str) -> Option<Event> {
        let events = match self.events.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.get(event_id).map(|stored| stored.event.clone())
    }

    /// Number of distinct event ids stored (deletions not included).
    pub fn len(&self) -> usize {
        match self.events.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Check if the event store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct deletion events stored.
    pub fn deletion_count(&self) -> usize {
        match self.deletions.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
