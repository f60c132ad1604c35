//! Encrypted key/value store over relay-backed application data.
//!
//! Entries are NIP-78 application-data events (kind 30078) whose `d` tag is
//! the entry name and whose content is the JSON value run through the
//! signer's encryption. Reads resolve the entry across the relay set with
//! the usual replaceable semantics, so the store inherits last-writer-wins
//! and deletion for free.

use crate::coordinator::Coordinator;
use crate::error::{EngineError, Result};
use crate::event::{param_coordinate, unix_now, Event, EventTemplate, RelayEvent, KIND_APP_DATA, KIND_DELETION};
use crate::signer::Signer;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// A decrypted store entry with its provenance.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    /// Decrypted JSON value
    pub value: serde_json::Value,
    /// The winning event the value came from
    pub event: Event,
    /// Relays that independently held the winning event
    pub found_on: Vec<String>,
}

/// Named, encrypted JSON values stored on relays.
pub struct EncryptedStore {
    coordinator: Arc<Coordinator>,
    signer: Arc<dyn Signer>,
}

impl EncryptedStore {
    /// Create a store writing and reading as the signer's identity.
    pub fn new(coordinator: Arc<Coordinator>, signer: Arc<dyn Signer>) -> Self {
        Self {
            coordinator,
            signer,
        }
    }

    /// Write an entry to a set of relays.
    ///
    /// Returns the server-confirmed copies; an empty relay set (or none
    /// accepting) returns an empty set without error.
    pub async fn put<T: Serialize>(
        &self,
        name: &str,
        value: &T,
        relays: &[String],
    ) -> Result<Vec<RelayEvent>> {
        let plaintext = serde_json::to_string(value)?;
        let ciphertext = self.signer.encrypt(&plaintext).await?;
        let template = EventTemplate {
            created_at: unix_now(),
            kind: KIND_APP_DATA,
            tags: vec![vec!["d".to_string(), name.to_string()]],
            content: ciphertext,
        };
        let event = self.signer.sign(template).await?;
        debug!("storing entry {} as event {}", name, event.id);
        Ok(self.coordinator.publish(&event, relays).await)
    }

    /// Read an entry from a set of relays.
    ///
    /// Resolves the entry's coordinate across the relays and decrypts the
    /// winner. `None` when no relay holds a live version.
    pub async fn get(&self, name: &str, relays: &[String]) -> Result<Option<StoredEntry>> {
        let pubkey = self.signer.pubkey();
        let winner = self
            .coordinator
            .resolve_parameterized(KIND_APP_DATA, &pubkey, name, relays)
            .await?;
        let event = match winner {
            Some(event) => event,
            None => return Ok(None),
        };

        let plaintext = self
            .signer
            .decrypt(&event.content)
            .await
            .map_err(|e| EngineError::Decryption(format!("entry {}: {}", name, e)))?;
        let value: serde_json::Value = serde_json::from_str(&plaintext).map_err(|e| {
            EngineError::MalformedEvent(format!("entry {} is not JSON: {}", name, e))
        })?;

        let found_on = self.coordinator.store().sources_for(&event.id);
        Ok(Some(StoredEntry {
            value,
            event,
            found_on,
        }))
    }

    /// Delete an entry by publishing a deletion addressed at its coordinate.
    ///
    /// A subsequent `get` on the same relays resolves to `None`. Returns the
    /// relays that confirmed the deletion event.
    pub async fn delete(&self, name: &str, relays: &[String]) -> Result<Vec<RelayEvent>> {
        let pubkey = self.signer.pubkey();
        let coordinate = param_coordinate(KIND_APP_DATA, &pubkey, name);

        let mut tags = vec![vec!["a".to_string(), coordinate]];
        let mut created_at = unix_now();
        if let Some(current) = self
            .coordinator
            .resolve_parameterized(KIND_APP_DATA, &pubkey, name, relays)
            .await?
        {
            tags.push(vec!["e".to_string(), current.id]);
            // The deletion only covers strictly older events; clock skew on
            // a fast write/delete must not leave the entry alive.
            created_at = created_at.max(current.created_at + 1);
        }

        let template = EventTemplate {
            created_at,
            kind: KIND_DELETION,
            tags,
            content: String::new(),
        };
        let event = self.signer.sign(template).await?;
        debug!("deleting entry {} with event {}", name, event.id);
        Ok(self.coordinator.publish(&event, relays).await)
    }
}
