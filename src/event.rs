//! Core Nostr event structures and kind classification.
//!
//! Events are content-addressed and immutable. Their numeric `kind` decides
//! the replacement semantics applied during resolution:
//! - regular kinds keep every id,
//! - replaceable kinds (0, 3, 10000-19999) keep the newest per (kind, pubkey),
//! - parameterized-replaceable kinds (30000-39999) keep the newest per
//!   (kind, pubkey, d-tag),
//! - kind 5 deletion events retroactively remove events they reference.

use serde::{Deserialize, Serialize};

/// Kind for profile metadata (replaceable)
pub const KIND_METADATA: u16 = 0;
/// Kind for contact lists (replaceable)
pub const KIND_CONTACTS: u16 = 3;
/// Kind for deletion requests (NIP-09)
pub const KIND_DELETION: u16 = 5;
/// Kind for relay authentication events (NIP-42)
pub const KIND_RELAY_AUTH: u16 = 22242;
/// Kind for arbitrary application data (NIP-78)
pub const KIND_APP_DATA: u16 = 30078;

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

/// A template for creating events, before the injected signer fills in
/// pubkey, id and signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

/// An event observed on a specific relay.
///
/// The same `event.id` seen on different relays produces distinct
/// `RelayEvent`s; they are siblings kept for provenance, not duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEvent {
    /// The event itself
    pub event: Event,
    /// Normalized URL of the relay the event was observed on
    pub origin: String,
}

/// Replacement semantics of an event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    /// Every id independently retained
    Regular,
    /// Newest per (kind, pubkey) wins
    Replaceable,
    /// Newest per (kind, pubkey, d-tag) wins
    ParamReplaceable,
    /// Kind 5; never itself replaced or deleted
    Deletion,
}

/// Check if a kind is replaceable (0, 3, or 10000-19999).
pub fn is_replaceable_kind(kind: u16) -> bool {
    kind == KIND_METADATA || kind == KIND_CONTACTS || (10000..=19999).contains(&kind)
}

/// Check if a kind is parameterized replaceable (30000-39999).
pub fn is_param_replaceable_kind(kind: u16) -> bool {
    (30000..=39999).contains(&kind)
}

/// Classify a kind by its replacement semantics.
pub fn classify_kind(kind: u16) -> KindClass {
    if kind == KIND_DELETION {
        KindClass::Deletion
    } else if is_replaceable_kind(kind) {
        KindClass::Replaceable
    } else if is_param_replaceable_kind(kind) {
        KindClass::ParamReplaceable
    } else {
        KindClass::Regular
    }
}

impl Event {
    /// Value of the first `"d"` tag, defaulting to the empty string.
    ///
    /// A parameterized-replaceable event without a `d` tag is treated as
    /// having the empty-string discriminator rather than being rejected.
    pub fn d_tag(&self) -> &str {
        self.tags
            .iter()
            .find(|t| t.len() >= 2 && t[0] == "d")
            .map(|t| t[1].as_str())
            .unwrap_or("")
    }

    /// First value of the named tag, if present.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.len() >= 2 && t[0] == name)
            .map(|t| t[1].as_str())
    }

    /// Identity-class coordinate of this event, if it has one.
    ///
    /// `kind:pubkey` for replaceable kinds, `kind:pubkey:d-tag` for
    /// parameterized-replaceable kinds, `None` otherwise.
    pub fn coordinate(&self) -> Option<String> {
        match classify_kind(self.kind) {
            KindClass::Replaceable => Some(format!("{}:{}", self.kind, self.pubkey)),
            KindClass::ParamReplaceable => {
                Some(format!("{}:{}:{}", self.kind, self.pubkey, self.d_tag()))
            }
            _ => None,
        }
    }
}

/// Build the `kind:pubkey:d-tag` address of a parameterized-replaceable
/// identity coordinate.
pub fn param_coordinate(kind: u16, pubkey: &str, d_tag: &str) -> String {
    format!("{}:{}:{}", kind, pubkey, d_tag)
}

/// Build the `kind:pubkey` address of a replaceable identity coordinate.
pub fn replaceable_coordinate(kind: u16, pubkey: &str) -> String {
    format!("{}:{}", kind, pubkey)
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
