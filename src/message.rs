//! NIP-01 relay protocol messages.
//!
//! Client to relay: EVENT, REQ, CLOSE, AUTH.
//! Relay to client: EVENT, OK, EOSE, CLOSED, NOTICE, AUTH.
//!
//! Wire framing is JSON arrays over the WebSocket transport; this module
//! only deals with the array payloads.

use crate::error::{EngineError, Result};
use crate::event::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Messages sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// Publish an event: `["EVENT", <event>]`
    Event(Event),
    /// Open a subscription: `["REQ", <sub_id>, <filter>...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// Close a subscription: `["CLOSE", <sub_id>]`
    Close { subscription_id: String },
    /// Answer an auth challenge: `["AUTH", <event>]`
    Auth(Event),
}

impl ClientMessage {
    /// Serialize to the JSON array the relay expects.
    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            ClientMessage::Event(event) => serde_json::json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![Value::from("REQ"), Value::from(subscription_id.as_str())];
                for filter in filters {
                    arr.push(serde_json::to_value(filter)?);
                }
                Value::Array(arr)
            }
            ClientMessage::Close { subscription_id } => {
                serde_json::json!(["CLOSE", subscription_id])
            }
            ClientMessage::Auth(event) => serde_json::json!(["AUTH", event]),
        };
        Ok(value.to_string())
    }
}

/// Messages sent from relay to client.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    /// Event matching a subscription: `["EVENT", <sub_id>, <event>]`
    Event {
        subscription_id: String,
        event: Event,
    },
    /// Command result: `["OK", <event_id>, <accepted>, <message>]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// End of stored events: `["EOSE", <sub_id>]`
    Eose { subscription_id: String },
    /// Subscription closed by the relay: `["CLOSED", <sub_id>, <message>]`
    Closed {
        subscription_id: String,
        message: String,
    },
    /// Human-readable notice: `["NOTICE", <message>]`
    Notice { message: String },
    /// Auth challenge (NIP-42): `["AUTH", <challenge>]`
    Auth { challenge: String },
}

fn str_at(arr: &[Value], idx: usize, what: &str) -> Result<String> {
    arr.get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EngineError::Protocol(format!("{} must be a string", what)))
}

impl RelayMessage {
    /// Parse a JSON frame from the relay.
    ///
    /// Unknown message types are tolerated and returned as `None` so that
    /// relays speaking newer protocol extensions do not break the reader.
    pub fn from_json(json: &str) -> Result<Option<Self>> {
        let arr: Vec<Value> = serde_json::from_str(json)
            .map_err(|e| EngineError::Protocol(format!("invalid frame: {}", e)))?;

        let kind = match arr.first().and_then(Value::as_str) {
            Some(k) => k,
            None => return Err(EngineError::Protocol("frame missing type tag".to_string())),
        };

        let msg = match kind {
            "EVENT" => {
                let subscription_id = str_at(&arr, 1, "EVENT subscription id")?;
                let raw = arr
                    .get(2)
                    .ok_or_else(|| EngineError::Protocol("EVENT missing payload".to_string()))?;
                let event: Event = serde_json::from_value(raw.clone())?;
                RelayMessage::Event {
                    subscription_id,
                    event,
                }
            }
            "OK" => {
                let event_id = str_at(&arr, 1, "OK event id")?;
                let accepted = arr.get(2).and_then(Value::as_bool).ok_or_else(|| {
                    EngineError::Protocol("OK accepted flag must be a boolean".to_string())
                })?;
                let message = arr
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                RelayMessage::Ok {
                    event_id,
                    accepted,
                    message,
                }
            }
            "EOSE" => RelayMessage::Eose {
                subscription_id: str_at(&arr, 1, "EOSE subscription id")?,
            },
            "CLOSED" => RelayMessage::Closed {
                subscription_id: str_at(&arr, 1, "CLOSED subscription id")?,
                message: arr
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            "NOTICE" => RelayMessage::Notice {
                message: str_at(&arr, 1, "NOTICE message")?,
            },
            "AUTH" => RelayMessage::Auth {
                challenge: str_at(&arr, 1, "AUTH challenge")?,
            },
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}

/// Filter for subscription requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    /// Event IDs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Authors (pubkeys)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Events since timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Events until timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Generic tag queries; keys carry the `#` prefix (e.g. `#e`, `#a`)
    #[serde(flatten, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    /// Create a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by event IDs.
    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Filter by authors.
    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    /// Filter by kinds.
    pub fn kinds(mut self, kinds: Vec<u16>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// Filter by events since timestamp.
    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    /// Filter by events until timestamp.
    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    /// Limit number of results.
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag filter. The key is the bare tag letter (e.g. "e", "a", "d").
    pub fn tag(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{}", key.into()), values);
        self
    }
}
