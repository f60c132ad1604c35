//! Integration tests for the relay engine.
//!
//! Every test runs against in-process mock relays, one port per relay, so
//! the suite exercises real WebSocket framing and the NIP-11 HTTP side
//! channel without touching the network.

mod engine;
mod store;
mod supervisor;
