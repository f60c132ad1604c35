//! Injected signing and crypto capability.
//!
//! The engine never generates or stores private keys. Everything that needs
//! a signature or payload encryption goes through this trait, supplied by
//! the caller (hardware signer, NIP-07 bridge, in-memory key, ...).

use crate::error::Result;
use crate::event::{Event, EventTemplate};
use async_trait::async_trait;

/// Signing and payload-crypto capability.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex-encoded public key of the identity this capability signs for.
    fn pubkey(&self) -> String;

    /// Fill in pubkey, id and signature for a template.
    async fn sign(&self, template: EventTemplate) -> Result<Event>;

    /// Encrypt an application payload.
    async fn encrypt(&self, plaintext: &str) -> Result<String>;

    /// Decrypt an application payload.
    async fn decrypt(&self, ciphertext: &str) -> Result<String>;
}
