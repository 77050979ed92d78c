//! attested channel capability
//!
//! an attested channel is created from the enclave's first message (its
//! attestation challenge), answers with one handshake message, completes on
//! the enclave's reply, and then encrypts exactly one request and decrypts
//! exactly one response. it is owned by a single transport session and
//! dropped with it.
//!
//! implementations:
//! - software: measurement comparison plus x25519, dev/testing only

#[cfg(feature = "software")]
pub mod software;

use crate::config::EnclaveIdentity;
use crate::Result;

/// client end of an attested, encrypted channel
pub trait AttestedChannel: Send {
    /// consume the enclave's handshake reply; verifies attestation
    fn complete_handshake(&mut self, message: &[u8]) -> Result<()>;

    /// only valid after `complete_handshake`
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// only valid after `complete_handshake`
    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// a freshly started handshake
pub struct Handshake {
    pub channel: Box<dyn AttestedChannel>,
    /// message to send back to the enclave
    pub request: Vec<u8>,
}

/// creates channels for a given enclave identity
pub trait AttestedChannelFactory: Send + Sync {
    /// parse the enclave's attestation challenge and start a handshake
    fn begin(&self, enclave: &EnclaveIdentity, challenge: &[u8]) -> Result<Handshake>;
}
