//! the master key protected by svr, plus the keys derived from it

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{mac, random_bytes};
use crate::{Error, Result};

/// length of a master key in bytes
pub const MASTER_KEY_LEN: usize = 32;

/// the secret the whole service exists to protect
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; MASTER_KEY_LEN]);

impl MasterKey {
    pub fn new(bytes: [u8; MASTER_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// generate a fresh random master key
    pub fn generate() -> Self {
        Self(random_bytes())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; MASTER_KEY_LEN] = bytes.try_into().map_err(|_| {
            Error::DecryptionFailed(format!(
                "master key must be {MASTER_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|e| Error::Config(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MASTER_KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// token proving knowledge of the master key during re-registration
    pub fn derive_registration_lock(&self) -> [u8; 32] {
        mac(&self.0, &[b"Registration Lock"])
    }

    /// password that lets a device re-register without an sms code
    pub fn derive_registration_recovery_password(&self) -> String {
        use base64::Engine;
        let raw = mac(&self.0, &[b"Registration Recovery"]);
        base64::engine::general_purpose::STANDARD.encode(raw)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip_and_length_check() {
        let key = MasterKey::generate();
        assert_eq!(MasterKey::from_hex(&key.to_hex()).unwrap(), key);
        assert!(MasterKey::from_slice(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_debug_redacts() {
        let key = MasterKey::new([0xab; 32]);
        assert_eq!(format!("{key:?}"), "MasterKey(..)");
    }

    #[test]
    fn test_derivations_are_distinct_and_stable() {
        let key = MasterKey::new([1u8; 32]);
        let lock = key.derive_registration_lock();
        assert_eq!(lock, MasterKey::new([1u8; 32]).derive_registration_lock());
        assert_ne!(lock, MasterKey::new([2u8; 32]).derive_registration_lock());
        assert_ne!(
            hex::encode(lock),
            key.derive_registration_recovery_password()
        );
    }
}
