//! pin normalization and hashing
//!
//! the raw pin never leaves this module. callers get an access key (sent to
//! the enclave as an authorization token) and an encryption key (used
//! locally to seal the master key). both come out of one argon2id run.

use argon2::{Argon2, Params, Version};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::EnclaveIdentity;
use crate::crypto::{open_deterministic, seal_deterministic};
use crate::master_key::MasterKey;
use crate::{Error, Result};

/// argon2id parameters, same costs the service's reference clients use
const ARGON2_M_COST: u32 = 16 * 1024; // 16 MiB
const ARGON2_T_COST: u32 = 32;
const ARGON2_P_COST: u32 = 1;

/// output length for kdf
const KDF_OUTPUT_LEN: usize = 64;

/// a pin after trimming and compatibility/case folding
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct NormalizedPin(String);

impl NormalizedPin {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_numeric(&self) -> bool {
        !self.0.is_empty() && self.0.bytes().all(|b| b.is_ascii_digit())
    }
}

/// normalize a user-entered pin before any cryptographic use
///
/// nfkd first, so composed and decomposed accents, full-width forms and
/// styled digits (superscript, math bold) all hash the same. numeric pins
/// end up as ascii digits; anything else compares case-insensitively.
pub fn normalize_pin(pin: &str) -> NormalizedPin {
    let decomposed: Zeroizing<String> = Zeroizing::new(pin.nfkd().collect());
    let trimmed = decomposed.trim();

    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return NormalizedPin(trimmed.to_owned());
    }
    let lowered = Zeroizing::new(trimmed.to_lowercase());
    NormalizedPin(lowered.nfkd().collect())
}

/// enclave authorization token derived from the pin
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AccessKey([u8; 32]);

impl AccessKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for AccessKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessKey(..)")
    }
}

/// result of hashing one pin for one enclave and account
pub struct PinHash {
    access_key: AccessKey,
    encryption_key: Zeroizing<[u8; 32]>,
}

impl PinHash {
    pub fn from_parts(access_key: [u8; 32], encryption_key: [u8; 32]) -> Self {
        Self {
            access_key: AccessKey(access_key),
            encryption_key: Zeroizing::new(encryption_key),
        }
    }

    pub fn access_key(&self) -> &AccessKey {
        &self.access_key
    }

    /// seal a master key into the blob stored by the enclave
    pub fn encrypt_master_key(&self, master_key: &MasterKey) -> Result<Vec<u8>> {
        seal_deterministic(&self.encryption_key, master_key.as_bytes())
    }

    /// recover the master key from a stored blob
    pub fn decrypt_master_key(&self, data: &[u8]) -> Result<MasterKey> {
        let plaintext = Zeroizing::new(open_deterministic(&self.encryption_key, data)?);
        MasterKey::from_slice(&plaintext)
    }
}

/// derives enclave-scoped key material from a normalized pin
pub trait PinHasher: Send + Sync {
    fn hash(
        &self,
        pin: &NormalizedPin,
        enclave: &EnclaveIdentity,
        username: &str,
    ) -> Result<PinHash>;
}

/// argon2id pin hasher salted with `sha256(username || mr_enclave)`
#[derive(Clone, Debug)]
pub struct Argon2PinHasher {
    m_cost: u32,
    t_cost: u32,
}

impl Argon2PinHasher {
    pub fn new() -> Self {
        Self {
            m_cost: ARGON2_M_COST,
            t_cost: ARGON2_T_COST,
        }
    }

    /// custom memory (KiB) and time cost. only lower these for tests.
    pub fn with_cost(m_cost: u32, t_cost: u32) -> Self {
        Self { m_cost, t_cost }
    }

    fn salt(enclave: &EnclaveIdentity, username: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(username.as_bytes());
        hasher.update(enclave.mr_enclave());
        hasher.finalize().into()
    }
}

impl Default for Argon2PinHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl PinHasher for Argon2PinHasher {
    fn hash(
        &self,
        pin: &NormalizedPin,
        enclave: &EnclaveIdentity,
        username: &str,
    ) -> Result<PinHash> {
        let params = Params::new(self.m_cost, self.t_cost, ARGON2_P_COST, Some(KDF_OUTPUT_LEN))
            .map_err(|e| Error::KdfFailed(e.to_string()))?;
        let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params);

        let mut output = Zeroizing::new([0u8; KDF_OUTPUT_LEN]);
        argon2
            .hash_password_into(pin.as_bytes(), &Self::salt(enclave, username), &mut *output)
            .map_err(|e| Error::KdfFailed(e.to_string()))?;

        let mut access_key = [0u8; 32];
        let mut encryption_key = [0u8; 32];
        access_key.copy_from_slice(&output[..32]);
        encryption_key.copy_from_slice(&output[32..]);
        Ok(PinHash::from_parts(access_key, encryption_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceUrl;

    fn enclave(byte: u8) -> EnclaveIdentity {
        EnclaveIdentity::new([byte; 32], vec![ServiceUrl::new("wss://localhost")]).unwrap()
    }

    #[test]
    fn test_normalize_numeric() {
        assert_eq!(normalize_pin(" 1234 ").as_bytes(), b"1234");
        assert_eq!(normalize_pin("\u{FF11}\u{FF12}\u{FF13}\u{FF14}").as_bytes(), b"1234");
        assert_eq!(normalize_pin("\u{1D7CF}\u{1D7D0}\u{1D7D1}\u{1D7D2}").as_bytes(), b"1234");
        assert_eq!(normalize_pin("\u{B9}\u{B2}\u{B3}4").as_bytes(), b"1234");
        assert!(normalize_pin("\u{B9}\u{B2}\u{B3}4").is_numeric());
        assert!(normalize_pin("0042").is_numeric());
    }

    #[test]
    fn test_normalize_equivalent_accents() {
        let composed = normalize_pin("caf\u{e9}1");
        let decomposed = normalize_pin("cafe\u{301}1");
        assert_eq!(composed.as_bytes(), decomposed.as_bytes());
        assert_eq!(normalize_pin("CAF\u{C9}1").as_bytes(), composed.as_bytes());
        assert!(!composed.is_numeric());
    }

    #[test]
    fn test_normalize_alphanumeric() {
        assert_eq!(normalize_pin("  Hunter2\t").as_bytes(), b"hunter2");
        assert_eq!(normalize_pin("\u{FF21}bc1").as_bytes(), b"abc1");
        assert_eq!(normalize_pin("\u{3000}abc1\u{3000}").as_bytes(), b"abc1");
        assert!(!normalize_pin("abc1").is_numeric());
    }

    #[test]
    fn test_hash_deterministic_and_scoped() {
        let hasher = Argon2PinHasher::with_cost(64, 1);
        let pin = normalize_pin("1234");

        let a = hasher.hash(&pin, &enclave(1), "alice").unwrap();
        let b = hasher.hash(&pin, &enclave(1), "alice").unwrap();
        assert_eq!(a.access_key(), b.access_key());

        let other_enclave = hasher.hash(&pin, &enclave(2), "alice").unwrap();
        assert_ne!(a.access_key(), other_enclave.access_key());

        let other_user = hasher.hash(&pin, &enclave(1), "bob").unwrap();
        assert_ne!(a.access_key(), other_user.access_key());

        let other_pin = hasher.hash(&normalize_pin("1235"), &enclave(1), "alice").unwrap();
        assert_ne!(a.access_key(), other_pin.access_key());
    }

    #[test]
    fn test_master_key_sealing() {
        let hasher = Argon2PinHasher::with_cost(64, 1);
        let master_key = MasterKey::generate();

        let hash = hasher.hash(&normalize_pin("1234"), &enclave(1), "alice").unwrap();
        let blob = hash.encrypt_master_key(&master_key).unwrap();
        assert_eq!(blob, hash.encrypt_master_key(&master_key).unwrap());
        assert_eq!(hash.decrypt_master_key(&blob).unwrap(), master_key);

        let wrong = hasher.hash(&normalize_pin("9999"), &enclave(1), "alice").unwrap();
        assert!(matches!(
            wrong.decrypt_master_key(&blob),
            Err(Error::DecryptionFailed(_))
        ));
    }
}
