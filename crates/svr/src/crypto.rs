//! cryptographic primitives for svr
//!
//! - chacha20poly1305 for authenticated encryption
//! - hmac-sha256 for labelled derivations and synthetic nonces

use chacha20poly1305::{
    aead::{Aead, KeyInit as AeadKeyInit},
    ChaCha20Poly1305, Nonce,
};
use hmac::{digest::KeyInit, Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

use crate::{Error, Result};

/// length of a chacha20poly1305 nonce
pub const NONCE_LEN: usize = 12;

/// length of the poly1305 tag appended to every ciphertext
pub const TAG_LEN: usize = 16;

/// generate random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// encrypt data using chacha20poly1305
pub fn encrypt(key: &[u8; 32], plaintext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
    let cipher: ChaCha20Poly1305 = AeadKeyInit::new_from_slice(key)
        .map_err(|e| Error::EncryptionFailed(e.to_string()))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| Error::EncryptionFailed(e.to_string()))
}

/// decrypt data using chacha20poly1305
pub fn decrypt(key: &[u8; 32], ciphertext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
    let cipher: ChaCha20Poly1305 = AeadKeyInit::new_from_slice(key)
        .map_err(|e| Error::DecryptionFailed(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| Error::DecryptionFailed(e.to_string()))
}

/// compute hmac-sha256 tag
pub fn mac(key: &[u8], data: &[&[u8]]) -> [u8; 32] {
    let mut h: HmacSha256 = KeyInit::new_from_slice(key).expect("hmac accepts any key length");
    for d in data {
        Mac::update(&mut h, d);
    }
    h.finalize().into_bytes().into()
}

/// deterministic encryption: `nonce || chacha20poly1305(key, nonce, plaintext)`
///
/// the nonce is a mac over the plaintext, so the same key and plaintext
/// always produce the same blob. backup and expose rely on this to send
/// byte-identical data from two independent attempts.
pub fn seal_deterministic(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let tag = mac(key, &[b"svr:synthetic_nonce:v1", plaintext]);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&tag[..NONCE_LEN]);

    let mut sealed = nonce.to_vec();
    sealed.extend(encrypt(key, plaintext, &nonce)?);
    Ok(sealed)
}

/// reverse of [`seal_deterministic`], also checks the synthetic nonce
pub fn open_deterministic(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(Error::DecryptionFailed("sealed data too short".into()));
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&sealed[..NONCE_LEN]);
    let plaintext = decrypt(key, &sealed[NONCE_LEN..], &nonce)?;

    let tag = mac(key, &[b"svr:synthetic_nonce:v1", &plaintext]);
    if tag[..NONCE_LEN] != nonce {
        return Err(Error::DecryptionFailed("synthetic nonce mismatch".into()));
    }
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = random_bytes::<32>();
        let nonce = random_bytes::<12>();
        let plaintext = b"hello world";

        let ciphertext = encrypt(&key, plaintext, &nonce).unwrap();
        let decrypted = decrypt(&key, &ciphertext, &nonce).unwrap();

        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn test_seal_is_deterministic() {
        let key = [7u8; 32];
        let a = seal_deterministic(&key, b"master key bytes").unwrap();
        let b = seal_deterministic(&key, b"master key bytes").unwrap();
        assert_eq!(a, b);

        let c = seal_deterministic(&[8u8; 32], b"master key bytes").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_open_rejects_wrong_key_and_tampering() {
        let key = [7u8; 32];
        let mut sealed = seal_deterministic(&key, b"payload").unwrap();

        assert_eq!(open_deterministic(&key, &sealed).unwrap(), b"payload");
        assert!(matches!(
            open_deterministic(&[1u8; 32], &sealed),
            Err(Error::DecryptionFailed(_))
        ));

        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(open_deterministic(&key, &sealed).is_err());
        assert!(open_deterministic(&key, &sealed[..10]).is_err());
    }
}
