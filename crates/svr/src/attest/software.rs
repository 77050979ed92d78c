//! software attestation - x25519 channel bound to a claimed measurement
//!
//! the enclave's "evidence" is a hash binding its static key to its
//! mr_enclave. nothing proves the measurement came from real hardware, so
//! this only protects against passive observers and misconfigured
//! endpoints. useful for development and testing, NOT for production.
//!
//! handshake:
//! ```text
//! enclave -> client   Challenge { mr_enclave, static_public, evidence }
//! client  -> enclave  ClientHello { ephemeral_public }
//! enclave -> client   ServerFinish { ephemeral_public, confirmation }
//! ```
//! keys come from hkdf over `dh(e_c, s) || dh(e_c, e_s)` salted with the
//! transcript hash.

use curve25519_dalek::montgomery::MontgomeryPoint;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::attest::{AttestedChannel, AttestedChannelFactory, Handshake};
use crate::config::EnclaveIdentity;
use crate::crypto::{decrypt, encrypt, mac, random_bytes, NONCE_LEN};
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeFrame {
    Challenge {
        mr_enclave: [u8; 32],
        static_public: [u8; 32],
        evidence: [u8; 32],
    },
    ClientHello {
        ephemeral_public: [u8; 32],
    },
    ServerFinish {
        ephemeral_public: [u8; 32],
        confirmation: [u8; 32],
    },
}

impl HandshakeFrame {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Handshake(e.to_string()))
    }
}

fn evidence(mr_enclave: &[u8; 32], static_public: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"svr:software_evidence:v1");
    hasher.update(mr_enclave);
    hasher.update(static_public);
    hasher.finalize().into()
}

fn diffie_hellman(secret: &[u8; 32], public: &[u8; 32]) -> Result<[u8; 32]> {
    let shared = MontgomeryPoint(*public).mul_clamped(*secret).to_bytes();
    // low-order peer keys collapse to zero
    if shared == [0u8; 32] {
        return Err(Error::Handshake("degenerate shared secret".into()));
    }
    Ok(shared)
}

fn public_key(secret: &[u8; 32]) -> [u8; 32] {
    MontgomeryPoint::mul_base_clamped(*secret).to_bytes()
}

/// running transcript over raw handshake frames
struct Transcript(Sha256);

impl Transcript {
    fn new() -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"svr:software_transcript:v1");
        Self(hasher)
    }

    fn absorb(&mut self, frame: &[u8]) {
        self.0.update((frame.len() as u64).to_le_bytes());
        self.0.update(frame);
    }

    fn hash(&self) -> [u8; 32] {
        self.0.clone().finalize().into()
    }
}

/// directional keys plus the handshake confirmation key
#[derive(Zeroize, ZeroizeOnDrop)]
struct SessionKeys {
    client_to_enclave: [u8; 32],
    enclave_to_client: [u8; 32],
    confirmation: [u8; 32],
}

impl SessionKeys {
    fn derive(dh_static: &[u8; 32], dh_ephemeral: &[u8; 32], transcript: &[u8; 32]) -> Result<Self> {
        let mut ikm = Zeroizing::new([0u8; 64]);
        ikm[..32].copy_from_slice(dh_static);
        ikm[32..].copy_from_slice(dh_ephemeral);

        let hk = Hkdf::<Sha256>::new(Some(&transcript[..]), &ikm[..]);
        let mut okm = Zeroizing::new([0u8; 96]);
        hk.expand(b"svr:software_channel:v1", &mut *okm)
            .map_err(|e| Error::Handshake(e.to_string()))?;

        let mut keys = Self {
            client_to_enclave: [0u8; 32],
            enclave_to_client: [0u8; 32],
            confirmation: [0u8; 32],
        };
        keys.client_to_enclave.copy_from_slice(&okm[..32]);
        keys.enclave_to_client.copy_from_slice(&okm[32..64]);
        keys.confirmation.copy_from_slice(&okm[64..]);
        Ok(keys)
    }

    fn confirmation_tag(&self, transcript: &[u8; 32]) -> [u8; 32] {
        mac(&self.confirmation, &[b"svr:server_finished:v1", transcript])
    }
}

fn counter_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// established symmetric state, one counter per direction
struct Established {
    keys: SessionKeys,
    send_counter: u64,
    recv_counter: u64,
}

impl Established {
    fn new(keys: SessionKeys) -> Self {
        Self {
            keys,
            send_counter: 0,
            recv_counter: 0,
        }
    }

    fn seal(&mut self, key_for: Direction, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = counter_nonce(self.send_counter);
        self.send_counter += 1;
        encrypt(self.key(key_for), plaintext, &nonce)
    }

    fn open(&mut self, key_for: Direction, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = counter_nonce(self.recv_counter);
        self.recv_counter += 1;
        decrypt(self.key(key_for), ciphertext, &nonce)
    }

    fn key(&self, direction: Direction) -> &[u8; 32] {
        match direction {
            Direction::ClientToEnclave => &self.keys.client_to_enclave,
            Direction::EnclaveToClient => &self.keys.enclave_to_client,
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    ClientToEnclave,
    EnclaveToClient,
}

/// client channel state machine
enum ClientState {
    AwaitingFinish {
        ephemeral_secret: Zeroizing<[u8; 32]>,
        dh_static: Zeroizing<[u8; 32]>,
        transcript: Transcript,
    },
    Established(Established),
    Spent,
}

/// client end of a software-attested channel
pub struct SoftwareChannel {
    state: ClientState,
}

impl AttestedChannel for SoftwareChannel {
    fn complete_handshake(&mut self, message: &[u8]) -> Result<()> {
        let ClientState::AwaitingFinish {
            ephemeral_secret,
            dh_static,
            mut transcript,
        } = std::mem::replace(&mut self.state, ClientState::Spent)
        else {
            return Err(Error::Handshake("handshake already completed".into()));
        };

        let HandshakeFrame::ServerFinish {
            ephemeral_public,
            confirmation,
        } = HandshakeFrame::decode(message)?
        else {
            return Err(Error::Handshake("expected server finish".into()));
        };

        transcript.absorb(&ephemeral_public);
        let hash = transcript.hash();
        let dh_ephemeral = Zeroizing::new(diffie_hellman(&ephemeral_secret, &ephemeral_public)?);
        let keys = SessionKeys::derive(&dh_static, &dh_ephemeral, &hash)?;

        if !bool::from(keys.confirmation_tag(&hash)[..].ct_eq(&confirmation[..])) {
            return Err(Error::Handshake("server confirmation mismatch".into()));
        }

        self.state = ClientState::Established(Established::new(keys));
        Ok(())
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match &mut self.state {
            ClientState::Established(session) => session.seal(Direction::ClientToEnclave, plaintext),
            _ => Err(Error::EncryptionFailed("channel not established".into())),
        }
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        match &mut self.state {
            ClientState::Established(session) => session.open(Direction::EnclaveToClient, ciphertext),
            _ => Err(Error::DecryptionFailed("channel not established".into())),
        }
    }
}

/// factory for [`SoftwareChannel`]s
#[derive(Clone, Copy, Debug, Default)]
pub struct SoftwareAttestation;

impl AttestedChannelFactory for SoftwareAttestation {
    fn begin(&self, enclave: &EnclaveIdentity, challenge: &[u8]) -> Result<Handshake> {
        let frame = bincode::deserialize::<HandshakeFrame>(challenge)
            .map_err(|e| Error::Attestation(format!("malformed challenge: {e}")))?;
        let HandshakeFrame::Challenge {
            mr_enclave,
            static_public,
            evidence: claimed,
        } = frame
        else {
            return Err(Error::Attestation("expected attestation challenge".into()));
        };

        if &mr_enclave != enclave.mr_enclave() {
            return Err(Error::Attestation(format!(
                "measurement mismatch: expected {}, enclave reported {}",
                enclave.mr_enclave_hex(),
                hex::encode(mr_enclave)
            )));
        }
        if !bool::from(evidence(&mr_enclave, &static_public)[..].ct_eq(&claimed[..])) {
            return Err(Error::Attestation("evidence does not bind static key".into()));
        }

        let ephemeral_secret = Zeroizing::new(random_bytes::<32>());
        let hello = HandshakeFrame::ClientHello {
            ephemeral_public: public_key(&ephemeral_secret),
        }
        .encode()?;

        let mut transcript = Transcript::new();
        transcript.absorb(challenge);
        transcript.absorb(&hello);

        let dh_static = Zeroizing::new(diffie_hellman(&ephemeral_secret, &static_public)?);

        Ok(Handshake {
            channel: Box::new(SoftwareChannel {
                state: ClientState::AwaitingFinish {
                    ephemeral_secret,
                    dh_static,
                    transcript,
                },
            }),
            request: hello,
        })
    }
}

/// long-term enclave key plus the measurement it claims
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EnclaveKeys {
    #[zeroize(skip)]
    mr_enclave: [u8; 32],
    static_secret: [u8; 32],
}

impl EnclaveKeys {
    pub fn generate(mr_enclave: [u8; 32]) -> Self {
        Self {
            mr_enclave,
            static_secret: random_bytes(),
        }
    }

    pub fn mr_enclave(&self) -> &[u8; 32] {
        &self.mr_enclave
    }

    /// start the enclave side of a handshake, returns the challenge to send
    pub fn accept(&self) -> Result<(EnclaveHandshake, Vec<u8>)> {
        let static_public = public_key(&self.static_secret);
        let challenge = HandshakeFrame::Challenge {
            mr_enclave: self.mr_enclave,
            static_public,
            evidence: evidence(&self.mr_enclave, &static_public),
        }
        .encode()?;

        let mut transcript = Transcript::new();
        transcript.absorb(&challenge);

        Ok((
            EnclaveHandshake {
                static_secret: Zeroizing::new(self.static_secret),
                transcript,
            },
            challenge,
        ))
    }
}

/// enclave side, waiting for the client hello
pub struct EnclaveHandshake {
    static_secret: Zeroizing<[u8; 32]>,
    transcript: Transcript,
}

impl EnclaveHandshake {
    /// answer a client hello, returns the established channel and the finish frame
    pub fn respond(mut self, hello: &[u8]) -> Result<(EnclaveChannel, Vec<u8>)> {
        let HandshakeFrame::ClientHello {
            ephemeral_public: client_public,
        } = HandshakeFrame::decode(hello)?
        else {
            return Err(Error::Handshake("expected client hello".into()));
        };
        self.transcript.absorb(hello);

        let ephemeral_secret = Zeroizing::new(random_bytes::<32>());
        let ephemeral_public = public_key(&ephemeral_secret);
        self.transcript.absorb(&ephemeral_public);
        let hash = self.transcript.hash();

        let dh_static = Zeroizing::new(diffie_hellman(&self.static_secret, &client_public)?);
        let dh_ephemeral = Zeroizing::new(diffie_hellman(&ephemeral_secret, &client_public)?);
        let keys = SessionKeys::derive(&dh_static, &dh_ephemeral, &hash)?;

        let finish = HandshakeFrame::ServerFinish {
            ephemeral_public,
            confirmation: keys.confirmation_tag(&hash),
        }
        .encode()?;

        Ok((
            EnclaveChannel {
                session: Established::new(keys),
            },
            finish,
        ))
    }
}

/// enclave end of an established channel
pub struct EnclaveChannel {
    session: Established,
}

impl EnclaveChannel {
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.session.open(Direction::ClientToEnclave, ciphertext)
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.session.seal(Direction::EnclaveToClient, plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceUrl;

    fn identity(mr_enclave: [u8; 32]) -> EnclaveIdentity {
        EnclaveIdentity::new(mr_enclave, vec![ServiceUrl::new("wss://localhost")]).unwrap()
    }

    #[test]
    fn test_full_handshake_and_exchange() {
        let keys = EnclaveKeys::generate([9u8; 32]);
        let (enclave_hs, challenge) = keys.accept().unwrap();

        let Handshake { mut channel, request } =
            SoftwareAttestation.begin(&identity([9u8; 32]), &challenge).unwrap();
        let (mut enclave_channel, finish) = enclave_hs.respond(&request).unwrap();
        channel.complete_handshake(&finish).unwrap();

        let ct = channel.encrypt(b"restore please").unwrap();
        assert_eq!(enclave_channel.decrypt(&ct).unwrap(), b"restore please");

        let reply = enclave_channel.encrypt(b"here you go").unwrap();
        assert_eq!(channel.decrypt(&reply).unwrap(), b"here you go");
    }

    #[test]
    fn test_wrong_measurement_rejected() {
        let keys = EnclaveKeys::generate([9u8; 32]);
        let (_, challenge) = keys.accept().unwrap();

        let result = SoftwareAttestation.begin(&identity([1u8; 32]), &challenge);
        assert!(matches!(result, Err(Error::Attestation(_))));
    }

    #[test]
    fn test_forged_evidence_rejected() {
        let keys = EnclaveKeys::generate([9u8; 32]);
        let (_, challenge) = keys.accept().unwrap();

        let HandshakeFrame::Challenge { mr_enclave, static_public, mut evidence } =
            HandshakeFrame::decode(&challenge).unwrap()
        else {
            panic!("expected challenge");
        };
        evidence[31] ^= 1;
        let forged = HandshakeFrame::Challenge { mr_enclave, static_public, evidence }
            .encode()
            .unwrap();

        let result = SoftwareAttestation.begin(&identity([9u8; 32]), &forged);
        assert!(matches!(result, Err(Error::Attestation(_))));
    }

    #[test]
    fn test_garbage_challenge_rejected() {
        let result = SoftwareAttestation.begin(&identity([9u8; 32]), b"not a frame");
        assert!(matches!(result, Err(Error::Attestation(_))));
    }

    #[test]
    fn test_tampered_finish_rejected() {
        let keys = EnclaveKeys::generate([9u8; 32]);
        let (enclave_hs, challenge) = keys.accept().unwrap();
        let Handshake { mut channel, request } =
            SoftwareAttestation.begin(&identity([9u8; 32]), &challenge).unwrap();
        let (_, finish) = enclave_hs.respond(&request).unwrap();

        let HandshakeFrame::ServerFinish { ephemeral_public, mut confirmation } =
            HandshakeFrame::decode(&finish).unwrap()
        else {
            panic!("expected finish");
        };
        confirmation[0] ^= 1;
        let forged = HandshakeFrame::ServerFinish { ephemeral_public, confirmation }
            .encode()
            .unwrap();

        assert!(matches!(
            channel.complete_handshake(&forged),
            Err(Error::Handshake(_))
        ));
        assert!(channel.encrypt(b"x").is_err());
    }
}
