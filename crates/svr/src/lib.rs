//! # svr
//!
//! secure value recovery client: back up a 32-byte master key into an
//! attested enclave, protected by a user pin.
//!
//! the pin is stretched locally; the enclave only ever sees an access key
//! and a blob it cannot decrypt. the enclave enforces the guess limit.
//!
//! ## architecture
//!
//! ```text
//! ┌──────────────────────────┐
//! │ username + pin + enclave │
//! └────────────┬─────────────┘
//!              │ argon2id
//!      ┌───────┴────────┐
//!      ▼                ▼
//! ┌──────────┐   ┌────────────────┐
//! │access key│   │ encryption key │──▶ sealed master key
//! └────┬─────┘   └────────────────┘          │
//!      │                                     │
//!      ▼                                     ▼
//! ┌───────────────────────────────────────────────┐
//! │ SvrTransportSession (one per request)         │
//! │   websocket ─▶ attestation ─▶ encrypted frame │
//! └──────────────────────┬────────────────────────┘
//!                        ▼
//!                 ┌────────────┐
//!                 │  enclave   │  (guess counter, records)
//!                 └────────────┘
//! ```
//!
//! ## pin change
//!
//! a pin change is two exchanges: backup (store, reset guess counter, not
//! yet restorable) and expose (make restorable). [`PinChangeSession`]
//! remembers when backup has succeeded so a retried `execute` only re-sends
//! expose.
//!
//! ## usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use svr::{
//!     AuthCredentials, EnclaveIdentity, MasterKey, SecureValueRecovery,
//!     SecureValueRecoveryV2, SoftwareAttestation, StaticCredentials,
//!     TungsteniteConnector, BackupResponse,
//! };
//!
//! let enclave: EnclaveIdentity = serde_json::from_str(&config_json)?;
//! let credentials = AuthCredentials::new(username, password);
//! let client = SecureValueRecoveryV2::new(
//!     enclave,
//!     Arc::new(TungsteniteConnector),
//!     Arc::new(SoftwareAttestation),
//!     Arc::new(StaticCredentials(credentials)),
//! );
//!
//! let mut session = client.set_pin("1234", MasterKey::generate());
//! loop {
//!     match session.execute().await {
//!         BackupResponse::NetworkError(_) => continue,
//!         outcome => break outcome,
//!     }
//! }
//! ```

pub mod attest;
pub mod auth;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod master_key;
pub mod pin;
pub mod protocol;
pub mod response;
pub mod session;
pub mod transport;

#[cfg(feature = "software")]
pub mod enclave;

pub use attest::{AttestedChannel, AttestedChannelFactory};
pub use auth::{AuthCredentials, CredentialsProvider, StaticCredentials};
pub use client::{PinChangeSession, SecureValueRecovery, SecureValueRecoveryV2};
pub use config::{EnclaveIdentity, ServiceUrl, SvrConfig};
pub use error::{Error, Result};
pub use master_key::MasterKey;
pub use pin::{normalize_pin, Argon2PinHasher, PinHasher};
pub use response::{BackupResponse, DeleteResponse, RestoreResponse};
pub use session::SvrTransportSession;
pub use transport::{SocketHandle, SocketListener, WebSocketFactory};

#[cfg(feature = "software")]
pub use attest::software::SoftwareAttestation;

#[cfg(feature = "software")]
pub use enclave::{LoopbackConnector, SoftwareEnclave};

#[cfg(feature = "network")]
pub use transport::tungstenite::TungsteniteConnector;
