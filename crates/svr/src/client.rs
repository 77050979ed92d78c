//! high-level svr client
//!
//! ties together: pin hashing, attested transport sessions, outcome mapping.
//! every network-touching call runs exactly one exchange. retrying is the
//! caller's job, and only for `NetworkError` outcomes.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::attest::AttestedChannelFactory;
use crate::auth::{AuthCredentials, CredentialsProvider};
use crate::config::{EnclaveIdentity, SvrConfig};
use crate::master_key::MasterKey;
use crate::pin::{normalize_pin, Argon2PinHasher, PinHash, PinHasher};
use crate::protocol::{Request, Response, Status};
use crate::response::{BackupResponse, Classified, DeleteResponse, RestoreResponse};
use crate::session::SvrTransportSession;
use crate::transport::WebSocketFactory;
use crate::{Error, Result};

/// backup, restore and delete of a pin-protected master key
#[async_trait]
pub trait SecureValueRecovery: Send + Sync {
    /// prepare a pin change. no i/o happens until `execute`.
    fn set_pin(&self, user_pin: &str, master_key: MasterKey) -> PinChangeSession;

    /// restore with credentials obtained outside of a registered session
    async fn restore_data_pre_registration(
        &self,
        credentials: AuthCredentials,
        user_pin: &str,
    ) -> RestoreResponse;

    /// restore using the account's current credentials
    async fn restore_data_post_registration(&self, user_pin: &str) -> RestoreResponse;

    async fn delete_data(&self) -> DeleteResponse;
}

/// svr2 client: one enclave generation, attested websocket transport
#[derive(Clone)]
pub struct SecureValueRecoveryV2 {
    enclave: EnclaveIdentity,
    config: SvrConfig,
    transport: Arc<dyn WebSocketFactory>,
    attestation: Arc<dyn AttestedChannelFactory>,
    pin_hasher: Arc<dyn PinHasher>,
    credentials: Arc<dyn CredentialsProvider>,
}

impl SecureValueRecoveryV2 {
    pub fn new(
        enclave: EnclaveIdentity,
        transport: Arc<dyn WebSocketFactory>,
        attestation: Arc<dyn AttestedChannelFactory>,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> Self {
        Self {
            enclave,
            config: SvrConfig::default(),
            transport,
            attestation,
            pin_hasher: Arc::new(Argon2PinHasher::new()),
            credentials,
        }
    }

    pub fn with_config(mut self, config: SvrConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_pin_hasher(mut self, pin_hasher: Arc<dyn PinHasher>) -> Self {
        self.pin_hasher = pin_hasher;
        self
    }

    pub fn enclave(&self) -> &EnclaveIdentity {
        &self.enclave
    }

    pub fn config(&self) -> &SvrConfig {
        &self.config
    }

    /// normalize and hash fresh for every call, nothing is cached
    fn hash_pin(&self, user_pin: &str, username: &str) -> Result<PinHash> {
        let pin = normalize_pin(user_pin);
        self.pin_hasher.hash(&pin, &self.enclave, username)
    }

    async fn exchange(&self, credentials: &AuthCredentials, request: &Request) -> Result<Response> {
        SvrTransportSession::exchange(
            self.transport.as_ref(),
            self.attestation.clone(),
            &self.enclave,
            credentials,
            &self.config,
            request,
        )
        .await
    }

    async fn restore(&self, credentials: &AuthCredentials, user_pin: &str) -> RestoreResponse {
        let pin_hash = match self.hash_pin(user_pin, credentials.username()) {
            Ok(hash) => hash,
            Err(e) => return RestoreResponse::ApplicationError(e),
        };

        let request = Request::Restore {
            access_key: *pin_hash.access_key().as_bytes(),
        };
        let response = match self.exchange(credentials, &request).await {
            Ok(response) => response,
            Err(e) => return Classified::from(e).into(),
        };

        let (status, data, tries_remaining) = match response {
            Response::Restore {
                status,
                data,
                tries_remaining,
            } => (status, data, tries_remaining),
            other => return RestoreResponse::ApplicationError(unexpected("restore", other.status())),
        };

        match status {
            Status::Ok => {
                let Some(data) = data.map(Zeroizing::new) else {
                    return RestoreResponse::ApplicationError(Error::Decode(
                        "restore succeeded without data".into(),
                    ));
                };
                match pin_hash.decrypt_master_key(&data) {
                    Ok(master_key) => {
                        debug!(user = credentials.username(), "restored master key");
                        RestoreResponse::Success(master_key)
                    }
                    Err(e) => {
                        warn!("restored blob did not decrypt: {}", e);
                        RestoreResponse::ApplicationError(e)
                    }
                }
            }
            Status::Missing => RestoreResponse::Missing,
            Status::PinMismatch => RestoreResponse::PinMismatch {
                tries_remaining: tries_remaining.unwrap_or(0),
            },
            Status::RequestInvalid => RestoreResponse::ApplicationError(Error::InvalidRequest),
            status => RestoreResponse::ApplicationError(unexpected("restore", status)),
        }
    }
}

fn unexpected(operation: &'static str, status: Status) -> Error {
    Error::UnexpectedStatus {
        operation,
        status: status.to_string(),
    }
}

#[async_trait]
impl SecureValueRecovery for SecureValueRecoveryV2 {
    fn set_pin(&self, user_pin: &str, master_key: MasterKey) -> PinChangeSession {
        PinChangeSession {
            client: self.clone(),
            user_pin: Zeroizing::new(user_pin.to_string()),
            master_key,
            setup_complete: false,
            abandoned: None,
        }
    }

    async fn restore_data_pre_registration(
        &self,
        credentials: AuthCredentials,
        user_pin: &str,
    ) -> RestoreResponse {
        self.restore(&credentials, user_pin).await
    }

    async fn restore_data_post_registration(&self, user_pin: &str) -> RestoreResponse {
        match self.credentials.credentials().await {
            Ok(credentials) => self.restore(&credentials, user_pin).await,
            Err(e) => Classified::from(e).into(),
        }
    }

    async fn delete_data(&self) -> DeleteResponse {
        let credentials = match self.credentials.credentials().await {
            Ok(credentials) => credentials,
            Err(e) => return Classified::from(e).into(),
        };

        match self.exchange(&credentials, &Request::Delete).await {
            Ok(response) => match response.status() {
                Status::Ok => {
                    debug!(user = credentials.username(), "deleted backup");
                    DeleteResponse::Success
                }
                Status::RequestInvalid => DeleteResponse::ApplicationError(Error::InvalidRequest),
                status => DeleteResponse::ApplicationError(unexpected("delete", status)),
            },
            Err(e) => Classified::from(e).into(),
        }
    }
}

/// terminal backup failure remembered by a pin change session
#[derive(Clone, Debug)]
enum Abandoned {
    EnclaveNotFound,
    ServerRejected,
    Application(String),
}

impl Abandoned {
    fn response(&self) -> BackupResponse {
        match self {
            Abandoned::EnclaveNotFound => BackupResponse::EnclaveNotFound,
            Abandoned::ServerRejected => BackupResponse::ServerRejected,
            Abandoned::Application(reason) => {
                BackupResponse::ApplicationError(Error::PinChangeAbandoned(reason.clone()))
            }
        }
    }
}

/// two-phase pin change: backup (store, reset guess counter) then expose
/// (make restorable).
///
/// keep the session and call `execute` again after a `NetworkError`. once
/// the backup phase has succeeded it is never sent again for this session;
/// once it has failed terminally nothing is sent at all.
pub struct PinChangeSession {
    client: SecureValueRecoveryV2,
    user_pin: Zeroizing<String>,
    master_key: MasterKey,
    setup_complete: bool,
    abandoned: Option<Abandoned>,
}

impl PinChangeSession {
    pub fn master_key(&self) -> &MasterKey {
        &self.master_key
    }

    /// whether the backup phase has been committed
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete
    }

    pub async fn execute(&mut self) -> BackupResponse {
        if let Some(abandoned) = &self.abandoned {
            return abandoned.response();
        }

        let credentials = match self.client.credentials.credentials().await {
            Ok(credentials) => credentials,
            Err(e) => return Classified::from(e).into(),
        };

        // backup and expose must carry identical data, sealing is deterministic
        let (access_key, data) = match self.derive(&credentials) {
            Ok(derived) => derived,
            Err(e) => return BackupResponse::ApplicationError(e),
        };

        if !self.setup_complete {
            let request = Request::Backup {
                access_key: *access_key,
                data: data.to_vec(),
                max_tries: self.client.config.max_tries,
            };
            if let Some(failure) = self.backup(&credentials, &request).await {
                return failure;
            }
        }

        self.expose(&credentials, data.to_vec()).await
    }

    fn derive(
        &self,
        credentials: &AuthCredentials,
    ) -> Result<(Zeroizing<[u8; 32]>, Zeroizing<Vec<u8>>)> {
        let pin_hash = self.client.hash_pin(&self.user_pin, credentials.username())?;
        let data = Zeroizing::new(pin_hash.encrypt_master_key(&self.master_key)?);
        Ok((Zeroizing::new(*pin_hash.access_key().as_bytes()), data))
    }

    /// phase a. `None` means the backup is committed.
    async fn backup(
        &mut self,
        credentials: &AuthCredentials,
        request: &Request,
    ) -> Option<BackupResponse> {
        let error = match self.client.exchange(credentials, request).await {
            Ok(response) => match response.status() {
                Status::Ok => {
                    self.setup_complete = true;
                    info!(user = credentials.username(), "backup stored, exposing");
                    return None;
                }
                Status::RequestInvalid => Error::InvalidRequest,
                status => unexpected("backup", status),
            },
            Err(e) => e,
        };

        let outcome = match Classified::from(error) {
            // retryable, the next execute starts over with phase a
            Classified::Network(e) => return Some(BackupResponse::NetworkError(e)),
            Classified::EnclaveNotFound => Abandoned::EnclaveNotFound,
            Classified::ServerRejected => Abandoned::ServerRejected,
            Classified::Application(e) => {
                warn!("backup failed terminally: {}", e);
                self.abandoned = Some(Abandoned::Application(e.to_string()));
                return Some(BackupResponse::ApplicationError(e));
            }
        };
        let response = outcome.response();
        self.abandoned = Some(outcome);
        Some(response)
    }

    /// phase b
    async fn expose(&self, credentials: &AuthCredentials, data: Vec<u8>) -> BackupResponse {
        match self.client.exchange(credentials, &Request::Expose { data }).await {
            Ok(response) => match response.status() {
                Status::Ok => {
                    info!(user = credentials.username(), "backup exposed");
                    BackupResponse::Success(self.master_key.clone())
                }
                Status::Error => {
                    warn!(user = credentials.username(), "backup stored but not exposed");
                    BackupResponse::ExposeFailure
                }
                Status::RequestInvalid => BackupResponse::ApplicationError(Error::InvalidRequest),
                status => BackupResponse::ApplicationError(unexpected("expose", status)),
            },
            Err(e) => Classified::from(e).into(),
        }
    }
}

impl std::fmt::Debug for PinChangeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinChangeSession")
            .field("setup_complete", &self.setup_complete)
            .field("abandoned", &self.abandoned)
            .finish_non_exhaustive()
    }
}
