//! software enclave - in-memory record store for testing
//!
//! no hardware isolation, records live in a hashmap keyed by backup id
//! (the transport username). guess counting matches what clients expect
//! from the real service: wrong access keys burn a try, the record is
//! destroyed when none are left, a correct key resets the counter.
//! useful for development and testing, NOT for production.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use subtle::ConstantTimeEq;
use tracing::{debug, info};

use crate::attest::software::{EnclaveChannel, EnclaveHandshake, EnclaveKeys};
use crate::protocol::{Request, Response, Status};
use crate::{Error, Result};

/// one stored backup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub access_key: [u8; 32],
    pub data: Vec<u8>,
    pub max_tries: u32,
    pub tries_remaining: u32,
    /// restorable only once exposed
    pub exposed: bool,
}

/// requests handled so far, by kind
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestCounts {
    pub backup: u64,
    pub expose: u64,
    pub restore: u64,
    pub delete: u64,
}

#[derive(Default)]
struct Counters {
    backup: AtomicU64,
    expose: AtomicU64,
    restore: AtomicU64,
    delete: AtomicU64,
}

/// software enclave for testing
/// NOT SECURE - records are plain memory and attestation is self-asserted
#[derive(Clone)]
pub struct SoftwareEnclave {
    keys: Arc<EnclaveKeys>,
    records: Arc<RwLock<HashMap<String, Record>>>,
    counters: Arc<Counters>,
    refuse_expose: Arc<AtomicBool>,
}

impl SoftwareEnclave {
    /// new enclave claiming `mr_enclave`, with a random static key
    pub fn new(mr_enclave: [u8; 32]) -> Self {
        Self {
            keys: Arc::new(EnclaveKeys::generate(mr_enclave)),
            records: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
            refuse_expose: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mr_enclave(&self) -> &[u8; 32] {
        self.keys.mr_enclave()
    }

    /// make every expose answer `ERROR`
    pub fn set_refuse_expose(&self, refuse: bool) {
        self.refuse_expose.store(refuse, Ordering::SeqCst);
    }

    /// start serving one connection for `username`, returns the challenge
    pub fn open(&self, username: &str) -> Result<(EnclaveConnection, Vec<u8>)> {
        let (handshake, challenge) = self.keys.accept()?;
        Ok((
            EnclaveConnection {
                enclave: self.clone(),
                username: username.to_string(),
                state: ConnectionState::Handshaking(handshake),
            },
            challenge,
        ))
    }

    pub fn record(&self, username: &str) -> Option<Record> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(username)
            .cloned()
    }

    /// number of stored backups, exposed or not
    pub fn record_count(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn request_counts(&self) -> RequestCounts {
        RequestCounts {
            backup: self.counters.backup.load(Ordering::SeqCst),
            expose: self.counters.expose.load(Ordering::SeqCst),
            restore: self.counters.restore.load(Ordering::SeqCst),
            delete: self.counters.delete.load(Ordering::SeqCst),
        }
    }

    /// apply one decrypted request for `username`
    pub fn handle(&self, username: &str, request: Request) -> Response {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match &request {
            Request::Backup {
                access_key,
                data,
                max_tries,
            } => {
                self.counters.backup.fetch_add(1, Ordering::SeqCst);
                if *max_tries == 0 || data.is_empty() {
                    return Response::Backup {
                        status: Status::RequestInvalid,
                    };
                }
                records.insert(
                    username.to_string(),
                    Record {
                        access_key: *access_key,
                        data: data.clone(),
                        max_tries: *max_tries,
                        tries_remaining: *max_tries,
                        exposed: false,
                    },
                );
                info!(user = username, max_tries, "backup stored");
                Response::Backup { status: Status::Ok }
            }

            Request::Expose { data } => {
                self.counters.expose.fetch_add(1, Ordering::SeqCst);
                let status = match records.get_mut(username) {
                    _ if self.refuse_expose.load(Ordering::SeqCst) => Status::Error,
                    Some(record) if record.data == *data => {
                        record.exposed = true;
                        Status::Ok
                    }
                    _ => Status::Error,
                };
                debug!(user = username, %status, "expose");
                Response::Expose { status }
            }

            Request::Restore { access_key } => {
                self.counters.restore.fetch_add(1, Ordering::SeqCst);
                let Some(record) = records.get_mut(username).filter(|r| r.exposed) else {
                    return Response::Restore {
                        status: Status::Missing,
                        data: None,
                        tries_remaining: None,
                    };
                };

                if bool::from(record.access_key.ct_eq(access_key)) {
                    record.tries_remaining = record.max_tries;
                    return Response::Restore {
                        status: Status::Ok,
                        data: Some(record.data.clone()),
                        tries_remaining: Some(record.tries_remaining),
                    };
                }

                record.tries_remaining = record.tries_remaining.saturating_sub(1);
                let remaining = record.tries_remaining;
                if remaining == 0 {
                    // out of guesses, the backup is gone
                    records.remove(username);
                    info!(user = username, "backup destroyed after too many guesses");
                }
                Response::Restore {
                    status: Status::PinMismatch,
                    data: None,
                    tries_remaining: Some(remaining),
                }
            }

            Request::Delete => {
                self.counters.delete.fetch_add(1, Ordering::SeqCst);
                records.remove(username);
                Response::Delete { status: Status::Ok }
            }
        }
    }
}

/// what an enclave connection sends back for an inbound frame
#[derive(Debug)]
pub enum Reply {
    /// handshake finish frame
    Finish(Vec<u8>),
    /// encrypted response; the connection is spent afterwards
    Response(Vec<u8>),
}

enum ConnectionState {
    Handshaking(EnclaveHandshake),
    Established(EnclaveChannel),
    Spent,
}

/// enclave end of one client connection
pub struct EnclaveConnection {
    enclave: SoftwareEnclave,
    username: String,
    state: ConnectionState,
}

impl EnclaveConnection {
    pub fn username(&self) -> &str {
        &self.username
    }

    /// process one inbound binary frame
    pub fn handle(&mut self, frame: &[u8]) -> Result<Reply> {
        match std::mem::replace(&mut self.state, ConnectionState::Spent) {
            ConnectionState::Handshaking(handshake) => {
                let (channel, finish) = handshake.respond(frame)?;
                self.state = ConnectionState::Established(channel);
                Ok(Reply::Finish(finish))
            }
            ConnectionState::Established(mut channel) => {
                let request = Request::decode(&channel.decrypt(frame)?)?;
                debug!(user = %self.username, request = request.name(), "enclave request");
                let response = self.enclave.handle(&self.username, request);
                Ok(Reply::Response(channel.encrypt(&response.encode()?)?))
            }
            ConnectionState::Spent => Err(Error::Handshake("connection already answered".into())),
        }
    }
}
