//! one attested request/response exchange
//!
//! ```text
//! WaitingToInitialize --open--> WaitingForConnection --challenge--> WaitingForHandshake
//!     --finish--> WaitingForResponse --response--> Closed
//! any error or early remote close --> Failed
//! ```
//!
//! the state machine runs inside transport callbacks. the caller waits on a
//! oneshot that only the first terminal event can resolve; whatever the
//! transport reports after that is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::attest::{AttestedChannel, AttestedChannelFactory, Handshake};
use crate::auth::AuthCredentials;
use crate::config::{EnclaveIdentity, SvrConfig};
use crate::error::{CLOSE_NORMAL, CLOSE_PROTOCOL_FAILURE};
use crate::protocol::{Request, Response};
use crate::transport::{ConnectRequest, SocketHandle, SocketListener, WebSocketFactory};
use crate::{Error, Result};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// hex chars of mr_enclave shown in logs
const ENCLAVE_TAG_LEN: usize = 8;

enum State {
    WaitingToInitialize,
    WaitingForConnection,
    WaitingForHandshake(Box<dyn AttestedChannel>),
    WaitingForResponse(Box<dyn AttestedChannel>),
    Closed,
    Failed,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::WaitingToInitialize => "waiting_to_initialize",
            State::WaitingForConnection => "waiting_for_connection",
            State::WaitingForHandshake(_) => "waiting_for_handshake",
            State::WaitingForResponse(_) => "waiting_for_response",
            State::Closed => "closed",
            State::Failed => "failed",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, State::Closed | State::Failed)
    }
}

/// single-use transport session for one svr request
pub struct SvrTransportSession {
    id: u64,
    enclave: EnclaveIdentity,
    /// measurement prefix carried on every log line
    enclave_tag: String,
    attestation: Arc<dyn AttestedChannelFactory>,
    request_kind: &'static str,
    /// encoded plaintext request, sent once the channel is up
    request: Mutex<Option<Zeroizing<Vec<u8>>>>,
    state: Mutex<State>,
    outcome: Mutex<Option<oneshot::Sender<Result<Response>>>>,
}

/// resolves once the session reaches a terminal state
pub struct PendingResponse(oneshot::Receiver<Result<Response>>);

impl PendingResponse {
    pub async fn wait(self) -> Result<Response> {
        self.0
            .await
            .unwrap_or_else(|_| Err(Error::Network("transport dropped the session".into())))
    }
}

impl SvrTransportSession {
    pub fn new(
        enclave: EnclaveIdentity,
        attestation: Arc<dyn AttestedChannelFactory>,
        request: &Request,
    ) -> Result<(Arc<Self>, PendingResponse)> {
        let (tx, rx) = oneshot::channel();
        let mut enclave_tag = enclave.mr_enclave_hex();
        enclave_tag.truncate(ENCLAVE_TAG_LEN);
        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            enclave,
            enclave_tag,
            attestation,
            request_kind: request.name(),
            request: Mutex::new(Some(Zeroizing::new(request.encode()?))),
            state: Mutex::new(State::WaitingToInitialize),
            outcome: Mutex::new(Some(tx)),
        });
        Ok((session, PendingResponse(rx)))
    }

    /// run one full exchange: connect, attest, send `request`, await the response
    pub async fn exchange(
        transport: &dyn WebSocketFactory,
        attestation: Arc<dyn AttestedChannelFactory>,
        enclave: &EnclaveIdentity,
        credentials: &AuthCredentials,
        config: &SvrConfig,
        request: &Request,
    ) -> Result<Response> {
        let service = enclave.choose_url();
        let connect = ConnectRequest {
            url: enclave.endpoint(service),
            authorization: credentials.basic_auth(),
            host_header: service.host_header.clone(),
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
        };

        let (session, pending) = Self::new(enclave.clone(), attestation, request)?;
        debug!(
            session = session.id,
            enclave = %session.enclave_tag,
            request = session.request_kind,
            url = %connect.url,
            "starting svr exchange"
        );
        transport.connect(connect, session)?;
        pending.wait().await
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, from: &'static str, state: &mut State, next: State) {
        debug!(
            session = self.id,
            enclave = %self.enclave_tag,
            from,
            to = next.name(),
            "svr session transition"
        );
        *state = next;
    }

    /// resolve the caller's future. first call wins.
    fn complete(&self, result: Result<Response>) {
        let sender = self
            .outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match sender {
            Some(tx) => {
                // receiver gone means the caller stopped waiting
                let _ = tx.send(result);
            }
            None => debug!(session = self.id, "dropping late svr outcome"),
        }
    }

    fn fail(
        &self,
        from: &'static str,
        state: &mut State,
        socket: Option<&dyn SocketHandle>,
        error: Error,
    ) {
        warn!(
            session = self.id,
            enclave = %self.enclave_tag,
            request = self.request_kind,
            in_state = from,
            "svr exchange failed: {}",
            error
        );
        *state = State::Failed;
        if let Some(socket) = socket {
            socket.close(CLOSE_PROTOCOL_FAILURE, "protocol failure");
        }
        self.complete(Err(error));
    }

    fn take_request(&self) -> Result<Zeroizing<Vec<u8>>> {
        self.request
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| Error::Handshake("request already sent".into()))
    }

    /// next state after an inbound frame, or the error that fails the session
    fn advance(&self, current: State, socket: &dyn SocketHandle, bytes: &[u8]) -> Result<State> {
        match current {
            State::WaitingToInitialize => {
                Err(Error::Handshake("message before the connection opened".into()))
            }
            State::WaitingForConnection => {
                let Handshake { channel, request } = self.attestation.begin(&self.enclave, bytes)?;
                if !socket.send(request) {
                    return Err(Error::Network("connection lost sending handshake".into()));
                }
                Ok(State::WaitingForHandshake(channel))
            }
            State::WaitingForHandshake(mut channel) => {
                channel.complete_handshake(bytes)?;
                let plaintext = self.take_request()?;
                let ciphertext = channel.encrypt(&plaintext)?;
                if !socket.send(ciphertext) {
                    return Err(Error::Network("connection lost sending request".into()));
                }
                Ok(State::WaitingForResponse(channel))
            }
            State::WaitingForResponse(mut channel) => {
                let plaintext = Zeroizing::new(channel.decrypt(bytes)?);
                let response = Response::decode(&plaintext)?;
                if !response_matches(self.request_kind, &response) {
                    return Err(Error::Decode(format!(
                        "{} request answered with {:?} response",
                        self.request_kind,
                        response.status()
                    )));
                }
                self.complete(Ok(response));
                socket.close(CLOSE_NORMAL, "done");
                Ok(State::Closed)
            }
            terminal => Ok(terminal),
        }
    }
}

fn response_matches(request_kind: &str, response: &Response) -> bool {
    matches!(
        (request_kind, response),
        ("backup", Response::Backup { .. })
            | ("expose", Response::Expose { .. })
            | ("restore", Response::Restore { .. })
            | ("delete", Response::Delete { .. })
    )
}

impl SocketListener for SvrTransportSession {
    fn on_open(&self, socket: &dyn SocketHandle) {
        let mut state = self.lock_state();
        let from = state.name();
        if matches!(*state, State::WaitingToInitialize) {
            self.transition(from, &mut state, State::WaitingForConnection);
        } else if !state.is_terminal() {
            let error = Error::Handshake("transport opened twice".into());
            self.fail(from, &mut state, Some(socket), error);
        }
    }

    fn on_message(&self, socket: &dyn SocketHandle, bytes: Vec<u8>) {
        let mut state = self.lock_state();
        if state.is_terminal() {
            debug!(
                session = self.id,
                enclave = %self.enclave_tag,
                in_state = state.name(),
                "ignoring message"
            );
            return;
        }

        let current = std::mem::replace(&mut *state, State::Failed);
        let from = current.name();
        match self.advance(current, socket, &bytes) {
            Ok(next) => self.transition(from, &mut state, next),
            Err(error) => self.fail(from, &mut state, Some(socket), error),
        }
    }

    fn on_closed(&self, code: u16, reason: &str) {
        let mut state = self.lock_state();
        if state.is_terminal() {
            return;
        }
        let error = if code == CLOSE_NORMAL {
            Error::ConnectionClosedEarly
        } else {
            debug!(
                session = self.id,
                enclave = %self.enclave_tag,
                code,
                reason,
                "remote closed svr websocket"
            );
            Error::Status(code)
        };
        let from = state.name();
        self.fail(from, &mut state, None, error);
    }

    fn on_failure(&self, error: Error) {
        let mut state = self.lock_state();
        if state.is_terminal() {
            debug!(session = self.id, "ignoring transport failure after completion: {}", error);
            return;
        }
        let from = state.name();
        self.fail(from, &mut state, None, error);
    }
}

#[cfg(all(test, feature = "software"))]
mod tests {
    use super::*;
    use crate::attest::software::{EnclaveChannel, EnclaveKeys, SoftwareAttestation};
    use crate::config::ServiceUrl;
    use crate::protocol::Status;

    /// records frames instead of sending them
    #[derive(Default)]
    struct RecordingSocket {
        sent: Mutex<Vec<Vec<u8>>>,
        closes: Mutex<Vec<u16>>,
    }

    impl SocketHandle for RecordingSocket {
        fn send(&self, bytes: Vec<u8>) -> bool {
            self.sent.lock().unwrap().push(bytes);
            true
        }

        fn close(&self, code: u16, _reason: &str) {
            self.closes.lock().unwrap().push(code);
        }
    }

    impl RecordingSocket {
        fn last_sent(&self) -> Vec<u8> {
            self.sent.lock().unwrap().last().cloned().unwrap()
        }
    }

    const MR_ENCLAVE: [u8; 32] = [0x5a; 32];

    fn session(request: &Request) -> (Arc<SvrTransportSession>, PendingResponse) {
        let enclave =
            EnclaveIdentity::new(MR_ENCLAVE, vec![ServiceUrl::new("wss://localhost")]).unwrap();
        SvrTransportSession::new(enclave, Arc::new(SoftwareAttestation), request).unwrap()
    }

    /// drive a session through the handshake, returns the enclave's channel
    fn handshake(session: &SvrTransportSession, socket: &RecordingSocket) -> EnclaveChannel {
        let keys = EnclaveKeys::generate(MR_ENCLAVE);
        let (enclave_hs, challenge) = keys.accept().unwrap();

        session.on_open(socket);
        session.on_message(socket, challenge);
        let (channel, finish) = enclave_hs.respond(&socket.last_sent()).unwrap();
        session.on_message(socket, finish);
        channel
    }

    #[test]
    fn test_logs_tag_measurement_prefix() {
        let (session, _pending) = session(&Request::Delete);
        assert_eq!(session.enclave_tag, "5a5a5a5a");
    }

    #[tokio::test]
    async fn test_happy_path_closes_normally() {
        let socket = RecordingSocket::default();
        let (session, pending) = session(&Request::Delete);
        let mut enclave = handshake(&session, &socket);

        let request = Request::decode(&enclave.decrypt(&socket.last_sent()).unwrap()).unwrap();
        assert_eq!(request, Request::Delete);

        let reply = Response::Delete { status: Status::Ok }.encode().unwrap();
        session.on_message(&socket, enclave.encrypt(&reply).unwrap());

        assert_eq!(pending.wait().await.unwrap(), Response::Delete { status: Status::Ok });
        assert_eq!(*socket.closes.lock().unwrap(), vec![CLOSE_NORMAL]);
    }

    #[tokio::test]
    async fn test_only_first_outcome_is_observed() {
        let socket = RecordingSocket::default();
        let (session, pending) = session(&Request::Delete);
        let mut enclave = handshake(&session, &socket);

        let reply = Response::Delete { status: Status::Ok }.encode().unwrap();
        session.on_message(&socket, enclave.encrypt(&reply).unwrap());

        // abnormal shutdown noise after success
        session.on_closed(1011, "internal error");
        session.on_failure(Error::Network("reset".into()));
        session.on_message(&socket, vec![1, 2, 3]);

        assert_eq!(pending.wait().await.unwrap(), Response::Delete { status: Status::Ok });
        assert_eq!(socket.closes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_normal_close_before_response_is_error() {
        let socket = RecordingSocket::default();
        let (session, pending) = session(&Request::Delete);
        let _enclave = handshake(&session, &socket);

        session.on_closed(CLOSE_NORMAL, "");
        assert!(matches!(
            pending.wait().await,
            Err(Error::ConnectionClosedEarly)
        ));
    }

    #[tokio::test]
    async fn test_coded_close_surfaces_code() {
        let socket = RecordingSocket::default();
        let (session, pending) = session(&Request::Delete);
        session.on_open(&socket);
        session.on_closed(4508, "rejected");
        assert!(matches!(pending.wait().await, Err(Error::Status(4508))));
    }

    #[tokio::test]
    async fn test_message_before_open_fails_with_protocol_close() {
        let socket = RecordingSocket::default();
        let (session, pending) = session(&Request::Delete);
        session.on_message(&socket, vec![0]);

        assert!(matches!(pending.wait().await, Err(Error::Handshake(_))));
        assert_eq!(*socket.closes.lock().unwrap(), vec![CLOSE_PROTOCOL_FAILURE]);
    }

    #[tokio::test]
    async fn test_bad_attestation_fails() {
        let socket = RecordingSocket::default();
        let (session, pending) = session(&Request::Delete);
        let (_, challenge) = EnclaveKeys::generate([0x11; 32]).accept().unwrap();

        session.on_open(&socket);
        session.on_message(&socket, challenge);

        assert!(matches!(pending.wait().await, Err(Error::Attestation(_))));
        assert_eq!(*socket.closes.lock().unwrap(), vec![CLOSE_PROTOCOL_FAILURE]);
        assert!(socket.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undecryptable_response_fails() {
        let socket = RecordingSocket::default();
        let (session, pending) = session(&Request::Delete);
        let _enclave = handshake(&session, &socket);

        session.on_message(&socket, vec![0u8; 40]);
        assert!(matches!(pending.wait().await, Err(Error::DecryptionFailed(_))));
        assert_eq!(*socket.closes.lock().unwrap(), vec![CLOSE_PROTOCOL_FAILURE]);
    }

    #[tokio::test]
    async fn test_mismatched_response_kind_fails() {
        let socket = RecordingSocket::default();
        let (session, pending) = session(&Request::Delete);
        let mut enclave = handshake(&session, &socket);

        let reply = Response::Backup { status: Status::Ok }.encode().unwrap();
        session.on_message(&socket, enclave.encrypt(&reply).unwrap());
        assert!(matches!(pending.wait().await, Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn test_dropped_transport_is_network_error() {
        let (session, pending) = session(&Request::Delete);
        drop(session);
        let err = pending.wait().await.unwrap_err();
        assert!(err.is_network());
    }
}
