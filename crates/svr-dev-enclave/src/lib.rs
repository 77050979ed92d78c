//! svr-dev-enclave - a software enclave behind a local websocket
//!
//! serves the same connection flow the real service does:
//!
//! ```text
//! GET /v1/{mr_enclave}   websocket upgrade, basic auth required
//!   enclave -> client    attestation challenge
//!   client  -> enclave   handshake
//!   enclave -> client    handshake finish
//!   client  -> enclave   encrypted request
//!   enclave -> client    encrypted response
//! GET /health            json status
//! ```
//!
//! the basic auth username is the backup id. passwords are not checked.
//! dev/testing only: records live in memory and attestation is software.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use svr::enclave::{Reply, SoftwareEnclave};
use svr::AuthCredentials;
use tracing::{debug, warn};

/// close code for frames the enclave could not process
const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// app state shared across handlers
pub struct AppState {
    enclave: SoftwareEnclave,
    mr_enclave_hex: String,
}

impl AppState {
    pub fn new(enclave: SoftwareEnclave) -> Self {
        let mr_enclave_hex = hex::encode(enclave.mr_enclave());
        Self {
            enclave,
            mr_enclave_hex,
        }
    }

    pub fn enclave(&self) -> &SoftwareEnclave {
        &self.enclave
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    mr_enclave: String,
    records: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/{enclave}", get(connect))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        mr_enclave: state.mr_enclave_hex.clone(),
        records: state.enclave.record_count(),
    })
}

async fn connect(
    State(state): State<Arc<AppState>>,
    Path(enclave): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !enclave.eq_ignore_ascii_case(&state.mr_enclave_hex) {
        debug!(requested = %enclave, "unknown enclave");
        return (StatusCode::NOT_FOUND, "unknown enclave").into_response();
    }

    let credentials = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(AuthCredentials::from_basic_auth);
    let Some(credentials) = credentials else {
        return (StatusCode::UNAUTHORIZED, "basic auth required").into_response();
    };

    let enclave = state.enclave.clone();
    let username = credentials.username().to_string();
    ws.on_upgrade(move |socket| serve(socket, enclave, username))
}

async fn serve(mut socket: WebSocket, enclave: SoftwareEnclave, username: String) {
    let (mut connection, challenge) = match enclave.open(&username) {
        Ok(opened) => opened,
        Err(e) => {
            warn!(user = %username, "failed to start handshake: {}", e);
            return;
        }
    };
    debug!(user = %username, "connection opened");

    if socket.send(Message::Binary(challenge.into())).await.is_err() {
        return;
    }

    while let Some(message) = socket.recv().await {
        let bytes = match message {
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(_)) => break,
            // ping/pong handled by axum, text is not part of the protocol
            Ok(_) => continue,
            Err(e) => {
                debug!(user = %username, "websocket error: {}", e);
                return;
            }
        };

        let reply = match connection.handle(&bytes) {
            Ok(Reply::Finish(frame)) | Ok(Reply::Response(frame)) => frame,
            Err(e) => {
                warn!(user = %username, "rejecting frame: {}", e);
                let close = CloseFrame {
                    code: CLOSE_PROTOCOL_ERROR,
                    reason: "protocol error".into(),
                };
                let _ = socket.send(Message::Close(Some(close))).await;
                return;
            }
        };
        if socket.send(Message::Binary(reply.into())).await.is_err() {
            return;
        }
    }
    debug!(user = %username, "connection closed");
}
