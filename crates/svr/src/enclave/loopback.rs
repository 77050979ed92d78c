//! in-process transport into a [`SoftwareEnclave`]
//!
//! behaves like the websocket service: checks basic auth and the enclave
//! path, then runs the enclave connection on its own tokio task and reports
//! through the usual [`SocketListener`] callbacks. scripted
//! [`ConnectionPlan`]s inject the failures real networks produce.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::auth::AuthCredentials;
use crate::enclave::software::{Reply, SoftwareEnclave};
use crate::transport::{ChannelSocket, ConnectRequest, Outbound, SocketListener, WebSocketFactory};
use crate::{Error, Result};

/// close code the loopback uses when the enclave side errors
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// what the next connection should do
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionPlan {
    #[default]
    Normal,
    /// refuse the websocket upgrade with this http status
    RejectUpgrade(u16),
    /// process the request, then close with `code` instead of answering
    CloseBeforeResponse(u16),
    /// process the request, then drop the connection without a close frame
    DropResponse,
    /// answer normally, then also report a remote close with `code`
    CloseAfterResponse(u16),
}

/// [`WebSocketFactory`] backed by a software enclave
pub struct LoopbackConnector {
    enclave: SoftwareEnclave,
    plans: Mutex<VecDeque<ConnectionPlan>>,
    connections: AtomicUsize,
}

impl LoopbackConnector {
    pub fn new(enclave: SoftwareEnclave) -> Self {
        Self {
            enclave,
            plans: Mutex::new(VecDeque::new()),
            connections: AtomicUsize::new(0),
        }
    }

    pub fn enclave(&self) -> &SoftwareEnclave {
        &self.enclave
    }

    /// queue behaviour for upcoming connections; unplanned ones are `Normal`
    pub fn push_plan(&self, plan: ConnectionPlan) {
        self.plans
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(plan);
    }

    /// connections opened so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn next_plan(&self) -> ConnectionPlan {
        self.plans
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or_default()
    }
}

impl WebSocketFactory for LoopbackConnector {
    fn connect(&self, request: ConnectRequest, listener: Arc<dyn SocketListener>) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Config("loopback transport needs a tokio runtime".into()))?;

        self.connections.fetch_add(1, Ordering::SeqCst);
        let plan = self.next_plan();
        debug!(url = %request.url, ?plan, "loopback connection");
        runtime.spawn(serve(self.enclave.clone(), request, plan, listener));
        Ok(())
    }
}

async fn serve(
    enclave: SoftwareEnclave,
    request: ConnectRequest,
    plan: ConnectionPlan,
    listener: Arc<dyn SocketListener>,
) {
    let Some(credentials) = AuthCredentials::from_basic_auth(&request.authorization) else {
        return listener.on_failure(Error::Status(401));
    };
    let path = format!("/v1/{}", hex::encode(enclave.mr_enclave()));
    if !request.url.ends_with(&path) {
        return listener.on_failure(Error::Status(404));
    }
    if let ConnectionPlan::RejectUpgrade(status) = plan {
        return listener.on_failure(Error::Status(status));
    }

    let (mut connection, challenge) = match enclave.open(credentials.username()) {
        Ok(opened) => opened,
        Err(e) => return listener.on_closed(CLOSE_INTERNAL_ERROR, &e.to_string()),
    };

    let (socket, mut outbound) = ChannelSocket::new();
    listener.on_open(&socket);
    listener.on_message(&socket, challenge);

    while let Some(frame) = outbound.recv().await {
        let bytes = match frame {
            Outbound::Binary(bytes) => bytes,
            Outbound::Close { .. } => return,
        };

        match connection.handle(&bytes) {
            Ok(Reply::Finish(finish)) => listener.on_message(&socket, finish),
            Ok(Reply::Response(response)) => match plan {
                ConnectionPlan::CloseBeforeResponse(code) => {
                    return listener.on_closed(code, "closed before response")
                }
                ConnectionPlan::DropResponse => {
                    return listener.on_failure(Error::Network("connection reset".into()))
                }
                ConnectionPlan::CloseAfterResponse(code) => {
                    listener.on_message(&socket, response);
                    listener.on_failure(Error::Network("connection reset".into()));
                    return listener.on_closed(code, "closed after response");
                }
                _ => listener.on_message(&socket, response),
            },
            Err(e) => return listener.on_closed(CLOSE_INTERNAL_ERROR, &e.to_string()),
        }
    }
}
