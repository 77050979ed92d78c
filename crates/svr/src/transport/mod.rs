//! callback-style websocket transport
//!
//! a [`WebSocketFactory`] opens one connection per call and reports
//! everything that happens on it to a [`SocketListener`], from its own task.
//! listeners answer through the [`SocketHandle`] passed into each callback.
//!
//! implementations:
//! - tungstenite: real websockets (feature `network`)
//! - loopback: in-process software enclave (feature `software`, see
//!   `crate::enclave::software`)

#[cfg(feature = "network")]
pub mod tungstenite;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::{Error, Result};

/// everything needed to open one connection
#[derive(Clone, Debug)]
pub struct ConnectRequest {
    /// full websocket url including the enclave path
    pub url: String,
    /// `Authorization` header value
    pub authorization: String,
    /// alternate `Host` header
    pub host_header: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

/// write side of an open connection
pub trait SocketHandle: Send + Sync {
    /// queue a binary frame. false if the connection is already gone.
    fn send(&self, bytes: Vec<u8>) -> bool;

    /// start a close handshake with the given code
    fn close(&self, code: u16, reason: &str);
}

/// receives transport events, possibly on another task than the caller
pub trait SocketListener: Send + Sync {
    fn on_open(&self, socket: &dyn SocketHandle);

    fn on_message(&self, socket: &dyn SocketHandle, bytes: Vec<u8>);

    /// remote sent a close frame
    fn on_closed(&self, code: u16, reason: &str);

    /// connect failure, upgrade rejection, i/o error or timeout
    fn on_failure(&self, error: Error);
}

/// opens connections
pub trait WebSocketFactory: Send + Sync {
    /// start connecting. events are delivered to `listener` asynchronously;
    /// an error here means nothing was started and no event will follow.
    fn connect(&self, request: ConnectRequest, listener: Arc<dyn SocketListener>) -> Result<()>;
}

/// frames queued by a listener for the connection task
#[derive(Debug)]
pub enum Outbound {
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// [`SocketHandle`] backed by an unbounded channel into the connection task
#[derive(Clone, Debug)]
pub struct ChannelSocket(mpsc::UnboundedSender<Outbound>);

impl ChannelSocket {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }
}

impl SocketHandle for ChannelSocket {
    fn send(&self, bytes: Vec<u8>) -> bool {
        self.0.send(Outbound::Binary(bytes)).is_ok()
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.0.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_socket_queues_in_order() {
        let (socket, mut rx) = ChannelSocket::new();
        assert!(socket.send(vec![1, 2]));
        socket.close(1000, "done");

        assert!(matches!(rx.try_recv(), Ok(Outbound::Binary(b)) if b == vec![1, 2]));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close { code: 1000, .. })));

        drop(rx);
        assert!(!socket.send(vec![3]));
    }
}
