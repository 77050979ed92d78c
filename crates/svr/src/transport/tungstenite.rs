//! websocket transport over tokio-tungstenite

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, Request};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async;
use tracing::{debug, warn};

use crate::error::CLOSE_PROTOCOL_FAILURE;
use crate::transport::{ChannelSocket, ConnectRequest, Outbound, SocketListener, WebSocketFactory};
use crate::{Error, Result};

/// close code reported when the remote dropped the close frame's status
const CLOSE_NO_STATUS: u16 = 1005;

/// opens real websocket connections on the current tokio runtime
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    fn build_request(request: &ConnectRequest) -> Result<Request<()>> {
        let mut http_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Config(format!("invalid url {}: {e}", request.url)))?;

        let headers = http_request.headers_mut();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&request.authorization)
                .map_err(|e| Error::Credentials(e.to_string()))?,
        );
        if let Some(host) = &request.host_header {
            headers.insert(
                header::HOST,
                HeaderValue::from_str(host).map_err(|e| Error::Config(e.to_string()))?,
            );
        }
        Ok(http_request)
    }
}

impl WebSocketFactory for TungsteniteConnector {
    fn connect(&self, request: ConnectRequest, listener: Arc<dyn SocketListener>) -> Result<()> {
        let http_request = Self::build_request(&request)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Config("websocket transport needs a tokio runtime".into()))?;

        debug!(url = %request.url, "opening svr websocket");
        runtime.spawn(drive(
            http_request,
            request.connect_timeout,
            request.read_timeout,
            listener,
        ));
        Ok(())
    }
}

/// owns one connection and feeds its events to the listener
async fn drive(
    request: Request<()>,
    connect_timeout: Duration,
    read_timeout: Duration,
    listener: Arc<dyn SocketListener>,
) {
    let stream = match timeout(connect_timeout, connect_async(request)).await {
        Err(_) => return listener.on_failure(Error::Timeout("connect")),
        Ok(Err(tungstenite::Error::Http(response))) => {
            return listener.on_failure(Error::Status(response.status().as_u16()))
        }
        Ok(Err(e)) => return listener.on_failure(Error::Network(e.to_string())),
        Ok(Ok((stream, _))) => stream,
    };

    let (mut sink, mut inbound) = stream.split();
    let (socket, mut outbound) = ChannelSocket::new();
    listener.on_open(&socket);

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(Outbound::Binary(bytes)) => {
                    if let Err(e) = sink.send(Message::Binary(bytes)).await {
                        return listener.on_failure(Error::Network(e.to_string()));
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let close = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(close))).await {
                        debug!("close frame not delivered: {}", e);
                    }
                    return;
                }
                // unreachable while `socket` is alive
                None => return,
            },
            message = timeout(read_timeout, inbound.next()) => match message {
                Err(_) => {
                    warn!("svr websocket read timed out");
                    listener.on_failure(Error::Timeout("read"));
                    let close = CloseFrame {
                        code: CloseCode::from(CLOSE_PROTOCOL_FAILURE),
                        reason: "read timeout".into(),
                    };
                    let _ = sink.send(Message::Close(Some(close))).await;
                    return;
                }
                Ok(None) => {
                    return listener.on_failure(Error::Network("connection reset".into()));
                }
                Ok(Some(Err(e))) => return listener.on_failure(Error::Network(e.to_string())),
                Ok(Some(Ok(Message::Binary(bytes)))) => listener.on_message(&socket, bytes),
                Ok(Some(Ok(Message::Close(frame)))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                        None => (CLOSE_NO_STATUS, String::new()),
                    };
                    return listener.on_closed(code, &reason);
                }
                Ok(Some(Ok(Message::Text(_)))) => {
                    return listener.on_failure(Error::Decode("unexpected text frame".into()));
                }
                // ping/pong are answered by tungstenite
                Ok(Some(Ok(_))) => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_headers() {
        let request = ConnectRequest {
            url: "wss://203.0.113.7/v1/abcd".into(),
            authorization: "Basic YWxpY2U6cHc=".into(),
            host_header: Some("svr2.example.org".into()),
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
        };

        let http_request = TungsteniteConnector::build_request(&request).unwrap();
        assert_eq!(
            http_request.headers()[header::AUTHORIZATION],
            "Basic YWxpY2U6cHc="
        );
        assert_eq!(http_request.headers()[header::HOST], "svr2.example.org");
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let request = ConnectRequest {
            url: "not a url".into(),
            authorization: "Basic x".into(),
            host_header: None,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            TungsteniteConnector::build_request(&request),
            Err(Error::Config(_))
        ));
    }
}
