//! WebSocket listener for browser clients.
//!
//! Accepts plain TCP or TLS (tokio-rustls) and upgrades with tokio-tungstenite.
//! The upgrade request is checked against the configured path and captured as
//! a [`HandshakeContext`] so the server can authorize the connection.

use asr_core::{AsrError, AsrResult};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::bridge::Outbound;
use crate::identity::HandshakeContext;

/// Byte stream under a client socket: plain TCP or TLS.
pub trait ClientIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ClientIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type ClientStream = Box<dyn ClientIo>;

/// Write half of a client socket.
pub type ClientSink = SplitSink<WebSocketStream<ClientStream>, Message>;

/// An upgraded client connection.
pub struct ClientConnection {
    pub ws_stream: WebSocketStream<ClientStream>,
    pub remote_addr: SocketAddr,
    pub handshake: HandshakeContext,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields upgraded
/// connections. The accept loop stops once the receiver is dropped.
/// An empty `path` accepts upgrades on any path.
pub async fn start_listener(
    bind_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    path: String,
) -> AsrResult<(SocketAddr, mpsc::Receiver<ClientConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| AsrError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, tls = tls.is_some(), path = %path, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<ClientConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                accepted = tcp_listener.accept() => accepted,
                _ = tx.closed() => break,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let tls = tls.clone();
                    let path = path.clone();
                    tokio::spawn(async move {
                        match upgrade(stream, addr, tls, &path).await {
                            Ok(conn) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        debug!("WebSocket listener stopped");
    });

    Ok((local_addr, rx))
}

async fn upgrade(
    tcp: TcpStream,
    remote_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    path: &str,
) -> AsrResult<ClientConnection> {
    let stream: ClientStream = match tls {
        Some(acceptor) => Box::new(
            acceptor
                .accept(tcp)
                .await
                .map_err(|e| AsrError::Transport(format!("TLS accept failed: {e}")))?,
        ),
        None => Box::new(tcp),
    };

    let mut captured = None;
    let ws_stream = accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if !path.is_empty() && req.uri().path() != path {
                let mut rejection = ErrorResponse::new(Some("not found".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                return Err(rejection);
            }
            captured = Some(HandshakeContext::from_request(req, remote_addr));
            Ok(resp)
        },
    )
    .await
    .map_err(|e| AsrError::Transport(e.to_string()))?;

    let handshake =
        captured.ok_or_else(|| AsrError::Transport("upgrade request not captured".into()))?;
    Ok(ClientConnection {
        ws_stream,
        remote_addr,
        handshake,
    })
}

/// Write one [`Outbound`] to the client.
pub async fn send_outbound(sink: &mut ClientSink, outbound: &Outbound) -> AsrResult<()> {
    let message = match outbound {
        Outbound::Event(event) => Message::Text(event.to_json()?),
        Outbound::Close { code, reason } => Message::Close(Some(CloseFrame {
            code: CloseCode::from(*code),
            reason: reason.clone().into(),
        })),
    };
    sink.send(message)
        .await
        .map_err(|e| AsrError::Transport(format!("WS send failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use asr_core::ServerEvent;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::connect_async;

    async fn listener(path: &str) -> (SocketAddr, mpsc::Receiver<ClientConnection>) {
        start_listener("127.0.0.1:0".parse().unwrap(), None, path.to_string())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn captures_handshake_context() {
        let (addr, mut rx) = listener("/asr").await;
        let (mut client, _) = connect_async(format!("ws://{addr}/asr?token=abc"))
            .await
            .unwrap();

        let conn = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(conn.handshake.path, "/asr");
        assert_eq!(conn.handshake.token(), Some("abc"));

        let (mut sink, _stream) = conn.ws_stream.split();
        send_outbound(&mut sink, &Outbound::Event(ServerEvent::Pong))
            .await
            .unwrap();
        send_outbound(&mut sink, &Outbound::unauthorized()).await.unwrap();

        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Text(r#"{"type":"pong"}"#.to_string())
        );
        match client.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 4001);
                assert_eq!(frame.reason, "Unauthorized");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_path_is_rejected() {
        let (addr, mut rx) = listener("/asr").await;
        assert!(connect_async(format!("ws://{addr}/other")).await.is_err());
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn empty_path_accepts_any() {
        let (addr, mut rx) = listener("").await;
        let _client = connect_async(format!("ws://{addr}/anything")).await.unwrap();
        let conn = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(conn.handshake.path, "/anything");
        assert!(conn.handshake.token().is_none());
    }
}
