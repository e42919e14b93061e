//! Core server: accepts client sockets and drives one session bridge each.
//!
//! Owns the identity provider, the shared credentials cache, the upstream
//! connector, and the connection registry.

use asr_core::{AsrError, AsrResult, ServerEvent, UNAUTHORIZED_REASON};
use futures_util::StreamExt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::bridge::{Outbound, SessionBridge};
use crate::config::ServerConfig;
use crate::identity::IdentityProvider;
use crate::registry::ConnectionRegistry;
use crate::settings::SettingsProvider;
use crate::transport::websocket::{self, ClientConnection};
use crate::upstream::UpstreamConnector;

/// How long shutdown waits for clients to take their close frames.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

/// The relay server instance.
pub struct RelayServer {
    config: ServerConfig,
    identity: Arc<dyn IdentityProvider>,
    settings: Arc<dyn SettingsProvider>,
    connector: Arc<dyn UpstreamConnector>,
    registry: Arc<ConnectionRegistry>,
}

impl RelayServer {
    pub fn new(
        config: ServerConfig,
        identity: Arc<dyn IdentityProvider>,
        settings: Arc<dyn SettingsProvider>,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Self {
        Self {
            config,
            identity,
            settings,
            connector,
            registry: Arc::new(ConnectionRegistry::new()),
        }
    }

    /// Accept connections until `shutdown` resolves, then close every client.
    pub async fn run(
        self,
        tls: Option<TlsAcceptor>,
        shutdown: impl Future<Output = ()>,
    ) -> AsrResult<()> {
        let bind_addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| AsrError::Config(format!("invalid listen address: {e}")))?;
        let (local_addr, conns) =
            websocket::start_listener(bind_addr, tls, self.config.path.clone()).await?;
        info!(addr = %local_addr, path = %self.config.path, "asr-relay ready");

        self.serve(conns, shutdown).await;
        Ok(())
    }

    async fn serve(
        self,
        mut conns: mpsc::Receiver<ClientConnection>,
        shutdown: impl Future<Output = ()>,
    ) {
        let server = Arc::new(self);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                conn = conns.recv() => match conn {
                    Some(conn) => {
                        let srv = server.clone();
                        tokio::spawn(async move { srv.handle_connection(conn).await });
                    }
                    None => break,
                },
                _ = &mut shutdown => {
                    info!("shutting down");
                    break;
                }
            }
        }
        drop(conns);
        server.close_all().await;
    }

    async fn close_all(&self) {
        let open = self.registry.list();
        if open.is_empty() {
            return;
        }
        info!(connections = open.len(), "closing client connections");
        for entry in &open {
            debug!(
                connection_id = entry.connection_id,
                user_id = %entry.user_id,
                remote = %entry.remote_addr,
                secs = entry.connected_at.elapsed().as_secs(),
                "closing"
            );
        }
        self.registry.broadcast(&Outbound::Close {
            code: CloseCode::Away.into(),
            reason: "server shutting down".into(),
        });

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN;
        while self.registry.count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.registry.count();
        if remaining > 0 {
            warn!(remaining, "clients still connected at shutdown");
        }
    }

    /// Drive one client connection until either side closes.
    async fn handle_connection(self: Arc<Self>, conn: ClientConnection) {
        let ClientConnection {
            ws_stream,
            remote_addr,
            handshake,
        } = conn;
        let (mut sink, mut stream) = ws_stream.split();

        let Some(identity) = self.identity.resolve(&handshake) else {
            info!(remote = %remote_addr, path = %handshake.path, "unauthorized connection");
            let _ = websocket::send_outbound(
                &mut sink,
                &Outbound::Event(ServerEvent::error(UNAUTHORIZED_REASON)),
            )
            .await;
            let _ = websocket::send_outbound(&mut sink, &Outbound::unauthorized()).await;
            return;
        };
        info!(
            remote = %remote_addr,
            path = %handshake.path,
            user_id = %identity.user_id,
            role = %identity.role,
            "client connected"
        );

        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let registration = self
            .registry
            .register(&identity.user_id, remote_addr, client_tx.clone());
        let (mut bridge, mut bridge_events) = SessionBridge::new(
            identity,
            self.settings.clone(),
            self.connector.clone(),
            self.config.bridge_config(),
            client_tx.clone(),
        );
        let max_frame = self.config.max_frame_bytes;

        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > max_frame {
                            let _ = client_tx.send(oversize(text.len(), max_frame));
                        } else {
                            bridge.handle_client_text(&text).await;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > max_frame {
                            let _ = client_tx.send(oversize(data.len(), max_frame));
                        } else {
                            bridge.handle_client_audio(data).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(remote = %remote_addr, "client closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(remote = %remote_addr, error = %e, "client socket error");
                        break;
                    }
                },
                Some(event) = bridge_events.recv() => bridge.handle_event(event).await,
                Some(out) = client_rx.recv() => {
                    let closing = matches!(out, Outbound::Close { .. });
                    if let Err(e) = websocket::send_outbound(&mut sink, &out).await {
                        debug!(remote = %remote_addr, error = %e, "client write failed");
                        break;
                    }
                    if closing {
                        break;
                    }
                }
            }
        }

        info!(
            remote = %remote_addr,
            connection_id = registration.connection_id(),
            state = ?bridge.state(),
            "client disconnected"
        );
        bridge.shutdown();
    }
}

fn oversize(len: usize, max: usize) -> Outbound {
    Outbound::Event(ServerEvent::error(format!(
        "message too large: {len} bytes (max {max})"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{HandshakeContext, Identity};
    use crate::settings::{CredentialsCache, UpstreamSettings};
    use crate::upstream::{UpstreamChannel, UpstreamRequest};
    use asr_core::Compression;
    use futures_util::SinkExt;
    use std::pin::Pin;
    use tokio::time::timeout;
    use tokio_tungstenite::connect_async;

    struct TokenIs(&'static str);

    impl IdentityProvider for TokenIs {
        fn resolve(&self, ctx: &HandshakeContext) -> Option<Identity> {
            (ctx.token() == Some(self.0)).then(|| Identity {
                user_id: "tester".into(),
                role: "user".into(),
                expires_at: None,
            })
        }
    }

    /// Accepts the connection and swallows everything it is sent.
    struct SilentUpstream;

    impl UpstreamConnector for SilentUpstream {
        fn connect(
            &self,
            _request: UpstreamRequest,
        ) -> Pin<Box<dyn Future<Output = AsrResult<UpstreamChannel>> + Send + 'static>> {
            Box::pin(async {
                let (out_tx, mut out_rx) = mpsc::channel(8);
                let (in_tx, in_rx) = mpsc::channel(8);
                tokio::spawn(async move {
                    let _keep = in_tx;
                    while out_rx.recv().await.is_some() {}
                });
                Ok(UpstreamChannel {
                    outbound: out_tx,
                    inbound: in_rx,
                })
            })
        }
    }

    async fn spawn_server() -> (SocketAddr, tokio::sync::oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
        let config = ServerConfig::load(None, Some("127.0.0.1"), Some(0), None, None).unwrap();
        let path = config.path.clone();
        let settings = Arc::new(CredentialsCache::fixed(UpstreamSettings {
            endpoint: "wss://upstream.test".into(),
            app_id: "a".into(),
            access_key: "k".into(),
            app_key: None,
            resource_id: "r".into(),
            compression: Compression::Gzip,
            model_name: "bigmodel".into(),
        }));
        let server = RelayServer::new(
            config,
            Arc::new(TokenIs("good")),
            settings,
            Arc::new(SilentUpstream),
        );

        let (addr, conns) = websocket::start_listener("127.0.0.1:0".parse().unwrap(), None, path)
            .await
            .unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(conns, async {
            let _ = stop_rx.await;
        }));
        (addr, stop_tx, handle)
    }

    async fn next_text<S>(ws: &mut S) -> String
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match timeout(Duration::from_secs(5), ws.next()).await.unwrap() {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(Message::Close(frame))) => panic!("closed: {frame:?}"),
                Some(Ok(_)) => continue,
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn unauthorized_client_is_closed_with_4001() {
        let (addr, _stop, _handle) = spawn_server().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/asr?token=bad")).await.unwrap();

        assert_eq!(next_text(&mut ws).await, r#"{"type":"error","message":"Unauthorized"}"#);
        match timeout(Duration::from_secs(5), ws.next()).await.unwrap() {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 4001),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn session_round_trip() {
        let (addr, _stop, _handle) = spawn_server().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/asr?token=good")).await.unwrap();

        ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, r#"{"type":"pong"}"#);

        ws.send(Message::Binary(vec![1, 2])).await.unwrap();
        assert_eq!(
            next_text(&mut ws).await,
            r#"{"type":"error","message":"stream not started"}"#
        );

        ws.send(Message::Text(r#"{"type":"start"}"#.into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, r#"{"type":"started"}"#);

        ws.send(Message::Text(r#"{"type":"audio","payload":"AAEC"}"#.into()))
            .await
            .unwrap();
        ws.send(Message::Text(r#"{"type":"stop"}"#.into())).await.unwrap();
        ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, r#"{"type":"pong"}"#);
    }

    #[tokio::test]
    async fn oversize_messages_are_rejected() {
        let (addr, _stop, _handle) = spawn_server().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/asr?token=good")).await.unwrap();

        ws.send(Message::Binary(vec![0; 1_048_577])).await.unwrap();
        assert!(next_text(&mut ws).await.contains("message too large"));
    }

    #[tokio::test]
    async fn shutdown_closes_clients() {
        let (addr, stop, handle) = spawn_server().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/asr?token=good")).await.unwrap();
        ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, r#"{"type":"pong"}"#);

        stop.send(()).unwrap();
        match timeout(Duration::from_secs(5), ws.next()).await.unwrap() {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Away),
            other => panic!("expected close, got {other:?}"),
        }
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
