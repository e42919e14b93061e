//! Upstream recognition socket.
//!
//! A connector turns an [`UpstreamRequest`] into a pair of channels. The
//! socket itself is owned by a writer task and a reader task; the session
//! only ever sees [`UpstreamCommand`]s going out and [`UpstreamInbound`]s
//! coming back. Dropping every outbound sender closes the socket.

use asr_core::{AsrError, AsrResult};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue},
        protocol::frame::coding::CloseCode,
        Message,
    },
};
use tracing::{debug, info, warn};

/// Depth of the inbound (upstream → session) queue.
const INBOUND_QUEUE_DEPTH: usize = 64;

/// Response header carrying the vendor's trace id.
const LOG_ID_HEADER: &str = "x-tt-logid";

/// Outbound instruction for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamCommand {
    Frame(Vec<u8>),
    Close,
}

/// Something the socket reader produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamInbound {
    Frame(Vec<u8>),
    /// Transport failure or abnormal close. The channel ends after this.
    Error(String),
}

/// Where and how to open one upstream socket.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
    pub queue_depth: usize,
}

/// Live upstream socket as seen by a session.
pub struct UpstreamChannel {
    pub outbound: mpsc::Sender<UpstreamCommand>,
    pub inbound: mpsc::Receiver<UpstreamInbound>,
}

/// Opens upstream sockets.
pub trait UpstreamConnector: Send + Sync {
    fn connect(
        &self,
        request: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = AsrResult<UpstreamChannel>> + Send + 'static>>;
}

/// Connector backed by tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct WsUpstreamConnector;

impl UpstreamConnector for WsUpstreamConnector {
    fn connect(
        &self,
        request: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = AsrResult<UpstreamChannel>> + Send + 'static>> {
        Box::pin(connect_ws(request))
    }
}

async fn connect_ws(request: UpstreamRequest) -> AsrResult<UpstreamChannel> {
    let mut ws_request = request
        .endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| AsrError::Transport(format!("invalid upstream endpoint: {e}")))?;

    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AsrError::Transport(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| AsrError::Transport(format!("invalid value for header {name}: {e}")))?;
        ws_request.headers_mut().insert(name, value);
    }

    let (ws_stream, response) = connect_async_with_config(ws_request, None, true)
        .await
        .map_err(|e| AsrError::Transport(e.to_string()))?;

    let log_id = response
        .headers()
        .get(LOG_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    info!(endpoint = %request.endpoint, log_id, "upstream connected");

    let (mut sink, mut stream) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<UpstreamCommand>(request.queue_depth.max(1));
    let (in_tx, in_rx) = mpsc::channel::<UpstreamInbound>(INBOUND_QUEUE_DEPTH);

    tokio::spawn(async move {
        while let Some(cmd) = out_rx.recv().await {
            match cmd {
                UpstreamCommand::Frame(data) => {
                    if let Err(e) = sink.send(Message::Binary(data)).await {
                        warn!(error = %e, "upstream write failed");
                        break;
                    }
                }
                UpstreamCommand::Close => break,
            }
        }
        let _ = sink.close().await;
        debug!("upstream writer finished");
    });

    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    if in_tx.send(UpstreamInbound::Frame(data)).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(frame)) => {
                    if let Some(frame) = frame.filter(|f| f.code != CloseCode::Normal) {
                        let _ = in_tx
                            .send(UpstreamInbound::Error(format!(
                                "upstream closed: {} {}",
                                u16::from(frame.code),
                                frame.reason
                            )))
                            .await;
                    }
                    break;
                }
                Ok(Message::Text(text)) => {
                    debug!(len = text.len(), "ignoring text frame from upstream");
                }
                Ok(_) => {}
                Err(e) => {
                    let _ = in_tx.send(UpstreamInbound::Error(e.to_string())).await;
                    break;
                }
            }
        }
        debug!("upstream reader finished");
    });

    Ok(UpstreamChannel {
        outbound: out_tx,
        inbound: in_rx,
    })
}
