//! Per-connection session bridge.
//!
//! A [`SessionBridge`] owns everything one browser connection needs: its
//! identity, the state machine, and at most one upstream socket. All inputs
//! arrive through `&mut self` calls made by a single driver task, so no locks
//! are needed. Background work (connecting, reading the upstream socket, the
//! stop grace timer) reports back through an internal [`BridgeEvent`] channel
//! tagged with the upstream generation; events from a superseded socket are
//! ignored.
//!
//! ```text
//!            start            upstream open          stop           grace / close
//!   Idle ─────────────▶ Starting ─────────▶ Streaming ──────▶ Stopping ─────────▶ Idle
//!     ▲                    │  connect failed / timeout                │
//!     └────────────────────┘◀─────────── upstream error / close ──────┘
//! ```

use asr_core::codec::{decode_payload_offloaded, encode_frame_offloaded, flags};
use asr_core::{
    audio_only_request, build_auth_headers, decode_by_serialization, decode_error_packet,
    decode_server_frame, extract_transcript, AsrError, AsrResult, AuthParams, ClientMessage,
    Compression, FrameHeader, MessageType, Serialization, ServerEvent, SessionParams,
    UNAUTHORIZED_CLOSE_CODE, UNAUTHORIZED_REASON,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::identity::Identity;
use crate::settings::SettingsProvider;
use crate::upstream::{
    UpstreamChannel, UpstreamCommand, UpstreamConnector, UpstreamInbound, UpstreamRequest,
};

pub const STREAM_NOT_STARTED: &str = "stream not started";
pub const BACKLOG_FULL: &str = "upstream backlog full";

/// Tunables shared by every bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub stop_grace: Duration,
    pub connect_timeout: Duration,
    pub upstream_queue_depth: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_millis(1500),
            connect_timeout: Duration::from_secs(10),
            upstream_queue_depth: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Starting,
    Streaming,
    Stopping,
    Closed,
}

/// Something the driver must deliver to the client socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Event(ServerEvent),
    Close { code: u16, reason: String },
}

impl Outbound {
    pub fn unauthorized() -> Self {
        Outbound::Close {
            code: UNAUTHORIZED_CLOSE_CODE,
            reason: UNAUTHORIZED_REASON.to_string(),
        }
    }
}

/// Report from a background task, tagged with the upstream generation.
#[derive(Debug)]
pub enum BridgeEvent {
    UpstreamOpened {
        generation: u64,
        outbound: mpsc::Sender<UpstreamCommand>,
    },
    UpstreamFailed {
        generation: u64,
        error: String,
    },
    UpstreamFrame {
        generation: u64,
        data: Vec<u8>,
    },
    UpstreamClosed {
        generation: u64,
        reason: Option<String>,
    },
    GraceElapsed {
        generation: u64,
    },
}

impl BridgeEvent {
    fn generation(&self) -> u64 {
        match self {
            BridgeEvent::UpstreamOpened { generation, .. }
            | BridgeEvent::UpstreamFailed { generation, .. }
            | BridgeEvent::UpstreamFrame { generation, .. }
            | BridgeEvent::UpstreamClosed { generation, .. }
            | BridgeEvent::GraceElapsed { generation } => *generation,
        }
    }
}

/// The upstream socket owned by this bridge.
struct UpstreamLink {
    generation: u64,
    compression: Compression,
    /// Handshake parameters, consumed when the socket opens.
    params: Option<SessionParams>,
    /// `None` until the socket is open.
    outbound: Option<mpsc::Sender<UpstreamCommand>>,
    task: JoinHandle<()>,
}

pub struct SessionBridge {
    identity: Identity,
    state: BridgeState,
    config: BridgeConfig,
    settings: Arc<dyn SettingsProvider>,
    connector: Arc<dyn UpstreamConnector>,
    client: mpsc::UnboundedSender<Outbound>,
    events: mpsc::UnboundedSender<BridgeEvent>,
    generation: u64,
    upstream: Option<UpstreamLink>,
    grace_timer: Option<JoinHandle<()>>,
}

impl SessionBridge {
    /// Create a bridge. The returned receiver must be polled by the driver and
    /// each event passed to [`SessionBridge::handle_event`].
    pub fn new(
        identity: Identity,
        settings: Arc<dyn SettingsProvider>,
        connector: Arc<dyn UpstreamConnector>,
        config: BridgeConfig,
        client: mpsc::UnboundedSender<Outbound>,
    ) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let bridge = Self {
            identity,
            state: BridgeState::Idle,
            config,
            settings,
            connector,
            client,
            events,
            generation: 0,
            upstream: None,
            grace_timer: None,
        };
        (bridge, events_rx)
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Handle a JSON control message from the client.
    pub async fn handle_client_text(&mut self, text: &str) {
        if !self.check_authorized() {
            return;
        }
        let message = match ClientMessage::parse(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(user_id = %self.identity.user_id, error = %e, "bad control message");
                self.emit_error(e.to_string());
                return;
            }
        };

        match message {
            ClientMessage::Ping => self.emit(ServerEvent::Pong),
            ClientMessage::Start {
                language,
                mime_type,
                sample_rate,
            } => self.start(language, mime_type, sample_rate),
            ClientMessage::Audio { payload } => match BASE64.decode(payload.as_bytes()) {
                Ok(audio) => self.send_audio(audio).await,
                Err(e) => self.emit_error(format!("invalid audio payload: {e}")),
            },
            ClientMessage::Stop => self.stop().await,
        }
    }

    /// Handle a binary client message: a raw audio chunk.
    pub async fn handle_client_audio(&mut self, audio: Vec<u8>) {
        if !self.check_authorized() {
            return;
        }
        self.send_audio(audio).await;
    }

    /// Handle a report from one of this bridge's background tasks.
    pub async fn handle_event(&mut self, event: BridgeEvent) {
        let current = self.upstream.as_ref().map(|link| link.generation);
        if current != Some(event.generation()) {
            debug!(generation = event.generation(), "ignoring event from stale upstream");
            return;
        }

        match event {
            BridgeEvent::UpstreamOpened { outbound, .. } => self.on_upstream_opened(outbound).await,
            BridgeEvent::UpstreamFailed { error, .. } => {
                warn!(user_id = %self.identity.user_id, error = %error, "upstream connect failed");
                self.reset_upstream();
                self.emit_error(format!("upstream connection failed: {error}"));
            }
            BridgeEvent::UpstreamFrame { data, .. } => self.on_upstream_frame(data).await,
            BridgeEvent::UpstreamClosed { reason, .. } => {
                let expected = self.state == BridgeState::Stopping && reason.is_none();
                self.reset_upstream();
                if expected {
                    debug!(user_id = %self.identity.user_id, "upstream finished");
                } else {
                    warn!(user_id = %self.identity.user_id, reason = ?reason, "upstream closed");
                    self.emit_error(match reason {
                        Some(reason) => format!("upstream connection closed: {reason}"),
                        None => "upstream connection closed".to_string(),
                    });
                }
            }
            BridgeEvent::GraceElapsed { .. } => {
                debug!(user_id = %self.identity.user_id, "stop grace elapsed, closing upstream");
                self.reset_upstream();
            }
        }
    }

    /// Client went away: cancel pending work and close the upstream socket.
    pub fn shutdown(&mut self) {
        if self.state != BridgeState::Closed {
            debug!(user_id = %self.identity.user_id, state = ?self.state, "bridge shut down");
        }
        self.teardown_upstream();
        self.state = BridgeState::Closed;
    }

    fn start(&mut self, language: Option<String>, mime_type: Option<String>, sample_rate: Option<u32>) {
        match self.state {
            BridgeState::Streaming => {
                debug!(user_id = %self.identity.user_id, "start while streaming");
                self.emit(ServerEvent::Started);
                return;
            }
            BridgeState::Starting => {
                debug!(user_id = %self.identity.user_id, "start already in progress");
                return;
            }
            BridgeState::Stopping => self.reset_upstream(),
            BridgeState::Idle => {}
            BridgeState::Closed => return,
        }

        let settings = match self.settings.upstream_settings() {
            Ok(settings) => settings,
            Err(e) => {
                warn!(user_id = %self.identity.user_id, error = %e, "cannot start session");
                self.emit_error(e.to_string());
                return;
            }
        };

        self.generation += 1;
        let generation = self.generation;
        let connect_id = Uuid::new_v4().to_string();
        let request_id = Uuid::new_v4().to_string();
        let headers = build_auth_headers(&AuthParams {
            app_id: &settings.app_id,
            access_key: &settings.access_key,
            resource_id: &settings.resource_id,
            connect_id: Some(&connect_id),
            app_key: settings.app_key.as_deref(),
            request_id: Some(&request_id),
        })
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();

        let params = SessionParams::new(
            self.identity.user_id.clone(),
            language,
            mime_type.as_deref(),
            sample_rate,
            settings.model_name.clone(),
        );
        info!(
            user_id = %self.identity.user_id,
            connect_id = %connect_id,
            generation,
            format = params.format.format,
            rate = params.sample_rate,
            "opening upstream session"
        );

        let connecting = self.connector.connect(UpstreamRequest {
            endpoint: settings.endpoint,
            headers,
            queue_depth: self.config.upstream_queue_depth,
        });
        let task = tokio::spawn(pump_upstream(
            connecting,
            self.config.connect_timeout,
            generation,
            self.events.clone(),
        ));

        self.upstream = Some(UpstreamLink {
            generation,
            compression: settings.compression,
            params: Some(params),
            outbound: None,
            task,
        });
        self.state = BridgeState::Starting;
    }

    async fn on_upstream_opened(&mut self, outbound: mpsc::Sender<UpstreamCommand>) {
        if self.state != BridgeState::Starting {
            return;
        }
        let Some(link) = self.upstream.as_mut() else {
            return;
        };
        let Some(params) = link.params.take() else {
            return;
        };

        let handshake = match serde_json::to_vec(&params.request_payload()) {
            Ok(body) => {
                encode_frame_offloaded(
                    MessageType::FullClientRequest,
                    flags::NONE,
                    Serialization::Json,
                    link.compression,
                    Vec::new(),
                    body,
                )
                .await
            }
            Err(e) => Err(AsrError::from(e)),
        };
        let sent = match handshake {
            Ok(frame) => outbound
                .send(UpstreamCommand::Frame(frame))
                .await
                .map_err(|_| AsrError::Transport("upstream connection closed".into())),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(user_id = %self.identity.user_id, error = %e, "upstream handshake failed");
            self.reset_upstream();
            self.emit_error(e.to_string());
            return;
        }

        link.outbound = Some(outbound);
        self.state = BridgeState::Streaming;
        info!(user_id = %self.identity.user_id, "session started");
        self.emit(ServerEvent::Started);
    }

    async fn on_upstream_frame(&mut self, data: Vec<u8>) {
        let Some(header) = FrameHeader::parse(&data) else {
            debug!(len = data.len(), "dropping short upstream frame");
            return;
        };

        if header.message_type == MessageType::Error {
            match decode_error_packet(&data) {
                Some(packet) => {
                    let err = AsrError::Upstream {
                        code: packet.code,
                        message: packet.message,
                    };
                    warn!(user_id = %self.identity.user_id, error = %err, "upstream reported error");
                    self.emit_error(err.to_string());
                }
                None => debug!(len = data.len(), "dropping malformed error packet"),
            }
            return;
        }

        if header.message_type != MessageType::FullServerResponse {
            debug!(message_type = ?header.message_type, "ignoring upstream frame");
            return;
        }

        let Some(frame) = decode_server_frame(&data) else {
            debug!(len = data.len(), "dropping malformed upstream frame");
            return;
        };
        let raw = match decode_payload_offloaded(frame.payload, header.compression).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, "dropping undecodable upstream payload");
                return;
            }
        };
        let payload = decode_by_serialization(&raw, header.serialization);
        let Some(json) = payload.as_json() else {
            return;
        };
        if let Some(transcript) = extract_transcript(json, header.is_last_packet()) {
            self.emit(ServerEvent::Transcript {
                text: transcript.text,
                is_final: transcript.is_final,
            });
        }
    }

    async fn send_audio(&mut self, audio: Vec<u8>) {
        let (outbound, compression) = match (&self.state, &self.upstream) {
            (
                BridgeState::Streaming,
                Some(UpstreamLink {
                    outbound: Some(outbound),
                    compression,
                    ..
                }),
            ) => (outbound.clone(), *compression),
            _ => {
                self.emit_error(STREAM_NOT_STARTED);
                return;
            }
        };

        let frame = match encode_frame_offloaded(
            MessageType::AudioOnlyRequest,
            flags::NONE,
            Serialization::None,
            compression,
            Vec::new(),
            audio,
        )
        .await
        {
            Ok(frame) => frame,
            Err(e) => {
                self.emit_error(e.to_string());
                return;
            }
        };

        match outbound.try_send(UpstreamCommand::Frame(frame)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(user_id = %self.identity.user_id, "upstream queue full, dropping audio chunk");
                self.emit_error(BACKLOG_FULL);
            }
            Err(TrySendError::Closed(_)) => {
                self.reset_upstream();
                self.emit_error("upstream connection closed");
            }
        }
    }

    async fn stop(&mut self) {
        let (outbound, compression) = match (&self.state, &self.upstream) {
            (
                BridgeState::Streaming,
                Some(UpstreamLink {
                    outbound: Some(outbound),
                    compression,
                    ..
                }),
            ) => (outbound.clone(), *compression),
            _ => {
                self.emit_error(STREAM_NOT_STARTED);
                return;
            }
        };

        let sent = match audio_only_request(&[], true, compression) {
            Ok(frame) => outbound
                .send(UpstreamCommand::Frame(frame))
                .await
                .map_err(|_| AsrError::Transport("upstream connection closed".into())),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.reset_upstream();
            self.emit_error(e.to_string());
            return;
        }

        self.state = BridgeState::Stopping;
        info!(user_id = %self.identity.user_id, "session stopping");
        self.schedule_grace();
    }

    fn schedule_grace(&mut self) {
        if let Some(timer) = self.grace_timer.take() {
            timer.abort();
        }
        let generation = self.generation;
        let delay = self.config.stop_grace;
        let events = self.events.clone();
        self.grace_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(BridgeEvent::GraceElapsed { generation });
        }));
    }

    /// Expired identities lose the connection.
    fn check_authorized(&mut self) -> bool {
        if self.state == BridgeState::Closed {
            return false;
        }
        if self.identity.is_expired() {
            info!(user_id = %self.identity.user_id, "identity expired, closing connection");
            self.emit_error(UNAUTHORIZED_REASON);
            let _ = self.client.send(Outbound::unauthorized());
            self.shutdown();
            return false;
        }
        true
    }

    fn reset_upstream(&mut self) {
        self.teardown_upstream();
        if self.state != BridgeState::Closed {
            self.state = BridgeState::Idle;
        }
    }

    fn teardown_upstream(&mut self) {
        if let Some(timer) = self.grace_timer.take() {
            timer.abort();
        }
        if let Some(link) = self.upstream.take() {
            if let Some(outbound) = link.outbound {
                let _ = outbound.try_send(UpstreamCommand::Close);
            }
            link.task.abort();
        }
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.client.send(Outbound::Event(event));
    }

    fn emit_error(&self, message: impl Into<String>) {
        self.emit(ServerEvent::error(message));
    }
}

impl Drop for SessionBridge {
    fn drop(&mut self) {
        self.teardown_upstream();
    }
}

/// Connect, then forward everything the socket produces as bridge events.
async fn pump_upstream(
    connecting: Pin<Box<dyn Future<Output = AsrResult<UpstreamChannel>> + Send + 'static>>,
    connect_timeout: Duration,
    generation: u64,
    events: mpsc::UnboundedSender<BridgeEvent>,
) {
    let channel = match tokio::time::timeout(connect_timeout, connecting).await {
        Ok(Ok(channel)) => channel,
        Ok(Err(e)) => {
            let _ = events.send(BridgeEvent::UpstreamFailed {
                generation,
                error: e.to_string(),
            });
            return;
        }
        Err(_) => {
            let _ = events.send(BridgeEvent::UpstreamFailed {
                generation,
                error: AsrError::Timeout.to_string(),
            });
            return;
        }
    };

    let UpstreamChannel {
        outbound,
        mut inbound,
    } = channel;
    if events
        .send(BridgeEvent::UpstreamOpened {
            generation,
            outbound,
        })
        .is_err()
    {
        return;
    }

    let reason = loop {
        match inbound.recv().await {
            Some(UpstreamInbound::Frame(data)) => {
                if events
                    .send(BridgeEvent::UpstreamFrame { generation, data })
                    .is_err()
                {
                    return;
                }
            }
            Some(UpstreamInbound::Error(e)) => break Some(e),
            None => break None,
        }
    };
    let _ = events.send(BridgeEvent::UpstreamClosed { generation, reason });
}
