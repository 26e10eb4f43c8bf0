//! WebSocket signaling transport.
//!
//! Connects to the signaling server, relays outbound signal frames, and turns
//! inbound frames into [`TransportEvent`]s:
//! - `connected` assigns this endpoint's peer id
//! - `roster` (or `users`) replaces the known peer list
//! - `signal` carries an offer, answer or ICE candidate from another peer
//!
//! Reconnection with exponential backoff and ping/pong heartbeats are handled
//! here; the coordinator never reconnects on its own.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use protocol::{ClientEvent, ProtocolError, Result, ServerEvent};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::transport::{SignalingTransport, TransportEvent, TransportState};
use super::BoxFuture;

/// Default reconnection settings.
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 30_000;
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Shortest heartbeat interval accepted; a zero period would stall the timer.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Default signaling server URL.
pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:3000";

/// Configuration for the WebSocket transport.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// The WebSocket URL of the signaling server.
    pub server_url: String,
    /// Initial backoff duration for reconnection.
    pub initial_backoff: Duration,
    /// Maximum backoff duration for reconnection.
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to automatically reconnect on disconnect.
    pub auto_reconnect: bool,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Timeout for heartbeat pong response.
    pub heartbeat_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SIGNALING_URL.to_string(),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            backoff_multiplier: BACKOFF_MULTIPLIER,
            auto_reconnect: true,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
        }
    }
}

impl WebSocketConfig {
    /// Creates a new configuration with the specified server URL.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    /// Sets whether to automatically reconnect on disconnect.
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Sets the initial backoff duration.
    pub fn with_initial_backoff(mut self, duration: Duration) -> Self {
        self.initial_backoff = duration;
        self
    }

    /// Sets the maximum backoff duration.
    pub fn with_max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff = duration;
        self
    }

    /// Sets the heartbeat interval, raised to [`MIN_HEARTBEAT_INTERVAL`] if shorter.
    pub fn with_heartbeat_interval(mut self, duration: Duration) -> Self {
        self.heartbeat_interval = duration.max(MIN_HEARTBEAT_INTERVAL);
        self
    }
}

/// Internal state for the WebSocket transport.
struct ClientState {
    /// Current connection state.
    connection_state: TransportState,
    /// Sender for outgoing frames while a socket is open.
    message_tx: Option<mpsc::Sender<ClientEvent>>,
    /// Current backoff duration for reconnection.
    current_backoff: Duration,
    /// Cancelled by `disconnect`; `None` while no connection loop runs.
    shutdown: Option<CancellationToken>,
    /// Bumped on every `connect`; identifies the loop that owns `shutdown`.
    generation: u64,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            connection_state: TransportState::Disconnected,
            message_tx: None,
            current_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            shutdown: None,
            generation: 0,
        }
    }
}

struct Inner {
    config: WebSocketConfig,
    state: RwLock<ClientState>,
    event_tx: mpsc::Sender<TransportEvent>,
}

/// WebSocket-based signaling transport.
pub struct WebSocketTransport {
    inner: Arc<Inner>,
    /// Receiver for events (returned by events()).
    event_rx: std::sync::Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl WebSocketTransport {
    /// Creates a new WebSocket transport. Nothing connects until `connect`.
    pub fn new(config: WebSocketConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            inner: Arc::new(Inner {
                config,
                state: RwLock::new(ClientState::default()),
                event_tx,
            }),
            event_rx: std::sync::Mutex::new(Some(event_rx)),
        }
    }
}

impl Inner {
    /// Updates the connection state. No-op when unchanged.
    async fn set_state(&self, new_state: TransportState) {
        let mut state = self.state.write().await;
        if state.connection_state != new_state {
            tracing::debug!(state = ?new_state, "signaling transport state changed");
            state.connection_state = new_state;
        }
    }

    async fn emit_event(&self, event: TransportEvent) {
        if let Err(e) = self.event_tx.send(event).await {
            tracing::warn!(error = %e, "Failed to send transport event - receiver may be dropped");
        }
    }

    /// Sends an outgoing frame to the signaling server.
    async fn send_message(&self, message: ClientEvent) -> Result<()> {
        let state = self.state.read().await;
        if let Some(ref tx) = state.message_tx {
            tx.send(message).await.map_err(|e| {
                ProtocolError::TransferFailed(format!("failed to send message: {}", e))
            })?;
            Ok(())
        } else {
            Err(ProtocolError::ConnectionClosed(
                "not connected to signaling server".to_string(),
            ))
        }
    }

    /// Maps a server frame onto a transport event.
    fn translate(frame: ServerEvent) -> TransportEvent {
        match frame {
            ServerEvent::Connected(id) => TransportEvent::Connected(id),
            ServerEvent::Signal(value) => TransportEvent::Signal(value),
            ServerEvent::Roster(peers) => TransportEvent::Roster(peers),
        }
    }

    /// Validates the configured server URL.
    fn server_url(&self) -> Result<String> {
        let url = self.config.server_url.trim_end_matches('/').to_string();
        Url::parse(&url)
            .map_err(|e| ProtocolError::ConnectionClosed(format!("invalid signaling URL: {}", e)))?;
        Ok(url)
    }

    /// Runs the connection loop with reconnection support.
    async fn run_connection_loop(self: Arc<Self>, shutdown: CancellationToken, generation: u64) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.set_state(TransportState::Connecting).await;

            match self.connect_internal().await {
                Ok((message_tx, mut ws_rx, control_tx, last_pong)) => {
                    {
                        let mut state = self.state.write().await;
                        if state.generation != generation {
                            break;
                        }
                        state.message_tx = Some(message_tx);
                        state.current_backoff = self.config.initial_backoff;
                    }
                    self.set_state(TransportState::Connected).await;
                    self.emit_event(TransportEvent::Connect).await;

                    let period = self.config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
                    let mut heartbeat_interval = tokio::time::interval(period);
                    // Skip the first immediate tick
                    heartbeat_interval.tick().await;

                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = heartbeat_interval.tick() => {
                                let last_pong_time = *last_pong.read().await;
                                if last_pong_time.elapsed() > self.config.heartbeat_timeout + period {
                                    tracing::warn!("Heartbeat timeout, reconnecting...");
                                    break;
                                }

                                if let Err(e) = control_tx.send(WsMessage::Ping(vec![])).await {
                                    tracing::error!("Failed to send ping: {}", e);
                                    break;
                                }
                                tracing::debug!("Sent heartbeat ping");
                            }
                            Some(result) = ws_rx.recv() => {
                                match result {
                                    Ok(frame) => self.emit_event(Self::translate(frame)).await,
                                    Err(e) => {
                                        tracing::error!("signaling receive error: {}", e);
                                        break;
                                    }
                                }
                            }
                            else => break,
                        }
                    }

                    {
                        let mut state = self.state.write().await;
                        if state.generation == generation {
                            state.message_tx = None;
                        }
                    }
                    self.emit_event(TransportEvent::Disconnected).await;
                }
                Err(e) => {
                    tracing::error!("signaling connection failed: {}", e);
                }
            }

            if !self.config.auto_reconnect || shutdown.is_cancelled() {
                break;
            }

            // Apply exponential backoff
            let backoff = {
                let mut state = self.state.write().await;
                let backoff = state.current_backoff;
                state.current_backoff = std::cmp::min(
                    Duration::from_secs_f64(
                        state.current_backoff.as_secs_f64() * self.config.backoff_multiplier,
                    ),
                    self.config.max_backoff,
                );
                backoff
            };

            self.set_state(TransportState::Reconnecting).await;
            tracing::info!("reconnecting in {:?}", backoff);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        self.finish_loop(generation).await;
    }

    /// Clears the running-loop fields, unless a newer `connect` already
    /// replaced this loop.
    async fn finish_loop(&self, generation: u64) {
        let mut state = self.state.write().await;
        if state.generation != generation {
            tracing::debug!(generation, "stale connection loop exited");
            return;
        }
        state.message_tx = None;
        state.shutdown = None;
        if state.connection_state != TransportState::Disconnected {
            tracing::debug!(state = ?TransportState::Disconnected, "signaling transport state changed");
            state.connection_state = TransportState::Disconnected;
        }
    }

    /// Internal connection establishment.
    ///
    /// Returns:
    /// - Sender for outgoing frames
    /// - Receiver for incoming frames
    /// - Sender for WebSocket control frames (ping)
    /// - Shared timestamp of last pong received
    async fn connect_internal(
        &self,
    ) -> Result<(
        mpsc::Sender<ClientEvent>,
        mpsc::Receiver<Result<ServerEvent>>,
        mpsc::Sender<WsMessage>,
        Arc<RwLock<Instant>>,
    )> {
        let ws_url = self.server_url()?;

        tracing::info!("Connecting to signaling server: {}", ws_url);

        let (ws_stream, _) = connect_async(&ws_url).await.map_err(|e| match e {
            WsError::Io(io_err) => ProtocolError::from(io_err),
            _ => ProtocolError::ConnectionClosed(format!("WebSocket connection failed: {}", e)),
        })?;

        let (mut ws_sink, mut ws_stream) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ClientEvent>(256);
        let (incoming_tx, incoming_rx) = mpsc::channel::<Result<ServerEvent>>(256);
        let (control_tx, mut control_rx) = mpsc::channel::<WsMessage>(16);

        // Initialized to now for grace period
        let last_pong = Arc::new(RwLock::new(Instant::now()));
        let last_pong_writer = last_pong.clone();

        // Writer: outgoing frames and control frames
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(msg) = outgoing_rx.recv() => {
                        match msg.to_json() {
                            Ok(json) => {
                                if let Err(e) = ws_sink.send(WsMessage::Text(json)).await {
                                    tracing::error!("failed to send WebSocket message: {}", e);
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::error!("failed to serialize message: {}", e);
                            }
                        }
                    }
                    Some(control_msg) = control_rx.recv() => {
                        if let Err(e) = ws_sink.send(control_msg).await {
                            tracing::error!("failed to send WebSocket control frame: {}", e);
                            break;
                        }
                    }
                    else => break,
                }
            }
            let _ = ws_sink.close().await;
        });

        // Reader: incoming frames
        tokio::spawn(async move {
            while let Some(result) = ws_stream.next().await {
                match result {
                    Ok(WsMessage::Text(text)) => match ServerEvent::from_json(&text) {
                        Ok(frame) => {
                            if incoming_tx.send(Ok(frame)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                "failed to parse signaling frame: {} (raw: {})",
                                e,
                                text
                            );
                        }
                    },
                    Ok(WsMessage::Pong(_)) => {
                        *last_pong_writer.write().await = Instant::now();
                        tracing::debug!("Received heartbeat pong");
                    }
                    Ok(WsMessage::Close(_)) => {
                        let _ = incoming_tx
                            .send(Err(ProtocolError::ConnectionClosed(
                                "server closed connection".to_string(),
                            )))
                            .await;
                        break;
                    }
                    Err(e) => {
                        let _ = incoming_tx
                            .send(Err(ProtocolError::ConnectionClosed(format!(
                                "WebSocket error: {}",
                                e
                            ))))
                            .await;
                        break;
                    }
                    _ => {
                        // Ignore ping/binary messages
                    }
                }
            }
        });

        Ok((outgoing_tx, incoming_rx, control_tx, last_pong))
    }
}

impl SignalingTransport for WebSocketTransport {
    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let (shutdown, generation) = {
                let mut state = self.inner.state.write().await;
                if state.shutdown.is_some() {
                    tracing::debug!("signaling transport already running");
                    return Ok(());
                }
                let token = CancellationToken::new();
                state.shutdown = Some(token.clone());
                state.generation += 1;
                (token, state.generation)
            };

            // Fail fast on a bad URL instead of spinning in the retry loop.
            if let Err(e) = self.inner.server_url() {
                self.inner.state.write().await.shutdown = None;
                return Err(e);
            }

            let inner = Arc::clone(&self.inner);
            tokio::spawn(inner.run_connection_loop(shutdown, generation));
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.inner.state.write().await;
            if let Some(token) = state.shutdown.take() {
                token.cancel();
            }
            state.message_tx = None;
            state.connection_state = TransportState::Disconnected;
            Ok(())
        })
    }

    fn emit(&self, event: ClientEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.inner.send_message(event))
    }

    fn state(&self) -> TransportState {
        // Since we can't await in a sync function, we use try_read
        match self.inner.state.try_read() {
            Ok(state) => state.connection_state,
            Err(_) => TransportState::Disconnected,
        }
    }

    fn events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        match self.event_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        }
    }
}
