//! Realtime stream client.
//!
//! Keeps one WebSocket open to the push endpoint and turns its text frames
//! into [`RealtimeEvent`]s. A background supervisor owns the connection:
//!
//! ```text
//! connecting ──ok──→ open ──close/error──→ closed-retrying ──delay──→ connecting
//!      └──────────fail/timeout/no token─────────┘
//! any state ──teardown──→ stopped
//! ```
//!
//! Each attempt reads the current access token from the [`CredentialStore`]
//! and passes it as the `token` query parameter, so a token renewed by the
//! gateway is picked up on the next reconnect. Frames that cannot be
//! understood are delivered as [`RealtimeEvent::RefreshRequested`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use taskman_proto::realtime::{self, RealtimeEvent};

use crate::credentials::CredentialStore;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Delay between a closed connection and the next attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Upper bound on a single connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Capacity of the outgoing message queue.
const OUTGOING_BUFFER: usize = 64;

/// Lifecycle of the realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// An attempt is in progress.
    Connecting,
    /// The connection is established; frames flow.
    Open,
    /// The last connection closed or failed; the next attempt is scheduled.
    ClosedRetrying,
    /// Torn down. Terminal.
    Stopped,
}

/// Settings for a [`RealtimeClient`].
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Push endpoint (`ws://` or `wss://`), without the token.
    pub endpoint: String,
    /// Delay before reconnecting after a closure.
    pub reconnect_delay: Duration,
    /// Timeout for a single connection attempt.
    pub connect_timeout: Duration,
    /// Capacity of the event channel.
    pub event_buffer: usize,
}

impl RealtimeConfig {
    /// Settings for `endpoint` with default timings.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// Why a connection attempt did not produce an open connection.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// The endpoint is not a valid URL.
    #[error("invalid realtime endpoint: {0}")]
    InvalidEndpoint(String),

    /// There is no access token to authenticate the connection with.
    #[error("no access credential")]
    NoCredential,

    /// The attempt did not finish within the connect timeout.
    #[error("connection attempt timed out")]
    Timeout,

    /// The WebSocket handshake failed.
    #[error("connection failed: {0}")]
    Connect(String),
}

/// Handle on a supervised realtime connection.
///
/// Dropping the handle tears the connection down.
pub struct RealtimeClient {
    state: watch::Receiver<ConnectionState>,
    outgoing: mpsc::Sender<String>,
    shutdown: watch::Sender<bool>,
}

/// The typed event subscription of a [`RealtimeClient`].
///
/// Events arrive in the order the server sent them. The subscription ends
/// once the client has been torn down.
pub struct RealtimeEvents {
    rx: mpsc::Receiver<RealtimeEvent>,
}

impl RealtimeEvents {
    /// Wait for the next event. Returns `None` after teardown.
    pub async fn next(&mut self) -> Option<RealtimeEvent> {
        self.rx.recv().await
    }

    /// Hand every event to `handler`, one at a time, on a background task.
    pub fn on_event<F>(mut self, mut handler: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut(RealtimeEvent) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(event) = self.rx.recv().await {
                handler(event);
            }
        })
    }
}

impl RealtimeClient {
    /// Start the connection supervisor.
    ///
    /// Returns immediately in [`ConnectionState::Connecting`]; the first
    /// attempt runs in the background. Must be called within a tokio runtime.
    pub fn connect(
        config: RealtimeConfig,
        credentials: Arc<CredentialStore>,
    ) -> (Self, RealtimeEvents) {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(supervise(Supervisor {
            config,
            credentials,
            events: events_tx,
            outgoing: outgoing_rx,
            state: state_tx,
            shutdown: shutdown_rx,
        }));

        (
            Self {
                state: state_rx,
                outgoing: outgoing_tx,
                shutdown: shutdown_tx,
            },
            RealtimeEvents { rx: events_rx },
        )
    }

    /// The current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Send a JSON message over the open connection.
    ///
    /// Best-effort: returns `false` and drops the message unless the
    /// connection is open. A message queued just before the connection
    /// closes is discarded, never replayed on the next connection.
    pub fn send(&self, message: &impl Serialize) -> bool {
        if self.state() != ConnectionState::Open {
            tracing::debug!("realtime connection not open, dropping outgoing message");
            return false;
        }
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(err = %e, "could not encode outgoing realtime message");
                return false;
            }
        };
        self.outgoing.try_send(text).is_ok()
    }

    /// Stop reconnecting and close the active connection. Idempotent.
    pub fn teardown(&self) {
        if !self.shutdown.send_replace(true) {
            tracing::info!("realtime client torn down");
        }
    }

    /// Wait until the supervisor has stopped.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        // An error means the supervisor is gone, which is also stopped.
        let _ = state.wait_for(|s| *s == ConnectionState::Stopped).await;
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// How an open connection ended.
enum ConnectionEnd {
    Shutdown,
    SubscriberGone,
    Closed(String),
}

struct Supervisor {
    config: RealtimeConfig,
    credentials: Arc<CredentialStore>,
    events: mpsc::Sender<RealtimeEvent>,
    outgoing: mpsc::Receiver<String>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Receiver<bool>,
}

async fn supervise(mut sv: Supervisor) {
    loop {
        if *sv.shutdown.borrow() {
            break;
        }
        sv.state.send_replace(ConnectionState::Connecting);

        let attempt = tokio::select! {
            biased;
            () = stopped(&mut sv.shutdown) => break,
            attempt = open_connection(&sv.config, &sv.credentials) => attempt,
        };

        match attempt {
            Ok(stream) => {
                // Anything queued for an earlier connection is stale.
                while sv.outgoing.try_recv().is_ok() {}
                sv.state.send_replace(ConnectionState::Open);
                tracing::info!(endpoint = %sv.config.endpoint, "realtime connection open");

                match run_connection(stream, &sv.events, &mut sv.outgoing, &mut sv.shutdown).await {
                    ConnectionEnd::Shutdown => break,
                    ConnectionEnd::SubscriberGone => {
                        tracing::debug!("event subscriber dropped, stopping realtime client");
                        break;
                    }
                    ConnectionEnd::Closed(reason) => {
                        tracing::info!(reason = %reason, "realtime connection closed");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(endpoint = %sv.config.endpoint, err = %e, "realtime connection attempt failed");
            }
        }

        sv.state.send_replace(ConnectionState::ClosedRetrying);
        tracing::debug!(delay = ?sv.config.reconnect_delay, "scheduling realtime reconnect");
        tokio::select! {
            biased;
            () = stopped(&mut sv.shutdown) => break,
            () = tokio::time::sleep(sv.config.reconnect_delay) => {}
        }
    }

    sv.state.send_replace(ConnectionState::Stopped);
    tracing::debug!("realtime supervisor exiting");
}

/// Resolves once teardown was requested or the client handle is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn open_connection(
    config: &RealtimeConfig,
    credentials: &CredentialStore,
) -> Result<WsStream, RealtimeError> {
    let token = credentials.access_token().ok_or(RealtimeError::NoCredential)?;
    let url = endpoint_with_token(&config.endpoint, &token)?;

    let (stream, _response) = tokio::time::timeout(config.connect_timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| RealtimeError::Timeout)?
        .map_err(|e| RealtimeError::Connect(e.to_string()))?;
    Ok(stream)
}

/// Append (or replace) the `token` query parameter on `endpoint`.
///
/// # Errors
///
/// Returns [`RealtimeError::InvalidEndpoint`] if `endpoint` does not parse.
pub fn endpoint_with_token(endpoint: &str, token: &str) -> Result<url::Url, RealtimeError> {
    let mut url =
        url::Url::parse(endpoint).map_err(|e| RealtimeError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "token")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("token", token);
    Ok(url)
}

/// Pump one open connection until it closes or teardown is requested.
///
/// Frames are classified and forwarded strictly in arrival order; the next
/// frame is not read until the previous event has been accepted.
async fn run_connection(
    stream: WsStream,
    events: &mpsc::Sender<RealtimeEvent>,
    outgoing: &mut mpsc::Receiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionEnd {
    let (mut sink, mut reader) = stream.split();

    loop {
        tokio::select! {
            biased;
            () = stopped(shutdown) => {
                let _ = sink.send(Message::Close(None)).await;
                return ConnectionEnd::Shutdown;
            }
            frame = reader.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                    Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(&data).into_owned(),
                    Some(Ok(Message::Close(_))) => {
                        return ConnectionEnd::Closed("closed by server".to_string());
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                    Some(Err(e)) => return ConnectionEnd::Closed(e.to_string()),
                    None => return ConnectionEnd::Closed("stream ended".to_string()),
                };

                let (event, err) = realtime::classify(&text);
                if let Some(e) = err {
                    tracing::warn!(err = %e, "unrecognized realtime frame, requesting full refresh");
                }
                tokio::select! {
                    biased;
                    () = stopped(shutdown) => return ConnectionEnd::Shutdown,
                    sent = events.send(event) => {
                        if sent.is_err() {
                            return ConnectionEnd::SubscriberGone;
                        }
                    }
                }
            }
            Some(text) = outgoing.recv() => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    return ConnectionEnd::Closed(format!("send failed: {e}"));
                }
            }
        }
    }
}
