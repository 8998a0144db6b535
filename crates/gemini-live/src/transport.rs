//! Manages the single bidirectional channel of a voice session.
//!
//! A [`Transport`] moves through `Connecting -> Open -> (Closed | Errored)` and
//! never leaves a terminal state; a new attempt needs a new transport. Outbound
//! sends never fail loudly: outside `Open` they are dropped with a warning,
//! since microphone frames routinely race the open and close edges.

use crate::protocol::{self, InboundEvent, SessionSetup};
use crate::types::ClientMessage;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use octn_core::tools::ToolResult;
use std::{sync::Arc, time::Duration};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, protocol::Message as WsMessage},
};
use tracing::{debug, error, info, warn};

const OUTBOUND_QUEUE: usize = 128;
const INBOUND_QUEUE: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    Closed,
    Errored,
}

impl TransportState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportState::Closed | TransportState::Errored)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to reach the live endpoint: {0}")]
    Connect(#[source] tungstenite::Error),
    #[error("setup handshake failed: {0}")]
    Handshake(String),
    #[error("timed out after {0:?} connecting and waiting for setup acknowledgment")]
    Timeout(Duration),
    #[error("channel closed before setup was acknowledged")]
    ClosedDuringSetup,
    #[error("failed to encode setup message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where to reach the live service.
#[derive(Clone)]
pub struct Endpoint {
    url: String,
    api_key: String,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
        }
    }

    fn request_url(&self) -> String {
        format!("{}?key={}", self.url, self.api_key)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Moves `state` to `next` unless it already reached a terminal state.
fn advance(state: &watch::Sender<TransportState>, next: TransportState) -> bool {
    state.send_if_modified(|current| {
        if current.is_terminal() || *current == next {
            false
        } else {
            *current = next;
            true
        }
    })
}

/// Handle to the channel owned by one session.
pub struct Transport {
    state: Arc<watch::Sender<TransportState>>,
    outbound: Option<mpsc::Sender<ClientMessage>>,
    io_task: Option<JoinHandle<()>>,
}

impl Transport {
    fn new(initial: TransportState) -> (Self, mpsc::Receiver<ClientMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (state, _) = watch::channel(initial);
        (
            Self {
                state: Arc::new(state),
                outbound: Some(tx),
                io_task: None,
            },
            rx,
        )
    }

    /// Connects, performs the setup handshake and starts the I/O task.
    ///
    /// `handshake_timeout` bounds the whole attempt, from the TCP/TLS connect to
    /// the server's acknowledgment. Inbound events, including the final
    /// `Closed`/`Errored`, are delivered on the returned receiver.
    pub async fn open(
        endpoint: &Endpoint,
        setup: &SessionSetup,
        handshake_timeout: Duration,
    ) -> Result<(Self, mpsc::Receiver<InboundEvent>), ConnectionError> {
        let (mut transport, outbound_rx) = Self::new(TransportState::Connecting);
        let setup_payload = serde_json::to_string(&setup.to_message())?;

        let (ws_tx, ws_rx, early) =
            tokio::time::timeout(handshake_timeout, connect_and_setup(endpoint, setup_payload))
                .await
                .map_err(|_| ConnectionError::Timeout(handshake_timeout))??;

        advance(&transport.state, TransportState::Open);
        info!("Gemini session setup is complete. Ready for bidirectional streaming.");

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE + early.len());
        for event in early {
            if let Err(e) = inbound_tx.try_send(event) {
                warn!(event = ?e.into_inner(), "Dropping event received during setup");
            }
        }
        transport.io_task = Some(tokio::spawn(run_io(
            ws_tx,
            ws_rx,
            outbound_rx,
            inbound_tx,
            transport.state.clone(),
        )));

        Ok((transport, inbound_rx))
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }

    /// Forwards one encoded 16 kHz PCM frame. Returns whether it was queued.
    pub fn send_audio(&self, pcm: &[u8]) -> bool {
        self.enqueue(protocol::realtime_audio(pcm), "audio frame")
    }

    /// Sends the answer to a tool invocation. Returns whether it was queued.
    pub fn send_tool_result(&self, result: &ToolResult) -> bool {
        let queued = self.enqueue(protocol::tool_response(result), "tool result");
        if queued {
            info!(id = %result.id, name = %result.name, "Tool result sent");
        }
        queued
    }

    fn enqueue(&self, msg: ClientMessage, kind: &'static str) -> bool {
        let state = self.state();
        if state != TransportState::Open {
            warn!(?state, kind, "Channel not open; dropping outbound message");
            return false;
        }
        let Some(tx) = &self.outbound else {
            warn!(kind, "Channel already closed; dropping outbound message");
            return false;
        };
        match tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(kind, "Outbound queue full; dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(kind, "Channel I/O task has stopped; dropping message");
                false
            }
        }
    }

    /// Ends the channel. Idempotent; later sends are no-ops.
    ///
    /// The I/O task flushes queued messages and a close frame in the
    /// background; use [`wait_closed`](Self::wait_closed) to wait for it.
    pub fn close(&mut self) {
        if self.outbound.take().is_some() {
            info!("Closing live channel.");
        }
        advance(&self.state, TransportState::Closed);
    }

    /// Closes the channel and waits up to `grace` for the I/O task to send the
    /// close frame and stop. The task is aborted if it overruns.
    pub async fn wait_closed(&mut self, grace: Duration) {
        self.close();
        let Some(mut task) = self.io_task.take() else {
            return;
        };
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => debug!("Channel I/O task finished"),
            Ok(Err(e)) => warn!(error = %e, "Channel I/O task failed"),
            Err(_) => {
                warn!(?grace, "Channel I/O task did not finish in time; aborting");
                task.abort();
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn connect_and_setup(
    endpoint: &Endpoint,
    setup_payload: String,
) -> Result<(WsSink, WsSource, Vec<InboundEvent>), ConnectionError> {
    let (ws_stream, _) = connect_async(endpoint.request_url())
        .await
        .map_err(ConnectionError::Connect)?;
    info!(url = %endpoint.url, "Connected to Gemini Live WebSocket.");
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    ws_tx
        .send(WsMessage::Text(setup_payload))
        .await
        .map_err(ConnectionError::Connect)?;

    let early = await_setup_complete(&mut ws_rx).await?;
    Ok((ws_tx, ws_rx, early))
}

/// Reads frames until `setupComplete`, keeping any other events for later.
async fn await_setup_complete(ws_rx: &mut WsSource) -> Result<Vec<InboundEvent>, ConnectionError> {
    let mut early = Vec::new();
    while let Some(frame) = ws_rx.next().await {
        let parsed = match frame.map_err(ConnectionError::Connect)? {
            WsMessage::Text(text) => protocol::parse_server_message(&text),
            WsMessage::Binary(bytes) => protocol::parse_server_bytes(&bytes),
            WsMessage::Close(frame) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                return Err(if reason.is_empty() {
                    ConnectionError::ClosedDuringSetup
                } else {
                    ConnectionError::Handshake(reason)
                });
            }
            _ => continue,
        };
        match parsed {
            Ok(events) => {
                for event in events {
                    if event == InboundEvent::SetupComplete {
                        return Ok(early);
                    }
                    early.push(event);
                }
            }
            Err(e) => error!(error = %e, "Failed to parse Gemini message during setup."),
        }
    }
    Err(ConnectionError::ClosedDuringSetup)
}

/// Pumps outbound messages to the socket and inbound frames to the session.
async fn run_io(
    mut ws_tx: WsSink,
    mut ws_rx: WsSource,
    mut outbound: mpsc::Receiver<ClientMessage>,
    inbound: mpsc::Sender<InboundEvent>,
    state: Arc<watch::Sender<TransportState>>,
) {
    let outcome: Result<Option<String>, String> = loop {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    let payload = match serde_json::to_string(&msg) {
                        Ok(payload) => payload,
                        Err(e) => {
                            error!(error = %e, "Failed to serialize outbound message");
                            continue;
                        }
                    };
                    if let Err(e) = ws_tx.send(WsMessage::Text(payload)).await {
                        break Err(e.to_string());
                    }
                }
                None => {
                    // The transport handle was closed or dropped.
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break Ok(None);
                }
            },
            frame = ws_rx.next() => {
                let parsed = match frame {
                    Some(Ok(WsMessage::Text(text))) => protocol::parse_server_message(&text),
                    Some(Ok(WsMessage::Binary(bytes))) => protocol::parse_server_bytes(&bytes),
                    Some(Ok(WsMessage::Close(frame))) => {
                        break Ok(frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty()));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Err(e.to_string()),
                    None => break Ok(None),
                };
                match parsed {
                    Ok(events) => {
                        for event in events {
                            if inbound.send(event).await.is_err() {
                                debug!("Session stopped listening; discarding inbound event");
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Ignoring unparseable server message"),
                }
            },
        }
    };

    let event = match outcome {
        Ok(reason) => {
            info!(?reason, "Gemini WebSocket connection closed.");
            advance(&state, TransportState::Closed);
            InboundEvent::Closed(reason)
        }
        Err(e) => {
            error!(error = %e, "Error on Gemini WebSocket.");
            advance(&state, TransportState::Errored);
            InboundEvent::Errored(e)
        }
    };
    let _ = inbound.send(event).await;
}

/// The remote end of an in-memory transport, for tests of code that consumes
/// transport events.
#[cfg(any(test, feature = "test-util"))]
pub struct Loopback {
    pub outbound: mpsc::Receiver<ClientMessage>,
    inbound: mpsc::Sender<InboundEvent>,
    state: Arc<watch::Sender<TransportState>>,
}

#[cfg(any(test, feature = "test-util"))]
impl Loopback {
    /// Acknowledges the setup, moving the transport to `Open`.
    pub fn acknowledge(&self) {
        advance(&self.state, TransportState::Open);
    }

    pub async fn deliver(&self, event: InboundEvent) {
        let _ = self.inbound.send(event).await;
    }

    /// Ends the channel from the remote side.
    pub async fn hang_up(&self, reason: Option<String>) {
        advance(&self.state, TransportState::Closed);
        self.deliver(InboundEvent::Closed(reason)).await;
    }

    pub fn transport_state(&self) -> TransportState {
        *self.state.borrow()
    }
}

/// Creates a transport in `Connecting` wired to an in-memory remote end.
#[cfg(any(test, feature = "test-util"))]
pub fn loopback() -> (Transport, mpsc::Receiver<InboundEvent>, Loopback) {
    let (transport, outbound) = Transport::new(TransportState::Connecting);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let remote = Loopback {
        outbound,
        inbound: inbound_tx,
        state: transport.state.clone(),
    };
    (transport, inbound_rx, remote)
}
