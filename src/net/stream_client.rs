// Tracking stream client
// Handshake with the tracking source, then read ticks off a persistent stream
//
// The client never reconnects on its own. When the stream drops it reports
// `Disconnected` and stays there until someone calls `connect` again.

use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use super::connection::Connection;
use super::messages::{parse_stream_line, ClientCommand, HandshakeRequest, HandshakeResponse, STATUS_OK};
use crate::constants::{EVENT_CHANNEL_CAPACITY, HANDSHAKE_TIMEOUT_SECS};
use crate::error::{HandshakeError, NavError, Result, StreamError};
use crate::pose::TrackingTick;
use crate::stats::RateStats;

/// Lifecycle of the connection to the tracking source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Streaming,
}

/// Published to every subscriber
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Tick(Arc<TrackingTick>),
    ConnectionState {
        state: ConnectionState,
        /// Why the connection ended, when it ended on its own
        reason: Option<String>,
    },
}

/// What a client asks the tracking source for
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDescriptor {
    pub case_id: String,
    pub tools: Vec<String>,
    pub frequency_hz: f64,
}

/// Result of a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedSession {
    pub stream_address: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub ticks_received: u64,
    pub malformed_dropped: u64,
    pub arrival_rate_hz: f64,
}

/// State shared with the background reader task
struct Shared {
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<StreamEvent>,
    arrivals: Mutex<RateStats>,
    malformed: AtomicU64,
    /// Bumped by `disconnect`; a task holding an older epoch is stale
    epoch: AtomicU64,
    cancel: Notify,
}

impl Shared {
    fn publish_state(&self, state: ConnectionState, reason: Option<String>) {
        let _ = self.events.send(StreamEvent::ConnectionState { state, reason });
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Move to `state` only if nothing disconnected us in the meantime.
    ///
    /// State events are published under the state lock so subscribers see
    /// them in the order the state changed.
    fn transition(&self, epoch: u64, state: ConnectionState, reason: Option<String>) -> bool {
        let mut current = self.state.lock();
        if !self.is_current(epoch) {
            return false;
        }
        *current = state;
        self.publish_state(state, reason);
        true
    }

    /// Handle one inbound stream line. Malformed lines are logged and dropped.
    /// Returns false once the stream belongs to a closed connection.
    fn handle_line(&self, epoch: u64, line: &str) -> bool {
        match parse_stream_line(line) {
            Ok(Some(tick)) => {
                // A tick is published only while its connection is current,
                // so none can follow the `Disconnected` event
                let _state = self.state.lock();
                if !self.is_current(epoch) {
                    return false;
                }
                self.arrivals.lock().record(Instant::now());
                // No subscribers is fine
                let _ = self.events.send(StreamEvent::Tick(Arc::new(tick)));
                true
            }
            Ok(None) => {
                debug!("Non-tick message on stream");
                self.is_current(epoch)
            }
            Err(e) => self.drop_malformed(epoch, &e),
        }
    }

    fn drop_malformed(&self, epoch: u64, error: &dyn std::fmt::Display) -> bool {
        if !self.is_current(epoch) {
            return false;
        }
        self.malformed.fetch_add(1, Ordering::Relaxed);
        warn!(error = %error, "Dropping malformed tick");
        true
    }
}

/// Client side of the tracking-source protocol.
pub struct TrackingStreamClient {
    shared: Arc<Shared>,
    handshake_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
    session_id: Mutex<Option<String>>,
}

impl Default for TrackingStreamClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(HANDSHAKE_TIMEOUT_SECS))
    }
}

impl TrackingStreamClient {
    pub fn new(handshake_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        TrackingStreamClient {
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Disconnected),
                events,
                arrivals: Mutex::new(RateStats::default()),
                malformed: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                cancel: Notify::new(),
            }),
            handshake_timeout,
            reader: Mutex::new(None),
            session_id: Mutex::new(None),
        }
    }

    /// Receive ticks and connection-state changes from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    pub fn stats(&self) -> ClientStats {
        let arrivals = self.shared.arrivals.lock();
        ClientStats {
            ticks_received: arrivals.total(),
            malformed_dropped: self.shared.malformed.load(Ordering::Relaxed),
            arrival_rate_hz: arrivals.rate_hz(Instant::now()),
        }
    }

    /// Negotiate a session at `endpoint` and open its stream.
    ///
    /// Leaves the client `Streaming` on success and `Disconnected` on any error.
    pub async fn connect(&self, endpoint: &str, descriptor: &SessionDescriptor) -> Result<NegotiatedSession> {
        let epoch = {
            let mut state = self.shared.state.lock();
            if *state != ConnectionState::Disconnected {
                return Err(StreamError::AlreadyConnected.into());
            }
            *state = ConnectionState::Handshaking;
            self.shared.arrivals.lock().reset();
            self.shared.malformed.store(0, Ordering::Relaxed);
            self.shared.publish_state(ConnectionState::Handshaking, None);
            self.shared.epoch.load(Ordering::SeqCst)
        };

        info!(endpoint, case_id = %descriptor.case_id, tools = ?descriptor.tools, "Starting handshake");

        let negotiated = tokio::select! {
            result = time::timeout(self.handshake_timeout, handshake(endpoint, descriptor)) => {
                match result {
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => return Err(self.fail(epoch, e.into())),
                    Err(_) => return Err(self.fail(epoch, HandshakeError::Timeout(self.handshake_timeout).into())),
                }
            }
            _ = self.shared.cancel.notified() => {
                return Err(StreamError::Dropped("disconnected during handshake".to_string()).into());
            }
        };
        info!(session_id = %negotiated.session_id, stream = %negotiated.stream_address, "Handshake successful");

        let mut conn = match time::timeout(self.handshake_timeout, Connection::connect(&negotiated.stream_address)).await {
            Ok(Ok(c)) => c,
            Ok(Err(e)) => return Err(self.fail(epoch, StreamError::Open(e).into())),
            Err(_) => return Err(self.fail(epoch, StreamError::OpenTimeout.into())),
        };
        let subscribe = ClientCommand::Subscribe {
            session_id: negotiated.session_id.clone(),
        };
        if let Err(e) = conn.write_json(&subscribe).await {
            return Err(self.fail(epoch, StreamError::Open(e).into()));
        }

        let peer = conn.peer_addr();
        {
            // `disconnect` bumps the epoch under this lock. Checking it and
            // registering the reader under the same lock means a disconnect
            // either sees the reader or makes us give up here.
            let mut state = self.shared.state.lock();
            if !self.shared.is_current(epoch) {
                return Err(StreamError::Dropped("disconnected while opening stream".to_string()).into());
            }
            *state = ConnectionState::Streaming;
            *self.session_id.lock() = Some(negotiated.session_id.clone());
            let handle = tokio::spawn(read_stream(conn, Arc::clone(&self.shared), epoch));
            if let Some(old) = self.reader.lock().replace(handle) {
                old.abort();
            }
            self.shared.publish_state(ConnectionState::Streaming, None);
        }
        info!(%peer, "Stream open");

        Ok(negotiated)
    }

    fn fail(&self, epoch: u64, err: NavError) -> NavError {
        error!(error = %err, "Tracking connection failed");
        self.shared.transition(epoch, ConnectionState::Disconnected, Some(err.to_string()));
        err
    }

    /// Close the stream or abandon a pending handshake. Idempotent.
    pub fn disconnect(&self) {
        let previous = {
            let mut state = self.shared.state.lock();
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            if let Some(handle) = self.reader.lock().take() {
                handle.abort();
            }
            self.session_id.lock().take();
            let previous = std::mem::replace(&mut *state, ConnectionState::Disconnected);
            if previous != ConnectionState::Disconnected {
                self.shared.publish_state(ConnectionState::Disconnected, None);
            }
            previous
        };
        self.shared.cancel.notify_waiters();

        if previous != ConnectionState::Disconnected {
            info!("Tracking stream disconnected");
        }
    }
}

impl Drop for TrackingStreamClient {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}

async fn handshake(endpoint: &str, descriptor: &SessionDescriptor) -> std::result::Result<NegotiatedSession, HandshakeError> {
    let mut conn = Connection::connect(endpoint).await.map_err(HandshakeError::Connect)?;

    let request = HandshakeRequest {
        case_id: descriptor.case_id.clone(),
        tools: descriptor.tools.clone(),
        frequency_hz: descriptor.frequency_hz,
    };
    conn.write_json(&request).await.map_err(HandshakeError::Connect)?;

    let line = conn
        .read_line()
        .await
        .map_err(HandshakeError::Connect)?
        .ok_or_else(|| HandshakeError::Protocol("connection closed before handshake response".to_string()))?;
    let response: HandshakeResponse =
        serde_json::from_str(&line).map_err(|e| HandshakeError::Protocol(format!("invalid handshake response: {e}")))?;

    if response.status != STATUS_OK {
        return Err(HandshakeError::Rejected(response.reason.unwrap_or(response.status)));
    }
    match (response.stream_address, response.session_id) {
        (Some(stream_address), Some(session_id)) => Ok(NegotiatedSession {
            stream_address,
            session_id,
        }),
        _ => Err(HandshakeError::Protocol("response is missing streamAddress or sessionId".to_string())),
    }
}

/// Reader loop for one stream connection
async fn read_stream(mut conn: Connection, shared: Arc<Shared>, epoch: u64) {
    let reason = loop {
        match conn.read_line().await {
            Ok(Some(line)) => {
                if !line.trim().is_empty() && !shared.handle_line(epoch, &line) {
                    return;
                }
            }
            // Overlong or undecodable line; the connection itself is fine
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                if !shared.drop_malformed(epoch, &e) {
                    return;
                }
            }
            Ok(None) => break "tracking source closed the stream".to_string(),
            Err(e) => break format!("read error: {e}"),
        }
    };

    if shared.transition(epoch, ConnectionState::Disconnected, Some(reason.clone())) {
        warn!(reason = %reason, "Tracking stream lost");
    }
}
