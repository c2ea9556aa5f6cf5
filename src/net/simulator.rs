// Simulated tracking source
// Grants sessions on a handshake listener and streams rehearsal ticks to subscribers

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::time;
use tracing::{debug, error, info, warn};

use super::connection::Connection;
use super::messages::{ClientCommand, HandshakeRequest, HandshakeResponse, StreamMessage, TickMessage};
use crate::constants::{EVENT_CHANNEL_CAPACITY, HANDSHAKE_TIMEOUT_SECS};
use crate::rehearsal::{unix_timestamp, RehearsalConfig, RehearsalGenerator};

const SERVER_NAME: &str = "navsync tracking simulator";

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub handshake_addr: SocketAddr,
    pub stream_addr: SocketAddr,
    /// Motion, center, tick rate and tool name of the simulated instrument
    pub motion: RehearsalConfig,
}

/// A running simulator. Dropping it shuts everything down.
pub struct TrackingSimulator {
    handshake_addr: SocketAddr,
    stream_addr: SocketAddr,
    generator: Arc<Mutex<RehearsalGenerator>>,
    shutdown_tx: watch::Sender<bool>,
}

impl TrackingSimulator {
    /// Bind both listeners and start generating ticks
    pub async fn start(config: SimulatorConfig) -> io::Result<Self> {
        let handshake_listener = TcpListener::bind(config.handshake_addr).await?;
        let stream_listener = TcpListener::bind(config.stream_addr).await?;
        let handshake_addr = handshake_listener.local_addr()?;
        let stream_addr = stream_listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ticks_tx, _) = broadcast::channel::<Arc<String>>(EVENT_CHANNEL_CAPACITY);
        let sessions: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let generator = Arc::new(Mutex::new(RehearsalGenerator::new(&config.motion)));

        tokio::spawn(accept_handshakes(
            handshake_listener,
            stream_addr,
            Arc::clone(&sessions),
            shutdown_rx.clone(),
        ));
        tokio::spawn(accept_streams(
            stream_listener,
            ticks_tx.clone(),
            sessions,
            Arc::clone(&generator),
            shutdown_rx.clone(),
        ));
        tokio::spawn(generate_ticks(
            Arc::clone(&generator),
            config.motion.rate_hz,
            ticks_tx,
            shutdown_rx,
        ));

        info!(%handshake_addr, %stream_addr, rate_hz = config.motion.rate_hz, "Tracking simulator started");

        Ok(TrackingSimulator {
            handshake_addr,
            stream_addr,
            generator,
            shutdown_tx,
        })
    }

    pub fn handshake_addr(&self) -> SocketAddr {
        self.handshake_addr
    }

    pub fn stream_addr(&self) -> SocketAddr {
        self.stream_addr
    }

    /// Move the simulated motion center
    pub fn set_center(&self, center: [f64; 3]) {
        move_center(&self.generator, center);
    }

    /// Stop accepting, stop generating, close every open stream
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for TrackingSimulator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn move_center(generator: &Mutex<RehearsalGenerator>, center: [f64; 3]) {
    generator.lock().set_center(center);
    info!(?center, "Simulator center moved");
}

fn new_session_id() -> String {
    format!("sim-{:08x}", rand::thread_rng().gen::<u32>())
}

async fn accept_handshakes(
    listener: TcpListener,
    stream_addr: SocketAddr,
    sessions: Arc<Mutex<HashSet<String>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let sessions = Arc::clone(&sessions);
                        tokio::spawn(async move {
                            let conn = Connection::new(stream, peer_addr);
                            if let Err(e) = answer_handshake(conn, stream_addr, sessions).await {
                                warn!(%peer_addr, error = %e, "Handshake failed");
                            }
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("Handshake listener stopped");
}

async fn answer_handshake(
    mut conn: Connection,
    stream_addr: SocketAddr,
    sessions: Arc<Mutex<HashSet<String>>>,
) -> io::Result<()> {
    let line = match time::timeout(Duration::from_secs(HANDSHAKE_TIMEOUT_SECS), conn.read_line()).await {
        Ok(Ok(Some(l))) => l,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            warn!(peer = %conn.peer_addr(), "Handshake timeout");
            return Ok(());
        }
    };

    let request: HandshakeRequest = match serde_json::from_str(&line) {
        Ok(r) => r,
        Err(_) => {
            return conn.write_json(&HandshakeResponse::denied("invalid handshake format")).await;
        }
    };
    if request.tools.is_empty() {
        return conn.write_json(&HandshakeResponse::denied("no tools requested")).await;
    }
    if !(request.frequency_hz.is_finite() && request.frequency_hz > 0.0) {
        return conn.write_json(&HandshakeResponse::denied("invalid frequency")).await;
    }

    let session_id = new_session_id();
    sessions.lock().insert(session_id.clone());
    info!(
        case_id = %request.case_id,
        tools = ?request.tools,
        frequency_hz = request.frequency_hz,
        %session_id,
        "Session granted"
    );
    conn.write_json(&HandshakeResponse::granted(stream_addr.to_string(), session_id))
        .await
}

async fn accept_streams(
    listener: TcpListener,
    ticks: broadcast::Sender<Arc<String>>,
    sessions: Arc<Mutex<HashSet<String>>>,
    generator: Arc<Mutex<RehearsalGenerator>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let conn = Connection::new(stream, peer_addr);
                        let rx = ticks.subscribe();
                        tokio::spawn(serve_stream(
                            conn,
                            rx,
                            Arc::clone(&sessions),
                            Arc::clone(&generator),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => error!("Accept error: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("Stream listener stopped");
}

async fn serve_stream(
    mut conn: Connection,
    mut ticks: broadcast::Receiver<Arc<String>>,
    sessions: Arc<Mutex<HashSet<String>>>,
    generator: Arc<Mutex<RehearsalGenerator>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = conn.peer_addr();
    let subscribe = time::timeout(Duration::from_secs(HANDSHAKE_TIMEOUT_SECS), conn.read_line()).await;
    let session_id = match subscribe {
        Ok(Ok(Some(line))) => match serde_json::from_str::<ClientCommand>(&line) {
            Ok(ClientCommand::Subscribe { session_id }) => session_id,
            Ok(other) => {
                warn!(%peer, command = ?other, "Expected subscribe");
                return;
            }
            Err(e) => {
                warn!(%peer, error = %e, "Invalid subscribe command");
                return;
            }
        },
        _ => return,
    };
    if !sessions.lock().remove(&session_id) {
        warn!(%peer, %session_id, "Unknown session");
        return;
    }
    info!(%peer, %session_id, "Stream client subscribed");

    let greeting = StreamMessage::Connection {
        status: Some("connected".to_string()),
        server: Some(SERVER_NAME.to_string()),
    };
    if conn.write_json(&greeting).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = ticks.recv() => {
                match result {
                    Ok(line) => {
                        if let Err(e) = conn.write_line(&line).await {
                            info!(%peer, error = %e, "Stream client disconnected");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        warn!(%peer, count, "Stream client lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            line = conn.read_line() => {
                match line {
                    Ok(Some(line)) => match serde_json::from_str::<ClientCommand>(&line) {
                        Ok(ClientCommand::SetCenter { center }) => move_center(&generator, center),
                        Ok(ClientCommand::Subscribe { .. }) => debug!(%peer, "Already subscribed"),
                        Err(e) => debug!(%peer, error = %e, "Ignoring unknown command"),
                    },
                    // Oversized or undecodable command
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                        debug!(%peer, error = %e, "Ignoring unreadable command");
                    }
                    _ => {
                        info!(%peer, "Stream client closed");
                        break;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn generate_ticks(
    generator: Arc<Mutex<RehearsalGenerator>>,
    rate_hz: f64,
    ticks: broadcast::Sender<Arc<String>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = Duration::from_secs_f64(1.0 / rate_hz.max(1.0));
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let tick = generator.lock().next_tick(unix_timestamp());
                let message = StreamMessage::Tick(TickMessage::from_tick(&tick));
                match serde_json::to_string(&message) {
                    Ok(line) => {
                        // No subscribers is fine
                        let _ = ticks.send(Arc::new(line));
                    }
                    Err(e) => error!("Failed to encode tick: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("Tick generator stopped");
}
