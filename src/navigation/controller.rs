// Navigation controller
// Drives viewport crosshairs from tracked tool poses at a UI-safe rate
//
// Ticks come from either the live tracking stream or the rehearsal
// generator; both feed the same delivery path. Every tick updates the
// arrival statistics, but a viewport update only fires when the tool's
// throttle window has elapsed.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use super::throttle::EmissionThrottle;
use super::viewport::{ViewportAdapter, ViewportBindings};
use crate::case_store::CaseLookup;
use crate::config::NavigationConfig;
use crate::error::{NavError, Result};
use crate::net::stream_client::{ClientStats, ConnectionState, StreamEvent, TrackingStreamClient};
use crate::pose::{Pose, Register, TrackingTick};
use crate::rehearsal::{unix_timestamp, RehearsalGenerator, RehearsalMotion};
use crate::stats::RateStats;
use crate::transform::{MatrixTransform, Transform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NavigationState {
    Idle,
    Connecting,
    Active,
    Error,
}

/// Where ticks come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NavigationMode {
    Live,
    Rehearsal(RehearsalMotion),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformStatus {
    pub loaded: bool,
    pub is_identity: bool,
}

/// Read-only snapshot for display collaborators
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationStatus {
    pub state: NavigationState,
    pub update_count: u64,
    /// Tick arrival rate
    pub actual_rate_hz: f64,
    /// Viewport update rate
    pub emitted_rate_hz: f64,
    pub target_rate_hz: f64,
    pub mode: Option<NavigationMode>,
    pub transform: TransformStatus,
    pub last_error: Option<String>,
}

struct Session {
    state: NavigationState,
    mode: Option<NavigationMode>,
    /// Bumped on every start and stop; callbacks carrying an older value are stale
    generation: u64,
    update_count: u64,
    arrivals: RateStats,
    emissions: RateStats,
    throttle: EmissionThrottle,
    last_error: Option<String>,
}

impl Session {
    fn new(target_rate_hz: f64) -> Self {
        Session {
            state: NavigationState::Idle,
            mode: None,
            generation: 0,
            update_count: 0,
            arrivals: RateStats::default(),
            emissions: RateStats::default(),
            throttle: EmissionThrottle::new(target_rate_hz),
            last_error: None,
        }
    }

    fn reset_counters(&mut self) {
        self.update_count = 0;
        self.arrivals.reset();
        self.emissions.reset();
        self.throttle.reset();
    }
}

/// One due viewport update, collected under the session lock
struct Emission {
    tool: String,
    pose: Pose<Register>,
    viewports: Vec<String>,
}

struct Inner {
    config: NavigationConfig,
    transform: MatrixTransform,
    adapter: Arc<dyn ViewportAdapter>,
    bindings: RwLock<ViewportBindings>,
    session: Mutex<Session>,
    client: TrackingStreamClient,
    rehearsal: Mutex<RehearsalGenerator>,
    cross_section: AtomicBool,
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        let session = self.session.lock();
        session.generation == generation && session.state == NavigationState::Active
    }

    /// Run one tick through the throttle and push due updates to the viewports.
    /// Returns the number of annotation updates made.
    fn deliver(&self, tick: &TrackingTick, now: Instant, generation: Option<u64>) -> usize {
        let due: Vec<Emission> = {
            let mut session = self.session.lock();
            if session.state != NavigationState::Active {
                return 0;
            }
            if generation.is_some_and(|g| g != session.generation) {
                return 0;
            }
            session.arrivals.record(now);

            let bindings = self.bindings.read();
            let mut due = Vec::new();
            for (name, reading) in &tick.tools {
                if !reading.visible {
                    continue;
                }
                let viewports = bindings.viewports_for(name);
                if viewports.is_empty() || !session.throttle.should_emit(name, now) {
                    continue;
                }
                session.update_count += 1;
                session.emissions.record(now);
                due.push(Emission {
                    tool: name.clone(),
                    pose: reading.pose.clone(),
                    viewports: viewports.to_vec(),
                });
            }
            due
        };
        if due.is_empty() {
            return 0;
        }

        let transform = self.transform.snapshot();
        let cross_section = self.cross_section.load(Ordering::Relaxed);
        let mut calls = 0;
        for emission in &due {
            let dicom = transform.register_to_dicom(&emission.pose);
            let p = dicom.position_mm;
            debug!(tool = %emission.tool, frame = tick.frame_number, x = p.x, y = p.y, z = p.z, "Viewport update");

            for viewport in &emission.viewports {
                self.adapter.set_annotation_position(viewport, &emission.tool, &dicom);
                calls += 1;
                if cross_section {
                    // Cut orientation follows the viewport, only its position follows the tool
                    if let Some(normal) = self.adapter.view_plane_normal(viewport) {
                        self.adapter.recompute_cross_section(viewport, &p, &normal);
                    }
                }
            }
        }
        calls
    }

    fn on_stream_lost(&self, generation: u64, reason: Option<String>) {
        let mut session = self.session.lock();
        if session.generation != generation || session.state != NavigationState::Active {
            return;
        }
        let reason = reason.unwrap_or_else(|| "stream closed".to_string());
        error!(reason = %reason, "Tracking stream lost; navigation halted");
        session.state = NavigationState::Error;
        session.last_error = Some(reason);
    }

    /// Record a failed start. False if the session was stopped meanwhile.
    fn fail_start(&self, generation: u64, err: &NavError) -> bool {
        let mut session = self.session.lock();
        if session.generation != generation {
            return false;
        }
        error!(error = %err, "Navigation failed to start");
        session.state = NavigationState::Error;
        session.last_error = Some(err.to_string());
        true
    }
}

/// Owns the transform, the stream client and the viewport bindings.
pub struct NavigationController {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NavigationController {
    pub fn new(config: NavigationConfig, adapter: Arc<dyn ViewportAdapter>) -> Self {
        let client = TrackingStreamClient::new(config.handshake_timeout);
        let rehearsal = RehearsalGenerator::new(&config.rehearsal);
        let inner = Inner {
            session: Mutex::new(Session::new(config.target_rate_hz)),
            cross_section: AtomicBool::new(config.cross_section),
            transform: MatrixTransform::new(),
            adapter,
            bindings: RwLock::new(ViewportBindings::new()),
            client,
            rehearsal: Mutex::new(rehearsal),
            config,
        };
        NavigationController {
            inner: Arc::new(inner),
            task: Mutex::new(None),
        }
    }

    /// Start delivering ticks. A no-op while already connecting or active.
    ///
    /// In live mode this performs the handshake and returns its error; the
    /// session is left in `Error` until started again.
    pub async fn start_navigation(&self, mode: NavigationMode) -> Result<()> {
        let generation = {
            let mut session = self.inner.session.lock();
            if matches!(session.state, NavigationState::Active | NavigationState::Connecting) {
                debug!(state = ?session.state, "Navigation already running");
                return Ok(());
            }
            session.generation += 1;
            session.state = match mode {
                NavigationMode::Live => NavigationState::Connecting,
                NavigationMode::Rehearsal(_) => NavigationState::Active,
            };
            session.mode = Some(mode);
            session.last_error = None;
            session.reset_counters();
            session.generation
        };

        match mode {
            NavigationMode::Live => {
                if !self.start_live(generation).await? {
                    info!("Navigation stopped while connecting");
                    return Ok(());
                }
            }
            NavigationMode::Rehearsal(motion) => {
                self.inner.rehearsal.lock().set_motion(motion);
                let rate_hz = self.inner.config.rehearsal.rate_hz;
                info!(?motion, rate_hz, "Rehearsal generator started");
                self.set_task(tokio::spawn(run_rehearsal(Arc::clone(&self.inner), generation)));
            }
        }

        info!(?mode, target_rate_hz = self.inner.config.target_rate_hz, "Navigation started");
        Ok(())
    }

    /// Returns false if the session was stopped before the stream opened.
    async fn start_live(&self, generation: u64) -> Result<bool> {
        // Subscribe first so no event between connect and spawn is lost
        let events = self.inner.client.subscribe();
        let config = &self.inner.config;
        if let Err(e) = self.inner.client.connect(&config.endpoint, &config.session).await {
            if self.inner.fail_start(generation, &e) {
                return Err(e);
            }
            return Ok(false);
        }

        {
            let mut session = self.inner.session.lock();
            if session.generation != generation {
                // Stopped while connecting
                drop(session);
                self.inner.client.disconnect();
                return Ok(false);
            }
            session.state = NavigationState::Active;
        }
        self.set_task(tokio::spawn(pump_stream(Arc::clone(&self.inner), events, generation)));
        Ok(true)
    }

    fn set_task(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
    }

    /// Halt emission and close the stream. Safe to call at any time,
    /// including while a tick is being delivered.
    pub fn stop_navigation(&self) {
        let previous = {
            let mut session = self.inner.session.lock();
            session.generation += 1;
            session.reset_counters();
            std::mem::replace(&mut session.state, NavigationState::Idle)
        };
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        self.inner.client.disconnect();

        if previous != NavigationState::Idle {
            if matches!(self.inner.session.lock().mode, Some(NavigationMode::Rehearsal(_))) {
                info!("Rehearsal generator stopped");
            }
            info!(previous = ?previous, "Navigation stopped");
        }
    }

    /// Feed one tick through the delivery path at time `now`
    pub fn handle_tick(&self, tick: &TrackingTick, now: Instant) -> usize {
        self.inner.deliver(tick, now, None)
    }

    /// Load a DICOM-to-register matrix given as 4 rows of 4.
    /// On failure the previous transform (identity by default) stays active.
    pub fn load_transformation(&self, rows: &[Vec<f64>]) -> Result<()> {
        self.inner.transform.load(rows).map_err(|e| {
            warn!(error = %e, "Transform rejected, keeping previous");
            e.into()
        })
    }

    pub fn load_transformation_matrix(&self, matrix: nalgebra::Matrix4<f64>) -> Result<()> {
        self.inner.transform.load_matrix(matrix).map_err(|e| {
            warn!(error = %e, "Transform rejected, keeping previous");
            e.into()
        })
    }

    /// Fetch a case's stored matrix and load it
    pub async fn load_transformation_from_case<L: CaseLookup>(&self, store: &L, case_id: &str) -> Result<()> {
        let rows = match store.fetch_transform(case_id).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(case_id, error = %e, "Case transform unavailable, keeping previous");
                return Err(e.into());
            }
        };
        info!(case_id, "Case transform fetched");
        self.load_transformation(&rows)
    }

    pub fn clear_transformation(&self) {
        self.inner.transform.clear();
    }

    pub fn transform(&self) -> Arc<Transform> {
        self.inner.transform.snapshot()
    }

    pub fn bind_viewport(&self, tool: &str, viewport_id: &str) {
        self.inner.bindings.write().bind(tool, viewport_id);
        debug!(tool, viewport = viewport_id, "Viewport bound");
    }

    pub fn unbind_tool(&self, tool: &str) -> bool {
        self.inner.bindings.write().unbind_tool(tool)
    }

    pub fn set_cross_section(&self, enabled: bool) {
        self.inner.cross_section.store(enabled, Ordering::Relaxed);
        info!(enabled, "Cross-section cutting");
    }

    /// Move the rehearsal motion center; applies from the next generated frame
    pub fn set_rehearsal_center(&self, center: [f64; 3]) {
        self.inner.rehearsal.lock().set_center(center);
        info!(?center, "Rehearsal center moved");
    }

    pub fn get_status(&self) -> NavigationStatus {
        let now = Instant::now();
        let transform = self.inner.transform.snapshot();
        let session = self.inner.session.lock();
        NavigationStatus {
            state: session.state,
            update_count: session.update_count,
            actual_rate_hz: session.arrivals.rate_hz(now),
            emitted_rate_hz: session.emissions.rate_hz(now),
            target_rate_hz: self.inner.config.target_rate_hz,
            mode: session.mode,
            transform: TransformStatus {
                loaded: transform.is_loaded(),
                is_identity: transform.is_identity(),
            },
            last_error: session.last_error.clone(),
        }
    }

    pub fn client_stats(&self) -> ClientStats {
        self.inner.client.stats()
    }
}

impl Drop for NavigationController {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        self.inner.client.disconnect();
    }
}

async fn pump_stream(inner: Arc<Inner>, mut events: broadcast::Receiver<StreamEvent>, generation: u64) {
    loop {
        match events.recv().await {
            Ok(StreamEvent::Tick(tick)) => {
                inner.deliver(&tick, Instant::now(), Some(generation));
            }
            Ok(StreamEvent::ConnectionState {
                state: ConnectionState::Disconnected,
                reason,
            }) => {
                inner.on_stream_lost(generation, reason);
                break;
            }
            Ok(StreamEvent::ConnectionState { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(count)) => {
                warn!(count, "Navigation fell behind the tracking stream");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_rehearsal(inner: Arc<Inner>, generation: u64) {
    let period = Duration::from_secs_f64(1.0 / inner.config.rehearsal.rate_hz.max(1.0));
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        if !inner.is_current(generation) {
            break;
        }
        let tick = inner.rehearsal.lock().next_tick(unix_timestamp());
        inner.deliver(&tick, Instant::now(), Some(generation));
    }
}
