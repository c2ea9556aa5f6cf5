use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEFAULT_HANDSHAKE_ADDR, DEFAULT_STREAM_ADDR, DEFAULT_STREAM_FREQUENCY_HZ, DEFAULT_TARGET_RATE_HZ,
    DEFAULT_TOOL_NAME, HANDSHAKE_TIMEOUT_SECS, REHEARSAL_CENTER, REHEARSAL_RADIUS_MM, REHEARSAL_RATE_HZ,
};
use crate::net::simulator::SimulatorConfig;
use crate::net::stream_client::SessionDescriptor;
use crate::rehearsal::{RehearsalConfig, RehearsalMotion};

/// Surgical navigation sync
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Verbose logging (DEBUG level)
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a simulated tracking source
    Serve(ServeArgs),
    /// Connect to a tracking source and drive viewports
    Follow(FollowArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Handshake listen address
    #[arg(long, value_name = "ADDR", default_value = DEFAULT_HANDSHAKE_ADDR)]
    pub listen: SocketAddr,

    /// Stream listen address
    #[arg(long, value_name = "ADDR", default_value = DEFAULT_STREAM_ADDR)]
    pub stream_listen: SocketAddr,

    /// Tick rate (Hz)
    #[arg(long, default_value_t = REHEARSAL_RATE_HZ)]
    pub rate_hz: f64,

    /// Simulated motion pattern
    #[arg(long, value_enum, default_value_t = RehearsalMotion::Circular)]
    pub motion: RehearsalMotion,

    /// Motion center in mm, as x,y,z
    #[arg(long, value_name = "X,Y,Z", value_parser = parse_center)]
    pub center: Option<[f64; 3]>,

    /// Radius of circular motion (mm)
    #[arg(long, default_value_t = REHEARSAL_RADIUS_MM)]
    pub radius: f64,

    /// Name of the simulated tool
    #[arg(long, default_value = DEFAULT_TOOL_NAME)]
    pub tool: String,
}

impl ServeArgs {
    pub fn simulator_config(&self) -> SimulatorConfig {
        SimulatorConfig {
            handshake_addr: self.listen,
            stream_addr: self.stream_listen,
            motion: RehearsalConfig {
                motion: self.motion,
                center: self.center.unwrap_or(REHEARSAL_CENTER),
                radius_mm: self.radius,
                rate_hz: self.rate_hz,
                tool_name: self.tool.clone(),
            },
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct FollowArgs {
    /// Handshake endpoint of the tracking source (host:port)
    #[arg(long, value_name = "HOST:PORT", default_value = DEFAULT_HANDSHAKE_ADDR)]
    pub endpoint: String,

    /// Case identifier sent in the handshake and used to look up the transform
    #[arg(long, default_value = "default")]
    pub case_id: String,

    /// Tools to request; each is bound to every viewport
    #[arg(long, value_delimiter = ',', default_value = DEFAULT_TOOL_NAME)]
    pub tools: Vec<String>,

    /// Tick frequency requested from the tracking source (Hz)
    #[arg(long, default_value_t = DEFAULT_STREAM_FREQUENCY_HZ)]
    pub frequency_hz: f64,

    /// Viewport update rate (Hz)
    #[arg(long, default_value_t = DEFAULT_TARGET_RATE_HZ)]
    pub target_rate_hz: f64,

    /// Directory of <case_id>.json transform files
    #[arg(long, value_name = "DIR")]
    pub case_dir: Option<PathBuf>,

    /// Viewports to drive
    #[arg(long, value_delimiter = ',', default_value = "axial,sagittal,coronal")]
    pub viewports: Vec<String>,

    /// Recompute cross-sections on every update
    #[arg(long, default_value_t = false)]
    pub cross_section: bool,

    /// Drive viewports from synthetic motion instead of a tracking source
    #[arg(long, value_enum)]
    pub rehearsal: Option<RehearsalMotion>,

    /// Status logging interval in seconds, 0 to disable
    #[arg(long, default_value_t = 5)]
    pub status_interval: u64,
}

impl FollowArgs {
    pub fn navigation_config(&self) -> NavigationConfig {
        let defaults = NavigationConfig::default();
        NavigationConfig {
            endpoint: self.endpoint.clone(),
            session: SessionDescriptor {
                case_id: self.case_id.clone(),
                tools: self.tools.clone(),
                frequency_hz: self.frequency_hz,
            },
            target_rate_hz: self.target_rate_hz,
            cross_section: self.cross_section,
            rehearsal: RehearsalConfig {
                tool_name: self.tools.first().cloned().unwrap_or(defaults.rehearsal.tool_name),
                ..defaults.rehearsal
            },
            ..defaults
        }
    }
}

/// Everything the navigation controller needs to run a session.
#[derive(Debug, Clone)]
pub struct NavigationConfig {
    /// Handshake endpoint (host:port)
    pub endpoint: String,
    pub session: SessionDescriptor,
    pub target_rate_hz: f64,
    pub handshake_timeout: Duration,
    pub cross_section: bool,
    pub rehearsal: RehearsalConfig,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        NavigationConfig {
            endpoint: DEFAULT_HANDSHAKE_ADDR.to_string(),
            session: SessionDescriptor {
                case_id: "default".to_string(),
                tools: vec![DEFAULT_TOOL_NAME.to_string()],
                frequency_hz: DEFAULT_STREAM_FREQUENCY_HZ,
            },
            target_rate_hz: DEFAULT_TARGET_RATE_HZ,
            handshake_timeout: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            cross_section: false,
            rehearsal: RehearsalConfig::default(),
        }
    }
}

/// Parse "x,y,z" into a center point
fn parse_center(s: &str) -> Result<[f64; 3], String> {
    let parts = s
        .split(',')
        .map(|p| p.trim().parse::<f64>().map_err(|e| format!("invalid coordinate '{p}': {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    match parts.as_slice() {
        [x, y, z] => Ok([*x, *y, *z]),
        _ => Err(format!("expected 3 comma-separated values, got {}", parts.len())),
    }
}
