// Shared constants for navigation sync
// Defaults for rates, timeouts and numeric tolerances

/// Determinant magnitude below which a transform is rejected as singular.
pub const SINGULAR_DETERMINANT: f64 = 1e-9;

/// Per-entry tolerance when deciding whether a loaded matrix is the identity.
pub const IDENTITY_TOLERANCE: f64 = 1e-9;

/// Homogeneous `w` below this is not divided out (point at infinity).
pub const HOMOGENEOUS_W_EPSILON: f64 = 1e-12;

/// Target viewport update rate (Hz). 25 Hz = 40 ms emission window.
pub const DEFAULT_TARGET_RATE_HZ: f64 = 25.0;

/// Tick frequency requested from the tracking source during the handshake (Hz).
pub const DEFAULT_STREAM_FREQUENCY_HZ: f64 = 100.0;

/// Bound on the capability-negotiation round trip (s).
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 5;

/// Window over which arrival/emission rates are measured (s).
pub const RATE_WINDOW_SECS: f64 = 1.0;

/// Handshake endpoint of the tracking source.
pub const DEFAULT_HANDSHAKE_ADDR: &str = "127.0.0.1:8765";

/// Stream listener of the simulated tracking source.
pub const DEFAULT_STREAM_ADDR: &str = "127.0.0.1:8766";

/// Capacity of the stream client's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// --- Rehearsal motion ---

/// Default rehearsal center in DICOM mm: middle of a 64x64 image with 3.2 mm spacing.
pub const REHEARSAL_CENTER: [f64; 3] = [102.4, 102.4, 70.0];

/// Radius of circular rehearsal motion (mm).
pub const REHEARSAL_RADIUS_MM: f64 = 50.0;

/// Amplitude of linear rehearsal oscillation (mm).
pub const REHEARSAL_LINEAR_AMPLITUDE_MM: f64 = 50.0;

/// Vertical bob amplitude of circular rehearsal motion (mm).
pub const REHEARSAL_BOB_AMPLITUDE_MM: f64 = 20.0;

/// Angular speed of circular motion (rad per unit of motion time).
pub const REHEARSAL_ANGULAR_SPEED: f64 = 0.5;

/// Motion time advanced per generated frame.
pub const REHEARSAL_TIME_STEP: f64 = 0.05;

/// Rate at which the rehearsal generator produces ticks (Hz).
pub const REHEARSAL_RATE_HZ: f64 = 100.0;

/// Default tool name used by rehearsal and the simulator.
pub const DEFAULT_TOOL_NAME: &str = "pointer";

/// Longest accepted protocol line (bytes). Longer lines are discarded.
pub const MAX_LINE_BYTES: usize = 64 * 1024;
