// Synthetic tool motion for hardware-free rehearsal
// Produces the same TrackingTick values a live tracking source would

use nalgebra::Vector3;
use rand::Rng;
use serde::Serialize;

use crate::constants::{
    DEFAULT_TOOL_NAME, REHEARSAL_ANGULAR_SPEED, REHEARSAL_BOB_AMPLITUDE_MM, REHEARSAL_CENTER,
    REHEARSAL_LINEAR_AMPLITUDE_MM, REHEARSAL_RADIUS_MM, REHEARSAL_RATE_HZ, REHEARSAL_TIME_STEP,
};
use crate::pose::{Pose, Register, ToolReading, TrackingTick};

/// Motion pattern of the rehearsal generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RehearsalMotion {
    /// Circle in the axial plane with a slow vertical bob.
    #[default]
    Circular,
    /// Oscillation along Z (superior/inferior).
    LinearAxial,
    /// Oscillation along X (left/right).
    LinearSagittal,
    /// Oscillation along Y (anterior/posterior).
    LinearCoronal,
    /// Jittery bounded-step walk.
    RandomWalk,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RehearsalConfig {
    pub motion: RehearsalMotion,
    pub center: [f64; 3],
    pub radius_mm: f64,
    pub rate_hz: f64,
    pub tool_name: String,
}

impl Default for RehearsalConfig {
    fn default() -> Self {
        RehearsalConfig {
            motion: RehearsalMotion::default(),
            center: REHEARSAL_CENTER,
            radius_mm: REHEARSAL_RADIUS_MM,
            rate_hz: REHEARSAL_RATE_HZ,
            tool_name: DEFAULT_TOOL_NAME.to_string(),
        }
    }
}

/// Stateful parametric motion source.
#[derive(Debug, Clone)]
pub struct RehearsalGenerator {
    motion: RehearsalMotion,
    center: Vector3<f64>,
    radius_mm: f64,
    tool_name: String,
    t: f64,
    frame_number: u64,
}

impl RehearsalGenerator {
    pub fn new(config: &RehearsalConfig) -> Self {
        RehearsalGenerator {
            motion: config.motion,
            center: Vector3::from(config.center),
            radius_mm: config.radius_mm,
            tool_name: config.tool_name.clone(),
            t: 0.0,
            frame_number: 0,
        }
    }

    pub fn set_motion(&mut self, motion: RehearsalMotion) {
        self.motion = motion;
        self.t = 0.0;
    }

    pub fn center(&self) -> [f64; 3] {
        [self.center.x, self.center.y, self.center.z]
    }

    /// Move the motion center; takes effect on the next frame.
    pub fn set_center(&mut self, center: [f64; 3]) {
        self.center = Vector3::from(center);
    }

    /// Produce the next tick, stamped with `timestamp` (UNIX seconds).
    pub fn next_tick(&mut self, timestamp: f64) -> TrackingTick {
        let (position, direction) = self.sample();
        self.t += REHEARSAL_TIME_STEP;
        self.frame_number += 1;

        let pose = Pose::<Register>::new(position).with_rotation(direction_to_euler_deg(&direction));
        let reading = ToolReading {
            pose,
            visible: true,
            quality_score: 1.0,
        };
        TrackingTick::new(self.frame_number, timestamp).with_tool(self.tool_name.clone(), reading)
    }

    /// Position and pointing direction at the current motion time.
    fn sample(&mut self) -> (Vector3<f64>, Vector3<f64>) {
        let t = self.t;
        let c = self.center;
        let swing = (t * 0.5).sin() * REHEARSAL_LINEAR_AMPLITUDE_MM;
        let heading = (t * 0.5).cos();
        match self.motion {
            RehearsalMotion::Circular => {
                let angle = t * REHEARSAL_ANGULAR_SPEED;
                let position = Vector3::new(
                    c.x + self.radius_mm * angle.cos(),
                    c.y + self.radius_mm * angle.sin(),
                    c.z + (t * 0.2).sin() * REHEARSAL_BOB_AMPLITUDE_MM,
                );
                // Points back towards the center
                let direction = Vector3::new(-angle.cos(), -angle.sin(), -0.1);
                (position, direction)
            }
            RehearsalMotion::LinearAxial => {
                (Vector3::new(c.x, c.y, c.z + swing), Vector3::new(0.0, 0.0, heading))
            }
            RehearsalMotion::LinearSagittal => {
                (Vector3::new(c.x + swing, c.y, c.z), Vector3::new(heading, 0.0, 0.0))
            }
            RehearsalMotion::LinearCoronal => {
                (Vector3::new(c.x, c.y + swing, c.z), Vector3::new(0.0, heading, 0.0))
            }
            RehearsalMotion::RandomWalk => {
                let mut rng = rand::thread_rng();
                self.center += Vector3::new(
                    rng.gen_range(-2.0..=2.0),
                    rng.gen_range(-2.0..=2.0),
                    rng.gen_range(-1.0..=1.0),
                );
                let direction = Vector3::new(
                    rng.gen_range(-1.0..=1.0),
                    rng.gen_range(-1.0..=1.0),
                    rng.gen_range(-0.5..=0.5),
                );
                (self.center, direction)
            }
        }
    }
}

/// Current wall-clock time in UNIX seconds, as stamped on generated ticks.
pub fn unix_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Euler angles (deg) for a pointing direction: [roll, pitch, yaw], roll fixed at 0.
fn direction_to_euler_deg(direction: &Vector3<f64>) -> Vector3<f64> {
    let norm = direction.norm();
    if norm < f64::EPSILON {
        return Vector3::zeros();
    }
    let d = direction / norm;
    let yaw = d.y.atan2(d.x).to_degrees();
    let pitch = (-d.z).atan2(d.x.hypot(d.y)).to_degrees();
    Vector3::new(0.0, pitch, yaw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn generator(motion: RehearsalMotion) -> RehearsalGenerator {
        RehearsalGenerator::new(&RehearsalConfig {
            motion,
            ..RehearsalConfig::default()
        })
    }

    fn position(tick: &TrackingTick) -> Vector3<f64> {
        tick.tool(DEFAULT_TOOL_NAME).unwrap().pose.position_mm
    }

    #[test]
    fn test_circular_starts_on_radius() {
        let mut source = generator(RehearsalMotion::Circular);
        let first = position(&source.next_tick(0.0));
        assert_abs_diff_eq!(first, Vector3::new(152.4, 102.4, 70.0), epsilon = 1e-9);

        for _ in 0..200 {
            let p = position(&source.next_tick(0.0));
            let planar = ((p.x - 102.4).powi(2) + (p.y - 102.4).powi(2)).sqrt();
            assert_abs_diff_eq!(planar, 50.0, epsilon = 1e-9);
            assert!((p.z - 70.0).abs() <= 20.0 + 1e-9);
        }
    }

    #[test]
    fn test_linear_motions_stay_on_axis() {
        for (motion, axis) in [
            (RehearsalMotion::LinearSagittal, 0),
            (RehearsalMotion::LinearCoronal, 1),
            (RehearsalMotion::LinearAxial, 2),
        ] {
            let mut source = generator(motion);
            for _ in 0..100 {
                let p = position(&source.next_tick(0.0));
                let offset = p - Vector3::from(REHEARSAL_CENTER);
                for i in 0..3 {
                    if i == axis {
                        assert!(offset[i].abs() <= REHEARSAL_LINEAR_AMPLITUDE_MM + 1e-9);
                    } else {
                        assert_abs_diff_eq!(offset[i], 0.0, epsilon = 1e-9);
                    }
                }
            }
        }
    }

    #[test]
    fn test_random_walk_steps_are_bounded() {
        let mut source = generator(RehearsalMotion::RandomWalk);
        let mut prev = Vector3::from(REHEARSAL_CENTER);
        for _ in 0..100 {
            let p = position(&source.next_tick(0.0));
            let step = p - prev;
            assert!(step.x.abs() <= 2.0 && step.y.abs() <= 2.0 && step.z.abs() <= 1.0);
            prev = p;
        }
    }

    #[test]
    fn test_frame_numbers_increase() {
        let mut source = generator(RehearsalMotion::Circular);
        let a = source.next_tick(1.0);
        let b = source.next_tick(1.01);
        assert_eq!(a.frame_number + 1, b.frame_number);
        assert_eq!(b.timestamp, 1.01);
    }

    #[test]
    fn test_set_center_moves_motion() {
        let mut source = generator(RehearsalMotion::LinearAxial);
        source.set_center([0.0, 0.0, 0.0]);
        let p = position(&source.next_tick(0.0));
        assert_abs_diff_eq!(p, Vector3::zeros(), epsilon = 1e-9);
        assert_eq!(source.center(), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_direction_to_euler() {
        let e = direction_to_euler_deg(&Vector3::new(0.0, 1.0, 0.0));
        assert_abs_diff_eq!(e, Vector3::new(0.0, 0.0, 90.0), epsilon = 1e-9);
        assert_eq!(direction_to_euler_deg(&Vector3::zeros()), Vector3::zeros());
    }
}
