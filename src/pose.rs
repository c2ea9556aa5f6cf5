// Poses, tool readings and tracking ticks
//
// Every pose is tagged with the coordinate frame it lives in. The tag is a
// type parameter, so a register-frame pose cannot be handed to something that
// expects DICOM coordinates without going through a `Transform`.

use nalgebra::{Matrix4, Vector3};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::marker::PhantomData;

/// Runtime name of a coordinate frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Native frame of the tracking hardware / surgical plan.
    Register,
    /// Patient space of the image renderer.
    Dicom,
}

/// Compile-time frame marker.
pub trait CoordinateFrame: Debug + Clone + Copy + PartialEq + Send + Sync + 'static {
    const KIND: FrameKind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dicom;

impl CoordinateFrame for Register {
    const KIND: FrameKind = FrameKind::Register;
}

impl CoordinateFrame for Dicom {
    const KIND: FrameKind = FrameKind::Dicom;
}

/// Position (mm) with optional orientation, in frame `F`.
#[derive(Debug, Clone, PartialEq)]
pub struct Pose<F: CoordinateFrame> {
    pub position_mm: Vector3<f64>,
    /// Euler angles in degrees.
    pub rotation_deg: Option<Vector3<f64>>,
    pub matrix: Option<Matrix4<f64>>,
    frame: PhantomData<F>,
}

impl<F: CoordinateFrame> Pose<F> {
    pub fn new(position_mm: Vector3<f64>) -> Self {
        Pose {
            position_mm,
            rotation_deg: None,
            matrix: None,
            frame: PhantomData,
        }
    }

    pub fn from_array(position_mm: [f64; 3]) -> Self {
        Self::new(Vector3::from(position_mm))
    }

    pub fn with_rotation(mut self, rotation_deg: Vector3<f64>) -> Self {
        self.rotation_deg = Some(rotation_deg);
        self
    }

    pub fn with_matrix(mut self, matrix: Matrix4<f64>) -> Self {
        self.matrix = Some(matrix);
        self
    }

    pub fn frame(&self) -> FrameKind {
        F::KIND
    }

    pub fn position_array(&self) -> [f64; 3] {
        [self.position_mm.x, self.position_mm.y, self.position_mm.z]
    }
}

/// Ordinal bucket for a reading's quality score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityTier {
    Failed = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl QualityTier {
    /// Map a score in [0, 1] to a tier. Out-of-range or NaN scores are `Failed`.
    pub fn from_score(score: f64) -> Self {
        if !(0.0..=1.0).contains(&score) {
            return QualityTier::Failed;
        }
        if score >= 0.8 {
            QualityTier::High
        } else if score >= 0.5 {
            QualityTier::Medium
        } else if score >= 0.25 {
            QualityTier::Low
        } else {
            QualityTier::Failed
        }
    }
}

/// One instrument's state within a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolReading {
    pub pose: Pose<Register>,
    pub visible: bool,
    pub quality_score: f64,
}

impl ToolReading {
    pub fn quality_tier(&self) -> QualityTier {
        QualityTier::from_score(self.quality_score)
    }
}

/// A batch of readings sharing one frame number and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingTick {
    pub frame_number: u64,
    /// Source timestamp (UNIX seconds).
    pub timestamp: f64,
    pub tools: BTreeMap<String, ToolReading>,
}

impl TrackingTick {
    pub fn new(frame_number: u64, timestamp: f64) -> Self {
        TrackingTick {
            frame_number,
            timestamp,
            tools: BTreeMap::new(),
        }
    }

    pub fn with_tool(mut self, name: impl Into<String>, reading: ToolReading) -> Self {
        self.tools.insert(name.into(), reading);
        self
    }

    pub fn tool(&self, name: &str) -> Option<&ToolReading> {
        self.tools.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_tiers() {
        assert_eq!(QualityTier::from_score(1.0), QualityTier::High);
        assert_eq!(QualityTier::from_score(0.8), QualityTier::High);
        assert_eq!(QualityTier::from_score(0.6), QualityTier::Medium);
        assert_eq!(QualityTier::from_score(0.3), QualityTier::Low);
        assert_eq!(QualityTier::from_score(0.1), QualityTier::Failed);
        assert_eq!(QualityTier::from_score(1.5), QualityTier::Failed);
        assert_eq!(QualityTier::from_score(f64::NAN), QualityTier::Failed);
        assert!(QualityTier::High > QualityTier::Low);
    }

    #[test]
    fn test_pose_frame_tag() {
        let reg = Pose::<Register>::from_array([1.0, 2.0, 3.0]);
        let dicom = Pose::<Dicom>::from_array([1.0, 2.0, 3.0]);
        assert_eq!(reg.frame(), FrameKind::Register);
        assert_eq!(dicom.frame(), FrameKind::Dicom);
        assert_eq!(reg.position_array(), [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_tick_lookup() {
        let reading = ToolReading {
            pose: Pose::from_array([0.0, 0.0, 0.0]),
            visible: true,
            quality_score: 0.9,
        };
        let tick = TrackingTick::new(7, 1000.0).with_tool("pointer", reading);
        assert_eq!(tick.tool("pointer").map(|r| r.quality_tier()), Some(QualityTier::High));
        assert!(tick.tool("drill").is_none());
    }
}
