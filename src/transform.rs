// Homogeneous 4x4 transforms between the register and DICOM frames
//
// Convention: the stored matrix F maps DICOM -> register. Register -> DICOM
// is therefore always `inverse(F)`. This is fixed, not inferred from data.

use nalgebra::{Matrix3, Matrix4, Vector3, Vector4};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

use crate::constants::{HOMOGENEOUS_W_EPSILON, IDENTITY_TOLERANCE, SINGULAR_DETERMINANT};
use crate::error::TransformError;
use crate::pose::{Dicom, Pose, Register};

/// Immutable (F, F⁻¹, is_identity) triple.
///
/// Never mutated after construction; `MatrixTransform` replaces the whole
/// value so readers can't observe a half-updated transform.
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    forward: Matrix4<f64>,
    inverse: Matrix4<f64>,
    is_identity: bool,
    loaded: bool,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    /// The implicit transform used when nothing is loaded.
    pub fn identity() -> Self {
        Transform {
            forward: Matrix4::identity(),
            inverse: Matrix4::identity(),
            is_identity: true,
            loaded: false,
        }
    }

    /// Build from row-major nested rows, validating the 4x4 shape.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, TransformError> {
        if rows.len() != 4 {
            return Err(TransformError::InvalidShape {
                rows: rows.len(),
                cols: rows.first().map_or(0, |r| r.len()),
            });
        }
        if let Some(bad) = rows.iter().find(|r| r.len() != 4) {
            return Err(TransformError::InvalidShape { rows: 4, cols: bad.len() });
        }
        let m = Matrix4::from_fn(|r, c| rows[r][c]);
        Self::from_matrix(m)
    }

    pub fn from_matrix(forward: Matrix4<f64>) -> Result<Self, TransformError> {
        for row in 0..4 {
            for col in 0..4 {
                if !forward[(row, col)].is_finite() {
                    return Err(TransformError::NonFinite { row, col });
                }
            }
        }

        let inverse = invert_by_adjugate(&forward)?;
        let is_identity = forward
            .iter()
            .zip(Matrix4::<f64>::identity().iter())
            .all(|(a, b)| (a - b).abs() <= IDENTITY_TOLERANCE);

        Ok(Transform {
            forward,
            inverse,
            is_identity,
            loaded: true,
        })
    }

    /// Diagonal(-1, -1, 1, 1): converts between RAS and LPS patient axes. Self-inverse.
    pub fn ras_lps_flip() -> Matrix4<f64> {
        Matrix4::from_diagonal(&Vector4::new(-1.0, -1.0, 1.0, 1.0))
    }

    pub fn forward_matrix(&self) -> &Matrix4<f64> {
        &self.forward
    }

    pub fn inverse_matrix(&self) -> &Matrix4<f64> {
        &self.inverse
    }

    pub fn is_identity(&self) -> bool {
        self.is_identity
    }

    /// True when this came from an explicit load rather than the default.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Apply F (DICOM -> register).
    pub fn forward(&self, v: &Vector3<f64>) -> Vector3<f64> {
        if self.is_identity {
            return *v;
        }
        apply_homogeneous(&self.forward, v)
    }

    /// Apply F⁻¹ (register -> DICOM).
    pub fn inverse(&self, v: &Vector3<f64>) -> Vector3<f64> {
        if self.is_identity {
            return *v;
        }
        apply_homogeneous(&self.inverse, v)
    }

    /// Convert a tracked pose into the renderer's frame.
    ///
    /// Euler angles are only carried across an identity transform; under a
    /// real transform the orientation is expressed by the converted matrix.
    pub fn register_to_dicom(&self, pose: &Pose<Register>) -> Pose<Dicom> {
        let mut out = Pose::<Dicom>::new(self.inverse(&pose.position_mm));
        if self.is_identity {
            out.rotation_deg = pose.rotation_deg;
            out.matrix = pose.matrix;
        } else {
            out.matrix = pose.matrix.map(|m| self.inverse * m);
        }
        out
    }

    pub fn dicom_to_register(&self, pose: &Pose<Dicom>) -> Pose<Register> {
        let mut out = Pose::<Register>::new(self.forward(&pose.position_mm));
        if self.is_identity {
            out.rotation_deg = pose.rotation_deg;
            out.matrix = pose.matrix;
        } else {
            out.matrix = pose.matrix.map(|m| self.forward * m);
        }
        out
    }
}

fn apply_homogeneous(m: &Matrix4<f64>, v: &Vector3<f64>) -> Vector3<f64> {
    let h = m * Vector4::new(v.x, v.y, v.z, 1.0);
    if h.w.abs() < HOMOGENEOUS_W_EPSILON {
        h.xyz()
    } else {
        h.xyz() / h.w
    }
}

/// Signed cofactor C(r, c) of a 4x4 matrix.
fn cofactor(m: &Matrix4<f64>, r: usize, c: usize) -> f64 {
    let minor = Matrix3::from_fn(|i, j| {
        let row = if i < r { i } else { i + 1 };
        let col = if j < c { j } else { j + 1 };
        m[(row, col)]
    });
    let sign = if (r + c) % 2 == 0 { 1.0 } else { -1.0 };
    sign * minor.determinant()
}

/// Inverse via the adjugate: A⁻¹ = adj(A) / det(A).
fn invert_by_adjugate(m: &Matrix4<f64>) -> Result<Matrix4<f64>, TransformError> {
    let cofactors = Matrix4::from_fn(|r, c| cofactor(m, r, c));
    // Laplace expansion along the first row
    let determinant: f64 = (0..4).map(|c| m[(0, c)] * cofactors[(0, c)]).sum();
    if determinant.abs() < SINGULAR_DETERMINANT {
        return Err(TransformError::Singular { determinant });
    }
    Ok(cofactors.transpose() / determinant)
}

/// Shared, swappable transform.
///
/// Read on every emitted update; written only by explicit load/clear.
#[derive(Debug, Default)]
pub struct MatrixTransform {
    current: RwLock<Arc<Transform>>,
}

impl MatrixTransform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from nested rows. On error the previous transform stays active.
    pub fn load(&self, rows: &[Vec<f64>]) -> Result<(), TransformError> {
        let transform = Transform::from_rows(rows)?;
        self.install(transform);
        Ok(())
    }

    pub fn load_matrix(&self, matrix: Matrix4<f64>) -> Result<(), TransformError> {
        let transform = Transform::from_matrix(matrix)?;
        self.install(transform);
        Ok(())
    }

    fn install(&self, transform: Transform) {
        info!(identity = transform.is_identity(), "Transform loaded");
        *self.current.write() = Arc::new(transform);
    }

    /// Back to the implicit identity.
    pub fn clear(&self) {
        *self.current.write() = Arc::new(Transform::identity());
        info!("Transform cleared");
    }

    pub fn has_transform(&self) -> bool {
        self.snapshot().is_loaded()
    }

    /// Current value; hold on to it for the duration of one conversion.
    pub fn snapshot(&self) -> Arc<Transform> {
        Arc::clone(&self.current.read())
    }

    pub fn forward(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.snapshot().forward(v)
    }

    pub fn inverse(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.snapshot().inverse(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::{Rotation3, Translation3};

    fn translate(x: f64, y: f64, z: f64) -> Matrix4<f64> {
        Translation3::new(x, y, z).to_homogeneous()
    }

    fn rigid() -> Matrix4<f64> {
        let rot = Rotation3::from_euler_angles(0.3, -1.1, 2.4).to_homogeneous();
        translate(12.5, -40.0, 7.25) * rot
    }

    fn test_vectors() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(75.2, 0.1, -20.0),
            Vector3::new(-300.0, 512.0, 1e3),
            Vector3::new(1e-4, -2.5, 33.3),
        ]
    }

    #[test]
    fn test_register_to_dicom_translation_scenario() {
        let t = Transform::from_matrix(translate(50.0, -30.0, 10.0)).unwrap();
        let out = t.inverse(&Vector3::new(75.2, 0.1, -20.0));
        assert_abs_diff_eq!(out.x, 25.2, epsilon = 1e-9);
        assert_abs_diff_eq!(out.y, 30.1, epsilon = 1e-9);
        assert_abs_diff_eq!(out.z, -30.0, epsilon = 1e-9);
    }

    #[test]
    fn test_forward_inverse_roundtrip() {
        let mut affine = rigid();
        affine[(0, 0)] *= 1.7;
        affine[(2, 1)] += 0.4;
        for m in [rigid(), affine, translate(1.0, 2.0, 3.0)] {
            let t = Transform::from_matrix(m).unwrap();
            for v in test_vectors() {
                let back = t.forward(&t.inverse(&v));
                assert_abs_diff_eq!(back, v, epsilon = 1e-6);
                let back = t.inverse(&t.forward(&v));
                assert_abs_diff_eq!(back, v, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_adjugate_inverse_matches_product_identity() {
        let t = Transform::from_matrix(rigid()).unwrap();
        let product = t.forward_matrix() * t.inverse_matrix();
        assert_abs_diff_eq!(product, Matrix4::identity(), epsilon = 1e-9);
    }

    #[test]
    fn test_identity_short_circuit() {
        let t = Transform::from_matrix(Matrix4::identity()).unwrap();
        assert!(t.is_identity());
        assert!(t.is_loaded());
        let v = Vector3::new(1.0, -2.0, 3.0);
        assert_eq!(t.forward(&v), v);
        assert_eq!(t.inverse(&v), v);
    }

    #[test]
    fn test_non_identity_flag() {
        let t = Transform::from_matrix(translate(0.0, 0.0, 1e-3)).unwrap();
        assert!(!t.is_identity());
    }

    #[test]
    fn test_singular_rejected_and_previous_kept() {
        let shared = MatrixTransform::new();
        shared.load_matrix(translate(50.0, -30.0, 10.0)).unwrap();

        let err = shared.load_matrix(Matrix4::zeros()).unwrap_err();
        assert!(matches!(err, TransformError::Singular { .. }));

        let out = shared.inverse(&Vector3::new(50.0, -30.0, 10.0));
        assert_abs_diff_eq!(out, Vector3::zeros(), epsilon = 1e-9);
    }

    #[test]
    fn test_invalid_shape_rejected() {
        let shared = MatrixTransform::new();
        let three_rows = vec![vec![1.0, 0.0, 0.0, 0.0]; 3];
        assert!(matches!(
            shared.load(&three_rows),
            Err(TransformError::InvalidShape { rows: 3, cols: 4 })
        ));

        let mut ragged = vec![vec![1.0, 0.0, 0.0, 0.0]; 4];
        ragged[2].pop();
        assert!(matches!(
            shared.load(&ragged),
            Err(TransformError::InvalidShape { rows: 4, cols: 3 })
        ));
        assert!(!shared.has_transform());
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut m = Matrix4::identity();
        m[(1, 3)] = f64::NAN;
        assert!(matches!(
            Transform::from_matrix(m),
            Err(TransformError::NonFinite { row: 1, col: 3 })
        ));
    }

    #[test]
    fn test_clear_resets_to_identity() {
        let shared = MatrixTransform::new();
        assert!(!shared.has_transform());
        shared.load_matrix(rigid()).unwrap();
        assert!(shared.has_transform());
        shared.clear();
        assert!(!shared.has_transform());
        assert!(shared.snapshot().is_identity());
    }

    #[test]
    fn test_snapshot_survives_swap() {
        let shared = MatrixTransform::new();
        shared.load_matrix(translate(1.0, 0.0, 0.0)).unwrap();
        let held = shared.snapshot();
        shared.load_matrix(translate(2.0, 0.0, 0.0)).unwrap();
        assert_abs_diff_eq!(held.forward(&Vector3::zeros()).x, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(shared.forward(&Vector3::zeros()).x, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_pose_conversion_carries_matrix() {
        let t = Transform::from_matrix(translate(50.0, -30.0, 10.0)).unwrap();
        let pose = Pose::<Register>::from_array([75.2, 0.1, -20.0])
            .with_rotation(Vector3::new(10.0, 0.0, 0.0))
            .with_matrix(translate(75.2, 0.1, -20.0));
        let dicom = t.register_to_dicom(&pose);
        assert_abs_diff_eq!(dicom.position_mm, Vector3::new(25.2, 30.1, -30.0), epsilon = 1e-9);
        assert!(dicom.rotation_deg.is_none());
        let m = dicom.matrix.unwrap();
        assert_abs_diff_eq!(m[(0, 3)], 25.2, epsilon = 1e-9);

        let back = t.dicom_to_register(&dicom);
        assert_abs_diff_eq!(back.position_mm, pose.position_mm, epsilon = 1e-9);
    }

    #[test]
    fn test_ras_lps_flip_is_self_inverse() {
        let flip = Transform::ras_lps_flip();
        assert_eq!(flip * flip, Matrix4::identity());
        let t = Transform::from_matrix(flip).unwrap();
        assert_eq!(t.inverse(&Vector3::new(1.0, 2.0, 3.0)), Vector3::new(-1.0, -2.0, 3.0));
    }
}
