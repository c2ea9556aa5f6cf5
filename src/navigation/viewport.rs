// Viewport adapter seam and tool-to-viewport bindings

use nalgebra::Vector3;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::pose::{Dicom, Pose};

/// Thin seam onto the rendering framework.
///
/// All calls are fire-and-forget. Implementations silently ignore viewport
/// ids that no longer exist; the controller never tracks viewport lifecycle.
pub trait ViewportAdapter: Send + Sync {
    /// Move the named tool's crosshair annotation in one viewport
    fn set_annotation_position(&self, viewport_id: &str, tool_name: &str, pose: &Pose<Dicom>);

    /// Current view-plane normal of a viewport, `None` if it is unknown
    fn view_plane_normal(&self, viewport_id: &str) -> Option<Vector3<f64>>;

    /// Re-cut the cross-section plane of a viewport
    fn recompute_cross_section(&self, viewport_id: &str, origin: &Vector3<f64>, normal: &Vector3<f64>);
}

/// Which viewports receive each tool's transformed position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewportBindings {
    bindings: BTreeMap<String, Vec<String>>,
}

impl ViewportBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `viewport_id` to `tool`. Binding the same pair twice is a no-op.
    pub fn bind(&mut self, tool: &str, viewport_id: &str) {
        let viewports = self.bindings.entry(tool.to_string()).or_default();
        if !viewports.iter().any(|v| v == viewport_id) {
            viewports.push(viewport_id.to_string());
        }
    }

    /// Remove all bindings of `tool`, returning whether it had any
    pub fn unbind_tool(&mut self, tool: &str) -> bool {
        self.bindings.remove(tool).is_some()
    }

    pub fn viewports_for(&self, tool: &str) -> &[String] {
        self.bindings.get(tool).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_bound(&self, tool: &str) -> bool {
        !self.viewports_for(tool).is_empty()
    }

    pub fn tools(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }
}

/// Adapter for headless runs: logs every call and knows the three
/// orthogonal views by their conventional ids.
#[derive(Debug, Clone)]
pub struct LoggingViewportAdapter {
    normals: HashMap<String, Vector3<f64>>,
}

impl LoggingViewportAdapter {
    pub fn orthogonal() -> Self {
        let normals = [
            ("axial", Vector3::new(0.0, 0.0, 1.0)),
            ("sagittal", Vector3::new(1.0, 0.0, 0.0)),
            ("coronal", Vector3::new(0.0, 1.0, 0.0)),
        ]
        .into_iter()
        .map(|(id, n)| (id.to_string(), n))
        .collect();
        LoggingViewportAdapter { normals }
    }
}

impl ViewportAdapter for LoggingViewportAdapter {
    fn set_annotation_position(&self, viewport_id: &str, tool_name: &str, pose: &Pose<Dicom>) {
        let p = pose.position_mm;
        debug!(viewport = viewport_id, tool = tool_name, x = p.x, y = p.y, z = p.z, "Annotation moved");
    }

    fn view_plane_normal(&self, viewport_id: &str) -> Option<Vector3<f64>> {
        self.normals.get(viewport_id).copied()
    }

    fn recompute_cross_section(&self, viewport_id: &str, origin: &Vector3<f64>, normal: &Vector3<f64>) {
        debug!(
            viewport = viewport_id,
            origin = ?[origin.x, origin.y, origin.z],
            normal = ?[normal.x, normal.y, normal.z],
            "Cross-section recomputed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bindings() {
        let mut bindings = ViewportBindings::new();
        bindings.bind("pointer", "axial");
        bindings.bind("pointer", "sagittal");
        bindings.bind("pointer", "axial");
        bindings.bind("reference", "coronal");

        assert_eq!(bindings.viewports_for("pointer"), &["axial".to_string(), "sagittal".to_string()]);
        assert!(bindings.is_bound("reference"));
        assert!(!bindings.is_bound("needle"));
        assert!(bindings.viewports_for("needle").is_empty());
        assert_eq!(bindings.tools().collect::<Vec<_>>(), vec!["pointer", "reference"]);

        assert!(bindings.unbind_tool("reference"));
        assert!(!bindings.unbind_tool("reference"));
        assert!(!bindings.is_bound("reference"));
    }

    #[test]
    fn test_orthogonal_normals() {
        let adapter = LoggingViewportAdapter::orthogonal();
        assert_eq!(adapter.view_plane_normal("axial"), Some(Vector3::z()));
        assert_eq!(adapter.view_plane_normal("sagittal"), Some(Vector3::x()));
        assert_eq!(adapter.view_plane_normal("coronal"), Some(Vector3::y()));
        assert_eq!(adapter.view_plane_normal("3d"), None);

        // Unknown viewports are ignored
        adapter.set_annotation_position("gone", "pointer", &Pose::from_array([1.0, 2.0, 3.0]));
        adapter.recompute_cross_section("gone", &Vector3::zeros(), &Vector3::z());
    }
}
