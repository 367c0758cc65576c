//! Geometric metadata of a goal region selected on the input mesh.

use nalgebra::Vector3;
use thiserror::Error;

use crate::datatypes::{Bounds, Mesh};

/// Vertices closer than this on every axis are treated as coincident
pub const DEGENERATE_TOLERANCE: f64 = 1e-9;
/// Fan triangles smaller than this do not contribute to the weighted centroid
pub const MIN_TRIANGLE_AREA: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegionError {
    #[error("region has no vertices")]
    Empty,
    #[error("vertex index {index} is out of range for a mesh with {len} vertices")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("all region vertices coincide")]
    Degenerate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GoalRegionMetadata {
    pub vertices: Vec<usize>,
    pub positions: Vec<Vector3<f64>>,
    pub centroid: Vector3<f64>,
    pub weighted_centroid: Vector3<f64>,
    pub area: f64,
    pub normal: Vector3<f64>,
    pub bounds: Bounds,
    pub is_valid: bool,
    pub errors: Vec<RegionError>,
}

fn default_normal() -> Vector3<f64> {
    Vector3::new(0.0, 1.0, 0.0)
}

fn arithmetic_centroid(positions: &[Vector3<f64>]) -> Vector3<f64> {
    if positions.is_empty() {
        return Vector3::zeros();
    }
    positions.iter().sum::<Vector3<f64>>() / positions.len() as f64
}

/// Fan triangulation from the first vertex. Returns the total area and the
/// area-weighted centroid, if any triangle was large enough to count.
fn fan_area_centroid(positions: &[Vector3<f64>]) -> (f64, Option<Vector3<f64>>) {
    if positions.len() < 3 {
        return (0.0, None);
    }

    let origin = positions[0];
    let mut total_area = 0.0;
    let mut weighted = Vector3::zeros();

    for pair in positions[1..].windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let area = 0.5 * (a - origin).cross(&(b - origin)).norm();
        if area < MIN_TRIANGLE_AREA {
            continue;
        }
        total_area += area;
        weighted += (origin + a + b) / 3.0 * area;
    }

    if total_area < MIN_TRIANGLE_AREA {
        return (0.0, None);
    }
    (total_area, Some(weighted / total_area))
}

/// Newell's method; valid for non-planar and non-convex loops
fn newell_normal(positions: &[Vector3<f64>]) -> Vector3<f64> {
    if positions.len() < 3 {
        return default_normal();
    }

    let mut normal = Vector3::zeros();
    for (i, cur) in positions.iter().enumerate() {
        let next = positions[(i + 1) % positions.len()];
        normal.x += (cur.y - next.y) * (cur.z + next.z);
        normal.y += (cur.z - next.z) * (cur.x + next.x);
        normal.z += (cur.x - next.x) * (cur.y + next.y);
    }

    normal.try_normalize(1e-12).unwrap_or_else(default_normal)
}

fn is_degenerate(positions: &[Vector3<f64>]) -> bool {
    if positions.len() < 2 {
        return false;
    }
    let first = positions[0];
    positions
        .iter()
        .all(|p| (p - first).amax() <= DEGENERATE_TOLERANCE)
}

/// Analyzes the region spanned by `indices` on `mesh`.
///
/// Invalid regions still carry usable values: the arithmetic centroid of
/// whatever vertices resolved, zero area and an up-facing normal.
pub fn analyze_goal_region(mesh: &Mesh, indices: &[usize]) -> GoalRegionMetadata {
    let mut errors = Vec::new();
    let mut positions = Vec::with_capacity(indices.len());

    if indices.is_empty() {
        errors.push(RegionError::Empty);
    }
    for &index in indices {
        match mesh.vertex(index) {
            Some(p) => positions.push(p),
            None => errors.push(RegionError::IndexOutOfRange {
                index,
                len: mesh.vertex_count(),
            }),
        }
    }
    if is_degenerate(&positions) {
        errors.push(RegionError::Degenerate);
    }

    let centroid = arithmetic_centroid(&positions);
    let bounds = Bounds::from_points(&positions).unwrap_or(Bounds::new(centroid, centroid));

    if !errors.is_empty() {
        log::warn!(
            "goal region with {} vertices is invalid: {}",
            indices.len(),
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ")
        );
        return GoalRegionMetadata {
            vertices: indices.to_vec(),
            positions,
            centroid,
            weighted_centroid: centroid,
            area: 0.0,
            normal: default_normal(),
            bounds,
            is_valid: false,
            errors,
        };
    }

    let (area, weighted) = fan_area_centroid(&positions);

    GoalRegionMetadata {
        vertices: indices.to_vec(),
        centroid,
        weighted_centroid: weighted.unwrap_or(centroid),
        area,
        normal: newell_normal(&positions),
        bounds,
        positions,
        is_valid: true,
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square_mesh() -> Mesh {
        // unit square in the xz plane at y = 2, counter-clockwise seen from +y
        Mesh::new(vec![
            0.0, 2.0, 0.0, //
            0.0, 2.0, 1.0, //
            1.0, 2.0, 1.0, //
            1.0, 2.0, 0.0, //
        ])
    }

    #[test]
    fn square_region() {
        let meta = analyze_goal_region(&square_mesh(), &[0, 1, 2, 3]);
        assert!(meta.is_valid);
        assert!(meta.errors.is_empty());
        assert_relative_eq!(meta.area, 1.0, epsilon = 1e-12);
        assert_relative_eq!(meta.centroid, Vector3::new(0.5, 2.0, 0.5), epsilon = 1e-12);
        assert_relative_eq!(
            meta.weighted_centroid,
            Vector3::new(0.5, 2.0, 0.5),
            epsilon = 1e-12
        );
        assert_relative_eq!(meta.normal, Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
        assert_eq!(meta.bounds.min, Vector3::new(0.0, 2.0, 0.0));
        assert_eq!(meta.bounds.max, Vector3::new(1.0, 2.0, 1.0));
    }

    #[test]
    fn weighted_centroid_differs_from_mean_for_uneven_loops() {
        // large triangle plus a clustered extra vertex near one corner
        let mesh = Mesh::new(vec![
            0.0, 0.0, 0.0, //
            4.0, 0.0, 0.0, //
            4.0, 0.1, 0.0, //
            0.0, 4.0, 0.0, //
        ]);
        let meta = analyze_goal_region(&mesh, &[0, 1, 2, 3]);
        assert!(meta.is_valid);
        assert!((meta.weighted_centroid - meta.centroid).norm() > 0.1);
        assert_relative_eq!(meta.normal, Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-12);
    }

    #[test]
    fn empty_region_falls_back() {
        let meta = analyze_goal_region(&square_mesh(), &[]);
        assert!(!meta.is_valid);
        assert_eq!(meta.errors, vec![RegionError::Empty]);
        assert_eq!(meta.area, 0.0);
        assert_eq!(meta.normal, Vector3::new(0.0, 1.0, 0.0));
        assert!(meta.centroid.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn out_of_range_index_is_reported() {
        let meta = analyze_goal_region(&square_mesh(), &[0, 1, 9]);
        assert!(!meta.is_valid);
        assert_eq!(
            meta.errors,
            vec![RegionError::IndexOutOfRange { index: 9, len: 4 }]
        );
        assert_relative_eq!(meta.centroid, Vector3::new(0.0, 2.0, 0.5), epsilon = 1e-12);
        assert_eq!(meta.weighted_centroid, meta.centroid);
        assert_eq!(
            meta.errors[0].to_string(),
            "vertex index 9 is out of range for a mesh with 4 vertices"
        );
    }

    #[test]
    fn coincident_vertices_are_degenerate() {
        let mesh = Mesh::new(vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0 + 1e-12, 1.0, 1.0, 1.0]);
        let meta = analyze_goal_region(&mesh, &[0, 1, 2]);
        assert!(!meta.is_valid);
        assert_eq!(meta.errors, vec![RegionError::Degenerate]);
        assert_eq!(meta.normal, Vector3::new(0.0, 1.0, 0.0));
    }

    #[test]
    fn collinear_region_has_zero_area_and_default_normal() {
        let mesh = Mesh::new(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 2.0, 0.0, 0.0]);
        let meta = analyze_goal_region(&mesh, &[0, 1, 2]);
        assert!(meta.is_valid);
        assert_eq!(meta.area, 0.0);
        assert_eq!(meta.weighted_centroid, meta.centroid);
        assert_eq!(meta.normal, Vector3::new(0.0, 1.0, 0.0));
    }

    #[test]
    fn single_vertex_is_a_valid_point_region() {
        let meta = analyze_goal_region(&square_mesh(), &[2]);
        assert!(meta.is_valid);
        assert_eq!(meta.centroid, Vector3::new(1.0, 2.0, 1.0));
        assert_eq!(meta.area, 0.0);
    }
}
