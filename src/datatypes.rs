use nalgebra::Vector3;
use serde::Serialize;

use crate::error::{Result, TopoError};
use crate::model::FeModel;

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: Vector3<f64>,
    pub max: Vector3<f64>,
}

impl Bounds {
    pub fn new(min: Vector3<f64>, max: Vector3<f64>) -> Bounds {
        Bounds { min, max }
    }

    /// Smallest box containing every point, or `None` for no points
    pub fn from_points<'a, I>(points: I) -> Option<Bounds>
    where
        I: IntoIterator<Item = &'a Vector3<f64>>,
    {
        let mut iter = points.into_iter();
        let first = *iter.next()?;
        let mut bounds = Bounds::new(first, first);
        for p in iter {
            bounds.min = bounds.min.inf(p);
            bounds.max = bounds.max.sup(p);
        }
        Some(bounds)
    }

    pub fn extent(&self) -> Vector3<f64> {
        self.max - self.min
    }

    pub fn is_finite(&self) -> bool {
        self.min.iter().chain(self.max.iter()).all(|v| v.is_finite())
    }
}

/// Input mesh as supplied by the caller: flat `xyz` vertex triples
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub positions: Vec<f64>,
}

impl Mesh {
    pub fn new(positions: Vec<f64>) -> Mesh {
        Mesh { positions }
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len() / 3
    }

    pub fn vertex(&self, index: usize) -> Option<Vector3<f64>> {
        if index >= self.vertex_count() {
            return None;
        }
        let p = &self.positions[3 * index..3 * index + 3];
        Some(Vector3::new(p[0], p[1], p[2]))
    }

    pub fn bounds(&self) -> Option<Bounds> {
        let points: Vec<Vector3<f64>> = (0..self.vertex_count())
            .filter_map(|i| self.vertex(i))
            .collect();
        Bounds::from_points(&points)
    }
}

/// Renderable triangle mesh shared by the reconstructor, the smoother and
/// whatever draws the result.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RenderMesh {
    pub positions: Vec<f32>,
    pub normals: Vec<f32>,
    pub uvs: Vec<f32>,
    pub indices: Vec<u32>,
    pub colors: Option<Vec<f32>>,
}

impl RenderMesh {
    pub fn vertex_count(&self) -> usize {
        self.positions.len() / 3
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Index list is whole triangles and every index names a vertex
    pub fn is_consistent(&self) -> bool {
        let n = self.vertex_count();
        self.positions.len() % 3 == 0
            && self.indices.len() % 3 == 0
            && self.indices.iter().all(|&i| (i as usize) < n)
            && (self.normals.is_empty() || self.normals.len() == self.positions.len())
            && (self.uvs.is_empty() || self.uvs.len() / 2 == n)
    }

    pub fn position(&self, index: usize) -> Vector3<f64> {
        let p = &self.positions[3 * index..3 * index + 3];
        Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64)
    }

    pub fn set_position(&mut self, index: usize, value: &Vector3<f64>) {
        self.positions[3 * index] = value.x as f32;
        self.positions[3 * index + 1] = value.y as f32;
        self.positions[3 * index + 2] = value.z as f32;
    }

    /// Recomputes area-weighted vertex normals from the current positions
    pub fn recompute_normals(&mut self) {
        let mut normals = vec![Vector3::<f64>::zeros(); self.vertex_count()];
        for tri in self.indices.chunks_exact(3) {
            let (a, b, c) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
            let pa = self.position(a);
            // cross product length is twice the area, which is the weight
            let face = (self.position(b) - pa).cross(&(self.position(c) - pa));
            normals[a] += face;
            normals[b] += face;
            normals[c] += face;
        }

        self.normals = normals
            .iter()
            .flat_map(|n| {
                let n = n.try_normalize(1e-20).unwrap_or_else(|| Vector3::new(0.0, 1.0, 0.0));
                [n.x as f32, n.y as f32, n.z as f32]
            })
            .collect();
    }
}

/// A voxel density field with its world placement
#[derive(Debug, Clone, PartialEq)]
pub struct DensityField {
    pub densities: Vec<f64>,
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    pub bounds: Bounds,
}

impl DensityField {
    pub fn new(densities: Vec<f64>, dims: [usize; 3], bounds: Bounds) -> DensityField {
        DensityField {
            densities,
            nx: dims[0],
            ny: dims[1],
            nz: dims[2],
            bounds,
        }
    }

    /// Wraps a frame's densities, taking over the buffer
    pub fn from_frame(frame: SolverFrame, model: &FeModel) -> Result<DensityField> {
        if frame.densities.len() != model.num_elements {
            return Err(TopoError::Reconstruct(format!(
                "frame carries {} densities but the model has {} elements",
                frame.densities.len(),
                model.num_elements
            )));
        }
        Ok(DensityField::new(
            frame.densities,
            [model.nelx, model.nely, model.nelz],
            model.bounds,
        ))
    }

    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        i + j * self.nx + k * self.nx * self.ny
    }

    pub fn get(&self, i: usize, j: usize, k: usize) -> f64 {
        self.densities[self.index(i, j, k)]
    }
}

/// Linear solver diagnostics of one iteration
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeDiagnostics {
    pub iterations: u64,
    pub converged: bool,
    pub relative_residual: f64,
}

/// Wall time spent per stage of one iteration, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StageTimings {
    pub filter_ms: f64,
    pub assemble_ms: f64,
    pub solve_ms: f64,
    pub update_ms: f64,
}

/// Output of a single optimizer iteration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SolverFrame {
    pub iteration: usize,
    pub compliance: f64,
    pub change: f64,
    pub volume: f64,
    #[serde(skip)]
    pub densities: Vec<f64>,
    pub converged: bool,
    pub penalty: f64,
    pub beta: f64,
    pub fe: Option<FeDiagnostics>,
    pub timings: Option<StageTimings>,
}

impl SolverFrame {
    /// Copy of the scalar metrics, leaving the density buffer behind
    pub fn metrics(&self) -> SolverFrame {
        SolverFrame {
            iteration: self.iteration,
            compliance: self.compliance,
            change: self.change,
            volume: self.volume,
            densities: Vec::new(),
            converged: self.converged,
            penalty: self.penalty,
            beta: self.beta,
            fe: self.fe,
            timings: self.timings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_bounds_cover_all_vertices() {
        let mesh = Mesh::new(vec![0.0, 1.0, 2.0, -1.0, 4.0, 0.5, 3.0, 0.0, 1.0]);
        let bounds = mesh.bounds().unwrap();
        assert_eq!(bounds.min, Vector3::new(-1.0, 0.0, 0.5));
        assert_eq!(bounds.max, Vector3::new(3.0, 4.0, 2.0));
        assert!(mesh.vertex(3).is_none());
    }

    #[test]
    fn empty_mesh_has_no_bounds() {
        assert!(Mesh::default().bounds().is_none());
    }

    #[test]
    fn out_of_range_index_is_inconsistent() {
        let mesh = RenderMesh {
            positions: vec![0.0; 9],
            indices: vec![0, 1, 3],
            ..Default::default()
        };
        assert!(!mesh.is_consistent());
    }

    #[test]
    fn frame_metrics_drop_the_densities() {
        let frame = SolverFrame {
            iteration: 4,
            compliance: 12.5,
            change: 0.1,
            volume: 0.4,
            densities: vec![0.4; 16],
            converged: false,
            penalty: 3.0,
            beta: 2.0,
            fe: None,
            timings: Some(StageTimings::default()),
        };
        let metrics = frame.metrics();
        assert!(metrics.densities.is_empty());
        assert_eq!(
            metrics,
            SolverFrame {
                densities: Vec::new(),
                ..frame
            }
        );
    }

    #[test]
    fn normals_follow_winding() {
        let mut mesh = RenderMesh {
            positions: vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            indices: vec![0, 1, 2],
            ..Default::default()
        };
        mesh.recompute_normals();
        assert_eq!(&mesh.normals[0..3], &[0.0, 0.0, 1.0]);
        assert!(mesh.is_consistent());
    }
}
