//! Surface reconstruction from voxel density fields.
//!
//! The field is sampled at voxel centers and each cube of eight samples is
//! split into six tetrahedra sharing the cube's main diagonal. Neighboring
//! cubes split their shared face along the same diagonal, so the extracted
//! surface has no cracks. One layer of padding below the smallest density
//! surrounds the samples, which closes the surface at the domain boundary.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::{
    datatypes::{Bounds, DensityField, RenderMesh},
    error::{Result, TopoError},
    smoothing::{smooth_mesh, SmoothingMethod},
};

/// Smallest and largest accepted solid fractions at the requested isovalue
pub const SOLID_FRACTION_RANGE: (f64, f64) = (0.05, 0.95);
/// Percentile used when the requested isovalue is rejected
pub const FALLBACK_PERCENTILE: f64 = 0.6;

/// Cube corners as offsets along x, y and z
const CUBE_CORNERS: [[usize; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [1, 1, 0],
    [0, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [1, 1, 1],
    [0, 1, 1],
];

/// Six tetrahedra around the diagonal from corner 0 to corner 6
const CUBE_TETRAHEDRA: [[usize; 4]; 6] = [
    [0, 5, 1, 6],
    [0, 1, 2, 6],
    [0, 2, 3, 6],
    [0, 3, 7, 6],
    [0, 7, 4, 6],
    [0, 4, 5, 6],
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconstructOptions {
    pub isovalue: f64,
    pub smoothing: SmoothingMethod,
}

impl Default for ReconstructOptions {
    fn default() -> Self {
        ReconstructOptions {
            isovalue: 0.5,
            smoothing: SmoothingMethod::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoxelGeometry {
    pub mesh: RenderMesh,
    /// Isovalue the surface was extracted at, after any adjustment
    pub isovalue: f64,
}

fn validate_field(field: &DensityField) -> Result<()> {
    let dims = [field.nx, field.ny, field.nz];
    if dims.contains(&0) {
        return Err(TopoError::Reconstruct(format!(
            "density field has an empty dimension: {}x{}x{}",
            field.nx, field.ny, field.nz
        )));
    }
    if field.densities.len() != field.nx * field.ny * field.nz {
        return Err(TopoError::Reconstruct(format!(
            "density buffer holds {} values, expected {}",
            field.densities.len(),
            field.nx * field.ny * field.nz
        )));
    }
    if !field.bounds.is_finite() {
        return Err(TopoError::Reconstruct("density field bounds are not finite".to_owned()));
    }
    Ok(())
}

fn nearest_source(index: usize, target: usize, source: usize) -> usize {
    let position = (index as f64 + 0.5) * source as f64 / target as f64;
    (position.floor() as usize).min(source - 1)
}

/// Resamples the field onto an `n x n x n` grid, `n` being the largest
/// input resolution, by nearest-voxel lookup. Planar fields (`nz == 1`) keep
/// a single layer.
pub fn resample_to_cubic(field: &DensityField) -> DensityField {
    let n = field.nx.max(field.ny).max(field.nz);
    let nz = if field.nz == 1 { 1 } else { n };
    if field.nx == n && field.ny == n && field.nz == nz {
        return field.clone();
    }

    let mut densities = Vec::with_capacity(n * n * nz);
    for k in 0..nz {
        let sk = nearest_source(k, nz, field.nz);
        for j in 0..n {
            let sj = nearest_source(j, n, field.ny);
            for i in 0..n {
                let si = nearest_source(i, n, field.nx);
                densities.push(field.get(si, sj, sk));
            }
        }
    }

    log::debug!(
        "resampled {}x{}x{} density field to {}x{}x{}",
        field.nx,
        field.ny,
        field.nz,
        n,
        n,
        nz
    );
    DensityField::new(densities, [n, n, nz], field.bounds)
}

/// Fraction of densities at or above `isovalue`
pub fn solid_fraction(densities: &[f64], isovalue: f64) -> f64 {
    if densities.is_empty() {
        return 0.0;
    }
    densities.iter().filter(|&&d| d >= isovalue).count() as f64 / densities.len() as f64
}

/// Keeps `requested` unless it leaves almost nothing or almost everything
/// solid, in which case the 60th percentile of the densities is used.
pub fn resolve_isovalue(densities: &[f64], requested: f64) -> f64 {
    if densities.is_empty() {
        return requested;
    }
    let fraction = solid_fraction(densities, requested);
    if requested.is_finite()
        && fraction >= SOLID_FRACTION_RANGE.0
        && fraction <= SOLID_FRACTION_RANGE.1
    {
        return requested;
    }

    let mut sorted = densities.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let index = ((sorted.len() - 1) as f64 * FALLBACK_PERCENTILE).round() as usize;
    let adjusted = sorted[index];
    log::warn!(
        "isovalue {} leaves {:.1}% solid, using {:.4} instead",
        requested,
        fraction * 100.0,
        adjusted
    );
    adjusted
}

/// Voxel-center samples surrounded by one layer of padding
struct SampleGrid {
    dims: [usize; 3],
    values: Vec<f64>,
    origin: Vector3<f64>,
    spacing: Vector3<f64>,
}

impl SampleGrid {
    fn new(field: &DensityField) -> SampleGrid {
        let pad = field.densities.iter().copied().fold(f64::INFINITY, f64::min) - 1.0;
        let dims = [field.nx + 2, field.ny + 2, field.nz + 2];

        let mut values = vec![pad; dims[0] * dims[1] * dims[2]];
        for k in 0..field.nz {
            for j in 0..field.ny {
                for i in 0..field.nx {
                    values[(i + 1) + (j + 1) * dims[0] + (k + 1) * dims[0] * dims[1]] =
                        field.get(i, j, k);
                }
            }
        }

        SampleGrid {
            dims,
            values,
            origin: field.bounds.min,
            spacing: voxel_spacing(&field.bounds, [field.nx, field.ny, field.nz]),
        }
    }

    fn index(&self, i: usize, j: usize, k: usize) -> usize {
        i + j * self.dims[0] + k * self.dims[0] * self.dims[1]
    }

    /// World position of sample `(i, j, k)`; index 0 is the padding layer
    fn position(&self, index: usize) -> Vector3<f64> {
        let i = index % self.dims[0];
        let j = (index / self.dims[0]) % self.dims[1];
        let k = index / (self.dims[0] * self.dims[1]);
        let grid = Vector3::new(i as f64 - 0.5, j as f64 - 0.5, k as f64 - 0.5);
        self.origin + grid.component_mul(&self.spacing)
    }
}

/// Voxel edge lengths. Flat axes borrow the mean spacing of the others.
fn voxel_spacing(bounds: &Bounds, dims: [usize; 3]) -> Vector3<f64> {
    let extent = bounds.extent();
    let mut spacing = Vector3::new(
        extent.x / dims[0] as f64,
        extent.y / dims[1] as f64,
        extent.z / dims[2] as f64,
    );
    let positive: Vec<f64> = spacing.iter().copied().filter(|s| *s > 0.0).collect();
    let fallback = if positive.is_empty() {
        1.0
    } else {
        positive.iter().sum::<f64>() / positive.len() as f64
    };
    for s in spacing.iter_mut() {
        if !(*s > 0.0) {
            *s = fallback;
        }
    }
    spacing
}

/// Builds the triangle soup with vertices shared per sample edge
struct SurfaceBuilder<'a> {
    grid: &'a SampleGrid,
    isovalue: f64,
    edge_vertices: HashMap<(usize, usize), u32>,
    positions: Vec<Vector3<f64>>,
    indices: Vec<u32>,
}

impl<'a> SurfaceBuilder<'a> {
    fn new(grid: &'a SampleGrid, isovalue: f64) -> SurfaceBuilder<'a> {
        SurfaceBuilder {
            grid,
            isovalue,
            edge_vertices: HashMap::new(),
            positions: Vec::new(),
            indices: Vec::new(),
        }
    }

    /// Vertex where the surface crosses the edge between two samples
    fn edge_vertex(&mut self, a: usize, b: usize) -> u32 {
        let key = (a.min(b), a.max(b));
        if let Some(&vertex) = self.edge_vertices.get(&key) {
            return vertex;
        }

        let (sa, sb) = (self.grid.values[key.0], self.grid.values[key.1]);
        let ds = sb - sa;
        let t = if ds.abs() < 1e-12 {
            0.5
        } else {
            ((self.isovalue - sa) / ds).clamp(0.0, 1.0)
        };
        let (pa, pb) = (self.grid.position(key.0), self.grid.position(key.1));

        let vertex = self.positions.len() as u32;
        self.positions.push(pa + (pb - pa) * t);
        self.edge_vertices.insert(key, vertex);
        vertex
    }

    /// Adds a triangle facing along `outward`
    fn triangle(&mut self, mut tri: [u32; 3], outward: &Vector3<f64>) {
        if tri[0] == tri[1] || tri[1] == tri[2] || tri[0] == tri[2] {
            return;
        }
        let p = tri.map(|v| self.positions[v as usize]);
        let normal = (p[1] - p[0]).cross(&(p[2] - p[0]));
        if normal.dot(outward) < 0.0 {
            tri.swap(1, 2);
        }
        self.indices.extend(tri);
    }

    fn tetrahedron(&mut self, corners: [usize; 4]) {
        let solid: Vec<usize> = corners
            .iter()
            .copied()
            .filter(|&c| self.grid.values[c] >= self.isovalue)
            .collect();
        let void: Vec<usize> = corners
            .iter()
            .copied()
            .filter(|&c| self.grid.values[c] < self.isovalue)
            .collect();
        if solid.is_empty() || void.is_empty() {
            return;
        }

        let centroid = |samples: &[usize]| -> Vector3<f64> {
            samples
                .iter()
                .map(|&s| self.grid.position(s))
                .sum::<Vector3<f64>>()
                / samples.len() as f64
        };
        let outward = centroid(&void) - centroid(&solid);

        match (solid.as_slice(), void.as_slice()) {
            (&[s], others) | (others, &[s]) if others.len() == 3 => {
                let tri = [
                    self.edge_vertex(s, others[0]),
                    self.edge_vertex(s, others[1]),
                    self.edge_vertex(s, others[2]),
                ];
                self.triangle(tri, &outward);
            }
            (&[a0, a1], &[b0, b1]) => {
                let quad = [
                    self.edge_vertex(a0, b0),
                    self.edge_vertex(a0, b1),
                    self.edge_vertex(a1, b1),
                    self.edge_vertex(a1, b0),
                ];
                self.triangle([quad[0], quad[1], quad[2]], &outward);
                self.triangle([quad[0], quad[2], quad[3]], &outward);
            }
            _ => {}
        }
    }

    fn extract(mut self) -> (Vec<Vector3<f64>>, Vec<u32>) {
        let [px, py, pz] = self.grid.dims;
        for k in 0..pz - 1 {
            for j in 0..py - 1 {
                for i in 0..px - 1 {
                    let cube = CUBE_CORNERS.map(|[di, dj, dk]| self.grid.index(i + di, j + dj, k + dk));
                    for tet in CUBE_TETRAHEDRA {
                        self.tetrahedron(tet.map(|c| cube[c]));
                    }
                }
            }
        }
        (self.positions, self.indices)
    }
}

/// Planar texture coordinates over the xy bounds of the mesh
fn planar_uvs(positions: &[Vector3<f64>]) -> Vec<f32> {
    let Some(bounds) = Bounds::from_points(positions) else {
        return Vec::new();
    };
    let extent = bounds.extent();
    let scale = |v: f64, min: f64, size: f64| -> f32 {
        if size > 0.0 {
            ((v - min) / size) as f32
        } else {
            0.0
        }
    };
    positions
        .iter()
        .flat_map(|p| {
            [
                scale(p.x, bounds.min.x, extent.x),
                scale(p.y, bounds.min.y, extent.y),
            ]
        })
        .collect()
}

/// Extracts, smooths and finishes a renderable surface from `field`
pub fn generate_geometry_from_voxels(
    field: &DensityField,
    options: &ReconstructOptions,
) -> Result<VoxelGeometry> {
    validate_field(field)?;

    let cubic = resample_to_cubic(field);
    let isovalue = resolve_isovalue(&cubic.densities, options.isovalue);
    let grid = SampleGrid::new(&cubic);
    let (positions, indices) = SurfaceBuilder::new(&grid, isovalue).extract();

    let mut mesh = RenderMesh {
        positions: positions
            .iter()
            .flat_map(|p| [p.x as f32, p.y as f32, p.z as f32])
            .collect(),
        indices,
        ..Default::default()
    };
    smooth_mesh(&mut mesh, &options.smoothing);
    mesh.recompute_normals();

    let smoothed: Vec<Vector3<f64>> = (0..mesh.vertex_count()).map(|i| mesh.position(i)).collect();
    mesh.uvs = planar_uvs(&smoothed);

    log::info!(
        "reconstructed {} triangles over {} vertices at isovalue {:.4}",
        mesh.triangle_count(),
        mesh.vertex_count(),
        isovalue
    );

    Ok(VoxelGeometry { mesh, isovalue })
}
