//! Umbrella-operator smoothing of reconstructed surfaces.
//!
//! Plain Laplacian smoothing pulls every vertex towards the centroid of its
//! neighbors and shrinks closed meshes. Taubin smoothing follows each
//! shrinking pass with an inflating pass (`mu < 0`, `|mu| > lambda`) which
//! keeps the volume roughly in place.

use std::collections::BTreeSet;

use nalgebra::Vector3;

use crate::datatypes::RenderMesh;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SmoothingMethod {
    None,
    Laplacian { lambda: f64, iterations: usize },
    Taubin { lambda: f64, mu: f64, iterations: usize },
}

impl Default for SmoothingMethod {
    fn default() -> Self {
        SmoothingMethod::taubin()
    }
}

impl SmoothingMethod {
    pub fn taubin() -> SmoothingMethod {
        SmoothingMethod::Taubin {
            lambda: 0.5,
            mu: -0.53,
            iterations: 10,
        }
    }

    pub fn laplacian() -> SmoothingMethod {
        SmoothingMethod::Laplacian {
            lambda: 0.5,
            iterations: 20,
        }
    }
}

/// Sorted neighbor list of every vertex, from the triangle index list
pub fn vertex_adjacency(mesh: &RenderMesh) -> Vec<Vec<u32>> {
    let mut neighbors = vec![BTreeSet::new(); mesh.vertex_count()];
    for tri in mesh.indices.chunks_exact(3) {
        for (a, b) in [(tri[0], tri[1]), (tri[1], tri[2]), (tri[2], tri[0])] {
            if a == b {
                continue;
            }
            neighbors[a as usize].insert(b);
            neighbors[b as usize].insert(a);
        }
    }
    neighbors
        .into_iter()
        .map(|set| set.into_iter().collect())
        .collect()
}

/// Moves every vertex `factor` of the way towards its neighbor centroid.
/// All offsets are computed from the positions before the pass.
fn laplacian_step(mesh: &mut RenderMesh, neighbors: &[Vec<u32>], factor: f64) {
    let offsets: Vec<Option<Vector3<f64>>> = neighbors
        .iter()
        .enumerate()
        .map(|(i, adjacent)| {
            if adjacent.is_empty() {
                return None;
            }
            let centroid = adjacent
                .iter()
                .map(|&n| mesh.position(n as usize))
                .sum::<Vector3<f64>>()
                / adjacent.len() as f64;
            Some((centroid - mesh.position(i)) * factor)
        })
        .collect();

    for (i, offset) in offsets.into_iter().enumerate() {
        if let Some(offset) = offset {
            let moved = mesh.position(i) + offset;
            mesh.set_position(i, &moved);
        }
    }
}

/// Smooths `mesh` in place. Normals are left for the caller to recompute.
pub fn smooth_mesh(mesh: &mut RenderMesh, method: &SmoothingMethod) {
    if mesh.is_empty() {
        return;
    }
    let neighbors = vertex_adjacency(mesh);

    match *method {
        SmoothingMethod::None => {}
        SmoothingMethod::Laplacian { lambda, iterations } => {
            for _ in 0..iterations {
                laplacian_step(mesh, &neighbors, lambda);
            }
        }
        SmoothingMethod::Taubin {
            lambda,
            mu,
            iterations,
        } => {
            for _ in 0..iterations {
                laplacian_step(mesh, &neighbors, lambda);
                laplacian_step(mesh, &neighbors, mu);
            }
        }
    }
    log::debug!("smoothed {} vertices with {:?}", mesh.vertex_count(), method);
}
