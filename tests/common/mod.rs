#![allow(dead_code)]

use nalgebra::Vector3;
use voxtopo::{extract_goal_markers, FeModel, Goal, Mesh, RunRequest, SimpParams, SolverFrame};

/// Vertex lattice over `[0, nx] x [0, ny]` in the z = 0 plane, one vertex per
/// grid node. Returns the mesh and the index of vertex `(i, j)`.
pub fn lattice(nx: usize, ny: usize) -> (Mesh, impl Fn(usize, usize) -> usize) {
    let mut positions = Vec::new();
    for j in 0..=ny {
        for i in 0..=nx {
            positions.extend([i as f64, j as f64, 0.0]);
        }
    }
    (Mesh::new(positions), move |i, j| i + j * (nx + 1))
}

/// Cantilever goals: the whole x = 0 edge anchored, a unit downward load on
/// the middle of the x = max edge.
pub fn cantilever(params: &SimpParams) -> (Mesh, Vec<Goal>) {
    let (nx, ny) = (params.nx, params.ny);
    let (mesh, vertex) = lattice(nx, ny);

    let anchored = (0..=ny).map(|j| vertex(0, j)).collect();
    let loaded = (ny / 2 - 1..=ny / 2 + 1).map(|j| vertex(nx, j)).collect();
    let goals = vec![
        Goal::anchor(anchored),
        Goal::load(loaded, Vector3::new(0.0, -1.0, 0.0)),
    ];
    (mesh, goals)
}

pub fn request(params: SimpParams) -> RunRequest {
    let (mesh, goals) = cantilever(&params);
    let bounds = mesh.bounds().unwrap();
    let model = FeModel::new(&params, &bounds).unwrap();
    let markers = extract_goal_markers(&mesh, &goals, &model);
    RunRequest {
        mesh,
        markers,
        params,
    }
}

/// Small problem that always runs to its iteration cap
pub fn short_params(max_iters: usize) -> SimpParams {
    SimpParams {
        nx: 16,
        ny: 8,
        penal_start: 3.0,
        penal_end: 3.0,
        beta_max: 1.0,
        tol_change: 1e-12,
        max_iters,
        ..Default::default()
    }
}

/// Frames with the wall-clock timings removed
pub fn untimed(frames: Vec<SolverFrame>) -> Vec<SolverFrame> {
    frames
        .into_iter()
        .map(|f| SolverFrame { timings: None, ..f })
        .collect()
}
