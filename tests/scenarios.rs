mod common;

use nalgebra::Vector3;
use voxtopo::{
    extract_goal_markers, solver::gray_fraction, BoundaryConditions, Bounds, FeModel, Goal, Mesh,
    SimpParams, SimpSolver,
};

#[test]
fn cantilever_converges_to_the_volume_target() {
    let params = SimpParams {
        nx: 40,
        ny: 40,
        nz: 1,
        vol_frac: 0.4,
        penal_start: 3.0,
        penal_end: 3.0,
        beta_max: 1.0,
        tol_change: 0.02,
        gray_tol: 0.5,
        max_iters: 400,
        ..Default::default()
    };
    let request = common::request(params.clone());
    let mut solver = SimpSolver::from_markers(&request.mesh, &request.markers, params.clone()).unwrap();

    let mut frames = Vec::new();
    let converged = solver.run(|frame| frames.push(frame)).unwrap();
    let last = frames.last().unwrap();

    assert!(converged);
    assert!(last.converged);
    assert!((last.volume - 0.4).abs() <= params.tol_change);
    assert!(last.compliance < frames[0].compliance);
    assert!(frames.windows(2).all(|w| w[0].iteration < w[1].iteration));
}

#[test]
fn default_cantilever_converges_with_full_continuation() {
    let params = SimpParams::default();
    let request = common::request(params.clone());
    let mut solver = SimpSolver::from_markers(&request.mesh, &request.markers, params.clone()).unwrap();

    let mut frames = Vec::new();
    let converged = solver.run(|frame| frames.push(frame)).unwrap();
    let last = frames.last().unwrap();

    assert!(converged);
    assert!(last.converged);
    assert!(last.iteration < params.max_iters);
    assert_eq!(last.penalty, params.penal_end);
    assert_eq!(last.beta, params.beta_max);
    assert!((last.volume - params.vol_frac).abs() <= params.tol_change);
    assert!(gray_fraction(&last.densities) < params.gray_tol);
}

#[test]
fn continuation_reaches_the_final_penalty_and_sharpness() {
    let params = SimpParams {
        nx: 20,
        ny: 10,
        penal_start: 1.0,
        penal_end: 3.0,
        penal_step: 1.0,
        beta_max: 4.0,
        beta_multiplier: 2.0,
        cont_stable_iters: 2,
        cont_tol_rel: 0.05,
        max_iters: 150,
        ..Default::default()
    };
    let request = common::request(params.clone());
    let mut solver = SimpSolver::from_markers(&request.mesh, &request.markers, params).unwrap();

    let mut frames = Vec::new();
    solver.run(|frame| frames.push(frame)).unwrap();

    // penalty ramps first, then beta
    assert!(frames.windows(2).all(|w| w[0].penalty <= w[1].penalty && w[0].beta <= w[1].beta));
    let first_sharp = frames.iter().position(|f| f.beta > 1.0).unwrap();
    assert_eq!(frames[first_sharp].penalty, 3.0);
    assert_eq!(frames.last().unwrap().beta, 4.0);
    assert!(frames.iter().all(|f| f.volume.is_finite() && f.compliance > 0.0));
}

/// 3x3 lattice; vertex 7 sits at (1, 2, 0)
fn small_mesh() -> Mesh {
    let mut positions = Vec::new();
    for j in 0..3 {
        for i in 0..3 {
            positions.extend([i as f64, j as f64, 0.0]);
        }
    }
    Mesh::new(positions)
}

fn small_model() -> FeModel {
    let params = SimpParams {
        nx: 2,
        ny: 2,
        ..Default::default()
    };
    let bounds = Bounds::new(Vector3::zeros(), Vector3::new(2.0, 2.0, 0.0));
    FeModel::new(&params, &bounds).unwrap()
}

#[test]
fn shared_vertex_belongs_to_the_load() {
    let mesh = small_mesh();
    let goals = vec![
        Goal::anchor(vec![0, 1, 7]),
        Goal::load(vec![7, 8], Vector3::new(0.0, -1.0, 0.0)),
    ];
    let markers = extract_goal_markers(&mesh, &goals, &small_model());
    let p7 = Vector3::new(1.0, 2.0, 0.0);

    assert!(markers.loads.iter().any(|l| l.positions.contains(&p7)));
    assert!(markers.anchors.iter().all(|a| !a.positions.contains(&p7)));
    assert!(markers.anchors.iter().all(|a| !a.vertices.contains(&7)));
    assert!(!markers.anchors.is_empty());
}

#[test]
fn coincident_anchor_and_load_never_both_survive() {
    let mesh = small_mesh();
    let goal_lists = vec![
        vec![Goal::anchor(vec![7]), Goal::load(vec![7], Vector3::new(0.0, -1.0, 0.0))],
        vec![Goal::anchor(vec![4, 5]), Goal::load(vec![4, 5], Vector3::new(1.0, 0.0, 0.0))],
        vec![Goal::anchor(vec![0, 1, 2]), Goal::load(vec![2, 5, 8], Vector3::new(0.0, -1.0, 0.0))],
        // fallback anchor at the lower corner against a load on vertex 0
        vec![Goal::load(vec![0], Vector3::new(0.0, 1.0, 0.0))],
    ];

    for goals in goal_lists {
        let markers = extract_goal_markers(&mesh, &goals, &small_model());
        for anchor in &markers.anchors {
            for load in &markers.loads {
                assert!((anchor.position - load.position).amax() > 1e-6);
                for p in &anchor.positions {
                    assert!(load.positions.iter().all(|q| (p - q).amax() > 1e-6));
                }
            }
        }
    }
}

#[test]
fn fully_coincident_goals_cannot_be_solved() {
    let mesh = small_mesh();
    let goals = vec![Goal::anchor(vec![7]), Goal::load(vec![7], Vector3::new(0.0, -1.0, 0.0))];
    let model = small_model();
    let markers = extract_goal_markers(&mesh, &goals, &model);
    assert!(markers.anchors.is_empty());
    assert!(BoundaryConditions::from_markers(&markers, &model).is_err());
}
