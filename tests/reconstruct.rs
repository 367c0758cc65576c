use nalgebra::Vector3;
use voxtopo::{
    generate_geometry_from_voxels,
    isosurface::{resample_to_cubic, resolve_isovalue, solid_fraction},
    Bounds, DensityField, ReconstructOptions, SmoothingMethod, TopoError,
};

/// Deterministic pseudo-random densities in [0, 1)
fn noise(len: usize, seed: u64) -> Vec<f64> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 11) as f64 / (1u64 << 53) as f64
        })
        .collect()
}

fn field(dims: [usize; 3], densities: Vec<f64>) -> DensityField {
    let bounds = Bounds::new(
        Vector3::zeros(),
        Vector3::new(dims[0] as f64, dims[1] as f64, dims[2] as f64),
    );
    DensityField::new(densities, dims, bounds)
}

#[test]
fn every_nonempty_field_gives_a_consistent_mesh() {
    let shapes = [[1, 1, 1], [5, 3, 1], [4, 4, 4], [6, 2, 3], [7, 7, 1]];
    for (seed, dims) in shapes.into_iter().enumerate() {
        let len = dims[0] * dims[1] * dims[2];
        for densities in [noise(len, seed as u64), vec![0.0; len], vec![0.3; len]] {
            for smoothing in [SmoothingMethod::None, SmoothingMethod::taubin()] {
                let options = ReconstructOptions {
                    isovalue: 0.5,
                    smoothing,
                };
                let geometry = generate_geometry_from_voxels(&field(dims, densities.clone()), &options)
                    .unwrap();
                let mesh = geometry.mesh;
                assert!(!mesh.is_empty(), "{dims:?}");
                assert!(mesh.is_consistent());
                assert_eq!(mesh.indices.len() % 3, 0);
                assert!(mesh.positions.iter().all(|v| v.is_finite()));
                assert_eq!(mesh.normals.len(), mesh.positions.len());
            }
        }
    }
}

#[test]
fn empty_field_is_a_reconstruction_error() {
    let result = generate_geometry_from_voxels(&field([0, 0, 0], Vec::new()), &ReconstructOptions::default());
    assert!(matches!(result, Err(TopoError::Reconstruct(_))));
}

#[test]
fn sparse_solid_moves_the_isovalue() {
    // 2% of the voxels are solid at the requested isovalue
    let mut densities = vec![0.1; 1000];
    for d in densities.iter_mut().take(20) {
        *d = 0.9;
    }
    for (i, d) in densities.iter_mut().enumerate().skip(20) {
        *d = 0.1 + 0.3 * (i as f64 / 1000.0);
    }
    assert!(solid_fraction(&densities, 0.5) < 0.05);

    let geometry = generate_geometry_from_voxels(
        &field([10, 10, 10], densities.clone()),
        &ReconstructOptions {
            isovalue: 0.5,
            smoothing: SmoothingMethod::None,
        },
    )
    .unwrap();
    assert_ne!(geometry.isovalue, 0.5);
    assert_eq!(geometry.isovalue, resolve_isovalue(&densities, 0.5));
    assert!(solid_fraction(&densities, geometry.isovalue) >= 0.05);
}

#[test]
fn cubic_resampling_reproduces_cubic_fields() {
    let cubic = field([5, 5, 5], noise(125, 9));
    assert_eq!(resample_to_cubic(&cubic), cubic);

    let planar = field([6, 6, 1], noise(36, 3));
    assert_eq!(resample_to_cubic(&planar), planar);

    // upsampled once, the result is already cubic and stays put
    let stretched = resample_to_cubic(&field([6, 3, 2], noise(36, 4)));
    assert_eq!(resample_to_cubic(&stretched), stretched);
}
