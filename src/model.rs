use nalgebra::{DMatrix, SMatrix, Vector3};

use crate::{
    datatypes::Bounds,
    error::{Result, TopoError},
    params::SimpParams,
};

const GAUSS_POINT: f64 = 0.577_350_269_189_625_8;

/// Structured finite element grid spanning the mesh bounds. Built once per
/// run and never changed afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct FeModel {
    pub nelx: usize,
    pub nely: usize,
    pub nelz: usize,
    /// Spatial dimension; 2 for plane stress, 3 for solid elements
    pub dim: usize,
    pub nodes_per_axis: [usize; 3],
    pub num_elements: usize,
    pub num_nodes: usize,
    pub num_dofs: usize,
    pub element_size: Vector3<f64>,
    pub bounds: Bounds,
}

impl FeModel {
    pub fn new(params: &SimpParams, bounds: &Bounds) -> Result<FeModel> {
        if params.nx == 0 || params.ny == 0 || params.nz == 0 {
            return Err(TopoError::Input(format!(
                "grid resolution must be positive, got {}x{}x{}",
                params.nx, params.ny, params.nz
            )));
        }
        if !bounds.is_finite() {
            return Err(TopoError::Input("mesh bounds are not finite".to_owned()));
        }

        let dim = if params.is_2d() { 2 } else { 3 };
        let extent = bounds.extent();
        for (axis, name) in ["x", "y", "z"].iter().enumerate().take(dim) {
            if extent[axis] <= 0.0 {
                return Err(TopoError::Input(format!(
                    "mesh has no extent along {name}, cannot span a design domain"
                )));
            }
        }

        let nodes_per_axis = [
            params.nx + 1,
            params.ny + 1,
            if dim == 2 { 1 } else { params.nz + 1 },
        ];
        let num_nodes = nodes_per_axis.iter().product::<usize>();
        let element_size = Vector3::new(
            extent.x / params.nx as f64,
            extent.y / params.ny as f64,
            if dim == 2 {
                1.0
            } else {
                extent.z / params.nz as f64
            },
        );

        Ok(FeModel {
            nelx: params.nx,
            nely: params.ny,
            nelz: params.nz,
            dim,
            nodes_per_axis,
            num_elements: params.num_elements(),
            num_nodes,
            num_dofs: num_nodes * dim,
            element_size,
            bounds: *bounds,
        })
    }

    pub fn is_2d(&self) -> bool {
        self.dim == 2
    }

    pub fn element_index(&self, i: usize, j: usize, k: usize) -> usize {
        i + j * self.nelx + k * self.nelx * self.nely
    }

    pub fn element_coords(&self, element: usize) -> (usize, usize, usize) {
        let i = element % self.nelx;
        let j = (element / self.nelx) % self.nely;
        let k = element / (self.nelx * self.nely);
        (i, j, k)
    }

    pub fn node_index(&self, i: usize, j: usize, k: usize) -> usize {
        let [nx, ny, _] = self.nodes_per_axis;
        i + j * nx + k * nx * ny
    }

    pub fn node_coords(&self, node: usize) -> (usize, usize, usize) {
        let [nx, ny, _] = self.nodes_per_axis;
        (node % nx, (node / nx) % ny, node / (nx * ny))
    }

    pub fn node_position(&self, node: usize) -> Vector3<f64> {
        let (i, j, k) = self.node_coords(node);
        let offset = Vector3::new(i as f64, j as f64, k as f64).component_mul(&self.element_size);
        let mut position = self.bounds.min + offset;
        if self.is_2d() {
            position.z = self.bounds.min.z;
        }
        position
    }

    /// Grid node closest to `point`, clamped onto the grid
    pub fn nearest_node(&self, point: &Vector3<f64>) -> usize {
        let local = (point - self.bounds.min).component_div(&self.element_size);
        let snap = |value: f64, count: usize| -> usize {
            if !value.is_finite() {
                return 0;
            }
            (value.round().max(0.0) as usize).min(count - 1)
        };

        let i = snap(local.x, self.nodes_per_axis[0]);
        let j = snap(local.y, self.nodes_per_axis[1]);
        let k = if self.is_2d() {
            0
        } else {
            snap(local.z, self.nodes_per_axis[2])
        };
        self.node_index(i, j, k)
    }

    /// Nodes of an element, counter-clockwise on the bottom face, then the top
    pub fn element_nodes(&self, element: usize) -> Vec<usize> {
        let (i, j, k) = self.element_coords(element);
        let mut nodes = vec![
            self.node_index(i, j, k),
            self.node_index(i + 1, j, k),
            self.node_index(i + 1, j + 1, k),
            self.node_index(i, j + 1, k),
        ];
        if !self.is_2d() {
            nodes.extend([
                self.node_index(i, j, k + 1),
                self.node_index(i + 1, j, k + 1),
                self.node_index(i + 1, j + 1, k + 1),
                self.node_index(i, j + 1, k + 1),
            ]);
        }
        nodes
    }

    pub fn element_dofs(&self, element: usize) -> Vec<usize> {
        self.element_nodes(element)
            .into_iter()
            .flat_map(|node| (0..self.dim).map(move |axis| node * self.dim + axis))
            .collect()
    }

    /// Stiffness matrix of one element for a unit Young's modulus. Every
    /// element of the grid shares it.
    pub fn element_stiffness(&self, poisson_ratio: f64) -> DMatrix<f64> {
        if self.is_2d() {
            let ke = compute_quad_stiffness_matrix(&self.element_size, poisson_ratio);
            DMatrix::from_column_slice(8, 8, ke.as_slice())
        } else {
            let ke = compute_hex_stiffness_matrix(&self.element_size, poisson_ratio);
            DMatrix::from_column_slice(24, 24, ke.as_slice())
        }
    }
}

/// Calculates the plane stress stress-strain matrix
///
/// # Arguments
/// * `poisson_ratio` - The poisson ratio for the model
/// * `youngs_modulus` - The modulus of elasticity of the model
///
/// # Returns
/// A 3x3 stress-strain matrix
pub fn compute_stress_strain_matrix(poisson_ratio: f64, youngs_modulus: f64) -> SMatrix<f64, 3, 3> {
    let mut stress_strain_mat: SMatrix<f64, 3, 3> = nalgebra::matrix![
        1.0, poisson_ratio, 0.0;
        poisson_ratio, 1.0, 0.0;
        0.0, 0.0, (1.0 - poisson_ratio)/2.0;
    ];

    stress_strain_mat *= youngs_modulus / (1.0 - f64::powi(poisson_ratio, 2));

    stress_strain_mat
}

/// Calculates the isotropic 3D stress-strain matrix, engineering shear
/// strains ordered xy, yz, zx
pub fn compute_solid_stress_strain_matrix(
    poisson_ratio: f64,
    youngs_modulus: f64,
) -> SMatrix<f64, 6, 6> {
    let nu = poisson_ratio;
    let scale = youngs_modulus / ((1.0 + nu) * (1.0 - 2.0 * nu));
    let shear = (1.0 - 2.0 * nu) / 2.0;

    let mut stress_strain_mat = SMatrix::<f64, 6, 6>::zeros();
    for row in 0..3 {
        for col in 0..3 {
            stress_strain_mat[(row, col)] = if row == col { 1.0 - nu } else { nu };
        }
        stress_strain_mat[(row + 3, row + 3)] = shear;
    }

    stress_strain_mat * scale
}

/// Bilinear quadrilateral stiffness, integrated with 2x2 Gauss points
///
/// # Arguments
/// * `size` - Element edge lengths; `z` is the plate thickness
/// * `poisson_ratio` - The poisson ratio for the model
///
/// # Returns
/// An 8x8 stiffness matrix for a unit Young's modulus
pub fn compute_quad_stiffness_matrix(size: &Vector3<f64>, poisson_ratio: f64) -> SMatrix<f64, 8, 8> {
    const CORNERS: [(f64, f64); 4] = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

    let stress_strain_mat = compute_stress_strain_matrix(poisson_ratio, 1.0);
    let (hx, hy, thickness) = (size.x, size.y, size.z);
    let det_jacobian = hx * hy / 4.0;

    let mut stiffness = SMatrix::<f64, 8, 8>::zeros();
    for xi in [-GAUSS_POINT, GAUSS_POINT] {
        for eta in [-GAUSS_POINT, GAUSS_POINT] {
            let mut strain_displacement_mat = SMatrix::<f64, 3, 8>::zeros();
            for (a, (xa, ya)) in CORNERS.iter().enumerate() {
                let dn_dx = xa * (1.0 + eta * ya) / 4.0 * 2.0 / hx;
                let dn_dy = ya * (1.0 + xi * xa) / 4.0 * 2.0 / hy;

                strain_displacement_mat[(0, 2 * a)] = dn_dx;
                strain_displacement_mat[(1, 2 * a + 1)] = dn_dy;
                strain_displacement_mat[(2, 2 * a)] = dn_dy;
                strain_displacement_mat[(2, 2 * a + 1)] = dn_dx;
            }

            stiffness += strain_displacement_mat.transpose()
                * stress_strain_mat
                * strain_displacement_mat
                * det_jacobian
                * thickness;
        }
    }

    stiffness
}

/// Trilinear hexahedron stiffness, integrated with 2x2x2 Gauss points
///
/// # Returns
/// A 24x24 stiffness matrix for a unit Young's modulus
pub fn compute_hex_stiffness_matrix(size: &Vector3<f64>, poisson_ratio: f64) -> SMatrix<f64, 24, 24> {
    const CORNERS: [(f64, f64, f64); 8] = [
        (-1.0, -1.0, -1.0),
        (1.0, -1.0, -1.0),
        (1.0, 1.0, -1.0),
        (-1.0, 1.0, -1.0),
        (-1.0, -1.0, 1.0),
        (1.0, -1.0, 1.0),
        (1.0, 1.0, 1.0),
        (-1.0, 1.0, 1.0),
    ];

    let stress_strain_mat = compute_solid_stress_strain_matrix(poisson_ratio, 1.0);
    let det_jacobian = size.x * size.y * size.z / 8.0;

    let mut stiffness = SMatrix::<f64, 24, 24>::zeros();
    for xi in [-GAUSS_POINT, GAUSS_POINT] {
        for eta in [-GAUSS_POINT, GAUSS_POINT] {
            for zeta in [-GAUSS_POINT, GAUSS_POINT] {
                let mut strain_displacement_mat = SMatrix::<f64, 6, 24>::zeros();
                for (a, (xa, ya, za)) in CORNERS.iter().enumerate() {
                    let dn_dx = xa * (1.0 + eta * ya) * (1.0 + zeta * za) / 8.0 * 2.0 / size.x;
                    let dn_dy = ya * (1.0 + xi * xa) * (1.0 + zeta * za) / 8.0 * 2.0 / size.y;
                    let dn_dz = za * (1.0 + xi * xa) * (1.0 + eta * ya) / 8.0 * 2.0 / size.z;
                    let c = 3 * a;

                    strain_displacement_mat[(0, c)] = dn_dx;
                    strain_displacement_mat[(1, c + 1)] = dn_dy;
                    strain_displacement_mat[(2, c + 2)] = dn_dz;
                    strain_displacement_mat[(3, c)] = dn_dy;
                    strain_displacement_mat[(3, c + 1)] = dn_dx;
                    strain_displacement_mat[(4, c + 1)] = dn_dz;
                    strain_displacement_mat[(4, c + 2)] = dn_dy;
                    strain_displacement_mat[(5, c)] = dn_dz;
                    strain_displacement_mat[(5, c + 2)] = dn_dx;
                }

                stiffness += strain_displacement_mat.transpose()
                    * stress_strain_mat
                    * strain_displacement_mat
                    * det_jacobian;
            }
        }
    }

    stiffness
}
