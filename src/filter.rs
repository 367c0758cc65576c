//! Density filtering and Heaviside projection of the design field.

use nalgebra_sparse::{CooMatrix, CsrMatrix};

use crate::model::FeModel;

/// Projection threshold
pub const PROJECTION_ETA: f64 = 0.5;

/// Linear density filter with weights `max(0, rmin - distance)`, distances
/// measured in element units.
#[derive(Debug, Clone)]
pub struct DensityFilter {
    weights: CsrMatrix<f64>,
    weight_sums: Vec<f64>,
}

impl DensityFilter {
    pub fn new(model: &FeModel, rmin: f64) -> DensityFilter {
        let reach = (rmin.ceil() as i64 - 1).max(0);
        let reach_z = if model.is_2d() { 0 } else { reach };
        let dims = [model.nelx as i64, model.nely as i64, model.nelz as i64];

        let mut coo = CooMatrix::new(model.num_elements, model.num_elements);
        let mut weight_sums = vec![0.0; model.num_elements];

        for element in 0..model.num_elements {
            let (i, j, k) = model.element_coords(element);
            let (i, j, k) = (i as i64, j as i64, k as i64);

            for dk in -reach_z..=reach_z {
                for dj in -reach..=reach {
                    for di in -reach..=reach {
                        let (ni, nj, nk) = (i + di, j + dj, k + dk);
                        if ni < 0 || nj < 0 || nk < 0 || ni >= dims[0] || nj >= dims[1] || nk >= dims[2]
                        {
                            continue;
                        }
                        let distance = ((di * di + dj * dj + dk * dk) as f64).sqrt();
                        let weight = rmin - distance;
                        if weight <= 0.0 {
                            continue;
                        }

                        let neighbor = model.element_index(ni as usize, nj as usize, nk as usize);
                        coo.push(element, neighbor, weight);
                        weight_sums[element] += weight;
                    }
                }
            }
        }

        DensityFilter {
            weights: CsrMatrix::from(&coo),
            weight_sums,
        }
    }

    /// Weighted neighborhood average of `x`
    pub fn apply(&self, x: &[f64]) -> Vec<f64> {
        self.weights
            .row_iter()
            .zip(&self.weight_sums)
            .map(|(row, sum)| {
                let total: f64 = row
                    .col_indices()
                    .iter()
                    .zip(row.values())
                    .map(|(&col, &w)| w * x[col])
                    .sum();
                total / sum
            })
            .collect()
    }

    /// Chain rule through the filter: maps a gradient with respect to the
    /// filtered field onto the unfiltered one.
    pub fn backpropagate(&self, gradient: &[f64]) -> Vec<f64> {
        let mut result = vec![0.0; gradient.len()];
        for ((row, sum), g) in self.weights.row_iter().zip(&self.weight_sums).zip(gradient) {
            let scaled = g / sum;
            for (&col, &w) in row.col_indices().iter().zip(row.values()) {
                result[col] += w * scaled;
            }
        }
        result
    }
}

/// Smoothed Heaviside step pushing filtered densities towards 0 or 1.
/// Inactive while `beta <= 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub beta: f64,
}

impl Projection {
    pub fn new(beta: f64) -> Projection {
        Projection { beta }
    }

    pub fn is_active(&self) -> bool {
        self.beta > 1.0
    }

    fn denominator(&self) -> f64 {
        (self.beta * PROJECTION_ETA).tanh() + (self.beta * (1.0 - PROJECTION_ETA)).tanh()
    }

    pub fn project(&self, filtered: &[f64]) -> Vec<f64> {
        if !self.is_active() {
            return filtered.to_vec();
        }
        let offset = (self.beta * PROJECTION_ETA).tanh();
        let denominator = self.denominator();
        filtered
            .iter()
            .map(|x| (offset + (self.beta * (x - PROJECTION_ETA)).tanh()) / denominator)
            .collect()
    }

    /// Derivative of the projection at each filtered density
    pub fn derivative(&self, filtered: &[f64]) -> Vec<f64> {
        if !self.is_active() {
            return vec![1.0; filtered.len()];
        }
        let denominator = self.denominator();
        filtered
            .iter()
            .map(|x| {
                let t = (self.beta * (x - PROJECTION_ETA)).tanh();
                self.beta * (1.0 - t * t) / denominator
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{datatypes::Bounds, params::SimpParams};
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn model(nz: usize) -> FeModel {
        let params = SimpParams {
            nx: 6,
            ny: 5,
            nz,
            ..Default::default()
        };
        let bounds = Bounds::new(Vector3::zeros(), Vector3::new(6.0, 5.0, 2.0));
        FeModel::new(&params, &bounds).unwrap()
    }

    #[test]
    fn uniform_field_is_a_fixed_point() {
        for nz in [1, 3] {
            let model = model(nz);
            let filter = DensityFilter::new(&model, 2.5);
            let filtered = filter.apply(&vec![0.4; model.num_elements]);
            for value in filtered {
                assert_relative_eq!(value, 0.4, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn small_radius_is_identity() {
        let model = model(1);
        let filter = DensityFilter::new(&model, 1.0);
        let x: Vec<f64> = (0..model.num_elements).map(|e| e as f64).collect();
        assert_eq!(filter.apply(&x), x);
    }

    #[test]
    fn backpropagation_is_the_adjoint() {
        let model = model(2);
        let filter = DensityFilter::new(&model, 1.8);
        let x: Vec<f64> = (0..model.num_elements).map(|e| ((e * 7) % 11) as f64).collect();
        let y: Vec<f64> = (0..model.num_elements).map(|e| ((e * 3) % 5) as f64 - 2.0).collect();

        let lhs: f64 = filter.apply(&x).iter().zip(&y).map(|(a, b)| a * b).sum();
        let rhs: f64 = x.iter().zip(filter.backpropagate(&y)).map(|(a, b)| a * b).sum();
        assert_relative_eq!(lhs, rhs, epsilon = 1e-9);
    }

    #[test]
    fn projection_keeps_endpoints_and_order() {
        let projection = Projection::new(8.0);
        let values = [0.0, 0.2, 0.5, 0.8, 1.0];
        let projected = projection.project(&values);
        assert_relative_eq!(projected[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(projected[4], 1.0, epsilon = 1e-12);
        assert!(projected.windows(2).all(|w| w[0] < w[1]));
        assert!(projected[1] < 0.2 && projected[3] > 0.8);
    }

    #[test]
    fn projection_derivative_matches_difference_quotient() {
        let projection = Projection::new(4.0);
        let x = 0.37;
        let h = 1e-6;
        let numeric = (projection.project(&[x + h])[0] - projection.project(&[x - h])[0]) / (2.0 * h);
        assert_relative_eq!(projection.derivative(&[x])[0], numeric, epsilon = 1e-6);
    }

    #[test]
    fn inactive_projection_is_identity() {
        let projection = Projection::new(1.0);
        assert_eq!(projection.project(&[0.3, 0.9]), vec![0.3, 0.9]);
        assert_eq!(projection.derivative(&[0.3]), vec![1.0]);
    }
}
