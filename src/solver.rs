use std::time::Instant;

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{CooMatrix, CsrMatrix};

use argmin::{
    core::{
        observers::{Observe, ObserverMode},
        Error, Executor, Operator, State, KV,
    },
    solver::conjugategradient::ConjugateGradient,
};

use crate::{
    boundary::{BoundaryConditions, GoalMarkers},
    datatypes::{FeDiagnostics, Mesh, SolverFrame, StageTimings},
    error::{Result, TopoError},
    filter::{DensityFilter, Projection},
    model::FeModel,
    params::SimpParams,
};

/// Densities strictly between these bounds count as gray
pub const GRAY_BAND: (f64, f64) = (0.1, 0.9);
/// Relative width at which the Lagrange multiplier bisection stops
const BISECTION_TOLERANCE: f64 = 1e-4;
/// Smallest fraction of the move limit after repeated rollbacks
const MIN_MOVE_SCALE: f64 = 0.125;
const CG_LOG_EVERY: u64 = 250;
/// Volume overshoot still accepted as a feasible checkpoint
const VOLUME_SLACK: f64 = 1e-3;

/// Sparse matrix-vector product for the conjugate gradient operator
fn multiply(a: &CsrMatrix<f64>, x: &[f64]) -> Vec<f64> {
    a.row_iter()
        .map(|row| {
            row.col_indices()
                .iter()
                .zip(row.values())
                .map(|(&col, &value)| value * x[col])
                .sum()
        })
        .collect()
}

fn norm(x: &[f64]) -> f64 {
    x.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Runs multiplication for Conjugate Gradient Solver
struct ConjugateGradientOperator<'a> {
    a: &'a CsrMatrix<f64>,
}

impl<'a> Operator for ConjugateGradientOperator<'a> {
    type Param = Vec<f64>;
    type Output = Vec<f64>;

    fn apply(&self, x: &Self::Param) -> std::result::Result<Self::Output, Error> {
        Ok(multiply(self.a, x))
    }
}

/// Traces the residual of long linear solves
struct ConjugateGradientObserver {
    target: f64,
}

impl<I> Observe<I> for ConjugateGradientObserver
where
    I: State<Float = f64>,
{
    fn observe_iter(&mut self, state: &I, _kv: &KV) -> std::result::Result<(), Error> {
        log::trace!(
            "cg iteration {}: residual {:.3e} (target {:.3e})",
            state.get_iter(),
            state.get_cost(),
            self.target
        );
        Ok(())
    }
}

/// Result of one linear solve
struct LinearSolution {
    x: Vec<f64>,
    iterations: u64,
    relative_residual: f64,
}

/// Solves a system of equations using the conjugate gradient method.
///
/// This function returns an approximation for x in `Ax=b`, starting from
/// `initial_guess`, stopping once the residual falls below `tolerance`
/// relative to `|b|` or after `max_iters` iterations.
///
/// # Arguments
/// * `a` - A square positive definite matrix
/// * `b` - A vector of the solutions to the system
fn run_conjugate_gradient(
    a: &CsrMatrix<f64>,
    b: &[f64],
    initial_guess: Vec<f64>,
    tolerance: f64,
    max_iters: u64,
) -> Result<LinearSolution> {
    let b_norm = norm(b);
    if b_norm == 0.0 {
        return Ok(LinearSolution {
            x: vec![0.0; b.len()],
            iterations: 0,
            relative_residual: 0.0,
        });
    }

    let relative_residual = |x: &[f64]| -> f64 {
        let ax = multiply(a, x);
        let r: Vec<f64> = b.iter().zip(&ax).map(|(bi, axi)| bi - axi).collect();
        norm(&r) / b_norm
    };

    let initial_residual = relative_residual(&initial_guess);
    if initial_residual <= tolerance {
        return Ok(LinearSolution {
            x: initial_guess,
            iterations: 0,
            relative_residual: initial_residual,
        });
    }

    let target = tolerance * b_norm;
    let solver: ConjugateGradient<_, f64> = ConjugateGradient::new(b.to_vec());
    let operator = ConjugateGradientOperator { a };

    let res = Executor::new(operator, solver)
        .configure(|state| {
            state
                .param(initial_guess.clone())
                .max_iters(max_iters)
                .target_cost(target)
        })
        .add_observer(
            ConjugateGradientObserver { target },
            ObserverMode::Every(CG_LOG_EVERY),
        )
        .run()
        .map_err(|err| TopoError::Solver(format!("Conjugate Gradient error: {err}")))?;

    let iterations = res.state().get_iter();
    let candidates = [res.state().best_param.clone(), res.state().param.clone()];
    let x = candidates
        .into_iter()
        .flatten()
        .find(|x| x.iter().all(|v| v.is_finite()))
        .unwrap_or(initial_guess);

    Ok(LinearSolution {
        relative_residual: relative_residual(&x),
        x,
        iterations,
    })
}

/// Compliance regressed past the tolerated fraction of the best value
pub fn regressed(compliance: f64, best: f64, threshold: f64) -> bool {
    compliance > best * (1.0 + threshold)
}

/// Fraction of densities in the gray band
pub fn gray_fraction(densities: &[f64]) -> f64 {
    if densities.is_empty() {
        return 0.0;
    }
    let gray = densities
        .iter()
        .filter(|&&d| d > GRAY_BAND.0 && d < GRAY_BAND.1)
        .count();
    gray as f64 / densities.len() as f64
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len().max(1) as f64
}

#[derive(Debug, Clone)]
struct Checkpoint {
    compliance: f64,
    design: Vec<f64>,
}

/// What a single call to [`SimpSolver::step`] produced
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub iteration: usize,
    /// Present when the iteration falls on the emission cadence, converged,
    /// or ended the run
    pub frame: Option<SolverFrame>,
    pub converged: bool,
    pub terminal: bool,
}

/// Iterative SIMP compliance minimizer. Owns every piece of per-run state;
/// nothing in here is shared with the caller.
pub struct SimpSolver {
    params: SimpParams,
    element_stiffness: DMatrix<f64>,
    element_dofs: Vec<Vec<usize>>,
    free_index: Vec<Option<usize>>,
    forces: Vec<f64>,
    filter: DensityFilter,

    design: Vec<f64>,
    displacement: Vec<f64>,
    iteration: usize,
    penalty: f64,
    beta: f64,
    move_scale: f64,
    stable_iters: usize,
    calm_iters: usize,
    previous_compliance: Option<f64>,
    checkpoint: Option<Checkpoint>,
    finished: bool,
}

impl SimpSolver {
    pub fn new(model: &FeModel, bcs: &BoundaryConditions, params: SimpParams) -> Result<SimpSolver> {
        params.validate()?;
        if [model.nelx, model.nely, model.nelz] != [params.nx, params.ny, params.nz] {
            return Err(TopoError::Solver(
                "model resolution does not match the parameters".to_owned(),
            ));
        }
        if let Some(dof) = bcs
            .fixed
            .iter()
            .chain(bcs.forces.keys())
            .find(|&&dof| dof >= model.num_dofs)
        {
            return Err(TopoError::Solver(format!(
                "boundary condition on dof {} outside a model with {} dofs",
                dof, model.num_dofs
            )));
        }

        let mut free_index = vec![None; model.num_dofs];
        let mut free_count = 0;
        for (dof, slot) in free_index.iter_mut().enumerate() {
            if !bcs.fixed.contains(&dof) {
                *slot = Some(free_count);
                free_count += 1;
            }
        }
        if free_count == 0 {
            return Err(TopoError::Solver("every degree of freedom is fixed".to_owned()));
        }

        let full_forces = bcs.force_vector(model.num_dofs);
        let forces: Vec<f64> = (0..model.num_dofs)
            .filter(|&dof| free_index[dof].is_some())
            .map(|dof| full_forces[dof])
            .collect();

        let element_dofs = (0..model.num_elements)
            .map(|e| model.element_dofs(e))
            .collect();

        log::info!(
            "simp: {}x{}x{} grid, {} elements, {} free of {} dofs",
            model.nelx,
            model.nely,
            model.nelz,
            model.num_elements,
            free_count,
            model.num_dofs
        );

        Ok(SimpSolver {
            element_stiffness: model.element_stiffness(params.poisson_ratio),
            filter: DensityFilter::new(model, params.rmin),
            design: vec![params.vol_frac; model.num_elements],
            displacement: vec![0.0; free_count],
            penalty: params.penal_start,
            beta: 1.0,
            move_scale: 1.0,
            iteration: 0,
            stable_iters: 0,
            calm_iters: 0,
            previous_compliance: None,
            checkpoint: None,
            finished: false,
            element_dofs,
            free_index,
            forces,
            params,
        })
    }

    /// Derives the model and boundary conditions from the mesh bounds and
    /// the extracted goal markers.
    pub fn from_markers(mesh: &Mesh, markers: &GoalMarkers, params: SimpParams) -> Result<SimpSolver> {
        params.validate()?;
        let bounds = mesh
            .bounds()
            .ok_or_else(|| TopoError::Input("mesh has no vertices".to_owned()))?;
        let model = FeModel::new(&params, &bounds)?;
        let bcs = BoundaryConditions::from_markers(markers, &model)?;
        SimpSolver::new(&model, &bcs, params)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn continuation_finished(&self) -> bool {
        self.penalty >= self.params.penal_end && self.beta >= self.params.beta_max
    }

    fn physical_densities(&self, design: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let filtered = self.filter.apply(design);
        let physical = Projection::new(self.beta).project(&filtered);
        (filtered, physical)
    }

    fn youngs_moduli(&self, physical: &[f64]) -> Vec<f64> {
        let (e0, emin) = (self.params.e0, self.params.emin);
        physical
            .iter()
            .map(|rho| emin + rho.powf(self.penalty) * (e0 - emin))
            .collect()
    }

    /// Assembles the reduced stiffness matrix, symmetrically scaled by its
    /// diagonal. Returns the matrix and the scale factors.
    fn build_total_stiffness_matrix(&self, moduli: &[f64]) -> (CsrMatrix<f64>, Vec<f64>) {
        let ke = &self.element_stiffness;
        let size = self.forces.len();

        let mut diagonal = vec![0.0; size];
        for (dofs, modulus) in self.element_dofs.iter().zip(moduli) {
            for (local, dof) in dofs.iter().enumerate() {
                if let Some(row) = self.free_index[*dof] {
                    diagonal[row] += modulus * ke[(local, local)];
                }
            }
        }
        let scale: Vec<f64> = diagonal
            .iter()
            .map(|d| if *d > 0.0 { 1.0 / d.sqrt() } else { 1.0 })
            .collect();

        let mut coo = CooMatrix::new(size, size);
        for (dofs, modulus) in self.element_dofs.iter().zip(moduli) {
            for (local_row, dof_row) in dofs.iter().enumerate() {
                let Some(row) = self.free_index[*dof_row] else {
                    continue;
                };
                for (local_col, dof_col) in dofs.iter().enumerate() {
                    let Some(col) = self.free_index[*dof_col] else {
                        continue;
                    };
                    coo.push(
                        row,
                        col,
                        modulus * ke[(local_row, local_col)] * scale[row] * scale[col],
                    );
                }
            }
        }

        (CsrMatrix::from(&coo), scale)
    }

    /// Solves for the free displacements, warm-started from the previous
    /// iteration. Retries once with a boosted budget when the first attempt
    /// stalls.
    fn solve(&mut self, stiffness: &CsrMatrix<f64>, scale: &[f64]) -> Result<FeDiagnostics> {
        let rhs: Vec<f64> = self.forces.iter().zip(scale).map(|(f, s)| f * s).collect();
        let guess: Vec<f64> = self.displacement.iter().zip(scale).map(|(u, s)| u / s).collect();

        let tolerance = self.params.cg_tol;
        let mut solution =
            run_conjugate_gradient(stiffness, &rhs, guess, tolerance, self.params.cg_max_iters)?;
        let mut iterations = solution.iterations;

        if solution.relative_residual > tolerance && self.params.cg_boost > 1.0 {
            let boosted = (self.params.cg_max_iters as f64 * self.params.cg_boost) as u64;
            log::debug!(
                "cg stalled at residual {:.3e}, retrying with {} iterations",
                solution.relative_residual,
                boosted
            );
            solution = run_conjugate_gradient(stiffness, &rhs, solution.x, tolerance, boosted)?;
            iterations += solution.iterations;
        }

        let converged = solution.relative_residual <= tolerance;
        if !converged {
            if self.params.strict_convergence {
                return Err(TopoError::Solver(format!(
                    "linear solve did not converge in {} iterations (residual {:.3e})",
                    iterations, solution.relative_residual
                )));
            }
            log::warn!(
                "iteration {}: linear solve stopped at residual {:.3e} after {} iterations",
                self.iteration,
                solution.relative_residual,
                iterations
            );
        }

        self.displacement = solution.x.iter().zip(scale).map(|(y, s)| y * s).collect();

        Ok(FeDiagnostics {
            iterations,
            converged,
            relative_residual: solution.relative_residual,
        })
    }

    fn full_displacement(&self) -> Vec<f64> {
        self.free_index
            .iter()
            .map(|slot| slot.map_or(0.0, |row| self.displacement[row]))
            .collect()
    }

    /// Strain energy of each element at unit stiffness
    fn element_energies(&self) -> Vec<f64> {
        let u = self.full_displacement();
        let ke = &self.element_stiffness;
        self.element_dofs
            .iter()
            .map(|dofs| {
                let ue = DVector::from_iterator(dofs.len(), dofs.iter().map(|&d| u[d]));
                ue.dot(&(ke * &ue))
            })
            .collect()
    }

    /// Optimality criteria update with bisection on the Lagrange multiplier
    /// so the physical volume meets the target. Returns the new design and
    /// its physical densities.
    fn optimality_update(&self, dc: &[f64], dv: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let step = self.params.move_limit * self.move_scale;
        let rho_min = self.params.rho_min;

        let candidate = |lambda: f64| -> Vec<f64> {
            self.design
                .iter()
                .zip(dc.iter().zip(dv))
                .map(|(&x, (&dc, &dv))| {
                    let ratio = (-dc).max(0.0) / (dv.max(1e-30) * lambda);
                    let lower = (x - step).max(rho_min);
                    let upper = (x + step).min(1.0);
                    (x * ratio.sqrt()).max(lower).min(upper)
                })
                .collect()
        };

        let (mut l1, mut l2) = (0.0_f64, 1e9_f64);
        while (l2 - l1) / (l1 + l2) > BISECTION_TOLERANCE {
            let mid = 0.5 * (l1 + l2);
            let (_, physical) = self.physical_densities(&candidate(mid));
            if mean(&physical) > self.params.vol_frac {
                l1 = mid;
            } else {
                l2 = mid;
            }
        }

        let design = candidate(0.5 * (l1 + l2));
        let (_, physical) = self.physical_densities(&design);
        (design, physical)
    }

    fn advance_continuation(&mut self) {
        if self.penalty < self.params.penal_end {
            self.penalty = (self.penalty + self.params.penal_step).min(self.params.penal_end);
        } else {
            self.beta = (self.beta * self.params.beta_multiplier).min(self.params.beta_max);
        }
        self.stable_iters = 0;
        self.calm_iters = 0;
        self.checkpoint = None;
        self.move_scale = 1.0;
        log::info!(
            "iteration {}: continuation to penalty {:.2}, beta {:.2}",
            self.iteration,
            self.penalty,
            self.beta
        );
    }

    /// Runs one optimizer iteration
    pub fn step(&mut self) -> Result<StepOutcome> {
        if self.finished {
            return Err(TopoError::Solver("the run has already ended".to_owned()));
        }
        self.iteration += 1;
        let iteration = self.iteration;
        let penalty = self.penalty;
        let beta = self.beta;

        // Filter and project
        let start = Instant::now();
        let (filtered, physical) = self.physical_densities(&self.design);
        let filter_ms = start.elapsed().as_secs_f64() * 1e3;

        // Assemble
        let start = Instant::now();
        let moduli = self.youngs_moduli(&physical);
        let (stiffness, scale) = self.build_total_stiffness_matrix(&moduli);
        let assemble_ms = start.elapsed().as_secs_f64() * 1e3;

        // Solve
        let start = Instant::now();
        let diagnostics = self.solve(&stiffness, &scale)?;
        let solve_ms = start.elapsed().as_secs_f64() * 1e3;

        // Compliance and sensitivities
        let start = Instant::now();
        let energies = self.element_energies();
        let compliance: f64 = moduli.iter().zip(&energies).map(|(e, ce)| e * ce).sum();
        if !compliance.is_finite() {
            return Err(TopoError::Solver(format!(
                "compliance became {} at iteration {}",
                compliance, iteration
            )));
        }

        let stiffness_range = self.params.e0 - self.params.emin;
        let projection = Projection::new(beta);
        let slope = projection.derivative(&filtered);
        let dc_filtered: Vec<f64> = physical
            .iter()
            .zip(&energies)
            .zip(&slope)
            .map(|((rho, ce), s)| -penalty * rho.powf(penalty - 1.0) * stiffness_range * ce * s)
            .collect();
        let dc = self.filter.backpropagate(&dc_filtered);
        let dv = self.filter.backpropagate(&slope);

        // Rollback or update
        let rolled_back = match &self.checkpoint {
            Some(checkpoint)
                if self.params.rollback_enabled
                    && regressed(compliance, checkpoint.compliance, self.params.rollback_threshold) =>
            {
                log::warn!(
                    "iteration {}: compliance {:.4e} regressed past checkpoint {:.4e}, rolling back",
                    iteration,
                    compliance,
                    checkpoint.compliance
                );
                Some(checkpoint.design.clone())
            }
            _ => None,
        };

        let (new_design, new_physical) = match rolled_back {
            Some(design) => {
                self.move_scale = (self.move_scale * 0.5).max(MIN_MOVE_SCALE);
                let (_, physical) = self.physical_densities(&design);
                (design, physical)
            }
            None => {
                let feasible = mean(&physical) <= self.params.vol_frac + VOLUME_SLACK;
                let improved = self
                    .checkpoint
                    .as_ref()
                    .map_or(true, |c| compliance < c.compliance);
                if self.params.rollback_enabled && feasible && improved {
                    self.checkpoint = Some(Checkpoint {
                        compliance,
                        design: self.design.clone(),
                    });
                }
                self.optimality_update(&dc, &dv)
            }
        };

        let change = new_design
            .iter()
            .zip(&self.design)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);
        self.design = new_design;
        let update_ms = start.elapsed().as_secs_f64() * 1e3;

        let volume = mean(&new_physical);
        let gray = gray_fraction(&new_physical);
        if new_physical.iter().all(|&d| d <= 1.01 * self.params.rho_min) {
            log::warn!("iteration {}: every element sits at the density floor", iteration);
        } else if new_physical.iter().all(|&d| d >= 0.99) {
            log::warn!("iteration {}: every element is solid", iteration);
        }

        // Continuation and convergence bookkeeping
        let relative_change = self
            .previous_compliance
            .map_or(f64::INFINITY, |prev| (compliance - prev).abs() / prev.abs().max(1e-300));
        self.previous_compliance = Some(compliance);
        if relative_change < self.params.cont_tol_rel {
            self.stable_iters += 1;
        } else {
            self.stable_iters = 0;
        }
        // Calm: either the design or the compliance has settled
        if change < self.params.tol_change || relative_change < self.params.tol_change {
            self.calm_iters += 1;
        } else {
            self.calm_iters = 0;
        }

        let mut converged = false;
        if !self.continuation_finished() {
            if self.stable_iters >= self.params.cont_stable_iters {
                self.advance_continuation();
            }
        } else {
            converged = self.calm_iters >= self.params.min_iterations && gray < self.params.gray_tol;
        }

        log::debug!(
            "iteration {}: compliance {:.5e}, change {:.4}, volume {:.4}, gray {:.3}, cg {}",
            iteration,
            compliance,
            change,
            volume,
            gray,
            diagnostics.iterations
        );

        let terminal = converged || iteration >= self.params.max_iters;
        if terminal {
            self.finished = true;
            if converged {
                log::info!("converged after {} iterations, compliance {:.5e}", iteration, compliance);
            } else {
                log::info!(
                    "stopped at the iteration cap {} without converging",
                    self.params.max_iters
                );
            }
        }

        let emit = iteration % self.params.emit_every == 0 || terminal;
        let frame = emit.then(|| SolverFrame {
            iteration,
            compliance,
            change,
            volume,
            densities: new_physical,
            converged,
            penalty,
            beta,
            fe: Some(diagnostics),
            timings: Some(StageTimings {
                filter_ms,
                assemble_ms,
                solve_ms,
                update_ms,
            }),
        });

        Ok(StepOutcome {
            iteration,
            frame,
            converged,
            terminal,
        })
    }

    /// Iterates until convergence or the iteration cap, handing every
    /// produced frame to `on_frame`. Returns whether the run converged.
    pub fn run<F>(&mut self, mut on_frame: F) -> Result<bool>
    where
        F: FnMut(SolverFrame),
    {
        loop {
            let outcome = self.step()?;
            if let Some(frame) = outcome.frame {
                on_frame(frame);
            }
            if outcome.terminal {
                return Ok(outcome.converged);
            }
            if outcome.iteration % self.params.yield_every == 0 {
                std::thread::yield_now();
            }
        }
    }
}
