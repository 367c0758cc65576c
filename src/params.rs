use serde::{Deserialize, Serialize};

use crate::error::{Result, TopoError};

/// Per-run configuration of the optimizer. Immutable once a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimpParams {
    /// Elements along x
    pub nx: usize,
    /// Elements along y
    pub ny: usize,
    /// Elements along z. `1` selects a 2D plane-stress problem.
    pub nz: usize,

    /// Target fraction of the design domain filled with material
    pub vol_frac: f64,

    pub penal_start: f64,
    pub penal_end: f64,
    pub penal_step: f64,

    /// Density filter radius, in element units
    pub rmin: f64,
    /// Largest change of a design variable in one iteration
    pub move_limit: f64,

    pub max_iters: usize,
    /// Consecutive iterations the design change or the relative compliance
    /// change must stay under `tol_change`
    pub min_iterations: usize,
    pub tol_change: f64,
    /// Largest tolerated fraction of gray elements at convergence
    pub gray_tol: f64,

    pub beta_max: f64,
    pub beta_multiplier: f64,

    /// Iterations of stable compliance required before a continuation step
    pub cont_stable_iters: usize,
    /// Relative compliance change regarded as stable
    pub cont_tol_rel: f64,

    pub e0: f64,
    pub emin: f64,
    pub rho_min: f64,
    pub poisson_ratio: f64,

    /// Relative residual targeted by the linear solver
    pub cg_tol: f64,
    pub cg_max_iters: u64,
    /// Budget multiplier for the retry after a stalled linear solve
    pub cg_boost: f64,
    /// Treat linear solver non-convergence as fatal
    pub strict_convergence: bool,

    pub rollback_enabled: bool,
    /// Relative compliance regression that triggers a rollback
    pub rollback_threshold: f64,

    pub emit_every: usize,
    pub yield_every: usize,
}

impl Default for SimpParams {
    fn default() -> Self {
        SimpParams {
            nx: 40,
            ny: 40,
            nz: 1,
            vol_frac: 0.4,
            penal_start: 1.0,
            penal_end: 3.0,
            penal_step: 0.5,
            rmin: 1.5,
            move_limit: 0.2,
            max_iters: 300,
            min_iterations: 3,
            tol_change: 0.01,
            gray_tol: 0.2,
            beta_max: 16.0,
            beta_multiplier: 2.0,
            cont_stable_iters: 5,
            cont_tol_rel: 0.01,
            e0: 1.0,
            emin: 1e-9,
            rho_min: 1e-3,
            poisson_ratio: 0.3,
            cg_tol: 1e-6,
            cg_max_iters: 5000,
            cg_boost: 4.0,
            strict_convergence: false,
            rollback_enabled: true,
            rollback_threshold: 0.1,
            emit_every: 1,
            yield_every: 5,
        }
    }
}

impl SimpParams {
    /// Returns true for a single-layer (plane stress) problem
    pub fn is_2d(&self) -> bool {
        self.nz == 1
    }

    pub fn num_elements(&self) -> usize {
        self.nx * self.ny * self.nz
    }

    /// Checks the parameters for values the solver cannot work with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(TopoError::Input(msg));

        if self.nx == 0 || self.ny == 0 || self.nz == 0 {
            return fail(format!(
                "grid resolution must be positive, got {}x{}x{}",
                self.nx, self.ny, self.nz
            ));
        }
        if !(self.vol_frac > 0.0 && self.vol_frac <= 1.0) {
            return fail(format!("vol_frac must be in (0, 1], got {}", self.vol_frac));
        }
        if !(self.rmin > 0.0) {
            return fail(format!("rmin must be positive, got {}", self.rmin));
        }
        if !(self.move_limit > 0.0) {
            return fail(format!("move_limit must be positive, got {}", self.move_limit));
        }
        if self.penal_start < 1.0 || self.penal_end < self.penal_start {
            return fail(format!(
                "penalty schedule {} -> {} is invalid",
                self.penal_start, self.penal_end
            ));
        }
        if self.penal_end > self.penal_start && !(self.penal_step > 0.0) {
            return fail("penal_step must be positive when the penalty ramps".to_owned());
        }
        if self.beta_max < 1.0 || (self.beta_max > 1.0 && !(self.beta_multiplier > 1.0)) {
            return fail(format!(
                "projection schedule beta_max={} beta_multiplier={} is invalid",
                self.beta_max, self.beta_multiplier
            ));
        }
        if !(self.tol_change > 0.0) || !(self.gray_tol > 0.0) || !(self.cont_tol_rel > 0.0) {
            return fail("tolerances must be positive".to_owned());
        }
        if !(self.e0 > self.emin) || self.emin < 0.0 {
            return fail(format!("expected e0 > emin >= 0, got e0={} emin={}", self.e0, self.emin));
        }
        if !(self.rho_min > 0.0 && self.rho_min < self.vol_frac) {
            return fail(format!("rho_min must be in (0, vol_frac), got {}", self.rho_min));
        }
        if !(self.poisson_ratio > -1.0 && self.poisson_ratio < 0.5) {
            return fail(format!(
                "poisson_ratio must be in (-1, 0.5), got {}",
                self.poisson_ratio
            ));
        }
        if !(self.cg_tol > 0.0) || self.cg_max_iters == 0 || self.cg_boost < 1.0 {
            return fail("linear solver budget is invalid".to_owned());
        }
        if self.rollback_enabled && !(self.rollback_threshold > 0.0) {
            return fail("rollback_threshold must be positive".to_owned());
        }
        if self.max_iters == 0 || self.emit_every == 0 || self.yield_every == 0 {
            return fail("max_iters, emit_every and yield_every must be positive".to_owned());
        }

        Ok(())
    }
}
