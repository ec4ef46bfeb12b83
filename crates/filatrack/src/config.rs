//! Typed tracker configuration.
//!
//! All tunables live in [`TrackerConfig`], loaded once from JSON and checked
//! by [`TrackerConfig::validate`] before any tracking starts.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackError};

/// Boundary treatment of the stiffness operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    /// Free ends: the contour is an open curve.
    #[default]
    Open,
    /// Circular differencing: the last point connects back to the first.
    /// Only [`build_operator`](crate::contour::build_operator) accepts it;
    /// [`TrackerConfig::validate`] rejects it for tracking.
    Closed,
}

/// Snake evolution parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    /// Elasticity weight (resistance to stretching).
    pub alpha: f64,
    /// Rigidity weight (resistance to bending).
    pub beta: f64,
    /// Implicit Euler time step.
    pub dt: f64,
    /// Maximum relaxation iterations per frame.
    pub max_iter: usize,
    /// Side of the square branching kernel (pixels, odd).
    pub kernel_size: usize,
    /// Gaussian sigma of the branching kernel (pixels).
    pub kernel_sigma: f64,
    /// Spacing used to resample the seed polyline (pixels).
    pub discretization_step: f64,
    /// Mean per-point displacement below which a frame is converged.
    pub min_shift: f64,
    /// Multiplier applied to the sampled branching attraction at each end.
    pub branch_force_mult: f64,
    /// Stiffness operator boundary treatment.
    pub boundary: Boundary,
    /// Keep both per-frame branching potentials in the track result.
    pub keep_potentials: bool,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            dt: 0.01,
            max_iter: 600,
            kernel_size: 11,
            kernel_sigma: 2.5,
            discretization_step: 1.0,
            min_shift: 1.0e-7,
            branch_force_mult: 100.0,
            boundary: Boundary::Open,
            keep_potentials: false,
        }
    }
}

impl EvolutionConfig {
    /// Largest recommended time step for the configured stiffness.
    ///
    /// `4α + 16β` bounds the spectral radius of the stiffness operator
    /// (Gershgorin), so `dt` at or below the reciprocal keeps a single step
    /// from moving a point further than the forces acting on it.
    pub fn recommended_max_dt(&self) -> f64 {
        let rho = 4.0 * self.alpha + 16.0 * self.beta;
        if rho > 0.0 {
            1.0 / rho
        } else {
            f64::INFINITY
        }
    }
}

/// Cross-frame endpoint relocation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocationConfig {
    /// Template half-size (pixels).
    pub small_window: usize,
    /// Search half-size (pixels), also the padding width.
    pub large_window: usize,
    /// Weight of the correlation deficit in the candidate penalty.
    pub corr_mult: f64,
    /// Weight of the branching distance-transform term (0 disables it).
    pub branch_cost: f64,
}

impl Default for RelocationConfig {
    fn default() -> Self {
        Self {
            small_window: 10,
            large_window: 50,
            corr_mult: 15.0,
            branch_cost: 0.0,
        }
    }
}

/// Worker-pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Fan filaments across a worker pool; `false` runs them in-process one by one.
    pub enabled: bool,
    /// Pool size; `None` uses the available processor count.
    pub workers: Option<usize>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: None,
        }
    }
}

impl ParallelConfig {
    /// Effective pool size.
    pub fn worker_count(&self) -> usize {
        self.workers
            .filter(|&n| n > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
    }
}

/// Top-level tracker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub evolution: EvolutionConfig,
    pub relocation: RelocationConfig,
    pub parallel: ParallelConfig,
}

impl TrackerConfig {
    /// Load and validate a configuration from a JSON file.
    ///
    /// Missing fields fall back to their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the tracker cannot run with.
    pub fn validate(&self) -> Result<()> {
        let ev = &self.evolution;
        let finite_non_negative = |v: f64| v.is_finite() && v >= 0.0;

        if !finite_non_negative(ev.alpha) || !finite_non_negative(ev.beta) {
            return Err(invalid("alpha and beta must be finite and >= 0"));
        }
        if !ev.dt.is_finite() || ev.dt <= 0.0 {
            return Err(invalid("dt must be finite and > 0"));
        }
        if ev.max_iter == 0 {
            return Err(invalid("max_iter must be >= 1"));
        }
        if ev.kernel_size == 0 || ev.kernel_size % 2 == 0 {
            return Err(invalid("kernel_size must be odd"));
        }
        if !ev.kernel_sigma.is_finite() || ev.kernel_sigma <= 0.0 {
            return Err(invalid("kernel_sigma must be finite and > 0"));
        }
        if !ev.discretization_step.is_finite() || ev.discretization_step <= 0.0 {
            return Err(invalid("discretization_step must be finite and > 0"));
        }
        if !finite_non_negative(ev.min_shift) {
            return Err(invalid("min_shift must be finite and >= 0"));
        }
        if !finite_non_negative(ev.branch_force_mult) {
            return Err(invalid("branch_force_mult must be finite and >= 0"));
        }
        // Resampling and end forces treat points 0 and N-1 as free ends.
        if ev.boundary == Boundary::Closed {
            return Err(invalid("boundary 'closed' is not supported for filament tracking"));
        }
        if ev.dt > ev.recommended_max_dt() {
            tracing::warn!(
                "dt={} exceeds the recommended bound {:.4} for alpha={}, beta={}",
                ev.dt,
                ev.recommended_max_dt(),
                ev.alpha,
                ev.beta
            );
        }

        let rl = &self.relocation;
        if rl.small_window == 0 || rl.small_window >= rl.large_window {
            return Err(invalid("relocation windows must satisfy 0 < small < large"));
        }
        if !finite_non_negative(rl.corr_mult) || !finite_non_negative(rl.branch_cost) {
            return Err(invalid("corr_mult and branch_cost must be finite and >= 0"));
        }

        if self.parallel.workers == Some(0) {
            return Err(invalid("workers must be >= 1 when set"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> TrackError {
    TrackError::InvalidConfig(msg.to_string())
}
