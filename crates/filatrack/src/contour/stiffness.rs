//! Internal stiffness operator and its implicit-Euler propagator.

use nalgebra::{DMatrix, DVector};

use crate::config::{Boundary, EvolutionConfig};
use crate::error::{Result, TrackError};

/// Build the `n × n` stiffness operator `A = −α·A₁ + β·A₂`.
///
/// `A₁` is the second-difference (elasticity) operator and `A₂` the
/// fourth-difference (rigidity) operator. With [`Boundary::Open`] the rows
/// and columns `0, 1, n−2, n−1` carry free-end corrections so that constant
/// and linear point sequences are not penalised by `A₂`; with
/// [`Boundary::Closed`] both operators use circular differencing.
///
/// `n` is expected to be at least 3.
pub fn build_operator(n: usize, alpha: f64, beta: f64, boundary: Boundary) -> DMatrix<f64> {
    debug_assert!(n >= 3, "stiffness operator needs at least 3 points");
    let mut a1 = DMatrix::<f64>::zeros(n, n);
    let mut a2 = DMatrix::<f64>::zeros(n, n);

    match boundary {
        Boundary::Open => {
            for i in 0..n {
                a1[(i, i)] = 2.0;
                a2[(i, i)] = -6.0;
                if i + 1 < n {
                    a1[(i, i + 1)] = -1.0;
                    a1[(i + 1, i)] = -1.0;
                    a2[(i, i + 1)] = 4.0;
                    a2[(i + 1, i)] = 4.0;
                }
                if i + 2 < n {
                    a2[(i, i + 2)] = -1.0;
                    a2[(i + 2, i)] = -1.0;
                }
            }
            let last = n - 1;
            a1[(0, 0)] = 1.0;
            a1[(last, last)] = 1.0;

            a2[(0, 0)] = -1.0;
            a2[(last, last)] = -1.0;
            a2[(1, 1)] = -5.0;
            a2[(last - 1, last - 1)] = -5.0;
            a2[(0, 1)] = 2.0;
            a2[(1, 0)] = 2.0;
            a2[(last, last - 1)] = 2.0;
            a2[(last - 1, last)] = 2.0;
        }
        Boundary::Closed => {
            // Accumulate so that wrapped neighbours coincide for tiny n.
            for i in 0..n {
                let next = (i + 1) % n;
                let prev = (i + n - 1) % n;
                let next2 = (i + 2) % n;
                let prev2 = (i + n - 2) % n;

                a1[(i, i)] += 2.0;
                a1[(i, next)] -= 1.0;
                a1[(i, prev)] -= 1.0;

                a2[(i, i)] -= 6.0;
                a2[(i, next)] += 4.0;
                a2[(i, prev)] += 4.0;
                a2[(i, next2)] -= 1.0;
                a2[(i, prev2)] -= 1.0;
            }
        }
    }

    a1 * (-alpha) + a2 * beta
}

/// Implicit-Euler propagator `P = (I − dt·A)⁻¹`.
///
/// No step-size adaptation happens here: callers choose `dt` against
/// [`EvolutionConfig::recommended_max_dt`].
pub fn propagate(a: &DMatrix<f64>, dt: f64) -> Result<DMatrix<f64>> {
    let n = a.nrows();
    let system = DMatrix::<f64>::identity(n, n) - a * dt;
    let inverse = system.try_inverse().ok_or(TrackError::NumericalDivergence {
        stage: "propagator inversion",
    })?;
    if inverse.iter().any(|v| !v.is_finite()) {
        return Err(TrackError::NumericalDivergence {
            stage: "propagator inversion",
        });
    }
    Ok(inverse)
}

/// Propagator for one filament, computed once per `(n, α, β, dt)`.
#[derive(Debug, Clone)]
pub struct Propagator {
    matrix: DMatrix<f64>,
    dt: f64,
}

impl Propagator {
    pub fn new(n: usize, alpha: f64, beta: f64, dt: f64, boundary: Boundary) -> Result<Self> {
        if n < 3 {
            return Err(TrackError::InvalidConfig(format!(
                "contour needs at least 3 points, got {}",
                n
            )));
        }
        let a = build_operator(n, alpha, beta, boundary);
        Ok(Self {
            matrix: propagate(&a, dt)?,
            dt,
        })
    }

    pub fn from_config(n: usize, cfg: &EvolutionConfig) -> Result<Self> {
        Self::new(n, cfg.alpha, cfg.beta, cfg.dt, cfg.boundary)
    }

    /// Number of contour points this propagator was built for.
    pub fn n(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// One implicit step for one coordinate: `P · (v + dt·f)`.
    pub fn step(&self, v: &DVector<f64>, force: &DVector<f64>) -> DVector<f64> {
        &self.matrix * (v + force * self.dt)
    }
}
