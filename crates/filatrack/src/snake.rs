//! Snake evolution: relax one contour on one frame.
//!
//! Each iteration samples the gradient vector flow at the contour points,
//! adds endpoint constraint forces, applies the implicit propagator and
//! re-parametrizes the result to uniform arc length. Relaxation stops when
//! the mean point displacement drops below `min_shift` (converged) or after
//! `max_iter` iterations.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::bundle::Frame;
use crate::config::EvolutionConfig;
use crate::contour::{mean_displacement, resample_uniform, Propagator};
use crate::error::{Result, TrackError};
use crate::force::BranchField;
use crate::sampling::bilinear;

/// Terminal state of one frame's relaxation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EvolutionOutcome {
    /// Mean displacement fell below the threshold at `iterations`.
    Converged { iterations: usize },
    /// The iteration budget ran out first; the last state is kept.
    MaxIterReached,
}

impl EvolutionOutcome {
    pub fn is_converged(self) -> bool {
        matches!(self, Self::Converged { .. })
    }
}

/// Scalar evolution parameters (the time step lives in the propagator).
#[derive(Debug, Clone, Copy)]
pub struct SnakeParams {
    pub max_iter: usize,
    pub min_shift: f64,
    pub branch_force_mult: f64,
}

impl From<&EvolutionConfig> for SnakeParams {
    fn from(cfg: &EvolutionConfig) -> Self {
        Self {
            max_iter: cfg.max_iter,
            min_shift: cfg.min_shift,
            branch_force_mult: cfg.branch_force_mult,
        }
    }
}

/// Result of relaxing one contour on one frame.
#[derive(Debug, Clone)]
pub struct Evolution {
    /// `max_iter + 1` contour states; slot 0 is the initial contour and
    /// slots after convergence repeat the converged contour.
    pub trajectory: Vec<Vec<[f64; 2]>>,
    pub outcome: EvolutionOutcome,
    /// Mean displacement of the last computed iteration.
    pub final_shift: f64,
    /// Owner-mask value under each contour end, for the ends that asked for it.
    pub end_owners: [Option<u32>; 2],
}

impl Evolution {
    /// Final (converged or last) contour.
    pub fn converged(&self) -> &[[f64; 2]] {
        self.trajectory.last().map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Endpoint constraint forces for the current contour.
///
/// Interior points receive no force. Each end receives
/// `mult · branch_attraction(end) + stretch(end) · outward_tangent`, where
/// `stretch` is the enhanced intensity sampled at the end and the tangent
/// points from the adjacent contour point to the end.
pub fn constraint_forces(
    points: &[[f64; 2]],
    frame: &Frame,
    fields: [&BranchField; 2],
    mult: f64,
) -> (DVector<f64>, DVector<f64>) {
    let n = points.len();
    let mut fx = DVector::<f64>::zeros(n);
    let mut fy = DVector::<f64>::zeros(n);
    if n < 2 {
        return (fx, fy);
    }

    let ends = [(0usize, 1usize), (n - 1, n - 2)];
    for (k, &(end, inner)) in ends.iter().enumerate() {
        let p = points[end];
        let t = unit(sub(p, points[inner]));
        let branch = fields[k].force_at(p);
        let stretch = bilinear(&frame.enhanced, p[0], p[1]);
        fx[end] = mult * branch[0] + stretch * t[0];
        fy[end] = mult * branch[1] + stretch * t[1];
    }
    (fx, fy)
}

/// Relaxes contours of one fixed point count on one frame.
pub struct SnakeEvolver<'a> {
    propagator: &'a Propagator,
    frame: &'a Frame,
    fields: [&'a BranchField; 2],
    params: SnakeParams,
}

impl<'a> SnakeEvolver<'a> {
    pub fn new(
        propagator: &'a Propagator,
        frame: &'a Frame,
        fields: [&'a BranchField; 2],
        params: SnakeParams,
    ) -> Self {
        Self {
            propagator,
            frame,
            fields,
            params,
        }
    }

    /// One implicit update followed by arc-length re-parametrization.
    pub fn step(&self, points: &[[f64; 2]]) -> Result<Vec<[f64; 2]>> {
        let n = points.len();
        let mut x = DVector::<f64>::zeros(n);
        let mut y = DVector::<f64>::zeros(n);
        let mut gx = DVector::<f64>::zeros(n);
        let mut gy = DVector::<f64>::zeros(n);
        for (i, p) in points.iter().enumerate() {
            x[i] = p[0];
            y[i] = p[1];
            // The flow field lives at twice the frame resolution.
            let g = self.frame.flow.sample(2.0 * p[0], 2.0 * p[1]);
            gx[i] = g[0];
            gy[i] = g[1];
        }

        let (cx, cy) =
            constraint_forces(points, self.frame, self.fields, self.params.branch_force_mult);
        let new_x = self.propagator.step(&x, &(gx + cx));
        let new_y = self.propagator.step(&y, &(gy + cy));

        if new_x.iter().chain(new_y.iter()).any(|v| !v.is_finite()) {
            return Err(TrackError::NumericalDivergence {
                stage: "snake update",
            });
        }

        let updated: Vec<[f64; 2]> = new_x.iter().zip(new_y.iter()).map(|(&a, &b)| [a, b]).collect();
        Ok(resample_uniform(&updated, n))
    }

    /// Relax `initial` to convergence or until the iteration budget runs out.
    ///
    /// `localize[k]` requests the owner-mask value under end `k` (0 = head,
    /// 1 = tail) of the final contour.
    pub fn run(&self, initial: &[[f64; 2]], localize: [bool; 2]) -> Result<Evolution> {
        let n = self.propagator.n();
        if initial.len() != n {
            return Err(TrackError::WorkerTaskFailure(format!(
                "contour has {} points but the propagator was built for {}",
                initial.len(),
                n
            )));
        }

        let max_iter = self.params.max_iter;
        let mut trajectory: Vec<Vec<[f64; 2]>> = Vec::with_capacity(max_iter + 1);
        trajectory.push(initial.to_vec());

        let mut outcome = EvolutionOutcome::MaxIterReached;
        let mut final_shift = f64::INFINITY;
        for iter in 1..=max_iter {
            let prev = &trajectory[iter - 1];
            let next = self.step(prev)?;
            final_shift = mean_displacement(&next, prev);
            trajectory.push(next);

            if final_shift < self.params.min_shift {
                outcome = EvolutionOutcome::Converged { iterations: iter };
                break;
            }
        }

        match outcome {
            EvolutionOutcome::Converged { iterations } => {
                tracing::trace!("snake converged after {} iterations", iterations);
                let last = trajectory[iterations].clone();
                trajectory.resize(max_iter + 1, last);
            }
            EvolutionOutcome::MaxIterReached => {
                tracing::debug!(
                    "snake reached max_iter={} (last shift {:.3e})",
                    max_iter,
                    final_shift
                );
            }
        }

        let converged = &trajectory[max_iter];
        let ends = [converged[0], converged[n - 1]];
        let end_owners = [0, 1].map(|k| localize[k].then(|| self.fields[k].owner_at(ends[k])));

        Ok(Evolution {
            trajectory,
            outcome,
            final_shift,
            end_owners,
        })
    }
}

#[inline]
fn sub(a: [f64; 2], b: [f64; 2]) -> [f64; 2] {
    [a[0] - b[0], a[1] - b[1]]
}

#[inline]
fn unit(v: [f64; 2]) -> [f64; 2] {
    let n = (v[0] * v[0] + v[1] * v[1]).sqrt();
    if n > 0.0 {
        [v[0] / n, v[1] / n]
    } else {
        [0.0, 0.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Boundary;
    use crate::force::gaussian_kernel;
    use crate::test_utils::{blank_frame, flow_from_fn};
    use approx::assert_abs_diff_eq;

    fn params(max_iter: usize) -> SnakeParams {
        SnakeParams {
            max_iter,
            min_shift: 1.0e-7,
            branch_force_mult: 100.0,
        }
    }

    fn horizontal(n: usize, x0: f64, y: f64) -> Vec<[f64; 2]> {
        (0..n).map(|i| [x0 + i as f64, y]).collect()
    }

    #[test]
    fn zero_force_straight_contour_is_stationary() {
        let frame = blank_frame(64, 64);
        let empty = BranchField::from_points(&[], 64, 64, &gaussian_kernel(11, 2.5));
        let prop = Propagator::new(12, 0.0, 1.0, 0.01, Boundary::Open).unwrap();
        let evolver = SnakeEvolver::new(&prop, &frame, [&empty, &empty], params(50));

        let init = horizontal(12, 20.0, 30.0);
        let evo = evolver.run(&init, [false, false]).unwrap();
        assert_eq!(evo.outcome, EvolutionOutcome::Converged { iterations: 1 });
        assert_eq!(evo.trajectory.len(), 51);
        for p in evo.converged().iter().zip(&init) {
            assert_abs_diff_eq!(p.0[0], p.1[0], epsilon = 1e-9);
            assert_abs_diff_eq!(p.0[1], p.1[1], epsilon = 1e-9);
        }
        assert_eq!(evo.end_owners, [None, None]);
    }

    #[test]
    fn converges_toward_single_equilibrium_with_shrinking_steps() {
        // Flow pulls every point toward y = 30 with strength 20 px⁻¹.
        let mut frame = blank_frame(64, 64);
        frame.flow = flow_from_fn(64, 64, |_, y| [0.0, 20.0 * (30.0 - y)]);
        let empty = BranchField::from_points(&[], 64, 64, &gaussian_kernel(11, 2.5));
        let prop = Propagator::new(10, 0.0, 1.0, 0.01, Boundary::Open).unwrap();
        let max_iter = 400;
        let evolver = SnakeEvolver::new(&prop, &frame, [&empty, &empty], params(max_iter));

        let evo = evolver.run(&horizontal(10, 20.0, 33.0), [false, false]).unwrap();
        let EvolutionOutcome::Converged { iterations } = evo.outcome else {
            panic!("expected convergence, got {:?}", evo.outcome);
        };
        assert!(iterations < max_iter);

        let shifts: Vec<f64> = evo.trajectory[..=iterations]
            .windows(2)
            .map(|w| mean_displacement(&w[1], &w[0]))
            .collect();
        for w in shifts.windows(2).skip(3) {
            assert!(w[1] <= w[0] + 1e-12, "{} > {}", w[1], w[0]);
        }
        for p in evo.converged() {
            assert_abs_diff_eq!(p[1], 30.0, epsilon = 1e-4);
        }
        // Slots after convergence replicate the converged contour.
        assert_eq!(evo.trajectory[iterations], evo.trajectory[max_iter]);
    }

    #[test]
    fn max_iter_keeps_last_state() {
        let mut frame = blank_frame(64, 64);
        frame.flow = flow_from_fn(64, 64, |_, _| [1.0, 0.0]);
        let empty = BranchField::from_points(&[], 64, 64, &gaussian_kernel(11, 2.5));
        let prop = Propagator::new(8, 0.0, 1.0, 0.01, Boundary::Open).unwrap();
        let evolver = SnakeEvolver::new(&prop, &frame, [&empty, &empty], params(20));

        let init = horizontal(8, 10.0, 20.0);
        let evo = evolver.run(&init, [false, false]).unwrap();
        assert_eq!(evo.outcome, EvolutionOutcome::MaxIterReached);
        // Constant flow translates the contour by dt per iteration.
        assert_abs_diff_eq!(evo.converged()[0][0], 10.0 + 20.0 * 0.01, epsilon = 1e-6);
        assert_abs_diff_eq!(evo.final_shift, 0.01, epsilon = 1e-6);
    }

    #[test]
    fn end_owner_is_reported_only_when_requested() {
        let frame = blank_frame(64, 64);
        let kernel = gaussian_kernel(11, 2.5);
        let field = BranchField::from_points(&[[20.0, 30.0], [31.0, 30.0]], 64, 64, &kernel);
        let prop = Propagator::new(12, 0.0, 1.0, 0.01, Boundary::Open).unwrap();
        let evolver = SnakeEvolver::new(&prop, &frame, [&field, &field], params(5));

        let evo = evolver.run(&horizontal(12, 20.0, 30.0), [true, false]).unwrap();
        assert_eq!(evo.end_owners[0], Some(1));
        assert_eq!(evo.end_owners[1], None);
    }

    #[test]
    fn constraint_forces_push_ends_outward_on_bright_pixels() {
        let mut frame = blank_frame(32, 32);
        for p in frame.enhanced.pixels_mut() {
            p[0] = 0.5;
        }
        let empty = BranchField::from_points(&[], 32, 32, &gaussian_kernel(5, 1.0));
        let pts = horizontal(5, 10.0, 10.0);
        let (fx, fy) = constraint_forces(&pts, &frame, [&empty, &empty], 100.0);
        assert_abs_diff_eq!(fx[0], -0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(fx[4], 0.5, epsilon = 1e-12);
        assert_eq!(fx[2], 0.0);
        assert!(fy.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn wrong_point_count_is_rejected() {
        let frame = blank_frame(16, 16);
        let empty = BranchField::from_points(&[], 16, 16, &gaussian_kernel(5, 1.0));
        let prop = Propagator::new(6, 1.0, 1.0, 0.01, Boundary::Open).unwrap();
        let evolver = SnakeEvolver::new(&prop, &frame, [&empty, &empty], params(5));
        assert!(evolver.run(&horizontal(5, 2.0, 2.0), [false, false]).is_err());
    }
}
