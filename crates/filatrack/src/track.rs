//! Per-filament tracking across the whole frame stack.
//!
//! A seed polyline is resampled once, which fixes the contour's point count
//! and with it the propagator. Each frame then rebuilds the endpoint force
//! fields, relaxes the contour, samples the binary mask, localizes any end
//! that has not been bound to a junction yet, and relocates both anchors
//! into the next frame. Frame `i + 1` only ever sees frame `i`'s converged
//! state.

use nalgebra::DMatrix;
use serde::Serialize;

use crate::bundle::{Field, Frame, FrameBundle};
use crate::config::TrackerConfig;
use crate::contour::{contour_length, resample_with_step, Propagator};
use crate::error::{Result, TrackError};
use crate::force::{gaussian_kernel, BranchField};
use crate::relocate::{relocate_between, Relocation};
use crate::sampling::sample_nearest_points;
use crate::snake::{Evolution, EvolutionOutcome, SnakeEvolver, SnakeParams};

/// One contour end's attachment point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Anchor {
    /// Current position `[x, y]`.
    pub position: [f64; 2],
    /// Set once the end has been bound to a junction; never cleared.
    pub localized: bool,
}

impl Anchor {
    fn unlocalized(position: [f64; 2]) -> Self {
        Self {
            position,
            localized: false,
        }
    }
}

/// Everything computed for one frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameTrack {
    /// 0-based frame index.
    pub frame: usize,
    /// Per-iteration contours (`max_iter + 1` entries).
    #[serde(skip)]
    pub trajectory: Vec<Vec<[f64; 2]>>,
    /// Converged contour.
    pub contour: Vec<[f64; 2]>,
    /// Binary mask under each converged contour point.
    pub intensities: Vec<u8>,
    /// Head and tail anchors for this frame, after any localization.
    pub endpoints: [[f64; 2]; 2],
    pub outcome: EvolutionOutcome,
    pub final_shift: f64,
    /// Relocation of both anchors into the next frame, if there is one.
    pub relocations: Option<[Relocation; 2]>,
    /// Head and tail branching potentials, when requested by the config.
    #[serde(skip)]
    pub potentials: Option<[Field; 2]>,
}

/// Terminal state of a filament track.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrackState {
    Done,
    /// Tracking stopped while entering `frame`; earlier frames are kept.
    Failed {
        frame: usize,
        kind: String,
        reason: String,
    },
}

/// Output of one filament track.
#[derive(Debug, Clone, Serialize)]
pub struct TrackResult {
    /// Resampled seed (the frame 0 initial contour).
    pub seed: Vec<[f64; 2]>,
    pub frames: Vec<FrameTrack>,
    pub state: TrackState,
}

impl TrackResult {
    pub fn n_points(&self) -> usize {
        self.seed.len()
    }

    pub fn is_done(&self) -> bool {
        self.state == TrackState::Done
    }

    /// Converged contour of every computed frame.
    pub fn contours(&self) -> impl Iterator<Item = &[[f64; 2]]> {
        self.frames.iter().map(|f| f.contour.as_slice())
    }
}

/// Runs single filaments against one shared frame bundle.
pub struct FilamentTracker<'a> {
    bundle: &'a FrameBundle,
    config: &'a TrackerConfig,
    kernel: DMatrix<f64>,
}

impl<'a> FilamentTracker<'a> {
    pub fn new(bundle: &'a FrameBundle, config: &'a TrackerConfig) -> Self {
        let ev = &config.evolution;
        Self {
            bundle,
            config,
            kernel: gaussian_kernel(ev.kernel_size, ev.kernel_sigma),
        }
    }

    /// Track one filament through every frame.
    ///
    /// Errors that prevent tracking from starting (bad seed, singular
    /// propagator) are returned as `Err`. Errors on a later frame end the
    /// track in [`TrackState::Failed`] with all earlier frames retained.
    pub fn track(&self, seed: &[[f64; 2]]) -> Result<TrackResult> {
        if seed.len() < 2 {
            return Err(TrackError::MissingUpstreamData(format!(
                "seed polyline needs at least 2 points, got {}",
                seed.len()
            )));
        }
        if seed.iter().any(|p| !p[0].is_finite() || !p[1].is_finite()) {
            return Err(TrackError::MissingUpstreamData(
                "seed polyline has non-finite coordinates".into(),
            ));
        }

        let ev = &self.config.evolution;
        let initial = resample_with_step(seed, ev.discretization_step);
        let n = initial.len();
        let propagator = Propagator::from_config(n, ev)?;
        let n_frames = self.bundle.n_frames();
        tracing::info!(
            "tracking filament: {} points over {} frames (seed length {:.1} px)",
            n,
            n_frames,
            contour_length(seed)
        );

        let mut anchors = [
            Anchor::unlocalized(initial[0]),
            Anchor::unlocalized(initial[n - 1]),
        ];
        let mut contour = initial.clone();
        let mut frames = Vec::with_capacity(n_frames);

        for i in 0..n_frames {
            let frame = self.bundle.frame(i);
            let mut record = match self.relax_frame(i, frame, &propagator, &contour, &mut anchors) {
                Ok(r) => r,
                Err(e) => return Ok(failed(initial, frames, i, e)),
            };

            if i + 1 < n_frames {
                let next = self.bundle.frame(i + 1);
                let relocated = relocate_between(anchors[0].position, frame, next, &self.config.relocation)
                    .and_then(|head| {
                        relocate_between(anchors[1].position, frame, next, &self.config.relocation)
                            .map(|tail| [head, tail])
                    });
                match relocated {
                    Ok(rel) => {
                        anchors[0].position = rel[0].point;
                        anchors[1].position = rel[1].point;
                        record.relocations = Some(rel);
                    }
                    Err(e) => {
                        frames.push(record);
                        return Ok(failed(initial, frames, i + 1, e));
                    }
                }
            }

            contour = record.contour.clone();
            frames.push(record);
        }

        tracing::info!("filament tracked through {} frames", frames.len());
        Ok(TrackResult {
            seed: initial,
            frames,
            state: TrackState::Done,
        })
    }

    /// Force fields, relaxation, mask sampling and localization for frame `i`.
    fn relax_frame(
        &self,
        i: usize,
        frame: &Frame,
        propagator: &Propagator,
        contour: &[[f64; 2]],
        anchors: &mut [Anchor; 2],
    ) -> Result<FrameTrack> {
        let ev = &self.config.evolution;
        let (w, h) = frame.dimensions();

        // Unlocalized ends share one field over all of this frame's junctions.
        let shared = anchors
            .iter()
            .any(|a| !a.localized)
            .then(|| BranchField::from_points(&frame.branch_points, w, h, &self.kernel));
        let single: Vec<Option<BranchField>> = anchors
            .iter()
            .map(|a| {
                a.localized
                    .then(|| BranchField::from_points(&[a.position], w, h, &self.kernel))
            })
            .collect();
        let fields = [
            end_field(&single[0], &shared)?,
            end_field(&single[1], &shared)?,
        ];

        let localize = [!anchors[0].localized, !anchors[1].localized];
        let evolver = SnakeEvolver::new(propagator, frame, fields, SnakeParams::from(ev));
        let evolution = evolver.run(contour, localize)?;
        if evolution.outcome == EvolutionOutcome::MaxIterReached {
            tracing::warn!(
                "frame {}: snake stopped at max_iter={} with mean shift {:.3e}",
                i,
                ev.max_iter,
                evolution.final_shift
            );
        }

        localize_ends(frame, &evolution, anchors);
        let endpoints = [anchors[0].position, anchors[1].position];

        let converged = evolution.converged().to_vec();
        let intensities = sample_nearest_points(&frame.binary, &converged);
        tracing::debug!(
            "frame {}: {:?}, head ({:.1}, {:.1}), tail ({:.1}, {:.1})",
            i,
            evolution.outcome,
            converged[0][0],
            converged[0][1],
            converged[converged.len() - 1][0],
            converged[converged.len() - 1][1]
        );

        let potentials = ev
            .keep_potentials
            .then(|| [fields[0].potential.field.clone(), fields[1].potential.field.clone()]);

        Ok(FrameTrack {
            frame: i,
            trajectory: evolution.trajectory,
            contour: converged,
            intensities,
            endpoints,
            outcome: evolution.outcome,
            final_shift: evolution.final_shift,
            relocations: None,
            potentials,
        })
    }
}

/// Bind every end that asked for localization to a junction of `frame`.
///
/// The owner under the contour end picks the junction directly; an unowned
/// end falls back to the nearest junction, or to itself if the frame has none.
fn localize_ends(frame: &Frame, evolution: &Evolution, anchors: &mut [Anchor; 2]) {
    let contour = evolution.converged();
    let ends = [contour[0], contour[contour.len() - 1]];
    for k in 0..2 {
        let Some(owner) = evolution.end_owners[k] else {
            continue;
        };
        let position = match owner as usize {
            0 => nearest_point(&frame.branch_points, ends[k]).unwrap_or(ends[k]),
            idx => frame.branch_points.get(idx - 1).copied().unwrap_or(ends[k]),
        };
        tracing::debug!(
            "end {} localized at ({:.1}, {:.1}) (owner {})",
            k,
            position[0],
            position[1],
            owner
        );
        anchors[k] = Anchor {
            position,
            localized: true,
        };
    }
}

fn end_field<'f>(
    single: &'f Option<BranchField>,
    shared: &'f Option<BranchField>,
) -> Result<&'f BranchField> {
    single
        .as_ref()
        .or(shared.as_ref())
        .ok_or_else(|| TrackError::WorkerTaskFailure("no branching field for endpoint".into()))
}

fn nearest_point(points: &[[f64; 2]], p: [f64; 2]) -> Option<[f64; 2]> {
    points.iter().copied().min_by(|a, b| {
        let da = (a[0] - p[0]).hypot(a[1] - p[1]);
        let db = (b[0] - p[0]).hypot(b[1] - p[1]);
        da.total_cmp(&db)
    })
}

fn failed(seed: Vec<[f64; 2]>, frames: Vec<FrameTrack>, frame: usize, e: TrackError) -> TrackResult {
    tracing::warn!(
        "filament stopped entering frame {} after {} frames: {}",
        frame,
        frames.len(),
        e
    );
    TrackResult {
        seed,
        frames,
        state: TrackState::Failed {
            frame,
            kind: e.kind().to_string(),
            reason: e.to_string(),
        },
    }
}
