//! filatrack: active-contour tracking of curvilinear filaments through
//! time-lapse microscopy.
//!
//! Each filament is tracked independently from a seed polyline. The stages are:
//!
//! 1. **Contour** – arc-length resampling and the implicit stiffness propagator.
//! 2. **Force** – synthetic branching potentials stamped at junctions, and
//!    their attraction forces.
//! 3. **Snake** – per-frame relaxation under gradient vector flow plus
//!    endpoint constraint forces.
//! 4. **Relocate** – correlation and skeleton constrained search for each
//!    endpoint in the next frame.
//! 5. **Track** – the per-filament frame loop with one-time anchor
//!    localization and warm starts.
//! 6. **Parallel** – batches of filaments on a worker pool sharing one
//!    read-only [`FrameBundle`].
//!
//! # Public API
//! - [`FrameBundle`] / [`load_bundle`] for inputs, [`TrackerConfig`] for tuning
//! - [`FilamentTracker`] for a single filament
//! - [`run_batch`] for many filaments, returning a [`BatchReport`]

pub mod bundle;
pub mod config;
pub mod contour;
pub mod error;
pub mod force;
pub mod io;
pub mod parallel;
pub mod relocate;
pub mod sampling;
pub mod snake;
pub mod track;

#[cfg(test)]
pub(crate) mod test_utils;

pub use bundle::{FlowField, Frame, FrameBundle};
pub use config::{Boundary, EvolutionConfig, ParallelConfig, RelocationConfig, TrackerConfig};
pub use error::{Result, TrackError};
pub use io::{load_bundle, load_seeds, write_frame_tables, write_track_archive};
pub use parallel::{
    run_batch, run_batch_with, BatchReport, CompletedFilament, FailedFilament, FilamentTask,
    TaskContext,
};
pub use relocate::Relocation;
pub use snake::EvolutionOutcome;
pub use track::{FilamentTracker, FrameTrack, TrackResult, TrackState};
