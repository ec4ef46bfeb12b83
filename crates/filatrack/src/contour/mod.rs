//! Contour geometry and the stiffness model.
//!
//! A contour is an ordered `Vec<[f64; 2]>` of `[x, y]` pixel positions whose
//! length is fixed when the seed polyline is resampled.

mod resample;
mod stiffness;

pub use resample::{
    contour_length, cumulative_length, mean_displacement, resample_uniform, resample_with_step,
    MIN_CONTOUR_POINTS,
};
pub use stiffness::{build_operator, propagate, Propagator};
