//! Error taxonomy shared by every tracking stage.

use std::fmt;

/// Errors raised while loading inputs or tracking one filament.
///
/// Every variant is local to the filament (or load step) that produced it;
/// the batch driver converts them into per-filament failure records.
#[derive(Debug)]
pub enum TrackError {
    /// A propagator inversion or contour update produced non-finite values.
    NumericalDivergence {
        /// Stage that detected the divergence.
        stage: &'static str,
    },
    /// Endpoint relocation found no skeleton pixel inside the search window.
    NoSkeletonInWindow {
        /// Integer pixel position the search was centered on.
        x: i64,
        /// Integer pixel position the search was centered on.
        y: i64,
    },
    /// A required image, coordinate list or seed is absent or malformed.
    MissingUpstreamData(String),
    /// Any other failure inside one filament task (including panics).
    WorkerTaskFailure(String),
    /// Configuration rejected by validation.
    InvalidConfig(String),
    /// Filesystem error.
    Io(std::io::Error),
    /// Image decoding error.
    Image(image::ImageError),
    /// JSON (de)serialization error.
    Json(serde_json::Error),
    /// CSV parsing error.
    Csv(csv::Error),
}

impl TrackError {
    /// Short machine-readable label used in batch reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NumericalDivergence { .. } => "numerical_divergence",
            Self::NoSkeletonInWindow { .. } => "no_skeleton_in_window",
            Self::MissingUpstreamData(_) => "missing_upstream_data",
            Self::WorkerTaskFailure(_) => "worker_task_failure",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Io(_) => "io",
            Self::Image(_) => "image",
            Self::Json(_) => "json",
            Self::Csv(_) => "csv",
        }
    }
}

impl fmt::Display for TrackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NumericalDivergence { stage } => {
                write!(f, "numerical divergence in {}", stage)
            }
            Self::NoSkeletonInWindow { x, y } => {
                write!(f, "no skeleton pixel in search window around ({}, {})", x, y)
            }
            Self::MissingUpstreamData(what) => write!(f, "missing upstream data: {}", what),
            Self::WorkerTaskFailure(msg) => write!(f, "worker task failed: {}", msg),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            Self::Io(e) => write!(f, "io error: {}", e),
            Self::Image(e) => write!(f, "image error: {}", e),
            Self::Json(e) => write!(f, "json error: {}", e),
            Self::Csv(e) => write!(f, "csv error: {}", e),
        }
    }
}

impl std::error::Error for TrackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Image(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Csv(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrackError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<image::ImageError> for TrackError {
    fn from(e: image::ImageError) -> Self {
        Self::Image(e)
    }
}

impl From<serde_json::Error> for TrackError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<csv::Error> for TrackError {
    fn from(e: csv::Error) -> Self {
        Self::Csv(e)
    }
}

pub type Result<T> = std::result::Result<T, TrackError>;
