//! Read-only per-frame image bundle shared by every filament task.

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::distance_transform::euclidean_squared_distance_transform;

use crate::error::{Result, TrackError};
use crate::sampling::bilinear;

/// Single-channel `f32` raster.
pub type FloatImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Single-channel `f64` raster used for synthetic potentials and forces.
pub type Field = ImageBuffer<Luma<f64>, Vec<f64>>;

/// Decoded gradient-vector-flow field, stored at twice the frame resolution.
#[derive(Debug, Clone)]
pub struct FlowField {
    pub x: FloatImage,
    pub y: FloatImage,
}

impl FlowField {
    /// Decode magnitude/angle byte images.
    ///
    /// A magnitude byte `m` maps to `m / 255`, an angle byte `a` to
    /// `(2a / 255 - 1)π`, and the vector is `magnitude · (cos θ, sin θ)`.
    pub fn decode(magnitude: &GrayImage, angle: &GrayImage) -> Result<Self> {
        if magnitude.dimensions() != angle.dimensions() {
            return Err(TrackError::MissingUpstreamData(format!(
                "gvf magnitude is {:?} but angle is {:?}",
                magnitude.dimensions(),
                angle.dimensions()
            )));
        }
        let (w, h) = magnitude.dimensions();
        let mut x = FloatImage::new(w, h);
        let mut y = FloatImage::new(w, h);
        for (px, py, m) in magnitude.enumerate_pixels() {
            let a = angle.get_pixel(px, py)[0] as f64;
            let mag = m[0] as f64 / 255.0;
            let theta = (2.0 * a / 255.0 - 1.0) * std::f64::consts::PI;
            x.put_pixel(px, py, Luma([(mag * theta.cos()) as f32]));
            y.put_pixel(px, py, Luma([(mag * theta.sin()) as f32]));
        }
        Ok(Self { x, y })
    }

    /// Sample the flow at a position given in flow-raster coordinates.
    #[inline]
    pub fn sample(&self, x: f64, y: f64) -> [f64; 2] {
        [bilinear(&self.x, x, y), bilinear(&self.y, x, y)]
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.x.dimensions()
    }
}

/// All rasters and coordinates for one time point.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Ridge-enhanced intensity in [0, 1]; also the endpoint stretching potential.
    pub enhanced: FloatImage,
    /// Binary filament mask (non-zero = foreground).
    pub binary: GrayImage,
    /// Skeleton mask (non-zero = skeleton pixel).
    pub skeleton: GrayImage,
    /// Euclidean distance to the nearest branching point.
    pub branch_distance: FloatImage,
    /// Gradient vector flow at twice the frame resolution.
    pub flow: FlowField,
    /// Detected branching-point pixel coordinates `[x, y]`.
    pub branch_points: Vec<[f64; 2]>,
}

impl Frame {
    /// Assemble a frame, deriving the branching distance transform.
    pub fn new(
        enhanced: FloatImage,
        binary: GrayImage,
        skeleton: GrayImage,
        flow: FlowField,
        branch_points: Vec<[f64; 2]>,
    ) -> Result<Self> {
        let (w, h) = enhanced.dimensions();
        if binary.dimensions() != (w, h) || skeleton.dimensions() != (w, h) {
            return Err(TrackError::MissingUpstreamData(format!(
                "mask dimensions {:?}/{:?} do not match enhanced image {}x{}",
                binary.dimensions(),
                skeleton.dimensions(),
                w,
                h
            )));
        }
        if flow.dimensions() != (2 * w, 2 * h) {
            return Err(TrackError::MissingUpstreamData(format!(
                "gvf field is {:?}, expected {}x{} (twice the frame size)",
                flow.dimensions(),
                2 * w,
                2 * h
            )));
        }
        let branch_distance = branch_distance_image(w, h, &branch_points);
        Ok(Self {
            enhanced,
            binary,
            skeleton,
            branch_distance,
            flow,
            branch_points,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.enhanced.dimensions()
    }
}

/// Distance from every pixel to the nearest branching point.
///
/// Frames without branching points yield an all-zero image.
pub fn branch_distance_image(width: u32, height: u32, points: &[[f64; 2]]) -> FloatImage {
    let mut seeds = GrayImage::new(width, height);
    let mut any = false;
    for p in points {
        let (x, y) = (p[0].round(), p[1].round());
        if x >= 0.0 && y >= 0.0 && x < width as f64 && y < height as f64 {
            seeds.put_pixel(x as u32, y as u32, Luma([255]));
            any = true;
        }
    }
    if !any {
        return FloatImage::new(width, height);
    }
    let sq = euclidean_squared_distance_transform(&seeds);
    FloatImage::from_fn(width, height, |x, y| {
        Luma([sq.get_pixel(x, y)[0].sqrt() as f32])
    })
}

/// Immutable frame stack for one batch run.
///
/// Built once, wrapped in an `Arc` and read concurrently by every worker.
#[derive(Debug, Clone)]
pub struct FrameBundle {
    frames: Vec<Frame>,
    width: u32,
    height: u32,
}

impl FrameBundle {
    /// Build a bundle; all frames must share one size.
    pub fn new(frames: Vec<Frame>) -> Result<Self> {
        let first = frames
            .first()
            .ok_or_else(|| TrackError::MissingUpstreamData("image bundle has no frames".into()))?;
        let (width, height) = first.dimensions();
        if let Some((i, f)) = frames
            .iter()
            .enumerate()
            .find(|(_, f)| f.dimensions() != (width, height))
        {
            return Err(TrackError::MissingUpstreamData(format!(
                "frame {} is {:?}, expected {}x{}",
                i,
                f.dimensions(),
                width,
                height
            )));
        }
        Ok(Self {
            frames,
            width,
            height,
        })
    }

    pub fn n_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn frame(&self, index: usize) -> &Frame {
        &self.frames[index]
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
