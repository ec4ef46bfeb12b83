//! Cross-frame endpoint relocation.
//!
//! A template around the endpoint in frame `i` is correlated against a
//! larger search window around the same pixel in frame `i + 1`. Candidates
//! are restricted to skeleton pixels of frame `i + 1`; the winner minimises
//! distance plus weighted correlation deficit (plus an optional
//! branching-distance term). Rasters behave as if zero-padded by the search
//! half-size, so windows near the border read zeros and padding is never
//! skeleton.

use image::{GrayImage, ImageBuffer, Luma, Primitive};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::bundle::{FloatImage, Frame};
use crate::config::RelocationConfig;
use crate::error::{Result, TrackError};

/// Relocated endpoint and the score that selected it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Relocation {
    /// Integer pixel position `[x, y]` in frame `i + 1`.
    pub point: [f64; 2],
    /// Penalty of the winning candidate.
    pub penalty: f64,
    /// Normalised cross-correlation at the winning candidate.
    pub correlation: f64,
}

/// `(2·half + 1)²` window centred on `(cx, cy)`; pixels outside read as 0.
///
/// Rows index `y`, columns index `x`.
pub(crate) fn extract_window<T>(
    img: &ImageBuffer<Luma<T>, Vec<T>>,
    cx: i64,
    cy: i64,
    half: usize,
) -> DMatrix<f64>
where
    T: Primitive + Into<f64>,
{
    let (w, h) = img.dimensions();
    let side = 2 * half + 1;
    let half = half as i64;
    DMatrix::from_fn(side, side, |r, c| {
        let x = cx + c as i64 - half;
        let y = cy + r as i64 - half;
        if x < 0 || y < 0 || x >= w as i64 || y >= h as i64 {
            0.0
        } else {
            img.get_pixel(x as u32, y as u32)[0].into()
        }
    })
}

/// Normalised cross-correlation of `template` at every position of `search`.
///
/// The output has the shape of `search`; entry `(r, c)` scores the template
/// centred on `(r, c)`, with `search` zero-padded by the template half-size.
/// Positions whose window (or the template itself) has no variance score 0.
pub fn match_template_ncc(search: &DMatrix<f64>, template: &DMatrix<f64>) -> DMatrix<f64> {
    let (sr, sc) = search.shape();
    let (tr, tc) = template.shape();
    let (hr, hc) = ((tr / 2) as i64, (tc / 2) as i64);
    let n = (tr * tc) as f64;

    let t_mean = template.mean();
    let t_ssd: f64 = template.iter().map(|v| (v - t_mean) * (v - t_mean)).sum();

    let at = |r: i64, c: i64| -> f64 {
        if r < 0 || c < 0 || r >= sr as i64 || c >= sc as i64 {
            0.0
        } else {
            search[(r as usize, c as usize)]
        }
    };

    DMatrix::from_fn(sr, sc, |r, c| {
        let mut xcorr = 0.0;
        let mut sum = 0.0;
        let mut sum2 = 0.0;
        for i in 0..tr {
            let rr = r as i64 + i as i64 - hr;
            for j in 0..tc {
                let v = at(rr, c as i64 + j as i64 - hc);
                xcorr += v * template[(i, j)];
                sum += v;
                sum2 += v * v;
            }
        }
        let numerator = xcorr - sum * t_mean;
        let denominator = ((sum2 - sum * sum / n) * t_ssd).max(0.0).sqrt();
        if denominator <= f64::EPSILON {
            0.0
        } else {
            numerator / denominator
        }
    })
}

/// Relocate `point` from the current frame into the next one.
///
/// Fails with [`TrackError::NoSkeletonInWindow`] when the search window
/// holds no skeleton pixel.
pub fn relocate_endpoint(
    point: [f64; 2],
    enhanced_curr: &FloatImage,
    enhanced_next: &FloatImage,
    skeleton_next: &GrayImage,
    branch_distance_next: &FloatImage,
    cfg: &RelocationConfig,
) -> Result<Relocation> {
    if !point[0].is_finite() || !point[1].is_finite() {
        return Err(TrackError::NumericalDivergence {
            stage: "endpoint relocation",
        });
    }
    let px = point[0].floor() as i64;
    let py = point[1].floor() as i64;
    let wl = cfg.large_window;

    let skeleton = extract_window(skeleton_next, px, py, wl);
    if skeleton.iter().all(|&v| v <= 0.0) {
        return Err(TrackError::NoSkeletonInWindow { x: px, y: py });
    }

    let template = extract_window(enhanced_curr, px, py, cfg.small_window);
    let search = extract_window(enhanced_next, px, py, wl);
    let corr = match_template_ncc(&search, &template);
    let max_corr = corr.max();

    let branch = (cfg.branch_cost > 0.0).then(|| extract_window(branch_distance_next, px, py, wl));

    let side = 2 * wl + 1;
    let mut best: Option<(usize, usize, f64)> = None;
    for r in 0..side {
        for c in 0..side {
            if skeleton[(r, c)] <= 0.0 {
                continue;
            }
            let dr = r as f64 - wl as f64;
            let dc = c as f64 - wl as f64;
            let mut penalty = dr.hypot(dc) + cfg.corr_mult * (max_corr - corr[(r, c)]).abs();
            if let Some(b) = &branch {
                penalty += cfg.branch_cost * b[(r, c)];
            }
            if best.map_or(true, |(_, _, p)| penalty < p) {
                best = Some((r, c, penalty));
            }
        }
    }

    let (r, c, penalty) = best.ok_or(TrackError::NoSkeletonInWindow { x: px, y: py })?;
    Ok(Relocation {
        point: [
            (px + c as i64 - wl as i64) as f64,
            (py + r as i64 - wl as i64) as f64,
        ],
        penalty,
        correlation: corr[(r, c)],
    })
}

/// [`relocate_endpoint`] between two bundle frames.
pub fn relocate_between(
    point: [f64; 2],
    current: &Frame,
    next: &Frame,
    cfg: &RelocationConfig,
) -> Result<Relocation> {
    relocate_endpoint(
        point,
        &current.enhanced,
        &next.enhanced,
        &next.skeleton,
        &next.branch_distance,
        cfg,
    )
}
