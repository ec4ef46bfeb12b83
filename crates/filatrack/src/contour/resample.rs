//! Arc-length parametrization of polylines.

/// Minimum number of points a resampled contour keeps.
pub const MIN_CONTOUR_POINTS: usize = 3;

/// Cumulative arc length at every vertex, starting at 0.
pub fn cumulative_length(points: &[[f64; 2]]) -> Vec<f64> {
    let mut out = Vec::with_capacity(points.len());
    let mut acc = 0.0;
    for (i, p) in points.iter().enumerate() {
        if i > 0 {
            let q = points[i - 1];
            acc += ((p[0] - q[0]).powi(2) + (p[1] - q[1]).powi(2)).sqrt();
        }
        out.push(acc);
    }
    out
}

/// Total polyline length.
pub fn contour_length(points: &[[f64; 2]]) -> f64 {
    cumulative_length(points).last().copied().unwrap_or(0.0)
}

/// Resample a polyline to `n` points uniformly spaced in arc length.
///
/// The first and last vertices are kept; intermediate points are linearly
/// interpolated along the original segments. A zero-length polyline
/// collapses to `n` copies of its first vertex.
pub fn resample_uniform(points: &[[f64; 2]], n: usize) -> Vec<[f64; 2]> {
    if points.is_empty() || n == 0 {
        return Vec::new();
    }
    let cum = cumulative_length(points);
    let total = cum[cum.len() - 1];
    if points.len() == 1 || total <= f64::EPSILON {
        return vec![points[0]; n];
    }
    if n == 1 {
        return vec![points[0]];
    }

    let last_seg = points.len() - 2;
    let mut seg = 0usize;
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let t = if i + 1 == n {
            total
        } else {
            total * i as f64 / (n - 1) as f64
        };
        while seg < last_seg && cum[seg + 1] < t {
            seg += 1;
        }
        let span = cum[seg + 1] - cum[seg];
        let u = if span > 0.0 {
            ((t - cum[seg]) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let a = points[seg];
        let b = points[seg + 1];
        out.push([a[0] + u * (b[0] - a[0]), a[1] + u * (b[1] - a[1])]);
    }
    out
}

/// Resample a polyline at an approximate spacing of `step` pixels.
///
/// The point count is `floor(length / step)`, never below
/// [`MIN_CONTOUR_POINTS`]; the resulting spacing is `length / (count − 1)`.
pub fn resample_with_step(points: &[[f64; 2]], step: f64) -> Vec<[f64; 2]> {
    let length = contour_length(points);
    let n = if step > 0.0 && length.is_finite() {
        (length / step).floor() as usize
    } else {
        0
    };
    resample_uniform(points, n.max(MIN_CONTOUR_POINTS))
}

/// Mean Euclidean displacement between two equally long point sets.
pub fn mean_displacement(a: &[[f64; 2]], b: &[[f64; 2]]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    if a.is_empty() {
        return 0.0;
    }
    let sum: f64 = a
        .iter()
        .zip(b)
        .map(|(p, q)| ((p[0] - q[0]).powi(2) + (p[1] - q[1]).powi(2)).sqrt())
        .sum();
    sum / a.len() as f64
}
