//! Raster sampling primitives.
//!
//! Positions are `[x, y]` in pixel units with pixel centers at integer
//! coordinates. Samples outside the raster read as zero, and so do the
//! missing right/bottom neighbours on the last column/row.

use image::{ImageBuffer, Luma, Primitive};

/// Sample a single-channel raster at a sub-pixel position using bilinear interpolation.
#[inline]
pub fn bilinear<T>(img: &ImageBuffer<Luma<T>, Vec<T>>, x: f64, y: f64) -> f64
where
    T: Primitive + Into<f64>,
{
    if !x.is_finite() || !y.is_finite() {
        return 0.0;
    }
    let (w, h) = img.dimensions();
    let xf = x.floor();
    let yf = y.floor();
    if xf < 0.0 || yf < 0.0 || xf >= w as f64 || yf >= h as f64 {
        return 0.0;
    }
    let xi = xf as u32;
    let yi = yf as u32;
    let at = |px: u32, py: u32| -> f64 {
        if px < w && py < h {
            img.get_pixel(px, py)[0].into()
        } else {
            0.0
        }
    };

    let v00 = at(xi, yi);
    let v01 = at(xi + 1, yi);
    let v10 = at(xi, yi + 1);
    let v11 = at(xi + 1, yi + 1);
    let rx = x - xf;
    let ry = y - yf;
    (v00 * (1.0 - rx) + v01 * rx) * (1.0 - ry) + (v10 * (1.0 - rx) + v11 * rx) * ry
}

/// Read the pixel containing `[x, y]` without interpolation.
///
/// Returns `None` outside the raster.
#[inline]
pub fn nearest<T>(img: &ImageBuffer<Luma<T>, Vec<T>>, x: f64, y: f64) -> Option<T>
where
    T: Primitive,
{
    if !x.is_finite() || !y.is_finite() {
        return None;
    }
    let (w, h) = img.dimensions();
    let xf = x.floor();
    let yf = y.floor();
    if xf < 0.0 || yf < 0.0 || xf >= w as f64 || yf >= h as f64 {
        return None;
    }
    Some(img.get_pixel(xf as u32, yf as u32)[0])
}

/// Nearest-pixel samples for every point, zero outside the raster.
pub fn sample_nearest_points<T>(img: &ImageBuffer<Luma<T>, Vec<T>>, points: &[[f64; 2]]) -> Vec<T>
where
    T: Primitive + Default,
{
    points
        .iter()
        .map(|p| nearest(img, p[0], p[1]).unwrap_or_default())
        .collect()
}
