//! Synthetic branching potentials and the attraction forces derived from them.
//!
//! A potential is built by stamping a `[0, 1]` kernel at each seed point.
//! Overlapping stamps keep the per-pixel maximum and an owner mask records
//! which seed (1-based) holds that maximum; on equal values the later seed
//! wins.

use image::{ImageBuffer, Luma};
use nalgebra::DMatrix;

use crate::bundle::Field;
use crate::sampling::{bilinear, nearest};

/// Per-pixel 1-based index of the seed owning the potential maximum (0 = none).
pub type OwnerMask = ImageBuffer<Luma<u32>, Vec<u32>>;

/// Kernel values at or below this magnitude are never stamped.
const STAMP_EPS: f64 = 1.0e-7;

/// Square Gaussian kernel min-max normalised to `[0, 1]`.
///
/// Built as the outer product of a sum-normalised 1-D Gaussian centred on
/// `(size − 1) / 2`.
pub fn gaussian_kernel(size: usize, sigma: f64) -> DMatrix<f64> {
    let c = (size as f64 - 1.0) * 0.5;
    let g: Vec<f64> = (0..size)
        .map(|i| {
            let d = i as f64 - c;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = g.iter().sum();
    let g: Vec<f64> = g.iter().map(|v| v / sum).collect();

    let k = DMatrix::<f64>::from_fn(size, size, |r, col| g[r] * g[col]);
    let lo = k.min();
    let hi = k.max();
    if hi - lo <= 0.0 {
        return DMatrix::from_element(size, size, 1.0);
    }
    k.map(|v| (v - lo) / (hi - lo))
}

/// Stamped potential plus its owner mask.
#[derive(Debug, Clone)]
pub struct Potential {
    pub field: Field,
    pub owner: OwnerMask,
}

/// Stamp `kernel` centred at every rounded point, clipped to the raster.
pub fn stamp(points: &[[f64; 2]], width: u32, height: u32, kernel: &DMatrix<f64>) -> Potential {
    let mut field = Field::new(width, height);
    let mut owner = OwnerMask::new(width, height);
    let (k_rows, k_cols) = kernel.shape();
    let half_r = (k_rows / 2) as i64;
    let half_c = (k_cols / 2) as i64;

    for (idx, p) in points.iter().enumerate() {
        if !p[0].is_finite() || !p[1].is_finite() {
            continue;
        }
        let cx = p[0].round() as i64;
        let cy = p[1].round() as i64;
        for ky in 0..k_rows {
            let ry = cy + ky as i64 - half_r;
            if ry < 0 || ry >= height as i64 {
                continue;
            }
            for kx in 0..k_cols {
                let rx = cx + kx as i64 - half_c;
                if rx < 0 || rx >= width as i64 {
                    continue;
                }
                let k = kernel[(ky, kx)];
                let (px, py) = (rx as u32, ry as u32);
                if k.abs() > STAMP_EPS && k >= field.get_pixel(px, py)[0] {
                    field.put_pixel(px, py, Luma([k]));
                    owner.put_pixel(px, py, Luma([idx as u32 + 1]));
                }
            }
        }
    }

    Potential { field, owner }
}

/// Attraction force components of a potential.
#[derive(Debug, Clone)]
pub struct ForceField {
    pub fx: Field,
    pub fy: Field,
}

/// Sobel first derivatives of `potential`, pointing toward increasing values.
///
/// Uses the `[1 2 1] ⊗ [−1 0 1] / 4` stencil; the one-pixel border is zero.
pub fn gradient(potential: &Field) -> ForceField {
    let (w, h) = potential.dimensions();
    let mut fx = Field::new(w, h);
    let mut fy = Field::new(w, h);
    if w < 3 || h < 3 {
        return ForceField { fx, fy };
    }
    let p = |x: u32, y: u32| potential.get_pixel(x, y)[0];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = (p(x + 1, y - 1) + 2.0 * p(x + 1, y) + p(x + 1, y + 1))
                - (p(x - 1, y - 1) + 2.0 * p(x - 1, y) + p(x - 1, y + 1));
            let gy = (p(x - 1, y + 1) + 2.0 * p(x, y + 1) + p(x + 1, y + 1))
                - (p(x - 1, y - 1) + 2.0 * p(x, y - 1) + p(x + 1, y - 1));
            fx.put_pixel(x, y, Luma([gx * 0.25]));
            fy.put_pixel(x, y, Luma([gy * 0.25]));
        }
    }
    ForceField { fx, fy }
}

/// Branching potential, owner mask and attraction force for one set of seeds.
#[derive(Debug, Clone)]
pub struct BranchField {
    pub potential: Potential,
    pub force: ForceField,
}

impl BranchField {
    pub fn from_points(points: &[[f64; 2]], width: u32, height: u32, kernel: &DMatrix<f64>) -> Self {
        let potential = stamp(points, width, height, kernel);
        let force = gradient(&potential.field);
        Self { potential, force }
    }

    /// Bilinearly sampled attraction force at `p`.
    #[inline]
    pub fn force_at(&self, p: [f64; 2]) -> [f64; 2] {
        [
            bilinear(&self.force.fx, p[0], p[1]),
            bilinear(&self.force.fy, p[0], p[1]),
        ]
    }

    /// 1-based owner of the pixel containing `p` (0 when unowned or outside).
    pub fn owner_at(&self, p: [f64; 2]) -> u32 {
        nearest(&self.potential.owner, p[0], p[1]).unwrap_or(0)
    }
}
