//! Synthetic frames shared by unit tests.

use image::{GrayImage, Luma};

use crate::bundle::{FloatImage, FlowField, Frame};

/// All-zero frame of the given size with a zero flow field.
pub(crate) fn blank_frame(w: u32, h: u32) -> Frame {
    Frame {
        enhanced: FloatImage::new(w, h),
        binary: GrayImage::new(w, h),
        skeleton: GrayImage::new(w, h),
        branch_distance: FloatImage::new(w, h),
        flow: flow_from_fn(w, h, |_, _| [0.0, 0.0]),
        branch_points: Vec::new(),
    }
}

/// Flow field for a `w × h` frame; `f` receives frame coordinates.
pub(crate) fn flow_from_fn<F>(w: u32, h: u32, f: F) -> FlowField
where
    F: Fn(f64, f64) -> [f64; 2],
{
    let (fw, fh) = (2 * w, 2 * h);
    let mut x = FloatImage::new(fw, fh);
    let mut y = FloatImage::new(fw, fh);
    for v in 0..fh {
        for u in 0..fw {
            let g = f(u as f64 * 0.5, v as f64 * 0.5);
            x.put_pixel(u, v, Luma([g[0] as f32]));
            y.put_pixel(u, v, Luma([g[1] as f32]));
        }
    }
    FlowField { x, y }
}

/// Frame with a bright horizontal filament from `x0` to `x1` (inclusive) on row `row`.
///
/// The enhanced band and skeleton run along the row, the binary mask is three
/// pixels thick and the flow points along `+x` with magnitude `flow`.
pub(crate) fn horizontal_filament_frame(
    w: u32,
    h: u32,
    row: u32,
    x0: u32,
    x1: u32,
    flow: f64,
) -> Frame {
    let mut frame = blank_frame(w, h);
    for x in x0..=x1 {
        frame.enhanced.put_pixel(x, row, Luma([1.0]));
        frame.skeleton.put_pixel(x, row, Luma([255]));
        for y in row.saturating_sub(1)..=(row + 1).min(h - 1) {
            frame.binary.put_pixel(x, y, Luma([255]));
        }
    }
    frame.flow = flow_from_fn(w, h, |_, _| [flow, 0.0]);
    frame
}
