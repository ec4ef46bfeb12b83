//! Filesystem boundary: image bundles, seed polylines and track archives.
//!
//! Bundle layout (one PNG per frame, matched by sorted file name):
//!
//! ```text
//! <dir>/enhanced/*.png       ridge-enhanced intensity (any bit depth)
//! <dir>/binaries/*.png       binary filament mask
//! <dir>/skeletons/*.png      skeleton mask
//! <dir>/gvf_magnitude/*.png  GVF magnitude bytes, twice the frame size
//! <dir>/gvf_angle/*.png      GVF angle bytes, twice the frame size
//! <dir>/branching_coords.json  [[[x, y], ...], ...] one list per frame
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use image::{GrayImage, Luma};
use imageproc::distance_transform::euclidean_squared_distance_transform;
use serde::{Deserialize, Serialize};

use crate::bundle::{FloatImage, FlowField, Frame, FrameBundle};
use crate::error::{Result, TrackError};
use crate::snake::EvolutionOutcome;
use crate::track::{TrackResult, TrackState};

/// Radius of the disk the binary masks are dilated with.
const BINARY_DILATION_RADIUS: f64 = 3.0;

const BRANCHING_FILE: &str = "branching_coords.json";

/// Sorted `*.png` files of `dir/sub`.
fn png_stack(dir: &Path, sub: &str) -> Result<Vec<PathBuf>> {
    let path = dir.join(sub);
    if !path.is_dir() {
        return Err(TrackError::MissingUpstreamData(format!(
            "{} is not a directory",
            path.display()
        )));
    }
    let mut files: Vec<PathBuf> = fs::read_dir(&path)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("png"))
        })
        .collect();
    files.sort();
    Ok(files)
}

fn load_mask(path: &Path) -> Result<GrayImage> {
    let mut img = image::open(path)?.to_luma8();
    for p in img.pixels_mut() {
        p[0] = if p[0] > 0 { 255 } else { 0 };
    }
    Ok(img)
}

/// Dilate a binary mask with a Euclidean disk.
pub fn dilate_disk(mask: &GrayImage, radius: f64) -> GrayImage {
    if !mask.pixels().any(|p| p[0] > 0) {
        return mask.clone();
    }
    let sq = euclidean_squared_distance_transform(mask);
    let r2 = radius * radius;
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        Luma([if sq.get_pixel(x, y)[0] <= r2 { 255 } else { 0 }])
    })
}

/// Rescale every image of the stack to `[0, 1]` with one global min/max.
fn rescale_stack(stack: &mut [FloatImage]) {
    let (lo, hi) = stack
        .iter()
        .flat_map(|img| img.pixels().map(|p| p[0]))
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    let span = hi - lo;
    for img in stack.iter_mut() {
        for p in img.pixels_mut() {
            p[0] = if span > 0.0 { (p[0] - lo) / span } else { 0.0 };
        }
    }
}

/// Load a frame bundle from `dir`.
pub fn load_bundle(dir: &Path) -> Result<FrameBundle> {
    let enhanced_files = png_stack(dir, "enhanced")?;
    let binary_files = png_stack(dir, "binaries")?;
    let skeleton_files = png_stack(dir, "skeletons")?;
    let magnitude_files = png_stack(dir, "gvf_magnitude")?;
    let angle_files = png_stack(dir, "gvf_angle")?;

    let n = enhanced_files.len();
    if n == 0 {
        return Err(TrackError::MissingUpstreamData(format!(
            "no enhanced frames in {}",
            dir.display()
        )));
    }
    for (name, len) in [
        ("binaries", binary_files.len()),
        ("skeletons", skeleton_files.len()),
        ("gvf_magnitude", magnitude_files.len()),
        ("gvf_angle", angle_files.len()),
    ] {
        if len != n {
            return Err(TrackError::MissingUpstreamData(format!(
                "{} has {} frames, enhanced has {}",
                name, len, n
            )));
        }
    }

    let branching_path = dir.join(BRANCHING_FILE);
    if !branching_path.is_file() {
        return Err(TrackError::MissingUpstreamData(format!(
            "{} not found",
            branching_path.display()
        )));
    }
    let branching: Vec<Vec<[f64; 2]>> = serde_json::from_str(&fs::read_to_string(&branching_path)?)?;
    if branching.len() != n {
        return Err(TrackError::MissingUpstreamData(format!(
            "{} lists {} frames, expected {}",
            BRANCHING_FILE,
            branching.len(),
            n
        )));
    }

    let mut enhanced = enhanced_files
        .iter()
        .map(|p| Ok(image::open(p)?.to_luma32f()))
        .collect::<Result<Vec<FloatImage>>>()?;
    rescale_stack(&mut enhanced);

    let mut frames = Vec::with_capacity(n);
    for (i, (enh, branch_points)) in enhanced.into_iter().zip(branching).enumerate() {
        let binary = dilate_disk(&load_mask(&binary_files[i])?, BINARY_DILATION_RADIUS);
        let skeleton = load_mask(&skeleton_files[i])?;
        let flow = FlowField::decode(
            &image::open(&magnitude_files[i])?.to_luma8(),
            &image::open(&angle_files[i])?.to_luma8(),
        )?;
        frames.push(Frame::new(enh, binary, skeleton, flow, branch_points)?);
    }

    let bundle = FrameBundle::new(frames)?;
    let (w, h) = bundle.dimensions();
    tracing::info!("loaded {} frames ({}x{}) from {}", n, w, h, dir.display());
    Ok(bundle)
}

/// Load seed polylines keyed by filament name.
///
/// `path` is either a JSON object `{"name": [[x, y], ...]}` or a directory
/// of headerless `x,y` CSV files named after their filament. Unreadable CSV
/// files are skipped with a warning. Seeds too short to track are returned
/// as-is and fail later as their own task.
pub fn load_seeds(path: &Path) -> Result<BTreeMap<String, Vec<[f64; 2]>>> {
    if path.is_dir() {
        load_seed_dir(path)
    } else {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

fn load_seed_dir(dir: &Path) -> Result<BTreeMap<String, Vec<[f64; 2]>>> {
    let mut seeds = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match read_seed_csv(&path) {
            Ok(points) => {
                seeds.insert(name.to_string(), points);
            }
            Err(e) => tracing::warn!("skipping seed {}: {}", path.display(), e),
        }
    }
    Ok(seeds)
}

fn read_seed_csv(path: &Path) -> Result<Vec<[f64; 2]>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let points = reader
        .deserialize::<(f64, f64)>()
        .map(|r| r.map(|(x, y)| [x, y]))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(points)
}

/// One frame of a persisted track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedFrame {
    /// 1-based frame number.
    pub frame: usize,
    pub points: Vec<[f64; 2]>,
    pub intensities: Vec<u8>,
    pub endpoints: [[f64; 2]; 2],
    pub outcome: EvolutionOutcome,
}

/// Per-filament archive written as `<name>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackArchive {
    pub name: String,
    pub n_points: usize,
    pub complete: bool,
    /// Failure reason for partial tracks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub frames: Vec<ArchivedFrame>,
}

impl TrackArchive {
    pub fn from_result(name: &str, result: &TrackResult) -> Self {
        let failure = match &result.state {
            TrackState::Done => None,
            TrackState::Failed { reason, .. } => Some(reason.clone()),
        };
        Self {
            name: name.to_string(),
            n_points: result.n_points(),
            complete: result.is_done(),
            failure,
            frames: result
                .frames
                .iter()
                .map(|f| ArchivedFrame {
                    frame: f.frame + 1,
                    points: f.contour.clone(),
                    intensities: f.intensities.clone(),
                    endpoints: f.endpoints,
                    outcome: f.outcome,
                })
                .collect(),
        }
    }
}

fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
        .collect()
}

/// File name used for a filament's archive.
pub fn archive_file_name(name: &str) -> String {
    format!("{}.json", safe_name(name))
}

/// Persist one filament's track into `dir`.
pub fn write_track_archive(dir: &Path, name: &str, result: &TrackResult) -> Result<PathBuf> {
    let path = dir.join(archive_file_name(name));
    let archive = TrackArchive::from_result(name, result);
    fs::write(&path, serde_json::to_string_pretty(&archive)?)?;
    Ok(path)
}

/// Write the converged contours as headerless `x,y` tables, one per frame:
/// `dir/<name>/00001.csv`, `00002.csv`, ... Returns the table directory.
pub fn write_frame_tables(dir: &Path, name: &str, result: &TrackResult) -> Result<PathBuf> {
    let table_dir = dir.join(safe_name(name));
    fs::create_dir_all(&table_dir)?;
    for f in &result.frames {
        let path = table_dir.join(format!("{:05}.csv", f.frame + 1));
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(&path)?;
        for p in &f.contour {
            writer.serialize((p[0], p[1]))?;
        }
        writer.flush()?;
    }
    Ok(table_dir)
}

pub fn read_track_archive(path: &Path) -> Result<TrackArchive> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

/// Write any serializable value as pretty JSON.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::horizontal_filament_frame;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("filatrack-io-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_frame_pngs(dir: &Path, idx: usize, w: u32, h: u32) {
        for sub in ["enhanced", "binaries", "skeletons", "gvf_magnitude", "gvf_angle"] {
            fs::create_dir_all(dir.join(sub)).unwrap();
        }
        let file = format!("{:05}.png", idx + 1);
        let enh = GrayImage::from_fn(w, h, |x, _| Luma([if x == 5 { 200 } else { 50 }]));
        enh.save(dir.join("enhanced").join(&file)).unwrap();
        let mut bin = GrayImage::new(w, h);
        bin.put_pixel(w / 2, h / 2, Luma([1]));
        bin.save(dir.join("binaries").join(&file)).unwrap();
        bin.save(dir.join("skeletons").join(&file)).unwrap();
        GrayImage::from_pixel(2 * w, 2 * h, Luma([255]))
            .save(dir.join("gvf_magnitude").join(&file))
            .unwrap();
        GrayImage::from_pixel(2 * w, 2 * h, Luma([128]))
            .save(dir.join("gvf_angle").join(&file))
            .unwrap();
    }

    #[test]
    fn bundle_round_trips_through_png_stacks() {
        let dir = scratch("bundle");
        for i in 0..2 {
            write_frame_pngs(&dir, i, 16, 16);
        }
        fs::write(dir.join(BRANCHING_FILE), "[[[3, 4]], []]").unwrap();

        let bundle = load_bundle(&dir).unwrap();
        assert_eq!(bundle.n_frames(), 2);
        assert_eq!(bundle.dimensions(), (16, 16));
        let f = bundle.frame(0);
        assert_eq!(f.enhanced.get_pixel(5, 0)[0], 1.0);
        assert_eq!(f.enhanced.get_pixel(0, 0)[0], 0.0);
        // Radius-3 disk around (8, 8).
        assert_eq!(f.binary.get_pixel(11, 8)[0], 255);
        assert_eq!(f.binary.get_pixel(10, 10)[0], 255);
        assert_eq!(f.binary.get_pixel(11, 11)[0], 0);
        assert_eq!(f.skeleton.get_pixel(8, 8)[0], 255);
        assert_eq!(f.skeleton.get_pixel(9, 8)[0], 0);
        assert_eq!(f.branch_points, vec![[3.0, 4.0]]);
        assert_eq!(f.branch_distance.get_pixel(3, 4)[0], 0.0);
        assert!(bundle.frame(1).branch_points.is_empty());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_stack_is_reported() {
        let dir = scratch("missing");
        write_frame_pngs(&dir, 0, 8, 8);
        fs::remove_dir_all(dir.join("skeletons")).unwrap();
        fs::write(dir.join(BRANCHING_FILE), "[[]]").unwrap();
        assert!(matches!(
            load_bundle(&dir),
            Err(TrackError::MissingUpstreamData(_))
        ));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn seeds_load_from_json_and_csv() {
        let dir = scratch("seeds");
        let json = dir.join("seeds.json");
        fs::write(&json, r#"{"f1": [[1, 2], [3, 4]], "f0": [[0, 0], [5, 0], [9, 1]]}"#).unwrap();
        let seeds = load_seeds(&json).unwrap();
        assert_eq!(seeds.keys().collect::<Vec<_>>(), vec!["f0", "f1"]);
        assert_eq!(seeds["f1"], vec![[1.0, 2.0], [3.0, 4.0]]);

        let csv_dir = dir.join("csv");
        fs::create_dir_all(&csv_dir).unwrap();
        fs::write(csv_dir.join("a.csv"), "1.5, 2\n3,4\n").unwrap();
        fs::write(csv_dir.join("notes.txt"), "ignored").unwrap();
        let seeds = load_seeds(&csv_dir).unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds["a"], vec![[1.5, 2.0], [3.0, 4.0]]);

        // Too short to track, but loading leaves that to the task.
        fs::write(csv_dir.join("b.csv"), "1,1\n").unwrap();
        let seeds = load_seeds(&csv_dir).unwrap();
        assert_eq!(seeds["b"], vec![[1.0, 1.0]]);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn unparsable_seed_file_is_skipped() {
        let dir = scratch("bad-seed");
        fs::write(dir.join("good.csv"), "0,0\n10,0\n20,1\n").unwrap();
        fs::write(dir.join("broken.csv"), "0,0\nnot,a number\n").unwrap();
        let seeds = load_seeds(&dir).unwrap();
        assert_eq!(seeds.keys().collect::<Vec<_>>(), vec!["good"]);
        assert_eq!(seeds["good"].len(), 3);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn archive_uses_one_based_frames() {
        use crate::config::TrackerConfig;
        use crate::track::FilamentTracker;

        let frames = (0..2)
            .map(|_| horizontal_filament_frame(40, 40, 20, 10, 30, 0.0))
            .collect();
        let bundle = FrameBundle::new(frames).unwrap();
        let mut config = TrackerConfig::default();
        config.evolution.max_iter = 10;
        config.relocation.small_window = 3;
        config.relocation.large_window = 8;
        let result = FilamentTracker::new(&bundle, &config)
            .track(&[[10.0, 20.0], [30.0, 20.0]])
            .unwrap();

        let dir = scratch("archive");
        let path = write_track_archive(&dir, "cell/1", &result).unwrap();
        assert_eq!(path.file_name().unwrap(), "cell_1.json");
        let archive = read_track_archive(&path).unwrap();
        assert!(archive.complete);
        assert_eq!(archive.frames.len(), 2);
        assert_eq!(archive.frames[0].frame, 1);
        for (a, b) in archive.frames[1].points.iter().zip(&result.frames[1].contour) {
            assert!((a[0] - b[0]).abs() < 1e-9 && (a[1] - b[1]).abs() < 1e-9);
        }

        let tables = write_frame_tables(&dir, "cell/1", &result).unwrap();
        assert_eq!(tables, dir.join("cell_1"));
        assert!(!tables.join("00003.csv").exists());
        for (i, frame) in result.frames.iter().enumerate() {
            let rows = read_seed_csv(&tables.join(format!("{:05}.csv", i + 1))).unwrap();
            assert_eq!(rows.len(), frame.contour.len());
            for (a, b) in rows.iter().zip(&frame.contour) {
                assert!((a[0] - b[0]).abs() < 1e-9 && (a[1] - b[1]).abs() < 1e-9);
            }
        }
        fs::remove_dir_all(&dir).unwrap();
    }
}
