//! Batch execution of independent filament tasks.
//!
//! Every task reads the same [`FrameBundle`] through an `Arc`; nothing in
//! the bundle is copied per worker. The output directory is the only shared
//! mutable resource and writes into it are serialized by a lock. A task that
//! fails or panics is recorded in the report and never stops its siblings.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;

use crate::bundle::FrameBundle;
use crate::config::TrackerConfig;
use crate::error::{Result, TrackError};
use crate::io::{write_frame_tables, write_track_archive};
use crate::track::{FilamentTracker, TrackResult, TrackState};

/// One filament to track.
#[derive(Debug, Clone)]
pub struct FilamentTask {
    pub index: usize,
    pub name: String,
    pub seed: Vec<[f64; 2]>,
}

impl FilamentTask {
    /// Number named seeds in iteration order.
    pub fn from_seeds<I>(seeds: I) -> Vec<Self>
    where
        I: IntoIterator<Item = (String, Vec<[f64; 2]>)>,
    {
        seeds
            .into_iter()
            .enumerate()
            .map(|(index, (name, seed))| Self { index, name, seed })
            .collect()
    }
}

/// Output directory with an optional write lock.
#[derive(Debug)]
pub struct OutputDir {
    path: PathBuf,
    lock: Option<Mutex<()>>,
}

impl OutputDir {
    /// Directory shared by concurrent tasks.
    pub fn locked(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Some(Mutex::new(())),
        }
    }

    /// Directory written from a single thread only.
    pub fn unlocked(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `write` while holding the lock, if there is one.
    pub fn with_lock<R>(&self, write: impl FnOnce(&Path) -> Result<R>) -> Result<R> {
        let _guard = self.lock.as_ref().map(|m| m.lock());
        write(&self.path)
    }
}

/// Immutable state handed to every task.
#[derive(Debug)]
pub struct TaskContext {
    pub bundle: Arc<FrameBundle>,
    pub config: TrackerConfig,
    /// Where finished tracks are persisted.
    pub output: Option<OutputDir>,
    /// Keep each completed [`TrackResult`] in the report. Off by default:
    /// per-iteration trajectories grow with `max_iter` and frame count.
    pub keep_results: bool,
}

impl TaskContext {
    /// Context for `config.parallel`, locking the output only when tasks run concurrently.
    pub fn new(bundle: Arc<FrameBundle>, config: TrackerConfig, output: Option<PathBuf>) -> Self {
        let output = output.map(|p| {
            if config.parallel.enabled {
                OutputDir::locked(p)
            } else {
                OutputDir::unlocked(p)
            }
        });
        Self {
            bundle,
            config,
            output,
            keep_results: false,
        }
    }

    /// Retain completed results in [`CompletedFilament::result`].
    pub fn with_results(mut self) -> Self {
        self.keep_results = true;
        self
    }
}

/// A filament tracked through every frame.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedFilament {
    pub index: usize,
    pub name: String,
    pub n_points: usize,
    pub n_frames: usize,
    pub elapsed_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<PathBuf>,
    /// Set only when the context asked for [`TaskContext::keep_results`].
    #[serde(skip)]
    pub result: Option<TrackResult>,
}

/// A filament that failed, possibly after some frames were tracked.
#[derive(Debug, Clone, Serialize)]
pub struct FailedFilament {
    pub index: usize,
    pub name: String,
    pub kind: String,
    pub reason: String,
    /// Frames tracked (and persisted) before the failure.
    pub frames_retained: usize,
}

/// Best-effort outcome of a batch, both lists ordered by task index.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub completed: Vec<CompletedFilament>,
    pub failed: Vec<FailedFilament>,
}

impl BatchReport {
    pub fn is_failed(&self, index: usize) -> bool {
        self.failed.iter().any(|f| f.index == index)
    }

    pub fn completed(&self, index: usize) -> Option<&CompletedFilament> {
        self.completed.iter().find(|c| c.index == index)
    }
}

enum TaskOutcome {
    Completed(CompletedFilament),
    Failed(FailedFilament),
}

/// Default task: track the seed against the shared bundle.
pub fn track_task(task: &FilamentTask, ctx: &TaskContext) -> Result<TrackResult> {
    FilamentTracker::new(&ctx.bundle, &ctx.config).track(&task.seed)
}

/// Track and persist every task.
pub fn run_batch(tasks: &[FilamentTask], ctx: &TaskContext) -> Result<BatchReport> {
    run_batch_with(tasks, ctx, track_task)
}

/// Run `task_fn` for every task, in parallel when `ctx.config.parallel.enabled`.
///
/// Only driver setup (output directory, worker pool) can fail; per-task
/// errors and panics end up in [`BatchReport::failed`].
pub fn run_batch_with<F>(tasks: &[FilamentTask], ctx: &TaskContext, task_fn: F) -> Result<BatchReport>
where
    F: Fn(&FilamentTask, &TaskContext) -> Result<TrackResult> + Sync,
{
    if let Some(out) = &ctx.output {
        std::fs::create_dir_all(out.path())?;
    }

    let started = Instant::now();
    let outcomes: Vec<TaskOutcome> = if ctx.config.parallel.enabled {
        let workers = ctx.config.parallel.worker_count();
        tracing::info!("tracking {} filaments on {} workers", tasks.len(), workers);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("filatrack-worker-{}", i))
            .build()
            .map_err(|e| TrackError::WorkerTaskFailure(format!("worker pool: {}", e)))?;
        pool.install(|| tasks.par_iter().map(|t| run_one(t, ctx, &task_fn)).collect())
    } else {
        tracing::info!("tracking {} filaments sequentially", tasks.len());
        tasks.iter().map(|t| run_one(t, ctx, &task_fn)).collect()
    };

    let mut report = BatchReport::default();
    for outcome in outcomes {
        match outcome {
            TaskOutcome::Completed(c) => report.completed.push(c),
            TaskOutcome::Failed(f) => report.failed.push(f),
        }
    }
    report.completed.sort_by_key(|c| c.index);
    report.failed.sort_by_key(|f| f.index);
    tracing::info!(
        "batch finished in {:.2}s: {} completed, {} failed",
        started.elapsed().as_secs_f64(),
        report.completed.len(),
        report.failed.len()
    );
    Ok(report)
}

fn run_one<F>(task: &FilamentTask, ctx: &TaskContext, task_fn: &F) -> TaskOutcome
where
    F: Fn(&FilamentTask, &TaskContext) -> Result<TrackResult>,
{
    let tick = Instant::now();
    tracing::info!("[{}] {} started", task.index, task.name);

    let tracked = panic::catch_unwind(AssertUnwindSafe(|| task_fn(task, ctx)))
        .unwrap_or_else(|payload| Err(TrackError::WorkerTaskFailure(panic_message(payload.as_ref()))));

    let result = match tracked {
        Ok(r) => r,
        Err(e) => return failure(task, &e, 0),
    };

    let archive = match &ctx.output {
        Some(out) => match out.with_lock(|dir| {
            write_frame_tables(dir, &task.name, &result)?;
            write_track_archive(dir, &task.name, &result)
        }) {
            Ok(path) => Some(path),
            Err(e) => return failure(task, &e, 0),
        },
        None => None,
    };

    let elapsed = tick.elapsed().as_secs_f64();
    match &result.state {
        TrackState::Done => {
            tracing::info!(
                "[{}] {} done: {} frames in {:.2}s",
                task.index,
                task.name,
                result.frames.len(),
                elapsed
            );
            TaskOutcome::Completed(CompletedFilament {
                index: task.index,
                name: task.name.clone(),
                n_points: result.n_points(),
                n_frames: result.frames.len(),
                elapsed_secs: elapsed,
                archive,
                result: ctx.keep_results.then_some(result),
            })
        }
        TrackState::Failed { kind, reason, .. } => {
            tracing::warn!(
                "[{}] {} stopped after {} frames: {}",
                task.index,
                task.name,
                result.frames.len(),
                reason
            );
            TaskOutcome::Failed(FailedFilament {
                index: task.index,
                name: task.name.clone(),
                kind: kind.clone(),
                reason: reason.clone(),
                frames_retained: result.frames.len(),
            })
        }
    }
}

fn failure(task: &FilamentTask, e: &TrackError, frames_retained: usize) -> TaskOutcome {
    tracing::warn!("[{}] {} skipped: {}", task.index, task.name, e);
    TaskOutcome::Failed(FailedFilament {
        index: task.index,
        name: task.name.clone(),
        kind: e.kind().to_string(),
        reason: e.to_string(),
        frames_retained,
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::read_track_archive;
    use crate::test_utils::horizontal_filament_frame;

    fn small_bundle() -> Arc<FrameBundle> {
        let frames = (0..3)
            .map(|_| horizontal_filament_frame(64, 64, 32, 8, 56, 0.0))
            .collect();
        Arc::new(FrameBundle::new(frames).unwrap())
    }

    fn fast_config(parallel: bool) -> TrackerConfig {
        let mut config = TrackerConfig::default();
        config.evolution.max_iter = 30;
        config.relocation.small_window = 3;
        config.relocation.large_window = 8;
        config.parallel.enabled = parallel;
        config.parallel.workers = Some(3);
        config
    }

    fn five_tasks() -> Vec<FilamentTask> {
        let seeds = (0..5).map(|i| {
            let x0 = 10.0 + 4.0 * i as f64;
            (format!("f{}", i + 1), vec![[x0, 32.0], [x0 + 20.0, 32.0]])
        });
        FilamentTask::from_seeds(seeds)
    }

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("filatrack-par-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn contour_of(report: &BatchReport, index: usize) -> Vec<[f64; 2]> {
        let done = report.completed(index).unwrap();
        let result = done.result.as_ref().unwrap();
        result.frames.last().unwrap().contour.clone()
    }

    #[test]
    fn failing_task_does_not_affect_siblings() {
        let tasks = five_tasks();
        let baseline_ctx = TaskContext::new(small_bundle(), fast_config(false), None).with_results();
        let baseline = run_batch(&tasks, &baseline_ctx).unwrap();
        assert_eq!(baseline.completed.len(), 5);

        let dir = scratch("isolation");
        let ctx = TaskContext::new(small_bundle(), fast_config(true), Some(dir.clone())).with_results();
        let report = run_batch_with(&tasks, &ctx, |task, ctx| {
            if task.index == 2 {
                return Err(TrackError::NumericalDivergence { stage: "forced" });
            }
            track_task(task, ctx)
        })
        .unwrap();

        assert_eq!(
            report.completed.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![0, 1, 3, 4]
        );
        assert!(report.is_failed(2));
        assert_eq!(report.failed[0].name, "f3");
        assert_eq!(report.failed[0].kind, "numerical_divergence");
        for i in [0, 1, 3, 4] {
            assert_eq!(contour_of(&report, i), contour_of(&baseline, i));
            let archive = read_track_archive(&dir.join(format!("f{}.json", i + 1))).unwrap();
            assert!(archive.complete);
            assert_eq!(archive.frames.len(), 3);
        }
        assert!(!dir.join("f3.json").exists());
        assert!(!dir.join("f3").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn completed_results_are_dropped_unless_requested() {
        let tasks = five_tasks();
        let dir = scratch("retention");
        let ctx = TaskContext::new(small_bundle(), fast_config(true), Some(dir.clone()));
        assert!(!ctx.keep_results);
        let report = run_batch(&tasks, &ctx).unwrap();

        assert_eq!(report.completed.len(), 5);
        for done in &report.completed {
            assert!(done.result.is_none());
            assert_eq!(done.n_frames, 3);
            assert!(done.archive.as_ref().is_some_and(|p| p.is_file()));
            for frame in 1..=3 {
                assert!(dir.join(&done.name).join(format!("{:05}.csv", frame)).is_file());
            }
        }
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn panicking_task_is_reported_as_worker_failure() {
        let tasks = five_tasks();
        for parallel in [true, false] {
            let ctx = TaskContext::new(small_bundle(), fast_config(parallel), None);
            let report = run_batch_with(&tasks, &ctx, |task, ctx| {
                if task.index == 2 {
                    panic!("boom in {}", task.name);
                }
                track_task(task, ctx)
            })
            .unwrap();
            assert_eq!(report.completed.len(), 4);
            assert_eq!(report.failed.len(), 1);
            let f = &report.failed[0];
            assert_eq!(f.index, 2);
            assert_eq!(f.kind, "worker_task_failure");
            assert!(f.reason.contains("boom in f3"), "{}", f.reason);
        }
    }

    #[test]
    fn partial_track_is_persisted_and_marked_failed() {
        let good = horizontal_filament_frame(64, 64, 32, 8, 56, 0.0);
        let mut empty = good.clone();
        empty.skeleton = image::GrayImage::new(64, 64);
        let bundle = Arc::new(FrameBundle::new(vec![good.clone(), good, empty]).unwrap());

        let dir = scratch("partial");
        let ctx = TaskContext::new(bundle, fast_config(false), Some(dir.clone()));
        assert!(ctx.output.as_ref().is_some_and(|o| o.lock.is_none()));
        let tasks = FilamentTask::from_seeds([("only".to_string(), vec![[10.0, 32.0], [40.0, 32.0]])]);
        let report = run_batch(&tasks, &ctx).unwrap();

        assert!(report.completed.is_empty());
        assert_eq!(report.failed[0].frames_retained, 2);
        assert_eq!(report.failed[0].kind, "no_skeleton_in_window");
        let archive = read_track_archive(&dir.join("only.json")).unwrap();
        assert!(!archive.complete);
        assert_eq!(archive.frames.len(), 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn bad_seed_is_skipped_not_fatal() {
        let mut tasks = five_tasks();
        tasks[4].seed = vec![[1.0, 1.0]];
        let ctx = TaskContext::new(small_bundle(), fast_config(true), None);
        let report = run_batch(&tasks, &ctx).unwrap();
        assert_eq!(report.completed.len(), 4);
        assert_eq!(report.failed[0].index, 4);
        assert_eq!(report.failed[0].kind, "missing_upstream_data");
    }
}
