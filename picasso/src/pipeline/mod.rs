//! End-to-end localization run.
//!
//! Frames are loaded sequentially in batches. Each batch is detected and fit
//! in parallel, then fed to the linker in frame order on the driver thread.
//! After the last batch (or cancellation) the drift is estimated from the raw
//! localizations and applied.


use std::ops::Range;
use std::sync::Arc;

use common::CancelToken;
use rayon::prelude::*;

use crate::config::Config;
use crate::detection::SpotDetector;
use crate::drift::{DriftTrajectory, estimate_drift};
use crate::error::{ConfigError, Error, InputError};
use crate::fit::{FrameFit, Fitter, RejectionCounts};
use crate::frame::{Frame, FrameSource};
use crate::linker::{Linker, Track};
use crate::localization::Localization;

/// Progress after a batch of frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunProgress {
    pub frames_done: usize,
    pub frames_total: usize,
    /// Localizations produced so far.
    pub localizations: usize,
    /// Candidates rejected so far.
    pub rejected: usize,
}

/// Callback type for progress reporting.
pub type ProgressCallback = Arc<dyn Fn(RunProgress) + Send + Sync>;

/// Counters of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub frames_total: usize,
    pub frames_processed: usize,
    pub candidates_found: usize,
    pub candidates_fit: usize,
    pub candidates_rejected: usize,
    pub rejections: RejectionCounts,
    pub tracks_formed: usize,
    pub drift_interpolated_frames: usize,
    /// The run stopped early; only `frames_processed` frames contributed.
    pub cancelled: bool,
}

/// Output of a run.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Drift-corrected localizations in frame order.
    pub localizations: Vec<Localization>,
    /// Localizations as fitted, same order and indexing as `localizations`.
    pub raw_localizations: Vec<Localization>,
    /// Tracks indexing into either localization list, aggregated over the
    /// corrected positions.
    pub tracks: Vec<Track>,
    pub drift: DriftTrajectory,
    pub stats: RunStats,
}

/// Configured localization pipeline.
pub struct Pipeline {
    config: Config,
    cancel: CancelToken,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl Pipeline {
    /// Validates `config`; an invalid configuration never reaches a frame.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancelToken::new(),
            progress: None,
        })
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Process every frame of `source`.
    ///
    /// Cancellation is checked before each batch. A cancelled run still links
    /// and drift-corrects the frames processed so far.
    pub fn run<S: FrameSource + ?Sized>(&self, source: &S) -> Result<RunResult, Error> {
        let config = &self.config;
        let frame_count = source.frame_count();
        let batch_size = config.effective_frames_per_batch().max(1);

        let detector = SpotDetector::new(config);
        let fitter = Fitter::new(config);
        let mut linker = Linker::new(config);

        let mut raw: Vec<Localization> = Vec::new();
        let mut stats = RunStats {
            frames_total: frame_count,
            ..Default::default()
        };
        let mut dimensions: Option<(usize, usize)> = None;

        tracing::info!(frames = frame_count, batch_size, "localization run started");

        let mut start = 0;
        while start < frame_count {
            if self.cancel.is_cancelled() {
                stats.cancelled = true;
                tracing::info!(frames_processed = start, "localization run cancelled");
                break;
            }
            let end = (start + batch_size).min(frame_count);
            let frames = load_batch(source, start..end, &mut dimensions)?;

            let results: Vec<(usize, FrameFit)> = frames
                .par_iter()
                .map(|frame| {
                    let candidates = detector.detect_all(frame);
                    let fit = fitter.fit_all(frame, &candidates);
                    (candidates.len(), fit)
                })
                .collect();

            for (frame, (found, fit)) in frames.iter().zip(results) {
                stats.candidates_found += found;
                stats.candidates_fit += fit.localizations.len();
                stats.rejections.merge(&fit.rejections);

                let first = raw.len();
                raw.extend(fit.localizations);
                linker.push_frame(
                    frame.index(),
                    raw[first..]
                        .iter()
                        .enumerate()
                        .map(|(i, loc)| (first + i, loc)),
                );
                stats.frames_processed += 1;
            }

            tracing::debug!(
                first_frame = start,
                last_frame = end - 1,
                localizations = raw.len(),
                "batch processed"
            );
            self.report(RunProgress {
                frames_done: end,
                frames_total: frame_count,
                localizations: raw.len(),
                rejected: stats.rejections.total(),
            });
            start = end;
        }

        stats.candidates_rejected = stats.rejections.total();

        let tracks = linker.finish(&raw);
        let drift = estimate_drift(&raw, &tracks, stats.frames_processed, config);
        let localizations = drift.apply(&raw);
        let tracks: Vec<Track> = tracks
            .iter()
            .map(|track| track.reaggregate(&localizations))
            .collect();

        stats.tracks_formed = tracks.len();
        stats.drift_interpolated_frames = drift.interpolated_frames();
        log_summary(&stats);

        Ok(RunResult {
            localizations,
            raw_localizations: raw,
            tracks,
            drift,
            stats,
        })
    }

    fn report(&self, progress: RunProgress) {
        if let Some(callback) = &self.progress {
            callback(progress);
        }
    }
}

/// Run the full pipeline on `source` with `config`.
pub fn run<S: FrameSource + ?Sized>(source: &S, config: &Config) -> Result<RunResult, Error> {
    Pipeline::new(config.clone())?.run(source)
}

/// Load and validate frames `range`. All frames must match the first frame's
/// dimensions and carry their own index.
fn load_batch<S: FrameSource + ?Sized>(
    source: &S,
    range: Range<usize>,
    dimensions: &mut Option<(usize, usize)>,
) -> Result<Vec<Frame>, InputError> {
    let mut frames = Vec::with_capacity(range.len());
    for index in range {
        let frame = source.get_frame(index)?;
        if frame.index() != index {
            return Err(InputError::MalformedFrame {
                index,
                reason: format!("source returned frame {} for index {index}", frame.index()),
            });
        }
        frame.check_well_formed()?;

        let dims = (frame.width(), frame.height());
        match *dimensions {
            None => *dimensions = Some(dims),
            Some(expected) if expected != dims => {
                return Err(InputError::MalformedFrame {
                    index,
                    reason: format!(
                        "dimensions {}x{} differ from {}x{}",
                        dims.0, dims.1, expected.0, expected.1
                    ),
                });
            }
            Some(_) => {}
        }

        frames.push(frame);
    }
    Ok(frames)
}

fn log_summary(stats: &RunStats) {
    tracing::info!(
        frames_total = stats.frames_total,
        frames_processed = stats.frames_processed,
        candidates_found = stats.candidates_found,
        candidates_fit = stats.candidates_fit,
        candidates_rejected = stats.candidates_rejected,
        tracks_formed = stats.tracks_formed,
        drift_interpolated_frames = stats.drift_interpolated_frames,
        cancelled = stats.cancelled,
        "localization run finished"
    );
    for (reason, count) in stats.rejections.iter() {
        tracing::debug!(%reason, count, "fit rejections");
    }
}
