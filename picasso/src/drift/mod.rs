//! Drift estimation and correction.
//!
//! A drift trajectory is one displacement per frame. It is estimated from the
//! raw localizations, then gaps are filled, the trajectory is smoothed and
//! finally shifted so the first frame has zero drift. Correction subtracts the
//! drift of each localization's frame and returns new records.

mod cross_correlation;


use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::config::{Config, DriftMethod};
use crate::linker::Track;
use crate::localization::Localization;
use crate::math::median_f64_mut;

/// Largest per-frame change (pixels) at which track-centroid refinement stops.
const REFINEMENT_TOLERANCE: f64 = 1e-4;

/// Per-frame sample displacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftTrajectory {
    shifts: Vec<DVec2>,
    /// Frames without enough data whose value was interpolated.
    interpolated_frames: usize,
}

impl DriftTrajectory {
    /// All-zero trajectory over `frame_count` frames.
    pub fn zero(frame_count: usize) -> Self {
        Self {
            shifts: vec![DVec2::ZERO; frame_count],
            interpolated_frames: 0,
        }
    }

    /// Trajectory from explicit per-frame shifts.
    pub fn from_shifts(shifts: Vec<DVec2>) -> Self {
        Self {
            shifts,
            interpolated_frames: 0,
        }
    }

    /// Drift at `frame`; zero outside the trajectory.
    #[inline]
    pub fn at(&self, frame: usize) -> DVec2 {
        self.shifts.get(frame).copied().unwrap_or(DVec2::ZERO)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.shifts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.shifts.is_empty()
    }

    pub fn shifts(&self) -> &[DVec2] {
        &self.shifts
    }

    pub fn interpolated_frames(&self) -> usize {
        self.interpolated_frames
    }

    /// Drift-corrected copies of `localizations`. The input is left untouched.
    pub fn apply(&self, localizations: &[Localization]) -> Vec<Localization> {
        localizations
            .iter()
            .map(|loc| {
                let d = self.at(loc.frame);
                loc.shifted(d.x as f32, d.y as f32)
            })
            .collect()
    }
}

/// Raw per-frame estimates before gap filling and smoothing.
#[derive(Debug)]
struct RawDrift {
    /// `None` where the frame has no estimate of its own.
    shifts: Vec<Option<DVec2>>,
    /// Frames left without an estimate because of too few localizations.
    insufficient: usize,
}

/// Estimate the drift over `frame_count` frames.
///
/// `tracks` index into `localizations`; they are only used by the
/// track-centroid method.
pub fn estimate_drift(
    localizations: &[Localization],
    tracks: &[Track],
    frame_count: usize,
    config: &Config,
) -> DriftTrajectory {
    let trajectory = match config.drift_method {
        DriftMethod::None => DriftTrajectory::zero(frame_count),
        DriftMethod::TrackCentroid => track_centroid(localizations, tracks, frame_count, config),
        DriftMethod::CrossCorrelation {
            segment_frames,
            oversampling,
        } => {
            let raw = cross_correlation::segment_drift(
                localizations,
                frame_count,
                segment_frames,
                oversampling,
                config.drift_min_localizations,
            );
            finalize(raw, config.drift_smoothing_window)
        }
    };

    let interpolated = trajectory.interpolated_frames;
    if interpolated > 0 && interpolated == trajectory.len() {
        tracing::warn!(
            frames = interpolated,
            "no frame has enough localizations for drift estimation, drift set to zero"
        );
    } else if interpolated > 0 {
        tracing::warn!(
            frames = interpolated,
            "too few localizations for drift estimation, values interpolated"
        );
    }

    tracing::debug!(
        method = ?config.drift_method,
        frames = trajectory.len(),
        interpolated,
        "drift estimated"
    );
    trajectory
}

/// Drift from tracked emitters.
///
/// The first pass chains the displacements between consecutive members of each
/// track, so tracks much shorter than the acquisition still constrain the slow
/// drift. Later passes refine against track centroids computed from corrected
/// positions, until the trajectory stops changing.
fn track_centroid(
    localizations: &[Localization],
    tracks: &[Track],
    frame_count: usize,
    config: &Config,
) -> DriftTrajectory {
    let members: Vec<Vec<(usize, DVec2)>> = tracks
        .iter()
        .map(|track| {
            track
                .localizations(localizations)
                .filter(|loc| loc.frame < frame_count)
                .map(|loc| (loc.frame, DVec2::new(loc.x as f64, loc.y as f64)))
                .collect::<Vec<_>>()
        })
        .filter(|positions| positions.len() >= 2)
        .collect();

    let min_localizations = config.drift_min_localizations;
    let mut trajectory = finalize(
        chained_displacements(&members, frame_count, min_localizations),
        config.drift_smoothing_window,
    );

    for pass in 1..config.drift_iterations {
        let refined = finalize(
            centroid_residuals(&members, &trajectory, frame_count, min_localizations),
            config.drift_smoothing_window,
        );
        let change = refined
            .shifts
            .iter()
            .zip(trajectory.shifts.iter())
            .map(|(a, b)| a.distance(*b))
            .fold(0.0f64, f64::max);
        trajectory = refined;

        if change < REFINEMENT_TOLERANCE {
            tracing::trace!(passes = pass + 1, "drift refinement converged");
            break;
        }
    }

    trajectory
}

/// Drift summed from the median per-frame step of all tracks. A member pair
/// that spans a gap spreads its displacement evenly over the frames in
/// between. Outside the frames covered by any pair the drift is held constant.
fn chained_displacements(
    members: &[Vec<(usize, DVec2)>],
    frame_count: usize,
    min_localizations: usize,
) -> RawDrift {
    let mut steps_per_frame: Vec<Vec<DVec2>> = vec![Vec::new(); frame_count];
    let mut observed = vec![0usize; frame_count];

    for track in members {
        for &(frame, _) in track {
            observed[frame] += 1;
        }
        for pair in track.windows(2) {
            let (from, p_from) = pair[0];
            let (to, p_to) = pair[1];
            let step = (p_to - p_from) / (to - from) as f64;
            for steps in &mut steps_per_frame[from + 1..=to] {
                steps.push(step);
            }
        }
    }

    let mut scratch = Vec::new();
    let known_steps: Vec<(usize, DVec2)> = (1..frame_count)
        .filter(|&frame| !steps_per_frame[frame].is_empty())
        .map(|frame| (frame, median_point(&steps_per_frame[frame], &mut scratch)))
        .collect();
    let (Some(&(first, _)), Some(&(last, _))) = (known_steps.first(), known_steps.last()) else {
        return RawDrift {
            shifts: vec![None; frame_count],
            insufficient: frame_count,
        };
    };

    let mut steps = fill_gaps(&known_steps, frame_count);
    steps[..first].fill(DVec2::ZERO);
    steps[last + 1..].fill(DVec2::ZERO);

    let mut position = DVec2::ZERO;
    let shifts = steps
        .iter()
        .map(|&step| {
            position += step;
            Some(position)
        })
        .collect();

    RawDrift {
        shifts,
        insufficient: count_insufficient(&observed, min_localizations),
    }
}

/// Median displacement of track members from their track centroid, with the
/// centroids taken from positions corrected by `trajectory`.
fn centroid_residuals(
    members: &[Vec<(usize, DVec2)>],
    trajectory: &DriftTrajectory,
    frame_count: usize,
    min_localizations: usize,
) -> RawDrift {
    let mut residuals: Vec<Vec<DVec2>> = vec![Vec::new(); frame_count];

    for track in members {
        let centroid = track
            .iter()
            .map(|&(frame, p)| p - trajectory.at(frame))
            .sum::<DVec2>()
            / track.len() as f64;

        for &(frame, p) in track {
            residuals[frame].push(p - centroid);
        }
    }

    let counts: Vec<usize> = residuals.iter().map(Vec::len).collect();
    let mut scratch = Vec::new();
    let shifts = residuals
        .iter()
        .map(|frame_residuals| {
            let count = frame_residuals.len();
            (count >= min_localizations && count > 0)
                .then(|| median_point(frame_residuals, &mut scratch))
        })
        .collect();

    RawDrift {
        shifts,
        insufficient: count_insufficient(&counts, min_localizations),
    }
}

/// Componentwise median, robust to the occasional link between two emitters.
fn median_point(points: &[DVec2], scratch: &mut Vec<f64>) -> DVec2 {
    scratch.clear();
    scratch.extend(points.iter().map(|p| p.x));
    let x = median_f64_mut(scratch);
    scratch.clear();
    scratch.extend(points.iter().map(|p| p.y));
    let y = median_f64_mut(scratch);
    DVec2::new(x, y)
}

#[inline]
fn count_insufficient(counts: &[usize], min_localizations: usize) -> usize {
    counts
        .iter()
        .filter(|&&count| count < min_localizations || count == 0)
        .count()
}

/// Fill gaps, smooth and reference the trajectory to frame 0.
fn finalize(raw: RawDrift, smoothing_window: usize) -> DriftTrajectory {
    let frame_count = raw.shifts.len();
    let known: Vec<(usize, DVec2)> = raw
        .shifts
        .iter()
        .enumerate()
        .filter_map(|(frame, shift)| shift.map(|s| (frame, s)))
        .collect();

    if known.is_empty() {
        return DriftTrajectory {
            shifts: vec![DVec2::ZERO; frame_count],
            interpolated_frames: raw.insufficient,
        };
    }

    let filled = fill_gaps(&known, frame_count);
    let mut shifts = smooth(&filled, smoothing_window);
    let origin = shifts[0];
    for s in &mut shifts {
        *s -= origin;
    }

    DriftTrajectory {
        shifts,
        interpolated_frames: raw.insufficient,
    }
}

/// Linear interpolation between known frames; nearest known value at the ends.
fn fill_gaps(known: &[(usize, DVec2)], frame_count: usize) -> Vec<DVec2> {
    let mut out = vec![DVec2::ZERO; frame_count];
    let (first_frame, first) = known[0];
    let (last_frame, last) = known[known.len() - 1];

    out[..=first_frame].fill(first);
    out[last_frame..].fill(last);

    for pair in known.windows(2) {
        let (a, va) = pair[0];
        let (b, vb) = pair[1];
        for (offset, slot) in out[a..=b].iter_mut().enumerate() {
            let t = offset as f64 / (b - a) as f64;
            *slot = va.lerp(vb, t);
        }
    }

    out
}

/// Centered moving average. Near the ends the window shrinks symmetrically,
/// which keeps linear trends unbiased.
fn smooth(values: &[DVec2], window: usize) -> Vec<DVec2> {
    let half = window / 2;
    if half == 0 {
        return values.to_vec();
    }

    let n = values.len();
    (0..n)
        .map(|i| {
            let h = half.min(i).min(n - 1 - i);
            let slice = &values[i - h..=i + h];
            slice.iter().copied().sum::<DVec2>() / slice.len() as f64
        })
        .collect()
}
