//! Candidate spot detection.
//!
//! Finds local intensity maxima that stand out from a noise-adaptive
//! threshold:
//! 1. Estimate per-pixel background and noise ([`BackgroundMap`])
//! 2. Score each pixel by its background-subtracted 3×3 box mean
//! 3. Keep local maxima of the score above `k × noise / 3`, where the noise
//!    is never taken below the shot noise of the local background
//! 4. Non-maximum suppression within `min_separation_px`
//! 5. Discard candidates whose fitting window leaves the frame

pub mod background;


pub use background::BackgroundMap;

use crate::config::{CameraConfig, Config};
use crate::frame::Frame;

/// Standard deviation of a 3×3 mean relative to the per-pixel noise.
const BOX_MEAN_NOISE_FACTOR: f32 = 1.0 / 3.0;

/// A detected spot awaiting a fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// Index of the source frame.
    pub frame: usize,
    /// Peak column.
    pub x: usize,
    /// Peak row.
    pub y: usize,
    /// Half-width of the fitting window; the window is `2r+1` pixels wide.
    pub window_radius: usize,
    /// Background-subtracted 3×3 mean at the peak.
    pub strength: f32,
}

impl Candidate {
    /// Side length of the fitting window.
    #[inline]
    pub fn window_size(&self) -> usize {
        2 * self.window_radius + 1
    }
}

/// Candidates of one frame, strongest first. The whole frame is processed up
/// front, so the iterator knows its length.
pub type Candidates = std::vec::IntoIter<Candidate>;

/// Spot detector configured once and applied to many frames.
#[derive(Debug, Clone)]
pub struct SpotDetector {
    threshold_multiplier: f32,
    min_separation: f64,
    window_radius: usize,
    tile_size: usize,
    camera: CameraConfig,
}

impl SpotDetector {
    pub fn new(config: &Config) -> Self {
        Self {
            threshold_multiplier: config.detection_threshold_multiplier,
            min_separation: config.min_separation_px,
            window_radius: config.window_radius_px,
            tile_size: config.background_tile_size,
            camera: config.camera,
        }
    }

    /// Detect candidates in `frame` and iterate them, strongest first.
    pub fn detect(&self, frame: &Frame) -> Candidates {
        self.detect_all(frame).into_iter()
    }

    /// Detect candidates in `frame`, strongest first.
    pub fn detect_all(&self, frame: &Frame) -> Vec<Candidate> {
        let width = frame.width();
        let height = frame.height();
        if width < 3 || height < 3 {
            return Vec::new();
        }

        let background = BackgroundMap::estimate(frame, self.tile_size);
        let score = box_mean_score(frame, &background);
        let maxima = self.find_local_maxima(&score, &background, width, height);
        let kept = suppress_non_maxima(maxima, self.min_separation);

        let r = self.window_radius;
        let candidates: Vec<Candidate> = kept
            .into_iter()
            .filter(|peak| {
                peak.x >= r && peak.y >= r && peak.x + r < width && peak.y + r < height
            })
            .map(|peak| Candidate {
                frame: frame.index(),
                x: peak.x,
                y: peak.y,
                window_radius: r,
                strength: peak.score,
            })
            .collect();

        tracing::trace!(
            frame = frame.index(),
            candidates = candidates.len(),
            "spot detection done"
        );
        candidates
    }

    fn find_local_maxima(
        &self,
        score: &[f32],
        background: &BackgroundMap,
        width: usize,
        height: usize,
    ) -> Vec<Peak> {
        let mut maxima = Vec::new();

        // The 3×3 score is undefined on the outermost ring.
        for y in 1..height - 1 {
            for x in 1..width - 1 {
                let idx = y * width + x;
                let value = score[idx];
                if value <= 0.0 {
                    continue;
                }
                let noise = background.noise[idx]
                    .max(self.shot_noise(background.background[idx]));
                let threshold = self.threshold_multiplier * noise * BOX_MEAN_NOISE_FACTOR;
                if value <= threshold {
                    continue;
                }
                if is_local_maximum(score, width, height, x, y) {
                    maxima.push(Peak { x, y, score: value });
                }
            }
        }

        maxima
    }

    /// Poisson noise of a background level, in the frame's units.
    #[inline]
    fn shot_noise(&self, background: f32) -> f32 {
        let photons_per_adu =
            self.camera.sensitivity / (self.camera.gain * self.camera.quantum_efficiency);
        self.camera.to_photons(background).sqrt() / photons_per_adu
    }
}

#[derive(Debug, Clone, Copy)]
struct Peak {
    x: usize,
    y: usize,
    score: f32,
}

/// Background-subtracted 3×3 box mean. The outermost ring is left at zero.
fn box_mean_score(frame: &Frame, background: &BackgroundMap) -> Vec<f32> {
    let width = frame.width();
    let height = frame.height();
    let pixels = frame.pixels();
    let mut score = vec![0.0f32; width * height];

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let mut sum = 0.0f32;
            for row in (y - 1)..=(y + 1) {
                let start = row * width + x - 1;
                sum += pixels[start] + pixels[start + 1] + pixels[start + 2];
            }
            let idx = y * width + x;
            score[idx] = sum / 9.0 - background.background[idx];
        }
    }

    score
}

/// Plateaus resolve to the first pixel in raster order: a neighbor earlier in
/// raster order must be strictly lower, a later one lower or equal.
#[inline]
fn is_local_maximum(score: &[f32], width: usize, height: usize, x: usize, y: usize) -> bool {
    let center = score[y * width + x];
    for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
        for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
            if nx == x && ny == y {
                continue;
            }
            let neighbor = score[ny * width + nx];
            let earlier = (ny, nx) < (y, x);
            if neighbor > center || (earlier && neighbor == center) {
                return false;
            }
        }
    }
    true
}

/// Greedy non-maximum suppression: strongest first, ties in raster order.
fn suppress_non_maxima(mut maxima: Vec<Peak>, min_separation: f64) -> Vec<Peak> {
    maxima.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| (a.y, a.x).cmp(&(b.y, b.x)))
    });

    let min_sep_sq = min_separation * min_separation;
    let mut kept: Vec<Peak> = Vec::with_capacity(maxima.len());
    for peak in maxima {
        let suppressed = kept.iter().any(|k| {
            let dx = k.x as f64 - peak.x as f64;
            let dy = k.y as f64 - peak.y as f64;
            dx * dx + dy * dy < min_sep_sq
        });
        if !suppressed {
            kept.push(peak);
        }
    }
    kept
}
