//! Drift from cross-correlation of localization density images.
//!
//! Localizations of consecutive frame segments are splatted into
//! super-resolved density images and each segment is correlated against the
//! reference segment with FFTs. The correlation peak, refined with a parabola,
//! gives the segment's shift, assigned to the segment's center frame.

use std::f64::consts::PI;
use std::sync::Arc;

use glam::DVec2;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner, num_complex::Complex};

use super::RawDrift;
use crate::localization::Localization;

/// Blur applied to the correlation surface (render pixels), which rounds the
/// peak for the parabolic refinement.
const CORRELATION_BLUR: f64 = 1.0;

/// Largest rendered field, in render pixels per side. Bounds the FFT grid at 2048².
const MAX_RENDER_SIZE: f64 = 1024.0;

/// Segments correlated concurrently. Each holds a few FFT-sized buffers.
const SEGMENTS_IN_FLIGHT: usize = 4;

/// Renders density images and correlates them on a square FFT grid.
struct DensityCorrelator {
    /// FFT size (power of two).
    size: usize,
    /// Camera-to-render scale.
    oversampling: f64,
    /// Camera position mapped to render pixel `margin`.
    origin: DVec2,
    margin: f64,
    forward_fft: Arc<dyn Fft<f32>>,
    inverse_fft: Arc<dyn Fft<f32>>,
    /// Separable Gaussian transfer function, one factor per frequency index.
    blur: Vec<f32>,
}

impl DensityCorrelator {
    fn new(localizations: &[Localization], oversampling: usize) -> Self {
        let (min, max) = localizations.iter().fold(
            (DVec2::splat(f64::INFINITY), DVec2::splat(f64::NEG_INFINITY)),
            |(min, max), loc| {
                let p = DVec2::new(loc.x as f64, loc.y as f64);
                (min.min(p), max.max(p))
            },
        );
        let extent = (max - min).max_element().max(1.0);
        let requested = oversampling as f64;
        let oversampling = requested.min(MAX_RENDER_SIZE / extent);
        if oversampling < requested {
            tracing::warn!(
                requested,
                effective = oversampling,
                field_px = extent,
                "field of view too large for drift oversampling, render scale reduced"
            );
        }

        // Padding keeps shifts up to a quarter of the field unambiguous.
        let content = (extent * oversampling).ceil() as usize + 2;
        let size = (content + content / 2).next_power_of_two();
        let margin = ((size - content) / 2) as f64;

        let mut planner = FftPlanner::new();
        let forward_fft = planner.plan_fft_forward(size);
        let inverse_fft = planner.plan_fft_inverse(size);

        let blur = (0..size)
            .map(|k| {
                let signed = if k <= size / 2 {
                    k as f64
                } else {
                    k as f64 - size as f64
                };
                let f = signed / size as f64;
                (-2.0 * PI * PI * CORRELATION_BLUR * CORRELATION_BLUR * f * f).exp() as f32
            })
            .collect();

        Self {
            size,
            oversampling,
            origin: min,
            margin,
            forward_fft,
            inverse_fft,
            blur,
        }
    }

    /// Bilinear splat of `localizations` into a density image.
    fn render<'a, I>(&self, localizations: I) -> Vec<f32>
    where
        I: IntoIterator<Item = &'a Localization>,
    {
        let n = self.size;
        let mut image = vec![0.0f32; n * n];
        for loc in localizations {
            let u = (loc.x as f64 - self.origin.x) * self.oversampling + self.margin;
            let v = (loc.y as f64 - self.origin.y) * self.oversampling + self.margin;
            if u < 0.0 || v < 0.0 {
                continue;
            }
            let x0 = u.floor() as usize;
            let y0 = v.floor() as usize;
            if x0 + 1 >= n || y0 + 1 >= n {
                continue;
            }
            let fx = (u - x0 as f64) as f32;
            let fy = (v - y0 as f64) as f32;

            image[y0 * n + x0] += (1.0 - fx) * (1.0 - fy);
            image[y0 * n + x0 + 1] += fx * (1.0 - fy);
            image[(y0 + 1) * n + x0] += (1.0 - fx) * fy;
            image[(y0 + 1) * n + x0 + 1] += fx * fy;
        }
        image
    }

    /// 2D FFT using row-column decomposition.
    fn fft_2d(&self, image: &[f32]) -> Vec<Complex<f32>> {
        let n = self.size;
        let mut data: Vec<Complex<f32>> = image.iter().map(|&v| Complex::new(v, 0.0)).collect();

        for row in data.chunks_exact_mut(n) {
            self.forward_fft.process(row);
        }
        transpose_inplace(&mut data, n);
        for row in data.chunks_exact_mut(n) {
            self.forward_fft.process(row);
        }
        transpose_inplace(&mut data, n);

        data
    }

    /// Inverse 2D FFT, real part.
    fn ifft_2d(&self, mut data: Vec<Complex<f32>>) -> Vec<f32> {
        let n = self.size;

        for row in data.chunks_exact_mut(n) {
            self.inverse_fft.process(row);
        }
        transpose_inplace(&mut data, n);
        for row in data.chunks_exact_mut(n) {
            self.inverse_fft.process(row);
        }
        transpose_inplace(&mut data, n);

        let norm = 1.0 / (n * n) as f32;
        data.iter().map(|c| c.re * norm).collect()
    }

    /// Shift of `target` relative to the reference spectrum, in camera pixels.
    fn shift(&self, reference: &[Complex<f32>], target: &[f32]) -> Option<DVec2> {
        let n = self.size;
        let target_fft = self.fft_2d(target);

        // Peak of conj(F_ref) · F_tar sits at the displacement of the target.
        let cross: Vec<Complex<f32>> = reference
            .iter()
            .zip(target_fft.iter())
            .enumerate()
            .map(|(i, (&r, &t))| r.conj() * t * (self.blur[i / n] * self.blur[i % n]))
            .collect();
        let correlation = self.ifft_2d(cross);

        let (peak_x, peak_y, peak_val) = find_peak(&correlation, n);
        if peak_val.is_nan() || peak_val <= 0.0 {
            return None;
        }

        let wrap = |p: usize| {
            if p > n / 2 {
                p as f64 - n as f64
            } else {
                p as f64
            }
        };
        let (sub_x, sub_y) = subpixel_parabolic(&correlation, n, peak_x, peak_y);

        Some(DVec2::new(wrap(peak_x) + sub_x, wrap(peak_y) + sub_y) / self.oversampling)
    }
}

/// Per-frame raw drift with estimates at segment center frames.
pub(super) fn segment_drift(
    localizations: &[Localization],
    frame_count: usize,
    segment_frames: usize,
    oversampling: usize,
    min_localizations: usize,
) -> RawDrift {
    let mut shifts = vec![None; frame_count];
    let segment_frames = segment_frames.max(1);
    let segment_count = frame_count.div_ceil(segment_frames);

    let mut segments: Vec<Vec<&Localization>> = vec![Vec::new(); segment_count];
    for loc in localizations.iter().filter(|l| l.frame < frame_count) {
        segments[loc.frame / segment_frames].push(loc);
    }

    let usable: Vec<bool> = segments
        .iter()
        .map(|s| !s.is_empty() && s.len() >= min_localizations)
        .collect();
    let insufficient: usize = usable
        .iter()
        .enumerate()
        .filter(|&(_, ok)| !ok)
        .map(|(k, _)| segment_len(k, segment_frames, frame_count))
        .sum();

    let Some(reference_index) = usable.iter().position(|&ok| ok) else {
        return RawDrift {
            shifts,
            insufficient,
        };
    };

    let correlator = DensityCorrelator::new(localizations, oversampling);
    let reference = correlator.fft_2d(&correlator.render(segments[reference_index].iter().copied()));

    let mut estimates: Vec<Option<DVec2>> = Vec::with_capacity(segment_count);
    for (group_index, group) in segments.chunks(SEGMENTS_IN_FLIGHT).enumerate() {
        let first = group_index * SEGMENTS_IN_FLIGHT;
        estimates.par_extend(group.par_iter().enumerate().map(|(offset, segment)| {
            let k = first + offset;
            if !usable[k] {
                return None;
            }
            if k == reference_index {
                return Some(DVec2::ZERO);
            }
            correlator.shift(&reference, &correlator.render(segment.iter().copied()))
        }));
    }

    let mut insufficient = insufficient;
    for (k, estimate) in estimates.into_iter().enumerate() {
        let start = k * segment_frames;
        let center = start + (segment_len(k, segment_frames, frame_count) - 1) / 2;
        match estimate {
            Some(shift) => shifts[center] = Some(shift),
            None if usable[k] => insufficient += segment_len(k, segment_frames, frame_count),
            None => {}
        }
    }

    RawDrift {
        shifts,
        insufficient,
    }
}

#[inline]
fn segment_len(k: usize, segment_frames: usize, frame_count: usize) -> usize {
    let start = k * segment_frames;
    (start + segment_frames).min(frame_count) - start
}

fn find_peak(correlation: &[f32], n: usize) -> (usize, usize, f32) {
    let mut max_val = f32::NEG_INFINITY;
    let mut max_idx = 0;
    for (i, &v) in correlation.iter().enumerate() {
        if v > max_val {
            max_val = v;
            max_idx = i;
        }
    }
    (max_idx % n, max_idx / n, max_val)
}

/// Parabolic sub-pixel offset of the peak along each axis.
fn subpixel_parabolic(correlation: &[f32], n: usize, peak_x: usize, peak_y: usize) -> (f64, f64) {
    let get = |x: isize, y: isize| -> f64 {
        let xx = x.rem_euclid(n as isize) as usize;
        let yy = y.rem_euclid(n as isize) as usize;
        correlation[yy * n + xx] as f64
    };

    let px = peak_x as isize;
    let py = peak_y as isize;
    let c = get(px, py);
    let l = get(px - 1, py);
    let r = get(px + 1, py);
    let t = get(px, py - 1);
    let b = get(px, py + 1);

    let offset = |lo: f64, hi: f64| {
        let denom = 2.0 * (lo + hi - 2.0 * c);
        if denom.abs() > 1e-12 {
            ((lo - hi) / denom).clamp(-0.5, 0.5)
        } else {
            0.0
        }
    };

    (offset(l, r), offset(t, b))
}

/// In-place square matrix transpose.
fn transpose_inplace(data: &mut [Complex<f32>], n: usize) {
    for i in 0..n {
        for j in (i + 1)..n {
            data.swap(i * n + j, j * n + i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::localization;

    #[test]
    fn test_wide_field_render_is_capped() {
        let corners = [localization(0, 0.0, 0.0), localization(0, 2035.0, 2035.0)];

        for oversampling in [4, 8, 16] {
            let correlator = DensityCorrelator::new(&corners, oversampling);
            assert!(correlator.size <= 2048, "size {}", correlator.size);
            assert!(correlator.oversampling * 2035.0 <= MAX_RENDER_SIZE + 1e-9);
        }
    }

    #[test]
    fn test_small_field_keeps_requested_oversampling() {
        let corners = [localization(0, 10.0, 10.0), localization(0, 60.0, 40.0)];

        let correlator = DensityCorrelator::new(&corners, 4);

        assert_eq!(correlator.oversampling, 4.0);
        // 50 px field at 4x: 202 content pixels padded to 512.
        assert_eq!(correlator.size, 512);
    }
}
