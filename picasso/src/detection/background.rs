//! Background and noise estimation.
//!
//! Estimates the local background using a tiled approach with sigma-clipped
//! statistics, then bilinearly interpolates between tile centers to create a
//! smooth per-pixel background and noise map.

use rayon::prelude::*;

use crate::frame::Frame;
use crate::math::{ClippedStats, sigma_clipped_stats};

/// Clipping threshold for tile statistics.
const CLIP_KAPPA: f32 = 3.0;

/// Clipping passes for tile statistics.
const CLIP_ITERATIONS: usize = 3;

/// Per-pixel background and noise (sigma) estimates.
#[derive(Debug)]
pub struct BackgroundMap {
    pub background: Vec<f32>,
    pub noise: Vec<f32>,
    pub width: usize,
    pub height: usize,
}

impl BackgroundMap {
    #[inline]
    pub fn background_at(&self, x: usize, y: usize) -> f32 {
        self.background[y * self.width + x]
    }

    #[inline]
    pub fn noise_at(&self, x: usize, y: usize) -> f32 {
        self.noise[y * self.width + x]
    }

    /// Estimate the background of `frame` on a grid of `tile_size` tiles.
    ///
    /// Frames smaller than one tile get a single tile covering the frame.
    pub fn estimate(frame: &Frame, tile_size: usize) -> Self {
        let width = frame.width();
        let height = frame.height();
        debug_assert!(tile_size > 0);

        let tiles_x = width.div_ceil(tile_size).max(1);
        let tiles_y = height.div_ceil(tile_size).max(1);
        let max_tile_pixels = tile_size * tile_size;

        let stats: Vec<ClippedStats> = (0..tiles_y * tiles_x)
            .into_par_iter()
            .map_init(
                || {
                    (
                        Vec::with_capacity(max_tile_pixels),
                        Vec::with_capacity(max_tile_pixels),
                    )
                },
                |(values, deviations), idx| {
                    let tx = idx % tiles_x;
                    let ty = idx / tiles_x;
                    let x_start = tx * tile_size;
                    let y_start = ty * tile_size;
                    let x_end = (x_start + tile_size).min(width);
                    let y_end = (y_start + tile_size).min(height);

                    values.clear();
                    for y in y_start..y_end {
                        values.extend_from_slice(&frame.row(y)[x_start..x_end]);
                    }
                    sigma_clipped_stats(values, deviations, CLIP_KAPPA, CLIP_ITERATIONS)
                },
            )
            .collect();

        let grid = TileGrid {
            stats,
            centers_x: tile_centers(tiles_x, tile_size, width),
            centers_y: tile_centers(tiles_y, tile_size, height),
            tiles_x,
            tiles_y,
        };

        let mut background = vec![0.0f32; width * height];
        let mut noise = vec![0.0f32; width * height];

        background
            .par_chunks_mut(width)
            .zip(noise.par_chunks_mut(width))
            .enumerate()
            .for_each(|(y, (bg_row, noise_row))| grid.interpolate_row(y, bg_row, noise_row));

        Self {
            background,
            noise,
            width,
            height,
        }
    }
}

fn tile_centers(tiles: usize, tile_size: usize, extent: usize) -> Vec<f32> {
    (0..tiles)
        .map(|t| {
            let start = t * tile_size;
            let end = (start + tile_size).min(extent);
            // Pixel centers sit on integers, so the tile center is the mean index.
            (start + end - 1) as f32 * 0.5
        })
        .collect()
}

/// Tile statistics with precomputed centers for interpolation.
struct TileGrid {
    stats: Vec<ClippedStats>,
    centers_x: Vec<f32>,
    centers_y: Vec<f32>,
    tiles_x: usize,
    tiles_y: usize,
}

impl TileGrid {
    #[inline]
    fn get(&self, tx: usize, ty: usize) -> ClippedStats {
        self.stats[ty * self.tiles_x + tx]
    }

    fn interpolate_row(&self, y: usize, bg_row: &mut [f32], noise_row: &mut [f32]) {
        let (ty0, ty1, wy) = bracket(y as f32, &self.centers_y);
        debug_assert!(ty1 < self.tiles_y);

        for (x, (bg, noise)) in bg_row.iter_mut().zip(noise_row.iter_mut()).enumerate() {
            let (tx0, tx1, wx) = bracket(x as f32, &self.centers_x);

            let t00 = self.get(tx0, ty0);
            let t10 = self.get(tx1, ty0);
            let t01 = self.get(tx0, ty1);
            let t11 = self.get(tx1, ty1);

            let top_bg = (1.0 - wx) * t00.median + wx * t10.median;
            let bottom_bg = (1.0 - wx) * t01.median + wx * t11.median;
            let top_noise = (1.0 - wx) * t00.sigma + wx * t10.sigma;
            let bottom_noise = (1.0 - wx) * t01.sigma + wx * t11.sigma;

            *bg = (1.0 - wy) * top_bg + wy * bottom_bg;
            *noise = (1.0 - wy) * top_noise + wy * bottom_noise;
        }
    }
}

/// Lower and upper tile indices around `pos` and the interpolation weight of
/// the upper one. Positions outside the outermost centers clamp.
#[inline]
fn bracket(pos: f32, centers: &[f32]) -> (usize, usize, f32) {
    let lower = centers.iter().rposition(|&c| c <= pos).unwrap_or(0);
    let upper = (lower + 1).min(centers.len() - 1);
    if upper == lower {
        return (lower, upper, 0.0);
    }
    let w = ((pos - centers[lower]) / (centers[upper] - centers[lower])).clamp(0.0, 1.0);
    (lower, upper, w)
}
