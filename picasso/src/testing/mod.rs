//! Synthetic data generators for tests.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Poisson};

use crate::frame::Frame;
use crate::localization::Localization;

/// Ground-truth emitter rendered into a synthetic frame.
#[derive(Debug, Clone, Copy)]
pub struct Spot {
    pub x: f64,
    pub y: f64,
    pub photons: f64,
    pub sigma_x: f64,
    pub sigma_y: f64,
}

impl Spot {
    pub fn round(x: f64, y: f64, photons: f64, sigma: f64) -> Self {
        Self {
            x,
            y,
            photons,
            sigma_x: sigma,
            sigma_y: sigma,
        }
    }
}

/// Add the expected photon count of `spot` to every pixel (pixel-center sampling).
pub fn render_spot(pixels: &mut [f32], width: usize, spot: &Spot) {
    let norm = spot.photons / (2.0 * std::f64::consts::PI * spot.sigma_x * spot.sigma_y);
    for (i, p) in pixels.iter_mut().enumerate() {
        let dx = (i % width) as f64 - spot.x;
        let dy = (i / width) as f64 - spot.y;
        let exponent = -0.5
            * (dx * dx / (spot.sigma_x * spot.sigma_x) + dy * dy / (spot.sigma_y * spot.sigma_y));
        *p += (norm * exponent.exp()) as f32;
    }
}

/// Noise-free frame with a uniform background and the given spots.
pub fn spot_frame(index: usize, width: usize, height: usize, background: f32, spots: &[Spot]) -> Frame {
    let mut pixels = vec![background; width * height];
    for spot in spots {
        render_spot(&mut pixels, width, spot);
    }
    Frame::new(index, width, height, pixels)
}

/// Replace every expected value by a Poisson draw.
pub fn poissonize(frame: &Frame, rng: &mut StdRng) -> Frame {
    let pixels = frame
        .pixels()
        .iter()
        .map(|&mean| {
            if mean <= 0.0 {
                return 0.0;
            }
            match Poisson::new(mean as f64) {
                Ok(dist) => dist.sample(rng) as f32,
                Err(_) => mean,
            }
        })
        .collect();
    Frame::new(frame.index(), frame.width(), frame.height(), pixels)
}

/// Noisy frame: Poisson draw of [`spot_frame`].
pub fn noisy_spot_frame(
    index: usize,
    width: usize,
    height: usize,
    background: f32,
    spots: &[Spot],
    rng: &mut StdRng,
) -> Frame {
    poissonize(&spot_frame(index, width, height, background, spots), rng)
}

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Localization with plausible photometry at `(x, y)` in `frame`.
pub fn localization(frame: usize, x: f32, y: f32) -> Localization {
    Localization {
        frame,
        x,
        y,
        photons: 1000.0,
        background: 10.0,
        sx: 1.3,
        sy: 1.3,
        lpx: 0.05,
        lpy: 0.05,
        goodness_of_fit: 1.0,
        net_signal: 50.0,
        iterations: 5,
    }
}
