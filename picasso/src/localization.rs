//! The localization record produced by the fitter.

use serde::{Deserialize, Serialize};

/// A single emitter position resolved in one frame.
///
/// Coordinates are in camera pixels with pixel centers at integer positions.
/// Photometric values are in photons.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Localization {
    /// Index of the source frame.
    pub frame: usize,
    /// Sub-pixel X position.
    pub x: f32,
    /// Sub-pixel Y position.
    pub y: f32,
    /// Total photons in the fitted PSF.
    pub photons: f32,
    /// Background photons per pixel.
    pub background: f32,
    /// Fitted PSF width along X (pixels).
    pub sx: f32,
    /// Fitted PSF width along Y (pixels). Equal to `sx` for the symmetric model.
    pub sy: f32,
    /// 1-sigma positional uncertainty along X (pixels).
    pub lpx: f32,
    /// 1-sigma positional uncertainty along Y (pixels).
    pub lpy: f32,
    /// Final objective per degree of freedom. Close to 1 for a good fit.
    pub goodness_of_fit: f32,
    /// Detection strength of the candidate (background-subtracted local mean).
    pub net_signal: f32,
    /// LM iterations used.
    pub iterations: u32,
}

impl Localization {
    /// `1 - min(sx, sy) / max(sx, sy)`; 0 for a round PSF.
    pub fn ellipticity(&self) -> f32 {
        let major = self.sx.max(self.sy);
        if major <= 0.0 {
            return 0.0;
        }
        1.0 - self.sx.min(self.sy) / major
    }

    /// Copy with the position shifted by `(-dx, -dy)`.
    #[inline]
    pub fn shifted(&self, dx: f32, dy: f32) -> Self {
        Self {
            x: self.x - dx,
            y: self.y - dy,
            ..*self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Localization {
        Localization {
            frame: 3,
            x: 10.25,
            y: 20.5,
            photons: 1500.0,
            background: 12.0,
            sx: 1.2,
            sy: 1.5,
            lpx: 0.03,
            lpy: 0.035,
            goodness_of_fit: 1.02,
            net_signal: 48.0,
            iterations: 6,
        }
    }

    #[test]
    fn test_ellipticity() {
        let loc = sample();
        assert!((loc.ellipticity() - 0.2).abs() < 1e-6);

        let round = Localization { sy: 1.2, ..loc };
        assert_eq!(round.ellipticity(), 0.0);
    }

    #[test]
    fn test_shifted_leaves_original_untouched() {
        let loc = sample();
        let moved = loc.shifted(0.25, -0.5);
        assert_eq!(moved.x, 10.0);
        assert_eq!(moved.y, 21.0);
        assert_eq!(moved.photons, loc.photons);
        assert_eq!(loc.x, 10.25);
    }

    #[test]
    fn test_record_serializes_as_plain_fields() {
        let loc = sample();
        let json = serde_json::to_value(loc).unwrap();
        assert_eq!(json["frame"], 3);
        assert_eq!(json["iterations"], 6);
        let back: Localization = serde_json::from_value(json).unwrap();
        assert_eq!(back, loc);
    }
}
