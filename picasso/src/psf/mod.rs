//! Parametric point-spread function models.
//!
//! Each model is a 2D Gaussian plus a constant background, evaluated at pixel
//! centers. Parameters are offsets from the fitting window center, so position
//! parameters stay small and well conditioned.
//!
//! Parameter layout shared by all models: `[x, y, photons, background, widths..]`.


use std::f64::consts::PI;

use crate::fit::FitRejection;

/// Physical limits of a fit, shared by all models.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsfBounds {
    /// Positions must stay within this distance of the window center.
    pub window_radius: f64,
    /// Widths below this are treated as collapsed.
    pub min_sigma: f64,
}

impl PsfBounds {
    fn check_common(&self, x: f64, y: f64, photons: f64) -> Option<FitRejection> {
        if photons <= 0.0 {
            return Some(FitRejection::NegativeIntensity);
        }
        if x.abs() > self.window_radius || y.abs() > self.window_radius {
            return Some(FitRejection::OutsideWindow);
        }
        None
    }

    fn check_width(&self, sigma: f64) -> Option<FitRejection> {
        if sigma < self.min_sigma {
            Some(FitRejection::WidthCollapsed)
        } else if sigma > self.window_radius {
            Some(FitRejection::WidthExploded)
        } else {
            None
        }
    }
}

/// Starting point derived from the window moments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InitialGuess {
    pub x: f64,
    pub y: f64,
    pub photons: f64,
    pub background: f64,
    pub sigma: f64,
}

/// A PSF model with `N` free parameters.
pub trait PsfModel<const N: usize>: Sync {
    /// Expected photons at pixel offset `(x, y)`.
    fn evaluate(&self, x: f64, y: f64, params: &[f64; N]) -> f64;

    /// Partial derivatives of [`evaluate`](Self::evaluate) with respect to each parameter.
    fn jacobian_row(&self, x: f64, y: f64, params: &[f64; N]) -> [f64; N];

    /// Value and Jacobian in one pass; models override this to share the exponential.
    #[inline]
    fn evaluate_and_jacobian(&self, x: f64, y: f64, params: &[f64; N]) -> (f64, [f64; N]) {
        (self.evaluate(x, y, params), self.jacobian_row(x, y, params))
    }

    fn initial_params(&self, guess: &InitialGuess) -> [f64; N];

    /// First physical bound `params` violate, if any.
    fn bounds_violation(&self, params: &[f64; N]) -> Option<FitRejection>;

    /// Project parameters back onto hard constraints after an update.
    fn constrain(&self, params: &mut [f64; N]);

    #[inline]
    fn position(&self, params: &[f64; N]) -> (f64, f64) {
        (params[0], params[1])
    }

    #[inline]
    fn photons(&self, params: &[f64; N]) -> f64 {
        params[2]
    }

    #[inline]
    fn background(&self, params: &[f64; N]) -> f64 {
        params[3]
    }

    /// PSF widths `(sx, sy)`.
    fn widths(&self, params: &[f64; N]) -> (f64, f64);
}

/// Isotropic Gaussian: `[x, y, photons, background, sigma]`.
#[derive(Debug, Clone, Copy)]
pub struct SymmetricGaussian {
    pub bounds: PsfBounds,
}

impl SymmetricGaussian {
    pub const PARAMS: usize = 5;

    pub fn new(bounds: PsfBounds) -> Self {
        Self { bounds }
    }
}

impl PsfModel<5> for SymmetricGaussian {
    #[inline]
    fn evaluate(&self, x: f64, y: f64, params: &[f64; 5]) -> f64 {
        let [x0, y0, photons, background, sigma] = *params;
        let dx = x - x0;
        let dy = y - y0;
        let s2 = sigma * sigma;
        let g = (-0.5 * (dx * dx + dy * dy) / s2).exp();
        photons * g / (2.0 * PI * s2) + background
    }

    #[inline]
    fn jacobian_row(&self, x: f64, y: f64, params: &[f64; 5]) -> [f64; 5] {
        self.evaluate_and_jacobian(x, y, params).1
    }

    #[inline]
    fn evaluate_and_jacobian(&self, x: f64, y: f64, params: &[f64; 5]) -> (f64, [f64; 5]) {
        let [x0, y0, photons, background, sigma] = *params;
        let dx = x - x0;
        let dy = y - y0;
        let s2 = sigma * sigma;
        let r2 = dx * dx + dy * dy;
        let unit = (-0.5 * r2 / s2).exp() / (2.0 * PI * s2);
        let peak = photons * unit;

        (
            peak + background,
            [
                peak * dx / s2,
                peak * dy / s2,
                unit,
                1.0,
                peak * (r2 / (s2 * sigma) - 2.0 / sigma),
            ],
        )
    }

    fn initial_params(&self, guess: &InitialGuess) -> [f64; 5] {
        [guess.x, guess.y, guess.photons, guess.background, guess.sigma]
    }

    fn bounds_violation(&self, params: &[f64; 5]) -> Option<FitRejection> {
        if params.iter().any(|p| !p.is_finite()) {
            return Some(FitRejection::NonFinite);
        }
        self.bounds
            .check_common(params[0], params[1], params[2])
            .or_else(|| self.bounds.check_width(params[4]))
    }

    #[inline]
    fn constrain(&self, params: &mut [f64; 5]) {
        params[3] = params[3].max(0.0);
    }

    #[inline]
    fn widths(&self, params: &[f64; 5]) -> (f64, f64) {
        (params[4], params[4])
    }
}

/// Axis-aligned elliptical Gaussian: `[x, y, photons, background, sx, sy]`.
#[derive(Debug, Clone, Copy)]
pub struct EllipticalGaussian {
    pub bounds: PsfBounds,
}

impl EllipticalGaussian {
    pub const PARAMS: usize = 6;

    pub fn new(bounds: PsfBounds) -> Self {
        Self { bounds }
    }
}

impl PsfModel<6> for EllipticalGaussian {
    #[inline]
    fn evaluate(&self, x: f64, y: f64, params: &[f64; 6]) -> f64 {
        let [x0, y0, photons, background, sx, sy] = *params;
        let dx = x - x0;
        let dy = y - y0;
        let g = (-0.5 * (dx * dx / (sx * sx) + dy * dy / (sy * sy))).exp();
        photons * g / (2.0 * PI * sx * sy) + background
    }

    #[inline]
    fn jacobian_row(&self, x: f64, y: f64, params: &[f64; 6]) -> [f64; 6] {
        self.evaluate_and_jacobian(x, y, params).1
    }

    #[inline]
    fn evaluate_and_jacobian(&self, x: f64, y: f64, params: &[f64; 6]) -> (f64, [f64; 6]) {
        let [x0, y0, photons, background, sx, sy] = *params;
        let dx = x - x0;
        let dy = y - y0;
        let sx2 = sx * sx;
        let sy2 = sy * sy;
        let unit = (-0.5 * (dx * dx / sx2 + dy * dy / sy2)).exp() / (2.0 * PI * sx * sy);
        let peak = photons * unit;

        (
            peak + background,
            [
                peak * dx / sx2,
                peak * dy / sy2,
                unit,
                1.0,
                peak * (dx * dx / (sx2 * sx) - 1.0 / sx),
                peak * (dy * dy / (sy2 * sy) - 1.0 / sy),
            ],
        )
    }

    fn initial_params(&self, guess: &InitialGuess) -> [f64; 6] {
        [
            guess.x,
            guess.y,
            guess.photons,
            guess.background,
            guess.sigma,
            guess.sigma,
        ]
    }

    fn bounds_violation(&self, params: &[f64; 6]) -> Option<FitRejection> {
        if params.iter().any(|p| !p.is_finite()) {
            return Some(FitRejection::NonFinite);
        }
        self.bounds
            .check_common(params[0], params[1], params[2])
            .or_else(|| self.bounds.check_width(params[4]))
            .or_else(|| self.bounds.check_width(params[5]))
    }

    #[inline]
    fn constrain(&self, params: &mut [f64; 6]) {
        params[3] = params[3].max(0.0);
    }

    #[inline]
    fn widths(&self, params: &[f64; 6]) -> (f64, f64) {
        (params[4], params[5])
    }
}
