//! Sub-pixel PSF fitting of detected candidates.
//!
//! Each candidate window is converted to photons, seeded from its intensity
//! centroid and refined with Levenberg-Marquardt against the configured PSF
//! model. A fit either yields a [`Localization`] or a [`FitRejection`]; no
//! partial result escapes.

pub mod linear_solver;
pub mod lm_optimizer;

#[cfg(test)]
mod tests;

use rayon::prelude::*;
use strum::{EnumCount, IntoEnumIterator};
use strum_macros::{Display, EnumIter};

use crate::config::{CameraConfig, Config, FitObjective, PsfVariant};
use crate::detection::Candidate;
use crate::frame::Frame;
use crate::localization::Localization;
use crate::math::median_f32_mut;
use crate::psf::{EllipticalGaussian, InitialGuess, PsfBounds, PsfModel, SymmetricGaussian};
use lm_optimizer::{LmConfig, normal_equations, optimize};
use linear_solver::invert;

/// Why a candidate produced no localization.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, strum_macros::EnumCount,
)]
#[strum(serialize_all = "snake_case")]
pub enum FitRejection {
    /// No positive background-subtracted signal in the window.
    NoSignal,
    /// Iterations or damping exhausted before convergence.
    NotConverged,
    NegativeIntensity,
    /// The position left the fitting window.
    OutsideWindow,
    /// Width fell below `min_sigma_px`.
    WidthCollapsed,
    /// Width grew beyond the window radius.
    WidthExploded,
    /// The final curvature matrix could not be inverted.
    SingularCurvature,
    NonFinite,
}

/// Per-reason rejection counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectionCounts([usize; FitRejection::COUNT]);

impl Default for RejectionCounts {
    fn default() -> Self {
        Self([0; FitRejection::COUNT])
    }
}

impl RejectionCounts {
    #[inline]
    pub fn record(&mut self, reason: FitRejection) {
        self.0[reason as usize] += 1;
    }

    #[inline]
    pub fn get(&self, reason: FitRejection) -> usize {
        self.0[reason as usize]
    }

    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }

    pub fn merge(&mut self, other: &RejectionCounts) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a += b;
        }
    }

    /// Non-zero counters in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (FitRejection, usize)> + '_ {
        FitRejection::iter()
            .map(|reason| (reason, self.get(reason)))
            .filter(|&(_, count)| count > 0)
    }
}

/// Outcome of fitting every candidate of one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameFit {
    /// Successful fits in candidate order.
    pub localizations: Vec<Localization>,
    pub rejections: RejectionCounts,
}

/// Photon counts of a square window with pixel offsets from its center.
#[derive(Debug)]
struct Window {
    x: Vec<f64>,
    y: Vec<f64>,
    counts: Vec<f64>,
    radius: usize,
}

impl Window {
    fn len(&self) -> usize {
        self.counts.len()
    }

    fn border(&self) -> Vec<f32> {
        let r = self.radius as f64;
        self.x
            .iter()
            .zip(self.y.iter())
            .zip(self.counts.iter())
            .filter(|((x, y), _)| x.abs() == r || y.abs() == r)
            .map(|(_, &c)| c as f32)
            .collect()
    }
}

/// PSF fitter configured once and shared across worker threads.
#[derive(Debug, Clone)]
pub struct Fitter {
    variant: PsfVariant,
    initial_sigma: f64,
    min_sigma: f64,
    camera: CameraConfig,
    lm: LmConfig,
}

impl Fitter {
    pub fn new(config: &Config) -> Self {
        Self {
            variant: config.psf_model_variant,
            initial_sigma: config.initial_sigma_px,
            min_sigma: config.min_sigma_px,
            camera: config.camera,
            lm: LmConfig {
                max_iterations: config.max_fit_iterations,
                tolerance: config.convergence_tolerance,
                objective: config.fit_objective,
                ..Default::default()
            },
        }
    }

    /// Fit one candidate.
    pub fn fit(&self, frame: &Frame, candidate: &Candidate) -> Result<Localization, FitRejection> {
        let window = self.extract_window(frame, candidate)?;
        let guess = initial_guess(&window, self.initial_sigma)?;
        let bounds = PsfBounds {
            window_radius: candidate.window_radius as f64,
            min_sigma: self.min_sigma,
        };

        match self.variant {
            PsfVariant::SymmetricGaussian => {
                self.fit_model(&SymmetricGaussian::new(bounds), &window, &guess, candidate)
            }
            PsfVariant::EllipticalGaussian => {
                self.fit_model(&EllipticalGaussian::new(bounds), &window, &guess, candidate)
            }
        }
    }

    /// Fit all candidates of `frame` in parallel. Localizations keep candidate order.
    pub fn fit_all(&self, frame: &Frame, candidates: &[Candidate]) -> FrameFit {
        let results: Vec<Result<Localization, FitRejection>> = candidates
            .par_iter()
            .map(|candidate| self.fit(frame, candidate))
            .collect();

        let mut out = FrameFit {
            localizations: Vec::with_capacity(results.len()),
            rejections: RejectionCounts::default(),
        };
        for (candidate, result) in candidates.iter().zip(results) {
            match result {
                Ok(localization) => out.localizations.push(localization),
                Err(reason) => {
                    tracing::trace!(
                        frame = candidate.frame,
                        x = candidate.x,
                        y = candidate.y,
                        %reason,
                        "candidate rejected"
                    );
                    out.rejections.record(reason);
                }
            }
        }
        out
    }

    fn extract_window(&self, frame: &Frame, candidate: &Candidate) -> Result<Window, FitRejection> {
        let r = candidate.window_radius;
        if candidate.x < r
            || candidate.y < r
            || candidate.x + r >= frame.width()
            || candidate.y + r >= frame.height()
        {
            return Err(FitRejection::OutsideWindow);
        }

        let size = candidate.window_size();
        let mut window = Window {
            x: Vec::with_capacity(size * size),
            y: Vec::with_capacity(size * size),
            counts: Vec::with_capacity(size * size),
            radius: r,
        };

        for py in (candidate.y - r)..=(candidate.y + r) {
            let row = frame.row(py);
            for px in (candidate.x - r)..=(candidate.x + r) {
                window.x.push(px as f64 - candidate.x as f64);
                window.y.push(py as f64 - candidate.y as f64);
                window.counts.push(self.camera.to_photons(row[px]) as f64);
            }
        }

        Ok(window)
    }

    fn fit_model<const N: usize, M: PsfModel<N>>(
        &self,
        model: &M,
        window: &Window,
        guess: &InitialGuess,
        candidate: &Candidate,
    ) -> Result<Localization, FitRejection> {
        let result = optimize(
            model,
            &window.x,
            &window.y,
            &window.counts,
            model.initial_params(guess),
            &self.lm,
        )?;
        let params = result.params;
        if let Some(reason) = model.bounds_violation(&params) {
            return Err(reason);
        }

        let dof = window.len().saturating_sub(N).max(1) as f64;
        let (lpx, lpy) = self.uncertainty(model, window, &params, result.objective / dof)?;
        let (x, y) = model.position(&params);
        let (sx, sy) = model.widths(&params);

        Ok(Localization {
            frame: candidate.frame,
            x: (candidate.x as f64 + x) as f32,
            y: (candidate.y as f64 + y) as f32,
            photons: model.photons(&params) as f32,
            background: model.background(&params) as f32,
            sx: sx as f32,
            sy: sy as f32,
            lpx: lpx as f32,
            lpy: lpy as f32,
            goodness_of_fit: (result.objective / dof) as f32,
            net_signal: candidate.strength,
            iterations: result.iterations as u32,
        })
    }

    /// Standard deviations of the position from the inverse curvature matrix.
    ///
    /// For Poisson noise the curvature is the Fisher information, whose inverse
    /// is the Cramér-Rao bound. For least squares it is `JᵀJ`, scaled by the
    /// residual variance.
    fn uncertainty<const N: usize, M: PsfModel<N>>(
        &self,
        model: &M,
        window: &Window,
        params: &[f64; N],
        reduced_objective: f64,
    ) -> Result<(f64, f64), FitRejection> {
        let (curvature, _) = normal_equations(
            model,
            &window.x,
            &window.y,
            &window.counts,
            params,
            self.lm.objective,
        );
        let covariance = invert(&curvature).ok_or(FitRejection::SingularCurvature)?;

        let scale = match self.lm.objective {
            FitObjective::PoissonMle => 1.0,
            FitObjective::LeastSquares => reduced_objective,
        };
        let var_x = covariance[0][0] * scale;
        let var_y = covariance[1][1] * scale;

        if !var_x.is_finite() || !var_y.is_finite() {
            return Err(FitRejection::NonFinite);
        }
        if var_x < 0.0 || var_y < 0.0 {
            return Err(FitRejection::SingularCurvature);
        }
        Ok((var_x.sqrt(), var_y.sqrt()))
    }
}

/// Background from the border median, position and photons from the
/// background-subtracted moments.
fn initial_guess(window: &Window, sigma: f64) -> Result<InitialGuess, FitRejection> {
    let mut border = window.border();
    if border.is_empty() {
        return Err(FitRejection::NoSignal);
    }
    let background = median_f32_mut(&mut border) as f64;

    let mut signal = 0.0f64;
    let mut weight = 0.0f64;
    let mut wx = 0.0f64;
    let mut wy = 0.0f64;
    for ((&x, &y), &count) in window.x.iter().zip(window.y.iter()).zip(window.counts.iter()) {
        let excess = count - background;
        signal += excess;
        if excess > 0.0 {
            weight += excess;
            wx += excess * x;
            wy += excess * y;
        }
    }

    if signal <= 0.0 || weight <= 0.0 {
        return Err(FitRejection::NoSignal);
    }

    Ok(InitialGuess {
        x: wx / weight,
        y: wy / weight,
        photons: signal,
        background,
        sigma,
    })
}
