//! Configuration for the localization pipeline.
//!
//! A single flat [`Config`] struct with all parameters grouped by pipeline
//! stage. Construct with [`Config::default`] and customize fields, or load
//! from YAML with [`Config::from_yaml_str`]. Missing YAML keys fall back to
//! the defaults.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ============================================================================
// Enums
// ============================================================================

/// Point-spread function model fitted to each candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PsfVariant {
    /// Isotropic 2D Gaussian plus constant background (5 parameters).
    #[default]
    SymmetricGaussian,
    /// Axis-aligned elliptical 2D Gaussian plus constant background (6 parameters).
    /// Use for astigmatic or otherwise anisotropic PSFs.
    EllipticalGaussian,
}

/// Noise model assumed by the fitter.
///
/// The choice changes both the weighting of the normal equations and the
/// uncertainty formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FitObjective {
    /// Poisson maximum likelihood. Pixel values must be photon counts;
    /// uncertainties come from the inverse Fisher information.
    #[default]
    PoissonMle,
    /// Unweighted least squares. Uncertainties come from the inverse of JᵀJ
    /// scaled by the residual variance.
    LeastSquares,
}

/// Drift estimation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DriftMethod {
    /// No drift correction; the trajectory is all zeros.
    None,
    /// Chained frame-to-frame displacements of linked tracks, refined against
    /// track centroids.
    #[default]
    TrackCentroid,
    /// Cross-correlation of rendered localization densities of frame segments
    /// against the first segment.
    CrossCorrelation {
        /// Frames per segment.
        segment_frames: usize,
        /// Render pixels per camera pixel.
        oversampling: usize,
    },
}

// ============================================================================
// Camera
// ============================================================================

/// Conversion from camera counts (ADU) to photons:
/// `photons = (adu - baseline) * sensitivity / (gain * quantum_efficiency)`.
///
/// The defaults are the identity conversion, for frames already in photons.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Offset added by the camera to every pixel (ADU).
    pub baseline: f32,
    /// Electrons per ADU.
    pub sensitivity: f32,
    /// Electron-multiplying gain (1.0 for sCMOS).
    pub gain: f32,
    /// Quantum efficiency in (0, 1].
    pub quantum_efficiency: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            baseline: 0.0,
            sensitivity: 1.0,
            gain: 1.0,
            quantum_efficiency: 1.0,
        }
    }
}

impl CameraConfig {
    #[inline]
    pub fn to_photons(&self, adu: f32) -> f32 {
        ((adu - self.baseline) * self.sensitivity / (self.gain * self.quantum_efficiency)).max(0.0)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.baseline.is_finite() || self.baseline < 0.0 {
            return Err(ConfigError::invalid(
                "camera.baseline",
                format!("must be finite and non-negative, got {}", self.baseline),
            ));
        }
        if !(self.sensitivity > 0.0) {
            return Err(ConfigError::invalid(
                "camera.sensitivity",
                format!("must be positive, got {}", self.sensitivity),
            ));
        }
        if !(self.gain > 0.0) {
            return Err(ConfigError::invalid(
                "camera.gain",
                format!("must be positive, got {}", self.gain),
            ));
        }
        if !(self.quantum_efficiency > 0.0 && self.quantum_efficiency <= 1.0) {
            return Err(ConfigError::invalid(
                "camera.quantum_efficiency",
                format!("must be in (0, 1], got {}", self.quantum_efficiency),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Pipeline configuration
// ============================================================================

/// Configuration for the whole localization pipeline.
///
/// # Example
///
/// ```rust,ignore
/// use picasso::Config;
///
/// let mut config = Config::default();
/// config.psf_model_variant = PsfVariant::EllipticalGaussian;
/// config.max_linking_distance_px = 1.0;
/// config.validate()?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // -- Detection --
    /// Detection threshold in units of the local noise of the 3×3 box mean.
    pub detection_threshold_multiplier: f32,
    /// Local maxima closer than this are reduced to the strongest one (pixels).
    pub min_separation_px: f64,
    /// Half-width of the square fitting window; the window is `2r+1` pixels wide.
    pub window_radius_px: usize,
    /// Tile size for background and noise estimation (pixels).
    pub background_tile_size: usize,

    // -- Fitting --
    /// PSF model fitted to each candidate.
    pub psf_model_variant: PsfVariant,
    /// Noise model of the fit.
    pub fit_objective: FitObjective,
    /// Initial PSF width guess (pixels).
    pub initial_sigma_px: f64,
    /// Fits whose width drops below this are rejected as collapsed (pixels).
    pub min_sigma_px: f64,
    /// Iteration budget per candidate.
    pub max_fit_iterations: usize,
    /// Relative parameter-update / objective-improvement threshold for convergence.
    pub convergence_tolerance: f64,
    /// ADU to photon conversion.
    pub camera: CameraConfig,

    // -- Linking --
    /// Maximum distance between a localization and the last position of a track (pixels).
    pub max_linking_distance_px: f64,
    /// Maximum number of consecutive frames a track may go unobserved.
    pub max_frame_gap: usize,

    // -- Drift --
    /// Drift estimation strategy.
    pub drift_method: DriftMethod,
    /// Centered moving-average window applied to the trajectory (frames). 0 or 1 disables.
    pub drift_smoothing_window: usize,
    /// Frames with fewer contributing localizations are interpolated.
    pub drift_min_localizations: usize,
    /// Maximum passes of the track-centroid estimator. The first chains
    /// frame-to-frame displacements, later ones refine against track centroids.
    pub drift_iterations: usize,

    // -- Execution --
    /// Frames loaded and dispatched per batch. 0 = twice the worker count.
    pub frames_per_batch: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Detection
            detection_threshold_multiplier: 5.0,
            min_separation_px: 4.0,
            window_radius_px: 4,
            background_tile_size: 32,

            // Fitting
            psf_model_variant: PsfVariant::SymmetricGaussian,
            fit_objective: FitObjective::PoissonMle,
            initial_sigma_px: 1.3,
            min_sigma_px: 0.4,
            max_fit_iterations: 50,
            convergence_tolerance: 1e-6,
            camera: CameraConfig::default(),

            // Linking
            max_linking_distance_px: 1.5,
            max_frame_gap: 3,

            // Drift
            drift_method: DriftMethod::TrackCentroid,
            drift_smoothing_window: 5,
            drift_min_localizations: 1,
            drift_iterations: 20,

            // Execution
            frames_per_batch: 0,
        }
    }
}

impl Config {
    /// Parse a YAML document. Keys not present keep their default values.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        Ok(serde_yml::to_string(self)?)
    }

    /// Frames per batch after resolving the automatic setting.
    pub fn effective_frames_per_batch(&self) -> usize {
        if self.frames_per_batch == 0 {
            rayon::current_num_threads() * 2
        } else {
            self.frames_per_batch
        }
    }

    /// Validate every option. Called before any frame is processed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Detection
        if !(self.detection_threshold_multiplier > 0.0)
            || !self.detection_threshold_multiplier.is_finite()
        {
            return Err(ConfigError::invalid(
                "detection_threshold_multiplier",
                format!(
                    "must be positive and finite, got {}",
                    self.detection_threshold_multiplier
                ),
            ));
        }
        if !(self.min_separation_px >= 0.0) || !self.min_separation_px.is_finite() {
            return Err(ConfigError::invalid(
                "min_separation_px",
                format!("must be non-negative and finite, got {}", self.min_separation_px),
            ));
        }
        if !(2..=32).contains(&self.window_radius_px) {
            return Err(ConfigError::invalid(
                "window_radius_px",
                format!("must be between 2 and 32, got {}", self.window_radius_px),
            ));
        }
        if !(8..=512).contains(&self.background_tile_size) {
            return Err(ConfigError::invalid(
                "background_tile_size",
                format!(
                    "must be between 8 and 512, got {}",
                    self.background_tile_size
                ),
            ));
        }

        // Fitting
        if !(self.min_sigma_px > 0.0) {
            return Err(ConfigError::invalid(
                "min_sigma_px",
                format!("must be positive, got {}", self.min_sigma_px),
            ));
        }
        if !(self.initial_sigma_px > self.min_sigma_px)
            || self.initial_sigma_px >= self.window_radius_px as f64
        {
            return Err(ConfigError::invalid(
                "initial_sigma_px",
                format!(
                    "must be in ({}, {}), got {}",
                    self.min_sigma_px, self.window_radius_px, self.initial_sigma_px
                ),
            ));
        }
        if self.max_fit_iterations == 0 {
            return Err(ConfigError::invalid(
                "max_fit_iterations",
                "must be at least 1",
            ));
        }
        if !(self.convergence_tolerance > 0.0 && self.convergence_tolerance < 1.0) {
            return Err(ConfigError::invalid(
                "convergence_tolerance",
                format!("must be in (0, 1), got {}", self.convergence_tolerance),
            ));
        }
        self.camera.validate()?;

        // Linking
        if !(self.max_linking_distance_px > 0.0) || !self.max_linking_distance_px.is_finite() {
            return Err(ConfigError::invalid(
                "max_linking_distance_px",
                format!(
                    "must be positive and finite, got {}",
                    self.max_linking_distance_px
                ),
            ));
        }

        // Drift
        if let DriftMethod::CrossCorrelation {
            segment_frames,
            oversampling,
        } = self.drift_method
        {
            if segment_frames == 0 {
                return Err(ConfigError::invalid(
                    "drift_method.segment_frames",
                    "must be at least 1",
                ));
            }
            if !(1..=16).contains(&oversampling) {
                return Err(ConfigError::invalid(
                    "drift_method.oversampling",
                    format!("must be between 1 and 16, got {oversampling}"),
                ));
            }
        }
        if self.drift_min_localizations == 0 {
            return Err(ConfigError::invalid(
                "drift_min_localizations",
                "must be at least 1",
            ));
        }
        if self.drift_iterations == 0 {
            return Err(ConfigError::invalid(
                "drift_iterations",
                "must be at least 1",
            ));
        }

        Ok(())
    }
}
