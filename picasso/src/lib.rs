//! Picasso - single-molecule localization engine.
//!
//! Turns a stack of fluorescence frames into sub-pixel emitter positions:
//! - Spot detection against a noise-adaptive threshold
//! - PSF fitting with Levenberg-Marquardt (Poisson MLE or least squares)
//! - Linking of localizations across frames into tracks
//! - Drift estimation and correction
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use picasso::prelude::*;
//!
//! let config = Config::from_yaml_str(&std::fs::read_to_string("picasso.yaml")?)?;
//! let source = VecFrameSource::new(frames);
//!
//! let result = picasso::run(&source, &config)?;
//! println!(
//!     "{} localizations in {} tracks",
//!     result.localizations.len(),
//!     result.tracks.len()
//! );
//! ```

mod config;
mod error;
mod frame;
mod localization;
pub(crate) mod math;

pub mod detection;
pub mod drift;
pub mod fit;
pub mod linker;
pub mod pipeline;
pub mod psf;

#[cfg(test)]
pub(crate) mod testing;

pub mod prelude;

// ============================================================================
// Configuration and errors
// ============================================================================

pub use config::{CameraConfig, Config, DriftMethod, FitObjective, PsfVariant};
pub use error::{ConfigError, Error, FrameSourceError, InputError};

// ============================================================================
// Input and output records
// ============================================================================

pub use frame::{Frame, FrameSource, VecFrameSource};
pub use localization::Localization;

// ============================================================================
// Stages
// ============================================================================

pub use detection::{BackgroundMap, Candidate, Candidates, SpotDetector};
pub use drift::{DriftTrajectory, estimate_drift};
pub use fit::{FitRejection, Fitter, FrameFit, RejectionCounts};
pub use linker::{Linker, Track, link};
pub use psf::{EllipticalGaussian, PsfModel, SymmetricGaussian};

// ============================================================================
// Pipeline
// ============================================================================

pub use pipeline::{Pipeline, ProgressCallback, RunProgress, RunResult, RunStats, run};
