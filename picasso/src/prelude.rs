//! Prelude module for convenient imports.
//!
//! ```rust,ignore
//! use picasso::prelude::*;
//! ```

// Configuration
pub use crate::{CameraConfig, Config, DriftMethod, FitObjective, PsfVariant};

// Input and output
pub use crate::{Frame, FrameSource, Localization, VecFrameSource};

// Errors
pub use crate::{ConfigError, Error, FitRejection, FrameSourceError, InputError};

// Pipeline - main API
pub use crate::{DriftTrajectory, Pipeline, ProgressCallback, RunProgress, RunResult, RunStats, Track};

pub use common::CancelToken;
