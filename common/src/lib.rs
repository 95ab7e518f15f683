//! Utilities shared by the workspace crates.

pub mod cancel;
pub mod log_setup;

pub use cancel::CancelToken;
