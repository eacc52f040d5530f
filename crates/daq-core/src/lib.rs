//! Core types and traits shared by the alignment crates.
//!
//! - [`error`]: the `DaqError` taxonomy
//! - [`observable`]: watch-backed settings with validation
//! - [`frame`]: camera frames and frame-size limits
//! - [`capabilities`]: camera, actuator and beam-scanner traits
//! - [`task`]: the cancellable task primitive every procedure runs on

pub mod capabilities;
pub mod error;
pub mod frame;
pub mod observable;
pub mod task;

pub use error::{AppResult, DaqError};
