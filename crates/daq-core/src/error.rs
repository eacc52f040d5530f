//! Custom error types for the alignment stack.
//!
//! This module defines the primary error type, `DaqError`, shared by every crate in the
//! workspace. Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle the different ways an alignment procedure can end badly.
//!
//! ## Error Hierarchy
//!
//! - **`Cancelled`**: The task observed a cancellation request. Takes precedence over any
//!   other outcome once seen; hardware restoration has already run when it is returned.
//! - **`SpotNotFound`** / **`CannotCenter`**: Terminal alignment failures. They are kept
//!   distinct because the operator remedy differs (reposition the sample vs. refocus by hand).
//! - **`FocusFailed`**: The autofocus escalation could not find a focus peak.
//! - **`BeamCenterNotFound`**: The e-beam centre finder ran out of exposure range.
//! - **`Hardware`**: Wraps `anyhow::Error` coming from capability traits, so driver errors
//!   convert with `?`.
//! - **`Frame*` / `SizeOverflow`**: Frame validation failures (see [`crate::frame`]).

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("spot alignment failure: spot not found")]
    SpotNotFound,

    #[error("spot alignment failure: cannot reach the center")]
    CannotCenter,

    #[error("spot alignment failure: autofocus failed: {0}")]
    FocusFailed(String),

    #[error("failed to locate e-beam spot after exposure time {exposure} s")]
    BeamCenterNotFound { exposure: f64 },

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("task '{0}' panicked")]
    TaskPanicked(String),

    #[error("Frame dimensions {width}x{height} exceed maximum {max_dimension}")]
    FrameDimensionsTooLarge {
        width: u32,
        height: u32,
        max_dimension: u32,
    },

    #[error("Size overflow while computing {context}")]
    SizeOverflow { context: &'static str },

    #[error("Frame of {bytes} bytes exceeds limit of {max_bytes} bytes")]
    FrameTooLarge { bytes: usize, max_bytes: usize },

    #[error("Frame buffer holds {actual} pixels, expected {expected}")]
    FrameSizeMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Hardware(#[from] anyhow::Error),
}

impl DaqError {
    /// True when the error reports an observed cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DaqError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Instrument("stage stalled".to_string());
        assert_eq!(err.to_string(), "Instrument error: stage stalled");
    }

    #[test]
    fn test_alignment_failures_are_distinct() {
        assert_eq!(
            DaqError::SpotNotFound.to_string(),
            "spot alignment failure: spot not found"
        );
        assert_eq!(
            DaqError::CannotCenter.to_string(),
            "spot alignment failure: cannot reach the center"
        );
        assert!(DaqError::FocusFailed("flat curve".into())
            .to_string()
            .contains("autofocus failed"));
    }

    #[test]
    fn test_hardware_error_converts() {
        fn drive() -> AppResult<()> {
            Err(anyhow::anyhow!("axis x faulted"))?;
            Ok(())
        }
        let err = drive().unwrap_err();
        assert!(matches!(err, DaqError::Hardware(_)));
        assert_eq!(err.to_string(), "axis x faulted");
        assert!(!err.is_cancelled());
        assert!(DaqError::Cancelled.is_cancelled());
    }
}
