//! Hardware capability traits.
//!
//! The alignment code never talks to a concrete driver. It works against these
//! capabilities, each of which exposes its settings as [`Observable`] values
//! with synchronous setters plus the (possibly slow) async operations:
//!
//! - [`Camera`]: settable exposure, binning and resolution; frame acquisition
//! - [`Actuator`]: relative and absolute moves on named axes
//! - [`BeamScanner`]: settable scale, resolution and translation
//!
//! All traits require `Send + Sync` so devices can be shared between the tasks
//! of one alignment tree behind an `Arc`.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::frame::Frame;
use crate::observable::Observable;

/// `(x, y)` pair in pixels, used for binning and resolution.
pub type PixelPair = (u32, u32);

/// Actuator axis identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Axis {
    /// Sample stage X
    X,
    /// Sample stage Y
    Y,
    /// Focus
    Z,
    /// Lens alignment axis "a"
    A,
    /// Lens alignment axis "b"
    B,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
            Axis::A => "a",
            Axis::B => "b",
        };
        f.write_str(name)
    }
}

/// One move command: a distance (or target) in metres per axis.
pub type AxisMove = Vec<(Axis, f64)>;

/// Camera capability.
#[async_trait]
pub trait Camera: Send + Sync {
    /// Device identifier
    fn name(&self) -> &str;

    /// Exposure time in seconds
    fn exposure_time(&self) -> &Observable<f64>;

    /// Binning factors (x, y)
    fn binning(&self) -> &Observable<PixelPair>;

    /// Output resolution in (binned) pixels
    fn resolution(&self) -> &Observable<PixelPair>;

    /// Smallest and largest supported resolution at binning 1
    fn resolution_range(&self) -> (PixelPair, PixelPair);

    /// Largest supported binning
    fn max_binning(&self) -> PixelPair;

    /// Take one exposure with the current settings.
    ///
    /// Blocks (asynchronously) for at least the exposure time. The returned
    /// frame carries its pixel size and baseline.
    async fn acquire(&self) -> Result<Frame>;
}

/// Motion capability (stage, lens alignment, focus).
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Device identifier
    fn name(&self) -> &str;

    /// Axes this actuator can drive
    fn axes(&self) -> &[Axis];

    /// Move each listed axis by the given distance; returns once settled.
    async fn move_rel(&self, shift: &[(Axis, f64)]) -> Result<()>;

    /// Move each listed axis to the given position; returns once settled.
    async fn move_abs(&self, target: &[(Axis, f64)]) -> Result<()>;

    /// Current position of `axis`.
    async fn position(&self, axis: Axis) -> Result<f64>;
}

/// E-beam scanner capability.
pub trait BeamScanner: Send + Sync {
    /// Device identifier
    fn name(&self) -> &str;

    /// Scan scale (x, y), in pixels of the base grid
    fn scale(&self) -> &Observable<(f64, f64)>;

    /// Scan resolution; `(1, 1)` is spot mode
    fn resolution(&self) -> &Observable<PixelPair>;

    /// Beam shift (x, y) in scan pixels
    fn translation(&self) -> &Observable<(f64, f64)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_display() {
        let names: Vec<String> = [Axis::X, Axis::Y, Axis::Z, Axis::A, Axis::B]
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(names, ["x", "y", "z", "a", "b"]);
    }
}
