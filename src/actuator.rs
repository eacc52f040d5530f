//! Actuator facade: one relative-move operation over three correction modes.
//!
//! | Mode              | Device          | Command for a spot offset `t` (image, m) |
//! |-------------------|-----------------|------------------------------------------|
//! | `StageMove`       | XY stage        | `x = -t.x`, `y = t.y`                    |
//! | `ObjectiveMove`   | lens stage a/b  | `R(theta) * (t.x, -t.y)` on axes (b, a)   |
//! | `BeamShift`       | e-beam scanner  | `translation += -t_px`                   |
//!
//! Image y grows downwards while physical y grows upwards, hence the sign
//! flips on y.

use daq_core::capabilities::{Actuator, Axis, AxisMove, BeamScanner};
use daq_core::task::{launch, TaskHandle};
use daq_core::AppResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Advisory duration of one move task.
const MOVE_ESTIMATE: Duration = Duration::from_millis(500);

/// How the spot is brought to the centre.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionMode {
    /// Translate the sample stage
    StageMove,
    /// Shift the e-beam
    BeamShift,
    /// Translate the objective lens through its rotated a/b axes
    #[default]
    ObjectiveMove,
}

impl fmt::Display for CorrectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CorrectionMode::StageMove => "Stage move",
            CorrectionMode::BeamShift => "Beam shift",
            CorrectionMode::ObjectiveMove => "Objective lens move",
        };
        f.write_str(name)
    }
}

/// Offset of the spot from the optical centre.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Offset {
    /// In (binned) pixels
    pub pixels: (f64, f64),
    /// In metres
    pub metres: (f64, f64),
}

impl Offset {
    /// Offset of `pixels` on a sensor with the given pixel size.
    pub fn from_pixels(pixels: (f64, f64), pixel_size: (f64, f64)) -> Self {
        Self {
            pixels,
            metres: (pixels.0 * pixel_size.0, pixels.1 * pixel_size.1),
        }
    }

    /// Euclidean distance in metres.
    pub fn distance(&self) -> f64 {
        self.metres.0.hypot(self.metres.1)
    }
}

/// Rotation from the lens frame to the a/b axes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LensTransform {
    sin: f64,
    cos: f64,
}

impl LensTransform {
    /// Transform for a rotation of `rotation` radians.
    pub fn new(rotation: f64) -> Self {
        let (sin, cos) = rotation.sin_cos();
        Self { sin, cos }
    }

    /// Rotate `(x, y)` and map x to axis b, y to axis a.
    pub fn apply(&self, (x, y): (f64, f64)) -> AxisMove {
        let b = self.cos * x - self.sin * y;
        let a = self.sin * x + self.cos * y;
        vec![(Axis::B, b), (Axis::A, a)]
    }
}

/// What one correction does to the hardware.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Relative move of the stage
    Move(AxisMove),
    /// Relative change of the beam translation, scan pixels
    Shift((f64, f64)),
}

/// Uniform relative move over the selected correction mode.
#[derive(Clone)]
pub struct ActuatorFacade {
    mode: CorrectionMode,
    stage: Arc<dyn Actuator>,
    beam: Arc<dyn BeamScanner>,
    lens: LensTransform,
}

impl fmt::Debug for ActuatorFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActuatorFacade")
            .field("mode", &self.mode)
            .field("stage", &self.stage.name())
            .field("beam", &self.beam.name())
            .finish()
    }
}

impl ActuatorFacade {
    /// Facade over `stage` and `beam`; `rotation` (radians) is used in
    /// objective-move mode.
    pub fn new(
        mode: CorrectionMode,
        stage: Arc<dyn Actuator>,
        beam: Arc<dyn BeamScanner>,
        rotation: f64,
    ) -> Self {
        Self {
            mode,
            stage,
            beam,
            lens: LensTransform::new(rotation),
        }
    }

    /// Selected mode.
    pub fn mode(&self) -> CorrectionMode {
        self.mode
    }

    /// Command that cancels `offset`.
    pub fn command(&self, offset: &Offset) -> Command {
        let (tx, ty) = offset.metres;
        match self.mode {
            CorrectionMode::StageMove => Command::Move(vec![(Axis::X, -tx), (Axis::Y, ty)]),
            CorrectionMode::ObjectiveMove => Command::Move(self.lens.apply((tx, -ty))),
            CorrectionMode::BeamShift => Command::Shift((-offset.pixels.0, -offset.pixels.1)),
        }
    }

    /// Apply the correction for `offset` as a task.
    pub fn move_rel(&self, offset: &Offset) -> TaskHandle<()> {
        let command = self.command(offset);
        let stage = self.stage.clone();
        let beam = self.beam.clone();
        launch("actuator-move", MOVE_ESTIMATE, move |ctx| async move {
            ctx.checkpoint()?;
            apply(command, stage.as_ref(), beam.as_ref()).await
        })
    }
}

async fn apply(command: Command, stage: &dyn Actuator, beam: &dyn BeamScanner) -> AppResult<()> {
    match command {
        Command::Move(shift) => {
            debug!("{}: relative move {:?}", stage.name(), shift);
            stage.move_rel(&shift).await?;
        }
        Command::Shift((dx, dy)) => {
            let translation = beam.translation();
            let (tx, ty) = translation.get();
            debug!("{}: beam shift by ({dx:.2}, {dy:.2}) px", beam.name());
            translation.set((tx + dx, ty + dy))?;
        }
    }
    Ok(())
}
