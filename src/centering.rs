//! Convergence controller: the center-the-spot loop.
//!
//! Each iteration samples a corrected frame, locates the spot and either stops
//! or issues exactly one corrective move, waiting for it before sampling again.
//!
//! ```text
//! Sampling ──► Locating ──► Converged   distance <= margin
//!    ▲            │   ├───► Exhausted   step budget used up
//!    │            │   └───► SpotLost    no spot in the frame
//!    └─ Correcting ◄┘
//! ```
//!
//! The margin is `max(margin_pixels * pixel_size_x, min_actuator_step)`: the
//! camera cannot resolve better than about a pixel and the actuators cannot
//! move less than their minimum step. An ambiguous frame uses up a step
//! without moving.

use daq_core::task::{launch, TaskContext, TaskHandle};
use daq_core::AppResult;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::actuator::{ActuatorFacade, Offset};
use crate::config::CenteringConfig;
use crate::estimate::TimeModel;
use crate::locator::{SpotLocator, SpotSearch};
use crate::sensor::SensorAdapter;

/// Last measured position of the spot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    /// Distance from the optical centre, metres
    pub distance: f64,
    /// Offset from the optical centre
    pub vector: Offset,
}

/// How a centering run ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CenteringOutcome {
    /// Spot within the margin
    Converged(Correction),
    /// Step budget used up; the last successful measurement, if any
    Exhausted(Option<Correction>),
    /// No spot in the frame
    SpotLost,
}

impl CenteringOutcome {
    /// The measured correction, if the spot was seen.
    pub fn correction(&self) -> Option<&Correction> {
        match self {
            CenteringOutcome::Converged(c) | CenteringOutcome::Exhausted(Some(c)) => Some(c),
            _ => None,
        }
    }

    /// True for `Converged`.
    pub fn is_converged(&self) -> bool {
        matches!(self, CenteringOutcome::Converged(_))
    }
}

/// Everything a centering run needs.
#[derive(Debug, Clone)]
pub struct CenteringLoop {
    sensor: SensorAdapter,
    locator: SpotLocator,
    actuator: ActuatorFacade,
    time: TimeModel,
    margin_pixels: f64,
    min_step: f64,
}

impl CenteringLoop {
    /// Loop over the given collaborators.
    pub fn new(
        sensor: SensorAdapter,
        locator: SpotLocator,
        actuator: ActuatorFacade,
        time: TimeModel,
        config: &CenteringConfig,
    ) -> Self {
        Self {
            sensor,
            locator,
            actuator,
            time,
            margin_pixels: config.margin_pixels,
            min_step: config.min_actuator_step,
        }
    }

    /// Convergence margin for a frame with the given x pixel size.
    pub fn margin(&self, pixel_size_x: f64) -> f64 {
        (self.margin_pixels * pixel_size_x).max(self.min_step)
    }

    /// Run up to `max_steps` corrective moves as a task.
    pub fn center_spot(&self, max_steps: usize) -> TaskHandle<CenteringOutcome> {
        let exposure = self.sensor.camera().exposure_time().get();
        let estimate = self.time.center_time(exposure, None);
        let this = self.clone();
        launch("spot-center", estimate, move |ctx| this.run(ctx, max_steps))
    }

    async fn run(self, ctx: TaskContext, max_steps: usize) -> AppResult<CenteringOutcome> {
        debug!("Aligning spot ({}, max {} steps)...", self.actuator.mode(), max_steps);
        let mut steps = 0;
        let mut last: Option<Correction> = None;

        loop {
            ctx.checkpoint()?;
            let frame = self.sensor.acquire_corrected().await?;
            ctx.checkpoint()?;

            let centroid = match self.locator.locate(&frame) {
                SpotSearch::Found(c) => c,
                SpotSearch::NotFound => {
                    debug!("Spot not found after {} steps", steps);
                    return Ok(CenteringOutcome::SpotLost);
                }
                SpotSearch::Ambiguous(n) => {
                    warn!("{} candidate spots, skipping frame", n);
                    if steps >= max_steps {
                        return Ok(CenteringOutcome::Exhausted(last));
                    }
                    steps += 1;
                    continue;
                }
            };

            let (cx, cy) = frame.center();
            let vector = Offset::from_pixels((centroid.x - cx, centroid.y - cy), frame.pixel_size);
            let correction = Correction {
                distance: vector.distance(),
                vector,
            };
            debug!(
                "Spot at ({:.1}, {:.1}) px, {:.2} um from centre",
                centroid.x,
                centroid.y,
                correction.distance * 1e6
            );

            if correction.distance <= self.margin(frame.pixel_size.0) {
                info!("Spot centred after {} steps ({:.2} um)", steps, correction.distance * 1e6);
                return Ok(CenteringOutcome::Converged(correction));
            }
            if steps >= max_steps {
                debug!("Step budget of {} used up", max_steps);
                return Ok(CenteringOutcome::Exhausted(Some(correction)));
            }

            ctx.checkpoint()?;
            ctx.join(self.actuator.move_rel(&correction.vector)).await?;
            steps += 1;
            last = Some(correction);
            ctx.set_remaining(self.time.center_time(frame.exposure_time, Some(correction.distance)));
        }
    }
}
