//! Alignment orchestrator: bring the optical spot to the centre of the CCD.
//!
//! The procedure runs as one cancellable task that owns, in turn, each of its
//! nested tasks:
//!
//! 1. Snapshot camera and beam settings ([`HardwareSnapshot`])
//! 2. Full resolution, no binning, beam in spot mode
//! 3. Exposure tuning (fixed long exposure for background runs, otherwise
//!    stepped up until the SNR clears the threshold)
//! 4. Rough centering pass; on a lost spot, autofocus at coarse binning and
//!    one more rough pass
//! 5. Crop the field of view around the spot
//! 6. Fine centering pass
//!
//! Settings are restored on every exit path when the snapshot is dropped.

use daq_core::capabilities::{Actuator, BeamScanner, Camera, PixelPair};
use daq_core::task::{TaskBuilder, TaskContext, TaskHandle};
use daq_core::{AppResult, DaqError};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::actuator::{ActuatorFacade, CorrectionMode};
use crate::autofocus::AutoFocus;
use crate::centering::{CenteringLoop, CenteringOutcome, Correction};
use crate::config::AlignConfig;
use crate::estimate::TimeModel;
use crate::locator::{SpotLocator, SpotSearch};
use crate::sensor::{measure_snr, BackgroundSubtraction, BaselineFloor, SensorAdapter};
use crate::snapshot::HardwareSnapshot;

/// Instruments and options of one alignment run.
#[derive(Clone)]
pub struct AlignmentRequest {
    /// Camera observing the spot
    pub camera: Arc<dyn Camera>,
    /// Actuator corrected in stage or objective mode
    pub stage: Arc<dyn Actuator>,
    /// Focus actuator used for escalation
    pub focus: Arc<dyn Actuator>,
    /// E-beam scanner
    pub beam: Arc<dyn BeamScanner>,
    /// How corrections are applied
    pub mode: CorrectionMode,
    /// Use the fixed long exposure of background-reference runs
    pub background: bool,
    /// Background removal applied to every frame
    pub subtraction: Arc<dyn BackgroundSubtraction>,
}

impl fmt::Debug for AlignmentRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignmentRequest")
            .field("camera", &self.camera.name())
            .field("stage", &self.stage.name())
            .field("focus", &self.focus.name())
            .field("beam", &self.beam.name())
            .field("mode", &self.mode)
            .field("background", &self.background)
            .field("subtraction", &self.subtraction)
            .finish()
    }
}

impl AlignmentRequest {
    /// Request with baseline subtraction and tuned exposure.
    pub fn new(
        camera: Arc<dyn Camera>,
        stage: Arc<dyn Actuator>,
        focus: Arc<dyn Actuator>,
        beam: Arc<dyn BeamScanner>,
        mode: CorrectionMode,
    ) -> Self {
        Self {
            camera,
            stage,
            focus,
            beam,
            mode,
            background: false,
            subtraction: Arc::new(BaselineFloor),
        }
    }

    /// Mark the run as a background-reference run.
    pub fn with_background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    /// Replace the background subtraction.
    pub fn with_subtraction(mut self, subtraction: Arc<dyn BackgroundSubtraction>) -> Self {
        self.subtraction = subtraction;
        self
    }
}

/// Start aligning the spot. The returned handle resolves to the residual
/// offset measured at the end of the fine pass.
pub fn align_spot(request: AlignmentRequest, config: &AlignConfig) -> TaskHandle<Correction> {
    SpotAligner::new(request, config.clone()).start()
}

/// The alignment procedure with its collaborators wired up.
#[derive(Debug, Clone)]
pub struct SpotAligner {
    request: AlignmentRequest,
    config: AlignConfig,
    sensor: SensorAdapter,
    locator: SpotLocator,
    time: TimeModel,
}

impl SpotAligner {
    /// Aligner for `request` using `config`.
    pub fn new(request: AlignmentRequest, config: AlignConfig) -> Self {
        let sensor = SensorAdapter::new(request.camera.clone(), request.subtraction.clone());
        let locator = SpotLocator::from_config(&config.locator);
        let time = TimeModel::from_config(&config);
        Self {
            request,
            config,
            sensor,
            locator,
            time,
        }
    }

    /// Advisory duration of a full alignment at the initial exposure.
    pub fn estimate(&self) -> std::time::Duration {
        self.time.alignment_time(self.config.exposure.initial_s, None, 1)
    }

    /// Launch the procedure as a task.
    pub fn start(self) -> TaskHandle<Correction> {
        TaskBuilder::new("spot-align")
            .estimate(self.estimate())
            .cancel_timeout(self.config.task.cancel_timeout())
            .spawn(move |ctx| self.run(ctx))
    }

    fn centering(&self) -> CenteringLoop {
        let actuator = ActuatorFacade::new(
            self.request.mode,
            self.request.stage.clone(),
            self.request.beam.clone(),
            self.config.centering.objective_rotation(),
        );
        CenteringLoop::new(
            self.sensor.clone(),
            self.locator.clone(),
            actuator,
            self.time,
            &self.config.centering,
        )
    }

    async fn run(self, ctx: TaskContext) -> AppResult<Correction> {
        let camera = &self.request.camera;
        let beam = &self.request.beam;
        info!("Starting spot alignment ({})", self.request.mode);

        let _snapshot = HardwareSnapshot::capture(camera.clone(), beam.clone());

        ctx.checkpoint()?;
        let (_, max_res) = camera.resolution_range();
        camera.binning().set((1, 1))?;
        camera.resolution().set(max_res)?;
        camera.exposure_time().set(self.config.exposure.initial_s)?;
        beam.scale().set((1.0, 1.0))?;
        beam.resolution().set((1, 1))?;

        let exposure = self.tune_exposure(&ctx).await?;
        ctx.set_remaining(self.time.alignment_time(exposure, None, 1));

        let centering = self.centering();
        let rough_steps = self.config.centering.rough_steps;

        debug!("Rough centering pass");
        let mut rough = ctx.join(centering.center_spot(rough_steps)).await?;
        if rough.correction().is_none() {
            info!("Spot not found, trying autofocus");
            self.escalate(&ctx).await?;
            ctx.checkpoint()?;
            camera.binning().set((1, 1))?;
            rough = ctx.join(centering.center_spot(rough_steps)).await?;
        }
        let Some(found) = rough.correction().copied() else {
            return Err(DaqError::SpotNotFound);
        };
        ctx.set_remaining(self.time.alignment_time(exposure, Some(found.distance), 0));

        ctx.checkpoint()?;
        crop_fov(&self.sensor, &self.locator, self.config.fov.margin_px).await?;

        debug!("Fine centering pass");
        ctx.checkpoint()?;
        let fine = ctx
            .join(centering.center_spot(self.config.centering.fine_steps))
            .await?;
        match fine {
            CenteringOutcome::Converged(c) => {
                info!("Spot aligned to {:.2} um", c.distance * 1e6);
                Ok(c)
            }
            CenteringOutcome::Exhausted(Some(c)) => {
                warn!(
                    "Fine pass used all {} steps, spot still {:.2} um off",
                    self.config.centering.fine_steps,
                    c.distance * 1e6
                );
                Ok(c)
            }
            CenteringOutcome::Exhausted(None) | CenteringOutcome::SpotLost => {
                Err(DaqError::CannotCenter)
            }
        }
    }

    /// Pick the exposure; returns the exposure time in seconds.
    async fn tune_exposure(&self, ctx: &TaskContext) -> AppResult<f64> {
        let cfg = &self.config.exposure;
        let exposure = self.request.camera.exposure_time();

        if self.request.background {
            ctx.checkpoint()?;
            exposure.set(cfg.background_s)?;
            debug!("Background run, exposure fixed at {} s", cfg.background_s);
            return Ok(cfg.background_s);
        }

        ctx.checkpoint()?;
        let mut snr = measure_snr(&self.sensor.acquire_raw().await?);
        let mut et = exposure.get();
        while snr < cfg.snr_threshold && et < cfg.max_s - 1e-9 {
            et += cfg.increment_s;
            ctx.checkpoint()?;
            exposure.set(et)?;
            ctx.checkpoint()?;
            snr = measure_snr(&self.sensor.acquire_raw().await?);
            debug!("SNR {:.2} at exposure {:.2} s", snr, et);
        }
        debug!("Using exposure {:.2} s (SNR {:.2})", et, snr);
        Ok(et)
    }

    /// Autofocus at coarse binning. Driver failures count as a failed focus.
    async fn escalate(&self, ctx: &TaskContext) -> AppResult<()> {
        let camera = &self.request.camera;
        let (max_x, max_y) = camera.max_binning();
        let b = self.config.autofocus.binning;

        ctx.checkpoint()?;
        camera.binning().set((b.min(max_x), b.min(max_y)))?;

        let autofocus = AutoFocus::new(
            self.sensor.clone(),
            self.request.focus.clone(),
            self.config.autofocus.clone(),
            self.time,
        );
        let result = ctx
            .join(autofocus.auto_focus())
            .await
            .map_err(|e| match e {
                DaqError::Hardware(err) => DaqError::FocusFailed(err.to_string()),
                other => other,
            })?;
        debug!("Focus at {:.1} um", result.position * 1e6);
        Ok(())
    }
}

/// Shrink the field of view around the spot.
///
/// Acquires a frame, locates the spot and sets the camera resolution to twice
/// the larger offset plus `margin_px`, clamped to the supported range, at
/// binning 1. Returns the new resolution, or `None` (camera untouched) when
/// the spot is not found.
pub async fn crop_fov(
    sensor: &SensorAdapter,
    locator: &SpotLocator,
    margin_px: u32,
) -> AppResult<Option<PixelPair>> {
    let camera = sensor.camera();
    let frame = sensor.acquire_corrected().await?;

    let centroid = match locator.locate(&frame) {
        SpotSearch::Found(c) => c,
        other => {
            warn!("Cannot crop field of view: {:?}", other);
            return Ok(None);
        }
    };

    // Offset in unbinned pixels
    let binning = camera.binning().get();
    let (cx, cy) = frame.center();
    let dx = (centroid.x - cx).abs() * f64::from(binning.0);
    let dy = (centroid.y - cy).abs() * f64::from(binning.1);
    let size = ((2.0 * dx.max(dy)).ceil() as u32).saturating_add(margin_px);

    let (min_res, max_res) = camera.resolution_range();
    let resolution = (
        size.clamp(min_res.0, max_res.0),
        size.clamp(min_res.1, max_res.1),
    );
    camera.binning().set((1, 1))?;
    camera.resolution().set(resolution)?;
    debug!("Cropped field of view to {:?}", resolution);
    Ok(Some(resolution))
}
