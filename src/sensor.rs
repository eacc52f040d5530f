//! Sensor adapter: background-corrected frames from a camera.
//!
//! The correction itself is pluggable through [`BackgroundSubtraction`]:
//! [`BaselineFloor`] removes the sensor dark level, [`ReferenceFrame`]
//! removes a previously captured background image.

use daq_core::capabilities::Camera;
use daq_core::frame::Frame;
use daq_core::AppResult;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// `(frame) -> corrected frame`, applied to every acquisition.
pub trait BackgroundSubtraction: Send + Sync + fmt::Debug {
    /// Remove the background from `frame`.
    fn subtract(&self, frame: Frame) -> Frame;
}

/// Subtract the frame's own baseline and clamp at zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaselineFloor;

impl BackgroundSubtraction for BaselineFloor {
    fn subtract(&self, mut frame: Frame) -> Frame {
        let floor = frame.baseline;
        for v in frame.pixels_mut() {
            *v = (*v - floor).max(0.0);
        }
        frame.baseline = 0.0;
        frame
    }
}

/// Subtract a captured background image pixel-wise.
///
/// Frames whose size differs from the reference (e.g. after a crop) fall back
/// to [`BaselineFloor`].
#[derive(Debug, Clone)]
pub struct ReferenceFrame {
    background: Frame,
}

impl ReferenceFrame {
    /// Use `background` as the reference.
    pub fn new(background: Frame) -> Self {
        Self { background }
    }

    /// Take one exposure with the camera's current settings as the reference.
    pub async fn capture(camera: &dyn Camera) -> AppResult<Self> {
        debug!("{}: capturing background reference", camera.name());
        Ok(Self::new(camera.acquire().await?))
    }

    /// The reference image.
    pub fn background(&self) -> &Frame {
        &self.background
    }
}

impl BackgroundSubtraction for ReferenceFrame {
    fn subtract(&self, mut frame: Frame) -> Frame {
        let bg = &self.background;
        if bg.width() != frame.width() || bg.height() != frame.height() {
            warn!(
                "Background reference is {}x{}, frame is {}x{}; subtracting baseline only",
                bg.width(),
                bg.height(),
                frame.width(),
                frame.height()
            );
            return BaselineFloor.subtract(frame);
        }
        // Reference counts scale with exposure
        let ratio = if bg.exposure_time > 0.0 && frame.exposure_time > 0.0 {
            frame.exposure_time / bg.exposure_time
        } else {
            1.0
        };
        for (v, b) in frame.pixels_mut().iter_mut().zip(bg.pixels()) {
            let dark = bg.baseline + (b - bg.baseline) * ratio;
            *v = (*v - dark).max(0.0);
        }
        frame.baseline = 0.0;
        frame
    }
}

/// Camera plus background correction.
#[derive(Clone)]
pub struct SensorAdapter {
    camera: Arc<dyn Camera>,
    background: Arc<dyn BackgroundSubtraction>,
}

impl fmt::Debug for SensorAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorAdapter")
            .field("camera", &self.camera.name())
            .field("background", &self.background)
            .finish()
    }
}

impl SensorAdapter {
    /// Adapter over `camera` using `background`.
    pub fn new(camera: Arc<dyn Camera>, background: Arc<dyn BackgroundSubtraction>) -> Self {
        Self { camera, background }
    }

    /// Adapter subtracting the sensor baseline only.
    pub fn with_baseline(camera: Arc<dyn Camera>) -> Self {
        Self::new(camera, Arc::new(BaselineFloor))
    }

    /// Underlying camera.
    pub fn camera(&self) -> &Arc<dyn Camera> {
        &self.camera
    }

    /// One exposure, uncorrected.
    pub async fn acquire_raw(&self) -> AppResult<Frame> {
        Ok(self.camera.acquire().await?)
    }

    /// One exposure with the background removed.
    pub async fn acquire_corrected(&self) -> AppResult<Frame> {
        let frame = self.acquire_raw().await?;
        Ok(self.background.subtract(frame))
    }
}

/// Signal-to-noise ratio of a raw frame.
///
/// Pixels at or above twice the baseline are signal, the rest noise:
/// `(mean(signal) - baseline) / std(noise)`. Returns 0 when either population
/// is empty or a term is not positive.
pub fn measure_snr(frame: &Frame) -> f64 {
    let bl = frame.baseline;
    let (signal, noise): (Vec<f64>, Vec<f64>) =
        frame.pixels().iter().partition(|&&v| v >= 2.0 * bl);

    if signal.is_empty() || noise.is_empty() {
        return 0.0;
    }
    let ms = signal.iter().sum::<f64>() / signal.len() as f64 - bl;
    let mean_noise = noise.iter().sum::<f64>() / noise.len() as f64;
    let sdn = (noise.iter().map(|v| (v - mean_noise).powi(2)).sum::<f64>() / noise.len() as f64).sqrt();

    if ms <= 0.0 || sdn <= 0.0 {
        return 0.0;
    }
    ms / sdn
}
