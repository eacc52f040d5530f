//! Simulated CCD.

use anyhow::Result;
use async_trait::async_trait;
use daq_core::capabilities::{Camera, PixelPair};
use daq_core::frame::Frame;
use daq_core::observable::{pair_range, Observable};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::sample::SimulatedSample;

/// Mock camera imaging the simulated sample
///
/// Each acquisition takes `exposure * time_scale` plus the scaled readout
/// time, and renders the spot with the current binning and resolution.
///
/// # Example
///
/// ```rust,ignore
/// let camera = MockCamera::new("ccd", sample.clone());
/// camera.binning().set((8, 8))?;
/// let frame = camera.acquire().await?; // 32 x 32 on a 256 px sensor
/// ```
#[derive(Debug)]
pub struct MockCamera {
    name: String,
    sample: Arc<SimulatedSample>,
    exposure_time: Observable<f64>,
    binning: Observable<PixelPair>,
    resolution: Observable<PixelPair>,
    frame_count: AtomicU64,
}

impl MockCamera {
    /// Camera over `sample`, full resolution, binning 1, 100 ms exposure.
    pub fn new(name: impl Into<String>, sample: Arc<SimulatedSample>) -> Self {
        let cfg = sample.config();
        let (min_res, max_res) = (cfg.min_resolution, cfg.sensor);
        let max_binning = cfg.max_binning;
        Self {
            name: name.into(),
            exposure_time: Observable::new("exposure_time", 0.1)
                .with_units("s")
                .with_range(1e-6, 10.0),
            binning: Observable::new("binning", (1, 1))
                .with_validator(pair_range((1, 1), max_binning)),
            resolution: Observable::new("resolution", max_res)
                .with_units("px")
                .with_validator(pair_range(min_res, max_res)),
            sample,
            frame_count: AtomicU64::new(0),
        }
    }

    /// Number of frames acquired so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Camera for MockCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn exposure_time(&self) -> &Observable<f64> {
        &self.exposure_time
    }

    fn binning(&self) -> &Observable<PixelPair> {
        &self.binning
    }

    fn resolution(&self) -> &Observable<PixelPair> {
        &self.resolution
    }

    fn resolution_range(&self) -> (PixelPair, PixelPair) {
        let cfg = self.sample.config();
        (cfg.min_resolution, cfg.sensor)
    }

    fn max_binning(&self) -> PixelPair {
        self.sample.config().max_binning
    }

    async fn acquire(&self) -> Result<Frame> {
        let exposure = self.exposure_time.get();
        let binning = self.binning.get();
        let resolution = self.resolution.get();
        let seq = self.frame_count.fetch_add(1, Ordering::SeqCst) + 1;

        let cfg = self.sample.config();
        let delay = cfg.scaled(Duration::from_secs_f64(exposure) + cfg.readout_time);
        debug!(
            "{}: frame #{} ({}s, binning {:?}, resolution {:?})",
            self.name, seq, exposure, binning, resolution
        );
        sleep(delay).await;

        self.sample.render(exposure, binning, resolution, seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleConfig;

    fn fast_sample() -> Arc<SimulatedSample> {
        Arc::new(SimulatedSample::new(SampleConfig {
            time_scale: 0.0,
            ..SampleConfig::default()
        }))
    }

    #[tokio::test]
    async fn test_acquire_counts_frames() {
        let camera = MockCamera::new("ccd", fast_sample());
        camera.acquire().await.unwrap();
        camera.acquire().await.unwrap();
        assert_eq!(camera.frame_count(), 2);
    }

    #[tokio::test]
    async fn test_acquire_follows_settings() {
        let camera = MockCamera::new("ccd", fast_sample());
        camera.binning().set((4, 4)).unwrap();
        camera.exposure_time().set(0.25).unwrap();

        let frame = camera.acquire().await.unwrap();
        assert_eq!((frame.width(), frame.height()), (64, 64));
        assert_eq!(frame.exposure_time, 0.25);
        assert_eq!(frame.baseline, 100.0);
    }

    #[tokio::test]
    async fn test_settings_are_validated() {
        let camera = MockCamera::new("ccd", fast_sample());
        assert!(camera.binning().set((32, 32)).is_err());
        assert!(camera.resolution().set((512, 512)).is_err());
        assert!(camera.exposure_time().set(-1.0).is_err());
        assert_eq!(camera.resolution().get(), (256, 256));
    }

    #[tokio::test]
    async fn test_crop_is_centred() {
        let sample = fast_sample();
        sample.beam().resolution.set((1, 1)).unwrap();
        sample.set_spot_offset((0.0, 0.0));
        let camera = MockCamera::new("ccd", sample);
        camera.resolution().set((40, 40)).unwrap();

        let frame = camera.acquire().await.unwrap();
        let (x, y) = (frame.width() / 2, frame.height() / 2);
        let centre = frame.get(x, y).unwrap();
        assert!(centre > frame.get(0, 0).unwrap() + 100.0);
    }
}
