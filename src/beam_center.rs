//! E-beam centre finder.
//!
//! Puts the beam in spot mode and integrates camera frames with doubling
//! exposure until the spot shows up. There is no iteration on the actuators,
//! so this is much faster than [`align_spot`](crate::alignment::align_spot)
//! but only reports where the spot is.

use daq_core::capabilities::{BeamScanner, Camera};
use daq_core::frame::Frame;
use daq_core::task::{launch, TaskContext, TaskHandle};
use daq_core::{AppResult, DaqError};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::BeamCenterConfig;
use crate::locator::{SpotLocator, SpotSearch};
use crate::sensor::SensorAdapter;
use crate::snapshot::HardwareSnapshot;

/// Locate the e-beam spot on the CCD.
///
/// Resolves to the spot position relative to the image centre in metres,
/// with the sign convention of the stage: x flipped, y as in the image.
///
/// ```
/// use daq_align::beam_center::find_ebeam_center;
/// use daq_align::config::BeamCenterConfig;
/// use daq_driver_mock::{SampleConfig, SimulatedMicroscope};
///
/// # tokio_test::block_on(async {
/// let scope = SimulatedMicroscope::new(SampleConfig {
///     time_scale: 0.0,
///     ..SampleConfig::default()
/// });
/// let (x, y) = find_ebeam_center(scope.camera.clone(), scope.beam.clone(), &BeamCenterConfig::default())
///     .result()
///     .await?;
/// assert!(x.abs() < 1e-6 && y.abs() < 1e-6);
/// # Ok::<(), daq_align::DaqError>(())
/// # }).unwrap();
/// ```
pub fn find_ebeam_center(
    camera: Arc<dyn Camera>,
    beam: Arc<dyn BeamScanner>,
    config: &BeamCenterConfig,
) -> TaskHandle<(f64, f64)> {
    let config = config.clone();
    let mut exposure = config.initial_exposure_s;
    let mut total = 0.0;
    while exposure <= config.max_exposure_s {
        total += exposure;
        exposure *= 2.0;
    }
    launch(
        "ebeam-center",
        std::time::Duration::try_from_secs_f64(total).unwrap_or_default(),
        move |ctx| run(ctx, camera, beam, config),
    )
}

async fn run(
    ctx: TaskContext,
    camera: Arc<dyn Camera>,
    beam: Arc<dyn BeamScanner>,
    config: BeamCenterConfig,
) -> AppResult<(f64, f64)> {
    let _snapshot = HardwareSnapshot::capture(camera.clone(), beam.clone());

    ctx.checkpoint()?;
    let (_, max_res) = camera.resolution_range();
    camera.binning().set((1, 1))?;
    camera.resolution().set(max_res)?;
    beam.resolution().set((1, 1))?;

    let sensor = SensorAdapter::with_baseline(camera.clone());
    let locator = SpotLocator::default().with_sensitivity(config.sensitivity);
    let mut accumulated: Option<Frame> = None;
    let mut exposure = config.initial_exposure_s;

    while exposure <= config.max_exposure_s {
        ctx.checkpoint()?;
        camera.exposure_time().set(exposure)?;
        ctx.checkpoint()?;
        let frame = sensor.acquire_corrected().await?;
        let frame = match accumulated.take() {
            Some(mut sum) if sum.width() == frame.width() && sum.height() == frame.height() => {
                sum.accumulate(&frame)?;
                sum
            }
            _ => frame,
        };

        match locator.locate(&frame) {
            SpotSearch::Found(c) => {
                let (cx, cy) = frame.center();
                let (px, py) = frame.pixel_size;
                let center = (-(c.x - cx) * px, (c.y - cy) * py);
                info!(
                    "E-beam spot at ({:.2}, {:.2}) um after {} s exposure",
                    center.0 * 1e6,
                    center.1 * 1e6,
                    exposure
                );
                return Ok(center);
            }
            SpotSearch::NotFound => debug!("No e-beam spot at {} s", exposure),
            SpotSearch::Ambiguous(n) => {
                warn!("{} candidate e-beam spots, giving up", n);
                break;
            }
        }
        accumulated = Some(frame);
        exposure *= 2.0;
    }

    Err(DaqError::BeamCenterNotFound { exposure })
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_driver_mock::{SampleConfig, SimulatedMicroscope};

    fn scope(brightness: f64) -> SimulatedMicroscope {
        SimulatedMicroscope::new(SampleConfig {
            time_scale: 0.0,
            brightness,
            ..SampleConfig::default()
        })
    }

    #[tokio::test]
    async fn test_finds_spot_and_restores_settings() {
        let scope = scope(2000.0);
        scope.sample.set_spot_offset((12e-6, 7e-6));
        scope.camera.binning().set((4, 4)).unwrap();
        scope.camera.exposure_time().set(0.5).unwrap();

        let (x, y) = find_ebeam_center(
            scope.camera.clone(),
            scope.beam.clone(),
            &BeamCenterConfig::default(),
        )
        .result()
        .await
        .unwrap();

        assert!((x + 12e-6).abs() < 0.5e-6, "{x}");
        assert!((y - 7e-6).abs() < 0.5e-6, "{y}");
        // Bright spot: found on the first frame
        assert_eq!(scope.camera.frame_count(), 1);
        assert_eq!(scope.camera.binning().get(), (4, 4));
        assert_eq!(scope.camera.exposure_time().get(), 0.5);
        assert_eq!(scope.beam.resolution().get(), (512, 512));
    }

    #[tokio::test]
    async fn test_faint_spot_needs_longer_exposure() {
        // Peak of 40 counts/s: 4 at 0.1 s, 12 after accumulating 0.2 s
        let scope = scope(40.0);

        let result = find_ebeam_center(
            scope.camera.clone(),
            scope.beam.clone(),
            &BeamCenterConfig::default(),
        )
        .result()
        .await;

        assert!(result.is_ok(), "{result:?}");
        assert!(scope.camera.frame_count() > 1);
    }

    #[tokio::test]
    async fn test_many_spots_give_up_after_one_frame() {
        // Ten decoys plus the real spot, one more than the locator accepts
        let decoys = (0..10)
            .map(|i| (-90e-6 + 45e-6 * (i % 5) as f64, if i < 5 { -60e-6 } else { 60e-6 }))
            .collect();
        let scope = SimulatedMicroscope::new(SampleConfig {
            time_scale: 0.0,
            decoys,
            ..SampleConfig::default()
        });

        let err = find_ebeam_center(
            scope.camera.clone(),
            scope.beam.clone(),
            &BeamCenterConfig::default(),
        )
        .result()
        .await
        .unwrap_err();

        assert_eq!(scope.camera.frame_count(), 1);
        match err {
            DaqError::BeamCenterNotFound { exposure } => assert!((exposure - 0.1).abs() < 1e-9),
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(scope.beam.resolution().get(), (512, 512));
    }

    #[tokio::test]
    async fn test_no_spot_reports_last_exposure() {
        let scope = scope(2000.0);
        scope.sample.set_spot_visible(false);

        let err = find_ebeam_center(
            scope.camera.clone(),
            scope.beam.clone(),
            &BeamCenterConfig::default(),
        )
        .result()
        .await
        .unwrap_err();

        // 0.1, 0.2, 0.4, 0.8, 1.6
        assert_eq!(scope.camera.frame_count(), 5);
        match err {
            DaqError::BeamCenterNotFound { exposure } => assert!((exposure - 3.2).abs() < 1e-9),
            other => panic!("unexpected error {other}"),
        }
    }
}
