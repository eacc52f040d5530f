//! Scoped save/restore of camera and e-beam settings.

use daq_core::capabilities::{BeamScanner, Camera, PixelPair};
use daq_core::observable::Observable;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, warn};

/// Camera and beam settings captured on creation, restored on drop.
///
/// Restoration runs exactly once, whichever way the owning scope is left:
/// return, `?` or the task future being unwound after cancellation. The
/// restore order is camera binning, exposure, resolution, then beam scale and
/// resolution.
pub struct HardwareSnapshot {
    camera: Arc<dyn Camera>,
    beam: Arc<dyn BeamScanner>,
    binning: PixelPair,
    exposure: f64,
    resolution: PixelPair,
    scale: (f64, f64),
    beam_resolution: PixelPair,
}

impl std::fmt::Debug for HardwareSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareSnapshot")
            .field("binning", &self.binning)
            .field("exposure", &self.exposure)
            .field("resolution", &self.resolution)
            .field("scale", &self.scale)
            .field("beam_resolution", &self.beam_resolution)
            .finish()
    }
}

impl HardwareSnapshot {
    /// Record the current settings of `camera` and `beam`.
    pub fn capture(camera: Arc<dyn Camera>, beam: Arc<dyn BeamScanner>) -> Self {
        let snapshot = Self {
            binning: camera.binning().get(),
            exposure: camera.exposure_time().get(),
            resolution: camera.resolution().get(),
            scale: beam.scale().get(),
            beam_resolution: beam.resolution().get(),
            camera,
            beam,
        };
        debug!("Saved hardware settings {:?}", snapshot);
        snapshot
    }

    fn restore(&self) {
        restore(self.camera.binning(), self.binning);
        restore(self.camera.exposure_time(), self.exposure);
        restore(self.camera.resolution(), self.resolution);
        restore(self.beam.scale(), self.scale);
        restore(self.beam.resolution(), self.beam_resolution);
        debug!("Restored hardware settings");
    }
}

impl Drop for HardwareSnapshot {
    fn drop(&mut self) {
        self.restore();
    }
}

fn restore<T>(setting: &Observable<T>, value: T)
where
    T: Clone + Send + Sync + Debug + 'static,
{
    if let Err(e) = setting.set(value.clone()) {
        warn!("Failed to restore {} to {:?}: {}", setting.name(), value, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_driver_mock::SimulatedMicroscope;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_restores_on_drop() {
        let scope = SimulatedMicroscope::default();
        scope.camera.binning().set((2, 2)).unwrap();
        scope.camera.exposure_time().set(0.3).unwrap();
        scope.beam.resolution().set((256, 256)).unwrap();

        {
            let _snapshot = HardwareSnapshot::capture(scope.camera.clone(), scope.beam.clone());
            scope.camera.binning().set((8, 8)).unwrap();
            scope.camera.exposure_time().set(0.9).unwrap();
            scope.camera.resolution().set((64, 64)).unwrap();
            scope.beam.scale().set((4.0, 4.0)).unwrap();
            scope.beam.resolution().set((1, 1)).unwrap();
        }

        assert_eq!(scope.camera.binning().get(), (2, 2));
        assert_eq!(scope.camera.exposure_time().get(), 0.3);
        assert_eq!(scope.camera.resolution().get(), (256, 256));
        assert_eq!(scope.beam.scale().get(), (1.0, 1.0));
        assert_eq!(scope.beam.resolution().get(), (256, 256));
        assert!(logs_contain("Restored hardware settings"));
    }
}
