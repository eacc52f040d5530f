//! Simulated e-beam scanner.

use daq_core::capabilities::{BeamScanner, PixelPair};
use daq_core::observable::Observable;
use std::sync::Arc;

use crate::sample::SimulatedSample;

/// Mock scanner whose settings live on the simulated sample
///
/// Setting the resolution to `(1, 1)` puts the beam in spot mode, which is the
/// only mode in which the camera sees the spot. The translation shifts the
/// spot by `translation * scale * beam_pixel_size`.
#[derive(Debug)]
pub struct MockBeamScanner {
    name: String,
    sample: Arc<SimulatedSample>,
}

impl MockBeamScanner {
    /// Scanner over `sample`.
    pub fn new(name: impl Into<String>, sample: Arc<SimulatedSample>) -> Self {
        Self {
            name: name.into(),
            sample,
        }
    }
}

impl BeamScanner for MockBeamScanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn scale(&self) -> &Observable<(f64, f64)> {
        &self.sample.beam().scale
    }

    fn resolution(&self) -> &Observable<PixelPair> {
        &self.sample.beam().resolution
    }

    fn translation(&self) -> &Observable<(f64, f64)> {
        &self.sample.beam().translation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleConfig;

    #[test]
    fn test_translation_scaled_by_scan_scale() {
        let sample = Arc::new(SimulatedSample::new(SampleConfig::default()));
        let beam = MockBeamScanner::new("ebeam", sample.clone());

        beam.scale().set((2.0, 2.0)).unwrap();
        beam.translation().set((1.5, 0.0)).unwrap();
        let (x, _) = sample.spot_position();
        assert!((x - 3e-6).abs() < 1e-12);

        assert!(beam.resolution().set((0, 0)).is_err());
    }
}
