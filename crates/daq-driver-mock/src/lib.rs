//! Mock Hardware Implementations
//!
//! Simulated microscope for testing the alignment procedures without physical
//! hardware. Every device shares one [`SimulatedSample`], so moving an
//! actuator changes what the camera sees on the next frame. All delays use
//! `tokio::time::sleep` and are multiplied by [`SampleConfig::time_scale`].
//!
//! # Available Mocks
//!
//! - [`MockCamera`] - CCD rendering a Gaussian spot with read noise, binning
//!   and centred cropping
//! - [`MockActuator`] - XY stage, lens-alignment stage (rotated a/b axes) and
//!   focus
//! - [`MockBeamScanner`] - e-beam scale, resolution (spot mode) and shift

pub mod beam;
pub mod camera;
pub mod motion;
pub mod sample;

use std::sync::Arc;

pub use beam::MockBeamScanner;
pub use camera::MockCamera;
pub use motion::{Coupling, MockActuator};
pub use sample::{BeamSettings, SampleConfig, SampleState, SimulatedSample};

/// Full set of simulated devices around one sample.
#[derive(Debug, Clone)]
pub struct SimulatedMicroscope {
    /// The shared sample
    pub sample: Arc<SimulatedSample>,
    /// CCD
    pub camera: Arc<MockCamera>,
    /// XY sample stage
    pub stage: Arc<MockActuator>,
    /// Lens-alignment stage
    pub lens: Arc<MockActuator>,
    /// Optical focus
    pub focus: Arc<MockActuator>,
    /// E-beam scanner
    pub beam: Arc<MockBeamScanner>,
}

impl SimulatedMicroscope {
    /// Build every device over a fresh sample.
    pub fn new(config: SampleConfig) -> Self {
        let sample = Arc::new(SimulatedSample::new(config));
        Self {
            camera: Arc::new(MockCamera::new("ccd", sample.clone())),
            stage: Arc::new(MockActuator::stage("stage", sample.clone())),
            lens: Arc::new(MockActuator::lens("lens", sample.clone())),
            focus: Arc::new(MockActuator::focus("focus", sample.clone())),
            beam: Arc::new(MockBeamScanner::new("ebeam", sample.clone())),
            sample,
        }
    }
}

impl Default for SimulatedMicroscope {
    fn default() -> Self {
        Self::new(SampleConfig::default())
    }
}
