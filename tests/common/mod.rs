//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use daq_align::actuator::CorrectionMode;
use daq_align::alignment::AlignmentRequest;
use daq_core::capabilities::{BeamScanner, Camera, PixelPair};
use daq_driver_mock::{SampleConfig, SimulatedMicroscope};

/// Instrument settings that every alignment must put back.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub binning: PixelPair,
    pub exposure: f64,
    pub resolution: PixelPair,
    pub scale: (f64, f64),
    pub beam_resolution: PixelPair,
}

/// Microscope without simulated delays.
pub fn fast_microscope() -> SimulatedMicroscope {
    microscope(0.0, 1.0)
}

/// Microscope with the given delay factor and actuator gain.
pub fn microscope(time_scale: f64, actuator_gain: f64) -> SimulatedMicroscope {
    SimulatedMicroscope::new(SampleConfig {
        time_scale,
        actuator_gain,
        ..SampleConfig::default()
    })
}

/// Put the instruments in a state the alignment does not use itself, with the
/// beam scanning rather than in spot mode.
pub fn prepare(scope: &SimulatedMicroscope) -> Settings {
    scope.camera.binning().set((2, 2)).unwrap();
    scope.camera.exposure_time().set(0.35).unwrap();
    scope.camera.resolution().set((100, 80)).unwrap();
    scope.beam.scale().set((2.0, 2.0)).unwrap();
    scope.beam.resolution().set((256, 256)).unwrap();
    settings(scope)
}

/// Current instrument settings.
pub fn settings(scope: &SimulatedMicroscope) -> Settings {
    Settings {
        binning: scope.camera.binning().get(),
        exposure: scope.camera.exposure_time().get(),
        resolution: scope.camera.resolution().get(),
        scale: scope.beam.scale().get(),
        beam_resolution: scope.beam.resolution().get(),
    }
}

/// Request driving the lens-alignment stage.
pub fn objective_request(scope: &SimulatedMicroscope) -> AlignmentRequest {
    AlignmentRequest::new(
        scope.camera.clone(),
        scope.lens.clone(),
        scope.focus.clone(),
        scope.beam.clone(),
        CorrectionMode::ObjectiveMove,
    )
}

/// Request for `mode`, picking the matching actuator.
pub fn request(scope: &SimulatedMicroscope, mode: CorrectionMode) -> AlignmentRequest {
    match mode {
        CorrectionMode::ObjectiveMove => objective_request(scope),
        CorrectionMode::StageMove | CorrectionMode::BeamShift => AlignmentRequest::new(
            scope.camera.clone(),
            scope.stage.clone(),
            scope.focus.clone(),
            scope.beam.clone(),
            mode,
        ),
    }
}
