//! End-to-end alignment runs against the simulated microscope.

mod common;

use common::{fast_microscope, microscope, objective_request, prepare, request, settings};
use daq_align::actuator::CorrectionMode;
use daq_align::alignment::align_spot;
use daq_align::config::AlignConfig;
use daq_align::DaqError;
use daq_core::capabilities::BeamScanner;
use daq_core::task::TaskState;
use daq_driver_mock::{SampleConfig, SimulatedMicroscope};
use std::time::Duration;

#[tokio::test]
async fn test_objective_move_converges_and_restores_settings() {
    let scope = fast_microscope();
    let before = prepare(&scope);
    scope.sample.set_spot_offset((50e-6, 0.0));

    let correction = align_spot(objective_request(&scope), &AlignConfig::default())
        .result()
        .await
        .unwrap();

    assert!(correction.distance <= 1.5e-6, "{}", correction.distance);
    assert!(scope.sample.spot_distance() <= 1.5e-6);
    // Rough pass plus at most the fine budget, no escalation
    assert!((1..=11).contains(&scope.lens.move_count()));
    assert_eq!(scope.focus.move_count(), 0);
    assert_eq!(scope.stage.move_count(), 0);
    assert_eq!(settings(&scope), before);
    assert_eq!(scope.beam.resolution().get(), (256, 256));
}

#[tokio::test]
async fn test_stage_move_converges() {
    let scope = fast_microscope();
    prepare(&scope);
    scope.sample.set_spot_offset((-30e-6, 25e-6));

    let correction = align_spot(request(&scope, CorrectionMode::StageMove), &AlignConfig::default())
        .result()
        .await
        .unwrap();

    assert!(correction.distance <= 1.5e-6);
    assert!(scope.stage.move_count() >= 1);
    assert_eq!(scope.lens.move_count(), 0);
}

#[tokio::test]
async fn test_beam_shift_moves_translation_only() {
    let scope = fast_microscope();
    let before = prepare(&scope);
    scope.sample.set_spot_offset((20e-6, -10e-6));

    let correction = align_spot(request(&scope, CorrectionMode::BeamShift), &AlignConfig::default())
        .result()
        .await
        .unwrap();

    assert!(correction.distance <= 1.5e-6);
    assert_eq!(scope.stage.move_count(), 0);
    let (tx, ty) = scope.beam.translation().get();
    assert!((tx + 20.0).abs() < 1.0 && (ty - 10.0).abs() < 1.0, "({tx}, {ty})");
    // Translation is the correction itself and stays; the rest is restored
    assert_eq!(settings(&scope), before);
}

#[tokio::test]
async fn test_noise_only_fails_focus_and_restores_settings() {
    let scope = fast_microscope();
    let before = prepare(&scope);
    scope.sample.set_spot_visible(false);

    let err = align_spot(objective_request(&scope), &AlignConfig::default())
        .result()
        .await
        .unwrap_err();

    assert!(matches!(err, DaqError::FocusFailed(_)), "{err}");
    assert!(err.to_string().starts_with("spot alignment failure: autofocus failed"));
    assert_eq!(scope.lens.move_count(), 0);
    assert_eq!(settings(&scope), before);
}

#[tokio::test]
async fn test_defocused_spot_escalates_to_autofocus() {
    let scope = fast_microscope();
    let before = prepare(&scope);
    scope.sample.set_spot_offset((30e-6, 10e-6));
    scope.sample.set_focus(60e-6);

    let correction = align_spot(objective_request(&scope), &AlignConfig::default())
        .result()
        .await
        .unwrap();

    assert!(scope.focus.move_count() > 0);
    assert!(scope.sample.defocus() <= 10.5e-6, "{}", scope.sample.defocus());
    assert!(correction.distance <= 1.5e-6);
    assert_eq!(settings(&scope), before);
}

#[tokio::test]
async fn test_spot_too_faint_after_focus_is_not_found() {
    // Visible to autofocus at binning 8, lost in the noise at binning 1
    let scope = SimulatedMicroscope::new(SampleConfig {
        time_scale: 0.0,
        brightness: 60.0,
        ..SampleConfig::default()
    });
    let before = prepare(&scope);

    let err = align_spot(objective_request(&scope), &AlignConfig::default())
        .result()
        .await
        .unwrap_err();

    assert!(matches!(err, DaqError::SpotNotFound), "{err}");
    assert_eq!(err.to_string(), "spot alignment failure: spot not found");
    assert_eq!(settings(&scope), before);
}

#[tokio::test]
async fn test_cancel_during_fine_pass() {
    let scope = microscope(0.05, 0.5);
    let before = prepare(&scope);
    scope.sample.set_spot_offset((50e-6, 0.0));

    let handle = align_spot(objective_request(&scope), &AlignConfig::default());
    let mut moves = scope.lens.subscribe_moves();
    // One rough move, then three fine ones
    moves.wait_for(|n| *n >= 4).await.unwrap();

    assert!(handle.cancel().await);
    assert_eq!(handle.state(), TaskState::Cancelled);
    let err = handle.result().await.unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    assert_eq!(settings(&scope), before);

    let moved = scope.lens.move_count();
    assert!(moved <= 5, "{moved}");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(scope.lens.move_count(), moved);
    // Not converged yet when cancelled
    assert!(scope.sample.spot_distance() > 1.5e-6);
}
