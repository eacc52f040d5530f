//! Simulated actuators: sample stage, lens-alignment stage and focus.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use daq_core::capabilities::{Actuator, Axis};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::debug;

use crate::sample::SimulatedSample;

/// How a move of the actuator shows up on the sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coupling {
    /// XY stage; image y is opposite to stage y
    Stage,
    /// Lens alignment (axes a, b) rotated by the given angle in radians
    Lens {
        /// Rotation between the (b, a) frame and the image, radians
        rotation: f64,
    },
    /// Focus (axis z)
    Focus,
}

impl Coupling {
    fn axes(&self) -> &'static [Axis] {
        match self {
            Coupling::Stage => &[Axis::X, Axis::Y],
            Coupling::Lens { .. } => &[Axis::A, Axis::B],
            Coupling::Focus => &[Axis::Z],
        }
    }
}

/// Mock actuator with simulated settling time
///
/// Every completed move bumps a counter that tests can watch to cancel at a
/// precise point of a procedure.
#[derive(Debug)]
pub struct MockActuator {
    name: String,
    coupling: Coupling,
    sample: Arc<SimulatedSample>,
    positions: Mutex<BTreeMap<Axis, f64>>,
    moves: watch::Sender<usize>,
}

impl MockActuator {
    /// Actuator of the given coupling over `sample`, all axes at 0.
    pub fn new(name: impl Into<String>, coupling: Coupling, sample: Arc<SimulatedSample>) -> Self {
        let positions = coupling.axes().iter().map(|&axis| (axis, 0.0)).collect();
        let (moves, _) = watch::channel(0);
        Self {
            name: name.into(),
            coupling,
            sample,
            positions: Mutex::new(positions),
            moves,
        }
    }

    /// XY sample stage.
    pub fn stage(name: impl Into<String>, sample: Arc<SimulatedSample>) -> Self {
        Self::new(name, Coupling::Stage, sample)
    }

    /// Lens-alignment stage using the sample's configured rotation.
    pub fn lens(name: impl Into<String>, sample: Arc<SimulatedSample>) -> Self {
        let rotation = sample.config().lens_rotation;
        Self::new(name, Coupling::Lens { rotation }, sample)
    }

    /// Focus actuator.
    pub fn focus(name: impl Into<String>, sample: Arc<SimulatedSample>) -> Self {
        Self::new(name, Coupling::Focus, sample)
    }

    /// Number of completed moves.
    pub fn move_count(&self) -> usize {
        *self.moves.borrow()
    }

    /// Watch the completed-move counter.
    pub fn subscribe_moves(&self) -> watch::Receiver<usize> {
        self.moves.subscribe()
    }

    /// Focus follows the sample, other axes the commanded moves.
    fn current(&self, axis: Axis) -> Option<f64> {
        if self.coupling == Coupling::Focus && axis == Axis::Z {
            return Some(self.sample.state().focus);
        }
        self.positions.lock().get(&axis).copied()
    }

    fn check_axes(&self, shift: &[(Axis, f64)]) -> Result<()> {
        let supported = self.coupling.axes();
        match shift.iter().find(|(axis, _)| !supported.contains(axis)) {
            Some((axis, _)) => Err(anyhow!("{}: unsupported axis '{}'", self.name, axis)),
            None => Ok(()),
        }
    }

    fn apply(&self, shift: &[(Axis, f64)]) {
        let delta = |wanted: Axis| {
            shift
                .iter()
                .filter(|(axis, _)| *axis == wanted)
                .map(|(_, d)| d)
                .sum::<f64>()
        };
        match self.coupling {
            Coupling::Stage => self.sample.shift_spot((delta(Axis::X), -delta(Axis::Y))),
            Coupling::Lens { rotation } => {
                // Back into the lens frame: (x, -y) of the image offset
                let (b, a) = (delta(Axis::B), delta(Axis::A));
                let (sin, cos) = (-rotation).sin_cos();
                let lens_x = cos * b - sin * a;
                let lens_y = sin * b + cos * a;
                self.sample.shift_spot((-lens_x, lens_y));
            }
            Coupling::Focus => self.sample.move_focus(delta(Axis::Z)),
        }
        let mut positions = self.positions.lock();
        for &(axis, d) in shift {
            *positions.entry(axis).or_insert(0.0) += d;
        }
    }
}

#[async_trait]
impl Actuator for MockActuator {
    fn name(&self) -> &str {
        &self.name
    }

    fn axes(&self) -> &[Axis] {
        self.coupling.axes()
    }

    async fn move_rel(&self, shift: &[(Axis, f64)]) -> Result<()> {
        self.check_axes(shift)?;
        debug!("{}: moving by {:?}", self.name, shift);

        let cfg = self.sample.config();
        sleep(cfg.scaled(cfg.move_time)).await;

        self.apply(shift);
        self.moves.send_modify(|n| *n += 1);
        debug!("{}: move settled", self.name);
        Ok(())
    }

    async fn move_abs(&self, target: &[(Axis, f64)]) -> Result<()> {
        self.check_axes(target)?;
        let shift: Vec<(Axis, f64)> = target
            .iter()
            .map(|&(axis, pos)| (axis, pos - self.current(axis).unwrap_or(0.0)))
            .collect();
        self.move_rel(&shift).await
    }

    async fn position(&self, axis: Axis) -> Result<f64> {
        self.current(axis)
            .ok_or_else(|| anyhow!("{}: unsupported axis '{}'", self.name, axis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleConfig;

    fn sample() -> Arc<SimulatedSample> {
        Arc::new(SimulatedSample::new(SampleConfig {
            time_scale: 0.0,
            ..SampleConfig::default()
        }))
    }

    fn assert_close(actual: (f64, f64), expected: (f64, f64)) {
        assert!(
            (actual.0 - expected.0).abs() < 1e-12 && (actual.1 - expected.1).abs() < 1e-12,
            "{actual:?} != {expected:?}"
        );
    }

    #[tokio::test]
    async fn test_stage_relative_and_absolute_move() {
        let sample = sample();
        let stage = MockActuator::stage("stage", sample.clone());

        stage.move_rel(&[(Axis::X, 5e-6)]).await.unwrap();
        stage.move_abs(&[(Axis::X, 2e-6), (Axis::Y, 1e-6)]).await.unwrap();

        assert!((stage.position(Axis::X).await.unwrap() - 2e-6).abs() < 1e-15);
        assert_close(sample.state().spot_offset, (2e-6, -1e-6));
        assert_eq!(stage.move_count(), 2);
    }

    #[tokio::test]
    async fn test_lens_rotation_round_trip() {
        let sample = sample();
        let lens = MockActuator::lens("lens", sample.clone());
        let theta = sample.config().lens_rotation;

        // Command for an image offset of (3, 4) um: rotate (x, -y) by theta
        let (tx, ty) = (3e-6, 4e-6);
        let (sin, cos) = theta.sin_cos();
        let b = cos * tx - sin * -ty;
        let a = sin * tx + cos * -ty;
        lens.move_rel(&[(Axis::B, b), (Axis::A, a)]).await.unwrap();

        assert_close(sample.state().spot_offset, (-tx, -ty));
    }

    #[tokio::test]
    async fn test_focus_tracks_sample() {
        let sample = sample();
        sample.set_focus(30e-6);
        let focus = MockActuator::focus("focus", sample.clone());

        assert_eq!(focus.position(Axis::Z).await.unwrap(), 30e-6);
        focus.move_abs(&[(Axis::Z, 0.0)]).await.unwrap();
        assert!(sample.defocus() < 1e-12);
    }

    #[tokio::test]
    async fn test_unsupported_axis_rejected() {
        let focus = MockActuator::focus("focus", sample());
        assert!(focus.move_rel(&[(Axis::X, 1e-6)]).await.is_err());
        assert!(focus.position(Axis::A).await.is_err());
        assert_eq!(focus.move_count(), 0);
    }
}
