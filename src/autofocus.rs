//! Focus escalation: hill-climbing autofocus on the focus actuator.
//!
//! The focus level of a frame is the variance of its discrete Laplacian,
//! which drops as the image blurs. The search keeps stepping in one direction
//! while the level improves; a worse probe reverses the direction and halves
//! the step. It stops when the step falls below the accuracy or the probe
//! budget is spent, then parks the actuator at the best position.
//!
//! A focus curve that stays flat (best level less than `min_contrast` times
//! the worst) means there is nothing to focus on and fails the task.

use daq_core::capabilities::{Actuator, Axis};
use daq_core::frame::Frame;
use daq_core::task::{launch, TaskContext, TaskHandle};
use daq_core::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::AutofocusConfig;
use crate::estimate::TimeModel;
use crate::sensor::SensorAdapter;

/// Where the focus ended up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocusResult {
    /// Focus actuator position, metres
    pub position: f64,
    /// Focus level at that position
    pub level: f64,
}

/// Variance of the 4-neighbour Laplacian over the frame interior.
pub fn focus_measure(frame: &Frame) -> f64 {
    let (w, h) = (frame.width(), frame.height());
    if w < 3 || h < 3 {
        return 0.0;
    }
    let p = frame.pixels();
    let mut values = Vec::with_capacity((w - 2) * (h - 2));
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let i = y * w + x;
            values.push(p[i - 1] + p[i + 1] + p[i - w] + p[i + w] - 4.0 * p[i]);
        }
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}

/// Autofocus over one focus actuator.
#[derive(Clone)]
pub struct AutoFocus {
    sensor: SensorAdapter,
    focus: Arc<dyn Actuator>,
    config: AutofocusConfig,
    time: TimeModel,
}

impl fmt::Debug for AutoFocus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoFocus")
            .field("sensor", &self.sensor)
            .field("focus", &self.focus.name())
            .field("config", &self.config)
            .finish()
    }
}

impl AutoFocus {
    /// Autofocus driving the z axis of `focus`.
    pub fn new(
        sensor: SensorAdapter,
        focus: Arc<dyn Actuator>,
        config: AutofocusConfig,
        time: TimeModel,
    ) -> Self {
        Self {
            sensor,
            focus,
            config,
            time,
        }
    }

    /// Run the search as a task.
    pub fn auto_focus(&self) -> TaskHandle<FocusResult> {
        let exposure = self.sensor.camera().exposure_time().get();
        let this = self.clone();
        launch("autofocus", self.time.autofocus_time(exposure), move |ctx| this.run(ctx))
    }

    async fn measure_at(&self, ctx: &TaskContext, z: f64) -> AppResult<f64> {
        ctx.checkpoint()?;
        self.focus.move_abs(&[(Axis::Z, z)]).await?;
        ctx.checkpoint()?;
        let frame = self.sensor.acquire_corrected().await?;
        let level = focus_measure(&frame);
        debug!("Focus level at {:.1} um: {:.3e}", z * 1e6, level);
        Ok(level)
    }

    async fn run(self, ctx: TaskContext) -> AppResult<FocusResult> {
        let cfg = &self.config;
        ctx.checkpoint()?;
        let start = self.focus.position(Axis::Z).await?;
        debug!("Starting autofocus at {:.1} um...", start * 1e6);

        ctx.checkpoint()?;
        let first = focus_measure(&self.sensor.acquire_corrected().await?);
        let mut best = FocusResult {
            position: start,
            level: first,
        };
        let (mut lowest, mut highest) = (first, first);
        let mut step = cfg.initial_step;
        let mut direction = -1.0;
        let mut probes = 0;

        while step >= cfg.accuracy && probes < cfg.max_steps {
            probes += 1;
            let z = best.position + direction * step;
            let level = self.measure_at(&ctx, z).await?;
            lowest = lowest.min(level);
            highest = highest.max(level);
            if level > best.level {
                best = FocusResult { position: z, level };
            } else {
                direction = -direction;
                step /= 2.0;
            }
            let et = self.sensor.camera().exposure_time().get();
            let left = (cfg.max_steps - probes) as f64 / cfg.max_steps as f64;
            ctx.set_remaining(self.time.autofocus_time(et).mul_f64(left));
        }

        ctx.checkpoint()?;
        self.focus.move_abs(&[(Axis::Z, best.position)]).await?;

        if best.level <= 0.0 || highest < cfg.min_contrast * lowest {
            return Err(DaqError::FocusFailed(format!(
                "focus curve is flat (levels {:.3e} to {:.3e})",
                lowest, highest
            )));
        }
        info!(
            "Autofocus done in {} probes: {:.1} um (level {:.3e})",
            probes,
            best.position * 1e6,
            best.level
        );
        Ok(best)
    }
}
