//! Advisory time estimates fed to task progress.
//!
//! None of these numbers influence control flow.

use std::time::Duration;

use crate::config::AlignConfig;

/// Per-step cost model of the alignment procedures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeModel {
    fine_steps: usize,
    min_step: f64,
    overhead_s: f64,
    autofocus_rounds: usize,
}

impl Default for TimeModel {
    fn default() -> Self {
        Self::from_config(&AlignConfig::default())
    }
}

impl TimeModel {
    /// Model using the step counts and overheads of `config`.
    pub fn from_config(config: &AlignConfig) -> Self {
        Self {
            fine_steps: config.centering.fine_steps,
            min_step: config.centering.min_actuator_step,
            overhead_s: config.centering.step_overhead_s,
            autofocus_rounds: config.autofocus.max_steps,
        }
    }

    /// Time of one centering step at exposure `et` seconds.
    pub fn step_time(&self, et: f64) -> f64 {
        et + self.overhead_s
    }

    /// Expected number of halving steps to bring `distance` under the minimum
    /// actuator step, capped at the fine-pass budget.
    pub fn center_steps(&self, distance: Option<f64>) -> f64 {
        let max = self.fine_steps as f64;
        match distance {
            None => max,
            Some(d) => (d / self.min_step).log2().min(max).max(0.0),
        }
    }

    /// Duration of a centering run starting `distance` metres off.
    pub fn center_time(&self, et: f64, distance: Option<f64>) -> Duration {
        seconds(self.center_steps(distance) * self.step_time(et))
    }

    /// Duration of one autofocus run: two probes per round.
    pub fn autofocus_time(&self, et: f64) -> Duration {
        seconds(self.autofocus_rounds as f64 * 2.0 * self.step_time(et))
    }

    /// Duration of an alignment with `n_autofocus` focus passes still possible.
    pub fn alignment_time(&self, et: f64, distance: Option<f64>, n_autofocus: u32) -> Duration {
        self.center_time(et, distance) + self.autofocus_time(et) * n_autofocus
    }
}

fn seconds(s: f64) -> Duration {
    Duration::try_from_secs_f64(s.max(0.0)).unwrap_or(Duration::MAX)
}
