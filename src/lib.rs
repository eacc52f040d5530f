//! Closed-loop spot alignment for the optical path of an electron microscope.
//!
//! The library brings the spot seen by the CCD to the optical centre by
//! repeatedly measuring its offset and correcting it with one of three
//! actuators (sample stage, objective lens alignment or e-beam shift),
//! escalating to autofocus when the spot cannot be seen.
//!
//! Every procedure runs as a cancellable task from [`daq_core::task`]:
//!
//! - [`alignment`]: the orchestrator, [`align_spot`]
//! - [`centering`]: the convergence loop
//! - [`autofocus`]: focus escalation
//! - [`beam_center`]: fast e-beam spot finder
//!
//! Supporting modules:
//!
//! - [`sensor`]: background-corrected acquisition and SNR
//! - [`locator`]: spot detection
//! - [`actuator`]: correction modes and their move commands
//! - [`estimate`]: advisory time model
//! - [`snapshot`]: scoped save/restore of instrument settings
//! - [`config`]: figment configuration
//! - [`logging`]: tracing subscriber setup

pub mod actuator;
pub mod alignment;
pub mod autofocus;
pub mod beam_center;
pub mod centering;
pub mod config;
pub mod estimate;
pub mod locator;
pub mod logging;
pub mod sensor;
pub mod snapshot;

pub use actuator::{ActuatorFacade, CorrectionMode, Offset};
pub use alignment::{align_spot, crop_fov, AlignmentRequest, SpotAligner};
pub use autofocus::{AutoFocus, FocusResult};
pub use beam_center::find_ebeam_center;
pub use centering::{CenteringLoop, CenteringOutcome, Correction};
pub use config::{AlignConfig, ConfigError};
pub use daq_core::{AppResult, DaqError};
pub use locator::{Centroid, SpotLocator, SpotSearch};
pub use sensor::{measure_snr, BackgroundSubtraction, BaselineFloor, ReferenceFrame, SensorAdapter};
