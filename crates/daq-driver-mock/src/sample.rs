//! Simulated sample shared by every mock device.
//!
//! The sample holds the only physical state of the simulation: where the spot
//! image sits relative to the optical centre, where the focus actuator is, and
//! the e-beam scanner settings. Actuators mutate it, the camera renders it.
//!
//! Coordinates are image coordinates in metres: x to the right, y downwards,
//! origin at the centre of the sensor.

use daq_core::capabilities::PixelPair;
use daq_core::frame::Frame;
use daq_core::observable::{pair_range, Observable};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::f64::consts::PI;
use std::time::Duration;

/// Physical parameters of the simulated microscope.
#[derive(Debug, Clone)]
pub struct SampleConfig {
    /// Sensor size in pixels at binning 1
    pub sensor: PixelPair,
    /// Smallest supported camera resolution
    pub min_resolution: PixelPair,
    /// Largest supported binning
    pub max_binning: PixelPair,
    /// Size of one unbinned sensor pixel, metres
    pub pixel_size: f64,
    /// Size of one e-beam scan pixel at scale 1, metres
    pub beam_pixel_size: f64,
    /// Dark level added to every read, counts
    pub baseline: f64,
    /// Peak counts per second of an in-focus spot on one unbinned pixel
    pub brightness: f64,
    /// In-focus spot radius (Gaussian sigma), metres
    pub spot_sigma: f64,
    /// Growth of the spot sigma per metre of defocus
    pub defocus_blur: f64,
    /// Read noise standard deviation, counts
    pub read_noise: f64,
    /// Z position of best focus, metres
    pub best_focus: f64,
    /// Fraction of each commanded correction the spot actually follows
    pub actuator_gain: f64,
    /// Rotation between the lens-alignment axes and the image, radians
    pub lens_rotation: f64,
    /// Multiplier applied to every simulated delay
    pub time_scale: f64,
    /// Duration of one actuator move at time scale 1
    pub move_time: Duration,
    /// Sensor readout time at time scale 1
    pub readout_time: Duration,
    /// Noise generator seed
    pub seed: u64,
    /// Extra spots at fixed positions, metres from the optical centre. They
    /// look like the real spot but no actuator moves them.
    pub decoys: Vec<(f64, f64)>,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            sensor: (256, 256),
            min_resolution: (16, 16),
            max_binning: (16, 16),
            pixel_size: 1e-6,
            beam_pixel_size: 1e-6,
            baseline: 100.0,
            brightness: 2000.0,
            spot_sigma: 2e-6,
            defocus_blur: 0.2,
            read_noise: 2.0,
            best_focus: 0.0,
            actuator_gain: 1.0,
            lens_rotation: (-135f64).to_radians(),
            time_scale: 1.0,
            move_time: Duration::from_millis(50),
            readout_time: Duration::from_millis(10),
            seed: 42,
            decoys: Vec::new(),
        }
    }
}

impl SampleConfig {
    /// Scale a nominal delay by the configured time scale.
    pub fn scaled(&self, nominal: Duration) -> Duration {
        nominal.mul_f64(self.time_scale.max(0.0))
    }
}

/// Snapshot of the mutable sample state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleState {
    /// Spot position relative to the sensor centre, metres (beam shift excluded)
    pub spot_offset: (f64, f64),
    /// Focus actuator position, metres
    pub focus: f64,
    /// Whether the sample produces a spot at all
    pub spot_visible: bool,
}

/// E-beam scanner settings, owned by the sample so the camera can see them.
#[derive(Debug, Clone)]
pub struct BeamSettings {
    /// Scan scale
    pub scale: Observable<(f64, f64)>,
    /// Scan resolution; `(1, 1)` is spot mode
    pub resolution: Observable<PixelPair>,
    /// Beam shift in scan pixels
    pub translation: Observable<(f64, f64)>,
}

/// The simulated specimen plus optics.
#[derive(Debug)]
pub struct SimulatedSample {
    config: SampleConfig,
    state: Mutex<SampleState>,
    beam: BeamSettings,
}

impl SimulatedSample {
    /// Sample with the spot at the optical centre, in focus.
    pub fn new(config: SampleConfig) -> Self {
        let beam = BeamSettings {
            scale: Observable::new("scale", (1.0, 1.0))
                .with_description("E-beam scan scale")
                .with_validator(pair_range((1.0, 1.0), (1024.0, 1024.0))),
            resolution: Observable::new("resolution", (512, 512))
                .with_description("E-beam scan resolution")
                .with_validator(pair_range((1, 1), (4096, 4096))),
            translation: Observable::new("translation", (0.0, 0.0))
                .with_description("E-beam shift")
                .with_units("px"),
        };
        let state = SampleState {
            spot_offset: (0.0, 0.0),
            focus: config.best_focus,
            spot_visible: true,
        };
        Self {
            config,
            state: Mutex::new(state),
            beam,
        }
    }

    /// Simulation parameters.
    pub fn config(&self) -> &SampleConfig {
        &self.config
    }

    /// E-beam settings.
    pub fn beam(&self) -> &BeamSettings {
        &self.beam
    }

    /// Current state.
    pub fn state(&self) -> SampleState {
        *self.state.lock()
    }

    /// Place the spot at `offset` metres from the optical centre.
    pub fn set_spot_offset(&self, offset: (f64, f64)) {
        self.state.lock().spot_offset = offset;
    }

    /// Show or hide the spot.
    pub fn set_spot_visible(&self, visible: bool) {
        self.state.lock().spot_visible = visible;
    }

    /// Set the focus actuator position.
    pub fn set_focus(&self, z: f64) {
        self.state.lock().focus = z;
    }

    /// Distance between the focus actuator and best focus.
    pub fn defocus(&self) -> f64 {
        (self.state.lock().focus - self.config.best_focus).abs()
    }

    /// Move the spot image by `shift` metres, scaled by the actuator gain.
    pub(crate) fn shift_spot(&self, shift: (f64, f64)) {
        let gain = self.config.actuator_gain;
        let mut state = self.state.lock();
        state.spot_offset.0 += gain * shift.0;
        state.spot_offset.1 += gain * shift.1;
    }

    pub(crate) fn move_focus(&self, dz: f64) {
        self.state.lock().focus += dz;
    }

    /// Spot position including the beam shift, metres from the optical centre.
    pub fn spot_position(&self) -> (f64, f64) {
        let offset = self.state.lock().spot_offset;
        let (tx, ty) = self.beam.translation.get();
        let (sx, sy) = self.beam.scale.get();
        let px = self.config.beam_pixel_size;
        (offset.0 + tx * sx * px, offset.1 + ty * sy * px)
    }

    /// Distance of the spot from the optical centre, metres.
    pub fn spot_distance(&self) -> f64 {
        let (x, y) = self.spot_position();
        x.hypot(y)
    }

    /// Render one exposure.
    ///
    /// The frame covers `resolution` binned pixels centred on the sensor. The
    /// spot and the decoys are only drawn while the beam is in spot mode.
    pub fn render(
        &self,
        exposure: f64,
        binning: PixelPair,
        resolution: PixelPair,
        sequence: u64,
    ) -> anyhow::Result<Frame> {
        let cfg = &self.config;
        let (bx, by) = (binning.0.max(1) as usize, binning.1.max(1) as usize);
        let width = (resolution.0 as usize).min(cfg.sensor.0 as usize / bx).max(1);
        let height = (resolution.1 as usize).min(cfg.sensor.1 as usize / by).max(1);

        let state = self.state();
        let spot_mode = self.beam.resolution.get() == (1, 1);
        let defocus = (state.focus - cfg.best_focus).abs();
        let sigma = cfg.spot_sigma + cfg.defocus_blur * defocus;
        let peak = cfg.brightness * exposure * (cfg.spot_sigma / sigma).powi(2);

        let mut spots = Vec::with_capacity(cfg.decoys.len() + 1);
        if spot_mode {
            if state.spot_visible {
                spots.push(self.spot_position());
            }
            spots.extend_from_slice(&cfg.decoys);
        }

        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed ^ sequence.wrapping_mul(0x9E37_79B9));
        let mut data = vec![0.0; width * height];

        // Unbinned region centred on the sensor
        let (region_w, region_h) = (width * bx, height * by);
        let inv_two_sigma2 = 1.0 / (2.0 * sigma * sigma);
        if peak > 0.0 {
            for &(spot_x, spot_y) in &spots {
                for v in 0..region_h {
                    let dy = (v as f64 + 0.5 - region_h as f64 / 2.0) * cfg.pixel_size - spot_y;
                    let fy = (-dy * dy * inv_two_sigma2).exp();
                    if fy < 1e-12 {
                        continue;
                    }
                    let row = (v / by) * width;
                    for u in 0..region_w {
                        let dx = (u as f64 + 0.5 - region_w as f64 / 2.0) * cfg.pixel_size - spot_x;
                        data[row + u / bx] += peak * fy * (-dx * dx * inv_two_sigma2).exp();
                    }
                }
            }
        }

        for pixel in &mut data {
            *pixel = (*pixel + cfg.baseline + cfg.read_noise * gaussian(&mut rng)).max(0.0);
        }

        let frame = Frame::new(width, height, data)?
            .with_pixel_size(cfg.pixel_size * bx as f64, cfg.pixel_size * by as f64)
            .with_baseline(cfg.baseline)
            .with_exposure(exposure);
        Ok(frame)
    }
}

/// Standard normal sample (Box-Muller).
fn gaussian(rng: &mut ChaCha8Rng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}
