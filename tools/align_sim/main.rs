//! Run the spot alignment against the simulated microscope.
//!
//! ```text
//! align_sim --offset-x 50 --offset-y -20 --defocus 40 --mode objective-move
//! align_sim --cancel-after 1.5 --time-scale 1
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use daq_align::actuator::CorrectionMode;
use daq_align::alignment::{align_spot, AlignmentRequest};
use daq_align::beam_center::find_ebeam_center;
use daq_align::config::AlignConfig;
use daq_align::logging;
use daq_core::capabilities::Actuator;
use daq_driver_mock::{SampleConfig, SimulatedMicroscope};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Spot alignment on a simulated microscope",
    long_about = "Builds a simulated camera, stages, focus and e-beam scanner around one \
        sample, displaces the spot and runs the alignment procedure on it.\n\n\
        Configuration is read from the optional TOML file, then DAQ_ALIGN_* \
        environment variables."
)]
struct Args {
    #[arg(long, help = "Alignment configuration file (TOML)")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "50.0", allow_hyphen_values = true, help = "Initial spot offset along x, um")]
    offset_x: f64,

    #[arg(long, default_value = "0.0", allow_hyphen_values = true, help = "Initial spot offset along y, um")]
    offset_y: f64,

    #[arg(long, default_value = "0.0", allow_hyphen_values = true, help = "Initial defocus, um")]
    defocus: f64,

    #[arg(long, value_enum, default_value_t = CorrectionMode::ObjectiveMove)]
    mode: CorrectionMode,

    #[arg(long, help = "Use the fixed exposure of background-reference runs")]
    background: bool,

    #[arg(
        long,
        default_value = "0.05",
        help = "Simulated time factor",
        long_help = "Factor applied to every simulated exposure and move delay. 1.0 runs \
            in real time, 0 as fast as possible."
    )]
    time_scale: f64,

    #[arg(long, help = "Cancel the alignment after this many seconds")]
    cancel_after: Option<f64>,

    #[arg(long, help = "Only locate the e-beam spot, do not align")]
    beam_center: bool,

    #[arg(long, help = "Log level, overrides the configuration")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AlignConfig::load_from(path),
        None => AlignConfig::load(),
    }
    .context("loading configuration")?;
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    logging::init(&config.log_level)?;

    run(&args, &config).await
}

async fn run(args: &Args, config: &AlignConfig) -> Result<()> {
    let scope = SimulatedMicroscope::new(SampleConfig {
        time_scale: args.time_scale,
        lens_rotation: config.centering.objective_rotation(),
        ..SampleConfig::default()
    });
    scope.sample.set_spot_offset((args.offset_x * 1e-6, args.offset_y * 1e-6));
    scope.sample.set_focus(args.defocus * 1e-6);
    info!(
        "Spot {:.1} um off centre, defocus {:.1} um",
        scope.sample.spot_distance() * 1e6,
        scope.sample.defocus() * 1e6
    );

    if args.beam_center {
        let (x, y) = find_ebeam_center(scope.camera.clone(), scope.beam.clone(), &config.beam_center)
            .result()
            .await
            .context("e-beam centre search failed")?;
        println!("E-beam spot at ({:.2}, {:.2}) um", x * 1e6, y * 1e6);
        return Ok(());
    }

    let stage: Arc<dyn Actuator> = match args.mode {
        CorrectionMode::ObjectiveMove => scope.lens.clone(),
        CorrectionMode::StageMove | CorrectionMode::BeamShift => scope.stage.clone(),
    };
    let request = AlignmentRequest::new(
        scope.camera.clone(),
        stage,
        scope.focus.clone(),
        scope.beam.clone(),
        args.mode,
    )
    .with_background(args.background);

    let handle = align_spot(request, config);
    info!("Estimated end: {}", handle.progress().end);

    if let Some(delay) = args.cancel_after {
        let control = handle.control();
        let delay = Duration::try_from_secs_f64(delay).context("invalid --cancel-after")?;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            warn!("Cancelling alignment");
            control.cancel().await;
        });
    }

    let correction = handle.result().await.context("spot alignment failed")?;
    println!(
        "Aligned: {:.2} um from centre (residual {:.2}, {:.2} um)",
        correction.distance * 1e6,
        correction.vector.metres.0 * 1e6,
        correction.vector.metres.1 * 1e6
    );
    println!("True spot distance: {:.2} um", scope.sample.spot_distance() * 1e6);
    Ok(())
}
