//! sonoscope - drive an acquisition session from the command line
//!
//! Subcommands:
//! - `sonoscope config` - Print the effective session configuration
//! - `sonoscope acquire` - Upload a sequence, acquire frames through a gain pipeline
//! - `sonoscope devices` - Resolve and describe the session's devices

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sonoscope::devices::UltrasoundDevice;
use sonoscope::kernels::default_pulse;
use sonoscope::{
    Device, Gain, LinSequence, Pipeline, Processing, PwiSequence, RunnerEvent, Scheme, Sequence,
    Session, SonoConfig, TerminationReason, WorkMode,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sonoscope")]
#[command(about = "Ultrasound acquisition sessions")]
#[command(version)]
struct Cli {
    /// Session file (default: discovered config files)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as TOML
    Config,

    /// Acquire frames and report per-frame statistics
    Acquire {
        /// Imaging sequence
        #[arg(short, long, value_enum, default_value = "lin")]
        sequence: SequenceArg,

        /// Work mode (default: from config)
        #[arg(short, long, value_enum)]
        mode: Option<ModeArg>,

        /// Number of frames to acquire
        #[arg(short = 'n', long, default_value = "10")]
        frames: u32,

        /// Linear gain applied by the pipeline
        #[arg(short, long, default_value = "1.0")]
        gain: f64,

        /// Output buffer elements (default: from config)
        #[arg(short, long)]
        buffer: Option<u32>,

        /// Seconds to wait for each frame
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },

    /// Describe the devices reachable from the session
    Devices,
}

#[derive(Clone, Copy, ValueEnum)]
enum SequenceArg {
    /// Focused scan lines
    Lin,
    /// Plane waves
    Pwi,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Manual,
    Host,
    Async,
}

impl From<ModeArg> for WorkMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Manual => WorkMode::Manual,
            ModeArg::Host => WorkMode::Host,
            ModeArg::Async => WorkMode::Async,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SonoConfig::load_session_file(path)?,
        None => SonoConfig::load()?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.infra.telemetry.log_level)),
        )
        .init();

    info!("sonoscope {} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml());
        }
        Commands::Acquire {
            sequence,
            mode,
            frames,
            gain,
            buffer,
            timeout,
        } => {
            let mut session = Session::builder().config(config).build()?;
            let result = acquire(
                &mut session,
                AcquireArgs {
                    sequence,
                    mode: mode.map(WorkMode::from),
                    frames,
                    gain,
                    buffer,
                    timeout: Duration::from_secs(timeout),
                },
            )
            .await;
            session.close()?;
            result?;
        }
        Commands::Devices => {
            let mut session = Session::builder().config(config).build()?;
            describe_devices(&mut session)?;
            session.close()?;
        }
    }

    Ok(())
}

struct AcquireArgs {
    sequence: SequenceArg,
    mode: Option<WorkMode>,
    frames: u32,
    gain: f64,
    buffer: Option<u32>,
    timeout: Duration,
}

fn build_sequence(config: &SonoConfig, kind: SequenceArg) -> Sequence {
    let probe = sonoscope::ProbeDescriptor::from(&config.system.probe);
    let pulse = default_pulse(&probe);
    match kind {
        SequenceArg::Lin => {
            let step = (probe.n_elements / 32).max(1);
            let centers: Vec<f64> = (0..probe.n_elements)
                .step_by(step as usize)
                .map(f64::from)
                .collect();
            let n_channels = config.system.n_modules * config.system.channels_per_module;
            LinSequence {
                tx_aperture_center_element: centers.clone(),
                tx_aperture_size: probe.n_elements.min(32),
                tx_focus: 20e-3,
                pulse,
                rx_aperture_center_element: centers,
                rx_aperture_size: n_channels.clamp(1, probe.n_elements),
                rx_sample_range: (0, 2048),
                downsampling_factor: 1,
                pri: 200e-6,
                speed_of_sound: None,
                tgc_start: 14.0,
                tgc_slope: 2e2,
            }
            .into()
        }
        SequenceArg::Pwi => PwiSequence {
            angles: (-5..=5).map(|deg| f64::from(deg * 2).to_radians()).collect(),
            pulse,
            rx_sample_range: (0, 2048),
            downsampling_factor: 1,
            pri: 200e-6,
            speed_of_sound: None,
            tgc_start: 14.0,
            tgc_slope: 2e2,
        }
        .into(),
    }
}

async fn acquire(session: &mut Session, args: AcquireArgs) -> Result<()> {
    let sequence = build_sequence(session.config(), args.sequence);
    let pipeline = Pipeline::new().with_step(Gain::new(args.gain));
    let mut scheme = Scheme::new(sequence)
        .with_processing(Processing::new(pipeline).with_metadata_extraction());
    if let Some(mode) = args.mode {
        scheme = scheme.with_work_mode(mode);
    }
    if let Some(n) = args.buffer {
        scheme = scheme.with_buffer(n);
    }
    let work_mode = args.mode.unwrap_or(session.config().system.acquisition.work_mode);

    let mut outputs = session
        .upload(scheme)?
        .into_outputs()
        .context("upload with processing returned no outputs")?;
    info!(
        "output frames: {:?} {}",
        outputs.metadata().input_shape,
        outputs.metadata().dtype.as_str()
    );

    session.start_scheme()?;
    if work_mode != WorkMode::Manual {
        session.run()?;
    }

    let mut received = 0;
    while received < args.frames {
        if work_mode == WorkMode::Manual {
            session.run()?;
        }
        let event = tokio::time::timeout(args.timeout, outputs.recv())
            .await
            .context("timed out waiting for a frame")?;
        match event {
            Some(RunnerEvent::Frame(frame)) => {
                received += 1;
                let n = frame.frame.data.len().max(1) as f64;
                let mean = frame.frame.data.iter().map(|&s| f64::from(s).abs()).sum::<f64>() / n;
                match frame.metadata {
                    Some(meta) => info!(
                        "frame {} (element {}, trigger {}): mean |x| {:.1}",
                        meta.frame_number, meta.position, meta.trigger_counter, mean
                    ),
                    None => info!("frame {}: mean |x| {:.1}", received, mean),
                }
            }
            Some(RunnerEvent::Overflow { position }) => {
                warn!("acquisition overflowed at element {}", position);
            }
            Some(RunnerEvent::Terminated(TerminationReason::Stopped)) | None => break,
            Some(RunnerEvent::Terminated(reason)) => bail!("processing terminated: {:?}", reason),
        }
    }

    session.stop_scheme()?;
    if let Some(buffer) = session.buffer() {
        info!("acquired {} frames, buffer stats {:?}", received, buffer.stats());
    }
    Ok(())
}

fn describe_devices(session: &mut Session) -> Result<()> {
    for path in ["/Ultrasound:0", "/CPU:0", "/GPU:0"] {
        match session.get_device(path) {
            Ok(Device::Us4R(us4r)) => println!(
                "{} -> {}: {} modules, {} rx channels, fs {} Hz",
                path,
                us4r.id(),
                us4r.n_modules(),
                us4r.n_rx_channels(),
                us4r.sampling_frequency()
            ),
            Ok(Device::File(file)) => println!(
                "{} -> {}: replaying {}",
                path,
                file.id(),
                file.source()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<none>".to_string())
            ),
            Ok(Device::Compute(compute)) => match compute.device_node() {
                Some(node) => println!("{} -> {} ({})", path, compute.id(), node.display()),
                None => println!("{} -> {}", path, compute.id()),
            },
            Err(e) => println!("{} -> unavailable: {}", path, e),
        }
    }
    Ok(())
}
