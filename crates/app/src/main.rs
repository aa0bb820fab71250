use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use echosight_core::{
    AppConfig, AudioDevice, AudioOutputSpec, BlobDistanceAnalyzer, EchoError, MemoryDevice,
    MemorySurface, Mode, RawPcmFileDevice, Session, SpectrumProbe, SyntheticCamera, ToneGenerator,
};
use tracing_subscriber::EnvFilter;

fn main() -> echosight_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            mode,
            seconds,
            toggle_every,
            pcm_out,
        } => run_session(
            config.as_deref(),
            mode.into(),
            seconds,
            toggle_every,
            pcm_out.as_deref(),
        ),
        Commands::Tone {
            distance,
            config,
            output,
        } => run_tone(distance, config.as_deref(), &output),
        Commands::Config => {
            println!("{}", AppConfig::default().to_json_pretty()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> echosight_core::Result<AppConfig> {
    match path {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading configuration");
            AppConfig::from_path(path)
        }
        None => Ok(AppConfig::default()),
    }
}

fn run_session(
    config_path: Option<&Path>,
    mode: Mode,
    seconds: f64,
    toggle_every: Option<f64>,
    pcm_out: Option<&Path>,
) -> echosight_core::Result<()> {
    let run_for = duration_arg(seconds.max(0.0), "--seconds must be a finite number of seconds")?;
    let toggle_every = toggle_every
        .filter(|secs| *secs > 0.0)
        .map(|secs| duration_arg(secs, "--toggle-every must be a finite number of seconds"))
        .transpose()?;

    let config = load_config(config_path)?;
    let spec = AudioOutputSpec::for_tone(&config.tone);
    let device: Box<dyn AudioDevice> = match pcm_out {
        Some(path) => Box::new(RawPcmFileDevice::open(path, spec)?),
        None => Box::new(MemoryDevice::open(spec)),
    };
    let surface = MemorySurface::new(config.preview.width, config.preview.height);
    let surface_log = surface.log();

    tracing::info!(?mode, seconds, "starting synthetic session");
    let session = Session::start(
        &config,
        SyntheticCamera::new(config.preview.frame_rate),
        BlobDistanceAnalyzer::new(),
        device,
        surface,
        mode,
    )?;

    let started = Instant::now();
    let mut next_toggle = toggle_every.and_then(|every| started.checked_add(every));

    while started.elapsed() < run_for {
        thread::sleep(Duration::from_millis(20));
        if let (Some(at), Some(every)) = (next_toggle, toggle_every) {
            if Instant::now() >= at {
                session.mode().toggle();
                next_toggle = at.checked_add(every);
            }
        }
    }

    let report = session.shutdown();
    let surface_log = surface_log.lock();
    tracing::info!(
        processed = report.frames_processed,
        dropped = report.frames_dropped,
        skipped = report.frames_skipped,
        rendered = report.frames_rendered,
        posted = surface_log.posted,
        tones = report.tones_written,
        superseded = report.superseded_tones,
        fps = %report.fps_text,
        "session complete"
    );
    Ok(())
}

fn duration_arg(seconds: f64, message: &'static str) -> echosight_core::Result<Duration> {
    Duration::try_from_secs_f64(seconds).map_err(|_| EchoError::InvalidInput(message))
}

fn run_tone(distance: f64, config_path: Option<&Path>, output: &Path) -> echosight_core::Result<()> {
    let config = load_config(config_path)?;
    let mut generator = ToneGenerator::new(config.tone.clone());
    let (params, pcm) = generator.generate(distance);
    std::fs::write(output, pcm.as_bytes())?;

    let measured = SpectrumProbe::new().dominant_frequency(&pcm)?;
    tracing::info!(
        distance,
        frequency = params.frequency_hz,
        measured,
        samples = pcm.len_samples(),
        output = %output.display(),
        "wrote tone"
    );
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Turns the distance between two objects into a tone", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the feedback loop against the synthetic camera.
    Run {
        /// JSON configuration file; defaults are used when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Initial processing mode.
        #[arg(short, long, value_enum, default_value_t = ModeArg::Analyze)]
        mode: ModeArg,
        /// How long to run before shutting down.
        #[arg(short, long, default_value_t = 5.0)]
        seconds: f64,
        /// Flip between pass-through and analyze at this interval.
        #[arg(long)]
        toggle_every: Option<f64>,
        /// Append the raw PCM stream to this file instead of discarding it.
        #[arg(long)]
        pcm_out: Option<PathBuf>,
    },
    /// Synthesise a single tone for a distance and write it as raw PCM.
    Tone {
        /// Distance in pixels; frequencies below the configured floor are raised to it.
        distance: f64,
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long, default_value = "tone.pcm")]
        output: PathBuf,
    },
    /// Print the default configuration as JSON.
    Config,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    PassThrough,
    Analyze,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::PassThrough => Mode::PassThrough,
            ModeArg::Analyze => Mode::Analyze,
        }
    }
}
