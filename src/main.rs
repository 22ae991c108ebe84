//! Command-line front end for the AuraSonic real-time engine.
//!
//! Loads the layout, scene and audio, wires the engine together and runs a
//! monitoring loop until the scene has played out or the user quits.
//! Exit codes: 0 success, 1 argument error, 2 or higher setup failure.

use anyhow::{bail, Context};
use aurasonic::config::{ElevationMode, EngineState, RealtimeConfig};
use aurasonic::engine::{AuraSonicEngine, BlockProcessor};
use aurasonic::layout::SpeakerLayout;
use aurasonic::pose::PoseEngine;
use aurasonic::remap::OutputRemap;
use aurasonic::scene::SpatialScene;
use aurasonic::spatial::Spatializer;
use aurasonic::streaming::Streaming;
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Real-time multi-source spatial audio renderer.
#[derive(Parser, Debug)]
#[command(author, version, about)]
#[command(group(
    clap::ArgGroup::new("audio_input")
        .required(true)
        .args(["sources", "input"])
))]
struct Args {
    /// Speaker layout JSON file.
    #[arg(long)]
    layout: PathBuf,

    /// Scene JSON file (per-source direction trajectories).
    #[arg(long)]
    scene: PathBuf,

    /// Folder containing one mono WAV per source key.
    #[arg(long)]
    sources: Option<PathBuf>,

    /// One interleaved multichannel WAV instead of mono files.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Audio sample rate in Hz.
    #[arg(long, default_value_t = 48000)]
    sample_rate: u32,

    /// Frames per audio callback buffer.
    #[arg(long, default_value_t = 512)]
    buffer_size: usize,

    /// Master gain, 0.0 to 1.0.
    #[arg(long, default_value_t = 0.5)]
    gain: f32,

    /// Post-pan main speaker trim in dB.
    #[arg(long, default_value_t = 0.0)]
    speaker_mix_db: f32,

    /// Post-pan subwoofer trim in dB.
    #[arg(long, default_value_t = 0.0)]
    sub_mix_db: f32,

    /// DBAP focus (distance rolloff exponent).
    #[arg(long, default_value_t = 1.0)]
    focus: f32,

    /// Elevation handling for directions outside speaker coverage.
    #[arg(long, value_enum, default_value_t = ElevationModeArg::AtmosUp)]
    elevation_mode: ElevationModeArg,

    /// Measure the focus loudness shift and set the speaker trim from it.
    #[arg(long)]
    focus_compensation: bool,

    /// Layout-to-device channel remap CSV.
    #[arg(long)]
    remap: Option<PathBuf>,

    /// Device output channel count (default: derived from the layout).
    #[arg(long)]
    channels: Option<usize>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ElevationModeArg {
    Clamp,
    AtmosUp,
    FullSphere,
}

impl From<ElevationModeArg> for ElevationMode {
    fn from(arg: ElevationModeArg) -> Self {
        match arg {
            ElevationModeArg::Clamp => ElevationMode::Clamp,
            ElevationModeArg::AtmosUp => ElevationMode::RescaleAtmosUp,
            ElevationModeArg::FullSphere => ElevationMode::RescaleFullSphere,
        }
    }
}

fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(1);
        }
        Err(e) => {
            // --help / --version.
            let _ = e.print();
            std::process::exit(0);
        }
    };

    if let Err(e) = run(args) {
        log::error!("{:#}", e);
        std::process::exit(2);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    if args.gain < 0.0 || args.gain > 1.0 {
        bail!("--gain must be in [0, 1]");
    }

    // ── Configuration ────────────────────────────────────────────────────
    let config = Arc::new(RealtimeConfig::new(args.sample_rate, args.buffer_size));
    config.master_gain.store(args.gain, Ordering::Relaxed);
    config.dbap_focus.store(args.focus, Ordering::Relaxed);
    config
        .loudspeaker_mix
        .store(db_to_linear(args.speaker_mix_db), Ordering::Relaxed);
    config
        .sub_mix
        .store(db_to_linear(args.sub_mix_db), Ordering::Relaxed);
    config
        .focus_auto_compensation
        .store(args.focus_compensation, Ordering::Relaxed);
    config.set_elevation_mode(args.elevation_mode.into());

    let state = Arc::new(EngineState::new());

    // ── Scene and layout ─────────────────────────────────────────────────
    let layout = SpeakerLayout::load(&args.layout).context("loading speaker layout")?;
    let scene = SpatialScene::load(&args.scene).context("loading scene")?;

    state
        .num_speakers
        .store(layout.num_speakers(), Ordering::Relaxed);
    state
        .scene_duration_sec
        .store(scene.duration_sec(), Ordering::Relaxed);

    // ── Streaming (opens files, preloads first chunks) ───────────────────
    let streaming = Arc::new(match (&args.sources, &args.input) {
        (Some(folder), None) => {
            Streaming::load_mono_scene(&scene, folder, &config, state.clone())
                .context("loading mono sources")?
        }
        (None, Some(file)) => {
            Streaming::load_multichannel_scene(&scene, file, &config, state.clone())
                .context("loading multichannel input")?
        }
        _ => unreachable!("clap enforces exactly one audio input"),
    });

    // ── Pose and spatializer ─────────────────────────────────────────────
    let mut pose = PoseEngine::new(config.clone());
    pose.load_scene(&scene, &layout);

    let mut spatializer = Spatializer::new(&layout, &config).context("building spatializer")?;
    let output_channels = spatializer.output_channels();
    let device_channels = args
        .channels
        .unwrap_or(output_channels)
        .max(output_channels);

    if let Some(csv) = &args.remap {
        let remap = OutputRemap::load(csv, output_channels, device_channels)
            .context("loading remap CSV")?;
        spatializer.set_remap(Some(Arc::new(remap)));
    }

    if args.focus_compensation {
        // Stream is not running yet; this is the one safe moment.
        spatializer.compute_focus_compensation(&config);
    }

    // ── Start loader and audio stream ────────────────────────────────────
    streaming.start_loader();

    let total_frames = streaming.max_total_frames();
    let processor = BlockProcessor::new(
        config.clone(),
        state.clone(),
        streaming.clone(),
        pose,
        spatializer,
        device_channels,
    );

    let mut engine = AuraSonicEngine::new(config.clone());
    engine.start(processor).context("starting audio stream")?;

    spawn_stdin_controls(config.clone());
    log::info!("Playing. Commands: p + Enter toggles pause, q + Enter quits.");

    // ── Monitoring loop ──────────────────────────────────────────────────
    while !config.should_exit.load(Ordering::Relaxed) {
        let frames = state.frame_counter.load(Ordering::Relaxed);
        let time = state.playback_time_sec.load(Ordering::Relaxed);
        let cpu = state.cpu_load.load(Ordering::Relaxed);
        let xruns = state.xrun_count.load(Ordering::Relaxed);

        print!(
            "\r  t={:7.1}s | cpu={:4.1}% | frames={:>12} | xruns={}   ",
            time,
            cpu * 100.0,
            frames,
            xruns
        );
        let _ = std::io::stdout().flush();

        if frames >= total_frames && !config.paused.load(Ordering::Relaxed) {
            println!();
            log::info!("Scene finished");
            break;
        }

        std::thread::sleep(Duration::from_millis(500));
    }
    println!();

    // ── Shutdown: stop the stream first, then the loader ─────────────────
    engine.stop();
    streaming.shutdown();

    log::info!(
        "Done: {} frames ({:.1} s), {} xruns",
        state.frame_counter.load(Ordering::Relaxed),
        state.playback_time_sec.load(Ordering::Relaxed),
        state.xrun_count.load(Ordering::Relaxed)
    );

    Ok(())
}

/// Minimal runtime control surface: `p` toggles pause, `q` quits.
fn spawn_stdin_controls(config: Arc<RealtimeConfig>) {
    std::thread::Builder::new()
        .name("aurasonic-stdin".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match line.trim() {
                    "p" => {
                        let paused = !config.paused.load(Ordering::Relaxed);
                        config.paused.store(paused, Ordering::Relaxed);
                        log::info!("{}", if paused { "Paused" } else { "Resumed" });
                    }
                    "q" => {
                        config.should_exit.store(true, Ordering::Relaxed);
                        break;
                    }
                    _ => {}
                }
            }
        })
        .expect("failed to spawn stdin thread");
}
