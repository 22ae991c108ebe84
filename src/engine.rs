//! Audio device backend and the per-block control driver.
//!
//! `AuraSonicEngine` owns the cpal output stream; `BlockProcessor` is the
//! audio-thread state it moves into the callback: control smoothing, pause
//! fade, pose computation, spatialization and telemetry. The processor is a
//! plain struct so tests can drive blocks without a device.

use crate::config::{EngineState, RealtimeConfig};
use crate::error::{AuraSonicError, Result};
use crate::pose::PoseEngine;
use crate::spatial::{BlockControls, BlockSource, Spatializer};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Gain/focus smoothing time constant.
const SMOOTHING_TAU_SEC: f32 = 0.05;

/// Pause fade length.
const PAUSE_FADE_SEC: f32 = 0.008;

/// One-pole smoothing of the runtime controls toward their atomic targets.
/// Lives on the audio thread; `advance` is the only place the gain atomics
/// are read during a block.
pub struct ControlSmoother {
    master_gain: f32,
    focus: f32,
    loudspeaker_mix: f32,
    sub_mix: f32,
}

impl ControlSmoother {
    /// Start from the current targets so the first block has no glide.
    pub fn new(config: &RealtimeConfig) -> Self {
        Self {
            master_gain: config.master_gain.load(Ordering::Relaxed),
            focus: config.dbap_focus.load(Ordering::Relaxed),
            loudspeaker_mix: config.loudspeaker_mix.load(Ordering::Relaxed),
            sub_mix: config.sub_mix.load(Ordering::Relaxed),
        }
    }

    /// Advance every control toward its target over `dt` seconds and return
    /// the smoothed per-block snapshot.
    pub fn advance(&mut self, config: &RealtimeConfig, dt: f32) -> BlockControls {
        let alpha = 1.0 - (-dt / SMOOTHING_TAU_SEC).exp();

        let step = |current: &mut f32, target: f32| {
            *current += alpha * (target - *current);
        };
        step(
            &mut self.master_gain,
            config.master_gain.load(Ordering::Relaxed),
        );
        step(&mut self.focus, config.dbap_focus.load(Ordering::Relaxed));
        step(
            &mut self.loudspeaker_mix,
            config.loudspeaker_mix.load(Ordering::Relaxed),
        );
        step(&mut self.sub_mix, config.sub_mix.load(Ordering::Relaxed));

        BlockControls {
            master_gain: self.master_gain,
            focus: self.focus,
            loudspeaker_mix: self.loudspeaker_mix,
            sub_mix: self.sub_mix,
        }
    }
}

/// Linear per-sample gain ramp between playing (1) and paused (0).
pub struct PauseFade {
    gain: f32,
    target: f32,
    step: f32,
}

impl PauseFade {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            gain: 1.0,
            target: 1.0,
            step: 1.0 / (PAUSE_FADE_SEC * sample_rate as f32),
        }
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.target = if paused { 0.0 } else { 1.0 };
    }

    /// Fully faded out: the block driver skips processing entirely.
    pub fn fully_paused(&self) -> bool {
        self.target == 0.0 && self.gain == 0.0
    }

    /// True while the ramp is anywhere below unity.
    pub fn active(&self) -> bool {
        self.gain < 1.0 || self.target < 1.0
    }

    /// Step the ramp once per frame and scale all channels of that frame.
    pub fn apply(&mut self, data: &mut [f32], channels: usize) {
        for frame in data.chunks_mut(channels) {
            if self.gain < self.target {
                self.gain = (self.gain + self.step).min(self.target);
            } else if self.gain > self.target {
                self.gain = (self.gain - self.step).max(self.target);
            }
            for s in frame {
                *s *= self.gain;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn gain(&self) -> f32 {
        self.gain
    }
}

/// Audio-thread state: everything one block needs, pre-allocated.
pub struct BlockProcessor {
    config: Arc<RealtimeConfig>,
    state: Arc<EngineState>,
    streaming: Arc<dyn BlockSource + Send + Sync>,
    pose: PoseEngine,
    spatializer: Spatializer,
    smoother: ControlSmoother,
    fade: PauseFade,
    device_channels: usize,
    sample_rate: u32,
}

impl BlockProcessor {
    pub fn new(
        config: Arc<RealtimeConfig>,
        state: Arc<EngineState>,
        streaming: Arc<dyn BlockSource + Send + Sync>,
        pose: PoseEngine,
        spatializer: Spatializer,
        device_channels: usize,
    ) -> Self {
        let smoother = ControlSmoother::new(&config);
        let fade = PauseFade::new(config.sample_rate);
        let sample_rate = config.sample_rate;
        Self {
            config,
            state,
            streaming,
            pose,
            spatializer,
            smoother,
            fade,
            device_channels,
            sample_rate,
        }
    }

    pub fn device_channels(&self) -> usize {
        self.device_channels
    }

    /// Render one interleaved device buffer. Audio-thread-only; no
    /// allocation, locks or I/O anywhere below this call.
    pub fn process(&mut self, data: &mut [f32]) {
        let started = Instant::now();
        let n_frames = data.len() / self.device_channels;
        let block_dt = n_frames as f32 / self.sample_rate as f32;

        data.fill(0.0);

        // Pause edge: arm the fade whenever the control flips.
        self.fade
            .set_paused(self.config.paused.load(Ordering::Relaxed));

        // Fully paused: output stays silent and the frame counter freezes.
        if self.fade.fully_paused() {
            self.publish_cpu(started, block_dt);
            return;
        }

        let controls = self.smoother.advance(&self.config, block_dt);

        let current_frame = self.state.frame_counter.load(Ordering::Relaxed);
        let block_centre =
            (current_frame as f64 + n_frames as f64 * 0.5) / self.sample_rate as f64;

        self.pose.compute_positions(block_centre);
        self.spatializer.render_block(
            data,
            self.device_channels,
            self.streaming.as_ref(),
            self.pose.poses(),
            &controls,
            current_frame,
            n_frames,
        );

        if self.fade.active() {
            self.fade.apply(data, self.device_channels);
        }

        let new_frames = current_frame + n_frames as u64;
        self.state.frame_counter.store(new_frames, Ordering::Relaxed);
        self.state.playback_time_sec.store(
            new_frames as f64 / self.sample_rate as f64,
            Ordering::Relaxed,
        );

        self.publish_cpu(started, block_dt);
    }

    fn publish_cpu(&self, started: Instant, block_dt: f32) {
        let used = started.elapsed().as_secs_f32();
        let load = if block_dt > 0.0 { used / block_dt } else { 0.0 };
        self.state
            .cpu_load
            .store(load.clamp(0.0, 1.0), Ordering::Relaxed);
    }
}

/// Audio engine that owns the output stream.
pub struct AuraSonicEngine {
    config: Arc<RealtimeConfig>,
    stream: Option<cpal::Stream>,
    is_running: Arc<AtomicBool>,
}

impl AuraSonicEngine {
    pub fn new(config: Arc<RealtimeConfig>) -> Self {
        Self {
            config,
            stream: None,
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Open the default output device with the processor's channel count and
    /// start streaming. The processor moves onto the audio thread.
    pub fn start(&mut self, mut processor: BlockProcessor) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let host = cpal::default_host();
        let device = host.default_output_device().ok_or_else(|| {
            AuraSonicError::AudioDevice("no default output device available".into())
        })?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".into());

        let channels = processor.device_channels();
        let stream_config = cpal::StreamConfig {
            channels: channels as u16,
            sample_rate: cpal::SampleRate(self.config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(self.config.buffer_size as u32),
        };

        log::info!(
            "Opening audio device '{}': {} channels, {} Hz, {} frames (~{:.1} ms latency)",
            device_name,
            channels,
            self.config.sample_rate,
            self.config.buffer_size,
            self.config.buffer_size as f32 / self.config.sample_rate as f32 * 1000.0
        );

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    processor.process(data);
                },
                move |err| {
                    log::error!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| AuraSonicError::AudioDevice(format!("failed to build stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| AuraSonicError::AudioDevice(format!("failed to start stream: {}", e)))?;

        self.stream = Some(stream);
        self.is_running.store(true, Ordering::Relaxed);
        self.config.playing.store(true, Ordering::Relaxed);
        log::info!("Audio stream started");

        Ok(())
    }

    /// Stop the stream. No more callbacks run after this returns; the
    /// processor is dropped with the stream.
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.is_running.store(false, Ordering::Relaxed);
            self.config.playing.store(false, Ordering::Relaxed);
            drop(stream);
            log::info!("Audio stream stopped");
        }
    }
}

impl Drop for AuraSonicEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Speaker, SpeakerLayout};
    use crate::scene::{Keyframe, SpatialScene, TimeUnit};
    use glam::Vec3;
    use std::collections::BTreeMap;

    const SR: u32 = 48000;
    const BLOCK: usize = 480; // 10 ms

    struct ConstSource;

    impl BlockSource for ConstSource {
        fn block_into(&self, _name: &str, _start_frame: u64, out: &mut [f32]) {
            out.fill(1.0);
        }
    }

    fn ring_layout(n: usize) -> SpeakerLayout {
        SpeakerLayout {
            speakers: (0..n)
                .map(|i| Speaker {
                    azimuth: i as f32 * std::f32::consts::TAU / n as f32,
                    elevation: 0.0,
                    radius: 1.0,
                })
                .collect(),
            subwoofers: Vec::new(),
        }
    }

    fn front_scene() -> SpatialScene {
        let mut sources = BTreeMap::new();
        sources.insert(
            "1.1".to_string(),
            vec![Keyframe {
                time: 0.0,
                dir: Vec3::new(0.0, 1.0, 0.0),
            }],
        );
        SpatialScene {
            sample_rate: SR,
            time_unit: TimeUnit::Seconds,
            sources,
            duration: None,
        }
    }

    fn processor(config: &Arc<RealtimeConfig>, state: &Arc<EngineState>) -> BlockProcessor {
        let layout = ring_layout(8);
        let mut pose = PoseEngine::new(config.clone());
        pose.load_scene(&front_scene(), &layout);
        let spatializer = Spatializer::new(&layout, config).unwrap();
        let channels = spatializer.output_channels();
        BlockProcessor::new(
            config.clone(),
            state.clone(),
            Arc::new(ConstSource),
            pose,
            spatializer,
            channels,
        )
    }

    fn peak_channel0(data: &[f32], channels: usize) -> f32 {
        data.chunks(channels).map(|f| f[0].abs()).fold(0.0, f32::max)
    }

    #[test]
    fn test_smoother_converges_with_expected_alpha() {
        let config = RealtimeConfig::new(SR, 512);
        let mut smoother = ControlSmoother::new(&config);

        config.master_gain.store(1.0, Ordering::Relaxed);
        let dt = 0.01f32;
        let controls = smoother.advance(&config, dt);

        let alpha = 1.0 - (-dt / SMOOTHING_TAU_SEC).exp();
        let expected = 0.5 + alpha * (1.0 - 0.5);
        assert!((controls.master_gain - expected).abs() < 1e-6);

        // A few time constants later the value has essentially converged.
        for _ in 0..50 {
            smoother.advance(&config, dt);
        }
        let controls = smoother.advance(&config, dt);
        assert!((controls.master_gain - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_pause_fade_ramp() {
        let mut fade = PauseFade::new(SR);
        assert!(!fade.active());

        fade.set_paused(true);
        let fade_frames = (PAUSE_FADE_SEC * SR as f32) as usize; // 384

        let mut data = vec![1.0f32; BLOCK];
        fade.apply(&mut data, 1);

        // Monotone decay, fully silent after the 8 ms ramp.
        for pair in data.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-7);
        }
        assert!(data[fade_frames + 1] == 0.0);
        assert!(fade.fully_paused());

        // Fade back in.
        fade.set_paused(false);
        let mut data = vec![1.0f32; BLOCK];
        fade.apply(&mut data, 1);
        for pair in data.windows(2) {
            assert!(pair[1] >= pair[0] - 1e-7);
        }
        assert!((fade.gain() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_process_renders_and_advances_telemetry() {
        let config = Arc::new(RealtimeConfig::new(SR, BLOCK));
        config.master_gain.store(1.0, Ordering::Relaxed);
        let state = Arc::new(EngineState::new());
        let mut proc = processor(&config, &state);
        let channels = proc.device_channels();

        let mut data = vec![0.0f32; BLOCK * channels];
        proc.process(&mut data);

        assert!(peak_channel0(&data, channels) > 0.9);
        assert_eq!(state.frame_counter.load(Ordering::Relaxed), BLOCK as u64);
        let t = state.playback_time_sec.load(Ordering::Relaxed);
        assert!((t - BLOCK as f64 / SR as f64).abs() < 1e-9);
    }

    #[test]
    fn test_pause_freezes_frame_counter_after_fade() {
        // Scenario: pause mid-playback; the fade block decays to zero and
        // every later block leaves the counter untouched and the output
        // silent.
        let config = Arc::new(RealtimeConfig::new(SR, BLOCK));
        config.master_gain.store(1.0, Ordering::Relaxed);
        let state = Arc::new(EngineState::new());
        let mut proc = processor(&config, &state);
        let channels = proc.device_channels();
        let mut data = vec![0.0f32; BLOCK * channels];

        // ~100 ms of normal playback.
        for _ in 0..10 {
            proc.process(&mut data);
        }
        let frames_at_pause = state.frame_counter.load(Ordering::Relaxed);
        assert_eq!(frames_at_pause, 10 * BLOCK as u64);

        config.paused.store(true, Ordering::Relaxed);

        // Fade block: decays monotonically, silent by the 8 ms mark.
        proc.process(&mut data);
        let ch0: Vec<f32> = data.chunks(channels).map(|f| f[0]).collect();
        for pair in ch0.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-6);
        }
        let fade_frames = (PAUSE_FADE_SEC * SR as f32) as usize;
        assert!(ch0[fade_frames + 1..].iter().all(|&s| s == 0.0));
        let frames_after_fade = state.frame_counter.load(Ordering::Relaxed);

        // Fully paused: silence, frozen counter.
        for _ in 0..5 {
            proc.process(&mut data);
            assert!(data.iter().all(|&s| s == 0.0));
            assert_eq!(
                state.frame_counter.load(Ordering::Relaxed),
                frames_after_fade
            );
        }

        // Resume: fade-in block, counter advances again.
        config.paused.store(false, Ordering::Relaxed);
        proc.process(&mut data);
        assert!(
            state.frame_counter.load(Ordering::Relaxed) > frames_after_fade
        );
        let ch0: Vec<f32> = data.chunks(channels).map(|f| f[0]).collect();
        for pair in ch0.windows(2) {
            assert!(pair[1] >= pair[0] - 1e-6);
        }
        assert!(peak_channel0(&data, channels) > 0.9);
    }

    #[test]
    fn test_master_gain_change_is_smoothed() {
        let config = Arc::new(RealtimeConfig::new(SR, BLOCK));
        config.master_gain.store(1.0, Ordering::Relaxed);
        let state = Arc::new(EngineState::new());
        let mut proc = processor(&config, &state);
        let channels = proc.device_channels();
        let mut data = vec![0.0f32; BLOCK * channels];

        proc.process(&mut data);
        let before = peak_channel0(&data, channels);

        // Dropping the slider to zero does not mute instantly; the smoothed
        // gain glides with τ = 50 ms.
        config.master_gain.store(0.0, Ordering::Relaxed);
        proc.process(&mut data);
        let after = peak_channel0(&data, channels);
        assert!(after < before);
        assert!(after > 0.5, "one 10 ms block cannot cross a 50 ms glide");

        for _ in 0..50 {
            proc.process(&mut data);
        }
        assert!(peak_channel0(&data, channels) < 1e-3);
    }
}
