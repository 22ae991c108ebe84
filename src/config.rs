//! Shared configuration and runtime telemetry.
//!
//! `RealtimeConfig` is created once at startup. The init-time fields never
//! change after setup; the control fields are atomics that the main thread
//! writes and the audio thread reads with relaxed ordering once per block.
//! Stale-by-one-block is acceptable for every control here — a slider move
//! becomes audible within one buffer period and is smoothed afterwards.
//!
//! `EngineState` is the telemetry mirror: written only by the audio thread
//! (except the set-once scene fields), read by the monitoring loop.

use atomic_float::{AtomicF32, AtomicF64};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// Elevation handling for directions outside the layout's speaker coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElevationMode {
    /// Hard clip elevation to the layout bounds.
    Clamp,
    /// Default. Content elevations in [0, +π/2] map linearly onto the layout range.
    RescaleAtmosUp,
    /// Content elevations in [-π/2, +π/2] map linearly onto the layout range.
    RescaleFullSphere,
}

impl ElevationMode {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Clamp,
            2 => Self::RescaleFullSphere,
            _ => Self::RescaleAtmosUp,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Clamp => 0,
            Self::RescaleAtmosUp => 1,
            Self::RescaleFullSphere => 2,
        }
    }
}

/// Global configuration for the real-time engine.
pub struct RealtimeConfig {
    // Init-time constants, read-only after setup.
    pub sample_rate: u32,
    pub buffer_size: usize,

    /// Output channel count derived from the layout by the spatializer
    /// (`max(num_speakers, max_subwoofer_channel + 1)`). Set once during
    /// setup, before the stream opens.
    pub output_channels: AtomicUsize,

    // Runtime controls. Relaxed on both sides.
    pub master_gain: AtomicF32,
    pub dbap_focus: AtomicF32,
    pub loudspeaker_mix: AtomicF32,
    pub sub_mix: AtomicF32,
    pub focus_auto_compensation: AtomicBool,
    pub elevation_mode: AtomicU8,

    // Playback control.
    pub paused: AtomicBool,
    pub playing: AtomicBool,
    pub should_exit: AtomicBool,
}

impl RealtimeConfig {
    pub fn new(sample_rate: u32, buffer_size: usize) -> Self {
        Self {
            sample_rate,
            buffer_size,
            output_channels: AtomicUsize::new(0),
            master_gain: AtomicF32::new(0.5),
            dbap_focus: AtomicF32::new(1.0),
            loudspeaker_mix: AtomicF32::new(1.0),
            sub_mix: AtomicF32::new(1.0),
            focus_auto_compensation: AtomicBool::new(false),
            elevation_mode: AtomicU8::new(ElevationMode::RescaleAtmosUp.as_u8()),
            paused: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            should_exit: AtomicBool::new(false),
        }
    }

    pub fn elevation_mode(&self) -> ElevationMode {
        ElevationMode::from_u8(self.elevation_mode.load(Ordering::Relaxed))
    }

    pub fn set_elevation_mode(&self, mode: ElevationMode) {
        self.elevation_mode.store(mode.as_u8(), Ordering::Relaxed);
    }
}

/// Runtime state published by the audio thread for monitoring.
pub struct EngineState {
    /// Current playback position in frames.
    pub frame_counter: AtomicU64,
    /// Current playback time in seconds.
    pub playback_time_sec: AtomicF64,
    /// Audio-callback CPU usage, clamped to [0, 1].
    pub cpu_load: AtomicF32,
    /// Buffer underrun count.
    pub xrun_count: AtomicU64,

    // Scene info, set once at load time.
    pub num_sources: AtomicUsize,
    pub num_speakers: AtomicUsize,
    pub scene_duration_sec: AtomicF64,
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            frame_counter: AtomicU64::new(0),
            playback_time_sec: AtomicF64::new(0.0),
            cpu_load: AtomicF32::new(0.0),
            xrun_count: AtomicU64::new(0),
            num_sources: AtomicUsize::new(0),
            num_speakers: AtomicUsize::new(0),
            scene_duration_sec: AtomicF64::new(0.0),
        }
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}
