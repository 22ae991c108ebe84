//! DBAP spatialization over the speaker layout.
//!
//! The spatializer renders every valid source pose into an internal
//! channel-major buffer sized for the layout (speakers on consecutive
//! channels from 0, subwoofers on their raw device channels), applies the
//! loudspeaker/sub mix trims, then copies to the device buffer through the
//! output remap (identity fast path when no remap is configured).
//!
//! Threading: `new` / `set_remap` / `compute_focus_compensation` are
//! setup-thread-only, the latter strictly while the stream is stopped
//! (it borrows the render buffer for a simulated pass). `render_block` is
//! audio-thread-only and allocation-free; every buffer it touches is
//! pre-allocated here at init.

mod dbap;

pub use dbap::DbapPanner;

use crate::config::RealtimeConfig;
use crate::error::{AuraSonicError, Result};
use crate::layout::SpeakerLayout;
use crate::pose::SourcePose;
use crate::remap::OutputRemap;
use dbap::PannerSpeaker;
use glam::Vec3;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// LFE compensation factor applied before splitting across subwoofers.
const SUB_COMPENSATION: f32 = 0.95;

/// Focus compensation clamp: ±10 dB as linear gain.
const COMPENSATION_MIN: f32 = 0.316;
const COMPENSATION_MAX: f32 = 3.162;

/// Per-block control snapshot handed to the spatializer by the block driver.
/// Values are already smoothed; the driver is the only place config atomics
/// are read during a block.
#[derive(Debug, Clone, Copy)]
pub struct BlockControls {
    pub master_gain: f32,
    pub focus: f32,
    pub loudspeaker_mix: f32,
    pub sub_mix: f32,
}

/// Anything that can serve per-source mono blocks to the render path.
/// Implemented by the streaming layer; test doubles implement it directly.
pub trait BlockSource {
    /// Fill `out` with the source's samples for `[start_frame, start_frame + out.len())`.
    /// Unknown sources and unavailable ranges yield silence.
    fn block_into(&self, name: &str, start_frame: u64, out: &mut [f32]);
}

/// Channel-major audio block buffer (`channels × frames`).
pub struct RenderBuffer {
    data: Vec<f32>,
    channels: usize,
    frames: usize,
}

impl RenderBuffer {
    pub fn new(channels: usize, frames: usize) -> Self {
        Self {
            data: vec![0.0; channels * frames],
            channels,
            frames,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn zero(&mut self) {
        self.data.fill(0.0);
    }

    pub fn channel(&self, ch: usize) -> &[f32] {
        &self.data[ch * self.frames..(ch + 1) * self.frames]
    }

    pub fn channel_mut(&mut self, ch: usize) -> &mut [f32] {
        &mut self.data[ch * self.frames..(ch + 1) * self.frames]
    }
}

/// DBAP panning engine for the real-time pipeline.
pub struct Spatializer {
    dbap: DbapPanner,

    num_speakers: usize,
    subwoofer_channels: Vec<usize>,
    is_sub_channel: Vec<bool>,
    layout_radius: f32,
    output_channels: usize,

    // Audio-thread-owned after start.
    render: RenderBuffer,
    source_buf: Vec<f32>,

    // Set once before start; the table is immutable afterwards.
    remap: Option<Arc<OutputRemap>>,

    speakers: Vec<PannerSpeaker>,
}

impl Spatializer {
    /// Build the speaker array and pre-allocate the render buffers. Writes
    /// the layout-derived output channel count into the config. Must be
    /// called before the audio stream starts.
    pub fn new(layout: &SpeakerLayout, config: &Arc<RealtimeConfig>) -> Result<Self> {
        if layout.speakers.is_empty() {
            return Err(AuraSonicError::Layout("layout has no speakers".into()));
        }

        // Speakers occupy consecutive 0-based render channels; their layout
        // order is the channel order.
        let speakers: Vec<PannerSpeaker> = layout
            .speakers
            .iter()
            .enumerate()
            .map(|(i, spk)| PannerSpeaker {
                position: spk.position(),
                channel: i,
            })
            .collect();

        let output_channels = layout.output_channels();
        config
            .output_channels
            .store(output_channels, Ordering::Relaxed);

        let mut is_sub_channel = vec![false; output_channels];
        for &sub in &layout.subwoofers {
            if sub < output_channels {
                is_sub_channel[sub] = true;
            }
        }

        let focus = config.dbap_focus.load(Ordering::Relaxed);
        log::info!(
            "Spatializer: {} speakers, {} subwoofer channel(s), {} output channels, focus {:.2}",
            speakers.len(),
            layout.subwoofers.len(),
            output_channels,
            focus
        );

        Ok(Self {
            dbap: DbapPanner::new(speakers.clone(), focus),
            num_speakers: layout.num_speakers(),
            subwoofer_channels: layout.subwoofers.clone(),
            is_sub_channel,
            layout_radius: layout.median_radius(),
            output_channels,
            render: RenderBuffer::new(output_channels, config.buffer_size),
            source_buf: vec![0.0; config.buffer_size],
            remap: None,
            speakers,
        })
    }

    /// Install an output remap. Must precede the stream start; `None`
    /// restores the identity fast path.
    pub fn set_remap(&mut self, remap: Option<Arc<OutputRemap>>) {
        self.remap = remap;
    }

    pub fn output_channels(&self) -> usize {
        self.output_channels
    }

    pub fn num_speakers(&self) -> usize {
        self.num_speakers
    }

    /// Render one audio block into the interleaved device buffer.
    ///
    /// The device buffer must be zeroed by the caller; both copy paths
    /// accumulate into it. Audio-thread-only.
    #[allow(clippy::too_many_arguments)]
    pub fn render_block(
        &mut self,
        device_out: &mut [f32],
        device_channels: usize,
        streaming: &dyn BlockSource,
        poses: &[SourcePose],
        controls: &BlockControls,
        current_frame: u64,
        n_frames: usize,
    ) {
        let n_frames = n_frames.min(self.render.frames());

        self.render.zero();
        self.dbap.set_focus(controls.focus);

        for pose in poses {
            if !pose.is_valid {
                continue;
            }

            if pose.is_lfe {
                if self.subwoofer_channels.is_empty() {
                    continue;
                }

                streaming.block_into(&pose.name, current_frame, &mut self.source_buf[..n_frames]);

                let sub_gain = controls.master_gain * SUB_COMPENSATION
                    / self.subwoofer_channels.len() as f32;

                for &sub in &self.subwoofer_channels {
                    if sub >= self.output_channels {
                        continue;
                    }
                    let channel = self.render.channel_mut(sub);
                    for f in 0..n_frames {
                        channel[f] += self.source_buf[f] * sub_gain;
                    }
                }
                continue;
            }

            streaming.block_into(&pose.name, current_frame, &mut self.source_buf[..n_frames]);
            for s in &mut self.source_buf[..n_frames] {
                *s *= controls.master_gain;
            }

            self.dbap
                .render(&mut self.render, pose.position, &self.source_buf, n_frames);
        }

        // Mix trims, unity-guarded so the inactive case costs nothing.
        if controls.loudspeaker_mix != 1.0 {
            for ch in 0..self.output_channels {
                if self.is_sub_channel[ch] {
                    continue;
                }
                for s in &mut self.render.channel_mut(ch)[..n_frames] {
                    *s *= controls.loudspeaker_mix;
                }
            }
        }
        if controls.sub_mix != 1.0 {
            for &sub in &self.subwoofer_channels {
                if sub >= self.output_channels {
                    continue;
                }
                for s in &mut self.render.channel_mut(sub)[..n_frames] {
                    *s *= controls.sub_mix;
                }
            }
        }

        self.copy_to_device(device_out, device_channels, n_frames);
    }

    /// Copy the render buffer into the interleaved device buffer through the
    /// remap. Non-finite samples are replaced by silence here.
    fn copy_to_device(&self, device_out: &mut [f32], device_channels: usize, n_frames: usize) {
        let identity = self.remap.as_ref().map_or(true, |r| r.identity());

        if identity {
            let copy_channels = self.output_channels.min(device_channels);
            for ch in 0..copy_channels {
                let src = self.render.channel(ch);
                for f in 0..n_frames {
                    let s = src[f];
                    if s.is_finite() {
                        device_out[f * device_channels + ch] += s;
                    }
                }
            }
            return;
        }

        let remap = self.remap.as_ref().expect("non-identity remap is present");
        for entry in remap.entries() {
            if entry.layout >= self.output_channels || entry.device >= device_channels {
                continue;
            }
            let src = self.render.channel(entry.layout);
            for f in 0..n_frames {
                let s = src[f];
                if s.is_finite() {
                    device_out[f * device_channels + entry.device] += s;
                }
            }
        }
    }

    /// Measure the loudness shift the current focus causes at a canonical
    /// front reference position and write the compensating loudspeaker mix
    /// into the config, clamped to ±10 dB.
    ///
    /// Setup-thread-only, and only while the audio stream is stopped: the
    /// reference pass allocates and borrows the render buffer.
    pub fn compute_focus_compensation(&mut self, config: &RealtimeConfig) -> f32 {
        const TEST_FRAMES: usize = 64;

        let ref_pos = Vec3::new(0.0, self.layout_radius, 0.0);
        let impulse = vec![1.0f32; TEST_FRAMES];

        let current = self.measure_main_power(self.dbap.focus(), ref_pos, &impulse);
        let reference = self.measure_main_power(0.0, ref_pos, &impulse);

        let mut compensation = 1.0;
        if current > 1e-10 && reference > 1e-10 {
            compensation = (reference / current).sqrt();
        }
        compensation = compensation.clamp(COMPENSATION_MIN, COMPENSATION_MAX);

        log::info!(
            "Focus auto-compensation: focus {:.2} → loudspeaker mix {:.3} ({:+.1} dB)",
            self.dbap.focus(),
            compensation,
            20.0 * compensation.log10()
        );

        config
            .loudspeaker_mix
            .store(compensation, Ordering::Relaxed);
        compensation
    }

    /// Mean square over the non-subwoofer channels after rendering a unit
    /// impulse train at `pos` with the given focus.
    fn measure_main_power(&self, focus: f32, pos: Vec3, impulse: &[f32]) -> f32 {
        let mut panner = DbapPanner::new(self.speakers.clone(), focus);
        let mut io = RenderBuffer::new(self.output_channels, impulse.len());
        panner.render(&mut io, pos, impulse, impulse.len());

        let mut power = 0.0f32;
        let mut main_count = 0usize;
        for ch in 0..self.output_channels {
            if self.is_sub_channel[ch] {
                continue;
            }
            for &s in io.channel(ch) {
                power += s * s;
            }
            main_count += 1;
        }
        if main_count > 0 {
            power /= (main_count * impulse.len()) as f32;
        }
        power
    }
}
