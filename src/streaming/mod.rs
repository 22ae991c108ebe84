//! Lock-free disk-to-RAM audio delivery.
//!
//! Each registered source streams through a pair of pre-allocated chunk
//! buffers; a background loader keeps the inactive buffer one chunk ahead of
//! playback. The audio thread's `get_block`/`get_sample` never allocate,
//! lock, or touch a file handle. Two file modes share the identical audio
//! read path: one mono WAV per source, or a single interleaved file fanned
//! out to many logical sources by the shared multichannel reader — only the
//! loader's bulk-read step branches.

mod multichannel;
mod source;
mod wav;

use crate::config::{EngineState, RealtimeConfig};
use crate::error::{AuraSonicError, Result};
use crate::scene::SpatialScene;
use crate::spatial::BlockSource;
use multichannel::{parse_channel_index, MultichannelReader};
use source::SourceStream;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wav::WavChunkReader;

/// Chunk size for each double buffer: 5 seconds of audio per slot.
/// At 48 kHz that is 240,000 frames (~940 KB) per buffer; two buffers per
/// source keeps 80 mono sources around 150 MB.
pub fn default_chunk_frames(sample_rate: u32) -> u64 {
    sample_rate as u64 * 5
}

/// How often the loader scans for buffers to refill. Well under the audio
/// buffer period (~10 ms at 512/48k) but cheap enough to idle.
const LOADER_POLL: Duration = Duration::from_millis(2);

enum StreamMode {
    /// One mono file per source; each stream owns its reader.
    Mono,
    /// One interleaved file fanned out to the mapped streams.
    Multichannel(MultichannelReader),
}

/// Manages all source streams and the background loader.
pub struct Streaming {
    streams: HashMap<String, Arc<SourceStream>>,
    mode: StreamMode,
    state: Arc<EngineState>,
    loader_running: Arc<AtomicBool>,
    loader_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Streaming {
    /// Open one mono WAV per scene source from `folder` (`<key>.wav`) and
    /// synchronously preload each source's first chunk. Files that are
    /// missing, non-mono, or at the wrong sample rate are skipped with a
    /// warning; ending up with no streams at all is a setup error.
    pub fn load_mono_scene(
        scene: &SpatialScene,
        folder: &Path,
        config: &RealtimeConfig,
        state: Arc<EngineState>,
    ) -> Result<Self> {
        Self::load_mono_scene_with_chunk(
            scene,
            folder,
            config,
            state,
            default_chunk_frames(config.sample_rate),
        )
    }

    pub fn load_mono_scene_with_chunk(
        scene: &SpatialScene,
        folder: &Path,
        config: &RealtimeConfig,
        state: Arc<EngineState>,
        chunk_frames: u64,
    ) -> Result<Self> {
        log::info!(
            "Streaming: loading {} sources from {}",
            scene.sources.len(),
            folder.display()
        );

        let mut streams = HashMap::new();
        for name in scene.sources.keys() {
            let path = folder.join(format!("{}.wav", name));
            if !path.exists() {
                log::warn!("Missing source WAV {}, skipping", path.display());
                continue;
            }

            let reader = match WavChunkReader::open(&path) {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("Failed to open {}: {}, skipping", path.display(), e);
                    continue;
                }
            };
            if reader.channels() != 1 {
                log::warn!(
                    "{} has {} channels (expected mono), skipping",
                    path.display(),
                    reader.channels()
                );
                continue;
            }
            if reader.sample_rate() != config.sample_rate {
                log::warn!(
                    "{} is {} Hz (engine is {} Hz), skipping",
                    path.display(),
                    reader.sample_rate(),
                    config.sample_rate
                );
                continue;
            }

            let stream = Arc::new(SourceStream::new_mono(name, reader, chunk_frames));
            if let Err(e) = stream.preload_first_chunk() {
                log::warn!("{}, skipping", e);
                continue;
            }

            log::info!(
                "  {} — {} frames ({:.1} s){}",
                name,
                stream.total_frames(),
                stream.total_frames() as f64 / config.sample_rate as f64,
                if stream.is_lfe() { " [LFE]" } else { "" }
            );
            streams.insert(name.clone(), stream);
        }

        if streams.is_empty() {
            return Err(AuraSonicError::Streaming(
                "no source WAV could be opened".into(),
            ));
        }

        state.num_sources.store(streams.len(), Ordering::Relaxed);
        log::info!("Streaming: {} sources loaded", streams.len());

        Ok(Self {
            streams,
            mode: StreamMode::Mono,
            state,
            loader_running: Arc::new(AtomicBool::new(false)),
            loader_handle: Mutex::new(None),
        })
    }

    /// Open one interleaved file and map scene sources onto its channels
    /// (`N.1` → channel N−1, `LFE` → channel 3). The first chunk is read and
    /// fanned out synchronously.
    pub fn load_multichannel_scene(
        scene: &SpatialScene,
        path: &Path,
        config: &RealtimeConfig,
        state: Arc<EngineState>,
    ) -> Result<Self> {
        Self::load_multichannel_scene_with_chunk(
            scene,
            path,
            config,
            state,
            default_chunk_frames(config.sample_rate),
        )
    }

    pub fn load_multichannel_scene_with_chunk(
        scene: &SpatialScene,
        path: &Path,
        config: &RealtimeConfig,
        state: Arc<EngineState>,
        chunk_frames: u64,
    ) -> Result<Self> {
        log::info!(
            "Streaming: mapping {} sources onto multichannel file {}",
            scene.sources.len(),
            path.display()
        );

        let mut reader = MultichannelReader::open(path, config.sample_rate, chunk_frames)?;

        let mut streams = HashMap::new();
        for name in scene.sources.keys() {
            let Some(channel) = parse_channel_index(name, reader.channels()) else {
                log::warn!("Cannot map source '{}' to a file channel, skipping", name);
                continue;
            };

            let stream = Arc::new(SourceStream::new_buffers_only(
                name,
                reader.total_frames(),
                chunk_frames,
            ));
            reader.map_channel(channel, stream.clone());

            log::info!(
                "  {} → channel {}{}",
                name,
                channel,
                if stream.is_lfe() { " [LFE]" } else { "" }
            );
            streams.insert(name.clone(), stream);
        }

        if streams.is_empty() {
            return Err(AuraSonicError::Streaming(
                "no source could be mapped onto the multichannel file".into(),
            ));
        }

        reader.preload_first_chunk()?;
        for stream in streams.values() {
            stream.activate_buffer_a();
        }

        state.num_sources.store(streams.len(), Ordering::Relaxed);
        log::info!(
            "Streaming: {} of {} channels mapped",
            reader.num_mapped(),
            reader.channels()
        );

        Ok(Self {
            streams,
            mode: StreamMode::Multichannel(reader),
            state,
            loader_running: Arc::new(AtomicBool::new(false)),
            loader_handle: Mutex::new(None),
        })
    }

    /// Launch the background loader. Call exactly once, after loading and
    /// before the audio stream starts.
    pub fn start_loader(self: &Arc<Self>) {
        self.loader_running.store(true, Ordering::Release);

        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("aurasonic-loader".into())
            .spawn(move || {
                while this.loader_running.load(Ordering::Acquire) {
                    let current = this.state.frame_counter.load(Ordering::Relaxed);
                    this.service(current);
                    std::thread::sleep(LOADER_POLL);
                }
            })
            .expect("failed to spawn loader thread");

        *self.loader_handle.lock().expect("loader handle poisoned") = Some(handle);
        log::info!("Streaming: loader thread started");
    }

    /// One loader pass: refill whichever inactive buffers have crossed the
    /// preload threshold. Runs on the loader thread; tests drive it directly.
    pub(crate) fn service(&self, current_frame: u64) {
        match &self.mode {
            StreamMode::Mono => {
                for stream in self.streams.values() {
                    if let Some((buf_idx, next_chunk)) = stream.needs_preload(current_frame) {
                        stream.load_chunk(buf_idx, next_chunk);
                    }
                }
            }
            StreamMode::Multichannel(reader) => {
                // All mapped streams share the file's chunk boundaries; one
                // representative decides for all of them.
                let Some(representative) = reader.representative() else {
                    return;
                };
                if let Some((buf_idx, next_chunk)) = representative.needs_preload(current_frame) {
                    reader.read_and_distribute(next_chunk, buf_idx);
                }
            }
        }
    }

    /// Fill `out` with a source's samples for
    /// `[start_frame, start_frame + out.len())`. Lock-free; unknown sources
    /// and unavailable in-file ranges yield silence and count one xrun.
    pub fn get_block(&self, name: &str, start_frame: u64, out: &mut [f32]) {
        match self.streams.get(name) {
            Some(stream) => {
                if stream.fetch_block(start_frame, out) {
                    self.state.xrun_count.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                out.fill(0.0);
                self.state.xrun_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Single-sample variant of [`get_block`](Self::get_block).
    pub fn get_sample(&self, name: &str, frame: u64) -> f32 {
        match self.streams.get(name) {
            Some(stream) => match stream.fetch_sample(frame) {
                Some(v) => v,
                None => {
                    if frame < stream.total_frames() {
                        self.state.xrun_count.fetch_add(1, Ordering::Relaxed);
                    }
                    0.0
                }
            },
            None => {
                self.state.xrun_count.fetch_add(1, Ordering::Relaxed);
                0.0
            }
        }
    }

    pub fn num_sources(&self) -> usize {
        self.streams.len()
    }

    /// Longest source length in frames (scene playback horizon).
    pub fn max_total_frames(&self) -> u64 {
        self.streams
            .values()
            .map(|s| s.total_frames())
            .max()
            .unwrap_or(0)
    }

    /// Stop and join the loader. Callable only after the audio stream is
    /// stopped; file handles close when the `Streaming` is dropped.
    pub fn shutdown(&self) {
        self.loader_running.store(false, Ordering::Release);
        if let Some(handle) = self
            .loader_handle
            .lock()
            .expect("loader handle poisoned")
            .take()
        {
            let _ = handle.join();
            log::info!("Streaming: loader thread stopped");
        }
    }
}

impl Drop for Streaming {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl BlockSource for Streaming {
    fn block_into(&self, name: &str, start_frame: u64, out: &mut [f32]) {
        self.get_block(name, start_frame, out);
    }
}
