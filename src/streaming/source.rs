//! Per-source double-buffered streaming state.
//!
//! Each source owns two pre-allocated chunk buffers that alternate: the audio
//! thread reads the active one while the loader fills the inactive one. All
//! coordination goes through atomic state flags; neither side ever locks or
//! allocates on the audio path.
//!
//! Buffer slot protocol:
//!
//! ```text
//! EMPTY → LOADING → READY      (loader)
//! READY → PLAYING, PLAYING → EMPTY   (audio thread, on switch)
//! ```
//!
//! `chunk_start` and `valid_frames` are written before the state flag and
//! read after it; the state flag's Release store / Acquire load is the
//! synchronising edge. The loader writes sample data only while a slot is
//! EMPTY→LOADING; the audio thread reads sample data only from a slot it
//! observed as READY/PLAYING. That protocol is what makes the `UnsafeCell`
//! accesses below sound.

use crate::error::{AuraSonicError, Result};
use crate::streaming::wav::WavChunkReader;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI8, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum BufferState {
    Empty = 0,
    Loading = 1,
    Ready = 2,
    Playing = 3,
}

impl BufferState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Loading,
            2 => Self::Ready,
            3 => Self::Playing,
            _ => Self::Empty,
        }
    }
}

/// One chunk slot of a source's double buffer.
pub(crate) struct ChunkBuffer {
    state: AtomicU8,
    /// Global frame index of this buffer's sample 0.
    chunk_start: AtomicU64,
    /// Samples actually filled (≤ chunk_frames; shortfall is zero-padded).
    valid_frames: AtomicU64,
    data: UnsafeCell<Box<[f32]>>,
}

// Data access is gated by the state-flag protocol described in the module
// docs; the atomics themselves are Sync.
unsafe impl Sync for ChunkBuffer {}

impl ChunkBuffer {
    fn new(chunk_frames: u64) -> Self {
        Self {
            state: AtomicU8::new(BufferState::Empty as u8),
            chunk_start: AtomicU64::new(0),
            valid_frames: AtomicU64::new(0),
            data: UnsafeCell::new(vec![0.0; chunk_frames as usize].into_boxed_slice()),
        }
    }

    pub fn state(&self) -> BufferState {
        BufferState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: BufferState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn chunk_start(&self) -> u64 {
        self.chunk_start.load(Ordering::Acquire)
    }

    pub fn valid_frames(&self) -> u64 {
        self.valid_frames.load(Ordering::Acquire)
    }

    /// Read access to the sample data.
    ///
    /// # Safety
    /// Only call on a slot observed (via an Acquire state/active load) as
    /// READY or PLAYING; the loader never writes such a slot.
    unsafe fn samples(&self) -> &[f32] {
        &*self.data.get()
    }

    /// Write access to the sample data.
    ///
    /// # Safety
    /// Loader-side only, and only between `begin_load` and `publish` on a
    /// slot that was EMPTY; the audio thread never reads an EMPTY/LOADING
    /// slot.
    #[allow(clippy::mut_from_ref)]
    unsafe fn samples_mut(&self) -> &mut [f32] {
        &mut *self.data.get()
    }
}

/// Streaming state for one source.
pub(crate) struct SourceStream {
    name: String,
    is_lfe: bool,
    total_frames: u64,
    chunk_frames: u64,
    buffers: [ChunkBuffer; 2],
    /// Which buffer is being played: -1 none yet, else 0/1.
    active: AtomicI8,
    /// Mono-mode file reader; `None` in multichannel mode where the shared
    /// reader owns the file. The mutex is held only across seek+read, and
    /// only ever by the loader (or the synchronous preload during setup).
    reader: Option<Mutex<WavChunkReader>>,
}

impl SourceStream {
    /// Open a mono WAV and pre-allocate both buffers. The caller validates
    /// channel count and sample rate before constructing.
    pub fn new_mono(name: &str, reader: WavChunkReader, chunk_frames: u64) -> Self {
        let total_frames = reader.total_frames();
        Self {
            name: name.to_string(),
            is_lfe: name == "LFE",
            total_frames,
            chunk_frames,
            buffers: [ChunkBuffer::new(chunk_frames), ChunkBuffer::new(chunk_frames)],
            active: AtomicI8::new(-1),
            reader: Some(Mutex::new(reader)),
        }
    }

    /// Buffers without a file handle, for multichannel mode where the shared
    /// reader fills them by deinterleaving.
    pub fn new_buffers_only(name: &str, total_frames: u64, chunk_frames: u64) -> Self {
        Self {
            name: name.to_string(),
            is_lfe: name == "LFE",
            total_frames,
            chunk_frames,
            buffers: [ChunkBuffer::new(chunk_frames), ChunkBuffer::new(chunk_frames)],
            active: AtomicI8::new(-1),
            reader: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_lfe(&self) -> bool {
        self.is_lfe
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn chunk_frames(&self) -> u64 {
        self.chunk_frames
    }

    // ── Audio-thread read path ──────────────────────────────────────────

    /// Copy `[start_frame, start_frame + out.len())` into `out`. Returns
    /// true if an underrun occurred (a frame inside the file could not be
    /// served). Lock-free.
    pub fn fetch_block(&self, start_frame: u64, out: &mut [f32]) -> bool {
        let active = self.active.load(Ordering::Acquire);
        if active < 0 {
            out.fill(0.0);
            return true;
        }

        let buf = &self.buffers[active as usize];
        let chunk_start = buf.chunk_start();
        let valid = buf.valid_frames();
        let end_frame = start_frame + out.len() as u64;

        // Happy path: the whole block lives in the active buffer.
        if start_frame >= chunk_start && end_frame <= chunk_start + valid {
            let offset = (start_frame - chunk_start) as usize;
            // SAFETY: slot is PLAYING (it is the active buffer).
            let samples = unsafe { buf.samples() };
            out.copy_from_slice(&samples[offset..offset + out.len()]);
            return false;
        }

        // Slow path: per-sample reads, performing the buffer switch inline.
        let mut underrun = false;
        for (i, slot) in out.iter_mut().enumerate() {
            let frame = start_frame + i as u64;
            match self.fetch_sample(frame) {
                Some(v) => *slot = v,
                None => {
                    *slot = 0.0;
                    if frame < self.total_frames {
                        underrun = true;
                    }
                }
            }
        }
        underrun
    }

    /// Fetch one sample, switching buffers when the active chunk no longer
    /// covers the frame. Returns `None` when no loaded buffer holds it.
    /// Lock-free.
    pub fn fetch_sample(&self, frame: u64) -> Option<f32> {
        let active = self.active.load(Ordering::Acquire);
        if active < 0 {
            return None;
        }

        let required_chunk = (frame / self.chunk_frames) * self.chunk_frames;

        let buf = &self.buffers[active as usize];
        let chunk_start = buf.chunk_start();
        if chunk_start == required_chunk {
            let offset = frame - chunk_start;
            if offset < buf.valid_frames() {
                // SAFETY: slot is PLAYING.
                return Some(unsafe { buf.samples() }[offset as usize]);
            }
            return None;
        }

        // The other buffer may hold the required chunk; if so, switch.
        // The race where two successive callbacks both switch is benign:
        // the worst case is re-running the same three stores.
        let other = 1 - active;
        let other_buf = &self.buffers[other as usize];
        if other_buf.state() == BufferState::Ready
            && other_buf.chunk_start() == required_chunk
            && other_buf.valid_frames() > 0
        {
            buf.set_state(BufferState::Empty);
            other_buf.set_state(BufferState::Playing);
            self.active.store(other, Ordering::Release);

            let offset = frame - required_chunk;
            if offset < other_buf.valid_frames() {
                // SAFETY: slot was READY and is now PLAYING.
                return Some(unsafe { other_buf.samples() }[offset as usize]);
            }
        }

        None
    }

    // ── Loader-side write path ──────────────────────────────────────────

    /// Whether the inactive buffer should be preloaded: playback has crossed
    /// half of the active chunk's valid range, the inactive slot is EMPTY and
    /// the file has more data. Returns `(inactive_index, next_chunk_start)`.
    pub fn needs_preload(&self, current_frame: u64) -> Option<(usize, u64)> {
        let active = self.active.load(Ordering::Acquire);
        if active < 0 {
            return None;
        }

        let buf = &self.buffers[active as usize];
        let chunk_start = buf.chunk_start();
        let valid = buf.valid_frames();
        if valid == 0 {
            return None;
        }

        let inactive = (1 - active) as usize;
        if self.buffers[inactive].state() != BufferState::Empty {
            return None;
        }

        if current_frame < chunk_start + valid / 2 {
            return None;
        }

        let next_chunk = chunk_start + self.chunk_frames;
        if next_chunk >= self.total_frames {
            return None;
        }
        Some((inactive, next_chunk))
    }

    /// Fill a buffer slot through `filler`, which writes into the slot's
    /// data and returns the number of valid frames. Zero-pads the shortfall,
    /// then publishes `chunk_start → valid_frames → state=READY`.
    /// Loader-side only.
    pub fn fill_buffer<F>(&self, buf_idx: usize, chunk_start: u64, filler: F)
    where
        F: FnOnce(&mut [f32]) -> u64,
    {
        let buf = &self.buffers[buf_idx];
        buf.set_state(BufferState::Loading);

        // SAFETY: the slot was EMPTY (loader-owned); the audio thread will
        // not read it until the READY store below.
        let data = unsafe { buf.samples_mut() };
        let frames_read = filler(data).min(self.chunk_frames);
        data[frames_read as usize..].fill(0.0);

        buf.chunk_start.store(chunk_start, Ordering::Release);
        buf.valid_frames.store(frames_read, Ordering::Release);
        buf.set_state(BufferState::Ready);
    }

    /// Read one chunk from this source's own file into a buffer slot.
    /// Mono mode only; loader-side (or setup preload).
    pub fn load_chunk(&self, buf_idx: usize, chunk_start: u64) {
        let Some(reader) = &self.reader else {
            return;
        };
        self.fill_buffer(buf_idx, chunk_start, |data| {
            let mut reader = reader.lock().expect("file mutex poisoned");
            match reader.read_frames(chunk_start, data) {
                Ok(n) => n,
                Err(e) => {
                    // Loader thread; logging is allowed here.
                    log::error!("Read failed for source '{}': {}", self.name, e);
                    0
                }
            }
        });
    }

    /// Synchronously load chunk 0 into buffer A and make it the playing
    /// buffer. Setup-thread-only, before the stream starts.
    pub fn preload_first_chunk(&self) -> Result<()> {
        self.load_chunk(0, 0);
        if self.total_frames > 0 && self.buffers[0].valid_frames() == 0 {
            return Err(AuraSonicError::Streaming(format!(
                "failed to preload first chunk for source '{}'",
                self.name
            )));
        }
        self.activate_buffer_a();
        Ok(())
    }

    /// Mark buffer A as the playing buffer. Used after the first chunk has
    /// been filled (directly or via the multichannel fan-out).
    pub fn activate_buffer_a(&self) {
        self.buffers[0].set_state(BufferState::Playing);
        self.active.store(0, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn buffer_state(&self, idx: usize) -> BufferState {
        self.buffers[idx].state()
    }
}
