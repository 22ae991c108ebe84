//! Seekable WAV reading for the loader thread.
//!
//! Wraps a `hound::WavReader` with frame-addressed chunk reads, converting
//! integer PCM to f32 on the fly. Only the loader (and the synchronous
//! first-chunk preload on the setup thread) ever touches a reader.

use crate::error::{AuraSonicError, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

pub(crate) struct WavChunkReader {
    reader: hound::WavReader<BufReader<File>>,
    spec: hound::WavSpec,
    total_frames: u64,
}

impl WavChunkReader {
    pub fn open(path: &Path) -> Result<Self> {
        let reader = hound::WavReader::open(path).map_err(|e| {
            AuraSonicError::Streaming(format!("cannot open WAV {}: {}", path.display(), e))
        })?;
        let spec = reader.spec();
        let total_frames = reader.duration() as u64;
        Ok(Self {
            reader,
            spec,
            total_frames,
        })
    }

    pub fn channels(&self) -> usize {
        self.spec.channels as usize
    }

    pub fn sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Read up to `out.len() / channels` frames starting at `start_frame`
    /// into `out` (interleaved). Returns the number of frames read, which is
    /// short at end of file. The tail of `out` beyond the returned frames is
    /// left untouched; callers zero-pad.
    pub fn read_frames(&mut self, start_frame: u64, out: &mut [f32]) -> Result<u64> {
        let channels = self.channels();
        let want_frames = (out.len() / channels) as u64;

        if start_frame >= self.total_frames {
            return Ok(0);
        }

        let seek_to = u32::try_from(start_frame).map_err(|_| {
            AuraSonicError::Streaming(format!("seek position {} out of range", start_frame))
        })?;
        self.reader
            .seek(seek_to)
            .map_err(|e| AuraSonicError::Streaming(format!("WAV seek failed: {}", e)))?;

        let frames = want_frames.min(self.total_frames - start_frame);
        let n_samples = (frames as usize) * channels;

        let dst = &mut out[..n_samples];
        match self.spec.sample_format {
            hound::SampleFormat::Float => {
                for (d, sample) in dst.iter_mut().zip(self.reader.samples::<f32>()) {
                    *d = sample
                        .map_err(|e| AuraSonicError::Streaming(format!("WAV read failed: {}", e)))?;
                }
            }
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (self.spec.bits_per_sample - 1)) as f32;
                for (d, sample) in dst.iter_mut().zip(self.reader.samples::<i32>()) {
                    *d = sample
                        .map_err(|e| AuraSonicError::Streaming(format!("WAV read failed: {}", e)))?
                        as f32
                        * scale;
                }
            }
        }

        Ok(frames)
    }
}
