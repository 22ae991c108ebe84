//! Shared multichannel reader for interleaved-file mode.
//!
//! One file handle and one interleaved staging buffer serve every mapped
//! source: the loader does a single bulk read per chunk cycle, then
//! deinterleaves each mapped channel into that source's inactive buffer and
//! publishes it. The audio thread reads the same per-source double buffers
//! as in mono mode and never touches this reader.

use crate::error::{AuraSonicError, Result};
use crate::streaming::source::SourceStream;
use crate::streaming::wav::WavChunkReader;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Loader-thread-only state: the file handle plus the interleaved staging
/// buffer (`chunk_frames × channels` floats, allocated once at open).
struct ReaderInner {
    reader: WavChunkReader,
    staging: Vec<f32>,
}

pub(crate) struct MultichannelReader {
    inner: Mutex<ReaderInner>,
    channels: usize,
    total_frames: u64,
    chunk_frames: u64,
    /// `(channel_index, stream)` fan-out handles, built at setup and
    /// read-only afterwards.
    mapped: Vec<(usize, Arc<SourceStream>)>,
}

impl MultichannelReader {
    /// Open the interleaved file and allocate the staging buffer. Files with
    /// fewer than two channels or a mismatched sample rate are setup errors.
    pub fn open(path: &Path, expected_sample_rate: u32, chunk_frames: u64) -> Result<Self> {
        let reader = WavChunkReader::open(path)?;

        let channels = reader.channels();
        if channels < 2 {
            return Err(AuraSonicError::AudioFormat(format!(
                "{}: multichannel mode needs >= 2 channels, file has {}",
                path.display(),
                channels
            )));
        }
        if reader.sample_rate() != expected_sample_rate {
            return Err(AuraSonicError::AudioFormat(format!(
                "{}: sample rate {} does not match engine rate {}",
                path.display(),
                reader.sample_rate(),
                expected_sample_rate
            )));
        }

        let total_frames = reader.total_frames();
        let staging = vec![0.0; chunk_frames as usize * channels];

        log::info!(
            "Multichannel file: {} channels, {} frames ({:.1} s), staging {} MB",
            channels,
            total_frames,
            total_frames as f64 / expected_sample_rate as f64,
            (staging.len() * std::mem::size_of::<f32>()) / (1024 * 1024)
        );

        Ok(Self {
            inner: Mutex::new(ReaderInner { reader, staging }),
            channels,
            total_frames,
            chunk_frames,
            mapped: Vec::new(),
        })
    }

    /// Register a stream to receive one channel's data. Setup-only.
    pub fn map_channel(&mut self, channel_index: usize, stream: Arc<SourceStream>) {
        debug_assert!(channel_index < self.channels);
        self.mapped.push((channel_index, stream));
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn num_mapped(&self) -> usize {
        self.mapped.len()
    }

    /// A stream whose buffer timing stands in for all of them: every mapped
    /// stream shares the file's chunk boundaries.
    pub fn representative(&self) -> Option<&Arc<SourceStream>> {
        self.mapped.first().map(|(_, s)| s)
    }

    /// Read one interleaved chunk starting at `chunk_start` and publish it
    /// into buffer `buf_idx` of every mapped stream. Loader-side (or the
    /// synchronous first-chunk preload). Returns the frames read.
    pub fn read_and_distribute(&self, chunk_start: u64, buf_idx: usize) -> u64 {
        let mut inner = self.inner.lock().expect("file mutex poisoned");
        let ReaderInner { reader, staging } = &mut *inner;

        let frames_read = match reader.read_frames(chunk_start, staging) {
            Ok(n) => n,
            Err(e) => {
                log::error!("Multichannel read failed at frame {}: {}", chunk_start, e);
                0
            }
        };

        for (channel, stream) in &self.mapped {
            let channel = *channel;
            let channels = self.channels;
            let staging = &*staging;
            stream.fill_buffer(buf_idx, chunk_start, |data| {
                for (i, d) in data.iter_mut().enumerate().take(frames_read as usize) {
                    *d = staging[i * channels + channel];
                }
                frames_read
            });
        }

        frames_read
    }

    /// Synchronously read chunk 0 into buffer A of every mapped stream.
    /// Setup-thread-only, before playback starts.
    pub fn preload_first_chunk(&self) -> Result<()> {
        if self.read_and_distribute(0, 0) == 0 {
            return Err(AuraSonicError::Streaming(
                "failed to read first chunk from multichannel file".into(),
            ));
        }
        Ok(())
    }
}

/// Map a source key to a 0-based channel index in the interleaved file:
/// `"N.1"` → N−1; `"LFE"` → 3 provided the file has at least 4 channels.
pub(crate) fn parse_channel_index(source_name: &str, num_channels: usize) -> Option<usize> {
    if source_name == "LFE" {
        return (num_channels >= 4).then_some(3);
    }

    let (track, _) = source_name.split_once('.')?;
    let track: usize = track.parse().ok()?;
    let index = track.checked_sub(1)?;
    (index < num_channels).then_some(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_index_convention() {
        assert_eq!(parse_channel_index("1.1", 8), Some(0));
        assert_eq!(parse_channel_index("11.1", 16), Some(10));
        assert_eq!(parse_channel_index("24.1", 24), Some(23));
        assert_eq!(parse_channel_index("LFE", 8), Some(3));
    }

    #[test]
    fn test_channel_index_rejections() {
        // LFE needs a 4-channel bed.
        assert_eq!(parse_channel_index("LFE", 3), None);
        // Out of range for the file.
        assert_eq!(parse_channel_index("9.1", 8), None);
        // Not the N.1 pattern.
        assert_eq!(parse_channel_index("vocals", 8), None);
        assert_eq!(parse_channel_index(".1", 8), None);
        assert_eq!(parse_channel_index("0.1", 8), None);
    }
}
