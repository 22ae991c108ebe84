//! Distance-based amplitude panning core.
//!
//! Each speaker's gain is inversely proportional to a power of its distance
//! from the virtual source (`w_i = 1 / d_i^focus`), normalised so the total
//! radiated power is constant (`Σ w_i² = 1`). Higher focus concentrates
//! energy on the nearest speakers; focus 0 distributes it uniformly.

use crate::spatial::RenderBuffer;
use glam::Vec3;

const MIN_DISTANCE: f32 = 1e-6;

/// One speaker as seen by the panner: a position and a render channel.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PannerSpeaker {
    pub position: Vec3,
    pub channel: usize,
}

/// DBAP panner over a fixed speaker array.
///
/// The speaker array and gain scratch buffer are allocated at construction;
/// `render` is allocation-free and safe to call on the audio thread.
pub struct DbapPanner {
    speakers: Vec<PannerSpeaker>,
    gains: Vec<f32>,
    focus: f32,
}

impl DbapPanner {
    pub(crate) fn new(speakers: Vec<PannerSpeaker>, focus: f32) -> Self {
        let gains = vec![0.0; speakers.len()];
        Self {
            speakers,
            gains,
            focus,
        }
    }

    /// Update the focus exponent. A plain field write; RT-safe.
    pub fn set_focus(&mut self, focus: f32) {
        self.focus = focus;
    }

    pub fn focus(&self) -> f32 {
        self.focus
    }

    /// Compute per-speaker gains for a source position and accumulate
    /// `source × gain` into each speaker's render channel.
    pub fn render(
        &mut self,
        out: &mut RenderBuffer,
        position: Vec3,
        source: &[f32],
        n_frames: usize,
    ) {
        self.compute_gains(position);

        let n = n_frames.min(source.len());
        for (spk, &gain) in self.speakers.iter().zip(self.gains.iter()) {
            if gain == 0.0 {
                continue;
            }
            let channel = out.channel_mut(spk.channel);
            for f in 0..n {
                channel[f] += source[f] * gain;
            }
        }
    }

    /// Fill the internal gain buffer for a source position: `1/d^focus`,
    /// normalised to unit power. Non-finite weights collapse to 0.
    ///
    /// Weights are scaled by their maximum before the power normalisation so
    /// that a source sitting on a speaker (raw weight ~1e6^focus) cannot
    /// overflow the power sum.
    fn compute_gains(&mut self, position: Vec3) {
        let mut w_max = 0.0f32;
        for (spk, gain) in self.speakers.iter().zip(self.gains.iter_mut()) {
            let d = (position - spk.position).length().max(MIN_DISTANCE);
            let w = d.powf(-self.focus);
            *gain = if w.is_finite() { w } else { 0.0 };
            w_max = w_max.max(*gain);
        }

        if w_max <= 0.0 {
            self.gains.fill(0.0);
            return;
        }

        let mut power = 0.0f32;
        for gain in &mut self.gains {
            *gain /= w_max;
            power += *gain * *gain;
        }

        if power > 0.0 && power.is_finite() {
            let norm = power.sqrt().recip();
            for gain in &mut self.gains {
                *gain *= norm;
            }
        } else {
            self.gains.fill(0.0);
        }
    }

    /// The gains computed by the last `render`/`compute_gains` call.
    #[cfg(test)]
    pub(crate) fn last_gains(&self) -> &[f32] {
        &self.gains
    }

    #[cfg(test)]
    pub(crate) fn compute_gains_for(&mut self, position: Vec3) -> &[f32] {
        self.compute_gains(position);
        &self.gains
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_speakers(n: usize, radius: f32) -> Vec<PannerSpeaker> {
        (0..n)
            .map(|i| {
                let az = i as f32 * std::f32::consts::TAU / n as f32;
                PannerSpeaker {
                    position: Vec3::new(az.sin() * radius, az.cos() * radius, 0.0),
                    channel: i,
                }
            })
            .collect()
    }

    #[test]
    fn test_gains_are_power_normalized() {
        let mut panner = DbapPanner::new(ring_speakers(8, 1.0), 1.0);
        let gains = panner.compute_gains_for(Vec3::new(0.3, 0.6, 0.0));
        let power: f32 = gains.iter().map(|g| g * g).sum();
        assert!((power - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_source_at_speaker_concentrates_energy() {
        let mut panner = DbapPanner::new(ring_speakers(8, 1.0), 1.0);
        // Source exactly at speaker 0 (front, +y).
        let gains = panner.compute_gains_for(Vec3::new(0.0, 1.0, 0.0)).to_vec();
        let power0 = gains[0] * gains[0];
        assert!(
            power0 > 0.9,
            "speaker 0 carries {} of the power",
            power0
        );
    }

    #[test]
    fn test_focus_zero_is_uniform() {
        let mut panner = DbapPanner::new(ring_speakers(8, 1.0), 0.0);
        let gains = panner.compute_gains_for(Vec3::new(0.0, 1.0, 0.0));
        let expected = (1.0f32 / 8.0).sqrt();
        for &g in gains {
            assert!((g - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_midpoint_splits_between_adjacent_speakers() {
        let mut panner = DbapPanner::new(ring_speakers(8, 1.0), 1.0);
        // Halfway between speakers 0 (front) and 1 (front-right).
        let az = std::f32::consts::FRAC_PI_8;
        let gains = panner
            .compute_gains_for(Vec3::new(az.sin(), az.cos(), 0.0))
            .to_vec();
        assert!((gains[0] - gains[1]).abs() < 1e-4);
        assert!(gains[0] > gains[2]);
        assert!(gains[0] > gains[7]);
    }

    #[test]
    fn test_render_accumulates() {
        let mut panner = DbapPanner::new(ring_speakers(4, 1.0), 1.0);
        let mut out = RenderBuffer::new(4, 16);
        let source = vec![1.0f32; 16];

        panner.render(&mut out, Vec3::new(0.0, 1.0, 0.0), &source, 16);
        panner.render(&mut out, Vec3::new(0.0, 1.0, 0.0), &source, 16);

        let gains = panner.last_gains().to_vec();
        // Two identical renders double the channel contents.
        for f in 0..16 {
            assert!((out.channel(0)[f] - 2.0 * gains[0]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_no_nonfinite_gains_at_degenerate_distance() {
        // Source exactly on a speaker with a large focus exponent.
        let mut panner = DbapPanner::new(ring_speakers(4, 1.0), 5.0);
        let gains = panner.compute_gains_for(Vec3::new(0.0, 1.0, 0.0));
        for &g in gains {
            assert!(g.is_finite());
        }
        assert!((gains[0] - 1.0).abs() < 1e-4);
    }
}
