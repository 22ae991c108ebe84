//! Keyframed spatial scene description and its JSON loader.
//!
//! A scene maps source keys (e.g. `"1.1"`, `"11.1"`, `"LFE"`) to ordered
//! keyframe lists. Scenes are immutable once loaded; everything downstream
//! (streaming, pose, spatializer) treats the source set and keyframes as
//! read-only.

use crate::error::{AuraSonicError, Result};
use glam::Vec3;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Keyframe times closer together than this are considered duplicates;
/// the later keyframe wins.
const TIME_EPSILON: f64 = 1e-6;

/// One spatial keyframe: a direction sampled at a point in time.
#[derive(Debug, Clone, Copy)]
pub struct Keyframe {
    /// Time in seconds (converted from the scene's time unit at load).
    pub time: f64,
    /// Direction vector. Not necessarily unit length; zero-magnitude
    /// directions are repaired to forward at load time.
    pub dir: Vec3,
}

/// Time unit for keyframe timestamps in the scene file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Samples,
    Milliseconds,
}

impl TimeUnit {
    /// Parse a scene-file time unit string. Unknown strings fall back to
    /// seconds with a warning.
    fn parse(s: &str, sample_rate: u32) -> (Self, f64) {
        match s {
            "seconds" | "s" => (Self::Seconds, 1.0),
            "samples" | "samp" => (Self::Samples, 1.0 / sample_rate as f64),
            "milliseconds" | "ms" => (Self::Milliseconds, 1e-3),
            other => {
                log::warn!("Unknown timeUnit '{}', assuming seconds", other);
                (Self::Seconds, 1.0)
            }
        }
    }
}

/// A loaded spatial scene: per-source keyframe trajectories.
///
/// Sources are kept in a `BTreeMap` so that every consumer sees the same
/// stable ordering; the pose vector built at load time relies on this.
#[derive(Debug, Clone)]
pub struct SpatialScene {
    pub sample_rate: u32,
    pub time_unit: TimeUnit,
    pub sources: BTreeMap<String, Vec<Keyframe>>,
    /// Scene duration in seconds from metadata, if present.
    pub duration: Option<f64>,
}

impl SpatialScene {
    /// Load a scene JSON file (v0.5+ schema).
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AuraSonicError::Scene(format!("cannot open scene JSON {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Parse a scene from JSON text.
    ///
    /// `audio_object` and `direct_speaker` nodes contribute keyframes from
    /// their `cart` field; `LFE` nodes contribute a single sentinel keyframe.
    /// Other node types are ignored. Invalid keyframes are dropped and
    /// counted; zero-magnitude directions are repaired to forward `(0,1,0)`.
    pub fn from_json(text: &str) -> Result<Self> {
        let file: SceneFile = serde_json::from_str(text)
            .map_err(|e| AuraSonicError::Scene(format!("malformed scene JSON: {}", e)))?;

        let (time_unit, multiplier) = TimeUnit::parse(&file.time_unit, file.sample_rate);
        log::info!(
            "Loading scene v{} (sampleRate {}, timeUnit {:?})",
            file.version,
            file.sample_rate,
            time_unit
        );

        let mut sources: BTreeMap<String, Vec<Keyframe>> = BTreeMap::new();
        let mut dropped = 0usize;
        let mut repaired = 0usize;

        for frame in &file.frames {
            let time = frame.time * multiplier;
            if !time.is_finite() {
                dropped += frame.nodes.len();
                continue;
            }
            for node in &frame.nodes {
                match node.node_type.as_str() {
                    "audio_object" | "direct_speaker" => {
                        // Missing, malformed or non-finite cart: drop the
                        // keyframe. Zero-magnitude (but finite) directions
                        // are repaired to forward instead.
                        let Some(mut dir) = parse_cart(node.cart.as_ref()) else {
                            dropped += 1;
                            continue;
                        };
                        if dir.length_squared() < 1e-16 {
                            dir = Vec3::new(0.0, 1.0, 0.0);
                            repaired += 1;
                        }
                        sources
                            .entry(node.id.clone())
                            .or_default()
                            .push(Keyframe { time, dir });
                    }
                    "LFE" => {
                        // One sentinel keyframe; the position is never used.
                        sources.entry("LFE".to_string()).or_insert_with(|| {
                            vec![Keyframe {
                                time: 0.0,
                                dir: Vec3::ZERO,
                            }]
                        });
                    }
                    _ => {}
                }
            }
        }

        let mut collapsed = 0usize;
        for (name, keyframes) in sources.iter_mut() {
            if name == "LFE" {
                continue;
            }
            keyframes.sort_by(|a, b| a.time.total_cmp(&b.time));
            collapsed += dedup_keyframes(keyframes);
        }

        if dropped > 0 {
            log::warn!("Dropped {} invalid keyframes from scene", dropped);
        }
        if repaired > 0 {
            log::warn!("Repaired {} degenerate directions to forward", repaired);
        }
        if collapsed > 0 {
            log::debug!("Collapsed {} duplicate-time keyframes", collapsed);
        }

        let has_lfe = sources.contains_key("LFE");
        log::info!(
            "Loaded scene: {} spatial sources{}",
            sources.len() - has_lfe as usize,
            if has_lfe { " + LFE" } else { "" }
        );

        Ok(Self {
            sample_rate: file.sample_rate,
            time_unit,
            sources,
            duration: file.duration,
        })
    }

    /// Scene duration in seconds: metadata if present, otherwise the latest
    /// keyframe time across all sources.
    pub fn duration_sec(&self) -> f64 {
        self.duration.unwrap_or_else(|| {
            self.sources
                .values()
                .flat_map(|kfs| kfs.iter().map(|k| k.time))
                .fold(0.0, f64::max)
        })
    }

    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }
}

/// Extract a direction from a node's `cart` field. Returns `None` (drop the
/// keyframe) when the field is missing, not an array of at least three
/// numbers, or has a non-finite component.
fn parse_cart(cart: Option<&serde_json::Value>) -> Option<Vec3> {
    let arr = cart?.as_array()?;
    if arr.len() < 3 {
        return None;
    }
    let mut c = [0.0f32; 3];
    for (slot, v) in c.iter_mut().zip(arr) {
        let v = v.as_f64()?;
        if !v.is_finite() {
            return None;
        }
        *slot = v as f32;
    }
    Some(Vec3::new(c[0], c[1], c[2]))
}

/// Collapse keyframes whose times fall within [`TIME_EPSILON`] of each other,
/// keeping the later one. Assumes the slice is already sorted by time.
/// Returns the number of keyframes removed.
fn dedup_keyframes(keyframes: &mut Vec<Keyframe>) -> usize {
    let before = keyframes.len();
    let mut deduped: Vec<Keyframe> = Vec::with_capacity(before);
    for i in 0..keyframes.len() {
        if i + 1 < keyframes.len() && (keyframes[i + 1].time - keyframes[i].time).abs() < TIME_EPSILON
        {
            continue; // skip, the later keyframe wins
        }
        deduped.push(keyframes[i]);
    }
    *keyframes = deduped;
    before - keyframes.len()
}

// ── Raw JSON schema ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SceneFile {
    #[serde(rename = "sampleRate", default = "default_sample_rate")]
    sample_rate: u32,
    #[serde(rename = "timeUnit", default = "default_time_unit")]
    time_unit: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    frames: Vec<SceneFrame>,
}

#[derive(Deserialize)]
struct SceneFrame {
    time: f64,
    #[serde(default)]
    nodes: Vec<SceneNode>,
}

#[derive(Deserialize)]
struct SceneNode {
    id: String,
    #[serde(rename = "type")]
    node_type: String,
    /// Kept as a raw value so one malformed array drops that node instead of
    /// failing the whole document.
    #[serde(default)]
    cart: Option<serde_json::Value>,
}

fn default_sample_rate() -> u32 {
    48000
}

fn default_time_unit() -> String {
    "seconds".to_string()
}

fn default_version() -> String {
    "0.5".to_string()
}
