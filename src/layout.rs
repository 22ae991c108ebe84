//! Speaker layout description and its JSON loader.
//!
//! A layout is an ordered list of main speakers (azimuth/elevation/radius)
//! plus a set of subwoofer device channels. The derived metrics computed at
//! load time (median radius, elevation bounds, 2-D detection, output channel
//! count) drive both the pose reshaping and the spatializer sizing.

use crate::error::{AuraSonicError, Result};
use glam::Vec3;
use serde::Deserialize;
use std::path::Path;

/// Layouts whose elevation span is below this are treated as 2-D.
const TWO_D_THRESHOLD_RAD: f32 = 3.0 * std::f32::consts::PI / 180.0;

/// One loudspeaker position in the layout.
#[derive(Debug, Clone, Copy)]
pub struct Speaker {
    /// Azimuth in radians, measured from +y (forward) toward +x (right).
    pub azimuth: f32,
    /// Elevation in radians above the horizontal plane.
    pub elevation: f32,
    /// Distance from the listening position in meters.
    pub radius: f32,
}

impl Speaker {
    /// Unit direction toward this speaker (y-forward, x-right, z-up frame).
    pub fn direction(&self) -> Vec3 {
        let cos_el = self.elevation.cos();
        Vec3::new(
            self.azimuth.sin() * cos_el,
            self.azimuth.cos() * cos_el,
            self.elevation.sin(),
        )
    }

    /// Position in meters (direction scaled by radius).
    pub fn position(&self) -> Vec3 {
        self.direction() * self.radius
    }
}

/// A loaded speaker layout.
#[derive(Debug, Clone)]
pub struct SpeakerLayout {
    pub speakers: Vec<Speaker>,
    /// Raw 0-based device channel indices for the subwoofer outputs.
    pub subwoofers: Vec<usize>,
}

impl SpeakerLayout {
    /// Load a layout JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AuraSonicError::Layout(format!("cannot open layout JSON {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Parse a layout from JSON text. An empty speaker list is an error.
    pub fn from_json(text: &str) -> Result<Self> {
        let file: LayoutFile = serde_json::from_str(text)
            .map_err(|e| AuraSonicError::Layout(format!("malformed layout JSON: {}", e)))?;

        if file.speakers.is_empty() {
            return Err(AuraSonicError::Layout("layout has no speakers".into()));
        }

        let speakers: Vec<Speaker> = file
            .speakers
            .iter()
            .map(|s| Speaker {
                azimuth: s.azimuth_rad,
                elevation: s.elevation_rad,
                radius: if s.radius_m > 0.0 { s.radius_m } else { 1.0 },
            })
            .collect();

        let subwoofers: Vec<usize> = file.subwoofers.iter().map(|s| s.device_channel).collect();

        let layout = Self {
            speakers,
            subwoofers,
        };

        let (min_el, max_el) = layout.elevation_bounds();
        log::info!(
            "Layout: {} speakers, {} subwoofer(s), radius {:.2} m, elevation [{:.1}°, {:.1}°]{}",
            layout.num_speakers(),
            layout.subwoofers.len(),
            layout.median_radius(),
            min_el.to_degrees(),
            max_el.to_degrees(),
            if layout.is_2d() { " (2D)" } else { " (3D)" }
        );

        Ok(layout)
    }

    pub fn num_speakers(&self) -> usize {
        self.speakers.len()
    }

    /// Median of the speaker radii.
    pub fn median_radius(&self) -> f32 {
        let mut radii: Vec<f32> = self.speakers.iter().map(|s| s.radius).collect();
        radii.sort_by(|a, b| a.total_cmp(b));
        let mid = radii.len() / 2;
        if radii.len() % 2 == 0 {
            (radii[mid - 1] + radii[mid]) / 2.0
        } else {
            radii[mid]
        }
    }

    /// Minimum and maximum speaker elevation in radians.
    pub fn elevation_bounds(&self) -> (f32, f32) {
        let mut min_el = f32::INFINITY;
        let mut max_el = f32::NEG_INFINITY;
        for spk in &self.speakers {
            min_el = min_el.min(spk.elevation);
            max_el = max_el.max(spk.elevation);
        }
        (min_el, max_el)
    }

    /// True when the elevation span is under 3 degrees.
    pub fn is_2d(&self) -> bool {
        let (min_el, max_el) = self.elevation_bounds();
        max_el - min_el < TWO_D_THRESHOLD_RAD
    }

    /// Render/output channel count: speakers occupy consecutive channels
    /// starting at 0, and every subwoofer device channel must fit.
    pub fn output_channels(&self) -> usize {
        let mut max_channel = self.num_speakers().saturating_sub(1);
        for &sub in &self.subwoofers {
            max_channel = max_channel.max(sub);
        }
        max_channel + 1
    }
}

// ── Raw JSON schema ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LayoutFile {
    #[serde(default)]
    speakers: Vec<SpeakerEntry>,
    #[serde(default)]
    subwoofers: Vec<SubwooferEntry>,
}

#[derive(Deserialize)]
struct SpeakerEntry {
    azimuth_rad: f32,
    elevation_rad: f32,
    radius_m: f32,
}

#[derive(Deserialize)]
struct SubwooferEntry {
    #[serde(rename = "deviceChannel")]
    device_channel: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An 8-speaker ring at 1 m, no subwoofers.
    fn ring_json() -> String {
        let speakers: Vec<String> = (0..8)
            .map(|i| {
                let az = i as f32 * std::f32::consts::FRAC_PI_4;
                format!(
                    r#"{{"azimuth_rad": {}, "elevation_rad": 0.0, "radius_m": 1.0}}"#,
                    az
                )
            })
            .collect();
        format!(r#"{{"speakers": [{}], "subwoofers": []}}"#, speakers.join(","))
    }

    #[test]
    fn test_ring_layout() {
        let layout = SpeakerLayout::from_json(&ring_json()).unwrap();
        assert_eq!(layout.num_speakers(), 8);
        assert!(layout.is_2d());
        assert_eq!(layout.median_radius(), 1.0);
        assert_eq!(layout.output_channels(), 8);
    }

    #[test]
    fn test_speaker_direction_frame() {
        // Azimuth 0 → forward (+y); azimuth 90° → right (+x).
        let front = Speaker {
            azimuth: 0.0,
            elevation: 0.0,
            radius: 1.0,
        };
        assert!((front.direction() - Vec3::new(0.0, 1.0, 0.0)).length() < 1e-6);

        let right = Speaker {
            azimuth: std::f32::consts::FRAC_PI_2,
            elevation: 0.0,
            radius: 1.0,
        };
        assert!((right.direction() - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-6);

        let top = Speaker {
            azimuth: 0.0,
            elevation: std::f32::consts::FRAC_PI_2,
            radius: 2.0,
        };
        assert!((top.position() - Vec3::new(0.0, 0.0, 2.0)).length() < 1e-5);
    }

    #[test]
    fn test_subwoofers_extend_output_channels() {
        let json = r#"{
            "speakers": [
                {"azimuth_rad": 0.0, "elevation_rad": 0.0, "radius_m": 2.0},
                {"azimuth_rad": 1.57, "elevation_rad": 0.0, "radius_m": 2.0},
                {"azimuth_rad": 3.14, "elevation_rad": 0.0, "radius_m": 2.0},
                {"azimuth_rad": 4.71, "elevation_rad": 0.0, "radius_m": 2.0}
            ],
            "subwoofers": [{"deviceChannel": 4}, {"deviceChannel": 5}]
        }"#;
        let layout = SpeakerLayout::from_json(json).unwrap();
        assert_eq!(layout.num_speakers(), 4);
        assert_eq!(layout.subwoofers, vec![4, 5]);
        assert_eq!(layout.output_channels(), 6);
    }

    #[test]
    fn test_elevation_bounds_and_3d() {
        let json = r#"{
            "speakers": [
                {"azimuth_rad": 0.0, "elevation_rad": 0.0, "radius_m": 1.0},
                {"azimuth_rad": 0.0, "elevation_rad": 0.5236, "radius_m": 1.0}
            ],
            "subwoofers": []
        }"#;
        let layout = SpeakerLayout::from_json(json).unwrap();
        assert!(!layout.is_2d());
        let (min_el, max_el) = layout.elevation_bounds();
        assert_eq!(min_el, 0.0);
        assert!((max_el - 0.5236).abs() < 1e-6);
    }

    #[test]
    fn test_median_radius_even_count() {
        let json = r#"{
            "speakers": [
                {"azimuth_rad": 0.0, "elevation_rad": 0.0, "radius_m": 1.0},
                {"azimuth_rad": 1.0, "elevation_rad": 0.0, "radius_m": 3.0}
            ],
            "subwoofers": []
        }"#;
        let layout = SpeakerLayout::from_json(json).unwrap();
        assert_eq!(layout.median_radius(), 2.0);
    }

    #[test]
    fn test_empty_layout_is_an_error() {
        assert!(SpeakerLayout::from_json(r#"{"speakers": [], "subwoofers": []}"#).is_err());
    }

    #[test]
    fn test_nonpositive_radius_defaults_to_one() {
        let json = r#"{
            "speakers": [{"azimuth_rad": 0.0, "elevation_rad": 0.0, "radius_m": 0.0}],
            "subwoofers": []
        }"#;
        let layout = SpeakerLayout::from_json(json).unwrap();
        assert_eq!(layout.speakers[0].radius, 1.0);
    }
}
