//! Per-block source position interpolation.
//!
//! For each audio block, `PoseEngine::compute_positions` interpolates every
//! source's keyframed direction at the block centre time (SLERP on the unit
//! sphere), repairs degenerate results, reshapes elevation for the speaker
//! layout, and scales by the layout radius to produce a panner-ready
//! position. Positions use the y-forward / x-right / z-up frame throughout;
//! the panner's speakers are built in the same frame.
//!
//! Threading: `load_scene` runs on the setup thread before the stream
//! starts. `compute_positions` and `poses` are audio-thread-only; the pose
//! vector and the last-good-direction cache are pre-sized at load so the
//! block path never allocates. The elevation mode atomic is read once per
//! block with relaxed ordering — stale-by-one-block is fine.

use crate::config::{ElevationMode, RealtimeConfig};
use crate::layout::SpeakerLayout;
use crate::scene::{Keyframe, SpatialScene};
use glam::Vec3;
use std::sync::Arc;

const FORWARD: Vec3 = Vec3::new(0.0, 1.0, 0.0);

/// Per-source position snapshot for one audio block.
#[derive(Debug, Clone)]
pub struct SourcePose {
    /// Source key (e.g. `"1.1"`, `"LFE"`).
    pub name: String,
    /// Panner-ready position (unit direction scaled by the layout radius).
    pub position: Vec3,
    /// True → route to subwoofers, skip panning.
    pub is_lfe: bool,
    /// False → source had no usable position this block.
    pub is_valid: bool,
}

/// Source position manager for the real-time engine.
pub struct PoseEngine {
    config: Arc<RealtimeConfig>,

    // Keyframes per source, in pose-vector order. Read-only after load.
    keyframes: Vec<Vec<Keyframe>>,
    poses: Vec<SourcePose>,

    // Last-good direction per source, pre-sized at load so the audio thread
    // never inserts.
    last_good: Vec<Option<Vec3>>,

    // Layout parameters, computed once at load.
    layout_radius: f32,
    min_elevation: f32,
    max_elevation: f32,
    layout_is_2d: bool,
}

impl PoseEngine {
    pub fn new(config: Arc<RealtimeConfig>) -> Self {
        Self {
            config,
            keyframes: Vec::new(),
            poses: Vec::new(),
            last_good: Vec::new(),
            layout_radius: 1.0,
            min_elevation: 0.0,
            max_elevation: 0.0,
            layout_is_2d: false,
        }
    }

    /// Record the scene's keyframes and analyze the layout. Must be called on
    /// the setup thread before the audio stream starts.
    pub fn load_scene(&mut self, scene: &SpatialScene, layout: &SpeakerLayout) {
        self.keyframes.clear();
        self.poses.clear();
        self.last_good.clear();

        for (name, kfs) in &scene.sources {
            self.keyframes.push(kfs.clone());
            self.poses.push(SourcePose {
                name: name.clone(),
                position: Vec3::ZERO,
                is_lfe: name == "LFE",
                is_valid: false,
            });
            self.last_good.push(None);
        }

        self.layout_radius = layout.median_radius();
        let (min_el, max_el) = layout.elevation_bounds();
        self.min_elevation = min_el;
        self.max_elevation = max_el;
        self.layout_is_2d = layout.is_2d();

        log::info!(
            "Pose: {} sources, layout radius {:.2} m, elevation [{:.1}°, {:.1}°]{}",
            self.poses.len(),
            self.layout_radius,
            min_el.to_degrees(),
            max_el.to_degrees(),
            if self.layout_is_2d { " (2D)" } else { "" }
        );
    }

    /// Update the pose vector in place for the given block centre time.
    /// Audio-thread-only; allocation-free.
    pub fn compute_positions(&mut self, block_centre_time_sec: f64) {
        let mode = self.config.elevation_mode();

        for i in 0..self.poses.len() {
            if self.poses[i].is_lfe {
                self.poses[i].position = Vec3::ZERO;
                self.poses[i].is_valid = true;
                continue;
            }

            let kfs = &self.keyframes[i];
            if kfs.is_empty() {
                self.poses[i].is_valid = false;
                continue;
            }

            let raw = interpolate_dir_raw(kfs, block_centre_time_sec);
            let safe = safe_dir_with_fallback(
                &mut self.last_good[i],
                kfs,
                raw,
                block_centre_time_sec,
            );
            let sanitized = self.sanitize_for_layout(safe, mode);

            self.poses[i].position = sanitized * self.layout_radius;
            self.poses[i].is_valid = true;
        }
    }

    /// The computed poses. Call after `compute_positions`.
    pub fn poses(&self) -> &[SourcePose] {
        &self.poses
    }

    pub fn num_sources(&self) -> usize {
        self.poses.len()
    }

    /// Reshape a direction's elevation into the layout's coverage.
    fn sanitize_for_layout(&self, v: Vec3, mode: ElevationMode) -> Vec3 {
        let d = safe_normalize(v);

        // 2D layout: flatten to the horizontal plane.
        if self.layout_is_2d {
            return safe_normalize(Vec3::new(d.x, d.y, 0.0));
        }

        let az = d.x.atan2(d.y); // azimuth from +y (forward)
        let el = d.z.clamp(-1.0, 1.0).asin();

        let el2 = match mode {
            ElevationMode::Clamp => el.clamp(self.min_elevation, self.max_elevation),
            ElevationMode::RescaleAtmosUp => remap_clamped(
                el,
                0.0,
                std::f32::consts::FRAC_PI_2,
                self.min_elevation,
                self.max_elevation,
            ),
            ElevationMode::RescaleFullSphere => remap_clamped(
                el,
                -std::f32::consts::FRAC_PI_2,
                std::f32::consts::FRAC_PI_2,
                self.min_elevation,
                self.max_elevation,
            ),
        };

        let cos_el = el2.cos();
        safe_normalize(Vec3::new(az.sin() * cos_el, az.cos() * cos_el, el2.sin()))
    }
}

/// Normalize a vector, substituting the forward direction when the magnitude
/// is non-finite or below 1e-6.
pub(crate) fn safe_normalize(v: Vec3) -> Vec3 {
    let mag = v.length();
    if !mag.is_finite() || mag < 1e-6 {
        return FORWARD;
    }
    v / mag
}

/// Spherical linear interpolation between two unit vectors.
///
/// Near-parallel endpoints blend linearly and renormalize; near-opposite
/// endpoints rotate around a perpendicular axis by `π·t`.
fn slerp_dir(a: Vec3, b: Vec3, t: f32) -> Vec3 {
    let t = t.clamp(0.0, 1.0);
    let dot = a.dot(b).clamp(-1.0, 1.0);

    if dot > 0.9995 {
        return safe_normalize(a + (b - a) * t);
    }

    if dot < -0.9995 {
        let pick = if a.x.abs() < 0.9 { Vec3::X } else { Vec3::Y };
        let perp = a.cross(pick).normalize();
        let theta = std::f32::consts::PI * t;
        return a * theta.cos() + perp * theta.sin();
    }

    let theta = dot.acos();
    let sin_theta = theta.sin();
    let wa = ((1.0 - t) * theta).sin() / sin_theta;
    let wb = (t * theta).sin() / sin_theta;
    a * wa + b * wb
}

/// Interpolate a raw direction from a source's keyframes at time `t`.
/// Times outside the keyframe range clamp to the first/last keyframe.
fn interpolate_dir_raw(kfs: &[Keyframe], t: f64) -> Vec3 {
    match kfs {
        [] => Vec3::ZERO,
        [only] => safe_normalize(only.dir),
        _ => {
            if t <= kfs[0].time {
                return safe_normalize(kfs[0].dir);
            }
            if t >= kfs[kfs.len() - 1].time {
                return safe_normalize(kfs[kfs.len() - 1].dir);
            }

            let mut k1 = &kfs[0];
            let mut k2 = &kfs[1];
            for pair in kfs.windows(2) {
                if t >= pair[0].time && t <= pair[1].time {
                    k1 = &pair[0];
                    k2 = &pair[1];
                    break;
                }
            }

            let dt = k2.time - k1.time;
            if dt <= 1e-9 {
                return safe_normalize(k2.dir);
            }

            let u = ((t - k1.time) / dt).clamp(0.0, 1.0);
            slerp_dir(safe_normalize(k1.dir), safe_normalize(k2.dir), u as f32)
        }
    }
}

/// Validate a raw interpolated direction, falling back when degenerate:
/// last-good direction → temporally nearest keyframe → forward.
fn safe_dir_with_fallback(
    last_good: &mut Option<Vec3>,
    kfs: &[Keyframe],
    raw: Vec3,
    t: f64,
) -> Vec3 {
    let m2 = raw.length_squared();
    if raw.is_finite() && m2.is_finite() && m2 >= 1e-8 {
        let normalized = raw / m2.sqrt();
        *last_good = Some(normalized);
        return normalized;
    }

    if let Some(dir) = *last_good {
        return dir;
    }

    if let Some(nearest) = kfs
        .iter()
        .min_by(|a, b| (t - a.time).abs().total_cmp(&(t - b.time).abs()))
    {
        let fallback = safe_normalize(nearest.dir);
        *last_good = Some(fallback);
        return fallback;
    }

    FORWARD
}

/// Linearly remap `x` from `[in_min, in_max]` to `[out_min, out_max]`,
/// clamping the input to its domain.
fn remap_clamped(x: f32, in_min: f32, in_max: f32, out_min: f32, out_max: f32) -> f32 {
    let denom = in_max - in_min;
    if denom.abs() < 1e-12 {
        return out_min;
    }
    let t = ((x - in_min) / denom).clamp(0.0, 1.0);
    out_min + t * (out_max - out_min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Speaker;
    use crate::scene::TimeUnit;
    use std::collections::BTreeMap;

    fn kf(time: f64, x: f32, y: f32, z: f32) -> Keyframe {
        Keyframe {
            time,
            dir: Vec3::new(x, y, z),
        }
    }

    fn scene_with(sources: Vec<(&str, Vec<Keyframe>)>) -> SpatialScene {
        let mut map = BTreeMap::new();
        for (name, kfs) in sources {
            map.insert(name.to_string(), kfs);
        }
        SpatialScene {
            sample_rate: 48000,
            time_unit: TimeUnit::Seconds,
            sources: map,
            duration: None,
        }
    }

    fn ring_layout() -> SpeakerLayout {
        let speakers = (0..8)
            .map(|i| Speaker {
                azimuth: i as f32 * std::f32::consts::FRAC_PI_4,
                elevation: 0.0,
                radius: 1.0,
            })
            .collect();
        SpeakerLayout {
            speakers,
            subwoofers: Vec::new(),
        }
    }

    fn dome_layout(max_el_deg: f32) -> SpeakerLayout {
        let mut speakers: Vec<Speaker> = (0..4)
            .map(|i| Speaker {
                azimuth: i as f32 * std::f32::consts::FRAC_PI_2,
                elevation: 0.0,
                radius: 1.0,
            })
            .collect();
        speakers.push(Speaker {
            azimuth: 0.0,
            elevation: max_el_deg.to_radians(),
            radius: 1.0,
        });
        SpeakerLayout {
            speakers,
            subwoofers: Vec::new(),
        }
    }

    fn elevation_of(v: Vec3) -> f32 {
        v.z.clamp(-1.0, 1.0).asin()
    }

    #[test]
    fn test_safe_normalize() {
        assert!((safe_normalize(Vec3::new(3.0, 0.0, 0.0)) - Vec3::X).length() < 1e-6);
        assert_eq!(safe_normalize(Vec3::ZERO), FORWARD);
        assert_eq!(safe_normalize(Vec3::new(f32::NAN, 0.0, 0.0)), FORWARD);
        assert_eq!(safe_normalize(Vec3::new(1e-9, 0.0, 0.0)), FORWARD);
        // Any finite vector above the epsilon comes out unit length.
        let v = safe_normalize(Vec3::new(0.2, -4.0, 7.3));
        assert!((v.length() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_slerp_endpoints() {
        let a = Vec3::new(0.0, 1.0, 0.0);
        let b = Vec3::new(1.0, 0.0, 0.0);
        assert!((slerp_dir(a, b, 0.0) - a).length() < 1e-6);
        assert!((slerp_dir(a, b, 1.0) - b).length() < 1e-6);
    }

    #[test]
    fn test_slerp_midpoint_is_unit_and_between() {
        let a = Vec3::new(0.0, 1.0, 0.0);
        let b = Vec3::new(1.0, 0.0, 0.0);
        let mid = slerp_dir(a, b, 0.5);
        assert!((mid.length() - 1.0).abs() < 1e-5);
        // 45° between forward and right.
        let expected = Vec3::new(1.0, 1.0, 0.0).normalize();
        assert!((mid - expected).length() < 1e-5);
    }

    #[test]
    fn test_slerp_near_parallel_uses_linear_blend() {
        let a = Vec3::new(0.0, 1.0, 0.0);
        let b = Vec3::new(0.001, 1.0, 0.0).normalize();
        let mid = slerp_dir(a, b, 0.5);
        assert!((mid.length() - 1.0).abs() < 1e-5);
        assert!(mid.y > 0.999);
    }

    #[test]
    fn test_slerp_antipodal_rotates_through_perpendicular() {
        let a = Vec3::new(0.0, 1.0, 0.0);
        let b = Vec3::new(0.0, -1.0, 0.0);
        let mid = slerp_dir(a, b, 0.5);
        assert!((mid.length() - 1.0).abs() < 1e-5);
        // Halfway through a π rotation: perpendicular to both endpoints.
        assert!(mid.dot(a).abs() < 1e-5);
    }

    #[test]
    fn test_interpolation_clamps_outside_range() {
        let kfs = vec![kf(1.0, 0.0, 1.0, 0.0), kf(2.0, 1.0, 0.0, 0.0)];
        assert!((interpolate_dir_raw(&kfs, 0.0) - Vec3::new(0.0, 1.0, 0.0)).length() < 1e-6);
        assert!((interpolate_dir_raw(&kfs, 5.0) - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn test_single_keyframe() {
        let kfs = vec![kf(0.0, 2.0, 0.0, 0.0)];
        assert!((interpolate_dir_raw(&kfs, 3.0) - Vec3::X).length() < 1e-6);
    }

    #[test]
    fn test_fallback_chain() {
        let kfs = vec![kf(0.0, 1.0, 0.0, 0.0), kf(10.0, 0.0, 1.0, 0.0)];
        let mut last_good = None;

        // Degenerate with no last-good: nearest keyframe by time.
        let dir = safe_dir_with_fallback(&mut last_good, &kfs, Vec3::NAN, 9.0);
        assert!((dir - Vec3::new(0.0, 1.0, 0.0)).length() < 1e-6);

        // A valid direction refreshes the cache.
        let dir = safe_dir_with_fallback(&mut last_good, &kfs, Vec3::new(0.0, 0.0, 1.0), 5.0);
        assert!((dir - Vec3::Z).length() < 1e-6);

        // Degenerate again: last-good wins over nearest keyframe.
        let dir = safe_dir_with_fallback(&mut last_good, &kfs, Vec3::ZERO, 0.0);
        assert!((dir - Vec3::Z).length() < 1e-6);
    }

    #[test]
    fn test_fallback_without_keyframes_is_forward() {
        let mut last_good = None;
        let dir = safe_dir_with_fallback(&mut last_good, &[], Vec3::NAN, 0.0);
        assert_eq!(dir, FORWARD);
    }

    #[test]
    fn test_compute_positions_2d_flattens() {
        let config = Arc::new(RealtimeConfig::new(48000, 512));
        let mut pose = PoseEngine::new(config);
        let scene = scene_with(vec![("1.1", vec![kf(0.0, 0.0, 0.5, 0.5)])]);
        pose.load_scene(&scene, &ring_layout());

        pose.compute_positions(0.0);
        let p = &pose.poses()[0];
        assert!(p.is_valid);
        assert!(p.position.z.abs() < 1e-6);
        assert!((p.position.length() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_elevation_rescale_atmos_up() {
        // Layout covering [0°, 30°]; straight-up input lands on 30°.
        let config = Arc::new(RealtimeConfig::new(48000, 512));
        config.set_elevation_mode(ElevationMode::RescaleAtmosUp);
        let mut pose = PoseEngine::new(config);
        let scene = scene_with(vec![("1.1", vec![kf(0.0, 0.0, 0.0, 1.0)])]);
        pose.load_scene(&scene, &dome_layout(30.0));

        pose.compute_positions(0.0);
        let el = elevation_of(pose.poses()[0].position.normalize());
        assert!((el.to_degrees() - 30.0).abs() < 0.1);
    }

    #[test]
    fn test_elevation_clamp() {
        let config = Arc::new(RealtimeConfig::new(48000, 512));
        config.set_elevation_mode(ElevationMode::Clamp);
        let mut pose = PoseEngine::new(config);
        let scene = scene_with(vec![("1.1", vec![kf(0.0, 0.0, 0.0, 1.0)])]);
        pose.load_scene(&scene, &dome_layout(30.0));

        pose.compute_positions(0.0);
        let el = elevation_of(pose.poses()[0].position.normalize());
        assert!((el.to_degrees() - 30.0).abs() < 0.1);
    }

    #[test]
    fn test_elevation_rescale_full_sphere() {
        let config = Arc::new(RealtimeConfig::new(48000, 512));
        config.set_elevation_mode(ElevationMode::RescaleFullSphere);
        let mut pose = PoseEngine::new(config.clone());

        let scene = scene_with(vec![
            ("down", vec![kf(0.0, 0.0, 0.0, -1.0)]),
            ("up", vec![kf(0.0, 0.0, 0.0, 1.0)]),
        ]);
        pose.load_scene(&scene, &dome_layout(30.0));

        pose.compute_positions(0.0);
        let el_down = elevation_of(pose.poses()[0].position.normalize());
        let el_up = elevation_of(pose.poses()[1].position.normalize());
        assert!(el_down.to_degrees().abs() < 0.1);
        assert!((el_up.to_degrees() - 30.0).abs() < 0.1);
    }

    #[test]
    fn test_elevation_stays_in_bounds_for_all_modes() {
        for mode in [
            ElevationMode::Clamp,
            ElevationMode::RescaleAtmosUp,
            ElevationMode::RescaleFullSphere,
        ] {
            let config = Arc::new(RealtimeConfig::new(48000, 512));
            config.set_elevation_mode(mode);
            let mut pose = PoseEngine::new(config);
            let scene = scene_with(vec![
                ("a", vec![kf(0.0, 0.3, 0.1, 0.95)]),
                ("b", vec![kf(0.0, 0.0, 0.4, -0.9)]),
            ]);
            pose.load_scene(&scene, &dome_layout(30.0));
            pose.compute_positions(0.0);

            for p in pose.poses() {
                let el = elevation_of(p.position.normalize()).to_degrees();
                assert!(el >= -0.1 && el <= 30.1, "mode {:?}: el {}", mode, el);
            }
        }
    }

    #[test]
    fn test_lfe_bypasses_interpolation() {
        let config = Arc::new(RealtimeConfig::new(48000, 512));
        let mut pose = PoseEngine::new(config);
        let scene = scene_with(vec![("LFE", vec![kf(0.0, 0.0, 0.0, 0.0)])]);
        pose.load_scene(&scene, &ring_layout());

        pose.compute_positions(0.5);
        let p = &pose.poses()[0];
        assert!(p.is_lfe);
        assert!(p.is_valid);
        assert_eq!(p.position, Vec3::ZERO);
    }

    #[test]
    fn test_empty_keyframes_invalid() {
        let config = Arc::new(RealtimeConfig::new(48000, 512));
        let mut pose = PoseEngine::new(config);
        let scene = scene_with(vec![("1.1", vec![])]);
        pose.load_scene(&scene, &ring_layout());

        pose.compute_positions(0.0);
        assert!(!pose.poses()[0].is_valid);
    }

    #[test]
    fn test_pan_trajectory_position_scaled_by_radius() {
        let config = Arc::new(RealtimeConfig::new(48000, 512));
        let mut pose = PoseEngine::new(config);
        let scene = scene_with(vec![(
            "1.1",
            vec![kf(0.0, 0.0, 1.0, 0.0), kf(1.0, 1.0, 0.0, 0.0)],
        )]);
        let mut layout = ring_layout();
        for spk in &mut layout.speakers {
            spk.radius = 3.0;
        }
        pose.load_scene(&scene, &layout);

        pose.compute_positions(0.0);
        let p0 = pose.poses()[0].position;
        assert!((p0 - Vec3::new(0.0, 3.0, 0.0)).length() < 1e-5);

        pose.compute_positions(1.0);
        let p1 = pose.poses()[0].position;
        assert!((p1 - Vec3::new(3.0, 0.0, 0.0)).length() < 1e-5);
    }
}
