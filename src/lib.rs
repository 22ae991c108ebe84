//! AuraSonic — real-time multi-source spatial audio renderer.
//!
//! Given a time-keyframed spatial scene, a speaker layout and per-source
//! audio files (mono files or one interleaved multichannel file), the engine
//! continuously renders an N-channel output stream so that each source is
//! heard from its keyframed direction. Panning is distance-based amplitude
//! panning (DBAP) across the layout's main speakers; `LFE` sources route
//! directly to the subwoofer channels.
//!
//! The audio callback never allocates, locks, or touches a file handle:
//! disk audio arrives through lock-free double buffers kept ahead of
//! playback by a background loader, and all control changes travel through
//! relaxed atomics smoothed per block.

pub mod config;
pub mod engine;
pub mod error;
pub mod layout;
pub mod pose;
pub mod remap;
pub mod scene;
pub mod spatial;
pub mod streaming;

pub use config::{ElevationMode, EngineState, RealtimeConfig};
pub use engine::{AuraSonicEngine, BlockProcessor};
pub use error::AuraSonicError;
pub use layout::{Speaker, SpeakerLayout};
pub use pose::{PoseEngine, SourcePose};
pub use remap::OutputRemap;
pub use scene::{Keyframe, SpatialScene, TimeUnit};
pub use spatial::{BlockControls, BlockSource, DbapPanner, Spatializer};
pub use streaming::Streaming;
