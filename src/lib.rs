pub mod association;
pub mod bbox;
pub mod config;
pub mod detection;
pub mod error;
pub mod frame;
pub mod kalman;
pub mod pipeline;
pub mod session;
pub mod track;
pub mod tracker;

pub use config::{EffectConfig, PipelineConfig, TrackerConfig};
pub use detection::{BoundingBox, DetectionResult};
pub use error::{Error, Result};
pub use frame::Frame;
pub use track::{Track, TrackOutput, TrackState};
pub use tracker::ByteTracker;

/// Anything that turns a frame's detections into identified tracks.
pub trait Tracking {
    fn update(&mut self, detections: &[BoundingBox], timestamp: f64) -> Vec<TrackOutput>;
    fn reset(&mut self);
}
