//! Seams to the collaborators the pipeline drives but does not implement:
//! the detector, the effect compositor, video I/O and final encoding.

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;

use crate::config::{EffectConfig, Resolution};
use crate::detection::DetectionResult;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::track::TrackOutput;

#[async_trait]
pub trait Detector: Send + Sync {
    /// Implementations should fold internal failures into an empty result;
    /// an `Err` here is still treated as "nothing seen" by the pipeline.
    async fn detect(&self, frame: &Frame, frame_index: u64, timestamp: f64)
        -> Result<DetectionResult>;
}

#[async_trait]
pub trait Compositor: Send + Sync {
    /// On `Err` the pipeline writes `frame` unmodified.
    async fn render(
        &self,
        frame: &Frame,
        tracks: &[TrackOutput],
        effect: &EffectConfig,
        selected: Option<u64>,
    ) -> Result<Frame>;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub fps: f64,
    pub frame_count: u64,
    pub width: u32,
    pub height: u32,
}

impl VideoInfo {
    /// In seconds.
    pub fn duration(&self) -> f64 {
        if self.fps > 0.0 {
            self.frame_count as f64 / self.fps
        } else {
            0.0
        }
    }

    pub fn validate(&self, max_duration: f64) -> Result<()> {
        if !self.fps.is_finite() || self.fps <= 0.0 {
            return Err(Error::InvalidVideo(format!("unreadable frame rate {}", self.fps)));
        }

        if self.frame_count == 0 {
            return Err(Error::InvalidVideo("no frames".into()));
        }

        let duration = self.duration();
        if duration > max_duration {
            return Err(Error::VideoTooLong {
                duration,
                max: max_duration,
            });
        }

        Ok(())
    }
}

#[async_trait]
pub trait VideoReader: Send {
    fn info(&self) -> VideoInfo;

    /// Positions the reader so the next `read_frame` returns `frame_index`.
    async fn seek(&mut self, frame_index: u64) -> Result<()>;

    /// `Ok(None)` at end of stream.
    async fn read_frame(&mut self) -> Result<Option<Frame>>;
}

#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Flushes and closes the intermediate file.
    async fn finish(&mut self) -> Result<()>;
}

#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Box<dyn VideoReader>>;

    async fn create_writer(&self, path: &Path, info: &VideoInfo) -> Result<Box<dyn FrameWriter>>;
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeMode {
    /// Dimensions already matched; streams copied without re-encoding.
    StreamCopy,
    Reencode,
}

#[async_trait]
pub trait Finalizer: Send + Sync {
    /// Turns the intermediate at `input` into the deliverable at `output`.
    /// Must not leave a partial `output` behind on failure.
    async fn finalize(&self, input: &Path, output: &Path, target: Resolution)
        -> Result<FinalizeMode>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(fps: f64, frame_count: u64) -> VideoInfo {
        VideoInfo {
            fps,
            frame_count,
            width: 1280,
            height: 720,
        }
    }

    #[test]
    fn duration_from_frames_and_rate() {
        approx::assert_relative_eq!(info(25.0, 250).duration(), 10.0);
        assert_eq!(info(0.0, 250).duration(), 0.0);
    }

    #[test]
    fn validation() {
        assert!(info(30.0, 900).validate(300.0).is_ok());
        assert!(matches!(
            info(30.0, 9001).validate(300.0),
            Err(Error::VideoTooLong { .. })
        ));
        assert!(matches!(info(f64::NAN, 10).validate(300.0), Err(Error::InvalidVideo(_))));
        assert!(matches!(info(30.0, 0).validate(300.0), Err(Error::InvalidVideo(_))));
    }
}
