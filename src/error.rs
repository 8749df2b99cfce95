use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid video path: {0}")]
    InvalidPath(PathBuf),

    #[error("Video path not allowed: {0}")]
    PathNotAllowed(PathBuf),

    #[error("Video file not found: {0}")]
    VideoNotFound(PathBuf),

    #[error("Video too long: {duration:.1}s (max: {max:.0}s)")]
    VideoTooLong { duration: f64, max: f64 },

    #[error("Invalid video: {0}")]
    InvalidVideo(String),

    #[error("Invalid frame range: {0}")]
    InvalidRange(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to open video: {0}")]
    Open(String),

    #[error("Failed to read frame {frame}: {reason}")]
    Read { frame: u64, reason: String },

    #[error("Failed to write frame: {0}")]
    Write(String),

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("FFmpeg failed with return code {code:?}: {stderr}")]
    Encode { code: Option<i32>, stderr: String },

    #[error("Detector Error: {0}")]
    Detector(String),

    #[error("Compositor Error: {0}")]
    Compositor(String),

    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    #[error("Job cancelled")]
    Cancelled,

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Errors caused by the request itself, reported before the job does any work.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidPath(_)
                | Error::PathNotAllowed(_)
                | Error::VideoNotFound(_)
                | Error::VideoTooLong { .. }
                | Error::InvalidVideo(_)
                | Error::InvalidRange(_)
                | Error::InvalidConfig(_)
        )
    }

    /// Per-frame collaborator failures; the pipeline substitutes safe defaults for these.
    pub fn is_frame_level(&self) -> bool {
        matches!(self, Error::Detector(_) | Error::Compositor(_))
    }
}
