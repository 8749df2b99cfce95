//! Video job orchestration around the tracker: admission, path checks, the
//! per-frame loop, status bookkeeping and final encoding.

pub mod ffmpeg;
pub mod job;
pub mod media;
pub mod path;
pub mod processor;
pub mod selection;

pub use ffmpeg::FfmpegFinalizer;
pub use job::{JobStatus, JobStore, ProcessingStage};
pub use media::{
    Compositor, Detector, FinalizeMode, Finalizer, FrameWriter, MediaBackend, VideoInfo,
    VideoReader,
};
pub use path::validate_video_path;
pub use processor::{
    PerformanceMetrics, ProcessingRequest, ProcessingResponse, TrackingMetadata, VideoProcessor,
};
pub use selection::PlayerSelection;
