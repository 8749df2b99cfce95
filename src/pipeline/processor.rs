use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{JobStatus, JobStore, ProcessingStage};
use super::media::{
    Compositor, Detector, FinalizeMode, Finalizer, MediaBackend, VideoInfo, VideoReader,
};
use super::path::validate_video_path;
use super::selection::PlayerSelection;
use crate::config::{EffectConfig, PipelineConfig};
use crate::detection::DetectionResult;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::session::{SessionCache, SessionConfig, SessionFrame};
use crate::track::TrackOutput;
use crate::tracker::{ByteTracker, TrackerStats};

const SHUTDOWN_REASON: &str = "Service shutdown";

/// Progress reached once the video is open.
const LOADED_PROGRESS: f32 = 0.1;
/// Share of the progress bar covered by the frame loop.
const FRAME_LOOP_SPAN: f32 = 0.7;
const RENDERED_PROGRESS: f32 = 0.8;
const ENCODING_PROGRESS: f32 = 0.9;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessingRequest {
    pub video_path: PathBuf,
    /// Seconds from the start of the video.
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub end_time: Option<f64>,
    #[serde(default)]
    pub player_selection: PlayerSelection,
    #[serde(default)]
    pub effect_config: EffectConfig,
    #[serde(default)]
    pub output_filename: Option<String>,
}

impl ProcessingRequest {
    pub fn new(video_path: impl Into<PathBuf>) -> Self {
        Self {
            video_path: video_path.into(),
            start_time: 0.0,
            end_time: None,
            player_selection: PlayerSelection::default(),
            effect_config: EffectConfig::default(),
            output_filename: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.start_time.is_finite() || self.start_time < 0.0 {
            return Err(Error::InvalidRange(format!(
                "start_time must be non-negative, got {}",
                self.start_time
            )));
        }

        if let Some(end) = self.end_time {
            if !end.is_finite() || end < 0.0 {
                return Err(Error::InvalidRange(format!(
                    "end_time must be non-negative, got {}",
                    end
                )));
            }
        }

        self.effect_config.validate()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrackingMetadata {
    /// Frames in the requested range.
    pub total_frames: u64,
    pub fps: f64,
    /// Length of the source video, in seconds.
    pub duration: f64,
    pub tracks: Vec<TrackOutput>,
    pub player_count: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PerformanceMetrics {
    pub processing_time_seconds: f64,
    pub frames_per_second: f64,
    pub realtime_factor: f64,
    pub frames_processed: u64,
    pub detector_time_ms: f64,
    pub finalize_mode: FinalizeMode,
    pub selected_track: Option<u64>,
    pub tracker: TrackerStats,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessingResponse {
    pub job_id: Uuid,
    pub output_path: PathBuf,
    pub processing_time: f64,
    pub tracking_metadata: TrackingMetadata,
    pub effect_applied: EffectConfig,
    pub performance_metrics: PerformanceMetrics,
}

/// Inclusive range of frame indexes to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameRange {
    start: u64,
    end: u64,
}

impl FrameRange {
    fn new(info: &VideoInfo, start_time: f64, end_time: Option<f64>) -> Result<Self> {
        let last = info.frame_count.saturating_sub(1);
        let start = (start_time * info.fps).floor().max(0.0) as u64;
        let end = end_time.map_or(last, |t| ((t * info.fps).floor().max(0.0) as u64).min(last));

        if start > end {
            return Err(Error::InvalidRange(format!(
                "start frame {} is past end frame {}",
                start, end
            )));
        }

        Ok(Self { start, end })
    }

    #[inline]
    fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Caller-chosen names must be plain file names; generated names carry the
/// job id so concurrent jobs never share an output file.
fn output_path(dir: &Path, filename: Option<&str>, job_id: Uuid) -> Result<PathBuf> {
    let name = match filename {
        Some(name) => {
            let plain = !name.is_empty()
                && name != "."
                && name != ".."
                && !name.contains(['/', '\\']);

            if !plain {
                return Err(Error::InvalidPath(name.into()));
            }

            if name.ends_with(".mp4") {
                name.to_string()
            } else {
                format!("{}.mp4", name)
            }
        }
        None => {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);

            format!("highlight_{}_{}.mp4", secs, job_id.simple())
        }
    };

    Ok(dir.join(name))
}

async fn remove_temp(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), "cannot remove intermediate file: {}", e);
        }
    }
}

struct FrameLoopOutput {
    tracks: Vec<TrackOutput>,
    frames: u64,
    detector_time_ms: f64,
    selected: Option<u64>,
    stats: TrackerStats,
}

struct Inner {
    config: PipelineConfig,
    detector: Arc<dyn Detector>,
    compositor: Arc<dyn Compositor>,
    media: Arc<dyn MediaBackend>,
    finalizer: Arc<dyn Finalizer>,
    permits: Semaphore,
    jobs: JobStore,
    sessions: SessionCache,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Runs highlight jobs: at most `max_concurrent_jobs` at a time, each one
/// strictly sequential over its frames with its own tracker.
#[derive(Clone)]
pub struct VideoProcessor {
    inner: Arc<Inner>,
}

impl VideoProcessor {
    /// Starts the session sweeper, so it has to be called inside a Tokio runtime.
    pub fn new(
        config: PipelineConfig,
        detector: Arc<dyn Detector>,
        compositor: Arc<dyn Compositor>,
        media: Arc<dyn MediaBackend>,
        finalizer: Arc<dyn Finalizer>,
    ) -> Result<Self> {
        config.validate()?;

        let sessions = SessionCache::new(SessionConfig {
            idle_timeout: config.session_idle_timeout(),
            max_sessions: config.max_sessions,
        });
        let sweeper = sessions.spawn_sweeper(config.session_sweep_interval());

        Ok(Self {
            inner: Arc::new(Inner {
                permits: Semaphore::new(config.max_concurrent_jobs),
                config,
                detector,
                compositor,
                media,
                finalizer,
                jobs: JobStore::new(),
                sessions,
                sweeper: Mutex::new(Some(sweeper)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    #[inline]
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    #[inline]
    pub fn sessions(&self) -> &SessionCache {
        &self.inner.sessions
    }

    pub fn status(&self, job_id: &Uuid) -> Result<JobStatus> {
        self.inner.jobs.status(job_id)
    }

    /// Statuses of every job still inside its retention window.
    pub fn jobs(&self) -> Vec<JobStatus> {
        self.inner.jobs.list()
    }

    /// Processes one request to completion. The job is queryable through
    /// `status` while it runs and for the retention window afterwards.
    ///
    /// The job runs on its own task: dropping the returned future detaches
    /// the caller but the job still finishes, cleans up and expires.
    pub async fn process_video(&self, request: ProcessingRequest) -> Result<ProcessingResponse> {
        let (job_id, handle) = self.spawn_job(request);

        match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!(job_id = %job_id, "job task did not finish: {}", e);
                self.inner.jobs.fail(&job_id, &e);
                if !self.is_closed() {
                    self.inner
                        .jobs
                        .schedule_removal(job_id, self.inner.config.job_retention());
                }

                Err(Error::Cancelled)
            }
        }
    }

    /// Queues a request in the background and returns its job id at once.
    pub fn submit(&self, request: ProcessingRequest) -> Uuid {
        let (job_id, _detached) = self.spawn_job(request);

        job_id
    }

    fn spawn_job(
        &self,
        request: ProcessingRequest,
    ) -> (Uuid, JoinHandle<Result<ProcessingResponse>>) {
        let job_id = Uuid::new_v4();
        self.inner.jobs.insert(job_id);

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run(job_id, request).await });

        (job_id, handle)
    }

    /// Single-frame tracking for callers that keep their own session id.
    pub async fn track_frame(
        &self,
        session_id: &str,
        frame: &Frame,
        timestamp: f64,
    ) -> SessionFrame {
        let result = self.detect(frame, frame.index, timestamp).await;
        let players = self
            .inner
            .sessions
            .track(session_id, &result.detections, timestamp);

        SessionFrame {
            session_id: session_id.to_string(),
            timestamp,
            players,
            processing_time: result.processing_time_ms,
        }
    }

    /// Fails every unfinished job, stops admitting new ones and cancels the
    /// background timers. Jobs already inside the frame loop stop at the
    /// next frame boundary.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.permits.close();

        let failed = self.inner.jobs.fail_active(SHUTDOWN_REASON);

        let sweeper = self.inner.sweeper.lock().take();
        if let Some(handle) = sweeper {
            handle.abort();
            let _ = handle.await;
        }

        self.inner.jobs.shutdown().await;

        info!(failed, "video processor shut down");
    }

    #[inline]
    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    async fn run(&self, job_id: Uuid, request: ProcessingRequest) -> Result<ProcessingResponse> {
        let result = self.execute(job_id, &request).await;

        if let Err(e) = &result {
            error!(job_id = %job_id, "job failed: {}", e);
            self.inner.jobs.fail(&job_id, e);
        }

        if !self.is_closed() {
            self.inner
                .jobs
                .schedule_removal(job_id, self.inner.config.job_retention());
        }

        result
    }

    async fn detect(&self, frame: &Frame, frame_index: u64, timestamp: f64) -> DetectionResult {
        match self.inner.detector.detect(frame, frame_index, timestamp).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    frame = frame_index,
                    "detection failed, treating frame as empty: {}",
                    e
                );
                DetectionResult::empty(frame_index, timestamp)
            }
        }
    }

    async fn execute(
        &self,
        job_id: Uuid,
        request: &ProcessingRequest,
    ) -> Result<ProcessingResponse> {
        let inner = &self.inner;
        let config = &inner.config;
        let started = Instant::now();

        request.validate()?;
        let path = validate_video_path(&request.video_path, &config.allowed_video_dirs)?;
        let output_path =
            output_path(&config.output_dir, request.output_filename.as_deref(), job_id)?;

        let _permit = inner.permits.acquire().await.map_err(|_| Error::Cancelled)?;
        if self.is_closed() {
            return Err(Error::Cancelled);
        }

        info!(job_id = %job_id, path = %path.display(), "starting video processing job");

        let mut reader = inner.media.open(&path).await?;
        let info = reader.info();
        info.validate(config.max_video_duration)?;
        let range = FrameRange::new(&info, request.start_time, request.end_time)?;

        info!(
            job_id = %job_id,
            frames = info.frame_count,
            fps = info.fps,
            duration = info.duration(),
            "video loaded"
        );

        inner.jobs.advance(
            &job_id,
            ProcessingStage::Detecting,
            LOADED_PROGRESS,
            "Loading video and initializing detection",
        );

        tokio::fs::create_dir_all(&config.temp_dir).await?;
        tokio::fs::create_dir_all(&config.output_dir).await?;
        let temp_path = config.temp_dir.join(format!("{}_temp.mp4", job_id));

        let produced = self
            .produce(job_id, request, reader.as_mut(), &info, range, &temp_path, &output_path)
            .await;
        drop(reader);
        remove_temp(&temp_path).await;
        let (frames, mode) = produced?;

        let processing_time = started.elapsed().as_secs_f64();
        let per_second = |x: f64| {
            if processing_time > 0.0 {
                x / processing_time
            } else {
                0.0
            }
        };

        let player_count = frames
            .tracks
            .iter()
            .map(|t| t.track_id)
            .collect::<HashSet<_>>()
            .len();

        let response = ProcessingResponse {
            job_id,
            output_path,
            processing_time,
            tracking_metadata: TrackingMetadata {
                total_frames: range.len(),
                fps: info.fps,
                duration: info.duration(),
                tracks: frames.tracks,
                player_count,
            },
            effect_applied: request.effect_config.clone(),
            performance_metrics: PerformanceMetrics {
                processing_time_seconds: processing_time,
                frames_per_second: per_second(frames.frames as f64),
                realtime_factor: per_second(info.duration()),
                frames_processed: frames.frames,
                detector_time_ms: frames.detector_time_ms,
                finalize_mode: mode,
                selected_track: frames.selected,
                tracker: frames.stats,
            },
        };

        inner.jobs.advance(
            &job_id,
            ProcessingStage::Completed,
            1.0,
            "Processing completed successfully",
        );

        info!(
            job_id = %job_id,
            seconds = processing_time,
            realtime_factor = response.performance_metrics.realtime_factor,
            players = player_count,
            "job completed"
        );

        Ok(response)
    }

    #[allow(clippy::too_many_arguments)]
    async fn produce(
        &self,
        job_id: Uuid,
        request: &ProcessingRequest,
        reader: &mut dyn VideoReader,
        info: &VideoInfo,
        range: FrameRange,
        temp_path: &Path,
        output_path: &Path,
    ) -> Result<(FrameLoopOutput, FinalizeMode)> {
        let inner = &self.inner;

        let frames = self.frame_loop(job_id, request, reader, info, range, temp_path).await?;

        inner.jobs.advance(
            &job_id,
            ProcessingStage::Rendering,
            RENDERED_PROGRESS,
            "Rendering complete",
        );
        inner.jobs.advance(
            &job_id,
            ProcessingStage::Encoding,
            ENCODING_PROGRESS,
            "Finalizing video",
        );

        let mode = inner
            .finalizer
            .finalize(temp_path, output_path, inner.config.output_resolution)
            .await?;

        Ok((frames, mode))
    }

    async fn frame_loop(
        &self,
        job_id: Uuid,
        request: &ProcessingRequest,
        reader: &mut dyn VideoReader,
        info: &VideoInfo,
        range: FrameRange,
        temp_path: &Path,
    ) -> Result<FrameLoopOutput> {
        let inner = &self.inner;
        let total = range.len();

        reader.seek(range.start).await?;
        let mut writer = inner.media.create_writer(temp_path, info).await?;
        let mut tracker = ByteTracker::new(inner.config.tracker.clone());

        let mut out = FrameLoopOutput {
            tracks: Vec::new(),
            frames: 0,
            detector_time_ms: 0.0,
            selected: None,
            stats: TrackerStats::default(),
        };

        for i in 0..total {
            if self.is_closed() {
                return Err(Error::Cancelled);
            }

            let frame_index = range.start + i;
            let timestamp = frame_index as f64 / info.fps;

            inner.jobs.advance(
                &job_id,
                ProcessingStage::Tracking,
                LOADED_PROGRESS + FRAME_LOOP_SPAN * (i as f32 / total as f32),
                format!("Processing frame {}/{}", i + 1, total),
            );

            let frame = match reader.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    warn!(job_id = %job_id, frame = frame_index, "video ended before range end");
                    break;
                }
                Err(e) => {
                    warn!(job_id = %job_id, frame = frame_index, "cannot read frame: {}", e);
                    break;
                }
            };

            let detection = self.detect(&frame, frame_index, timestamp).await;
            out.detector_time_ms += detection.processing_time_ms;

            let tracks = tracker.update(&detection.detections, timestamp);

            if out.selected.is_none() && !tracks.is_empty() {
                out.selected = request.player_selection.select(&tracks);
                if let Some(id) = out.selected {
                    info!(
                        job_id = %job_id,
                        track_id = id,
                        frame = frame_index,
                        "spotlight selected"
                    );
                }
            }

            let composited = inner
                .compositor
                .render(&frame, &tracks, &request.effect_config, out.selected)
                .await;

            let rendered = match composited {
                Ok(rendered) => rendered,
                Err(e) => {
                    warn!(
                        job_id = %job_id,
                        frame = frame_index,
                        "compositing failed, passing frame through: {}",
                        e
                    );
                    frame
                }
            };

            writer.write_frame(&rendered).await?;
            out.frames += 1;

            if i % 30 == 0 {
                debug!(
                    job_id = %job_id,
                    frame = i,
                    total,
                    detections = detection.detections.len(),
                    tracks = tracks.len(),
                    "frame processed"
                );
            }

            out.tracks.extend(tracks);
        }

        writer.finish().await?;
        out.stats = tracker.stats();

        Ok(out)
    }
}
