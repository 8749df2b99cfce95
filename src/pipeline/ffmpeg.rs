use async_trait::async_trait;
use serde_derive::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

use super::media::{FinalizeMode, Finalizer};
use crate::config::{PipelineConfig, Resolution};
use crate::error::{Error, Result};

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

/// Dimensions of the first video stream in `ffprobe -print_format json` output.
fn parse_probe(stdout: &[u8]) -> Option<Resolution> {
    let probe: ProbeOutput = serde_json::from_slice(stdout).ok()?;

    probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .and_then(|s| match (s.width, s.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some(Resolution::new(w, h)),
            _ => None,
        })
}

/// Final encode through the `ffmpeg` command line tools.
#[derive(Debug, Clone)]
pub struct FfmpegFinalizer {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    preset: String,
    crf: u32,
    fps: u32,
}

impl FfmpegFinalizer {
    pub fn new(preset: impl Into<String>, crf: u32, fps: u32) -> Self {
        Self {
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
            preset: preset.into(),
            crf,
            fps,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.ffmpeg_preset.clone(), config.ffmpeg_crf, config.default_fps)
    }

    pub fn with_binaries(
        mut self,
        ffmpeg: impl Into<PathBuf>,
        ffprobe: impl Into<PathBuf>,
    ) -> Self {
        self.ffmpeg = ffmpeg.into();
        self.ffprobe = ffprobe.into();
        self
    }

    /// `Ok(None)` when the dimensions cannot be determined.
    async fn probe(&self, input: &Path) -> Result<Option<Resolution>> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-print_format", "json", "-show_streams"])
            .arg(input)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Probe(format!("{}: {}", self.ffprobe.display(), e)))?;

        if !output.status.success() {
            warn!(
                input = %input.display(),
                code = ?output.status.code(),
                "ffprobe failed, assuming rescale"
            );
            return Ok(None);
        }

        Ok(parse_probe(&output.stdout))
    }

    fn encode_args(
        &self,
        input: &Path,
        output: &Path,
        target: Resolution,
        mode: FinalizeMode,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-y".into(), "-i".into(), input.into()];

        match mode {
            FinalizeMode::Reencode => {
                args.push("-vf".into());
                args.push(format!("scale={}:{}", target.width, target.height).into());
                args.push("-c:v".into());
                args.push("libx264".into());
                args.push("-preset".into());
                args.push(self.preset.as_str().into());
                args.push("-crf".into());
                args.push(self.crf.to_string().into());
                args.push("-r".into());
                args.push(self.fps.to_string().into());
            }
            FinalizeMode::StreamCopy => {
                args.push("-c:v".into());
                args.push("copy".into());
                args.push("-c:a".into());
                args.push("copy".into());
            }
        }

        args.push("-movflags".into());
        args.push("faststart".into());
        args.push(output.into());

        args
    }
}

#[async_trait]
impl Finalizer for FfmpegFinalizer {
    async fn finalize(
        &self,
        input: &Path,
        output: &Path,
        target: Resolution,
    ) -> Result<FinalizeMode> {
        let mode = match self.probe(input).await? {
            Some(dims) if dims == target => FinalizeMode::StreamCopy,
            _ => FinalizeMode::Reencode,
        };

        info!(
            input = %input.display(),
            output = %output.display(),
            target = %target,
            ?mode,
            "finalizing video"
        );

        let result = Command::new(&self.ffmpeg)
            .args(self.encode_args(input, output, target, mode))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let failure = match result {
            Ok(out) if out.status.success() => return Ok(mode),
            Ok(out) => Error::Encode {
                code: out.status.code(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            },
            Err(e) => Error::Encode {
                code: None,
                stderr: format!("{}: {}", self.ffmpeg.display(), e),
            },
        };

        if let Err(e) = tokio::fs::remove_file(output).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(output = %output.display(), "cannot remove partial output: {}", e);
            }
        }

        Err(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn probe_picks_first_video_stream() {
        let json = br#"{"streams": [
            {"codec_type": "audio"},
            {"codec_type": "video", "width": 1280, "height": 720},
            {"codec_type": "video", "width": 640, "height": 360}
        ]}"#;

        assert_eq!(parse_probe(json), Some(Resolution::new(1280, 720)));
        assert_eq!(parse_probe(br#"{"streams": [{"codec_type": "audio"}]}"#), None);
        assert_eq!(parse_probe(b"garbage"), None);
    }

    #[test]
    fn reencode_scales_with_configured_quality() {
        let f = FfmpegFinalizer::new("fast", 23, 30);
        let args = strings(f.encode_args(
            Path::new("/tmp/in.mp4"),
            Path::new("/out/x.mp4"),
            Resolution::new(1920, 1080),
            FinalizeMode::Reencode,
        ));

        assert_eq!(
            args,
            [
                "-y", "-i", "/tmp/in.mp4", "-vf", "scale=1920:1080", "-c:v", "libx264",
                "-preset", "fast", "-crf", "23", "-r", "30", "-movflags", "faststart",
                "/out/x.mp4",
            ]
        );
    }

    #[test]
    fn stream_copy_does_not_touch_codecs() {
        let f = FfmpegFinalizer::new("fast", 23, 30);
        let args = strings(f.encode_args(
            Path::new("in.mp4"),
            Path::new("out.mp4"),
            Resolution::new(1920, 1080),
            FinalizeMode::StreamCopy,
        ));

        assert!(args.windows(2).any(|w| w == ["-c:v", "copy"]));
        assert!(args.windows(2).any(|w| w == ["-c:a", "copy"]));
        assert!(!args.iter().any(|a| a.starts_with("scale=")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_encode_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.mp4");
        let output = dir.path().join("out.mp4");
        std::fs::write(&input, b"x").unwrap();
        std::fs::write(&output, b"partial").unwrap();

        let f = FfmpegFinalizer::new("fast", 23, 30).with_binaries("false", "false");
        let err = f
            .finalize(&input, &output, Resolution::new(1920, 1080))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Encode { code: Some(1), .. }));
        assert!(!output.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unknown_dimensions_reencode() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.mp4");

        let f = FfmpegFinalizer::new("fast", 23, 30).with_binaries("true", "true");
        let mode = f
            .finalize(&input, &dir.path().join("out.mp4"), Resolution::new(640, 360))
            .await
            .unwrap();

        assert_eq!(mode, FinalizeMode::Reencode);
    }

    #[tokio::test]
    async fn missing_probe_binary_is_a_probe_error() {
        let f = FfmpegFinalizer::new("fast", 23, 30)
            .with_binaries("ffmpeg-not-installed", "ffprobe-not-installed");
        let err = f
            .finalize(Path::new("in.mp4"), Path::new("out.mp4"), Resolution::new(1, 1))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Probe(_)));
    }
}
