use serde_derive::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::association::AssociationThresholds;
use crate::error::{Error, Result};

const ENV_PREFIX: &str = "PITCHTRACK_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    /// Detections at or above this confidence are "high" and may found tracks.
    pub track_thresh: f32,
    /// Frames a track may go unmatched before it is evicted.
    pub track_buffer: u32,
    pub match_thresh: f32,
    pub low_match_thresh: f32,
    /// Consecutive hits needed before a track is reported.
    pub min_hits: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            track_thresh: 0.6,
            track_buffer: 30,
            match_thresh: 0.8,
            low_match_thresh: 0.5,
            min_hits: 3,
        }
    }
}

impl TrackerConfig {
    #[inline]
    pub fn thresholds(&self) -> AssociationThresholds {
        AssociationThresholds {
            track_thresh: self.track_thresh,
            match_thresh: self.match_thresh,
            low_match_thresh: self.low_match_thresh,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("track_thresh", self.track_thresh),
            ("match_thresh", self.match_thresh),
            ("low_match_thresh", self.low_match_thresh),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(Error::InvalidConfig(format!(
                    "{} must be in [0, 1], got {}",
                    name, v
                )));
            }
        }

        if self.min_hits == 0 {
            return Err(Error::InvalidConfig("min_hits must be positive".into()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || {
            Error::InvalidConfig(format!(
                "resolution must look like 1920x1080, got {:?}",
                s
            ))
        };
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(bad)?;
        let width = w.parse().map_err(|_| bad())?;
        let height = h.parse().map_err(|_| bad())?;

        if width == 0 || height == 0 {
            return Err(bad());
        }

        Ok(Self { width, height })
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl serde::Serialize for Resolution {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Resolution {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub tracker: TrackerConfig,
    pub max_concurrent_jobs: usize,
    /// Longest accepted source video, in seconds.
    pub max_video_duration: f64,
    pub allowed_video_dirs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub output_resolution: Resolution,
    pub ffmpeg_preset: String,
    pub ffmpeg_crf: u32,
    pub default_fps: u32,
    /// How long finished job statuses stay queryable, in seconds.
    pub job_retention_secs: u64,
    /// Seconds without an update after which a tracking session is dropped.
    pub session_idle_timeout_secs: u64,
    pub max_sessions: usize,
    pub session_sweep_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            max_concurrent_jobs: 2,
            max_video_duration: 300.0,
            allowed_video_dirs: vec!["/app/videos".into(), "/app/uploads".into(), "/tmp".into()],
            output_dir: "./output".into(),
            temp_dir: "./temp".into(),
            output_resolution: Resolution::new(1920, 1080),
            ffmpeg_preset: "fast".into(),
            ffmpeg_crf: 23,
            default_fps: 30,
            job_retention_secs: 300,
            session_idle_timeout_secs: 60,
            max_sessions: 256,
            session_sweep_interval_secs: 10,
        }
    }
}

fn env_override<T: FromStr>(key: &str, target: &mut T) -> Result<()> {
    let name = format!("{}{}", ENV_PREFIX, key);

    if let Ok(raw) = std::env::var(&name) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("cannot parse {}={:?}", name, raw)))?;
    }

    Ok(())
}

impl PipelineConfig {
    pub fn from_json(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;

        Ok(config)
    }

    /// Defaults overridden by `PITCHTRACK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut c = Self::default();

        env_override("TRACK_THRESH", &mut c.tracker.track_thresh)?;
        env_override("TRACK_BUFFER", &mut c.tracker.track_buffer)?;
        env_override("MATCH_THRESH", &mut c.tracker.match_thresh)?;
        env_override("MAX_CONCURRENT_JOBS", &mut c.max_concurrent_jobs)?;
        env_override("MAX_VIDEO_DURATION", &mut c.max_video_duration)?;
        env_override("OUTPUT_DIR", &mut c.output_dir)?;
        env_override("TEMP_DIR", &mut c.temp_dir)?;
        env_override("OUTPUT_RESOLUTION", &mut c.output_resolution)?;
        env_override("FFMPEG_PRESET", &mut c.ffmpeg_preset)?;
        env_override("FFMPEG_CRF", &mut c.ffmpeg_crf)?;
        env_override("DEFAULT_FPS", &mut c.default_fps)?;
        env_override("JOB_RETENTION_SECS", &mut c.job_retention_secs)?;
        env_override("SESSION_IDLE_TIMEOUT_SECS", &mut c.session_idle_timeout_secs)?;
        env_override("MAX_SESSIONS", &mut c.max_sessions)?;

        if let Ok(dirs) = std::env::var(format!("{}ALLOWED_VIDEO_DIRS", ENV_PREFIX)) {
            c.allowed_video_dirs = dirs
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(PathBuf::from)
                .collect();
        }

        c.validate()?;

        Ok(c)
    }

    pub fn validate(&self) -> Result<()> {
        self.tracker.validate()?;

        if self.max_concurrent_jobs == 0 {
            return Err(Error::InvalidConfig(
                "max_concurrent_jobs must be positive".into(),
            ));
        }

        if self.allowed_video_dirs.is_empty() {
            return Err(Error::InvalidConfig(
                "allowed_video_dirs must not be empty".into(),
            ));
        }

        if self.max_video_duration.is_nan() || self.max_video_duration <= 0.0 {
            return Err(Error::InvalidConfig(
                "max_video_duration must be positive".into(),
            ));
        }

        if self.max_sessions == 0 {
            return Err(Error::InvalidConfig("max_sessions must be positive".into()));
        }

        Ok(())
    }

    #[inline]
    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    #[inline]
    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    #[inline]
    pub fn session_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_sweep_interval_secs.max(1))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EffectKind {
    #[default]
    Circle,
    Beam,
    Gradient,
}

/// Visual treatment handed to the compositor untouched.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EffectConfig {
    #[serde(rename = "type")]
    pub kind: EffectKind,
    /// In pixels.
    pub radius: u32,
    /// Edge feathering, in pixels.
    pub feather: u32,
    pub intensity: f32,
    pub color: String,
}

impl Default for EffectConfig {
    fn default() -> Self {
        Self {
            kind: EffectKind::Circle,
            radius: 150,
            feather: 50,
            intensity: 0.7,
            color: "#FFFFFF".into(),
        }
    }
}

impl EffectConfig {
    pub fn validate(&self) -> Result<()> {
        if !(50..=500).contains(&self.radius) {
            return Err(Error::InvalidConfig(format!(
                "radius {} out of 50..=500",
                self.radius
            )));
        }

        if self.feather > 200 {
            return Err(Error::InvalidConfig(format!(
                "feather {} out of 0..=200",
                self.feather
            )));
        }

        if !(0.0..=1.0).contains(&self.intensity) {
            return Err(Error::InvalidConfig(format!(
                "intensity {} out of [0, 1]",
                self.intensity
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service() {
        let c = PipelineConfig::default();

        assert_eq!(c.tracker.track_thresh, 0.6);
        assert_eq!(c.tracker.track_buffer, 30);
        assert_eq!(c.tracker.match_thresh, 0.8);
        assert_eq!(c.max_concurrent_jobs, 2);
        assert_eq!(c.output_resolution, Resolution::new(1920, 1080));
        assert_eq!(c.job_retention(), Duration::from_secs(300));
        assert_eq!(c.session_idle_timeout(), Duration::from_secs(60));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let c = PipelineConfig::from_json(
            r#"{"max_concurrent_jobs": 4, "output_resolution": "1280x720", "tracker": {"track_buffer": 10}}"#,
        )
        .unwrap();

        assert_eq!(c.max_concurrent_jobs, 4);
        assert_eq!(c.output_resolution, Resolution::new(1280, 720));
        assert_eq!(c.tracker.track_buffer, 10);
        assert_eq!(c.tracker.track_thresh, 0.6);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            PipelineConfig::from_json(r#"{"max_concurrent_jobs": 0}"#),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            PipelineConfig::from_json(r#"{"tracker": {"track_thresh": 1.5}}"#),
            Err(Error::InvalidConfig(_))
        ));
        assert!(PipelineConfig::from_json(r#"{"output_resolution": "wide"}"#).is_err());
    }

    #[test]
    fn resolution_round_trips_through_string() {
        let r: Resolution = "640x480".parse().unwrap();

        assert_eq!(r.to_string(), "640x480");
        assert!("0x480".parse::<Resolution>().is_err());
        assert!("640".parse::<Resolution>().is_err());
    }

    #[test]
    fn env_overrides_defaults() {
        std::env::set_var("PITCHTRACK_MAX_CONCURRENT_JOBS", "5");
        std::env::set_var("PITCHTRACK_ALLOWED_VIDEO_DIRS", "/srv/a, /srv/b");
        let c = PipelineConfig::from_env();
        std::env::remove_var("PITCHTRACK_MAX_CONCURRENT_JOBS");
        std::env::remove_var("PITCHTRACK_ALLOWED_VIDEO_DIRS");

        let c = c.unwrap();
        assert_eq!(c.max_concurrent_jobs, 5);
        assert_eq!(
            c.allowed_video_dirs,
            vec![PathBuf::from("/srv/a"), PathBuf::from("/srv/b")]
        );
    }

    #[test]
    fn effect_ranges() {
        assert!(EffectConfig::default().validate().is_ok());
        assert!(EffectConfig {
            radius: 10,
            ..Default::default()
        }
        .validate()
        .is_err());

        let e: EffectConfig =
            serde_json::from_str(r#"{"type": "beam", "intensity": 0.2}"#).unwrap();
        assert_eq!(e.kind, EffectKind::Beam);
        assert_eq!(e.radius, 150);
    }
}
