//! Lightweight per-session tracking for callers that send one frame at a
//! time (no video job). Identities follow the nearest centre from the
//! previous frame; sessions live in a bounded cache swept on a schedule.

use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::detection::BoundingBox;
use crate::track::TrackOutput;

/// Largest centre displacement, in normalized units, that keeps an identity.
pub const MAX_MATCH_DISTANCE: f32 = 0.1;

/// Frame-to-frame nearest-centre tracker.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    tracks: Vec<(u64, BoundingBox)>,
    next_id: u64,
    last_timestamp: f64,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            last_timestamp: 0.0,
        }
    }

    #[inline]
    pub fn last_timestamp(&self) -> f64 {
        self.last_timestamp
    }

    /// Only the tracks seen on this frame survive to the next one.
    pub fn update(&mut self, detections: &[BoundingBox], timestamp: f64) -> Vec<TrackOutput> {
        let mut claimed = vec![false; self.tracks.len()];
        let mut current = Vec::with_capacity(detections.len());

        for det in detections {
            let best = self
                .tracks
                .iter()
                .enumerate()
                .filter(|(i, _)| !claimed[*i])
                .map(|(i, (_, prev))| (i, det.center_distance(prev)))
                .filter(|&(_, d)| d < MAX_MATCH_DISTANCE)
                .min_by(|a, b| a.1.total_cmp(&b.1));

            let id = match best {
                Some((i, _)) => {
                    claimed[i] = true;
                    self.tracks[i].0
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    id
                }
            };

            current.push((id, *det));
        }

        self.tracks = current;
        self.last_timestamp = timestamp;

        self.tracks
            .iter()
            .map(|&(track_id, bbox)| TrackOutput {
                track_id,
                bbox,
                timestamp,
            })
            .collect()
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::Tracking for SessionTracker {
    #[inline]
    fn update(&mut self, detections: &[BoundingBox], timestamp: f64) -> Vec<TrackOutput> {
        SessionTracker::update(self, detections, timestamp)
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionPlayer {
    pub id: String,
    #[serde(rename = "track_id")]
    pub track_id: u64,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    pub center_x: f32,
    pub center_y: f32,
    pub top_left_x: f32,
    pub top_left_y: f32,
    pub description: String,
}

impl From<&TrackOutput> for SessionPlayer {
    fn from(t: &TrackOutput) -> Self {
        Self {
            id: format!("track_{}", t.track_id),
            track_id: t.track_id,
            x: t.bbox.x,
            y: t.bbox.y,
            width: t.bbox.width,
            height: t.bbox.height,
            confidence: t.bbox.confidence,
            center_x: t.bbox.x,
            center_y: t.bbox.y,
            top_left_x: t.bbox.left(),
            top_left_y: t.bbox.top(),
            description: format!("Player {}", t.track_id),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionFrame {
    pub session_id: String,
    pub timestamp: f64,
    pub players: Vec<SessionPlayer>,
    /// Detector time for this frame, in milliseconds.
    pub processing_time: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    /// Time since a session's last update after which it is dropped.
    pub idle_timeout: Duration,
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            max_sessions: 256,
        }
    }
}

struct SessionEntry {
    tracker: SessionTracker,
    last_seen: Instant,
}

/// Bounded map of session id to tracker state. Idleness is measured per
/// session on the runtime clock, independent of the video timestamps.
#[derive(Clone)]
pub struct SessionCache {
    sessions: Arc<Mutex<HashMap<String, SessionEntry>>>,
    config: SessionConfig,
}

impl SessionCache {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn track(
        &self,
        session_id: &str,
        detections: &[BoundingBox],
        timestamp: f64,
    ) -> Vec<SessionPlayer> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();

        let full = sessions.len() >= self.config.max_sessions;
        if full && !sessions.contains_key(session_id) {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, e)| e.last_seen)
                .map(|(k, _)| k.clone());

            if let Some(k) = oldest {
                warn!(session_id = %k, "session cache full, evicting least recent session");
                sessions.remove(&k);
            }
        }

        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry {
                tracker: SessionTracker::new(),
                last_seen: now,
            });
        entry.last_seen = now;

        entry
            .tracker
            .update(detections, timestamp)
            .iter()
            .map(SessionPlayer::from)
            .collect()
    }

    /// Drops sessions that have not been updated within the idle timeout.
    /// Returns the number evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let idle = self.config.idle_timeout;
        let mut sessions = self.sessions.lock();
        let before = sessions.len();

        sessions.retain(|_, e| now.saturating_duration_since(e.last_seen) <= idle);

        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!(evicted, remaining = sessions.len(), "session sweep");
        }

        evicted
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    /// Runs `sweep` every `interval` until the handle is aborted.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let cache = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                cache.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32) -> BoundingBox {
        BoundingBox::new(x, y, 0.1, 0.2, 0.8)
    }

    #[test]
    fn nearest_centre_keeps_identity() {
        let mut t = SessionTracker::new();

        let first = t.update(&[det(0.2, 0.5), det(0.7, 0.5)], 0.0);
        assert_eq!(first.iter().map(|t| t.track_id).collect::<Vec<_>>(), vec![1, 2]);

        let second = t.update(&[det(0.72, 0.5), det(0.23, 0.5)], 0.1);
        assert_eq!(second.iter().map(|t| t.track_id).collect::<Vec<_>>(), vec![2, 1]);

        let third = t.update(&[det(0.5, 0.9)], 0.2);
        assert_eq!(third[0].track_id, 3);
        assert_eq!(t.last_timestamp(), 0.2);
    }

    #[test]
    fn one_previous_track_feeds_one_detection() {
        let mut t = SessionTracker::new();
        t.update(&[det(0.5, 0.5)], 0.0);

        let out = t.update(&[det(0.51, 0.5), det(0.52, 0.5)], 0.1);

        assert_eq!(out[0].track_id, 1);
        assert_eq!(out[1].track_id, 2);
    }

    #[test]
    fn player_view_matches_wire_format() {
        let cache = SessionCache::new(SessionConfig::default());
        let players = cache.track("a", &[det(0.5, 0.5)], 1.0);
        let p = &players[0];

        assert_eq!(p.id, "track_1");
        assert_eq!(p.description, "Player 1");
        assert_eq!((p.center_x, p.center_y), (0.5, 0.5));
        approx::assert_abs_diff_eq!(p.top_left_x, 0.45, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(p.top_left_y, 0.4, epsilon = 1e-6);

        let json = serde_json::to_value(p).unwrap();
        for key in ["topLeftX", "topLeftY", "centerX", "centerY", "track_id"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(json["description"], "Player 1");
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_idle_sessions() {
        let cache = SessionCache::new(SessionConfig::default());

        cache.track("old", &[det(0.5, 0.5)], 10.0);
        tokio::time::advance(Duration::from_secs(40)).await;
        cache.track("fresh", &[det(0.5, 0.5)], 50.0);
        assert_eq!(cache.sweep(), 0);

        tokio::time::advance(Duration::from_secs(21)).await;
        cache.track("fresh", &[det(0.5, 0.5)], 70.5);
        assert_eq!(cache.sweep(), 1);
        assert!(!cache.contains("old"));
        assert!(cache.contains("fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn idleness_ignores_other_sessions_timestamps() {
        let cache = SessionCache::new(SessionConfig::default());

        cache.track("long_video", &[det(0.5, 0.5)], 500.0);
        cache.track("fresh_video", &[det(0.5, 0.5)], 10.033);

        assert_eq!(cache.sweep(), 0);
        assert!(cache.contains("long_video"));
        assert!(cache.contains("fresh_video"));
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_evicts_least_recent() {
        let cache = SessionCache::new(SessionConfig {
            idle_timeout: Duration::from_secs(60),
            max_sessions: 2,
        });

        cache.track("a", &[], 100.0);
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.track("b", &[], 2.0);
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.track("c", &[], 3.0);

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("a"));
    }

    #[test]
    fn sessions_have_independent_ids() {
        let cache = SessionCache::new(SessionConfig::default());

        cache.track("a", &[det(0.2, 0.2), det(0.8, 0.8)], 0.0);
        let b = cache.track("b", &[det(0.5, 0.5)], 0.0);

        assert_eq!(b[0].track_id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_on_schedule() {
        let cache = SessionCache::new(SessionConfig::default());
        cache.track("old", &[], 0.0);
        tokio::time::advance(Duration::from_secs(55)).await;
        cache.track("new", &[], 0.0);

        let handle = cache.spawn_sweeper(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(!cache.contains("old"));
        assert!(cache.contains("new"));

        handle.abort();
    }
}
