use serde_derive::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::association::{associate, Association};
use crate::config::TrackerConfig;
use crate::detection::BoundingBox;
use crate::track::{Track, TrackOutput, TrackState};

/// Hands out track identities for one tracking session. Never shared
/// between trackers, so independent sessions cannot collide.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    #[inline]
    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn reset(&mut self) {
        self.next = 1;
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackerStats {
    pub total_tracks: u64,
    pub active_tracks: usize,
    pub lost_tracks: usize,
    pub removed_tracks: u64,
    pub frame_id: u64,
}

/// Association of one frame against the predicted track pool.
pub struct DetectionsMapping<'a> {
    timestamp: f64,
    detections: &'a [BoundingBox],
    association: Association,
}

/// Track lifecycle manager: owns tentative, confirmed and lost tracks.
pub struct ByteTracker {
    config: TrackerConfig,
    ids: IdAllocator,
    /// Tentative and confirmed tracks, matched on their latest frame.
    tracked: Vec<Track>,
    lost: Vec<Track>,
    frame_id: u64,
    total_tracks: u64,
    removed_tracks: u64,
    active_tracks: usize,
}

impl ByteTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            ids: IdAllocator::new(),
            tracked: Vec::with_capacity(64),
            lost: Vec::with_capacity(32),
            frame_id: 0,
            total_tracks: 0,
            removed_tracks: 0,
            active_tracks: 0,
        }
    }

    #[inline]
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Tracked tracks first, then lost ones; indexes of a mapping refer to this order.
    fn pool(&self) -> impl Iterator<Item = &Track> {
        self.tracked.iter().chain(self.lost.iter())
    }

    fn predict(&mut self, timestamp: f64) {
        for t in self.tracked.iter_mut().chain(self.lost.iter_mut()) {
            t.predict(timestamp);
        }
    }

    pub fn map_detections<'a>(
        &self,
        timestamp: f64,
        detections: &'a [BoundingBox],
    ) -> DetectionsMapping<'a> {
        let boxes: Vec<BoundingBox> = self.pool().map(Track::bbox).collect();

        DetectionsMapping {
            timestamp,
            detections,
            association: associate(detections, &boxes, self.config.thresholds()),
        }
    }

    fn apply(&mut self, mapping: DetectionsMapping<'_>) {
        let time = mapping.timestamp;
        let dets = mapping.detections;
        let min_hits = self.config.min_hits;

        let mut pool: Vec<Track> = self
            .tracked
            .drain(..)
            .chain(self.lost.drain(..))
            .collect();

        for m in &mapping.association.matches {
            pool[m.track].update(&dets[m.detection], time, min_hits);
        }

        for &i in &mapping.association.unmatched_tracks {
            pool[i].mark_lost();
        }

        for &i in &mapping.association.new_track_seeds {
            let id = self.ids.next_id();
            trace!(track_id = id, "new track");
            pool.push(Track::new(id, &dets[i], time));
            self.total_tracks += 1;
        }

        let buffer = self.config.track_buffer;
        for mut t in pool {
            if t.time_since_update() > buffer {
                t.mark_removed();
                trace!(track_id = t.track_id, "track removed");
                self.removed_tracks += 1;
            } else if t.state == TrackState::Lost {
                self.lost.push(t);
            } else {
                self.tracked.push(t);
            }
        }
    }

    /// Runs one frame: predict, associate, update, create, evict. Returns the
    /// confirmed tracks for this frame.
    pub fn update(&mut self, detections: &[BoundingBox], timestamp: f64) -> Vec<TrackOutput> {
        self.frame_id += 1;

        self.predict(timestamp);
        let mapping = self.map_detections(timestamp, detections);
        self.apply(mapping);

        let output = self.tracks(timestamp);
        self.active_tracks = output.len();

        debug!(
            frame = self.frame_id,
            tracks = output.len(),
            detections = detections.len(),
            "tracker frame"
        );

        output
    }

    pub fn tracks(&self, timestamp: f64) -> Vec<TrackOutput> {
        self.tracked
            .iter()
            .filter(|t| t.is_confirmed())
            .map(|t| t.output(timestamp))
            .collect()
    }

    pub fn track(&self, track_id: u64) -> Option<&Track> {
        self.pool().find(|t| t.track_id == track_id)
    }

    #[inline]
    pub fn tracked(&self) -> &[Track] {
        &self.tracked
    }

    #[inline]
    pub fn lost(&self) -> &[Track] {
        &self.lost
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            total_tracks: self.total_tracks,
            active_tracks: self.active_tracks,
            lost_tracks: self.lost.len(),
            removed_tracks: self.removed_tracks,
            frame_id: self.frame_id,
        }
    }

    pub fn reset(&mut self) {
        self.tracked.clear();
        self.lost.clear();
        self.ids.reset();
        self.frame_id = 0;
        self.total_tracks = 0;
        self.removed_tracks = 0;
        self.active_tracks = 0;
    }
}

impl Default for ByteTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl crate::Tracking for ByteTracker {
    #[inline]
    fn update(&mut self, detections: &[BoundingBox], timestamp: f64) -> Vec<TrackOutput> {
        ByteTracker::update(self, detections, timestamp)
    }

    #[inline]
    fn reset(&mut self) {
        ByteTracker::reset(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const FPS: f64 = 30.0;

    fn ts(frame: u32) -> f64 {
        frame as f64 / FPS
    }

    fn players() -> Vec<BoundingBox> {
        vec![
            BoundingBox::new(0.30, 0.40, 0.10, 0.30, 0.9),
            BoundingBox::new(0.60, 0.30, 0.08, 0.25, 0.75),
        ]
    }

    #[test]
    fn two_players_confirm_after_three_reinforcing_frames() {
        let mut tracker = ByteTracker::default();

        assert!(tracker.update(&players(), ts(0)).is_empty());
        assert_eq!(tracker.tracked().len(), 2);

        assert!(tracker.update(&players(), ts(1)).is_empty());
        assert!(tracker.update(&players(), ts(2)).is_empty());

        let out = tracker.update(&players(), ts(3));
        assert_eq!(out.len(), 2);

        let ids: HashSet<_> = out.iter().map(|t| t.track_id).collect();
        assert_eq!(ids, HashSet::from([1, 2]));
        assert_eq!(tracker.stats().total_tracks, 2);
    }

    #[test]
    fn low_confidence_detection_never_creates_track() {
        let mut tracker = ByteTracker::default();
        let weak = [BoundingBox::new(0.5, 0.5, 0.1, 0.2, 0.4)];

        for f in 0..10 {
            assert!(tracker.update(&weak, ts(f)).is_empty());
        }
        assert!(tracker.tracked().is_empty());
        assert_eq!(tracker.stats().total_tracks, 0);
    }

    #[test]
    fn low_confidence_detection_keeps_track_alive() {
        let mut tracker = ByteTracker::default();
        let strong = players();
        for f in 0..4 {
            tracker.update(&strong, ts(f));
        }

        // the first player fades to a weak detection
        let weak = [
            BoundingBox {
                confidence: 0.3,
                ..strong[0]
            },
            strong[1],
        ];
        let out = tracker.update(&weak, ts(4));

        assert_eq!(out.len(), 2);
        assert!(tracker.lost().is_empty());
    }

    #[test]
    fn evicted_exactly_after_buffer_plus_one_misses() {
        let config = TrackerConfig::default();
        let mut tracker = ByteTracker::new(config.clone());
        let det = [players()[0]];

        for f in 0..4 {
            tracker.update(&det, ts(f));
        }
        assert_eq!(tracker.tracked().len(), 1);

        let mut frame = 4;
        for _ in 0..config.track_buffer {
            tracker.update(&[], ts(frame));
            frame += 1;
            assert_eq!(tracker.lost().len(), 1, "evicted too early");
            assert!(tracker.tracked().is_empty());
        }

        tracker.update(&[], ts(frame));
        assert!(tracker.lost().is_empty());
        assert!(tracker.track(1).is_none());
        assert_eq!(tracker.stats().removed_tracks, 1);
    }

    #[test]
    fn miss_resets_streak_and_requires_new_run() {
        let mut tracker = ByteTracker::default();
        let det = [players()[0]];

        for f in 0..4 {
            tracker.update(&det, ts(f));
        }
        assert_eq!(tracker.tracks(ts(3)).len(), 1);

        assert!(tracker.update(&[], ts(4)).is_empty());
        assert_eq!(tracker.track(1).map(|t| t.hit_streak()), Some(0));
        assert_eq!(tracker.track(1).map(|t| t.state), Some(TrackState::Lost));

        // same identity resumes, but has to earn confirmation again
        for f in 5..7 {
            assert!(tracker.update(&det, ts(f)).is_empty());
        }
        let out = tracker.update(&det, ts(7));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].track_id, 1);
    }

    #[test]
    fn reappearing_object_gets_new_identity() {
        let mut tracker = ByteTracker::default();
        let det = [players()[0]];

        for f in 0..4 {
            tracker.update(&det, ts(f));
        }
        for f in 4..40 {
            tracker.update(&[], ts(f));
        }
        assert!(tracker.track(1).is_none());

        tracker.update(&det, ts(40));
        assert!(tracker.track(2).is_some());
    }

    #[test]
    fn identity_follows_moving_object() {
        let mut tracker = ByteTracker::default();

        let last = (0..60)
            .map(|f| {
                let x = 0.2 + 0.002 * f as f32;
                let dets = [
                    BoundingBox::new(x, 0.5, 0.1, 0.3, 0.9),
                    BoundingBox::new(0.8 - x / 2.0, 0.3, 0.08, 0.25, 0.8),
                ];
                tracker.update(&dets, ts(f))
            })
            .last()
            .unwrap();

        let ids: HashSet<_> = last.iter().map(|t| t.track_id).collect();
        assert_eq!(ids, HashSet::from([1, 2]));
        assert_eq!(tracker.stats().total_tracks, 2);
    }

    #[test]
    fn tracked_and_lost_are_disjoint() {
        let mut tracker = ByteTracker::default();
        let all = players();

        for f in 0..20 {
            let dets = if f % 3 == 0 { &all[..1] } else { &all[..] };
            tracker.update(dets, ts(f));

            let tracked: HashSet<_> = tracker.tracked().iter().map(|t| t.track_id).collect();
            let lost: HashSet<_> = tracker.lost().iter().map(|t| t.track_id).collect();
            assert!(tracked.is_disjoint(&lost));
        }
    }

    #[test]
    fn sessions_allocate_ids_independently() {
        let mut a = ByteTracker::default();
        let mut b = ByteTracker::default();

        a.update(&players(), ts(0));
        b.update(&players()[..1], ts(0));

        assert!(a.track(1).is_some() && a.track(2).is_some());
        assert!(b.track(1).is_some());
        assert!(b.track(2).is_none());
    }

    #[test]
    fn reset_restarts_identities() {
        let mut tracker = ByteTracker::default();
        tracker.update(&players(), ts(0));
        tracker.reset();

        assert_eq!(tracker.stats(), TrackerStats::default());
        tracker.update(&players()[..1], ts(0));
        assert!(tracker.track(1).is_some());
    }
}
