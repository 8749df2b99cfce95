use serde_derive::{Deserialize, Serialize};

use crate::detection::BoundingBox;
use crate::kalman::MotionState;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    /// Created, not yet matched on enough consecutive frames to be reported.
    Tentative,
    Confirmed,
    /// Missed at least the latest frame; still eligible for matching.
    Lost,
    Removed,
}

#[derive(Debug, Clone)]
pub struct Track {
    pub track_id: u64,
    pub state: TrackState,
    pub motion: MotionState,
}

impl Track {
    pub fn new(track_id: u64, det: &BoundingBox, timestamp: f64) -> Self {
        Self {
            track_id,
            state: TrackState::Tentative,
            motion: MotionState::new(det, timestamp),
        }
    }

    #[inline]
    pub fn predict(&mut self, timestamp: f64) -> BoundingBox {
        self.motion.predict(timestamp)
    }

    pub fn update(&mut self, det: &BoundingBox, timestamp: f64, min_hits: u32) {
        self.motion.update(det, timestamp);
        self.state = if self.motion.hit_streak >= min_hits {
            TrackState::Confirmed
        } else {
            TrackState::Tentative
        };
    }

    pub fn mark_lost(&mut self) {
        self.motion.mark_missed();
        self.state = TrackState::Lost;
    }

    #[inline]
    pub fn mark_removed(&mut self) {
        self.state = TrackState::Removed;
    }

    #[inline]
    pub fn bbox(&self) -> BoundingBox {
        self.motion.get_state()
    }

    #[inline]
    pub fn is_confirmed(&self) -> bool {
        self.state == TrackState::Confirmed
    }

    #[inline]
    pub fn time_since_update(&self) -> u32 {
        self.motion.time_since_update
    }

    #[inline]
    pub fn hit_streak(&self) -> u32 {
        self.motion.hit_streak
    }

    pub fn output(&self, timestamp: f64) -> TrackOutput {
        TrackOutput {
            track_id: self.track_id,
            bbox: self.bbox(),
            timestamp,
        }
    }
}

/// Public per-frame view of a confirmed track.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TrackOutput {
    pub track_id: u64,
    #[serde(rename = "bounding_box")]
    pub bbox: BoundingBox,
    pub timestamp: f64,
}
