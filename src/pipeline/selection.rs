use serde_derive::{Deserialize, Serialize};

use crate::detection::BoundingBox;
use crate::track::TrackOutput;

/// How the spotlighted player is chosen. Checked in order: explicit id,
/// nearest track to a selection box, then the most prominent track.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PlayerSelection {
    pub player_id: Option<u64>,
    pub selection_box: Option<BoundingBox>,
    pub auto_select: bool,
}

impl Default for PlayerSelection {
    fn default() -> Self {
        Self {
            player_id: None,
            selection_box: None,
            auto_select: true,
        }
    }
}

impl PlayerSelection {
    pub fn select(&self, tracks: &[TrackOutput]) -> Option<u64> {
        if tracks.is_empty() {
            return None;
        }

        if let Some(id) = self.player_id {
            return Some(id);
        }

        if let Some(target) = &self.selection_box {
            return closest(tracks, target);
        }

        if self.auto_select {
            return most_prominent(tracks);
        }

        None
    }
}

fn closest(tracks: &[TrackOutput], target: &BoundingBox) -> Option<u64> {
    tracks
        .iter()
        .min_by(|a, b| {
            a.bbox
                .center_distance(target)
                .total_cmp(&b.bbox.center_distance(target))
        })
        .map(|t| t.track_id)
}

/// Largest area weighted by confidence.
fn most_prominent(tracks: &[TrackOutput]) -> Option<u64> {
    let score = |t: &TrackOutput| t.bbox.area() * t.bbox.confidence;

    tracks
        .iter()
        .max_by(|a, b| score(a).total_cmp(&score(b)))
        .map(|t| t.track_id)
}
