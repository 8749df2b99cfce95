//! Two-tier greedy IoU association of detections to tracks.
//!
//! Candidates are enumerated detection-major (detection index, then track
//! index) and stable-sorted by IoU descending, so equal IoU pairs resolve to
//! the lower detection index first and then the lower track index.

use std::cmp::Ordering;

use tracing::trace;

use crate::detection::BoundingBox;

#[derive(Debug)]
enum IndexedSliceKind {
    All,
    Indexes(Vec<usize>),
}

/// A view over a subset of a slice that remembers the original positions.
pub struct IndexedSlice<'a, T> {
    pub slice: &'a [T],
    kind: IndexedSliceKind,
}

impl<'a, T> IndexedSlice<'a, T> {
    pub fn new(slice: &'a [T]) -> Self {
        Self {
            slice,
            kind: IndexedSliceKind::All,
        }
    }

    pub fn new_with_indexes(slice: &'a [T], idx: Vec<usize>) -> Self {
        Self {
            slice,
            kind: IndexedSliceKind::Indexes(idx),
        }
    }

    /// Position in the underlying slice of the `idx`-th element of the view.
    #[inline]
    pub fn get_index(&self, idx: usize) -> usize {
        match &self.kind {
            IndexedSliceKind::All => idx,
            IndexedSliceKind::Indexes(idxs) => idxs[idx],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        match &self.kind {
            IndexedSliceKind::All => self.slice.len(),
            IndexedSliceKind::Indexes(idxs) => idxs.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a, T> std::ops::Index<usize> for IndexedSlice<'a, T> {
    type Output = T;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.slice[self.get_index(index)]
    }
}

/// Result of one greedy round; all indexes refer to the underlying slices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignment {
    /// (detection, track, iou)
    pub matches: Vec<(usize, usize, f32)>,
    pub unmatched_detections: Vec<usize>,
    pub unmatched_tracks: Vec<usize>,
}

pub fn iou_matrix(
    dets: &IndexedSlice<'_, BoundingBox>,
    tracks: &IndexedSlice<'_, BoundingBox>,
) -> Vec<Vec<f32>> {
    (0..dets.len())
        .map(|d| (0..tracks.len()).map(|t| dets[d].iou(&tracks[t])).collect())
        .collect()
}

/// Greedy IoU assignment: best pairs first, each side claimed at most once.
pub fn greedy_assignment(
    dets: IndexedSlice<'_, BoundingBox>,
    tracks: IndexedSlice<'_, BoundingBox>,
    threshold: f32,
) -> Assignment {
    let mut candidates = Vec::new();

    if !tracks.is_empty() {
        for (d, row) in iou_matrix(&dets, &tracks).into_iter().enumerate() {
            for (t, iou) in row.into_iter().enumerate() {
                if iou >= threshold {
                    candidates.push((d, t, iou));
                }
            }
        }
    }

    candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal));

    let mut det_used = vec![false; dets.len()];
    let mut trk_used = vec![false; tracks.len()];
    let mut matches = Vec::new();

    for (d, t, iou) in candidates {
        if det_used[d] || trk_used[t] {
            continue;
        }

        det_used[d] = true;
        trk_used[t] = true;
        matches.push((dets.get_index(d), tracks.get_index(t), iou));
    }

    Assignment {
        matches,
        unmatched_detections: (0..dets.len())
            .filter(|&d| !det_used[d])
            .map(|d| dets.get_index(d))
            .collect(),
        unmatched_tracks: (0..tracks.len())
            .filter(|&t| !trk_used[t])
            .map(|t| tracks.get_index(t))
            .collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub detection: usize,
    pub track: usize,
    pub iou: f32,
    pub tier: MatchTier,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Association {
    pub matches: Vec<Match>,
    /// Every detection left unmatched after both rounds.
    pub unmatched_detections: Vec<usize>,
    pub unmatched_tracks: Vec<usize>,
    /// Unmatched detections confident enough to found a new track.
    pub new_track_seeds: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssociationThresholds {
    pub track_thresh: f32,
    pub match_thresh: f32,
    pub low_match_thresh: f32,
}

/// High-confidence detections are matched first against every track;
/// low-confidence ones may only rescue tracks left over, never seed new ones.
pub fn associate(
    detections: &[BoundingBox],
    tracks: &[BoundingBox],
    thresholds: AssociationThresholds,
) -> Association {
    let (high, low): (Vec<usize>, Vec<usize>) = (0..detections.len())
        .partition(|&i| detections[i].confidence >= thresholds.track_thresh);

    let first = greedy_assignment(
        IndexedSlice::new_with_indexes(detections, high),
        IndexedSlice::new(tracks),
        thresholds.match_thresh,
    );

    let second = greedy_assignment(
        IndexedSlice::new_with_indexes(detections, low),
        IndexedSlice::new_with_indexes(tracks, first.unmatched_tracks),
        thresholds.low_match_thresh,
    );

    trace!(
        high = first.matches.len(),
        low = second.matches.len(),
        "association rounds"
    );

    let matches = first
        .matches
        .iter()
        .map(|&(detection, track, iou)| Match {
            detection,
            track,
            iou,
            tier: MatchTier::High,
        })
        .chain(second.matches.iter().map(|&(detection, track, iou)| Match {
            detection,
            track,
            iou,
            tier: MatchTier::Low,
        }))
        .collect();

    let mut unmatched_detections: Vec<usize> = first
        .unmatched_detections
        .iter()
        .chain(second.unmatched_detections.iter())
        .copied()
        .collect();
    unmatched_detections.sort_unstable();

    Association {
        matches,
        unmatched_detections,
        unmatched_tracks: second.unmatched_tracks,
        new_track_seeds: first.unmatched_detections,
    }
}
