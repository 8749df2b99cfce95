use serde_derive::{Deserialize, Serialize};

use crate::bbox::{BBox, Xywh};

/// Smallest width/height a box may shrink to after clamping.
pub const MIN_BOX_SIZE: f32 = 0.01;

/// Normalized box: (x,y) of the center and (width,height), all relative to the frame size
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    #[inline]
    pub fn new(x: f32, y: f32, width: f32, height: f32, confidence: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence,
        }
    }

    #[inline(always)]
    pub fn bbox(&self) -> BBox<Xywh> {
        BBox::xywh(self.x, self.y, self.width, self.height)
    }

    #[inline]
    pub fn from_bbox(bbox: &BBox<Xywh>, confidence: f32) -> Self {
        Self::new(bbox.cx(), bbox.cy(), bbox.width(), bbox.height(), confidence)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        self.bbox().as_ltrb().iou(&other.bbox().as_ltrb())
    }

    #[inline]
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    #[inline]
    pub fn center_distance(&self, other: &BoundingBox) -> f32 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    /// Box with the center in the unit square and the size in `[MIN_BOX_SIZE, 1]`.
    #[inline]
    pub fn clamped(&self) -> Self {
        Self::from_bbox(&self.bbox().clamped(MIN_BOX_SIZE), self.confidence)
    }

    #[inline(always)]
    pub fn left(&self) -> f32 {
        self.x - self.width / 2.
    }

    #[inline(always)]
    pub fn top(&self) -> f32 {
        self.y - self.height / 2.
    }
}

/// Output of one detector call.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DetectionResult {
    pub frame_index: u64,
    pub timestamp: f64,
    pub detections: Vec<BoundingBox>,
    pub processing_time_ms: f64,
}

impl DetectionResult {
    /// "Nothing seen": what a failed detector call degrades to.
    pub fn empty(frame_index: u64, timestamp: f64) -> Self {
        Self {
            frame_index,
            timestamp,
            detections: Vec::new(),
            processing_time_ms: 0.0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn boxes() -> Vec<BoundingBox> {
        vec![
            BoundingBox::new(0.30, 0.40, 0.10, 0.30, 0.9),
            BoundingBox::new(0.60, 0.30, 0.08, 0.25, 0.75),
            BoundingBox::new(0.32, 0.42, 0.12, 0.28, 0.5),
            BoundingBox::new(0.5, 0.5, 1.0, 1.0, 1.0),
            BoundingBox::new(0.05, 0.95, 0.02, 0.02, 0.1),
        ]
    }

    #[test]
    fn iou_identity() {
        for b in boxes() {
            assert_abs_diff_eq!(b.iou(&b), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn iou_symmetric_and_bounded() {
        let all = boxes();
        for a in &all {
            for b in &all {
                let ab = a.iou(b);
                assert_abs_diff_eq!(ab, b.iou(a), epsilon = 1e-6);
                assert!((0.0..=1.0).contains(&ab));
            }
        }
    }

    #[test]
    fn iou_disjoint_is_zero() {
        let a = BoundingBox::new(0.30, 0.40, 0.10, 0.30, 0.9);
        let b = BoundingBox::new(0.60, 0.30, 0.08, 0.25, 0.75);

        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn confidence_does_not_affect_iou() {
        let a = BoundingBox::new(0.3, 0.3, 0.2, 0.2, 0.9);
        let b = BoundingBox { confidence: 0.1, ..a };

        assert_abs_diff_eq!(a.iou(&b), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn empty_result_means_nothing_seen() {
        let r = DetectionResult::empty(7, 0.25);

        assert!(r.is_empty());
        assert_eq!(r.processing_time_ms, 0.0);
        assert_eq!(r.frame_index, 7);
    }

    #[test]
    fn deserializes_detector_json() {
        let b: BoundingBox =
            serde_json::from_str(r#"{"x":0.3,"y":0.4,"width":0.1,"height":0.3,"confidence":0.9}"#)
                .unwrap();

        assert_eq!(b, BoundingBox::new(0.3, 0.4, 0.1, 0.3, 0.9));
    }
}
