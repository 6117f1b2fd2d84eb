// Class-agnostic non-max suppression over boxes pooled from every tile.

use crate::core_modules::detection::DetectionBox;

/// Returns the indices of surviving boxes, highest confidence first.
///
/// Boxes at or below `score_threshold` are discarded. Remaining boxes are taken
/// in descending confidence (stable for ties) and a box survives only if its
/// IoU with every earlier survivor is at most `iou_threshold`.
pub fn non_max_suppression(
    boxes: &[DetectionBox],
    score_threshold: f32,
    iou_threshold: f32,
) -> Vec<usize> {
    let mut candidates: Vec<usize> = (0..boxes.len())
        .filter(|&i| boxes[i].confidence > score_threshold)
        .collect();
    candidates.sort_by(|&a, &b| boxes[b].confidence.total_cmp(&boxes[a].confidence));

    let mut kept: Vec<usize> = Vec::with_capacity(candidates.len());
    for i in candidates {
        let overlaps = kept
            .iter()
            .any(|&k| boxes[k].rect.iou(&boxes[i].rect) > iou_threshold);
        if !overlaps {
            kept.push(i);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::detection::BoxRect;

    fn det(x: f32, y: f32, size: f32, confidence: f32, class_id: usize) -> DetectionBox {
        DetectionBox {
            rect: BoxRect::new(x, y, size, size),
            class_id,
            confidence,
            tile_index: 0,
        }
    }

    #[test]
    fn overlapping_boxes_keep_the_stronger_one() {
        let boxes = vec![det(0.0, 0.0, 10.0, 0.6, 0), det(1.0, 1.0, 10.0, 0.9, 1)];
        assert_eq!(non_max_suppression(&boxes, 0.05, 0.05), vec![1]);
    }

    #[test]
    fn suppression_ignores_class() {
        let boxes = vec![det(0.0, 0.0, 10.0, 0.9, 0), det(0.0, 0.0, 10.0, 0.8, 1)];
        assert_eq!(non_max_suppression(&boxes, 0.05, 0.5), vec![0]);
    }

    #[test]
    fn weak_boxes_never_survive() {
        let boxes = vec![det(0.0, 0.0, 10.0, 0.05, 0), det(50.0, 50.0, 10.0, 0.04, 0)];
        assert!(non_max_suppression(&boxes, 0.05, 0.5).is_empty());
    }

    #[test]
    fn disjoint_boxes_come_back_by_confidence() {
        let boxes = vec![
            det(0.0, 0.0, 10.0, 0.3, 0),
            det(100.0, 0.0, 10.0, 0.9, 0),
            det(200.0, 0.0, 10.0, 0.6, 0),
        ];
        assert_eq!(non_max_suppression(&boxes, 0.05, 0.05), vec![1, 2, 0]);
    }

    #[test]
    fn iou_threshold_bounds_survival() {
        // IoU is 1/3.
        let boxes = vec![det(0.0, 0.0, 10.0, 0.9, 0), det(5.0, 0.0, 10.0, 0.8, 0)];
        assert_eq!(non_max_suppression(&boxes, 0.05, 0.5).len(), 2);
        assert_eq!(non_max_suppression(&boxes, 0.05, 0.3).len(), 1);
    }
}
