// Greedy nearest-neighbour ordering of detections into a visitation path.

use crate::core_modules::coordinate_mapper::Point2;
use crate::core_modules::detection::DetectionBox;

/// Visit order over `points`, starting at index 0.
///
/// Each step picks the unvisited point closest (squared distance) to the last
/// visited one. Ties go to the lowest index, so the result is deterministic.
pub fn nearest_neighbor_order(points: &[Point2]) -> Vec<usize> {
    let n = points.len();
    if n == 0 {
        return Vec::new();
    }

    let mut visited = vec![false; n];
    let mut order = Vec::with_capacity(n);
    let mut current = 0;
    visited[0] = true;
    order.push(0);

    for _ in 1..n {
        let from = points[current];
        let mut nearest = None;
        let mut best = f64::INFINITY;
        for (i, p) in points.iter().enumerate() {
            if visited[i] {
                continue;
            }
            let d = from.distance_squared(p);
            if d < best || nearest.is_none() {
                best = d;
                nearest = Some(i);
            }
        }
        let Some(next) = nearest else { break };
        visited[next] = true;
        order.push(next);
        current = next;
    }
    order
}

/// Reorders detections by centroid into a nearest-neighbour path.
pub fn order_detections(boxes: Vec<DetectionBox>) -> Vec<DetectionBox> {
    let centroids: Vec<Point2> = boxes.iter().map(DetectionBox::centroid).collect();
    let order = nearest_neighbor_order(&centroids);
    let mut slots: Vec<Option<DetectionBox>> = boxes.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}
