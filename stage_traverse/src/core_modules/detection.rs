// THEORY:
// The `detection` module turns raw network output for one tile into boxes in
// global image coordinates. It knows nothing about how the tile was produced or
// which engine ran it; it only needs the tensor layout and where the tile sits.
//
// Tensor layout: one tile yields `attributes x predictions` floats stored
// attribute-major. Attribute 0..4 are the box centre and size in model-input
// pixels, the rest are one score per class. Reading prediction `i` therefore
// strides across the buffer by `predictions`.

use serde::{Deserialize, Serialize};

use crate::core_modules::coordinate_mapper::Point2;
use crate::error::PostprocessError;

/// Box centre x, centre y, width, height.
pub const BOX_ATTRIBUTES: usize = 4;

/// Axis-aligned rectangle in image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoxRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoxRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            width: (x2 - x1).max(0.0),
            height: (y2 - y1).max(0.0),
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn center(&self) -> Point2 {
        Point2::new(
            (self.x + self.width / 2.0) as f64,
            (self.y + self.height / 2.0) as f64,
        )
    }

    pub fn translate(self, dx: f32, dy: f32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            ..self
        }
    }

    /// Intersection over union. Two empty boxes overlap by 0.
    pub fn iou(&self, other: &BoxRect) -> f32 {
        let iw = (self.right().min(other.right()) - self.x.max(other.x)).max(0.0);
        let ih = (self.bottom().min(other.bottom()) - self.y.max(other.y)).max(0.0);
        let intersection = iw * ih;
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// One detection in global image coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub rect: BoxRect,
    pub class_id: usize,
    pub confidence: f32,
    /// Row-major index of the tile the detection came from.
    pub tile_index: usize,
}

impl DetectionBox {
    pub fn centroid(&self) -> Point2 {
        self.rect.center()
    }
}

/// Raw network output for a single tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileTensor {
    /// `4 + number of classes`.
    pub attributes: usize,
    pub predictions: usize,
    pub data: Vec<f32>,
}

impl TileTensor {
    pub fn new(attributes: usize, predictions: usize, data: Vec<f32>) -> Self {
        Self {
            attributes,
            predictions,
            data,
        }
    }

    /// Splits a `[batch, attributes, predictions]` buffer into per-tile tensors.
    pub fn split_batch(
        batch: usize,
        attributes: usize,
        predictions: usize,
        data: &[f32],
    ) -> Result<Vec<TileTensor>, PostprocessError> {
        let per_tile = attributes * predictions;
        if data.len() != batch * per_tile {
            return Err(PostprocessError::MalformedTensor {
                tile: 0,
                expected: batch * per_tile,
                got: data.len(),
            });
        }
        Ok(data
            .chunks_exact(per_tile.max(1))
            .take(batch)
            .map(|chunk| TileTensor::new(attributes, predictions, chunk.to_vec()))
            .collect())
    }

    pub fn num_classes(&self) -> usize {
        self.attributes.saturating_sub(BOX_ATTRIBUTES)
    }

    /// Checks that the buffer matches the declared shape.
    pub fn validate(&self, tile: usize) -> Result<(), PostprocessError> {
        let expected = self.attributes * self.predictions;
        if self.attributes <= BOX_ATTRIBUTES || self.data.len() != expected {
            return Err(PostprocessError::MalformedTensor {
                tile,
                expected,
                got: self.data.len(),
            });
        }
        Ok(())
    }

    fn value(&self, attribute: usize, prediction: usize) -> f32 {
        self.data[attribute * self.predictions + prediction]
    }

    /// Highest class score for a prediction. Ties keep the lower class id and
    /// all-zero scores report class 0 with score 0.
    fn best_class(&self, prediction: usize) -> (usize, f32) {
        let mut best = (0, 0.0_f32);
        for class in 0..self.num_classes() {
            let score = self.value(BOX_ATTRIBUTES + class, prediction);
            if score > best.1 {
                best = (class, score);
            }
        }
        best
    }
}

/// Where a tile sits in the source image and how model pixels map onto it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileGeometry {
    pub tile_width: f32,
    pub tile_height: f32,
    pub tiles_per_row: usize,
    /// Tile pixels per model-input pixel.
    pub scale_x: f32,
    pub scale_y: f32,
}

impl TileGeometry {
    pub fn new(
        image_width: u32,
        image_height: u32,
        tile_factor: u32,
        input_width: u32,
        input_height: u32,
    ) -> Self {
        let tile_width = (image_width / tile_factor) as f32;
        let tile_height = (image_height / tile_factor) as f32;
        Self {
            tile_width,
            tile_height,
            tiles_per_row: tile_factor as usize,
            scale_x: tile_width / input_width as f32,
            scale_y: tile_height / input_height as f32,
        }
    }

    /// Pixel offset of a tile's top-left corner.
    pub fn offset(&self, tile_index: usize) -> (f32, f32) {
        let col = tile_index % self.tiles_per_row;
        let row = tile_index / self.tiles_per_row;
        (self.tile_width * col as f32, self.tile_height * row as f32)
    }
}

/// Decodes every prediction of one tile that scores above `confidence_threshold`.
/// A tensor whose buffer does not match its shape is rejected, not indexed.
pub fn decode_tile(
    tensor: &TileTensor,
    tile_index: usize,
    geometry: &TileGeometry,
    confidence_threshold: f32,
) -> Result<Vec<DetectionBox>, PostprocessError> {
    tensor.validate(tile_index)?;
    let (offset_x, offset_y) = geometry.offset(tile_index);
    let clamp_x = |v: f32| v.clamp(0.0, geometry.tile_width);
    let clamp_y = |v: f32| v.clamp(0.0, geometry.tile_height);

    Ok((0..tensor.predictions)
        .filter_map(|i| {
            let (class_id, confidence) = tensor.best_class(i);
            if confidence <= confidence_threshold {
                return None;
            }
            let cx = tensor.value(0, i);
            let cy = tensor.value(1, i);
            let w = tensor.value(2, i);
            let h = tensor.value(3, i);

            let local = BoxRect::from_corners(
                clamp_x((cx - w / 2.0) * geometry.scale_x),
                clamp_y((cy - h / 2.0) * geometry.scale_y),
                clamp_x((cx + w / 2.0) * geometry.scale_x),
                clamp_y((cy + h / 2.0) * geometry.scale_y),
            );
            Some(DetectionBox {
                rect: local.translate(offset_x, offset_y),
                class_id,
                confidence,
                tile_index,
            })
        })
        .collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Builds an attribute-major tensor from `(cx, cy, w, h, scores)` rows.
    pub(crate) fn tensor(rows: &[(f32, f32, f32, f32, &[f32])]) -> TileTensor {
        let classes = rows.first().map_or(2, |r| r.4.len());
        let attributes = BOX_ATTRIBUTES + classes;
        let predictions = rows.len();
        let mut data = vec![0.0; attributes * predictions];
        for (i, (cx, cy, w, h, scores)) in rows.iter().enumerate() {
            let values = [*cx, *cy, *w, *h].into_iter().chain(scores.iter().copied());
            for (a, v) in values.enumerate() {
                data[a * predictions + i] = v;
            }
        }
        TileTensor::new(attributes, predictions, data)
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BoxRect::new(0.0, 0.0, 10.0, 10.0);
        assert_relative_eq!(a.iou(&a), 1.0);
        assert_relative_eq!(a.iou(&BoxRect::new(20.0, 20.0, 5.0, 5.0)), 0.0);
        assert_relative_eq!(a.iou(&BoxRect::new(5.0, 0.0, 10.0, 10.0)), 50.0 / 150.0);
        assert_relative_eq!(BoxRect::default().iou(&BoxRect::default()), 0.0);
    }

    #[test]
    fn tile_offsets_are_row_major() {
        let g = TileGeometry::new(400, 200, 4, 100, 50);
        assert_eq!(g.offset(0), (0.0, 0.0));
        assert_eq!(g.offset(3), (300.0, 0.0));
        assert_eq!(g.offset(4), (0.0, 50.0));
        assert_eq!(g.offset(14), (200.0, 150.0));
    }

    #[test]
    fn decode_picks_best_class_and_translates() {
        // Model input equals tile size, so scale is 1.
        let g = TileGeometry::new(400, 400, 4, 100, 100);
        let t = tensor(&[(50.0, 50.0, 20.0, 10.0, &[0.2, 0.9])]);
        let boxes = decode_tile(&t, 5, &g, 0.05).unwrap();
        assert_eq!(boxes.len(), 1);
        let b = &boxes[0];
        assert_eq!(b.class_id, 1);
        assert_relative_eq!(b.confidence, 0.9);
        // Tile 5 is row 1, column 1.
        assert_eq!(b.rect, BoxRect::new(140.0, 145.0, 20.0, 10.0));
        assert_eq!(b.tile_index, 5);
    }

    #[test]
    fn decode_drops_low_scores_and_clamps_to_tile() {
        let g = TileGeometry::new(200, 200, 2, 100, 100);
        let t = tensor(&[
            (5.0, 95.0, 20.0, 20.0, &[0.5, 0.1]),
            (50.0, 50.0, 10.0, 10.0, &[0.05, 0.01]),
        ]);
        let boxes = decode_tile(&t, 0, &g, 0.05).unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].rect, BoxRect::from_corners(0.0, 85.0, 15.0, 100.0));
    }

    #[test]
    fn decode_scales_model_pixels_to_tile_pixels() {
        let g = TileGeometry::new(1280, 1280, 1, 640, 640);
        let t = tensor(&[(100.0, 100.0, 10.0, 10.0, &[0.8])]);
        let boxes = decode_tile(&t, 0, &g, 0.05).unwrap();
        assert_eq!(boxes[0].rect, BoxRect::new(190.0, 190.0, 20.0, 20.0));
    }

    #[test]
    fn decode_rejects_short_buffers() {
        let g = TileGeometry::new(100, 100, 1, 100, 100);
        let t = TileTensor::new(6, 4, vec![0.9; 10]);
        assert!(matches!(
            decode_tile(&t, 2, &g, 0.05),
            Err(PostprocessError::MalformedTensor { tile: 2, expected: 24, got: 10 })
        ));
    }

    #[test]
    fn split_batch_checks_length() {
        let data = vec![0.0; 2 * 6 * 3];
        let tiles = TileTensor::split_batch(2, 6, 3, &data).unwrap();
        assert_eq!(tiles.len(), 2);
        assert!(tiles.iter().all(|t| t.validate(0).is_ok()));
        assert!(TileTensor::split_batch(3, 6, 3, &data).is_err());
    }
}
