// THEORY:
// The `pipeline` module is the front door of the detection half of the rig. It
// takes a full frame, cuts it into tiles, hands the packed batch to whatever
// inference engine the host plugs in, and reassembles the per-tile output into a
// single, deduplicated, visit-ordered list of detections in frame coordinates.
//
// The engine itself stays outside this crate behind the `InferenceEngine` trait.
// Everything on either side of it is deterministic and testable with recorded
// tensors, which is also how offline planning replays a capture.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::core_modules::detection::{DetectionBox, TileGeometry, TileTensor, decode_tile};
use crate::core_modules::nms::non_max_suppression;
use crate::core_modules::path_planner::order_detections;
use crate::core_modules::tiling::{TileBatch, prepare_batch, split_into_tiles};
use crate::error::PostprocessError;

/// Tunables for tiled detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Frames are cut into `tile_factor x tile_factor` tiles.
    pub tile_factor: u32,
    pub input_width: u32,
    pub input_height: u32,
    pub confidence_threshold: f32,
    /// IoU above which the weaker of two boxes is suppressed.
    pub overlap_threshold: f32,
    pub class_names: Vec<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            tile_factor: 4,
            input_width: 640,
            input_height: 640,
            confidence_threshold: 0.05,
            overlap_threshold: 0.05,
            class_names: vec!["ce".to_string(), "clump".to_string()],
        }
    }
}

/// Runs the detector on a packed batch of tiles, one tensor per tile, in order.
pub trait InferenceEngine {
    fn infer(&mut self, batch: &TileBatch) -> Result<Vec<TileTensor>, PostprocessError>;
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

pub struct TiledDetectionPipeline {
    config: DetectionConfig,
}

impl TiledDetectionPipeline {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn class_name(&self, class_id: usize) -> &str {
        self.config
            .class_names
            .get(class_id)
            .map_or("unknown", String::as_str)
    }

    /// Full path: tile, preprocess, infer, postprocess.
    pub fn detect<E: InferenceEngine + ?Sized>(
        &self,
        image: &RgbImage,
        engine: &mut E,
    ) -> Result<Vec<DetectionBox>, PostprocessError> {
        let start = Instant::now();
        let tiles = split_into_tiles(image, self.config.tile_factor)?;
        tracing::debug!(elapsed_ms = elapsed_ms(start), "split");

        let start = Instant::now();
        let batch = prepare_batch(&tiles.tiles, self.config.input_width, self.config.input_height);
        tracing::debug!(elapsed_ms = elapsed_ms(start), shape = ?batch.shape(), "preprocess");

        let start = Instant::now();
        let tensors = engine.infer(&batch)?;
        tracing::debug!(elapsed_ms = elapsed_ms(start), "inference");

        self.postprocess(&tensors, tiles.width, tiles.height)
    }

    /// Reassembles per-tile tensors for an image of the given (cropped) size into
    /// an ordered visitation path.
    pub fn postprocess(
        &self,
        tensors: &[TileTensor],
        image_width: u32,
        image_height: u32,
    ) -> Result<Vec<DetectionBox>, PostprocessError> {
        let start = Instant::now();
        let factor = self.config.tile_factor;
        let expected = factor as usize * factor as usize;
        if tensors.len() != expected {
            return Err(PostprocessError::TileCountMismatch {
                expected,
                got: tensors.len(),
            });
        }
        if factor == 0 || image_width < factor || image_height < factor {
            return Err(PostprocessError::ImageTooSmall {
                width: image_width,
                height: image_height,
                factor,
            });
        }

        // --- 1. Decode every tile into frame coordinates ---
        let geometry = TileGeometry::new(
            image_width,
            image_height,
            factor,
            self.config.input_width,
            self.config.input_height,
        );
        let mut candidates = Vec::new();
        for (tile_index, tensor) in tensors.iter().enumerate() {
            candidates.extend(decode_tile(
                tensor,
                tile_index,
                &geometry,
                self.config.confidence_threshold,
            )?);
        }

        // --- 2. One suppression pass across all tiles ---
        let survivors = self.suppress(&candidates);
        if survivors.is_empty() {
            tracing::info!("no valid detections found after suppression");
            return Ok(survivors);
        }
        tracing::info!(
            candidates = candidates.len(),
            detections = survivors.len(),
            "valid detections found"
        );

        // --- 3. Order into a path ---
        let path = order_detections(survivors);
        for d in &path {
            tracing::debug!(
                class = self.class_name(d.class_id),
                confidence = d.confidence,
                tile = d.tile_index,
                "detection"
            );
        }
        tracing::debug!(elapsed_ms = elapsed_ms(start), "postprocess");
        Ok(path)
    }

    /// Untiled variant: one tensor covering the whole image, no path ordering.
    pub fn postprocess_single(
        &self,
        tensor: &TileTensor,
        image_width: u32,
        image_height: u32,
    ) -> Result<Vec<DetectionBox>, PostprocessError> {
        let geometry = TileGeometry::new(
            image_width,
            image_height,
            1,
            self.config.input_width,
            self.config.input_height,
        );
        let candidates = decode_tile(tensor, 0, &geometry, self.config.confidence_threshold)?;
        let survivors = self.suppress(&candidates);
        tracing::info!(detections = survivors.len(), "valid detections found");
        Ok(survivors)
    }

    fn suppress(&self, candidates: &[DetectionBox]) -> Vec<DetectionBox> {
        non_max_suppression(
            candidates,
            self.config.confidence_threshold,
            self.config.overlap_threshold,
        )
        .into_iter()
        .map(|i| candidates[i].clone())
        .collect()
    }
}
