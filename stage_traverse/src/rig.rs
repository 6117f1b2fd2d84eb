// THEORY:
// `RigSession` is the explicit context object for one physical rig. It owns the
// stage worker, the current calibration, the detection pipeline and the last
// planned path, and it is the only place these pieces meet. Callers (a UI, the
// command-line runner) hold a session instead of reaching into process globals.
//
// The session is also where the "refuse to start" rules live: a traversal needs a
// valid calibration and a non-empty path, and neither condition is allowed to
// reach the stage.

use image::RgbImage;

use crate::config::RigConfig;
use crate::core_modules::coordinate_mapper::{AffineTransform, Point2, compute_transform};
use crate::core_modules::detection::{DetectionBox, TileTensor};
use crate::core_modules::jog::{Jog, JogSpeed};
use crate::core_modules::stage_controller::{MoveOutcome, StageController, StageHandle};
use crate::core_modules::stage_protocol::Position;
use crate::core_modules::transport::Transport;
use crate::core_modules::traversal::{TraversalController, TraversalEvent, TraversalHandle};
use crate::error::{CalibrationError, RigError, TraversalError};
use crate::pipeline::{InferenceEngine, TiledDetectionPipeline};
use tokio::sync::broadcast;

pub struct RigSession {
    config: RigConfig,
    stage: StageController,
    traversal: TraversalController,
    pipeline: TiledDetectionPipeline,
    transform: Option<AffineTransform>,
    path: Vec<DetectionBox>,
}

impl RigSession {
    /// Validates `config`, starts the stage worker on `transport` and solves the
    /// configured calibration. A bad calibration does not fail construction; it
    /// leaves the session uncalibrated.
    pub fn new<T: Transport>(config: RigConfig, transport: T) -> Result<Self, RigError> {
        config.validate()?;
        let stage = StageController::spawn(transport, config.stage.clone())?;
        let traversal = TraversalController::new(stage.handle(), config.traversal.clone());
        let pipeline = TiledDetectionPipeline::new(config.detection.clone());

        let transform = match config.calibration.transform() {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::warn!("session starts uncalibrated: {e}");
                None
            }
        };

        Ok(Self {
            config,
            stage,
            traversal,
            pipeline,
            transform,
            path: Vec::new(),
        })
    }

    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &TiledDetectionPipeline {
        &self.pipeline
    }

    pub fn stage(&self) -> StageHandle {
        self.stage.handle()
    }

    pub fn current_position(&self) -> Position {
        self.stage.current_position()
    }

    pub fn transform(&self) -> Option<&AffineTransform> {
        self.transform.as_ref()
    }

    /// Replaces the calibration. On failure the session becomes uncalibrated.
    pub fn calibrate(
        &mut self,
        image: &[Point2],
        world: &[Point2],
    ) -> Result<AffineTransform, CalibrationError> {
        let result = compute_transform(image, world);
        self.transform = result.as_ref().ok().copied();
        result
    }

    /// The last planned path, in visit order.
    pub fn path(&self) -> &[DetectionBox] {
        &self.path
    }

    /// Plans from recorded per-tile tensors of an image of the given size.
    pub fn plan_from_tensors(
        &mut self,
        tensors: &[TileTensor],
        image_width: u32,
        image_height: u32,
    ) -> Result<&[DetectionBox], RigError> {
        self.path = self.pipeline.postprocess(tensors, image_width, image_height)?;
        Ok(&self.path)
    }

    /// Plans by running `engine` on a live frame.
    pub fn plan_from_image<E: InferenceEngine + ?Sized>(
        &mut self,
        image: &RgbImage,
        engine: &mut E,
    ) -> Result<&[DetectionBox], RigError> {
        self.path = self.pipeline.detect(image, engine)?;
        Ok(&self.path)
    }

    /// Real-world waypoints for the current path.
    pub fn waypoints(&self) -> Result<Vec<Point2>, CalibrationError> {
        let transform = self.transform.as_ref().ok_or(CalibrationError::Missing)?;
        Ok(transform.map_path(&self.path))
    }

    pub fn subscribe_traversal(&self) -> broadcast::Receiver<TraversalEvent> {
        self.traversal.subscribe()
    }

    /// Starts walking the current path. Must be called within a Tokio runtime.
    pub fn start_traversal(&self) -> Result<TraversalHandle, RigError> {
        let Some(transform) = self.transform.as_ref() else {
            tracing::warn!("traversal refused: no calibration");
            return Err(TraversalError::Calibration(CalibrationError::Missing).into());
        };
        Ok(self.traversal.start(&self.path, transform)?)
    }

    pub fn jog(&self, jog: Jog, step: f64, speed: JogSpeed) -> Result<(), RigError> {
        Ok(self.stage.handle().jog(jog, step, speed)?)
    }

    pub async fn go_to(&self, target: Position) -> Result<MoveOutcome, RigError> {
        Ok(self.stage.handle().go_to(target).await?)
    }

    /// Stops the stage worker. Moves still queued are discarded.
    pub fn shutdown(&mut self) {
        self.stage.shutdown();
    }
}
