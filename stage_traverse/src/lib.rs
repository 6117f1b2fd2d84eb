// THEORY:
// This file is the entry point for the `stage_traverse` library crate. The crate
// is split into two halves that meet in `RigSession`:
//
// - The motion half: `stage_protocol` (pure wire codec), `transport` (the byte
//   stream seam), `stage_controller` (the single-worker actor that owns the stage)
//   and `traversal` (the operator-paced waypoint walker).
// - The detection half: `tiling`, `detection`, `nms` and `path_planner`, fronted by
//   `pipeline`, turning per-tile network output into an ordered path, plus the
//   `coordinate_mapper` that carries that path into stage space.
//
// The public API below re-exports what a host application needs; the
// `core_modules` stay reachable for callers that want the individual pieces.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod pipeline;
pub mod rig;

pub use config::{CalibrationConfig, RigConfig};
pub use core_modules::coordinate_mapper::{AffineTransform, Point2, compute_transform};
pub use core_modules::detection::{BoxRect, DetectionBox, TileTensor};
pub use core_modules::jog::{Jog, JogSpeed};
pub use core_modules::stage_controller::{MoveOutcome, StageConfig, StageController, StageHandle};
pub use core_modules::stage_protocol::{Axes, AxisScale, MoveRequest, Position};
pub use core_modules::transport::{SerialSettings, SimulatedStage, Transport};
pub use core_modules::traversal::{
    TraversalConfig, TraversalController, TraversalEvent, TraversalHandle, TraversalOutcome,
    TraversalState,
};
pub use error::{
    CalibrationError, ConfigError, DecodeError, PostprocessError, RigError, StageError,
    TransportError, TraversalError,
};
pub use pipeline::{DetectionConfig, InferenceEngine, TiledDetectionPipeline};
pub use rig::RigSession;
