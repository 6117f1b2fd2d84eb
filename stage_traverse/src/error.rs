// THEORY:
// Every failure the rig can hit is absorbed somewhere in the core and reported
// through one of these enums. None of them is process-fatal: a transport error
// costs one move, a decode error costs one position refresh, and calibration or
// empty-path errors stop a traversal from starting at all.

use std::path::PathBuf;

use thiserror::Error;

/// Failures talking to the controller's byte stream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not open port {port}: {reason}")]
    Open { port: String, reason: String },
    #[error("could not configure port: {0}")]
    Configure(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("transport used before it was opened")]
    NotOpen,
}

/// A controller reply that could not be turned into a position.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("response has no position delimiter")]
    MissingDelimiter,
    #[error("expected 3 position values, found {found}")]
    TooFewValues { found: usize },
    #[error("unrecognised command: {0}")]
    BadCommand(String),
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("stage worker has stopped")]
    WorkerStopped,
    #[error("could not spawn stage worker: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("exactly 3 point pairs are required (got {image} image, {world} world)")]
    WrongPointCount { image: usize, world: usize },
    #[error("calibration image points are collinear")]
    Degenerate,
    #[error("no calibration transform has been set")]
    Missing,
}

#[derive(Debug, Error)]
pub enum TraversalError {
    #[error("no detections to traverse")]
    EmptyPath,
    #[error("a traversal is already in progress")]
    AlreadyRunning,
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error("traversal task ended abnormally: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PostprocessError {
    #[error("expected {expected} tile tensors, got {got}")]
    TileCountMismatch { expected: usize, got: usize },
    #[error("tile {tile}: tensor holds {got} values, shape needs {expected}")]
    MalformedTensor {
        tile: usize,
        expected: usize,
        got: usize,
    },
    #[error("image {width}x{height} is too small for {factor}x{factor} tiles")]
    ImageTooSmall { width: u32, height: u32, factor: u32 },
    #[error("inference engine failed: {0}")]
    Inference(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Umbrella error for the session layer.
#[derive(Debug, Error)]
pub enum RigError {
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Traversal(#[from] TraversalError),
    #[error(transparent)]
    Postprocess(#[from] PostprocessError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Image(#[from] image::ImageError),
}
