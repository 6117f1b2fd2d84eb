// THEORY:
// The `StageController` is the single owner of the physical stage. It is built as
// an actor: one dedicated worker thread owns the transport and the authoritative
// position, and every other thread talks to it through an ordered channel of
// move requests.
//
// Key architectural principles:
// 1.  **One Move In Flight**: The command channel is FIFO and has exactly one
//     consumer, so insertion order is execution order and two physical moves can
//     never overlap.
// 2.  **Completion Signals**: A blocking move carries a one-shot sender. The worker
//     fulfils it only after the wire round-trip (write, settle, poll, decode) has
//     finished, which is what lets the traversal chain dependent single-axis moves.
// 3.  **Snapshot Reads**: The position lives in a `watch` channel. Only the worker
//     writes it, and only after a decoded poll reply. Readers copy a snapshot and
//     display consumers can await changes instead of polling a global.
// 4.  **Soft Failures**: A port that will not open costs the current move only.
//     Once the move line is written, a failed or unreadable poll costs the
//     position refresh only. Neither stops the worker.
// 5.  **Shutdown**: Stopping raises a flag, wakes the worker and joins it. Whatever
//     is still queued is dropped; its waiters observe `WorkerStopped`.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

use crate::core_modules::jog::{Jog, JogSpeed};
use crate::core_modules::stage_protocol::{
    Axes, AxisScale, EncodedMove, MoveRequest, POLL_COMMAND, Position, decode_position,
    plan_moves,
};
use crate::core_modules::transport::{ResponseTiming, SerialSettings, Transport, read_response};
use crate::error::{StageError, TransportError};

/// Everything the stage worker needs to know about its controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Port identifier handed to `Transport::open`.
    pub port: String,
    pub serial: SerialSettings,
    pub scale: AxisScale,
    /// Velocity used when a caller does not supply one, real-world units.
    pub default_velocity: Axes,
    /// Added to every computed settle time.
    pub settle_margin_ms: u64,
    pub response_initial_delay_ms: u64,
    pub response_poll_interval_ms: u64,
    pub response_timeout_ms: u64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            port: "COM5".to_string(),
            serial: SerialSettings::default(),
            scale: AxisScale::default(),
            default_velocity: Axes::splat(10000.0),
            settle_margin_ms: 500,
            response_initial_delay_ms: 100,
            response_poll_interval_ms: 100,
            response_timeout_ms: 2000,
        }
    }
}

impl StageConfig {
    fn response_timing(&self) -> ResponseTiming {
        ResponseTiming {
            initial_delay: Duration::from_millis(self.response_initial_delay_ms),
            poll_interval: Duration::from_millis(self.response_poll_interval_ms),
            max_wait: Duration::from_millis(self.response_timeout_ms),
        }
    }
}

/// How a completed move ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MoveOutcome {
    /// The post-move poll decoded and the position estimate was refreshed.
    Settled(Position),
    /// The move was sent but the poll reply was unusable; the estimate is stale.
    PositionUnknown,
}

type MoveResult = Result<MoveOutcome, StageError>;

enum StageCommand {
    Move {
        request: MoveRequest,
        done: Option<oneshot::Sender<MoveResult>>,
    },
    Shutdown,
}

/// Cloneable front door to a running stage worker.
#[derive(Clone)]
pub struct StageHandle {
    commands: mpsc::UnboundedSender<StageCommand>,
    position: watch::Receiver<Position>,
    default_velocity: Axes,
}

impl StageHandle {
    fn submit(&self, request: MoveRequest, done: Option<oneshot::Sender<MoveResult>>) -> Result<(), StageError> {
        self.commands
            .send(StageCommand::Move { request, done })
            .map_err(|_| StageError::WorkerStopped)
    }

    fn submit_tracked(&self, request: MoveRequest) -> Result<oneshot::Receiver<MoveResult>, StageError> {
        let (tx, rx) = oneshot::channel();
        self.submit(request, Some(tx))?;
        Ok(rx)
    }

    /// Queues a relative move and returns at once.
    pub fn move_relative(&self, displacement: Axes, velocity: Axes) -> Result<(), StageError> {
        self.submit(MoveRequest::new(displacement, velocity), None)
    }

    /// Queues a relative move at the default velocity.
    pub fn move_by(&self, displacement: Axes) -> Result<(), StageError> {
        self.move_relative(displacement, self.default_velocity)
    }

    /// Queues a relative move and resolves once that move has been executed and
    /// its position poll attempted.
    pub async fn move_and_wait(&self, displacement: Axes, velocity: Axes) -> MoveResult {
        let done = self.submit_tracked(MoveRequest::new(displacement, velocity))?;
        done.await.map_err(|_| StageError::WorkerStopped)?
    }

    /// `move_and_wait` for callers outside an async runtime.
    pub fn move_and_wait_blocking(&self, displacement: Axes, velocity: Axes) -> MoveResult {
        let done = self.submit_tracked(MoveRequest::new(displacement, velocity))?;
        done.blocking_recv().map_err(|_| StageError::WorkerStopped)?
    }

    /// Moves to an absolute position as X-only, Y-only, then Z-only moves.
    ///
    /// All three are queued together, measured from the current snapshot, and the
    /// call resolves when the last one has completed.
    pub async fn go_to(&self, target: Position) -> MoveResult {
        let delta = self.current_position().delta_to(&target);
        let velocity = self.default_velocity;
        let pending = [Axes::only_x(delta.x), Axes::only_y(delta.y), Axes::only_z(delta.z)]
            .into_iter()
            .map(|d| self.submit_tracked(MoveRequest::new(d, velocity)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut last = MoveOutcome::PositionUnknown;
        for result in join_all(pending).await {
            last = result.map_err(|_| StageError::WorkerStopped)??;
        }
        Ok(last)
    }

    /// Sends a no-op and polls, resolving once everything queued before it has run.
    pub async fn refresh_position(&self) -> MoveResult {
        self.move_and_wait(Axes::ZERO, self.default_velocity).await
    }

    /// Queues the moves for one press of a jog control.
    pub fn jog(&self, jog: Jog, step: f64, speed: JogSpeed) -> Result<(), StageError> {
        tracing::info!(?jog, ?speed, step, "jog");
        for displacement in jog.displacements(step, speed) {
            self.move_by(displacement)?;
        }
        Ok(())
    }

    pub fn current_position(&self) -> Position {
        *self.position.borrow()
    }

    /// A receiver that observes every position refresh.
    pub fn subscribe_position(&self) -> watch::Receiver<Position> {
        self.position.clone()
    }

    pub fn default_velocity(&self) -> Axes {
        self.default_velocity
    }
}

/// Owns the stage worker thread.
pub struct StageController {
    handle: StageHandle,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl StageController {
    /// Starts a worker that owns `transport`, with the estimate at the origin.
    pub fn spawn<T: Transport>(transport: T, config: StageConfig) -> Result<Self, StageError> {
        Self::spawn_at(transport, config, Position::default())
    }

    pub fn spawn_at<T: Transport>(
        transport: T,
        config: StageConfig,
        initial: Position,
    ) -> Result<Self, StageError> {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (position_tx, position_rx) = watch::channel(initial);
        let stop = Arc::new(AtomicBool::new(false));

        tracing::info!(
            port = %config.port,
            x = initial.x,
            y = initial.y,
            z = initial.z,
            "stage controller initialised"
        );

        let handle = StageHandle {
            commands: commands_tx,
            position: position_rx,
            default_velocity: config.default_velocity,
        };
        let worker = StageWorker {
            transport,
            config,
            position: position_tx,
            stop: Arc::clone(&stop),
        };
        let join = std::thread::Builder::new()
            .name("stage-worker".to_string())
            .spawn(move || worker.run(commands_rx))?;

        Ok(Self {
            handle,
            stop,
            worker: Some(join),
        })
    }

    pub fn handle(&self) -> StageHandle {
        self.handle.clone()
    }

    pub fn move_relative(&self, displacement: Axes, velocity: Axes) -> Result<(), StageError> {
        self.handle.move_relative(displacement, velocity)
    }

    pub async fn move_and_wait(&self, displacement: Axes, velocity: Axes) -> MoveResult {
        self.handle.move_and_wait(displacement, velocity).await
    }

    pub fn current_position(&self) -> Position {
        self.handle.current_position()
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        // Fails only if the worker is already gone.
        let _ = self.handle.commands.send(StageCommand::Shutdown);
    }

    /// Stops the worker and waits for it to exit. The move in flight, if any,
    /// finishes; queued moves are discarded.
    pub fn shutdown(&mut self) {
        self.request_stop();
        if let Some(join) = self.worker.take() {
            if join.join().is_err() {
                tracing::error!("stage worker panicked");
            }
        }
    }
}

impl Drop for StageController {
    fn drop(&mut self) {
        // Best effort; joining here could stall an async runtime for a full move.
        if self.worker.is_some() {
            self.request_stop();
        }
    }
}

struct StageWorker<T: Transport> {
    transport: T,
    config: StageConfig,
    position: watch::Sender<Position>,
    stop: Arc<AtomicBool>,
}

impl<T: Transport> StageWorker<T> {
    fn run(mut self, mut commands: mpsc::UnboundedReceiver<StageCommand>) {
        while let Some(command) = commands.blocking_recv() {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            match command {
                StageCommand::Shutdown => break,
                StageCommand::Move { request, done } => {
                    let result = self.execute(&request);
                    if let Some(done) = done {
                        // The waiter may have given up; nothing to do then.
                        let _ = done.send(result);
                    }
                }
            }
        }
        tracing::info!("stage worker stopped");
    }

    fn execute(&mut self, request: &MoveRequest) -> MoveResult {
        let from = *self.position.borrow();
        tracing::info!(
            from_x = from.x,
            from_y = from.y,
            from_z = from.z,
            dx = request.displacement.x,
            dy = request.displacement.y,
            dz = request.displacement.z,
            "executing move"
        );

        if let Err(e) = self.open_port() {
            tracing::error!("move failed, keeping previous position: {e}");
            self.transport.close();
            return Err(e.into());
        }

        let mut outcome = MoveOutcome::PositionUnknown;
        for encoded in plan_moves(request, &self.config.scale) {
            match self.round_trip(&encoded) {
                Ok(o) => outcome = o,
                Err(e) => {
                    tracing::error!("move failed mid round-trip: {e}");
                    self.transport.close();
                    return Err(e.into());
                }
            }
        }

        self.transport.close();
        Ok(outcome)
    }

    fn open_port(&mut self) -> Result<(), TransportError> {
        self.transport.open(&self.config.port)?;
        self.transport.configure(&self.config.serial)
    }

    /// Write, settle, poll, decode. Only the move write itself can fail.
    fn round_trip(&mut self, encoded: &EncodedMove) -> Result<MoveOutcome, TransportError> {
        self.transport.write(encoded.line.as_bytes())?;
        tracing::info!(command = encoded.line.trim_end(), "move command sent");

        let settle = encoded.settle_time(Duration::from_millis(self.config.settle_margin_ms));
        if !settle.is_zero() {
            tracing::debug!(settle_ms = settle.as_millis() as u64, "waiting for stage to settle");
            std::thread::sleep(settle);
        }

        Ok(self.poll_position())
    }

    /// Asks the controller where it is. The move has already gone out, so any
    /// failure here only costs the position refresh.
    fn poll_position(&mut self) -> MoveOutcome {
        if let Err(e) = self.transport.write(POLL_COMMAND.as_bytes()) {
            tracing::warn!("position poll not sent: {e}");
            return MoveOutcome::PositionUnknown;
        }
        let response = match read_response(&mut self.transport, &self.config.response_timing()) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("position reply not read: {e}");
                return MoveOutcome::PositionUnknown;
            }
        };

        match decode_position(&response, &self.config.scale) {
            Ok(position) => {
                self.position.send_replace(position);
                tracing::info!(
                    x = position.x,
                    y = position.y,
                    z = position.z,
                    "position updated from controller"
                );
                MoveOutcome::Settled(position)
            }
            Err(e) => {
                tracing::warn!(response = response.trim_end(), "no usable position reply: {e}");
                MoveOutcome::PositionUnknown
            }
        }
    }
}
