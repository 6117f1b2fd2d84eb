// THEORY:
// The `TraversalController` walks the stage through an ordered list of waypoints
// and hands control to a human at every stop. It runs as its own task so that the
// caller stays responsive while the stage is moving.
//
// Key architectural principles:
// 1.  **Explicit State**: The current `TraversalState` is published through a
//     `watch` channel. Observers read or await it; nobody shares a raw flag.
// 2.  **Operator Messages**: `confirm` and `abort` are messages on a channel, not
//     booleans guarded by a condition variable, so a wake-up can never be lost.
// 3.  **Abort Points**: An abort is observed at the top of every waypoint and while
//     waiting for the operator. It never interrupts a move already handed to the
//     stage worker, and no further moves are issued once it has been seen.
// 4.  **Stale Confirms**: Confirmations that arrive while the stage is moving are
//     dropped before the pause is announced. Only a confirm sent in response to
//     `WaitingForUser` releases the traversal.
// 5.  **One Axis at a Time**: Each waypoint is reached by X, then Y, then Z moves,
//     each awaited before the next is issued.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::core_modules::coordinate_mapper::{AffineTransform, Point2};
use crate::core_modules::detection::DetectionBox;
use crate::core_modules::stage_controller::StageHandle;
use crate::core_modules::stage_protocol::{Axes, Position};
use crate::error::{StageError, TraversalError};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraversalConfig {
    /// Waypoints whose mapped y falls below this are skipped.
    pub min_y: f64,
    /// Z every waypoint is visited at.
    pub target_z: f64,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            min_y: 18818.0,
            target_z: 27960.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalState {
    Idle,
    Running,
    WaitingForUser,
    Aborted,
    Finished,
}

impl TraversalState {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TraversalState::Running | TraversalState::WaitingForUser | TraversalState::Aborted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalOutcome {
    Completed { visited: usize, skipped: usize },
    Aborted { visited: usize },
    /// The stage worker stopped underneath the traversal.
    StageUnavailable { visited: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraversalEvent {
    Started { total: usize },
    /// About to handle waypoint `current` (1-based).
    Progress { current: usize, total: usize },
    Skipped { index: usize, target: Point2 },
    Arrived { index: usize, target: Position },
    WaitingForUser { index: usize },
    Finished(TraversalOutcome),
}

enum OperatorCommand {
    Confirm,
    Abort,
}

/// Control surface of a running traversal.
pub struct TraversalHandle {
    commands: mpsc::UnboundedSender<OperatorCommand>,
    state: watch::Receiver<TraversalState>,
    events: broadcast::Sender<TraversalEvent>,
    task: JoinHandle<TraversalOutcome>,
}

impl TraversalHandle {
    /// Accepts the operator's adjustment and moves on. Ignored unless the
    /// traversal is waiting for the user.
    pub fn confirm(&self) {
        // A closed channel means the traversal already finished.
        let _ = self.commands.send(OperatorCommand::Confirm);
    }

    pub fn abort(&self) {
        let _ = self.commands.send(OperatorCommand::Abort);
    }

    pub fn state(&self) -> TraversalState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<TraversalState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TraversalEvent> {
        self.events.subscribe()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the traversal to end.
    pub async fn wait(self) -> Result<TraversalOutcome, TraversalError> {
        Ok(self.task.await?)
    }
}

pub struct TraversalController {
    stage: StageHandle,
    config: TraversalConfig,
    state: Arc<watch::Sender<TraversalState>>,
    events: broadcast::Sender<TraversalEvent>,
}

impl TraversalController {
    pub fn new(stage: StageHandle, config: TraversalConfig) -> Self {
        let (state, _) = watch::channel(TraversalState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            stage,
            config,
            state: Arc::new(state),
            events,
        }
    }

    pub fn state(&self) -> TraversalState {
        *self.state.borrow()
    }

    /// Subscribe before `start` to see every event of the next run.
    pub fn subscribe(&self) -> broadcast::Receiver<TraversalEvent> {
        self.events.subscribe()
    }

    /// Maps each detection's centroid through `transform` and starts walking the
    /// resulting waypoints in order. Must be called from within a Tokio runtime.
    pub fn start(
        &self,
        path: &[DetectionBox],
        transform: &AffineTransform,
    ) -> Result<TraversalHandle, TraversalError> {
        self.start_waypoints(transform.map_path(path))
    }

    /// Starts walking real-world waypoints in order.
    pub fn start_waypoints(&self, waypoints: Vec<Point2>) -> Result<TraversalHandle, TraversalError> {
        if waypoints.is_empty() {
            tracing::warn!("refusing to start a traversal with no waypoints");
            return Err(TraversalError::EmptyPath);
        }
        if self.state().is_active() {
            return Err(TraversalError::AlreadyRunning);
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        self.state.send_replace(TraversalState::Running);

        let run = TraversalRun {
            stage: self.stage.clone(),
            config: self.config.clone(),
            waypoints,
            commands: commands_rx,
            state: Arc::clone(&self.state),
            events: self.events.clone(),
        };
        let task = tokio::spawn(run.run());

        Ok(TraversalHandle {
            commands: commands_tx,
            state: self.state.subscribe(),
            events: self.events.clone(),
            task,
        })
    }
}

struct TraversalRun {
    stage: StageHandle,
    config: TraversalConfig,
    waypoints: Vec<Point2>,
    commands: mpsc::UnboundedReceiver<OperatorCommand>,
    state: Arc<watch::Sender<TraversalState>>,
    events: broadcast::Sender<TraversalEvent>,
}

impl TraversalRun {
    fn emit(&self, event: TraversalEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: TraversalState) {
        self.state.send_replace(state);
    }

    /// Empties the operator queue. Returns true if an abort was in it.
    fn drain_commands(&mut self) -> bool {
        let mut aborted = false;
        while let Ok(command) = self.commands.try_recv() {
            match command {
                OperatorCommand::Abort => aborted = true,
                OperatorCommand::Confirm => {
                    tracing::debug!("discarding confirm received while not waiting")
                }
            }
        }
        aborted
    }

    fn finish(&self, outcome: TraversalOutcome) -> TraversalOutcome {
        if matches!(outcome, TraversalOutcome::Aborted { .. }) {
            self.set_state(TraversalState::Aborted);
        }
        tracing::info!(?outcome, "traversal finished");
        self.set_state(TraversalState::Finished);
        self.emit(TraversalEvent::Finished(outcome));
        outcome
    }

    async fn run(mut self) -> TraversalOutcome {
        let total = self.waypoints.len();
        let mut visited = 0;
        let mut skipped = 0;

        tracing::info!(total, "traversal started");
        self.set_state(TraversalState::Running);
        self.emit(TraversalEvent::Started { total });

        for index in 0..total {
            if self.drain_commands() {
                return self.finish(TraversalOutcome::Aborted { visited });
            }

            let target = self.waypoints[index];
            self.emit(TraversalEvent::Progress {
                current: index + 1,
                total,
            });

            if target.y < self.config.min_y {
                tracing::info!(index, y = target.y, "waypoint outside inclusion boundary, skipping");
                skipped += 1;
                self.emit(TraversalEvent::Skipped { index, target });
                continue;
            }

            // --- Move X, then Y, then Z ---
            let goal = Position::new(target.x, target.y, self.config.target_z);
            let delta = self.stage.current_position().delta_to(&goal);
            let velocity = self.stage.default_velocity();
            tracing::info!(index, x = goal.x, y = goal.y, z = goal.z, "moving to waypoint");

            for step in [Axes::only_x(delta.x), Axes::only_y(delta.y), Axes::only_z(delta.z)] {
                match self.stage.move_and_wait(step, velocity).await {
                    Ok(_) => {}
                    Err(StageError::WorkerStopped) => {
                        tracing::error!(index, "stage worker stopped during traversal");
                        return self.finish(TraversalOutcome::StageUnavailable { visited });
                    }
                    Err(e) => tracing::warn!(index, "move toward waypoint failed: {e}"),
                }
            }
            visited += 1;
            self.emit(TraversalEvent::Arrived { index, target: goal });

            // --- Pause for the operator ---
            if self.drain_commands() {
                return self.finish(TraversalOutcome::Aborted { visited });
            }
            self.set_state(TraversalState::WaitingForUser);
            self.emit(TraversalEvent::WaitingForUser { index });

            match self.commands.recv().await {
                Some(OperatorCommand::Confirm) => {
                    tracing::info!(index, "operator confirmed waypoint");
                    self.set_state(TraversalState::Running);
                }
                Some(OperatorCommand::Abort) | None => {
                    return self.finish(TraversalOutcome::Aborted { visited });
                }
            }
        }

        self.finish(TraversalOutcome::Completed { visited, skipped })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::stage_controller::StageController;
    use crate::core_modules::stage_controller::tests::fast_config;
    use crate::core_modules::transport::SimulatedStage;
    use std::time::Duration;

    fn open_config() -> TraversalConfig {
        TraversalConfig {
            min_y: 0.0,
            target_z: 1000.0,
        }
    }

    fn rig(config: TraversalConfig) -> (SimulatedStage, StageController, TraversalController) {
        let sim = SimulatedStage::new();
        let stage = StageController::spawn(sim.clone(), fast_config()).unwrap();
        let traversal = TraversalController::new(stage.handle(), config);
        (sim, stage, traversal)
    }

    /// Index of the next pause, or `None` once the run has finished.
    async fn next_pause(events: &mut broadcast::Receiver<TraversalEvent>) -> Option<usize> {
        loop {
            match events.recv().await {
                Ok(TraversalEvent::WaitingForUser { index }) => return Some(index),
                Ok(TraversalEvent::Finished(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    #[tokio::test]
    async fn confirmed_traversal_completes() {
        let (sim, _stage, traversal) = rig(open_config());
        let mut events = traversal.subscribe();
        let handle = traversal
            .start_waypoints(vec![Point2::new(10000.0, 5000.0), Point2::new(20000.0, 6000.0)])
            .unwrap();

        assert_eq!(next_pause(&mut events).await, Some(0));
        assert_eq!(handle.state(), TraversalState::WaitingForUser);
        handle.confirm();
        assert_eq!(next_pause(&mut events).await, Some(1));
        handle.confirm();

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome, TraversalOutcome::Completed { visited: 2, skipped: 0 });
        assert_eq!(traversal.state(), TraversalState::Finished);
        assert_eq!(sim.move_commands().len(), 6);
        assert_eq!(sim.units(), [1760, 528, 1260]);
    }

    #[tokio::test]
    async fn waypoints_below_boundary_are_skipped() {
        let (sim, _stage, traversal) = rig(TraversalConfig {
            min_y: 18818.0,
            target_z: 1000.0,
        });
        let mut events = traversal.subscribe();
        let handle = traversal
            .start_waypoints(vec![Point2::new(1000.0, 100.0), Point2::new(1000.0, 20000.0)])
            .unwrap();

        assert_eq!(next_pause(&mut events).await, Some(1));
        handle.confirm();

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome, TraversalOutcome::Completed { visited: 1, skipped: 1 });
        assert_eq!(sim.move_commands().len(), 3);
    }

    #[tokio::test]
    async fn abort_while_waiting_stops_further_moves() {
        let (sim, _stage, traversal) = rig(open_config());
        let mut events = traversal.subscribe();
        let handle = traversal
            .start_waypoints(vec![Point2::new(1000.0, 1000.0), Point2::new(5000.0, 5000.0)])
            .unwrap();

        assert_eq!(next_pause(&mut events).await, Some(0));
        handle.abort();

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome, TraversalOutcome::Aborted { visited: 1 });
        assert_eq!(traversal.state(), TraversalState::Finished);
        assert_eq!(sim.move_commands().len(), 3);
    }

    #[tokio::test]
    async fn abort_before_first_waypoint_moves_nothing() {
        let (sim, _stage, traversal) = rig(open_config());
        let handle = traversal.start_waypoints(vec![Point2::new(1000.0, 1000.0)]).unwrap();
        // The spawned task has not run yet on the current-thread runtime.
        handle.abort();

        assert_eq!(handle.wait().await.unwrap(), TraversalOutcome::Aborted { visited: 0 });
        assert!(sim.move_commands().is_empty());
    }

    #[tokio::test]
    async fn confirm_sent_while_moving_is_discarded() {
        let (_sim, _stage, traversal) = rig(open_config());
        let mut events = traversal.subscribe();
        let handle = traversal
            .start_waypoints(vec![Point2::new(1000.0, 1000.0), Point2::new(2000.0, 2000.0)])
            .unwrap();
        handle.confirm();

        assert_eq!(next_pause(&mut events).await, Some(0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state(), TraversalState::WaitingForUser);

        handle.abort();
        assert_eq!(handle.wait().await.unwrap(), TraversalOutcome::Aborted { visited: 1 });
    }

    #[tokio::test]
    async fn stopped_stage_ends_the_traversal() {
        let (_sim, mut stage, traversal) = rig(open_config());
        stage.shutdown();

        let handle = traversal.start_waypoints(vec![Point2::new(1000.0, 1000.0)]).unwrap();
        assert_eq!(
            handle.wait().await.unwrap(),
            TraversalOutcome::StageUnavailable { visited: 0 }
        );
    }

    #[tokio::test]
    async fn refuses_empty_or_overlapping_runs() {
        let (_sim, _stage, traversal) = rig(open_config());
        assert!(matches!(
            traversal.start_waypoints(Vec::new()),
            Err(TraversalError::EmptyPath)
        ));

        let first = traversal.start_waypoints(vec![Point2::new(1000.0, 1000.0)]).unwrap();
        assert!(matches!(
            traversal.start_waypoints(vec![Point2::new(1.0, 1.0)]),
            Err(TraversalError::AlreadyRunning)
        ));
        first.abort();
        first.wait().await.unwrap();
    }

    #[tokio::test]
    async fn detections_are_mapped_before_walking() {
        let (sim, _stage, traversal) = rig(open_config());
        let mut events = traversal.subscribe();
        let boxes = vec![DetectionBox {
            rect: crate::core_modules::detection::BoxRect::new(90.0, 40.0, 20.0, 20.0),
            class_id: 0,
            confidence: 0.9,
            tile_index: 0,
        }];
        let transform = AffineTransform {
            matrix: [[100.0, 0.0, 0.0], [0.0, 100.0, 0.0]],
        };
        let handle = traversal.start(&boxes, &transform).unwrap();

        assert_eq!(next_pause(&mut events).await, Some(0));
        handle.confirm();
        handle.wait().await.unwrap();
        // Centroid (100, 50) maps to (10000, 5000).
        assert_eq!(sim.units(), [880, 440, 1260]);
    }
}
