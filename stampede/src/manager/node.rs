//! Manager-side controller of one worker node.
//!
//! The controller is the reliable half of the operation pipeline: operations
//! queue up in a bounded FIFO, at most one is in flight at a time, and an
//! unacknowledged operation is re-emitted every retry interval until the
//! worker confirms receipt. The retry timer is not an error timeout; a
//! worker may legitimately be slow.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::core::{
    self, AttackDetails, IncrementDetails, NodeDetails, Operation, OperationStart, OperationStop,
    ScenarioDetails,
};

/// Receiving halves of the pipeline channels, held until [`NodeController::start`].
#[derive(Debug)]
struct Pipeline {
    op_queue_rx: mpsc::Receiver<Operation>,
    ack_rx: mpsc::Receiver<()>,
}

/// One worker node as the manager sees it: advertised scenarios, a local
/// mirror of the attacks the worker is executing and the operation pipeline
/// feeding the stream sender.
#[derive(Debug)]
pub struct NodeController {
    name: String,
    scenarios: HashMap<String, ScenarioDetails>,
    attacks: Mutex<HashMap<i64, AttackDetails>>,

    ops: mpsc::Sender<Operation>,
    op_queue_tx: mpsc::Sender<Operation>,
    ack_tx: mpsc::Sender<()>,
    pipeline: Mutex<Option<Pipeline>>,

    retry_interval: Duration,
    is_active: AtomicBool,
}

impl NodeController {
    /// Create a controller feeding `ops`, with a pending-operation queue of
    /// `op_queue_capacity`.
    #[must_use]
    pub fn new(
        name: String,
        scenarios: HashMap<String, ScenarioDetails>,
        ops: mpsc::Sender<Operation>,
        op_queue_capacity: usize,
        retry_interval: Duration,
    ) -> Self {
        let (op_queue_tx, op_queue_rx) = mpsc::channel(op_queue_capacity);
        let (ack_tx, ack_rx) = mpsc::channel(1);

        Self {
            name,
            scenarios,
            attacks: Mutex::new(HashMap::new()),
            ops,
            op_queue_tx,
            ack_tx,
            pipeline: Mutex::new(Some(Pipeline {
                op_queue_rx,
                ack_rx,
            })),
            retry_interval,
            is_active: AtomicBool::new(false),
        }
    }

    /// Start the operation pipeline. The task runs until `cancel` fires.
    ///
    /// # Panics
    ///
    /// Panics if the pipeline lock has been poisoned.
    pub fn start(self: std::sync::Arc<Self>, cancel: CancellationToken) {
        let Some(pipeline) = self
            .pipeline
            .lock()
            .expect("pipeline lock poisoned")
            .take()
        else {
            warn!(node = %self.name, "controller already started");
            return;
        };

        self.is_active.store(true, Ordering::SeqCst);
        tokio::spawn(self.process_ops(cancel, pipeline));
    }

    async fn process_ops(self: std::sync::Arc<Self>, cancel: CancellationToken, pipeline: Pipeline) {
        let Pipeline {
            mut op_queue_rx,
            mut ack_rx,
        } = pipeline;

        let mut current: Option<Operation> = None;
        // Prime the pipeline: the first queued operation goes out without
        // waiting for an acknowledgement.
        let _ = self.ack_tx.try_send(());

        let mut retry = tokio::time::interval_at(
            tokio::time::Instant::now() + self.retry_interval,
            self.retry_interval,
        );
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = retry.tick() => {
                    if let Some(op) = &current {
                        if self.ops.send(op.clone()).await.is_err() {
                            break;
                        }
                        retry.reset();
                    }
                }
                ack = ack_rx.recv() => {
                    if ack.is_none() {
                        break;
                    }

                    tokio::select! {
                        () = cancel.cancelled() => break,
                        next = op_queue_rx.recv() => match next {
                            Some(op) => {
                                current = Some(op.clone());
                                if self.ops.send(op).await.is_err() {
                                    break;
                                }
                                retry.reset();
                            }
                            None => break,
                        }
                    }
                }
            }
        }

        self.is_active.store(false, Ordering::SeqCst);
    }

    /// Record the worker's acknowledgement of the in-flight operation,
    /// advancing the pipeline to the next queued operation.
    pub fn ack_operation(&self) {
        let _ = self.ack_tx.try_send(());
    }

    /// Queue a start operation for this node.
    ///
    /// The local mirror is updated first: a re-delivered increment has its
    /// counters added into the existing entry so replayed linear ramps
    /// accumulate. Scenario validation runs after the mirror update; a name
    /// this node never advertised escalates to a `Kill`.
    ///
    /// # Errors
    ///
    /// Returns [`core::Error::ScenarioNotFound`] on a misadvertised scenario
    /// and [`core::Error::NoActiveNodes`] when the pipeline is gone.
    ///
    /// # Panics
    ///
    /// Panics if the mirror lock has been poisoned.
    pub async fn start_attack(&self, start: OperationStart) -> Result<(), core::Error> {
        {
            let mut attacks = self.attacks.lock().expect("mirror lock poisoned");
            let increment = IncrementDetails {
                id: start.increment_id,
                attack_id: start.attack_id,
                scenarios: start.scenarios.clone(),
            };

            match attacks.entry(start.attack_id) {
                Entry::Occupied(mut entry) => {
                    let attack = entry.get_mut();
                    if let Some(existing) = attack
                        .increments
                        .iter_mut()
                        .find(|inc| inc.id == start.increment_id)
                    {
                        for (name, counter) in &start.scenarios {
                            *existing.scenarios.entry(name.clone()).or_insert(0) += counter;
                        }
                    } else {
                        attack.increments.push(increment);
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(AttackDetails {
                        id: start.attack_id,
                        increments: vec![increment],
                        ..AttackDetails::default()
                    });
                }
            }
        }

        for name in start.scenarios.keys() {
            if !self.scenarios.contains_key(name) {
                self.op_queue_tx
                    .send(Operation::Kill)
                    .await
                    .map_err(|_| core::Error::NoActiveNodes)?;
                return Err(core::Error::ScenarioNotFound);
            }
        }

        self.op_queue_tx
            .send(Operation::Start(start))
            .await
            .map_err(|_| core::Error::NoActiveNodes)
    }

    /// Queue a stop operation for this node, trimming the mirror first.
    ///
    /// # Errors
    ///
    /// Returns [`core::Error::AttackNotFound`] or
    /// [`core::Error::IncrementNotFound`] when the mirror lacks the target
    /// and [`core::Error::NoActiveNodes`] when the pipeline is gone.
    ///
    /// # Panics
    ///
    /// Panics if the mirror lock has been poisoned.
    pub async fn stop_attack(&self, stop: OperationStop) -> Result<(), core::Error> {
        {
            let mut attacks = self.attacks.lock().expect("mirror lock poisoned");
            if !attacks.contains_key(&stop.attack_id) {
                return Err(core::Error::AttackNotFound);
            }

            if let Some(increment_id) = stop.increment_id {
                let attack = attacks
                    .get_mut(&stop.attack_id)
                    .expect("attack presence checked");
                let Some(position) = attack
                    .increments
                    .iter()
                    .position(|inc| inc.id == increment_id)
                else {
                    return Err(core::Error::IncrementNotFound);
                };

                if attack.increments.len() > 1 {
                    attack.increments.remove(position);
                } else {
                    attacks.remove(&stop.attack_id);
                }
            } else {
                attacks.remove(&stop.attack_id);
            }
        }

        self.op_queue_tx
            .send(Operation::Stop(stop))
            .await
            .map_err(|_| core::Error::NoActiveNodes)
    }

    /// The node's self-declared name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this node advertises `scenario`.
    #[must_use]
    pub fn advertises(&self, scenario: &str) -> bool {
        self.scenarios.contains_key(scenario)
    }

    /// The scenarios this node advertised at handshake.
    #[must_use]
    pub fn scenarios(&self) -> &HashMap<String, ScenarioDetails> {
        &self.scenarios
    }

    /// Snapshot of the node's state, including the attack mirror.
    ///
    /// # Panics
    ///
    /// Panics if the mirror lock has been poisoned.
    #[must_use]
    pub fn details(&self) -> NodeDetails {
        let attacks = self
            .attacks
            .lock()
            .expect("mirror lock poisoned")
            .values()
            .cloned()
            .collect();

        NodeDetails {
            name: self.name.clone(),
            is_active: self.is_active.load(Ordering::SeqCst),
            scenarios: self.scenarios.values().cloned().collect(),
            attacks,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn advertised(names: &[&str]) -> HashMap<String, ScenarioDetails> {
        names
            .iter()
            .map(|name| {
                (
                    (*name).to_string(),
                    ScenarioDetails {
                        name: (*name).to_string(),
                        description: String::new(),
                    },
                )
            })
            .collect()
    }

    fn start_op(attack_id: i64, increment_id: i64, scenario: &str, count: i64) -> OperationStart {
        OperationStart {
            id: format!("op-{attack_id}-{increment_id}"),
            attack_id,
            increment_id,
            wait_time_sec: 1.0,
            scenarios: [(scenario.to_string(), count)].into_iter().collect(),
        }
    }

    #[tokio::test]
    async fn redelivery_adds_counters_into_the_mirror() {
        let (ops_tx, _ops_rx) = mpsc::channel(1);
        let controller = NodeController::new(
            "n1".to_string(),
            advertised(&["http"]),
            ops_tx,
            16,
            Duration::from_secs(10),
        );

        controller
            .start_attack(start_op(0, 0, "http", 4))
            .await
            .expect("first delivery");
        controller
            .start_attack(start_op(0, 0, "http", 4))
            .await
            .expect("replayed delivery");

        let details = controller.details();
        assert_eq!(details.attacks.len(), 1);
        assert_eq!(details.attacks[0].increments[0].scenarios["http"], 8);
    }

    #[tokio::test]
    async fn misadvertised_scenario_escalates_to_kill() {
        let (ops_tx, mut ops_rx) = mpsc::channel(1);
        let controller = Arc::new(NodeController::new(
            "n1".to_string(),
            advertised(&["http"]),
            ops_tx,
            16,
            Duration::from_secs(10),
        ));

        let err = controller
            .start_attack(start_op(0, 0, "gopher", 1))
            .await
            .expect_err("unknown scenario");
        assert_eq!(err, core::Error::ScenarioNotFound);

        let cancel = CancellationToken::new();
        Arc::clone(&controller).start(cancel.clone());

        let delivered = ops_rx.recv().await.expect("kill delivered");
        assert_eq!(delivered, Operation::Kill);
        cancel.cancel();
    }

    #[tokio::test]
    async fn single_operation_in_flight_with_retry_until_ack() {
        let (ops_tx, mut ops_rx) = mpsc::channel(1);
        let controller = Arc::new(NodeController::new(
            "n1".to_string(),
            advertised(&["http"]),
            ops_tx,
            16,
            Duration::from_millis(50),
        ));
        let cancel = CancellationToken::new();
        Arc::clone(&controller).start(cancel.clone());

        let first = start_op(0, 0, "http", 1);
        controller
            .start_attack(first.clone())
            .await
            .expect("queue first");

        let delivered = ops_rx.recv().await.expect("first delivery");
        assert_eq!(delivered, Operation::Start(first.clone()));

        // Unacknowledged, the same operation comes again.
        let redelivered = ops_rx.recv().await.expect("retry delivery");
        assert_eq!(redelivered, Operation::Start(first.clone()));

        // A second operation queues behind the in-flight one.
        let second = start_op(1, 0, "http", 1);
        controller
            .start_attack(second.clone())
            .await
            .expect("queue second");

        controller.ack_operation();
        let mut saw_second = false;
        for _ in 0..5 {
            let op = ops_rx.recv().await.expect("delivery");
            if op == Operation::Start(second.clone()) {
                saw_second = true;
                break;
            }
            // Retries of the first operation may still be buffered.
            assert_eq!(op, Operation::Start(first.clone()));
        }
        assert!(saw_second, "second operation held back until ack");

        cancel.cancel();
    }

    #[tokio::test]
    async fn stop_requires_a_known_target() {
        let (ops_tx, _ops_rx) = mpsc::channel(1);
        let controller = NodeController::new(
            "n1".to_string(),
            advertised(&["http"]),
            ops_tx,
            16,
            Duration::from_secs(10),
        );

        let err = controller
            .stop_attack(OperationStop {
                attack_id: 9,
                increment_id: None,
            })
            .await
            .expect_err("unknown attack");
        assert_eq!(err, core::Error::AttackNotFound);

        controller
            .start_attack(start_op(0, 0, "http", 1))
            .await
            .expect("queue start");
        let err = controller
            .stop_attack(OperationStop {
                attack_id: 0,
                increment_id: Some(7),
            })
            .await
            .expect_err("unknown increment");
        assert_eq!(err, core::Error::IncrementNotFound);
    }
}
