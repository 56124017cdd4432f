//! The attack service: attack and increment lifecycle, workload split across
//! nodes, ramp and duration handling and the node recovery protocol.
//!
//! All state sits behind one reader-writer lock. Sequence allocation and
//! per-node dispatch happen under the same write guard, so concurrent REST
//! callers observe a total order on attack and increment ids.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use stampede_signal::Broadcaster;
use tokio::sync::{RwLock, oneshot};
use tracing::error;
use uuid::Uuid;

use crate::core;

use super::node::NodeController;

/// A pending node removal. Dropping the sender cancels the removal timer;
/// the token lets the timer clear only its own entry.
#[derive(Debug)]
struct Removal {
    token: u64,
    _cancel: oneshot::Sender<()>,
}

#[derive(Debug)]
struct AttackEntry {
    details: core::AttackDetails,
    stop: Arc<Broadcaster<()>>,
}

#[derive(Debug, Default)]
struct State {
    nodes: HashMap<String, Arc<NodeController>>,
    removing_cancels: HashMap<String, Removal>,
    attacks: HashMap<i64, AttackEntry>,
    attack_seq: i64,
    increment_seqs: HashMap<i64, i64>,
    removal_seq: u64,
}

#[derive(Debug)]
struct Inner {
    state: RwLock<State>,
    recovery_interval: Duration,
}

/// The manager's attack service.
#[derive(Debug, Clone)]
pub struct AttackService {
    inner: Arc<Inner>,
}

impl AttackService {
    /// Create a service whose dropped nodes get `recovery_interval` to
    /// reconnect before their work is redistributed.
    #[must_use]
    pub fn new(recovery_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                recovery_interval,
            }),
        }
    }

    /// Start a new attack: allocate ids, distribute increment 0 across the
    /// fleet and arm the duration and linear-ramp handlers.
    ///
    /// On a distribute failure nothing is recorded and the sequences do not
    /// advance.
    ///
    /// # Errors
    ///
    /// Returns [`core::Error::ScenarioNotFound`] or
    /// [`core::Error::EmptyAttack`] from scenario validation.
    pub async fn start_attack(
        &self,
        start: core::StartAttack,
    ) -> Result<core::AttackDetails, core::Error> {
        let mut state = self.inner.state.write().await;

        let mut operation = map_start_to_operation(&start, state.attack_seq, 0);
        distribute_start(&state, &mut operation).await?;

        state.attack_seq += 1;
        *state.increment_seqs.entry(operation.attack_id).or_insert(0) += 1;

        let increment = core::IncrementDetails {
            id: operation.increment_id,
            attack_id: operation.attack_id,
            scenarios: operation.scenarios.clone(),
        };
        let details = core::AttackDetails {
            id: operation.attack_id,
            name: start.name.clone(),
            wait_time_sec: start.wait_time_sec,
            created_at_unix: unix_now_secs(),
            duration_sec: start.duration_sec,
            const_config: start.const_config.clone(),
            linear_config: start.linear_config.clone(),
            increments: vec![increment],
        };

        let stop = Arc::new(Broadcaster::new());
        state.attacks.insert(
            operation.attack_id,
            AttackEntry {
                details: details.clone(),
                stop: Arc::clone(&stop),
            },
        );

        if let Some(duration_sec) = details.duration_sec {
            let service = self.clone();
            tokio::spawn(service.handle_duration(details.id, duration_sec, Arc::clone(&stop)));
        }
        if let Some(linear) = details.linear_config.clone() {
            let service = self.clone();
            tokio::spawn(service.handle_linear(details.id, linear, stop));
        }

        Ok(details)
    }

    /// Append an increment to an existing attack and distribute it.
    ///
    /// The increment id and pacing window are taken from the parent attack,
    /// overriding whatever the caller supplied.
    ///
    /// # Errors
    ///
    /// Returns [`core::Error::AttackNotFound`] for an unknown parent and
    /// validation errors from distribution.
    pub async fn start_increment(
        &self,
        mut start: core::OperationStart,
    ) -> Result<core::IncrementDetails, core::Error> {
        let mut state = self.inner.state.write().await;

        let (attack_id, wait_time_sec) = {
            let attack = state
                .attacks
                .get(&start.attack_id)
                .ok_or(core::Error::AttackNotFound)?;
            (attack.details.id, attack.details.wait_time_sec)
        };
        start.attack_id = attack_id;
        start.increment_id = state.increment_seqs.get(&attack_id).copied().unwrap_or(0);
        start.wait_time_sec = wait_time_sec;

        distribute_start(&state, &mut start).await?;

        *state.increment_seqs.entry(attack_id).or_insert(0) += 1;

        let increment = core::IncrementDetails {
            id: start.increment_id,
            attack_id,
            scenarios: start.scenarios.clone(),
        };
        state
            .attacks
            .get_mut(&attack_id)
            .expect("attack presence checked")
            .details
            .increments
            .push(increment.clone());

        Ok(increment)
    }

    /// Stop an attack: tell every node, signal the ramp and duration
    /// handlers and drop the record.
    ///
    /// # Errors
    ///
    /// Returns [`core::Error::AttackNotFound`] for an unknown attack.
    pub async fn stop_attack(&self, attack_id: i64) -> Result<(), core::Error> {
        let mut state = self.inner.state.write().await;
        if !state.attacks.contains_key(&attack_id) {
            return Err(core::Error::AttackNotFound);
        }

        distribute_stop(
            &state,
            core::OperationStop {
                attack_id,
                increment_id: None,
            },
        )
        .await;

        let attack = state
            .attacks
            .remove(&attack_id)
            .expect("attack presence checked");
        attack.stop.broadcast(());

        Ok(())
    }

    /// Stop a single increment; stopping the last one removes the attack.
    ///
    /// # Errors
    ///
    /// Returns [`core::Error::AttackNotFound`] or
    /// [`core::Error::IncrementNotFound`].
    pub async fn stop_increment(
        &self,
        attack_id: i64,
        increment_id: i64,
    ) -> Result<(), core::Error> {
        let mut state = self.inner.state.write().await;
        stop_increment_locked(&mut state, attack_id, increment_id).await
    }

    /// Snapshot of all live attacks.
    pub async fn get_attacks(&self) -> Vec<core::AttackDetails> {
        let state = self.inner.state.read().await;
        state
            .attacks
            .values()
            .map(|attack| attack.details.clone())
            .collect()
    }

    /// The union-by-name of scenarios advertised across connected nodes.
    pub async fn get_scenarios(&self) -> Vec<core::ScenarioDetails> {
        let state = self.inner.state.read().await;
        unique_scenarios(&state).into_values().collect()
    }

    /// Snapshot of connected nodes. Attack records carry the manager's
    /// details but keep the node's own increments view.
    pub async fn list_nodes(&self) -> Vec<core::NodeDetails> {
        let state = self.inner.state.read().await;

        state
            .nodes
            .values()
            .map(|node| {
                let mut details = node.details();
                details.attacks = details
                    .attacks
                    .iter()
                    .map(|attack| match state.attacks.get(&attack.id) {
                        Some(entry) => {
                            let mut enriched = entry.details.clone();
                            enriched.increments = attack.increments.clone();
                            enriched
                        }
                        None => attack.clone(),
                    })
                    .collect();
                details
            })
            .collect()
    }

    /// Register a node under its self-declared name.
    ///
    /// A reconnect within the recovery window cancels the pending removal,
    /// evicts the prior registration and replays its operations onto the
    /// newcomer; operations that fail to replay are compensated with a
    /// manager-side increment stop.
    ///
    /// # Errors
    ///
    /// Returns [`core::Error::NodeAlreadyExists`] when the name is taken and
    /// no removal is pending.
    pub async fn add_node(&self, node: Arc<NodeController>) -> Result<(), core::Error> {
        let mut state = self.inner.state.write().await;
        let name = node.name().to_string();

        let removal_pending = state.removing_cancels.contains_key(&name);
        if state.nodes.contains_key(&name) && !removal_pending {
            return Err(core::Error::NodeAlreadyExists);
        }

        let operations = retrieve_operations(&mut state, &name);
        for operation in operations {
            let attack_id = operation.attack_id;
            let increment_id = operation.increment_id;
            if let Err(e) = node.start_attack(operation).await {
                error!(node = %name, "impossible to start attack on node: {e}");

                if let Err(e) = stop_increment_locked(&mut state, attack_id, increment_id).await {
                    error!("impossible to stop increment: {e}");
                }
            }
        }

        state.nodes.insert(name, node);
        Ok(())
    }

    /// Begin the removal of a node: after the recovery interval without a
    /// reconnect its pending operations are redistributed to the remaining
    /// fleet and the node is unregistered.
    pub async fn remove_node(&self, node: &NodeController) {
        let mut state = self.inner.state.write().await;
        let name = node.name().to_string();

        let token = state.removal_seq;
        state.removal_seq += 1;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        state
            .removing_cancels
            .insert(name.clone(), Removal {
                token,
                _cancel: cancel_tx,
            });

        let service = self.clone();
        tokio::spawn(service.removal_timer(name, token, cancel_rx));
    }

    async fn removal_timer(self, name: String, token: u64, cancel: oneshot::Receiver<()>) {
        tokio::select! {
            // Either outcome of the channel means the removal was overtaken
            // by a reconnect.
            _ = cancel => {}
            () = tokio::time::sleep(self.inner.recovery_interval) => {
                let mut state = self.inner.state.write().await;
                let operations = retrieve_operations(&mut state, &name);

                for mut operation in operations {
                    let attack_id = operation.attack_id;
                    let increment_id = operation.increment_id;
                    if let Err(e) = distribute_start(&state, &mut operation).await {
                        error!("impossible to redistribute load: {e}");

                        if let Err(e) =
                            stop_increment_locked(&mut state, attack_id, increment_id).await
                        {
                            error!("impossible to stop increment: {e}");
                        }
                    }
                }
            }
        }

        // Clear only our own entry: after a reconnect and a further
        // disconnect inside one window, a successor timer owns a newer token.
        let mut state = self.inner.state.write().await;
        if state
            .removing_cancels
            .get(&name)
            .is_some_and(|removal| removal.token == token)
        {
            state.removing_cancels.remove(&name);
        }
    }

    async fn handle_duration(self, attack_id: i64, duration_sec: i64, stop: Arc<Broadcaster<()>>) {
        let mut sub = stop.subscribe();

        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(duration_sec.max(0) as u64)) => {
                if let Err(e) = self.stop_attack(attack_id).await {
                    error!("error stopping attack {attack_id}: {e}");
                }
            }
            _ = sub.recv() => {}
        }

        stop.unsubscribe(sub);
    }

    async fn handle_linear(
        self,
        attack_id: i64,
        config: core::LinearConfig,
        stop: Arc<Broadcaster<()>>,
    ) {
        let Some(plan) = linear_plan(&config) else {
            return;
        };
        let mut step = plan.step;
        let mut interval = plan.interval;
        let mut current = config.start_counter;
        let mut elapsed = 0.0_f64;

        let mut sub = stop.subscribe();
        loop {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs_f64(interval.max(0.0))) => {
                    if current >= config.end_counter {
                        break;
                    }

                    if config.counter_step.is_none() {
                        // Warm-up-only ramps recompute the step every tick to
                        // absorb drift against the remaining window.
                        let warm = config.warm_up_sec.unwrap_or(0) as f64;
                        step = (((config.end_counter - current) as f64) * interval
                            / (warm - elapsed))
                            .ceil() as i64;
                    } else if step > config.end_counter - current {
                        step = config.end_counter - current;
                    }

                    let scenarios: HashMap<String, i64> = config
                        .scenarios
                        .iter()
                        .map(|name| (name.clone(), step))
                        .collect();
                    let operation = core::OperationStart {
                        attack_id,
                        scenarios,
                        ..core::OperationStart::default()
                    };
                    if let Err(e) = self.start_increment(operation).await {
                        error!("error starting increment: {e}");
                        break;
                    }

                    elapsed += interval;
                    current += step;

                    if let Some(warm) = config.warm_up_sec {
                        if elapsed + interval > warm as f64 {
                            interval = warm as f64 - elapsed;
                        }
                    }
                }
                _ = sub.recv() => break,
            }
        }

        stop.unsubscribe(sub);
    }
}

/// Ramp parameters derived from a linear config.
#[derive(Debug, Clone, Copy, PartialEq)]
struct LinearPlan {
    step: i64,
    interval: f64,
}

/// Derive the initial step and tick interval for a linear ramp, or `None`
/// when neither warm-up nor step is given.
fn linear_plan(config: &core::LinearConfig) -> Option<LinearPlan> {
    let range = config.end_counter - config.start_counter;

    match (config.warm_up_sec, config.counter_step) {
        (None, None) => None,
        (Some(warm), Some(step)) => Some(LinearPlan {
            step,
            interval: warm as f64 * step as f64 / range as f64,
        }),
        (Some(warm), None) => {
            let interval = config.step_interval_sec.unwrap_or(1) as f64;
            Some(LinearPlan {
                step: ((range as f64) * interval / warm as f64).ceil() as i64,
                interval,
            })
        }
        (None, Some(step)) => Some(LinearPlan {
            step,
            interval: config.step_interval_sec.unwrap_or(1) as f64,
        }),
    }
}

/// Seed increment-0 scenarios: constant counters plus the linear start
/// counter added onto every ramped scenario.
fn map_start_to_operation(
    start: &core::StartAttack,
    attack_id: i64,
    increment_id: i64,
) -> core::OperationStart {
    let mut scenarios: HashMap<String, i64> = HashMap::new();

    if let Some(const_config) = &start.const_config {
        for (name, counter) in &const_config.scenarios {
            scenarios.insert(name.clone(), *counter);
        }
    }
    if let Some(linear_config) = &start.linear_config {
        for name in &linear_config.scenarios {
            *scenarios.entry(name.clone()).or_insert(0) += linear_config.start_counter;
        }
    }

    core::OperationStart {
        id: String::new(),
        attack_id,
        increment_id,
        wait_time_sec: start.wait_time_sec,
        scenarios,
    }
}

/// Validate, split and dispatch a start operation across the fleet.
async fn distribute_start(
    state: &State,
    start: &mut core::OperationStart,
) -> Result<(), core::Error> {
    validate_scenarios(state, &mut start.scenarios)?;
    divide_tasks(state, start).await;
    Ok(())
}

/// Drop non-positive counters in place and refuse unknown scenarios or an
/// emptied map.
fn validate_scenarios(
    state: &State,
    scenarios: &mut HashMap<String, i64>,
) -> Result<(), core::Error> {
    let unique = unique_scenarios(state);
    for name in scenarios.keys() {
        if !unique.contains_key(name) {
            return Err(core::Error::ScenarioNotFound);
        }
    }
    scenarios.retain(|_, amount| *amount > 0);

    if scenarios.is_empty() {
        return Err(core::Error::EmptyAttack);
    }
    Ok(())
}

/// Split every scenario's amount evenly across the nodes advertising it --
/// the first `remainder` nodes take one extra -- and push each node's slice
/// into its controller. Dispatch failures are logged, not rolled back.
async fn divide_tasks(state: &State, start: &core::OperationStart) {
    let node_names: Vec<&String> = state.nodes.keys().collect();
    let mut operations: HashMap<&String, core::OperationStart> = node_names
        .iter()
        .map(|name| {
            (
                *name,
                core::OperationStart {
                    id: Uuid::new_v4().to_string(),
                    attack_id: start.attack_id,
                    increment_id: start.increment_id,
                    wait_time_sec: start.wait_time_sec,
                    scenarios: HashMap::new(),
                },
            )
        })
        .collect();

    for (scenario, amount) in &start.scenarios {
        let actual: Vec<&String> = node_names
            .iter()
            .filter(|name| state.nodes[**name].advertises(scenario))
            .copied()
            .collect();
        if actual.is_empty() {
            continue;
        }

        let slices = split_amount(*amount, actual.len());
        for (name, slice) in actual.iter().zip(slices) {
            if slice != 0 {
                operations
                    .get_mut(*name)
                    .expect("operation prepared per node")
                    .scenarios
                    .insert(scenario.clone(), slice);
            }
        }
    }

    for (name, operation) in operations {
        if operation.scenarios.is_empty() {
            continue;
        }
        if let Err(e) = state.nodes[name].start_attack(operation).await {
            error!(node = %name, "impossible to start attack on node: {e}");
        }
    }
}

/// Slice `amount` across `nodes` receivers: an even split, the first
/// `amount % nodes` receivers taking one extra.
fn split_amount(amount: i64, nodes: usize) -> Vec<i64> {
    let split = amount / nodes as i64;
    let remainder = amount % nodes as i64;

    (0..nodes as i64)
        .map(|index| if index < remainder { split + 1 } else { split })
        .collect()
}

/// Send a stop to every connected node, logging per-node failures.
async fn distribute_stop(state: &State, stop: core::OperationStop) {
    for (name, node) in &state.nodes {
        if let Err(e) = node.stop_attack(stop).await {
            error!(node = %name, "impossible to stop attack on node: {e}");
        }
    }
}

async fn stop_increment_locked(
    state: &mut State,
    attack_id: i64,
    increment_id: i64,
) -> Result<(), core::Error> {
    let position = {
        let attack = state
            .attacks
            .get(&attack_id)
            .ok_or(core::Error::AttackNotFound)?;
        attack
            .details
            .increments
            .iter()
            .position(|inc| inc.id == increment_id)
            .ok_or(core::Error::IncrementNotFound)?
    };

    distribute_stop(
        state,
        core::OperationStop {
            attack_id,
            increment_id: Some(increment_id),
        },
    )
    .await;

    let attack = state
        .attacks
        .get_mut(&attack_id)
        .expect("attack presence checked");
    if attack.details.increments.len() > 1 {
        attack.details.increments.remove(position);
    } else {
        state.attacks.remove(&attack_id);
    }

    Ok(())
}

/// Synthesize the node's pending operations back into starts from its
/// mirror, then unregister it. The replayed operations intentionally carry
/// no operation id; a fresh one is generated if they go back through
/// distribution.
fn retrieve_operations(state: &mut State, name: &str) -> Vec<core::OperationStart> {
    let mut operations = Vec::new();

    if let Some(node) = state.nodes.get(name) {
        let details = node.details();
        for attack in &details.attacks {
            let wait_time_sec = state
                .attacks
                .get(&attack.id)
                .map_or(0.0, |entry| entry.details.wait_time_sec);

            for increment in &attack.increments {
                operations.push(core::OperationStart {
                    id: String::new(),
                    attack_id: attack.id,
                    increment_id: increment.id,
                    wait_time_sec,
                    scenarios: increment.scenarios.clone(),
                });
            }
        }

        state.removing_cancels.remove(name);
        state.nodes.remove(name);
    }

    operations
}

fn unique_scenarios(state: &State) -> HashMap<String, core::ScenarioDetails> {
    let mut unique = HashMap::new();
    for node in state.nodes.values() {
        for (name, details) in node.scenarios() {
            unique.insert(name.clone(), details.clone());
        }
    }
    unique
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::core::Operation;

    fn scenario_map(names: &[&str]) -> HashMap<String, core::ScenarioDetails> {
        names
            .iter()
            .map(|name| {
                (
                    (*name).to_string(),
                    core::ScenarioDetails {
                        name: (*name).to_string(),
                        description: format!("{name} scenario"),
                    },
                )
            })
            .collect()
    }

    /// A registered node whose outbound stream is a plain channel the test
    /// can drain.
    struct TestNode {
        controller: Arc<NodeController>,
        ops_rx: mpsc::Receiver<Operation>,
        cancel: CancellationToken,
    }

    impl TestNode {
        async fn join(service: &AttackService, name: &str, scenarios: &[&str]) -> Self {
            let (ops_tx, ops_rx) = mpsc::channel(1);
            let controller = Arc::new(NodeController::new(
                name.to_string(),
                scenario_map(scenarios),
                ops_tx,
                64,
                Duration::from_secs(30),
            ));
            let cancel = CancellationToken::new();
            Arc::clone(&controller).start(cancel.clone());
            service
                .add_node(Arc::clone(&controller))
                .await
                .expect("register node");

            Self {
                controller,
                ops_rx,
                cancel,
            }
        }

        /// Receive the next delivered operation and acknowledge it.
        async fn next_op(&mut self) -> Operation {
            let op = tokio::time::timeout(Duration::from_secs(2), self.ops_rx.recv())
                .await
                .expect("operation delivered in time")
                .expect("ops channel open");
            self.controller.ack_operation();
            op
        }
    }

    impl Drop for TestNode {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    fn const_attack(name: &str, scenarios: &[(&str, i64)]) -> core::StartAttack {
        core::StartAttack {
            name: name.to_string(),
            wait_time_sec: 1.0,
            duration_sec: None,
            const_config: Some(core::ConstConfig {
                scenarios: scenarios
                    .iter()
                    .map(|(n, c)| ((*n).to_string(), *c))
                    .collect(),
            }),
            linear_config: None,
        }
    }

    #[tokio::test]
    async fn start_attack_delivers_operation_to_the_node() {
        let service = AttackService::new(Duration::from_secs(60));
        let mut node = TestNode::join(&service, "n1", &["http", "tcp"]).await;

        let details = service
            .start_attack(const_attack("a", &[("http", 4)]))
            .await
            .expect("start attack");
        assert_eq!(details.id, 0);
        assert_eq!(details.increments.len(), 1);
        assert_eq!(details.increments[0].id, 0);
        assert_eq!(details.increments[0].scenarios["http"], 4);

        let Operation::Start(op) = node.next_op().await else {
            panic!("expected a start operation");
        };
        assert_eq!(op.attack_id, 0);
        assert_eq!(op.increment_id, 0);
        assert_eq!(op.scenarios["http"], 4);
        assert!(!op.id.is_empty());
    }

    #[tokio::test]
    async fn split_gives_the_first_remainder_nodes_one_extra() {
        let service = AttackService::new(Duration::from_secs(60));
        let mut n1 = TestNode::join(&service, "n1", &["http"]).await;
        let mut n2 = TestNode::join(&service, "n2", &["http"]).await;
        let mut n3 = TestNode::join(&service, "n3", &["http"]).await;

        service
            .start_attack(const_attack("a", &[("http", 7)]))
            .await
            .expect("start attack");

        let mut slices = Vec::new();
        for node in [&mut n1, &mut n2, &mut n3] {
            let Operation::Start(op) = node.next_op().await else {
                panic!("expected a start operation");
            };
            slices.push(op.scenarios["http"]);
        }

        slices.sort_unstable();
        assert_eq!(slices, vec![2, 2, 3]);
    }

    #[tokio::test]
    async fn scenarios_filtered_to_nothing_refuse_as_empty_attack() {
        let service = AttackService::new(Duration::from_secs(60));
        let _node = TestNode::join(&service, "n1", &["http"]).await;

        let err = service
            .start_attack(const_attack("a", &[("http", 0)]))
            .await
            .expect_err("all counters dropped");
        assert_eq!(err, core::Error::EmptyAttack);

        let err = service
            .start_attack(const_attack("a", &[("gopher", 1)]))
            .await
            .expect_err("scenario advertised nowhere");
        assert_eq!(err, core::Error::ScenarioNotFound);

        // Failed starts never advance the sequence.
        let details = service
            .start_attack(const_attack("a", &[("http", 1)]))
            .await
            .expect("start attack");
        assert_eq!(details.id, 0);
    }

    #[tokio::test]
    async fn ids_stay_monotone_across_stops() {
        let service = AttackService::new(Duration::from_secs(60));
        let mut node = TestNode::join(&service, "n1", &["http"]).await;

        let first = service
            .start_attack(const_attack("a", &[("http", 1)]))
            .await
            .expect("first attack");
        node.next_op().await;
        let second = service
            .start_attack(const_attack("b", &[("http", 1)]))
            .await
            .expect("second attack");
        node.next_op().await;

        service.stop_attack(first.id).await.expect("stop first");
        node.next_op().await;

        let third = service
            .start_attack(const_attack("c", &[("http", 1)]))
            .await
            .expect("third attack");

        assert_eq!((first.id, second.id, third.id), (0, 1, 2));
    }

    #[tokio::test]
    async fn stop_attack_restores_prior_state() {
        let service = AttackService::new(Duration::from_secs(60));
        let mut node = TestNode::join(&service, "n1", &["http"]).await;

        let details = service
            .start_attack(const_attack("a", &[("http", 2)]))
            .await
            .expect("start attack");
        node.next_op().await;

        service.stop_attack(details.id).await.expect("stop attack");
        let Operation::Stop(stop) = node.next_op().await else {
            panic!("expected a stop operation");
        };
        assert_eq!(stop.attack_id, details.id);
        assert_eq!(stop.increment_id, None);

        assert!(service.get_attacks().await.is_empty());
        assert_eq!(
            service.stop_attack(details.id).await,
            Err(core::Error::AttackNotFound)
        );
    }

    #[tokio::test]
    async fn stopping_the_last_increment_drops_the_attack() {
        let service = AttackService::new(Duration::from_secs(60));
        let mut node = TestNode::join(&service, "n1", &["http"]).await;

        let details = service
            .start_attack(const_attack("a", &[("http", 2)]))
            .await
            .expect("start attack");
        node.next_op().await;

        let increment = service
            .start_increment(core::OperationStart {
                attack_id: details.id,
                scenarios: [("http".to_string(), 3)].into_iter().collect(),
                ..core::OperationStart::default()
            })
            .await
            .expect("start increment");
        assert_eq!(increment.id, 1);
        node.next_op().await;

        service
            .stop_increment(details.id, increment.id)
            .await
            .expect("stop increment 1");
        node.next_op().await;
        service
            .stop_increment(details.id, 0)
            .await
            .expect("stop increment 0");

        assert!(service.get_attacks().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_node_names_are_refused_while_active() {
        let service = AttackService::new(Duration::from_secs(60));
        let _node = TestNode::join(&service, "n1", &["http"]).await;

        let (ops_tx, _ops_rx) = mpsc::channel(1);
        let twin = Arc::new(NodeController::new(
            "n1".to_string(),
            scenario_map(&["http"]),
            ops_tx,
            64,
            Duration::from_secs(30),
        ));

        assert_eq!(
            service.add_node(twin).await,
            Err(core::Error::NodeAlreadyExists)
        );
    }

    #[tokio::test]
    async fn reconnect_within_the_window_replays_pending_operations() {
        let service = AttackService::new(Duration::from_secs(60));
        let mut node = TestNode::join(&service, "n1", &["http"]).await;

        service
            .start_attack(const_attack("a", &[("http", 4)]))
            .await
            .expect("start attack");
        node.next_op().await;

        service.remove_node(&node.controller).await;
        drop(node);

        // Reconnect under the same name, well inside the window.
        let mut revived = TestNode::join(&service, "n1", &["http"]).await;
        let Operation::Start(op) = revived.next_op().await else {
            panic!("expected the replayed start");
        };
        assert_eq!(op.attack_id, 0);
        assert_eq!(op.scenarios["http"], 4);

        let nodes = service.list_nodes().await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "n1");
        assert_eq!(nodes[0].attacks.len(), 1);
    }

    #[tokio::test]
    async fn expiry_of_the_window_redistributes_to_the_fleet() {
        let service = AttackService::new(Duration::from_millis(100));
        let mut n1 = TestNode::join(&service, "n1", &["http"]).await;
        let mut n2 = TestNode::join(&service, "n2", &["http"]).await;

        service
            .start_attack(const_attack("a", &[("http", 4)]))
            .await
            .expect("start attack");
        let Operation::Start(op1) = n1.next_op().await else {
            panic!("expected a start operation");
        };
        let Operation::Start(op2) = n2.next_op().await else {
            panic!("expected a start operation");
        };
        assert_eq!(op1.scenarios["http"] + op2.scenarios["http"], 4);
        let lost = op1.scenarios["http"];

        service.remove_node(&n1.controller).await;
        drop(n1);
        tokio::time::sleep(Duration::from_millis(250)).await;

        // The survivor inherits the dropped node's slice.
        let Operation::Start(redistributed) = n2.next_op().await else {
            panic!("expected the redistributed start");
        };
        assert_eq!(redistributed.scenarios["http"], lost);

        let nodes = service.list_nodes().await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "n2");
    }

    #[tokio::test]
    async fn linear_ramp_appends_increments_until_the_end_counter() {
        let service = AttackService::new(Duration::from_secs(60));
        let mut node = TestNode::join(&service, "n1", &["http"]).await;

        let details = service
            .start_attack(core::StartAttack {
                name: "ramp".to_string(),
                wait_time_sec: 1.0,
                duration_sec: None,
                const_config: None,
                linear_config: Some(core::LinearConfig {
                    warm_up_sec: None,
                    start_counter: 1,
                    end_counter: 6,
                    counter_step: Some(5),
                    step_interval_sec: Some(1),
                    scenarios: vec!["http".to_string()],
                }),
            })
            .await
            .expect("start ramp");
        let Operation::Start(initial) = node.next_op().await else {
            panic!("expected the initial increment");
        };
        assert_eq!(initial.scenarios["http"], 1);

        // One tick later the ramp tops the attack up to the end counter.
        let Operation::Start(ramped) = node.next_op().await else {
            panic!("expected the ramped increment");
        };
        assert_eq!(ramped.scenarios["http"], 5);

        let attacks = service.get_attacks().await;
        assert_eq!(attacks.len(), 1);
        assert_eq!(attacks[0].id, details.id);
        assert_eq!(attacks[0].increments.len(), 2);

        // The ramp is done; no further increment arrives.
        tokio::time::sleep(Duration::from_millis(1_300)).await;
        assert_eq!(service.get_attacks().await[0].increments.len(), 2);
    }

    #[tokio::test]
    async fn duration_stops_the_attack() {
        let service = AttackService::new(Duration::from_secs(60));
        let mut node = TestNode::join(&service, "n1", &["http"]).await;

        service
            .start_attack(core::StartAttack {
                duration_sec: Some(1),
                ..const_attack("a", &[("http", 1)])
            })
            .await
            .expect("start attack");
        node.next_op().await;

        tokio::time::sleep(Duration::from_millis(1_300)).await;
        assert!(service.get_attacks().await.is_empty());
        let Operation::Stop(stop) = node.next_op().await else {
            panic!("expected the duration stop");
        };
        assert_eq!(stop.increment_id, None);
    }

    #[test]
    fn linear_plan_covers_all_branches() {
        let base = core::LinearConfig {
            warm_up_sec: None,
            start_counter: 2,
            end_counter: 12,
            counter_step: None,
            step_interval_sec: None,
            scenarios: vec!["http".to_string()],
        };

        assert_eq!(linear_plan(&base), None);

        // Both warm-up and step: the interval spreads the steps over the
        // window.
        let plan = linear_plan(&core::LinearConfig {
            warm_up_sec: Some(10),
            counter_step: Some(2),
            ..base.clone()
        })
        .expect("plan");
        assert_eq!(plan.step, 2);
        assert!((plan.interval - 2.0).abs() < f64::EPSILON);

        // Warm-up only: the step covers the range at the default interval.
        let plan = linear_plan(&core::LinearConfig {
            warm_up_sec: Some(4),
            ..base.clone()
        })
        .expect("plan");
        assert_eq!(plan.step, 3);
        assert!((plan.interval - 1.0).abs() < f64::EPSILON);

        // Step only: the explicit interval is used as-is.
        let plan = linear_plan(&core::LinearConfig {
            counter_step: Some(3),
            step_interval_sec: Some(2),
            ..base
        })
        .expect("plan");
        assert_eq!(plan.step, 3);
        assert!((plan.interval - 2.0).abs() < f64::EPSILON);
    }

    proptest! {
        #[test]
        fn split_preserves_the_total(amount in 1_i64..=10_000, nodes in 1_usize..=32) {
            let slices = split_amount(amount, nodes);

            prop_assert_eq!(slices.iter().sum::<i64>(), amount);

            // The slices differ by at most one, extras at the front.
            let max = slices.iter().max().expect("at least one slice");
            let min = slices.iter().min().expect("at least one slice");
            prop_assert!(max - min <= 1);
            prop_assert!(slices.windows(2).all(|pair| pair[0] >= pair[1]));
        }
    }

    #[test]
    fn ramp_steps_clamp_to_the_end_counter() {
        // start=1, end=11, step=3: three full steps then a final single.
        let mut current = 1_i64;
        let end = 11_i64;
        let step = 3_i64;
        let mut sizes = Vec::new();

        while current < end {
            let effective = step.min(end - current);
            sizes.push(effective);
            current += effective;
        }

        assert_eq!(sizes, vec![3, 3, 3, 1]);
    }

    #[tokio::test]
    async fn increment_zero_sums_const_and_linear_start() {
        let service = AttackService::new(Duration::from_secs(60));
        let mut node = TestNode::join(&service, "n1", &["http"]).await;

        service
            .start_attack(core::StartAttack {
                name: "mixed".to_string(),
                wait_time_sec: 1.0,
                duration_sec: None,
                const_config: Some(core::ConstConfig {
                    scenarios: [("http".to_string(), 4)].into_iter().collect(),
                }),
                linear_config: Some(core::LinearConfig {
                    warm_up_sec: None,
                    start_counter: 2,
                    end_counter: 3,
                    counter_step: Some(1),
                    step_interval_sec: Some(60),
                    scenarios: vec!["http".to_string()],
                }),
            })
            .await
            .expect("start attack");

        let Operation::Start(op) = node.next_op().await else {
            panic!("expected a start operation");
        };
        assert_eq!(op.scenarios["http"], 6);
    }
}
