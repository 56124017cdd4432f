//! Core data model shared by the manager and worker sides.
//!
//! Everything here is transport-free: the wire protocol in [`crate::proto`]
//! and the REST DTOs in the manager's API module both map into these types.

use std::collections::HashMap;

/// Metadata about a scenario: its name and a human-readable description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioDetails {
    /// Name of the scenario, unique per node.
    pub name: String,
    /// Description of the scenario.
    pub description: String,
}

/// Configuration for a constant attack: a fixed target of concurrent virtual
/// users per scenario across the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConstConfig {
    /// Scenario name to target user count.
    pub scenarios: HashMap<String, i64>,
}

/// Configuration for a linear ramp: the fleet-wide user count grows from
/// `start_counter` to `end_counter` in steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Wall-clock window over which the ramp should complete, in seconds.
    pub warm_up_sec: Option<i64>,
    /// Counter value of the initial increment.
    pub start_counter: i64,
    /// Counter value at which the ramp stops. Must exceed `start_counter`.
    pub end_counter: i64,
    /// Users added per step.
    pub counter_step: Option<i64>,
    /// Seconds between steps.
    pub step_interval_sec: Option<i64>,
    /// Scenarios the ramp applies to.
    pub scenarios: Vec<String>,
}

/// Request to start a new attack.
#[derive(Debug, Clone, PartialEq)]
pub struct StartAttack {
    /// Name of the attack.
    pub name: String,
    /// Window over which a worker paces the startup of an increment's user
    /// cohort, in seconds.
    pub wait_time_sec: f64,
    /// Attack duration in seconds. `None` means no duration limit.
    pub duration_sec: Option<i64>,
    /// Constant attack configuration.
    pub const_config: Option<ConstConfig>,
    /// Linear ramp configuration.
    pub linear_config: Option<LinearConfig>,
}

/// A discrete bump of virtual users within an attack.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IncrementDetails {
    /// Increment id, monotone within its attack.
    pub id: i64,
    /// Owning attack id.
    pub attack_id: i64,
    /// Scenario name to user count for this increment.
    pub scenarios: HashMap<String, i64>,
}

/// Full state of an attack as the manager sees it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttackDetails {
    /// Attack id, monotone over the manager's lifetime.
    pub id: i64,
    /// Name of the attack.
    pub name: String,
    /// Pacing window in seconds, see [`StartAttack::wait_time_sec`].
    pub wait_time_sec: f64,
    /// Creation time, seconds since the Unix epoch.
    pub created_at_unix: u64,
    /// Attack duration in seconds, if bounded.
    pub duration_sec: Option<i64>,
    /// Constant attack configuration.
    pub const_config: Option<ConstConfig>,
    /// Linear ramp configuration.
    pub linear_config: Option<LinearConfig>,
    /// Increments of this attack, in creation order.
    pub increments: Vec<IncrementDetails>,
}

/// State of a worker node as the manager sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDetails {
    /// Self-declared node name. Two simultaneously-connected nodes never
    /// share a name.
    pub name: String,
    /// Whether the node's operation pipeline is running.
    pub is_active: bool,
    /// Scenarios the node advertised at handshake.
    pub scenarios: Vec<ScenarioDetails>,
    /// Attacks the node is executing.
    pub attacks: Vec<AttackDetails>,
}

/// Command to start an increment on a worker.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OperationStart {
    /// Globally-unique token workers use to detect exact-duplicate
    /// re-deliveries.
    pub id: String,
    /// Attack to start.
    pub attack_id: i64,
    /// Increment to start.
    pub increment_id: i64,
    /// Pacing window in seconds.
    pub wait_time_sec: f64,
    /// Scenario name to user count, this node's slice only.
    pub scenarios: HashMap<String, i64>,
}

/// Command to stop an attack or a single increment on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationStop {
    /// Attack to stop.
    pub attack_id: i64,
    /// Increment to stop. `None` stops the whole attack.
    pub increment_id: Option<i64>,
}

/// The unit of coordination sent from manager to node.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Start an increment.
    Start(OperationStart),
    /// Stop an attack or increment.
    Stop(OperationStop),
    /// Instruct the worker to terminate the stream.
    Kill,
}

/// Error kinds surfaced by the coordination core.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No active node can take the operation.
    #[error("there are no active nodes to perform the attack")]
    NoActiveNodes,
    /// The attack id is unknown.
    #[error("attack not found")]
    AttackNotFound,
    /// The increment id is unknown within its attack.
    #[error("increment not found")]
    IncrementNotFound,
    /// A named scenario is advertised by no connected node.
    #[error("scenario not found")]
    ScenarioNotFound,
    /// A node with that name is already registered and not pending removal.
    #[error("node already exists")]
    NodeAlreadyExists,
    /// No scenario with a positive counter remained after validation.
    #[error("empty attack configuration")]
    EmptyAttack,
    /// The attack configuration is contradictory.
    #[error("bad attack configuration")]
    BadConfig,
    /// A recurring job could not be scheduled.
    #[error("cannot schedule job")]
    BrokenScheduler,
    /// No job is registered under the given id.
    #[error("job not found")]
    JobNotFound,
    /// The target responded outside the 2xx-3xx range.
    #[error("unacceptable status code {0}")]
    UnacceptableCode(u16),
    /// A scenario failed while executing its commands.
    #[error("scenario execution violation: {0}")]
    ScenarioExecutionViolation(String),
}
