//! REST request and response bodies, their validation and the error
//! envelope.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core;

/// Request body for `POST /attacks`.
#[derive(Debug, Clone, Deserialize)]
pub struct StartAttackRequestBody {
    /// Name of the attack.
    pub name: String,
    /// Pacing window in seconds.
    pub wait_time_sec: f64,
    /// Attack duration in seconds.
    #[serde(default)]
    pub duration_sec: Option<i64>,
    /// Constant attack configuration.
    #[serde(default)]
    pub const_config: Option<ConstConfigBody>,
    /// Linear ramp configuration.
    #[serde(default)]
    pub linear_config: Option<LinearConfigBody>,
}

/// Constant configuration body, also used in responses.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConstConfigBody {
    /// Scenario name to fleet-wide user count.
    pub scenarios: HashMap<String, i64>,
}

/// Linear ramp configuration body, also used in responses.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LinearConfigBody {
    /// Ramp window in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm_up_sec: Option<i64>,
    /// Counter value of the initial increment.
    pub start_counter: i64,
    /// Counter value at which the ramp stops.
    pub end_counter: i64,
    /// Users added per step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter_step: Option<i64>,
    /// Seconds between steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_interval_sec: Option<i64>,
    /// Scenarios the ramp applies to.
    pub scenarios: Vec<String>,
}

/// Request body for `POST /attacks/:id/increments`.
#[derive(Debug, Clone, Deserialize)]
pub struct StartIncrementRequestBody {
    /// Scenario name to user count.
    #[serde(default)]
    pub scenarios: HashMap<String, i64>,
}

/// A scenario as presented to clients.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioInfo {
    /// Name of the scenario.
    pub name: String,
    /// Description of the scenario.
    pub description: String,
}

/// One scenario counter within an increment.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioCounter {
    /// Scenario name.
    pub scenario: String,
    /// User count.
    pub counter: i64,
}

/// An increment as presented to clients.
#[derive(Debug, Clone, Serialize)]
pub struct IncrementInfo {
    /// Increment id.
    pub id: i64,
    /// Scenario counters, sorted by scenario name.
    pub scenarios: Vec<ScenarioCounter>,
}

/// An attack as presented to clients.
#[derive(Debug, Clone, Serialize)]
pub struct AttackInfo {
    /// Attack id.
    pub id: i64,
    /// Attack name.
    pub name: String,
    /// Pacing window in seconds.
    pub wait_time_sec: f64,
    /// Creation time, seconds since the Unix epoch.
    pub created_at: u64,
    /// Attack duration in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<i64>,
    /// Constant configuration.
    pub const_config: Option<ConstConfigBody>,
    /// Linear ramp configuration.
    pub linear_config: Option<LinearConfigBody>,
    /// Increments, sorted by id.
    pub increments: Vec<IncrementInfo>,
}

/// A node as presented to clients.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    /// Node name.
    pub name: String,
    /// Advertised scenario names, sorted.
    pub scenarios: Vec<String>,
    /// Attacks on this node, sorted by id.
    pub attacks: Vec<AttackInfo>,
    /// Whether the node's pipeline is running.
    pub is_active: bool,
}

/// One field-validation failure.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ValidationError {
    /// The violated rule.
    pub tag: String,
    /// The offending field.
    pub field: String,
    /// The rule's parameter, when it has one.
    pub param: String,
}

impl ValidationError {
    fn new(tag: &str, field: &str, param: &str) -> Self {
        Self {
            tag: tag.to_string(),
            field: field.to_string(),
            param: param.to_string(),
        }
    }
}

/// Boundary error kinds of the REST layer itself.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryError {
    /// The request requires a body and none was sent.
    #[error("request body is required")]
    RequestBodyRequired,
    /// The request body did not parse.
    #[error("error when body parsing")]
    ParseBody,
    /// A path parameter did not parse.
    #[error("error when path param parsing")]
    InvalidPathParam,
}

/// `{status: "OK", data}` envelope.
pub fn ok_response(data: impl Serialize) -> serde_json::Value {
    json!({ "status": "OK", "data": data })
}

/// `{status: "OK"}` envelope for bodyless successes.
pub fn ok_empty() -> serde_json::Value {
    json!({ "status": "OK" })
}

/// `{status: "ERROR", data: {reason}}` envelope.
pub fn error_response(reason: &str) -> serde_json::Value {
    json!({ "status": "ERROR", "data": { "reason": reason } })
}

/// `{status: "ERROR"}` envelope for opaque failures.
pub fn error_empty() -> serde_json::Value {
    json!({ "status": "ERROR" })
}

/// `{status: "ERROR", data: {errors}}` envelope for validation failures.
pub fn validation_response(errors: &[ValidationError]) -> serde_json::Value {
    json!({ "status": "ERROR", "data": { "errors": errors } })
}

/// Map a core error kind onto its fixed HTTP status.
#[must_use]
pub fn core_error_status(err: &core::Error) -> u16 {
    match err {
        core::Error::AttackNotFound
        | core::Error::IncrementNotFound
        | core::Error::ScenarioNotFound => 404,
        core::Error::EmptyAttack | core::Error::BadConfig => 400,
        _ => 500,
    }
}

/// Per-field validation of a start-attack body. Cross-field rules live in
/// [`StartAttackRequestBody::to_core`].
#[must_use]
pub fn validate_start_attack(body: &StartAttackRequestBody) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if body.name.is_empty() {
        errors.push(ValidationError::new("required", "name", ""));
    }
    if body.wait_time_sec < 0.1 {
        errors.push(ValidationError::new("min", "wait_time_sec", "0.1"));
    }
    if body.wait_time_sec > 30.0 {
        errors.push(ValidationError::new("max", "wait_time_sec", "30"));
    }
    if let Some(duration) = body.duration_sec {
        if duration < 1 {
            errors.push(ValidationError::new("min", "duration_sec", "1"));
        }
        if duration > 2_592_000 {
            errors.push(ValidationError::new("max", "duration_sec", "2592000"));
        }
    }
    if let Some(const_config) = &body.const_config {
        if const_config.scenarios.is_empty() {
            errors.push(ValidationError::new("required", "const_config.scenarios", ""));
        }
    }
    if let Some(linear) = &body.linear_config {
        if linear.start_counter < 1 {
            errors.push(ValidationError::new("min", "start_counter", "1"));
        }
        if linear.end_counter < 1 {
            errors.push(ValidationError::new("min", "end_counter", "1"));
        }
        if let Some(warm_up) = linear.warm_up_sec {
            if warm_up < 1 {
                errors.push(ValidationError::new("min", "warm_up_sec", "1"));
            }
        }
        if let Some(step) = linear.counter_step {
            if step < 1 {
                errors.push(ValidationError::new("min", "counter_step", "1"));
            }
        }
        if let Some(interval) = linear.step_interval_sec {
            if interval < 1 {
                errors.push(ValidationError::new("min", "step_interval_sec", "1"));
            }
        }
        if linear.scenarios.is_empty() {
            errors.push(ValidationError::new("required", "linear_config.scenarios", ""));
        }
    }

    errors
}

impl StartAttackRequestBody {
    /// Translate into core form, enforcing the cross-field configuration
    /// rules.
    ///
    /// # Errors
    ///
    /// Returns [`core::Error::BadConfig`] when the configuration is
    /// contradictory.
    pub fn to_core(&self) -> Result<core::StartAttack, core::Error> {
        if self.const_config.is_none() && self.linear_config.is_none() {
            return Err(core::Error::BadConfig);
        }

        let const_config = self.const_config.as_ref().map(|config| core::ConstConfig {
            scenarios: config.scenarios.clone(),
        });

        let linear_config = match &self.linear_config {
            None => None,
            Some(linear) => {
                if linear.warm_up_sec.is_none() && linear.counter_step.is_none() {
                    return Err(core::Error::BadConfig);
                }
                if linear.end_counter <= linear.start_counter {
                    return Err(core::Error::BadConfig);
                }
                if let (Some(warm_up), Some(step)) = (linear.warm_up_sec, linear.counter_step) {
                    // Integer division on purpose: sub-second intervals are
                    // rejected before any rounding could hide them.
                    let interval = (warm_up * step) / (linear.end_counter - linear.start_counter);
                    if interval < 1 {
                        return Err(core::Error::BadConfig);
                    }
                }
                if let (Some(warm_up), Some(duration)) = (linear.warm_up_sec, self.duration_sec) {
                    if warm_up >= duration {
                        return Err(core::Error::BadConfig);
                    }
                }
                if let (Some(warm_up), Some(interval)) =
                    (linear.warm_up_sec, linear.step_interval_sec)
                {
                    if interval > warm_up {
                        return Err(core::Error::BadConfig);
                    }
                }
                if let (Some(duration), Some(interval)) =
                    (self.duration_sec, linear.step_interval_sec)
                {
                    if interval >= duration {
                        return Err(core::Error::BadConfig);
                    }
                }

                Some(core::LinearConfig {
                    warm_up_sec: linear.warm_up_sec,
                    start_counter: linear.start_counter,
                    end_counter: linear.end_counter,
                    counter_step: linear.counter_step,
                    step_interval_sec: linear.step_interval_sec,
                    scenarios: linear.scenarios.clone(),
                })
            }
        };

        Ok(core::StartAttack {
            name: self.name.clone(),
            wait_time_sec: self.wait_time_sec,
            duration_sec: self.duration_sec,
            const_config,
            linear_config,
        })
    }
}

impl StartIncrementRequestBody {
    /// Translate into a start operation for `attack_id`. The increment id
    /// and pacing window are filled in by the attack service.
    #[must_use]
    pub fn to_core(&self, attack_id: i64) -> core::OperationStart {
        core::OperationStart {
            attack_id,
            scenarios: self.scenarios.clone(),
            ..core::OperationStart::default()
        }
    }
}
