//! The process-wide scenario registry for worker nodes.
//!
//! A scenario is a named workload routine: given a cancellation context and
//! an HTTP caller it performs one pass of work against the target service.
//! The registry is advertised to the manager at handshake as name and
//! description only; the commands stay on the worker.

use std::{collections::HashMap, fmt, sync::Arc};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::{caller::Caller, core};

/// The executable capability of a scenario.
pub type Commands =
    Arc<dyn Fn(CancellationToken, Arc<Caller>) -> BoxFuture<'static, Result<(), core::Error>> + Send + Sync>;

/// A named workload routine runnable by a virtual user.
#[derive(Clone)]
pub struct Scenario {
    /// Name of the scenario, unique within the registry.
    pub name: String,
    /// Description of the scenario's purpose.
    pub description: String,
    /// One pass of work against the target service.
    pub commands: Commands,
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl Scenario {
    /// Create a new scenario.
    pub fn new<F>(name: &str, description: &str, commands: F) -> Self
    where
        F: Fn(CancellationToken, Arc<Caller>) -> BoxFuture<'static, Result<(), core::Error>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            commands: Arc::new(commands),
        }
    }

    /// The advertised form of this scenario.
    #[must_use]
    pub fn details(&self) -> core::ScenarioDetails {
        core::ScenarioDetails {
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }
}

const TEST_HTTP: &str = "test_http";

/// The scenarios available on this worker, keyed by name.
#[must_use]
pub fn registry() -> HashMap<String, Scenario> {
    let mut scenarios = HashMap::new();
    for scenario in [test_http()] {
        scenarios.insert(scenario.name.clone(), scenario);
    }
    scenarios
}

fn test_http() -> Scenario {
    Scenario::new(TEST_HTTP, "test http", |ctx, caller| {
        Box::pin(async move { caller.test.test(&ctx).await.map_err(Into::into) })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_contains_test_http() {
        let scenarios = registry();
        let scenario = scenarios.get(TEST_HTTP).expect("test_http registered");
        assert_eq!(scenario.details().name, TEST_HTTP);
    }
}
