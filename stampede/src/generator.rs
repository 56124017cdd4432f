//! The worker-side load generator.
//!
//! ## Metrics
//!
//! `active_users`: Number of users currently executing a scenario pass
//!
//! Each attack owns a scheduler job that re-executes its user pool every
//! `wait_time_sec` seconds; within one execution, user startups are spread
//! evenly over the window so the steady state is each user firing once per
//! window.

use std::{collections::HashMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::warn;

use crate::{
    caller::{self, Caller, HttpClient},
    core,
    scenario::Scenario,
};

pub mod user;

use user::User;

/// Configuration of the generator.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Number of users sharing a single HTTP client.
    pub users_per_client: i64,
    /// Lower bound of the per-client idle-connection timeout, in seconds.
    pub min_idle_conn_timeout_sec: u64,
    /// Upper bound of the per-client idle-connection timeout, in seconds.
    pub max_idle_conn_timeout_sec: u64,
}

/// Errors produced by [`Generator`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The pacing job for a new attack could not be registered.
    #[error("failed to schedule attack {attack}: {source}")]
    Schedule {
        /// The attack whose job failed to register.
        attack: i64,
        /// The scheduler error.
        source: stampede_schedule::Error,
    },
    /// The exact same operation was already applied.
    #[error("attack {attack}, increment {increment} within the operation {operation} has already been created")]
    DuplicateOperation {
        /// The attack named by the operation.
        attack: i64,
        /// The increment named by the operation.
        increment: i64,
        /// The duplicated operation id.
        operation: String,
    },
    /// The attack or increment to stop is unknown.
    #[error("attack not found")]
    AttackNotFound,
    /// The attack's pacing job could not be removed.
    #[error("unable to remove attack job: {0}")]
    RemoveJob(stampede_schedule::Error),
    /// An HTTP client could not be constructed.
    #[error(transparent)]
    Client(#[from] caller::Error),
}

#[derive(Debug)]
struct Increment {
    operation_id: String,
    users: Vec<Arc<User>>,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct Attack {
    increments: HashMap<i64, Increment>,
    cancel: CancellationToken,
    job: stampede_schedule::JobId,
}

/// The load generator: spawns and paces virtual users per attack increment.
#[derive(Debug, Clone)]
pub struct Generator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    attacks: RwLock<HashMap<i64, Attack>>,
    scheduler: stampede_schedule::Scheduler,
    root: CancellationToken,
    drain: TaskTracker,
    scenarios: HashMap<String, Scenario>,
    config: Config,
}

impl Generator {
    /// Create a new generator over the given scenario registry.
    #[must_use]
    pub fn new(config: Config, scenarios: HashMap<String, Scenario>) -> Self {
        Self {
            inner: Arc::new(Inner {
                attacks: RwLock::new(HashMap::new()),
                scheduler: stampede_schedule::Scheduler::new(),
                root: CancellationToken::new(),
                drain: TaskTracker::new(),
                scenarios,
                config,
            }),
        }
    }

    /// Start an attack increment, creating the attack's pacing job on first
    /// sight of the attack id.
    ///
    /// Unknown scenario names are logged and skipped rather than failing the
    /// operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateOperation`] when the increment already
    /// exists under the same operation id, [`Error::Schedule`] when the
    /// pacing job cannot be registered and [`Error::Client`] when an HTTP
    /// client cannot be built.
    pub async fn start_attack(&self, start: core::OperationStart) -> Result<(), Error> {
        let mut attacks = self.inner.attacks.write().await;

        if !attacks.contains_key(&start.attack_id) {
            let attack_id = start.attack_id;
            let wait_time_sec = start.wait_time_sec;
            let generator = self.clone();
            let job = self
                .inner
                .scheduler
                .new_job(wait_time_sec, move || {
                    let generator = generator.clone();
                    async move {
                        generator.execute_attack(attack_id, wait_time_sec).await;
                    }
                })
                .map_err(|source| Error::Schedule {
                    attack: attack_id,
                    source,
                })?;

            attacks.insert(
                attack_id,
                Attack {
                    increments: HashMap::new(),
                    cancel: self.inner.root.child_token(),
                    job,
                },
            );
        }
        let attack = attacks
            .get_mut(&start.attack_id)
            .expect("attack ensured above");

        // Only the exact operation id counts as a re-delivery; the same
        // increment arriving under any other operation id overwrites the
        // previous cohort.
        if let Some(increment) = attack.increments.get(&start.increment_id) {
            if increment.operation_id == start.id {
                return Err(Error::DuplicateOperation {
                    attack: start.attack_id,
                    increment: start.increment_id,
                    operation: start.id,
                });
            }
        }

        let mut users = Vec::new();
        let mut client: Option<HttpClient> = None;
        for (name, count) in &start.scenarios {
            let Some(scenario) = self.inner.scenarios.get(name) else {
                warn!("scenario {name} does not exist, skipping");
                continue;
            };

            for i in 0..*count {
                if i % self.inner.config.users_per_client == 0 {
                    client = Some(caller::new_client(
                        self.inner.config.min_idle_conn_timeout_sec,
                        self.inner.config.max_idle_conn_timeout_sec,
                    )?);
                }
                let http = client.clone().expect("client built for first user");

                users.push(Arc::new(User::new(
                    format!("user for {name} #{i}"),
                    scenario.clone(),
                    Arc::new(Caller::new(http)),
                )));
            }
        }

        let cancel = attack.cancel.child_token();
        attack.increments.insert(
            start.increment_id,
            Increment {
                operation_id: start.id,
                users,
                cancel,
            },
        );

        Ok(())
    }

    /// Run one pacing pass: launch every user of the attack, spread evenly
    /// over the wait window.
    async fn execute_attack(&self, attack_id: i64, wait_time_sec: f64) {
        let attacks = self.inner.attacks.read().await;
        let Some(attack) = attacks.get(&attack_id) else {
            return;
        };

        let total: usize = attack
            .increments
            .values()
            .map(|increment| increment.users.len())
            .sum();
        if total == 0 {
            return;
        }
        let interval = Duration::from_secs_f64(wait_time_sec / total as f64);

        for increment in attack.increments.values() {
            for user in &increment.users {
                let user = Arc::clone(user);
                let ctx = increment.cancel.clone();
                tokio::spawn(async move { user.run(ctx).await });
                tokio::time::sleep(interval).await;
            }
        }
    }

    /// Stop an increment, or the whole attack when no increment is named or
    /// the last increment goes away. Users are destroyed asynchronously
    /// through the drain tracker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AttackNotFound`] for an unknown attack or increment
    /// and [`Error::RemoveJob`] when the pacing job cannot be removed.
    pub async fn stop_attack(&self, stop: core::OperationStop) -> Result<(), Error> {
        let mut attacks = self.inner.attacks.write().await;
        if !attacks.contains_key(&stop.attack_id) {
            return Err(Error::AttackNotFound);
        }

        if let Some(increment_id) = stop.increment_id {
            let attack = attacks
                .get_mut(&stop.attack_id)
                .expect("attack presence checked");
            let Some(increment) = attack.increments.remove(&increment_id) else {
                return Err(Error::AttackNotFound);
            };

            increment.cancel.cancel();
            for user in increment.users {
                self.inner.drain.spawn(async move { user.destroy().await });
            }

            if attack.increments.is_empty() {
                attack.cancel.cancel();
                let job = attack.job;
                attacks.remove(&stop.attack_id);
                self.inner.scheduler.remove_job(job).map_err(Error::RemoveJob)?;
            }
        } else {
            let attack = attacks
                .remove(&stop.attack_id)
                .expect("attack presence checked");
            attack.cancel.cancel();
            self.inner
                .scheduler
                .remove_job(attack.job)
                .map_err(Error::RemoveJob)?;

            for increment in attack.increments.into_values() {
                for user in increment.users {
                    self.inner.drain.spawn(async move { user.destroy().await });
                }
            }
        }

        Ok(())
    }

    /// Shut the generator down: cancel everything, stop the scheduler and
    /// wait until every user's in-flight scenario pass has finished.
    pub async fn stop(&self) {
        let attacks = self.inner.attacks.write().await;

        self.inner.root.cancel();
        self.inner.scheduler.shutdown().await;

        for attack in attacks.values() {
            for increment in attack.increments.values() {
                for user in &increment.users {
                    let user = Arc::clone(user);
                    self.inner.drain.spawn(async move { user.destroy().await });
                }
            }
        }

        self.inner.drain.close();
        self.inner.drain.wait().await;
    }
}
