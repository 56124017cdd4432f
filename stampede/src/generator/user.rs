//! A virtual user: one logical client repeatedly executing a scenario.

use std::sync::Arc;

use metrics::gauge;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::{caller::Caller, scenario::Scenario};

/// One logical client bound to a scenario and a shared HTTP caller.
///
/// The busy lock is the user's only synchronisation: `run` skips when the
/// previous invocation still holds it, `destroy` waits for it.
#[derive(Debug)]
pub(crate) struct User {
    name: String,
    scenario: Scenario,
    caller: Arc<Caller>,
    busy: Mutex<()>,
}

impl User {
    pub(crate) fn new(name: String, scenario: Scenario, caller: Arc<Caller>) -> Self {
        Self {
            name,
            scenario,
            caller,
            busy: Mutex::new(()),
        }
    }

    /// Execute one pass of the scenario.
    ///
    /// If the previous invocation is still running the call is silently
    /// skipped; under overload a user's fire rate saturates at one pass at a
    /// time.
    pub(crate) async fn run(&self, ctx: CancellationToken) {
        let Ok(_busy) = self.busy.try_lock() else {
            return;
        };

        gauge!("active_users").increment(1.0);
        let result = (self.scenario.commands)(ctx, Arc::clone(&self.caller)).await;
        gauge!("active_users").decrement(1.0);

        if let Err(e) = result {
            error!(
                user = %self.name,
                scenario = %self.scenario.name,
                "error executing scenario: {e}"
            );
        }
    }

    /// Wait for any in-flight scenario pass to finish.
    ///
    /// The blocking acquisition is the guarantee that no scenario invocation
    /// outlives this call.
    pub(crate) async fn destroy(&self) {
        let _busy = self.busy.lock().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::caller;

    fn slow_scenario(counter: Arc<AtomicUsize>) -> Scenario {
        Scenario::new("slow", "sleeps briefly", move |_ctx, _caller| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok(())
            })
        })
    }

    fn test_user(scenario: Scenario) -> Arc<User> {
        let client = caller::new_client(1, 1).expect("build client");
        Arc::new(User::new(
            "user for slow #0".to_string(),
            scenario,
            Arc::new(Caller::new(client)),
        ))
    }

    #[tokio::test]
    async fn overlapping_runs_coalesce() {
        let count = Arc::new(AtomicUsize::new(0));
        let user = test_user(slow_scenario(Arc::clone(&count)));

        let ctx = CancellationToken::new();
        let first = {
            let user = Arc::clone(&user);
            let ctx = ctx.clone();
            tokio::spawn(async move { user.run(ctx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The second invocation lands while the first still holds the lock.
        user.run(ctx).await;
        first.await.expect("first run");

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn destroy_waits_for_inflight_run() {
        let count = Arc::new(AtomicUsize::new(0));
        let user = test_user(slow_scenario(Arc::clone(&count)));

        let ctx = CancellationToken::new();
        let running = {
            let user = Arc::clone(&user);
            tokio::spawn(async move { user.run(ctx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let start = std::time::Instant::now();
        user.destroy().await;
        assert!(start.elapsed() >= Duration::from_millis(40));

        running.await.expect("run task");
    }
}
