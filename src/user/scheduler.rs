//! User Scheduler (§4.5): one per worker process, watches its manager's
//! `START_USERS` events and spawns a user runner task per newly announced
//! user.
//!
//! Grounded on `cicadad/core/runners.py::user_scheduler`: `for user_id in
//! backend.get_new_users(): spawn user_runner; send_user_results();
//! sleep(1)`. This polls the manager's own `START_USERS` log directly
//! (rather than through [`UserBuffer::get_user_events`]) since that
//! indirection assumes the user is already tracked — discovering a user is
//! exactly what registers it.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::model::{START_USERS, Scenario, UserManagerId};
use crate::user::buffer::UserBuffer;
use crate::user::runner::UserCommands;

/// Owns the tasks it spawns; dropping or cancelling it does not itself stop
/// them, but the `while commands.is_up()` condition in every user loop does
/// once the backend has recorded a matching `STOP_USERS` event.
pub struct UserScheduler {
    manager_id: UserManagerId,
    backend: Arc<dyn Backend>,
    buffer: Arc<UserBuffer>,
    scenario: Arc<Scenario>,
    context: serde_json::Value,
    poll_period: Duration,
}

impl UserScheduler {
    pub fn new(
        manager_id: UserManagerId,
        backend: Arc<dyn Backend>,
        scenario: Arc<Scenario>,
        context: serde_json::Value,
    ) -> Self {
        let buffer = Arc::new(UserBuffer::new(manager_id.clone(), backend.clone()));
        Self {
            manager_id,
            backend,
            buffer,
            scenario,
            context,
            poll_period: Duration::from_secs(1),
        }
    }

    pub fn manager_id(&self) -> &UserManagerId {
        &self.manager_id
    }

    pub fn with_poll_period(mut self, period: Duration) -> Self {
        self.poll_period = period;
        self
    }

    pub fn buffer(&self) -> &Arc<UserBuffer> {
        &self.buffer
    }

    /// Runs until `shutdown` is cancelled, discovering new users and
    /// spawning a task per user that runs the scenario's user loop to
    /// completion, flushing buffered results once per cycle.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_period) => {}
            }

            let new_user_events = self
                .backend
                .get_user_events(&self.manager_id, START_USERS)
                .await
                .unwrap_or_default();

            for event in new_user_events {
                let ids = event.ids();
                self.buffer.add_users(&ids).await;

                for user_id in ids {
                    let commands = Arc::new(UserCommands::new(
                        user_id,
                        self.buffer.clone(),
                        self.scenario.func.clone(),
                        self.context.clone(),
                    ));
                    let user_loop = self.scenario.user_loop.clone();
                    tasks.push(tokio::spawn(async move {
                        user_loop.run(&commands).await;
                    }));
                }
            }

            self.buffer.send_user_results().await;
            tasks.retain(|t| !t.is_finished());
        }

        self.buffer.send_user_results().await;
        for task in tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::load_model::LoadModelFn;
    use crate::scenario::UserLoopFn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn discovers_new_users_and_runs_them_to_is_up_false() {
        let backend = Arc::new(MemoryBackend::new());
        let test_id = backend
            .create_test(serde_json::json!({}), String::new(), vec![], Default::default())
            .await
            .unwrap();
        let scenario_id = backend
            .create_scenario(&test_id, "s", "e30=".into(), 2, vec![])
            .await
            .unwrap();
        let managers = backend.create_users(&test_id, &scenario_id, 2).await.unwrap();
        let manager_id = managers[0].clone();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let func: crate::model::ScenarioFn = Arc::new(move |_ctx, _log| {
            let calls = calls2.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            })
        });

        let scenario = Arc::new(Scenario {
            name: "s".to_string(),
            func,
            user_loop: UserLoopFn::while_alive(),
            load_model: LoadModelFn::run_scenario_once(StdDuration::from_secs(5)),
            dependencies: vec![],
            result_aggregator: None,
            result_verifier: Arc::new(crate::scenario::basic_verification),
            output_transformer: None,
            users_per_instance: 2,
            raise_exception: true,
            metric_collectors: vec![],
            console_metric_displays: Default::default(),
            tags: vec![],
        });

        let scheduler = UserScheduler::new(manager_id.clone(), backend.clone(), scenario, serde_json::json!({}))
            .with_poll_period(StdDuration::from_millis(5));

        let shutdown = CancellationToken::new();
        let shutdown2 = shutdown.clone();
        let backend2 = backend.clone();
        tokio::spawn(async move {
            // Let the scheduler discover the users and run them at least
            // once before asking them to stop.
            tokio::time::sleep(StdDuration::from_millis(40)).await;
            backend2.stop_users(&scenario_id, 2).await.unwrap();
            tokio::time::sleep(StdDuration::from_millis(40)).await;
            shutdown2.cancel();
        });
        scheduler.run(shutdown).await;

        assert!(calls.load(Ordering::SeqCst) >= 1);
    }
}
