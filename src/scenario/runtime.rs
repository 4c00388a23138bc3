//! Scenario Runtime (§4.6): the capability surface a load model drives,
//! and the completion protocol that turns a finished run into a
//! [`crate::model::ScenarioResult`].
//!
//! Grounded on `cicadad/core/commands.py::ScenarioCommands` for the
//! per-operation semantics and on this crate's `orchestrator` teacher code
//! for the "one struct owns the collaborators, methods are thin calls into
//! them" shape.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::model::{Result as InvocationResult, Scenario, ScenarioId, ScenarioResult, TestId};
use crate::panic_util::panic_message;
use crate::user::UserScheduler;

/// Owned by the worker process running a scenario's load model. Not
/// `Clone`: there is exactly one load model driving exactly one
/// `ScenarioRuntime` per scenario execution.
pub struct ScenarioRuntime {
    backend: Arc<dyn Backend>,
    test_id: TestId,
    scenario_id: ScenarioId,
    scenario: Arc<Scenario>,
    context: serde_json::Value,
    num_users: usize,
    num_results_collected: usize,
    errors: Vec<String>,
    /// The load model's running reduction over collected results (§4.6
    /// `aggregate_results`); also the scenario's final `output` absent an
    /// `output_transformer`.
    pub aggregated_results: serde_json::Value,
    /// One [`UserScheduler`] task per manager `start_users` has launched so
    /// far, cancelled together once the load model finishes (§4.5: a
    /// scheduler watches exactly the manager it was spawned for).
    scheduler_tasks: Vec<JoinHandle<()>>,
    scheduler_shutdown: CancellationToken,
}

impl ScenarioRuntime {
    pub fn new(
        backend: Arc<dyn Backend>,
        test_id: TestId,
        scenario_id: ScenarioId,
        scenario: Arc<Scenario>,
        context: serde_json::Value,
    ) -> Self {
        Self {
            backend,
            test_id,
            scenario_id,
            scenario,
            context,
            num_users: 0,
            num_results_collected: 0,
            errors: Vec::new(),
            aggregated_results: serde_json::Value::Null,
            scheduler_tasks: Vec::new(),
            scheduler_shutdown: CancellationToken::new(),
        }
    }

    pub fn test_id(&self) -> &TestId {
        &self.test_id
    }

    pub fn scenario_id(&self) -> &ScenarioId {
        &self.scenario_id
    }

    pub fn num_users(&self) -> usize {
        self.num_users
    }

    pub fn num_results_collected(&self) -> usize {
        self.num_results_collected
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Appends a load-model-level error (e.g. a timeout) without going
    /// through [`Self::verify_results`]'s per-result path.
    pub fn record_error(&mut self, message: String) {
        self.errors.push(message);
    }

    /// Scales the tracked user count to `target`, starting or stopping the
    /// difference.
    pub async fn scale_users(&mut self, target: usize) {
        if target > self.num_users {
            self.start_users(target - self.num_users).await;
        } else if target < self.num_users {
            self.stop_users(self.num_users - target).await;
        }
    }

    pub async fn start_users(&mut self, amount: usize) {
        if amount == 0 {
            return;
        }
        let new_managers = match self
            .backend
            .create_users(&self.test_id, &self.scenario_id, amount as u64)
            .await
        {
            Ok(managers) => managers,
            Err(err) => {
                tracing::warn!("failed to start {amount} users for scenario {}: {err}", self.scenario_id);
                return;
            }
        };

        for manager_id in new_managers {
            let scheduler = UserScheduler::new(
                manager_id,
                self.backend.clone(),
                self.scenario.clone(),
                self.context.clone(),
            );
            let shutdown = self.scheduler_shutdown.clone();
            self.scheduler_tasks.push(tokio::spawn(async move {
                scheduler.run(shutdown).await;
            }));
        }

        self.num_users += amount;
    }

    pub async fn stop_users(&mut self, amount: usize) {
        let amount = amount.min(self.num_users);
        if amount == 0 {
            return;
        }
        if let Err(err) = self.backend.stop_users(&self.scenario_id, amount as u64).await {
            tracing::warn!("failed to stop {amount} users for scenario {}: {err}", self.scenario_id);
            return;
        }
        self.num_users -= amount;
    }

    pub async fn add_work(&self, amount: u64) {
        if let Err(err) = self.backend.distribute_work(&self.scenario_id, amount).await {
            tracing::warn!("failed to add {amount} work tokens: {err}");
        }
    }

    pub async fn send_user_events(&self, kind: &str, payload: serde_json::Value) {
        if let Err(err) = self.backend.add_user_event(&self.scenario_id, kind, payload).await {
            tracing::warn!("failed to send user event {kind}: {err}");
        }
    }

    /// Drains up to `limit` results; if none are immediately available and
    /// `timeout_ms` is given, waits once then drains again. Either way,
    /// increments `num_results_collected` by the size of the returned batch.
    pub async fn get_latest_results(&mut self, timeout_ms: Option<u64>, limit: usize) -> Vec<InvocationResult> {
        let mut batch = self
            .backend
            .move_user_results(&self.scenario_id, limit)
            .await
            .unwrap_or_default();

        if batch.is_empty() {
            if let Some(timeout_ms) = timeout_ms {
                tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)).await;
                batch = self
                    .backend
                    .move_user_results(&self.scenario_id, limit)
                    .await
                    .unwrap_or_default();
            }
        }

        self.num_results_collected += batch.len();
        batch
    }

    /// Reduces `latest` into the running aggregate. Defaults to "latest
    /// wins" (the last result's output replaces the aggregate) absent a
    /// user-supplied `result_aggregator`.
    pub fn aggregate_results(&mut self, latest: &[InvocationResult]) {
        if let Some(aggregator) = &self.scenario.result_aggregator {
            self.aggregated_results = aggregator(self.aggregated_results.clone(), latest);
        } else if let Some(last) = latest.last() {
            self.aggregated_results = last.output.clone();
        }
    }

    /// Runs the scenario's verifier (defaults to
    /// [`crate::scenario::basic_verification`]) over `latest` and appends
    /// its returned error strings to the running error list, returning just
    /// the new ones.
    pub fn verify_results(&mut self, latest: &[InvocationResult]) -> Vec<String> {
        let new_errors = (self.scenario.result_verifier)(latest);
        self.errors.extend(new_errors.iter().cloned());
        new_errors
    }

    /// Runs every configured metric collector over `latest`.
    pub async fn collect_datastore_metrics(&self, latest: &[InvocationResult]) {
        for collector in &self.scenario.metric_collectors {
            collector(latest, self.scenario_id.clone(), self.backend.clone()).await;
        }
    }

    /// Drives the scenario's load model to completion and produces its
    /// final [`ScenarioResult`] (§4.6/§4.7's completion protocol):
    ///
    /// 1. Runs the load model, catching a panic as a thrown exception.
    /// 2. Applies `output_transformer` to the aggregate, if any.
    /// 3. If nothing threw but errors were recorded and the transformed
    ///    output is still `null`, synthesizes a summary exception (only
    ///    when `raise_exception` is set).
    /// 4. Unconditionally scales to zero, even after a panic.
    pub async fn run_to_completion(mut self) -> ScenarioResult {
        let run_start = tokio::time::Instant::now();
        let load_model = self.scenario.load_model.clone();

        let outcome = AssertUnwindSafe(load_model.run(&mut self)).catch_unwind().await;

        let thrown = match outcome {
            Ok(()) => None,
            Err(panic) => Some(panic_message(&panic)),
        };

        let mut output = self.aggregated_results.clone();
        if let Some(transformer) = &self.scenario.output_transformer {
            output = transformer(output);
        }

        let exception = match thrown {
            Some(message) => Some(message),
            None if !self.errors.is_empty() && output.is_null() && self.scenario.raise_exception => {
                let mut lines = vec![format!(
                    "{} error(s) were raised in scenario {}:",
                    self.errors.len(),
                    self.scenario.name
                )];
                lines.extend(self.errors.iter().cloned());
                Some(lines.join("\n"))
            }
            None => None,
        };

        // Always scale down, whether the load model finished cleanly or panicked.
        self.scale_users(0).await;

        self.scheduler_shutdown.cancel();
        for task in self.scheduler_tasks.drain(..) {
            let _ = task.await;
        }

        let failed = self.errors.len();
        ScenarioResult {
            id: crate::model::ResultId::new(),
            output,
            exception,
            logs: String::new(),
            timestamp: chrono::Utc::now(),
            time_taken: run_start.elapsed().as_secs_f64(),
            succeeded: self.num_results_collected.saturating_sub(failed),
            failed,
        }
    }

    /// The context this run was constructed with (§6), handed to the
    /// scenario body on every invocation via the user runner.
    pub fn context(&self) -> &serde_json::Value {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::load_model::LoadModelFn;
    use crate::scenario::UserLoopFn;
    use std::time::Duration;

    async fn runtime_for(func: crate::model::ScenarioFn, raise_exception: bool) -> ScenarioRuntime {
        let backend = Arc::new(MemoryBackend::new());
        let test_id = backend
            .create_test(serde_json::json!({}), String::new(), vec![], Default::default())
            .await
            .unwrap();
        let scenario_id = backend
            .create_scenario(&test_id, "s", "e30=".into(), 5, vec![])
            .await
            .unwrap();
        let scenario = Arc::new(Scenario {
            name: "s".to_string(),
            func,
            user_loop: UserLoopFn::while_has_work(50),
            load_model: LoadModelFn::RunScenarioOnce {
                wait_period: Duration::from_millis(5),
                timeout: Duration::from_millis(50),
            },
            dependencies: vec![],
            result_aggregator: None,
            result_verifier: Arc::new(crate::scenario::basic_verification),
            output_transformer: None,
            users_per_instance: 5,
            raise_exception,
            metric_collectors: vec![],
            console_metric_displays: Default::default(),
            tags: vec![],
        });

        ScenarioRuntime::new(backend, test_id, scenario_id, scenario, serde_json::json!({}))
    }

    #[tokio::test]
    async fn scale_users_starts_and_stops_the_difference() {
        let func: crate::model::ScenarioFn = Arc::new(|_ctx, _log| Box::pin(async { Ok(serde_json::Value::Null) }));
        let mut runtime = runtime_for(func, true).await;

        runtime.scale_users(4).await;
        assert_eq!(runtime.num_users(), 4);

        runtime.scale_users(1).await;
        assert_eq!(runtime.num_users(), 1);
    }

    #[tokio::test]
    async fn aggregate_results_defaults_to_latest_wins() {
        let func: crate::model::ScenarioFn = Arc::new(|_ctx, _log| Box::pin(async { Ok(serde_json::Value::Null) }));
        let mut runtime = runtime_for(func, true).await;

        let results = vec![
            InvocationResult {
                id: crate::model::ResultId::new(),
                output: serde_json::json!(1),
                exception: None,
                logs: String::new(),
                timestamp: chrono::Utc::now(),
                time_taken: 0.0,
            },
            InvocationResult {
                id: crate::model::ResultId::new(),
                output: serde_json::json!(2),
                exception: None,
                logs: String::new(),
                timestamp: chrono::Utc::now(),
                time_taken: 0.0,
            },
        ];

        runtime.aggregate_results(&results);
        assert_eq!(runtime.aggregated_results, serde_json::json!(2));
    }

    #[tokio::test]
    async fn run_to_completion_synthesizes_exception_from_errors() {
        let func: crate::model::ScenarioFn = Arc::new(|_ctx, _log| Box::pin(async { Ok(serde_json::Value::Null) }));
        let mut runtime = runtime_for(func, true).await;

        let failed = InvocationResult {
            id: crate::model::ResultId::new(),
            output: serde_json::Value::Null,
            exception: Some("boom".to_string()),
            logs: "trace".to_string(),
            timestamp: chrono::Utc::now(),
            time_taken: 0.0,
        };
        runtime.verify_results(std::slice::from_ref(&failed));
        runtime.num_results_collected = 1;

        let result = runtime.run_to_completion().await;
        assert!(result.exception.as_deref().unwrap().contains("1 error(s)"));
        assert_eq!(result.failed, 1);
        assert_eq!(result.succeeded, 0);
    }

    #[tokio::test]
    async fn run_to_completion_applies_output_transformer() {
        let func: crate::model::ScenarioFn = Arc::new(|_ctx, _log| Box::pin(async { Ok(serde_json::json!(7)) }));
        let mut runtime = runtime_for(func, true).await;
        runtime.scenario = Arc::new(Scenario {
            output_transformer: Some(Arc::new(|v| serde_json::json!({ "wrapped": v }))),
            ..(*runtime.scenario).clone()
        });
        runtime.aggregated_results = serde_json::json!(7);

        let result = runtime.run_to_completion().await;
        assert_eq!(result.output, serde_json::json!({ "wrapped": 7 }));
    }
}
