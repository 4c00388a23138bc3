//! Test Runner (§4.8): the DAG driver. Launches scenarios whose
//! dependencies have succeeded, skips scenarios whose dependencies
//! failed, and publishes `TestEvent`s for the controller to consume.
//!
//! Grounded line-for-line against `cicadad/core/runners.py::test_runner`:
//! filter by tag, start the no-dependency scenarios, loop polling started
//! scenarios for a result (or a vanished worker) and starting any scenario
//! whose dependencies just finished, sleeping one second per cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::backend::Backend;
use crate::context::encode_context;
use crate::model::{Scenario, ScenarioId, ScenarioResult, TestEvent, TestEventKind, TestEventPayload, TestId};
use crate::worker::WorkerLauncher;

#[derive(Debug, Error)]
pub enum TestRunnerError {
    #[error(transparent)]
    Backend(#[from] crate::backend::BackendError),
    #[error(transparent)]
    Worker(#[from] crate::worker::WorkerError),
}

pub type TestRunnerResult<T> = std::result::Result<T, TestRunnerError>;

/// Drives one test to completion: creates scenarios whose dependencies are
/// satisfied, launches their workers, and polls for results until every
/// eligible scenario has one (§4.8's state: `started`, `results`,
/// `scenariosById`).
pub struct TestRunner {
    backend: Arc<dyn Backend>,
    launcher: Arc<dyn WorkerLauncher>,
    test_id: TestId,
    scenarios: Vec<Arc<Scenario>>,
    poll_period: Duration,
}

impl TestRunner {
    pub fn new(
        backend: Arc<dyn Backend>,
        launcher: Arc<dyn WorkerLauncher>,
        test_id: TestId,
        scenarios: Vec<Arc<Scenario>>,
    ) -> Self {
        Self { backend, launcher, test_id, scenarios, poll_period: Duration::from_secs(1) }
    }

    pub fn with_poll_period(mut self, period: Duration) -> Self {
        self.poll_period = period;
        self
    }

    /// Runs the whole DAG to completion and returns every scenario's
    /// result, keyed by scenario name.
    pub async fn run(&self, tags: &[String]) -> TestRunnerResult<HashMap<String, ScenarioResult>> {
        let valid: Vec<&Arc<Scenario>> = self
            .scenarios
            .iter()
            .filter(|s| tags.is_empty() || s.tags.iter().any(|t| tags.contains(t)))
            .collect();

        let by_name: HashMap<String, &Arc<Scenario>> = valid.iter().map(|s| (s.name.clone(), *s)).collect();

        let mut started: HashMap<String, ScenarioId> = HashMap::new();
        let mut results: HashMap<String, ScenarioResult> = HashMap::new();
        let mut scenarios_by_id: HashMap<ScenarioId, Arc<Scenario>> = HashMap::new();

        for scenario in &valid {
            if scenario.dependencies.is_empty() {
                let id = self.start_scenario(scenario, &results).await?;
                scenarios_by_id.insert(id.clone(), (*scenario).clone());
                started.insert(scenario.name.clone(), id);
            }
        }

        self.backend
            .add_test_event(
                &self.test_id,
                TestEvent {
                    kind: TestEventKind::TestStarted,
                    payload: TestEventPayload::Status {
                        scenario: None,
                        scenario_id: None,
                        message: format!("Collected {} Scenario(s)", valid.len()),
                        context: None,
                    },
                },
            )
            .await?;

        while results.len() < valid.len() {
            // Poll started-but-unresulted scenarios for metrics and results.
            let pending: Vec<(String, ScenarioId)> = started
                .iter()
                .filter(|(name, _)| !results.contains_key(*name))
                .map(|(name, id)| (name.clone(), id.clone()))
                .collect();

            for (name, scenario_id) in pending {
                let scenario = by_name[&name];

                for (display_name, display) in &scenario.console_metric_displays {
                    if let Some(value) = display(scenario_id.clone(), self.backend.clone()).await {
                        let mut metrics = HashMap::new();
                        metrics.insert(display_name.clone(), Some(value));
                        self.backend
                            .add_test_event(
                                &self.test_id,
                                TestEvent {
                                    kind: TestEventKind::ScenarioMetric,
                                    payload: TestEventPayload::Metric { scenario: name.clone(), metrics },
                                },
                            )
                            .await?;
                    }
                }

                if let Some(result) = self.backend.move_scenario_result(&scenario_id).await? {
                    self.emit_finished(&name, &scenario_id, &result).await?;
                    results.insert(name.clone(), result);
                } else if !self.launcher.is_running(&self.test_id, &scenario_id).await
                    && !self.backend.check_test_instance(&self.test_id, scenario_id.as_str()).await.unwrap_or(true)
                {
                    let result = ScenarioResult::exited_unexpectedly();
                    self.emit_finished(&name, &scenario_id, &result).await?;
                    results.insert(name.clone(), result);
                }
            }

            // Start any scenario whose dependencies have all resolved.
            for scenario in &valid {
                if started.contains_key(&scenario.name) {
                    continue;
                }
                if !scenario.dependencies.iter().all(|dep| results.contains_key(dep)) {
                    continue;
                }

                let failed_dependency = scenario.dependencies.iter().any(|dep| {
                    results.get(dep).map(|r| r.exception.is_some()).unwrap_or(false)
                });

                if failed_dependency {
                    let result = ScenarioResult::skipped();
                    // No scenario id exists for a skipped scenario; emit the
                    // finished event keyed by name only.
                    self.backend
                        .add_test_event(
                            &self.test_id,
                            TestEvent {
                                kind: TestEventKind::ScenarioFinished,
                                payload: TestEventPayload::Status {
                                    scenario: Some(scenario.name.clone()),
                                    scenario_id: None,
                                    message: "Skipped".to_string(),
                                    context: None,
                                },
                            },
                        )
                        .await?;
                    results.insert(scenario.name.clone(), result);
                } else {
                    let id = self.start_scenario(scenario, &results).await?;
                    scenarios_by_id.insert(id.clone(), (*scenario).clone());
                    started.insert(scenario.name.clone(), id);
                }
            }

            if results.len() < valid.len() {
                tokio::time::sleep(self.poll_period).await;
            }
        }

        self.backend
            .add_test_event(
                &self.test_id,
                TestEvent {
                    kind: TestEventKind::TestFinished,
                    payload: TestEventPayload::Status {
                        scenario: None,
                        scenario_id: None,
                        message: format!(
                            "{} succeeded, {} failed",
                            results.values().filter(|r| r.exception.is_none()).count(),
                            results.values().filter(|r| r.exception.is_some()).count()
                        ),
                        context: None,
                    },
                },
            )
            .await?;

        Ok(results)
    }

    async fn start_scenario(
        &self,
        scenario: &Arc<Scenario>,
        results_so_far: &HashMap<String, ScenarioResult>,
    ) -> TestRunnerResult<ScenarioId> {
        let context = encode_context(results_so_far);
        let scenario_id = self
            .backend
            .create_scenario(
                &self.test_id,
                &scenario.name,
                context.clone(),
                scenario.users_per_instance,
                scenario.tags.clone(),
            )
            .await?;

        self.backend
            .add_test_event(
                &self.test_id,
                TestEvent {
                    kind: TestEventKind::ScenarioStarted,
                    payload: TestEventPayload::Status {
                        scenario: Some(scenario.name.clone()),
                        scenario_id: Some(scenario_id.as_str().to_string()),
                        message: "Starting scenario".to_string(),
                        context: None,
                    },
                },
            )
            .await?;

        let context_value: serde_json::Value = crate::context::decode_context(&context)?;
        self.launcher.launch(&self.test_id, &scenario_id, scenario.clone(), context_value).await?;

        Ok(scenario_id)
    }

    async fn emit_finished(
        &self,
        name: &str,
        scenario_id: &ScenarioId,
        result: &ScenarioResult,
    ) -> TestRunnerResult<()> {
        let message = match &result.exception {
            Some(exception) => exception.clone(),
            None => "Scenario finished".to_string(),
        };
        self.backend
            .add_test_event(
                &self.test_id,
                TestEvent {
                    kind: TestEventKind::ScenarioFinished,
                    payload: TestEventPayload::Status {
                        scenario: Some(name.to_string()),
                        scenario_id: Some(scenario_id.as_str().to_string()),
                        message,
                        context: None,
                    },
                },
            )
            .await?;
        Ok(())
    }
}

impl From<crate::context::ContextError> for TestRunnerError {
    fn from(err: crate::context::ContextError) -> Self {
        TestRunnerError::Backend(crate::backend::BackendError::Other(anyhow::anyhow!(err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::load_model::LoadModelFn;
    use crate::scenario::UserLoopFn;
    use crate::worker::local::LocalLauncher;

    fn scenario(name: &str, dependencies: Vec<String>, succeed: bool) -> Arc<Scenario> {
        Arc::new(Scenario {
            name: name.to_string(),
            func: Arc::new(move |_ctx, _log| {
                Box::pin(async move {
                    if succeed { Ok(serde_json::json!(1)) } else { Err("boom".to_string()) }
                })
            }),
            user_loop: UserLoopFn::while_has_work(20),
            load_model: LoadModelFn::run_scenario_once(Duration::from_millis(200)),
            dependencies,
            result_aggregator: None,
            result_verifier: Arc::new(crate::scenario::basic_verification),
            output_transformer: None,
            users_per_instance: 5,
            raise_exception: true,
            metric_collectors: vec![],
            console_metric_displays: Default::default(),
            tags: vec![],
        })
    }

    #[tokio::test]
    async fn runs_independent_scenarios_to_completion() {
        let backend = Arc::new(MemoryBackend::new());
        let launcher = Arc::new(LocalLauncher::new(backend.clone()));
        let test_id = backend
            .create_test(serde_json::json!({}), String::new(), vec![], Default::default())
            .await
            .unwrap();

        let scenarios = vec![scenario("a", vec![], true), scenario("b", vec![], true)];
        let runner = TestRunner::new(backend.clone(), launcher, test_id, scenarios)
            .with_poll_period(Duration::from_millis(20));

        let results = runner.run(&[]).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results["a"].exception.is_none());
        assert!(results["b"].exception.is_none());
    }

    #[tokio::test]
    async fn skips_scenario_whose_dependency_failed() {
        let backend = Arc::new(MemoryBackend::new());
        let launcher = Arc::new(LocalLauncher::new(backend.clone()));
        let test_id = backend
            .create_test(serde_json::json!({}), String::new(), vec![], Default::default())
            .await
            .unwrap();

        let scenarios = vec![scenario("a", vec![], false), scenario("b", vec!["a".to_string()], true)];
        let runner = TestRunner::new(backend.clone(), launcher, test_id, scenarios)
            .with_poll_period(Duration::from_millis(20));

        let results = runner.run(&[]).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results["a"].exception.is_some());
        assert_eq!(results["b"].exception.as_deref(), Some("Skipped"));
    }

    #[tokio::test]
    async fn filters_scenarios_by_tag() {
        let backend = Arc::new(MemoryBackend::new());
        let launcher = Arc::new(LocalLauncher::new(backend.clone()));
        let test_id = backend
            .create_test(serde_json::json!({}), String::new(), vec![], Default::default())
            .await
            .unwrap();

        let mut tagged = scenario("a", vec![], true);
        Arc::get_mut(&mut tagged).unwrap().tags = vec!["smoke".to_string()];
        let untagged = scenario("b", vec![], true);

        let runner = TestRunner::new(backend.clone(), launcher, test_id, vec![tagged, untagged])
            .with_poll_period(Duration::from_millis(20));

        let results = runner.run(&["smoke".to_string()]).await.unwrap();

        assert_eq!(results.len(), 1);
        assert!(results.contains_key("a"));
    }
}
