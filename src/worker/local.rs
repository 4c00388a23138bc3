//! `LOCAL` worker mode: runs a scenario's load model as a task in this same
//! process, against an in-process [`crate::backend::memory::MemoryBackend`].
//! No external process boundary — this is what the crate's own test suite
//! and `surge run --local` use.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::backend::Backend;
use crate::model::{Scenario, ScenarioId, TestId};
use crate::scenario::ScenarioRuntime;
use crate::worker::{WorkerLauncher, WorkerResult};

/// Tracks which scenarios' in-process tasks have finished, so `is_running`
/// can distinguish "still running" from "already reported".
pub struct LocalLauncher {
    backend: Arc<dyn Backend>,
    finished: Arc<Mutex<HashSet<ScenarioId>>>,
}

impl LocalLauncher {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend, finished: Arc::new(Mutex::new(HashSet::new())) }
    }

    fn finished_handle(&self) -> Arc<Mutex<HashSet<ScenarioId>>> {
        self.finished.clone()
    }
}

#[async_trait]
impl WorkerLauncher for LocalLauncher {
    async fn launch(
        &self,
        test_id: &TestId,
        scenario_id: &ScenarioId,
        scenario: Arc<Scenario>,
        context: serde_json::Value,
    ) -> WorkerResult<()> {
        let backend = self.backend.clone();
        let test_id = test_id.clone();
        let scenario_id = scenario_id.clone();

        let finished = self.finished_handle();
        let finished_id = scenario_id.clone();

        tokio::spawn(async move {
            let runtime = ScenarioRuntime::new(backend.clone(), test_id, scenario_id.clone(), scenario, context);
            let result = runtime.run_to_completion().await;
            if let Err(err) = backend.set_scenario_result(&scenario_id, result).await {
                tracing::warn!("failed to record result for scenario {scenario_id}: {err}");
            }
            finished.lock().await.insert(finished_id);
        });

        Ok(())
    }

    async fn is_running(&self, _test_id: &TestId, scenario_id: &ScenarioId) -> bool {
        !self.finished.lock().await.contains(scenario_id)
    }

    async fn shutdown_test(&self, _test_id: &TestId) -> WorkerResult<()> {
        // In-process tasks are left to finish or be dropped with the
        // process; there is no separate worker to tear down.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::scenario::UserLoopFn;
    use std::time::Duration;

    #[tokio::test]
    async fn launch_runs_the_scenario_and_reports_a_result() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
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
            func: Arc::new(|_ctx, _log| Box::pin(async { Ok(serde_json::json!(1)) })),
            user_loop: UserLoopFn::while_has_work(20),
            load_model: crate::load_model::LoadModelFn::RunScenarioOnce {
                wait_period: Duration::from_millis(5),
                timeout: Duration::from_millis(200),
            },
            dependencies: vec![],
            result_aggregator: None,
            result_verifier: Arc::new(crate::scenario::basic_verification),
            output_transformer: None,
            users_per_instance: 5,
            raise_exception: true,
            metric_collectors: vec![],
            console_metric_displays: Default::default(),
            tags: vec![],
        });
        let launcher = LocalLauncher::new(backend.clone());
        launcher.launch(&test_id, &scenario_id, scenario, serde_json::json!({})).await.unwrap();

        let mut result = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some(r) = backend.move_scenario_result(&scenario_id).await.unwrap() {
                result = Some(r);
                break;
            }
        }

        assert!(result.is_some());
    }
}
