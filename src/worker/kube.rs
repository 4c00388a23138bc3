//! `KUBE` worker mode: one pod per scenario, launched by shelling out to
//! the `kubectl` binary.
//!
//! No crate in the teacher's dependency stack talks to the Kubernetes API
//! directly (only `bollard` for Docker); per the Open Question resolution
//! recorded in `DESIGN.md`, this mode is implemented as a subprocess
//! wrapper instead, mirroring the teacher's `provider/process.rs`
//! (`tokio::process::Command` + `Stdio::piped()` + `tokio::time::timeout`)
//! rather than fabricating a Kubernetes client dependency.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::backend::Backend;
use crate::context::encode_context;
use crate::model::{Scenario, ScenarioId, TestId};
use crate::worker::{WorkerError, WorkerLauncher, WorkerResult};

#[derive(Clone)]
struct Tracked {
    test_id: TestId,
    pod_name: String,
}

/// Launches one pod per scenario via `kubectl run`, and inspects/tears
/// them down via `kubectl get`/`kubectl delete`.
pub struct KubeLauncher {
    backend: Arc<dyn Backend>,
    image: String,
    namespace: String,
    kubectl: String,
    /// Shared `FileBackend` path, hostPath-mounted into every pod at the
    /// identical path (§4.1) — same role as `DockerLauncher`'s bind mount,
    /// and under the same single-node assumption `kubectl run --overrides`
    /// hostPath volumes imply.
    backend_location: Option<PathBuf>,
    pods: Mutex<HashMap<ScenarioId, Tracked>>,
}

impl KubeLauncher {
    pub fn new(backend: Arc<dyn Backend>, image: String, namespace: String, backend_location: Option<PathBuf>) -> Self {
        Self {
            backend,
            image,
            namespace,
            kubectl: "kubectl".to_string(),
            backend_location,
            pods: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_kubectl_binary(mut self, binary: String) -> Self {
        self.kubectl = binary;
        self
    }

    async fn run_kubectl(&self, args: &[String]) -> WorkerResult<std::process::Output> {
        tokio::time::timeout(
            Duration::from_secs(30),
            Command::new(&self.kubectl).args(args).stdout(Stdio::piped()).stderr(Stdio::piped()).output(),
        )
        .await
        .map_err(|_| WorkerError::LaunchFailed("kubectl command timed out".to_string()))?
        .map_err(|e| WorkerError::LaunchFailed(e.to_string()))
    }
}

#[async_trait]
impl WorkerLauncher for KubeLauncher {
    async fn launch(
        &self,
        test_id: &TestId,
        scenario_id: &ScenarioId,
        scenario: Arc<Scenario>,
        context: serde_json::Value,
    ) -> WorkerResult<()> {
        let context_b64 = encode_context(&context);
        let pod_name = format!("surge-{}-{}", test_id.as_str(), scenario_id.as_str()).to_lowercase();

        let mut args_json = vec![
            "run-scenario".to_string(),
            "--scenario-name".to_string(),
            scenario.name.clone(),
            "--test-id".to_string(),
            test_id.as_str().to_string(),
            "--scenario-id".to_string(),
            scenario_id.as_str().to_string(),
            "--context".to_string(),
            context_b64,
        ];

        let mount_dir = self
            .backend_location
            .as_ref()
            .and_then(|location| location.parent())
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.display().to_string());

        if let Some(location) = &self.backend_location {
            args_json.push("--backend-location".to_string());
            args_json.push(location.display().to_string());
        }

        let overrides = if let Some(dir) = &mount_dir {
            serde_json::json!({
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": "surge-worker",
                        "image": self.image,
                        "args": args_json,
                        "volumeMounts": [{"name": "surge-backend", "mountPath": dir}],
                    }],
                    "volumes": [{"name": "surge-backend", "hostPath": {"path": dir, "type": "DirectoryOrCreate"}}],
                },
            })
        } else {
            serde_json::json!({
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": "surge-worker",
                        "image": self.image,
                        "args": args_json,
                    }],
                },
            })
        };

        let args = vec![
            "run".to_string(),
            pod_name.clone(),
            "--namespace".to_string(),
            self.namespace.clone(),
            "--image".to_string(),
            self.image.clone(),
            "--restart=Never".to_string(),
            format!("--overrides={overrides}"),
        ];

        let output = self.run_kubectl(&args).await?;
        if !output.status.success() {
            return Err(WorkerError::LaunchFailed(String::from_utf8_lossy(&output.stderr).to_string()));
        }

        // Keyed by scenario id, not the pod name, so it matches what
        // `test_runner.rs`'s liveness check looks up.
        self.backend.register_test_instance(test_id, scenario_id.as_str()).await?;
        self.pods.lock().await.insert(scenario_id.clone(), Tracked { test_id: test_id.clone(), pod_name });

        Ok(())
    }

    async fn is_running(&self, _test_id: &TestId, scenario_id: &ScenarioId) -> bool {
        let Some(tracked) = self.pods.lock().await.get(scenario_id).cloned() else {
            return true;
        };
        let args = vec![
            "get".to_string(),
            "pod".to_string(),
            tracked.pod_name,
            "--namespace".to_string(),
            self.namespace.clone(),
            "-o".to_string(),
            "jsonpath={.status.phase}".to_string(),
        ];
        match self.run_kubectl(&args).await {
            Ok(output) if output.status.success() => {
                let phase = String::from_utf8_lossy(&output.stdout);
                matches!(phase.trim(), "Pending" | "Running")
            }
            _ => false,
        }
    }

    async fn shutdown_test(&self, test_id: &TestId) -> WorkerResult<()> {
        let mut pods = self.pods.lock().await;
        let matching: Vec<ScenarioId> =
            pods.iter().filter(|(_, tracked)| &tracked.test_id == test_id).map(|(id, _)| id.clone()).collect();

        for scenario_id in matching {
            if let Some(tracked) = pods.remove(&scenario_id) {
                let args = vec![
                    "delete".to_string(),
                    "pod".to_string(),
                    tracked.pod_name,
                    "--namespace".to_string(),
                    self.namespace.clone(),
                    "--ignore-not-found".to_string(),
                ];
                let _ = self.run_kubectl(&args).await;
            }
        }

        self.backend.clean_test_instances(test_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    #[tokio::test]
    async fn launch_reports_launch_failed_when_kubectl_is_missing() {
        let backend = Arc::new(MemoryBackend::new());
        let test_id = backend
            .create_test(serde_json::json!({}), String::new(), vec![], Default::default())
            .await
            .unwrap();
        let scenario_id = backend
            .create_scenario(&test_id, "s", "e30=".into(), 1, vec![])
            .await
            .unwrap();

        let scenario = Arc::new(crate::model::Scenario {
            name: "s".to_string(),
            func: Arc::new(|_ctx, _log| Box::pin(async { Ok(serde_json::json!(1)) })),
            user_loop: crate::scenario::UserLoopFn::while_has_work(20),
            load_model: crate::load_model::LoadModelFn::run_scenario_once(Duration::from_millis(200)),
            dependencies: vec![],
            result_aggregator: None,
            result_verifier: Arc::new(crate::scenario::basic_verification),
            output_transformer: None,
            users_per_instance: 1,
            raise_exception: true,
            metric_collectors: vec![],
            console_metric_displays: Default::default(),
            tags: vec![],
        });

        let launcher = KubeLauncher::new(backend, "surge-worker:latest".to_string(), "default".to_string(), None)
            .with_kubectl_binary("definitely-not-a-real-binary-xyz".to_string());

        let result = launcher.launch(&test_id, &scenario_id, scenario, serde_json::json!({})).await;
        assert!(result.is_err());
    }
}
