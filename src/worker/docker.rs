//! `DOCKER` worker mode: one container per scenario, each running the same
//! image the controller was built from so the worker process has its own
//! copy of the test definitions and can look a scenario up by name (§6's
//! "Worker commands ... each taking identifiers and a base64-encoded JSON
//! context string" — the closure itself never crosses the process
//! boundary, only `run-scenario --scenario-name ... --context ...` does).
//!
//! Grounded on the teacher's `provider/docker.rs`: same
//! `bollard::Docker::connect_with_local_defaults`, `create_container` +
//! `start_container` pair, and `inspect_container` for liveness.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{Config as ContainerConfig, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions};
use bollard::models::HostConfig;
use tokio::sync::Mutex;

use crate::backend::Backend;
use crate::context::encode_context;
use crate::model::{Scenario, ScenarioId, TestId};
use crate::worker::{WorkerError, WorkerLauncher, WorkerResult};

#[derive(Clone)]
struct Tracked {
    test_id: TestId,
    container_id: String,
}

/// Launches one Docker container per scenario via `bollard`.
pub struct DockerLauncher {
    docker: Docker,
    backend: Arc<dyn Backend>,
    image: String,
    network: Option<String>,
    /// Shared `FileBackend` path, bind-mounted into every container at the
    /// identical host path so the worker reaches the controller's actual
    /// backend state instead of one of its own (§4.1). `None` only when the
    /// controller itself runs an in-process backend a container could never
    /// reach anyway.
    backend_location: Option<PathBuf>,
    containers: Mutex<HashMap<ScenarioId, Tracked>>,
}

impl DockerLauncher {
    pub fn new(
        backend: Arc<dyn Backend>,
        image: String,
        network: Option<String>,
        backend_location: Option<PathBuf>,
    ) -> WorkerResult<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| WorkerError::LaunchFailed(e.to_string()))?;
        Ok(Self { docker, backend, image, network, backend_location, containers: Mutex::new(HashMap::new()) })
    }
}

#[async_trait]
impl WorkerLauncher for DockerLauncher {
    async fn launch(
        &self,
        test_id: &TestId,
        scenario_id: &ScenarioId,
        scenario: Arc<Scenario>,
        context: serde_json::Value,
    ) -> WorkerResult<()> {
        let context_b64 = encode_context(&context);
        let mut cmd = vec![
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

        let mut binds = None;
        if let Some(location) = &self.backend_location {
            cmd.push("--backend-location".to_string());
            cmd.push(location.display().to_string());
            // Bind-mounting the file's parent dir (rather than the file
            // itself) lets the worker's atomic rename-based writes
            // (`FileBackend::save`) land inside the mount.
            if let Some(dir) = location.parent().filter(|p| !p.as_os_str().is_empty()) {
                let dir = dir.display().to_string();
                binds = Some(vec![format!("{dir}:{dir}")]);
            }
        }

        let host_config = HostConfig {
            network_mode: self.network.clone(),
            auto_remove: Some(false),
            binds,
            ..Default::default()
        };

        let container_config = ContainerConfig {
            image: Some(self.image.clone()),
            cmd: Some(cmd),
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = format!("surge-{}-{}", test_id.as_str(), scenario_id.as_str());
        let options = CreateContainerOptions { name: name.as_str(), platform: None };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| WorkerError::LaunchFailed(e.to_string()))?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| WorkerError::LaunchFailed(e.to_string()))?;

        // Keyed by scenario id, not the container id, so it matches what
        // `test_runner.rs`'s liveness check looks up.
        self.backend.register_test_instance(test_id, scenario_id.as_str()).await?;

        self.containers
            .lock()
            .await
            .insert(scenario_id.clone(), Tracked { test_id: test_id.clone(), container_id: response.id });

        Ok(())
    }

    async fn is_running(&self, _test_id: &TestId, scenario_id: &ScenarioId) -> bool {
        let Some(tracked) = self.containers.lock().await.get(scenario_id).cloned() else {
            return true;
        };
        match self.docker.inspect_container(&tracked.container_id, None).await {
            Ok(details) => details.state.and_then(|s| s.running).unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn shutdown_test(&self, test_id: &TestId) -> WorkerResult<()> {
        let mut containers = self.containers.lock().await;
        let matching: Vec<ScenarioId> = containers
            .iter()
            .filter(|(_, tracked)| &tracked.test_id == test_id)
            .map(|(id, _)| id.clone())
            .collect();

        for scenario_id in matching {
            if let Some(tracked) = containers.remove(&scenario_id) {
                let _ = self
                    .docker
                    .remove_container(
                        &tracked.container_id,
                        Some(RemoveContainerOptions { force: true, ..Default::default() }),
                    )
                    .await;
            }
        }

        self.backend.clean_test_instances(test_id).await?;
        Ok(())
    }
}
