//! `FileBackend` (§4.1 cross-process variant): the same store contract as
//! [`crate::backend::memory::MemoryBackend`], persisted as one JSON
//! document on disk so a worker launched by [`crate::worker::docker`] or
//! [`crate::worker::kube`] in a *separate container/pod* reaches the same
//! state the controller created, rather than an empty backend of its own.
//!
//! Per `DESIGN.md`'s Open Question resolution: the teacher's dependency
//! stack carries no RPC/service-mesh crate, so this crate does not
//! fabricate one. Instead it generalizes the teacher's "lock, mutate,
//! unlock" shape across a process boundary: a sibling `.lock` directory
//! (`fs::create_dir` is atomic, so exactly one process wins it at a time)
//! stands in for `MemoryBackend`'s in-process `Mutex`, guarding a
//! read-mutate-write cycle over the JSON file. `DockerLauncher`/
//! `KubeLauncher` bind-mount (Docker) or hostPath-mount (Kube) the file's
//! parent directory into the worker so it sees the identical path; this
//! only works when controller and worker share a filesystem (a single
//! Docker host, or a single-node/kind/minikube-style cluster) — a real
//! multi-node deployment would need a networked store behind this same
//! trait, which is exactly why `Backend` is specified as a trait rather
//! than a concrete RPC client (§4.1).

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::thread_rng;
use serde::{Deserialize, Serialize};

use super::{Backend, BackendError, BackendResult, WorkToken};
use crate::model::{
    EventId, MetricStatistics, Result as InvocationResult, STOP_USERS, ScenarioId, ScenarioResult,
    TestEvent, TestId, UserEvent, UserId, UserManagerId, START_USERS,
};

#[derive(Default, Serialize, Deserialize)]
struct ScenarioState {
    test_id: TestId,
    name: String,
    users_per_instance: usize,
    managers: Vec<UserManagerId>,
    result_queue: VecDeque<InvocationResult>,
    scenario_result: Option<ScenarioResult>,
    metrics: HashMap<String, Vec<f64>>,
}

#[derive(Default, Serialize, Deserialize)]
struct ManagerState {
    scenario_id: ScenarioId,
    users: HashSet<UserId>,
    work: i64,
    events: HashMap<String, (Vec<UserEvent>, usize)>,
    /// See `MemoryBackend`'s identical field: a retired manager survives
    /// until its `STOP_USERS` log has actually been read once.
    retired: bool,
}

#[derive(Default, Serialize, Deserialize)]
struct TestState {
    instances: HashSet<String>,
    test_events: VecDeque<TestEvent>,
}

#[derive(Default, Serialize, Deserialize)]
struct FileState {
    tests: HashMap<TestId, TestState>,
    scenarios: HashMap<ScenarioId, ScenarioState>,
    managers: HashMap<UserManagerId, ManagerState>,
}

fn split_evenly<T: Clone>(total: u64, targets: &[T]) -> HashMap<usize, u64> {
    let n = targets.len() as u64;
    let mut out = HashMap::new();
    if n == 0 {
        return out;
    }
    let base = total / n;
    let remainder = (total % n) as usize;

    let mut indices: Vec<usize> = (0..targets.len()).collect();
    indices.shuffle(&mut thread_rng());

    for (slot, &idx) in indices.iter().enumerate() {
        let mut share = base;
        if slot < remainder {
            share += 1;
        }
        out.insert(idx, share);
    }
    out
}

/// JSON-file-backed store, shared by every process that points at the same
/// path. Cheap to clone (just a `PathBuf`); every operation re-acquires the
/// file lock rather than caching state across calls.
#[derive(Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Acquires the cross-process lock, loads the file (or starts from an
    /// empty state if it doesn't exist yet), runs `f`, persists the result
    /// if `f` succeeded, and always releases the lock. Blocking file I/O is
    /// offloaded to `spawn_blocking` so it never parks an async worker
    /// thread for the duration of the wait.
    async fn with_state<T, F>(&self, f: F) -> BackendResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FileState) -> BackendResult<T> + Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path();
        tokio::task::spawn_blocking(move || Self::with_state_blocking(&path, &lock_path, f))
            .await
            .map_err(|e| BackendError::Other(anyhow::anyhow!(e)))?
    }

    fn with_state_blocking<T, F>(path: &Path, lock_path: &Path, f: F) -> BackendResult<T>
    where
        F: FnOnce(&mut FileState) -> BackendResult<T>,
    {
        let mut waited = Duration::ZERO;
        loop {
            match fs::create_dir(lock_path) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if waited >= Duration::from_secs(10) {
                        return Err(BackendError::Unreachable(format!(
                            "timed out waiting for lock on {}",
                            path.display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(20));
                    waited += Duration::from_millis(20);
                }
                Err(e) => return Err(BackendError::Other(e.into())),
            }
        }

        let outcome = (|| {
            let mut state = Self::load(path)?;
            let out = f(&mut state)?;
            Self::save(path, &state)?;
            Ok(out)
        })();

        let _ = fs::remove_dir(lock_path);
        outcome
    }

    fn load(path: &Path) -> BackendResult<FileState> {
        match fs::read(path) {
            Ok(bytes) if !bytes.is_empty() => {
                serde_json::from_slice(&bytes).map_err(|e| BackendError::Other(e.into()))
            }
            Ok(_) => Ok(FileState::default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileState::default()),
            Err(e) => Err(BackendError::Other(e.into())),
        }
    }

    fn save(path: &Path, state: &FileState) -> BackendResult<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| BackendError::Other(e.into()))?;
        }
        let bytes = serde_json::to_vec(state).map_err(|e| BackendError::Other(e.into()))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|e| BackendError::Other(e.into()))?;
        fs::rename(&tmp, path).map_err(|e| BackendError::Other(e.into()))?;
        Ok(())
    }
}

#[async_trait]
impl Backend for FileBackend {
    async fn create_test(
        &self,
        _scheduling_metadata: serde_json::Value,
        _backend_addr: String,
        _tags: Vec<String>,
        _env: HashMap<String, String>,
    ) -> BackendResult<TestId> {
        let id = TestId::new();
        let id2 = id.clone();
        self.with_state(move |state| {
            state.tests.insert(id2, TestState::default());
            Ok(())
        })
        .await?;
        Ok(id)
    }

    async fn create_scenario(
        &self,
        test_id: &TestId,
        name: &str,
        _context_blob: String,
        users_per_instance: usize,
        _tags: Vec<String>,
    ) -> BackendResult<ScenarioId> {
        let id = ScenarioId::new();
        let id2 = id.clone();
        let test_id = test_id.clone();
        let name = name.to_string();
        self.with_state(move |state| {
            if !state.tests.contains_key(&test_id) {
                return Err(BackendError::NotFound(format!("test {test_id}")));
            }
            state.scenarios.insert(
                id2,
                ScenarioState {
                    test_id,
                    users_per_instance: users_per_instance.max(1),
                    name,
                    ..Default::default()
                },
            );
            Ok(())
        })
        .await?;
        Ok(id)
    }

    async fn create_users(
        &self,
        test_id: &TestId,
        scenario_id: &ScenarioId,
        amount: u64,
    ) -> BackendResult<Vec<UserManagerId>> {
        let test_id = test_id.clone();
        let scenario_id = scenario_id.clone();
        self.with_state(move |state| {
            let users_per_instance = {
                let scenario = state
                    .scenarios
                    .get(&scenario_id)
                    .ok_or_else(|| BackendError::NotFound(format!("scenario {scenario_id}")))?;
                if scenario.test_id != test_id {
                    return Err(BackendError::NotFound(format!(
                        "scenario {scenario_id} does not belong to test {test_id}"
                    )));
                }
                scenario.users_per_instance as u64
            };

            let mut remaining = amount;
            let mut new_managers = Vec::new();

            while remaining > 0 {
                let batch = remaining.min(users_per_instance);
                remaining -= batch;

                let manager_id = UserManagerId::new();
                let user_ids: Vec<UserId> = (0..batch).map(|_| UserId::new()).collect();

                let mut events = HashMap::new();
                events.insert(START_USERS.to_string(), (vec![UserEvent::start_users(&user_ids)], 0));

                state.managers.insert(
                    manager_id.clone(),
                    ManagerState {
                        scenario_id: scenario_id.clone(),
                        users: user_ids.into_iter().collect(),
                        work: 0,
                        events,
                        retired: false,
                    },
                );

                new_managers.push(manager_id);
            }

            if let Some(scenario) = state.scenarios.get_mut(&scenario_id) {
                scenario.managers.extend(new_managers.clone());
            }

            Ok(new_managers)
        })
        .await
    }

    async fn stop_users(&self, scenario_id: &ScenarioId, amount: u64) -> BackendResult<()> {
        let scenario_id = scenario_id.clone();
        self.with_state(move |state| {
            let managers = {
                let scenario = state
                    .scenarios
                    .get(&scenario_id)
                    .ok_or_else(|| BackendError::NotFound(format!("scenario {scenario_id}")))?;
                scenario.managers.clone()
            };

            let mut remaining = amount;
            let mut emptied = Vec::new();

            for manager_id in managers.iter().rev() {
                if remaining == 0 {
                    break;
                }
                let Some(manager) = state.managers.get_mut(manager_id) else {
                    continue;
                };
                let to_stop = (remaining as usize).min(manager.users.len());
                if to_stop == 0 {
                    continue;
                }
                let stopped_ids: Vec<UserId> = manager.users.iter().take(to_stop).cloned().collect();
                for id in &stopped_ids {
                    manager.users.remove(id);
                }
                remaining -= to_stop as u64;

                let event = UserEvent::stop_users(&stopped_ids);
                manager.events.entry(STOP_USERS.to_string()).or_insert_with(|| (Vec::new(), 0)).0.push(event);

                if manager.users.is_empty() {
                    emptied.push(manager_id.clone());
                }
            }

            if !emptied.is_empty()
                && let Some(scenario) = state.scenarios.get_mut(&scenario_id)
            {
                scenario.managers.retain(|m| !emptied.contains(m));
            }
            for manager_id in emptied {
                if let Some(manager) = state.managers.get_mut(&manager_id) {
                    manager.retired = true;
                }
            }

            Ok(())
        })
        .await
    }

    async fn distribute_work(&self, scenario_id: &ScenarioId, amount: u64) -> BackendResult<()> {
        let scenario_id = scenario_id.clone();
        self.with_state(move |state| {
            let managers = {
                let scenario = state
                    .scenarios
                    .get(&scenario_id)
                    .ok_or_else(|| BackendError::NotFound(format!("scenario {scenario_id}")))?;
                scenario.managers.clone()
            };

            if managers.is_empty() {
                return Ok(());
            }

            let shares = split_evenly(amount, &managers);
            for (idx, manager_id) in managers.iter().enumerate() {
                if let Some(share) = shares.get(&idx)
                    && let Some(manager) = state.managers.get_mut(manager_id)
                {
                    manager.work += *share as i64;
                }
            }

            Ok(())
        })
        .await
    }

    async fn get_user_work(&self, manager_id: &UserManagerId) -> BackendResult<WorkToken> {
        let manager_id = manager_id.clone();
        self.with_state(move |state| {
            let manager = state
                .managers
                .get_mut(&manager_id)
                .ok_or_else(|| BackendError::NotFound(format!("manager {manager_id}")))?;
            let work = manager.work.max(0) as u64;
            manager.work = 0;
            Ok(work)
        })
        .await
    }

    async fn add_user_event(
        &self,
        scenario_id: &ScenarioId,
        kind: &str,
        payload: serde_json::Value,
    ) -> BackendResult<EventId> {
        let scenario_id = scenario_id.clone();
        let kind = kind.to_string();
        self.with_state(move |state| {
            let managers = {
                let scenario = state
                    .scenarios
                    .get(&scenario_id)
                    .ok_or_else(|| BackendError::NotFound(format!("scenario {scenario_id}")))?;
                scenario.managers.clone()
            };

            let event_id = EventId::new();
            let event = UserEvent { kind: kind.clone(), payload };

            for manager_id in managers {
                if let Some(manager) = state.managers.get_mut(&manager_id) {
                    manager.events.entry(kind.clone()).or_insert_with(|| (Vec::new(), 0)).0.push(event.clone());
                }
            }

            Ok(event_id)
        })
        .await
    }

    async fn get_user_events(&self, manager_id: &UserManagerId, kind: &str) -> BackendResult<Vec<UserEvent>> {
        let manager_id = manager_id.clone();
        let kind = kind.to_string();
        self.with_state(move |state| {
            let Some(manager) = state.managers.get_mut(&manager_id) else {
                return Ok(Vec::new());
            };
            let Some((log, cursor)) = manager.events.get_mut(&kind) else {
                return Ok(Vec::new());
            };
            let fresh = log[*cursor..].to_vec();
            *cursor = log.len();
            let deliver_retirement = manager.retired && kind == STOP_USERS && !fresh.is_empty();

            if deliver_retirement {
                state.managers.remove(&manager_id);
            }

            Ok(fresh)
        })
        .await
    }

    async fn add_user_results(&self, manager_id: &UserManagerId, results: Vec<InvocationResult>) -> BackendResult<()> {
        if results.is_empty() {
            return Ok(());
        }
        let manager_id = manager_id.clone();
        self.with_state(move |state| {
            let scenario_id = state
                .managers
                .get(&manager_id)
                .ok_or_else(|| BackendError::NotFound(format!("manager {manager_id}")))?
                .scenario_id
                .clone();
            if let Some(scenario) = state.scenarios.get_mut(&scenario_id) {
                scenario.result_queue.extend(results);
            }
            Ok(())
        })
        .await
    }

    async fn move_user_results(&self, scenario_id: &ScenarioId, limit: usize) -> BackendResult<Vec<InvocationResult>> {
        let scenario_id = scenario_id.clone();
        self.with_state(move |state| {
            let scenario = state
                .scenarios
                .get_mut(&scenario_id)
                .ok_or_else(|| BackendError::NotFound(format!("scenario {scenario_id}")))?;
            let take = limit.min(scenario.result_queue.len());
            Ok(scenario.result_queue.drain(..take).collect())
        })
        .await
    }

    async fn set_scenario_result(&self, scenario_id: &ScenarioId, result: ScenarioResult) -> BackendResult<()> {
        let scenario_id = scenario_id.clone();
        self.with_state(move |state| {
            let scenario = state
                .scenarios
                .get_mut(&scenario_id)
                .ok_or_else(|| BackendError::NotFound(format!("scenario {scenario_id}")))?;
            scenario.scenario_result = Some(result);
            Ok(())
        })
        .await
    }

    async fn move_scenario_result(&self, scenario_id: &ScenarioId) -> BackendResult<Option<ScenarioResult>> {
        let scenario_id = scenario_id.clone();
        self.with_state(move |state| {
            let Some(scenario) = state.scenarios.get_mut(&scenario_id) else {
                return Ok(None);
            };
            Ok(scenario.scenario_result.take())
        })
        .await
    }

    async fn add_test_event(&self, test_id: &TestId, event: TestEvent) -> BackendResult<()> {
        let test_id = test_id.clone();
        self.with_state(move |state| {
            let test =
                state.tests.get_mut(&test_id).ok_or_else(|| BackendError::NotFound(format!("test {test_id}")))?;
            test.test_events.push_back(event);
            Ok(())
        })
        .await
    }

    async fn get_test_events(&self, test_id: &TestId) -> BackendResult<Vec<TestEvent>> {
        let test_id = test_id.clone();
        self.with_state(move |state| {
            let Some(test) = state.tests.get_mut(&test_id) else {
                return Ok(Vec::new());
            };
            Ok(test.test_events.drain(..).collect())
        })
        .await
    }

    async fn register_test_instance(&self, test_id: &TestId, instance_id: &str) -> BackendResult<()> {
        let test_id = test_id.clone();
        let instance_id = instance_id.to_string();
        self.with_state(move |state| {
            let test =
                state.tests.get_mut(&test_id).ok_or_else(|| BackendError::NotFound(format!("test {test_id}")))?;
            test.instances.insert(instance_id);
            Ok(())
        })
        .await
    }

    async fn check_test_instance(&self, test_id: &TestId, instance_id: &str) -> BackendResult<bool> {
        let test_id = test_id.clone();
        let instance_id = instance_id.to_string();
        self.with_state(move |state| {
            Ok(state.tests.get(&test_id).map(|t| t.instances.contains(&instance_id)).unwrap_or(false))
        })
        .await
    }

    async fn clean_test_instances(&self, test_id: &TestId) -> BackendResult<()> {
        let test_id = test_id.clone();
        self.with_state(move |state| {
            if let Some(test) = state.tests.get_mut(&test_id) {
                test.instances.clear();
            }
            Ok(())
        })
        .await
    }

    async fn add_metric(&self, scenario_id: &ScenarioId, name: &str, value: f64) -> BackendResult<()> {
        let scenario_id = scenario_id.clone();
        let name = name.to_string();
        self.with_state(move |state| {
            let scenario = state
                .scenarios
                .get_mut(&scenario_id)
                .ok_or_else(|| BackendError::NotFound(format!("scenario {scenario_id}")))?;
            scenario.metrics.entry(name).or_default().push(value);
            Ok(())
        })
        .await
    }

    async fn get_metric_total(&self, scenario_id: &ScenarioId, name: &str) -> BackendResult<Option<f64>> {
        let scenario_id = scenario_id.clone();
        let name = name.to_string();
        self.with_state(move |state| Ok(series(state, &scenario_id, &name).map(|s| s.iter().sum()))).await
    }

    async fn get_last_metric(&self, scenario_id: &ScenarioId, name: &str) -> BackendResult<Option<f64>> {
        let scenario_id = scenario_id.clone();
        let name = name.to_string();
        self.with_state(move |state| Ok(series(state, &scenario_id, &name).and_then(|s| s.last().copied()))).await
    }

    async fn get_metric_statistics(
        &self,
        scenario_id: &ScenarioId,
        name: &str,
    ) -> BackendResult<Option<MetricStatistics>> {
        let scenario_id = scenario_id.clone();
        let name = name.to_string();
        self.with_state(move |state| {
            let Some(samples) = series(state, &scenario_id, &name) else {
                return Ok(None);
            };
            if samples.is_empty() {
                return Ok(None);
            }
            let mut sorted = samples.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let len = sorted.len();
            let median =
                if len % 2 == 0 { (sorted[len / 2 - 1] + sorted[len / 2]) / 2.0 } else { sorted[len / 2] };
            Ok(Some(MetricStatistics {
                min: sorted[0],
                max: sorted[len - 1],
                median,
                average: sorted.iter().sum::<f64>() / len as f64,
                len,
            }))
        })
        .await
    }

    async fn get_metric_rate(&self, scenario_id: &ScenarioId, name: &str, split_point: f64) -> BackendResult<Option<f64>> {
        let scenario_id = scenario_id.clone();
        let name = name.to_string();
        self.with_state(move |state| {
            let Some(samples) = series(state, &scenario_id, &name) else {
                return Ok(None);
            };
            if samples.is_empty() {
                return Ok(None);
            }
            let above = samples.iter().filter(|v| **v > split_point).count();
            Ok(Some(above as f64 / samples.len() as f64))
        })
        .await
    }
}

fn series<'a>(state: &'a FileState, scenario_id: &ScenarioId, name: &str) -> Option<&'a Vec<f64>> {
    state.scenarios.get(scenario_id)?.metrics.get(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(label: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("surge-file-backend-test-{label}-{}.json", uuid::Uuid::new_v4()));
        path
    }

    #[tokio::test]
    async fn round_trips_state_through_the_json_file() {
        let path = temp_path("roundtrip");
        let backend = FileBackend::new(&path);

        let test_id = backend
            .create_test(serde_json::json!({}), String::new(), vec![], Default::default())
            .await
            .unwrap();
        let scenario_id = backend.create_scenario(&test_id, "s", "e30=".into(), 2, vec![]).await.unwrap();

        // A second handle pointed at the same path sees the first's writes,
        // the whole point of this backend: two separate `FileBackend`
        // instances, standing in for controller and worker processes.
        let other_handle = FileBackend::new(&path);
        let managers = other_handle.create_users(&test_id, &scenario_id, 2).await.unwrap();
        assert_eq!(managers.len(), 1);

        other_handle.distribute_work(&scenario_id, 4).await.unwrap();
        let work = backend.get_user_work(&managers[0]).await.unwrap();
        assert_eq!(work, 4);

        let _ = fs::remove_file(&path);
        let _ = fs::remove_file(path.with_extension("tmp"));
    }

    #[tokio::test]
    async fn stop_users_retires_emptied_managers_but_keeps_the_stop_event_readable() {
        let path = temp_path("stop-users");
        let backend = FileBackend::new(&path);

        let test_id = backend
            .create_test(serde_json::json!({}), String::new(), vec![], Default::default())
            .await
            .unwrap();
        let scenario_id = backend.create_scenario(&test_id, "s", "e30=".into(), 2, vec![]).await.unwrap();
        let managers = backend.create_users(&test_id, &scenario_id, 2).await.unwrap();
        let manager_id = managers[0].clone();

        backend.stop_users(&scenario_id, 2).await.unwrap();

        let events = backend.get_user_events(&manager_id, STOP_USERS).await.unwrap();
        assert_eq!(events.len(), 1);

        // Drained and torn down: a second read finds nothing, not an error.
        let events_again = backend.get_user_events(&manager_id, STOP_USERS).await.unwrap();
        assert!(events_again.is_empty());

        let _ = fs::remove_file(&path);
        let _ = fs::remove_file(path.with_extension("tmp"));
    }
}
