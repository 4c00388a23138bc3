//! In-process reference implementation of [`Backend`].
//!
//! Grounded on the teacher's `SandboxPool`/`ImageCache` pattern: plain
//! `HashMap`/`VecDeque` state behind a single `Mutex`, async methods that
//! lock just long enough to mutate, no cross-await holding of the guard.
//! Real deployments would put a networked store behind the same trait;
//! this one is enough to run an entire test end-to-end in one process,
//! which is what the `LOCAL` worker mode and this crate's test suite need.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::thread_rng;

use super::{Backend, BackendError, BackendResult, WorkToken};
use crate::model::{
    EventId, MetricStatistics, Result as InvocationResult, STOP_USERS, ScenarioId, ScenarioResult,
    TestEvent, TestId, UserEvent, UserId, UserManagerId, START_USERS,
};

#[derive(Default)]
struct ScenarioState {
    test_id: TestId,
    name: String,
    users_per_instance: usize,
    /// Managers currently hosting at least one live user for this scenario.
    managers: Vec<UserManagerId>,
    result_queue: VecDeque<InvocationResult>,
    scenario_result: Option<ScenarioResult>,
    metrics: HashMap<String, Vec<f64>>,
}

#[derive(Default)]
struct ManagerState {
    scenario_id: ScenarioId,
    users: HashSet<UserId>,
    work: i64,
    /// Per-kind append-only event log for this manager, with a read cursor.
    events: HashMap<String, (Vec<UserEvent>, usize)>,
    /// Set once this manager has lost its last user via `stop_users`. A
    /// retired manager is dropped from `Inner::managers` only after its
    /// `STOP_USERS` log has actually been read once, so the event it was
    /// retired for is never lost to a consumer that hasn't seen it yet.
    retired: bool,
}

#[derive(Default)]
struct TestState {
    instances: HashSet<String>,
    test_events: VecDeque<TestEvent>,
}

#[derive(Default)]
struct Inner {
    tests: HashMap<TestId, TestState>,
    scenarios: HashMap<ScenarioId, ScenarioState>,
    managers: HashMap<UserManagerId, ManagerState>,
}

/// In-memory backend store. Cloning is cheap (it's an `Arc` internally via
/// `Mutex` held behind a single struct); share one instance across every
/// component in a process with `Arc<MemoryBackend>`.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits `total` across `targets` as `base = total / n`, remainder
    /// `total % n` assigned one per target in a freshly shuffled order.
    /// Shared by work distribution at both the manager level (here) and
    /// the per-user level (`crate::user::buffer`), preventing starvation
    /// of any one target across repeated distributions.
    pub(crate) fn split_evenly<T: Clone>(total: u64, targets: &[T]) -> HashMap<usize, u64> {
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
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create_test(
        &self,
        _scheduling_metadata: serde_json::Value,
        _backend_addr: String,
        _tags: Vec<String>,
        _env: HashMap<String, String>,
    ) -> BackendResult<TestId> {
        let id = TestId::new();
        let mut inner = self.inner.lock().unwrap();
        inner.tests.insert(id.clone(), TestState::default());
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
        let mut inner = self.inner.lock().unwrap();
        if !inner.tests.contains_key(test_id) {
            return Err(BackendError::NotFound(format!("test {test_id}")));
        }
        inner.scenarios.insert(
            id.clone(),
            ScenarioState {
                test_id: test_id.clone(),
                users_per_instance: users_per_instance.max(1),
                name: name.to_string(),
                ..Default::default()
            },
        );
        Ok(id)
    }

    async fn create_users(
        &self,
        test_id: &TestId,
        scenario_id: &ScenarioId,
        amount: u64,
    ) -> BackendResult<Vec<UserManagerId>> {
        let mut inner = self.inner.lock().unwrap();
        let users_per_instance = {
            let scenario = inner
                .scenarios
                .get(scenario_id)
                .ok_or_else(|| BackendError::NotFound(format!("scenario {scenario_id}")))?;
            if &scenario.test_id != test_id {
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
            events.insert(
                START_USERS.to_string(),
                (vec![UserEvent::start_users(&user_ids)], 0),
            );

            inner.managers.insert(
                manager_id.clone(),
                ManagerState {
                    scenario_id: scenario_id.clone(),
                    users: user_ids.into_iter().collect(),
                    work: 0,
                    events,
                },
            );

            new_managers.push(manager_id);
        }

        if let Some(scenario) = inner.scenarios.get_mut(scenario_id) {
            scenario.managers.extend(new_managers.clone());
        }

        Ok(new_managers)
    }

    async fn stop_users(&self, scenario_id: &ScenarioId, amount: u64) -> BackendResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let managers = {
            let scenario = inner
                .scenarios
                .get(scenario_id)
                .ok_or_else(|| BackendError::NotFound(format!("scenario {scenario_id}")))?;
            scenario.managers.clone()
        };

        let mut remaining = amount;
        let mut emptied = Vec::new();

        // Retire from the most recently created managers first.
        for manager_id in managers.iter().rev() {
            if remaining == 0 {
                break;
            }
            let Some(manager) = inner.managers.get_mut(manager_id) else {
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
            manager
                .events
                .entry(STOP_USERS.to_string())
                .or_insert_with(|| (Vec::new(), 0))
                .0
                .push(event);

            if manager.users.is_empty() {
                emptied.push(manager_id.clone());
            }
        }

        if !emptied.is_empty()
            && let Some(scenario) = inner.scenarios.get_mut(scenario_id)
        {
            scenario.managers.retain(|m| !emptied.contains(m));
        }
        // Retiring here (rather than removing outright) keeps the manager's
        // just-written STOP_USERS event readable: `get_user_events` tears it
        // down itself once that event has actually been delivered.
        for manager_id in emptied {
            if let Some(manager) = inner.managers.get_mut(&manager_id) {
                manager.retired = true;
            }
        }

        Ok(())
    }

    async fn distribute_work(&self, scenario_id: &ScenarioId, amount: u64) -> BackendResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let managers = {
            let scenario = inner
                .scenarios
                .get(scenario_id)
                .ok_or_else(|| BackendError::NotFound(format!("scenario {scenario_id}")))?;
            scenario.managers.clone()
        };

        if managers.is_empty() {
            // Buffered-before-users-exist case (§9 Design Notes): this
            // reference backend simply drops work posted with no users,
            // which spec.md explicitly allows as long as property #4
            // holds once users exist.
            return Ok(());
        }

        let shares = Self::split_evenly(amount, &managers);
        for (idx, manager_id) in managers.iter().enumerate() {
            if let Some(share) = shares.get(&idx)
                && let Some(manager) = inner.managers.get_mut(manager_id)
            {
                manager.work += *share as i64;
            }
        }

        Ok(())
    }

    async fn get_user_work(&self, manager_id: &UserManagerId) -> BackendResult<WorkToken> {
        let mut inner = self.inner.lock().unwrap();
        let manager = inner
            .managers
            .get_mut(manager_id)
            .ok_or_else(|| BackendError::NotFound(format!("manager {manager_id}")))?;
        let work = manager.work.max(0) as u64;
        manager.work = 0;
        Ok(work)
    }

    async fn add_user_event(
        &self,
        scenario_id: &ScenarioId,
        kind: &str,
        payload: serde_json::Value,
    ) -> BackendResult<EventId> {
        let mut inner = self.inner.lock().unwrap();
        let managers = {
            let scenario = inner
                .scenarios
                .get(scenario_id)
                .ok_or_else(|| BackendError::NotFound(format!("scenario {scenario_id}")))?;
            scenario.managers.clone()
        };

        let event_id = EventId::new();
        let event = UserEvent {
            kind: kind.to_string(),
            payload,
        };

        for manager_id in managers {
            if let Some(manager) = inner.managers.get_mut(&manager_id) {
                manager
                    .events
                    .entry(kind.to_string())
                    .or_insert_with(|| (Vec::new(), 0))
                    .0
                    .push(event.clone());
            }
        }

        Ok(event_id)
    }

    async fn get_user_events(
        &self,
        manager_id: &UserManagerId,
        kind: &str,
    ) -> BackendResult<Vec<UserEvent>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(manager) = inner.managers.get_mut(manager_id) else {
            return Ok(Vec::new());
        };
        let Some((log, cursor)) = manager.events.get_mut(kind) else {
            return Ok(Vec::new());
        };
        let fresh = log[*cursor..].to_vec();
        *cursor = log.len();
        let deliver_retirement = manager.retired && kind == STOP_USERS && !fresh.is_empty();

        if deliver_retirement {
            inner.managers.remove(manager_id);
        }

        Ok(fresh)
    }

    async fn add_user_results(
        &self,
        manager_id: &UserManagerId,
        results: Vec<InvocationResult>,
    ) -> BackendResult<()> {
        if results.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        let scenario_id = inner
            .managers
            .get(manager_id)
            .ok_or_else(|| BackendError::NotFound(format!("manager {manager_id}")))?
            .scenario_id
            .clone();
        if let Some(scenario) = inner.scenarios.get_mut(&scenario_id) {
            scenario.result_queue.extend(results);
        }
        Ok(())
    }

    async fn move_user_results(
        &self,
        scenario_id: &ScenarioId,
        limit: usize,
    ) -> BackendResult<Vec<InvocationResult>> {
        let mut inner = self.inner.lock().unwrap();
        let scenario = inner
            .scenarios
            .get_mut(scenario_id)
            .ok_or_else(|| BackendError::NotFound(format!("scenario {scenario_id}")))?;
        let take = limit.min(scenario.result_queue.len());
        Ok(scenario.result_queue.drain(..take).collect())
    }

    async fn set_scenario_result(
        &self,
        scenario_id: &ScenarioId,
        result: ScenarioResult,
    ) -> BackendResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let scenario = inner
            .scenarios
            .get_mut(scenario_id)
            .ok_or_else(|| BackendError::NotFound(format!("scenario {scenario_id}")))?;
        scenario.scenario_result = Some(result);
        Ok(())
    }

    async fn move_scenario_result(
        &self,
        scenario_id: &ScenarioId,
    ) -> BackendResult<Option<ScenarioResult>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(scenario) = inner.scenarios.get_mut(scenario_id) else {
            return Ok(None);
        };
        Ok(scenario.scenario_result.take())
    }

    async fn add_test_event(&self, test_id: &TestId, event: TestEvent) -> BackendResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let test = inner
            .tests
            .get_mut(test_id)
            .ok_or_else(|| BackendError::NotFound(format!("test {test_id}")))?;
        test.test_events.push_back(event);
        Ok(())
    }

    async fn get_test_events(&self, test_id: &TestId) -> BackendResult<Vec<TestEvent>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(test) = inner.tests.get_mut(test_id) else {
            return Ok(Vec::new());
        };
        Ok(test.test_events.drain(..).collect())
    }

    async fn register_test_instance(&self, test_id: &TestId, instance_id: &str) -> BackendResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let test = inner
            .tests
            .get_mut(test_id)
            .ok_or_else(|| BackendError::NotFound(format!("test {test_id}")))?;
        test.instances.insert(instance_id.to_string());
        Ok(())
    }

    async fn check_test_instance(&self, test_id: &TestId, instance_id: &str) -> BackendResult<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tests
            .get(test_id)
            .map(|t| t.instances.contains(instance_id))
            .unwrap_or(false))
    }

    async fn clean_test_instances(&self, test_id: &TestId) -> BackendResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(test) = inner.tests.get_mut(test_id) {
            test.instances.clear();
        }
        Ok(())
    }

    async fn add_metric(&self, scenario_id: &ScenarioId, name: &str, value: f64) -> BackendResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let scenario = inner
            .scenarios
            .get_mut(scenario_id)
            .ok_or_else(|| BackendError::NotFound(format!("scenario {scenario_id}")))?;
        scenario.metrics.entry(name.to_string()).or_default().push(value);
        Ok(())
    }

    async fn get_metric_total(&self, scenario_id: &ScenarioId, name: &str) -> BackendResult<Option<f64>> {
        let inner = self.inner.lock().unwrap();
        Ok(series(&inner, scenario_id, name).map(|s| s.iter().sum()))
    }

    async fn get_last_metric(&self, scenario_id: &ScenarioId, name: &str) -> BackendResult<Option<f64>> {
        let inner = self.inner.lock().unwrap();
        Ok(series(&inner, scenario_id, name).and_then(|s| s.last().copied()))
    }

    async fn get_metric_statistics(
        &self,
        scenario_id: &ScenarioId,
        name: &str,
    ) -> BackendResult<Option<MetricStatistics>> {
        let inner = self.inner.lock().unwrap();
        let Some(samples) = series(&inner, scenario_id, name) else {
            return Ok(None);
        };
        if samples.is_empty() {
            return Ok(None);
        }
        let mut sorted = samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let len = sorted.len();
        let median = if len % 2 == 0 {
            (sorted[len / 2 - 1] + sorted[len / 2]) / 2.0
        } else {
            sorted[len / 2]
        };
        Ok(Some(MetricStatistics {
            min: sorted[0],
            max: sorted[len - 1],
            median,
            average: sorted.iter().sum::<f64>() / len as f64,
            len,
        }))
    }

    async fn get_metric_rate(
        &self,
        scenario_id: &ScenarioId,
        name: &str,
        split_point: f64,
    ) -> BackendResult<Option<f64>> {
        let inner = self.inner.lock().unwrap();
        let Some(samples) = series(&inner, scenario_id, name) else {
            return Ok(None);
        };
        if samples.is_empty() {
            return Ok(None);
        }
        let above = samples.iter().filter(|v| **v > split_point).count();
        Ok(Some(above as f64 / samples.len() as f64))
    }
}

fn series<'a>(inner: &'a Inner, scenario_id: &ScenarioId, name: &str) -> Option<&'a Vec<f64>> {
    inner.scenarios.get(scenario_id)?.metrics.get(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResultId;

    async fn new_test_and_scenario(backend: &MemoryBackend) -> (TestId, ScenarioId) {
        let test_id = backend
            .create_test(serde_json::json!({}), String::new(), vec![], HashMap::new())
            .await
            .unwrap();
        let scenario_id = backend
            .create_scenario(&test_id, "demo", "e30=".to_string(), 2, vec![])
            .await
            .unwrap();
        (test_id, scenario_id)
    }

    #[tokio::test]
    async fn create_users_splits_across_managers_by_users_per_instance() {
        let backend = MemoryBackend::new();
        let (test_id, scenario_id) = new_test_and_scenario(&backend).await;

        let managers = backend.create_users(&test_id, &scenario_id, 5).await.unwrap();
        // users_per_instance = 2 => ceil(5/2) = 3 managers
        assert_eq!(managers.len(), 3);
    }

    #[tokio::test]
    async fn work_distribution_sums_to_total() {
        let backend = MemoryBackend::new();
        let (test_id, scenario_id) = new_test_and_scenario(&backend).await;
        let managers = backend.create_users(&test_id, &scenario_id, 3).await.unwrap();

        backend.distribute_work(&scenario_id, 11).await.unwrap();

        let mut total = 0u64;
        for manager in &managers {
            total += backend.get_user_work(manager).await.unwrap();
        }
        assert_eq!(total, 11);
    }

    #[tokio::test]
    async fn move_scenario_result_is_one_shot() {
        let backend = MemoryBackend::new();
        let (_test_id, scenario_id) = new_test_and_scenario(&backend).await;

        assert!(backend.move_scenario_result(&scenario_id).await.unwrap().is_none());

        backend
            .set_scenario_result(
                &scenario_id,
                ScenarioResult {
                    id: ResultId::new(),
                    output: serde_json::json!(42),
                    exception: None,
                    logs: String::new(),
                    timestamp: chrono::Utc::now(),
                    time_taken: 0.1,
                    succeeded: 1,
                    failed: 0,
                },
            )
            .await
            .unwrap();

        let result = backend.move_scenario_result(&scenario_id).await.unwrap();
        assert!(result.is_some());
        assert!(backend.move_scenario_result(&scenario_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stop_users_retires_emptied_managers_but_keeps_the_stop_event_readable() {
        let backend = MemoryBackend::new();
        let (test_id, scenario_id) = new_test_and_scenario(&backend).await;
        let managers = backend.create_users(&test_id, &scenario_id, 2).await.unwrap();
        assert_eq!(managers.len(), 1);
        let manager_id = managers[0].clone();

        backend.stop_users(&scenario_id, 2).await.unwrap();

        {
            let inner = backend.inner.lock().unwrap();
            assert!(inner.scenarios.get(&scenario_id).unwrap().managers.is_empty());
            // Retired, not yet torn down: nobody has read the STOP_USERS
            // event this call just wrote.
            assert!(inner.managers.contains_key(&manager_id));
        }

        let events = backend.get_user_events(&manager_id, STOP_USERS).await.unwrap();
        assert_eq!(events.len(), 1);

        let inner = backend.inner.lock().unwrap();
        assert!(inner.managers.is_empty());
    }

    #[tokio::test]
    async fn metric_statistics_computes_min_median_max() {
        let backend = MemoryBackend::new();
        let (_test_id, scenario_id) = new_test_and_scenario(&backend).await;

        for v in [1.0, 2.0, 3.0, 4.0] {
            backend.add_metric(&scenario_id, "latency", v).await.unwrap();
        }

        let stats = backend
            .get_metric_statistics(&scenario_id, "latency")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 4.0);
        assert_eq!(stats.median, 2.5);
        assert_eq!(stats.len, 4);
    }
}
