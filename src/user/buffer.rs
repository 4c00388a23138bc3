//! User Buffer (§4.2): per-worker-process shared cache that batches
//! outbound results and splits inbound work/events across the logical
//! users hosted in this process.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::sync::Mutex;

use crate::backend::Backend;
use crate::model::{Result as InvocationResult, UserEvent, UserId, UserManagerId};

#[derive(Default)]
struct BufferState {
    events_by_user: HashMap<UserId, VecDeque<UserEvent>>,
    work_by_user: HashMap<UserId, u64>,
    pending_results: Vec<InvocationResult>,
}

/// Shared by every user runner task hosted in one worker process.
///
/// All operations are serialized through a single [`tokio::sync::Mutex`]:
/// single-producer-from-each-user, single-consumer state machine for
/// events/work, MPSC for results (§4.2 Concurrency).
pub struct UserBuffer {
    manager_id: UserManagerId,
    backend: Arc<dyn Backend>,
    state: Mutex<BufferState>,
}

impl UserBuffer {
    pub fn new(manager_id: UserManagerId, backend: Arc<dyn Backend>) -> Self {
        Self {
            manager_id,
            backend,
            state: Mutex::new(BufferState::default()),
        }
    }

    pub fn manager_id(&self) -> &UserManagerId {
        &self.manager_id
    }

    /// Registers newly announced users: an empty event queue and a zero
    /// work counter each.
    pub async fn add_users(&self, ids: &[UserId]) {
        let mut state = self.state.lock().await;
        for id in ids {
            state.events_by_user.entry(id.clone()).or_default();
            state.work_by_user.entry(id.clone()).or_insert(0);
        }
    }

    pub async fn tracked_user_count(&self) -> usize {
        self.state.lock().await.events_by_user.len()
    }

    /// If the user's queue is empty, pulls one batch from the backend and
    /// appends it to *every* tracked user's queue (manager-wide broadcast
    /// within this worker process), then drains and returns this user's
    /// queue.
    pub async fn get_user_events(&self, user_id: &UserId, kind: &str) -> Vec<UserEvent> {
        let mut state = self.state.lock().await;

        let is_empty = state
            .events_by_user
            .get(user_id)
            .map(|q| q.is_empty())
            .unwrap_or(true);

        if is_empty {
            let fetched = self
                .backend
                .get_user_events(&self.manager_id, kind)
                .await
                .unwrap_or_default();

            if !fetched.is_empty() {
                for queue in state.events_by_user.values_mut() {
                    queue.extend(fetched.iter().cloned());
                }
            }
        }

        state
            .events_by_user
            .get_mut(user_id)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    /// If the user's counter is zero, pulls the manager's total work from
    /// the backend and splits it across all tracked users: base = total /
    /// N, remainder distributed one-per-user in a freshly shuffled order.
    /// Then atomically drains and returns the user's counter.
    pub async fn get_user_work(&self, user_id: &UserId) -> u64 {
        let mut state = self.state.lock().await;

        let current = state.work_by_user.get(user_id).copied().unwrap_or(0);
        if current == 0 {
            let total = self
                .backend
                .get_user_work(&self.manager_id)
                .await
                .unwrap_or(0);

            if total > 0 {
                let mut users: Vec<UserId> = state.work_by_user.keys().cloned().collect();
                users.shuffle(&mut thread_rng());

                let n = users.len() as u64;
                if n > 0 {
                    let base = total / n;
                    let remainder = (total % n) as usize;

                    for (i, uid) in users.iter().enumerate() {
                        let mut share = base;
                        if i < remainder {
                            share += 1;
                        }
                        *state.work_by_user.entry(uid.clone()).or_insert(0) += share;
                    }
                }
            }
        }

        let entry = state.work_by_user.entry(user_id.clone()).or_insert(0);
        let drained = *entry;
        *entry = 0;
        drained
    }

    pub async fn add_user_result(&self, result: InvocationResult) {
        self.state.lock().await.pending_results.push(result);
    }

    /// Flushes pending results to the backend in one call and clears them.
    pub async fn send_user_results(&self) {
        let batch = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.pending_results)
        };
        if batch.is_empty() {
            return;
        }
        if let Err(err) = self.backend.add_user_results(&self.manager_id, batch).await {
            tracing::warn!("failed to flush user results for {}: {err}", self.manager_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::model::{START_USERS, ScenarioId, TestId};

    async fn setup() -> (Arc<MemoryBackend>, ScenarioId, UserBuffer, Vec<UserId>) {
        let backend = Arc::new(MemoryBackend::new());
        let test_id = backend
            .create_test(serde_json::json!({}), String::new(), vec![], Default::default())
            .await
            .unwrap();
        let scenario_id = backend
            .create_scenario(&test_id, "s", "e30=".into(), 3, vec![])
            .await
            .unwrap();
        let managers = backend.create_users(&test_id, &scenario_id, 3).await.unwrap();
        let manager_id = managers[0].clone();

        let buffer = UserBuffer::new(manager_id.clone(), backend.clone());

        let events = backend.get_user_events(&manager_id, START_USERS).await.unwrap();
        let ids = events[0].ids();
        buffer.add_users(&ids).await;

        (backend, scenario_id, buffer, ids)
    }

    #[tokio::test]
    async fn work_distribution_sums_to_total_across_users() {
        let (backend, scenario_id, buffer, ids) = setup().await;
        backend.distribute_work(&scenario_id, 11).await.unwrap();

        let mut total = 0u64;
        for id in &ids {
            total += buffer.get_user_work(id).await;
        }
        assert_eq!(total, 11);
    }

    #[tokio::test]
    async fn events_broadcast_to_every_tracked_user() {
        let (backend, scenario_id, buffer, ids) = setup().await;
        backend
            .add_user_event(&scenario_id, "PING", serde_json::json!({}))
            .await
            .unwrap();

        for id in &ids {
            let events = buffer.get_user_events(id, "PING").await;
            assert_eq!(events.len(), 1);
        }
    }

    #[tokio::test]
    async fn results_flush_in_one_batch() {
        let (backend, scenario_id, buffer, _ids) = setup().await;

        for _ in 0..3 {
            buffer
                .add_user_result(InvocationResult {
                    id: crate::model::ResultId::new(),
                    output: serde_json::json!(1),
                    exception: None,
                    logs: String::new(),
                    timestamp: chrono::Utc::now(),
                    time_taken: 0.01,
                })
                .await;
        }

        buffer.send_user_results().await;

        let drained = backend.move_user_results(&scenario_id, 10).await.unwrap();
        assert_eq!(drained.len(), 3);
    }
}
