//! Backend Store: the single shared mutable resource and synchronization
//! point between otherwise isolated processes (§4.1).
//!
//! The production contract is an RPC surface; this crate specifies it as
//! an async trait so callers (scenario runtime, user buffer, test runner,
//! worker launchers) are agnostic to transport. [`memory::MemoryBackend`]
//! is the in-process reference implementation used by the `LOCAL` worker
//! mode and by every test in this crate. [`file::FileBackend`] persists the
//! same contract to a JSON file so `DOCKER`/`KUBE` workers, launched as
//! separate processes, reach the controller's actual state.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::model::{
    EventId, MetricStatistics, Result as InvocationResult, ScenarioId, ScenarioResult, TestEvent,
    TestId, UserEvent, UserId, UserManagerId,
};

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Errors surfaced by the backend client surface.
///
/// Per §7, "transient not-found" (e.g. `move_scenario_result` before
/// completion) is *not* modeled as an error here — those ops return
/// `Option`/empty collections directly. [`BackendError::NotFound`] is
/// reserved for operations that reference an id the store has never seen
/// (an unknown scenario, test, or manager), which is always a caller
/// bug or a stale reference, not a normal polling outcome.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// An abstract credit for one scenario invocation, produced by
/// `distribute_work` and consumed by `has_work`.
pub type WorkToken = u64;

/// The backend RPC surface consumed by the rest of the engine. Every call
/// is independent; implementations should treat each as a standalone
/// request/response regardless of what transport carries it.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Registers a test; returns a fresh id.
    async fn create_test(
        &self,
        scheduling_metadata: serde_json::Value,
        backend_addr: String,
        tags: Vec<String>,
        env: HashMap<String, String>,
    ) -> BackendResult<TestId>;

    /// Registers a scenario-in-test.
    async fn create_scenario(
        &self,
        test_id: &TestId,
        name: &str,
        context_blob: String,
        users_per_instance: usize,
        tags: Vec<String>,
    ) -> BackendResult<ScenarioId>;

    /// Launches up to `ceil(amount / users_per_instance)` managers; returns
    /// their ids. Idempotent across retries only by natural id uniqueness.
    async fn create_users(
        &self,
        test_id: &TestId,
        scenario_id: &ScenarioId,
        amount: u64,
    ) -> BackendResult<Vec<UserManagerId>>;

    /// Asks the scenario to retire `amount` users; translates to
    /// `STOP_USERS` user events and manager teardown when managers empty.
    async fn stop_users(&self, scenario_id: &ScenarioId, amount: u64) -> BackendResult<()>;

    /// Adds `amount` work tokens evenly distributable across the
    /// scenario's managers.
    async fn distribute_work(&self, scenario_id: &ScenarioId, amount: u64) -> BackendResult<()>;

    /// Atomically drains and returns the manager's current work count.
    async fn get_user_work(&self, manager_id: &UserManagerId) -> BackendResult<WorkToken>;

    /// Fan-out channel from scenario to every manager hosting its users.
    async fn add_user_event(
        &self,
        scenario_id: &ScenarioId,
        kind: &str,
        payload: serde_json::Value,
    ) -> BackendResult<EventId>;

    /// Drains events of `kind` destined for this manager.
    async fn get_user_events(
        &self,
        manager_id: &UserManagerId,
        kind: &str,
    ) -> BackendResult<Vec<UserEvent>>;

    /// Appends to the scenario's result queue on behalf of `manager_id`.
    async fn add_user_results(
        &self,
        manager_id: &UserManagerId,
        results: Vec<InvocationResult>,
    ) -> BackendResult<()>;

    /// Drains up to `limit` results from the scenario's result queue.
    async fn move_user_results(
        &self,
        scenario_id: &ScenarioId,
        limit: usize,
    ) -> BackendResult<Vec<InvocationResult>>;

    /// One-shot per scenario.
    async fn set_scenario_result(
        &self,
        scenario_id: &ScenarioId,
        result: ScenarioResult,
    ) -> BackendResult<()>;

    /// Returns `None` until the result is set, then returns it exactly once.
    async fn move_scenario_result(
        &self,
        scenario_id: &ScenarioId,
    ) -> BackendResult<Option<ScenarioResult>>;

    /// Drain fan-in channel to controller.
    async fn add_test_event(&self, test_id: &TestId, event: TestEvent) -> BackendResult<()>;

    /// Drain fan-in channel to controller.
    async fn get_test_events(&self, test_id: &TestId) -> BackendResult<Vec<TestEvent>>;

    /// Records that a worker process is running on behalf of a test.
    ///
    /// Not part of spec.md's listed RPC surface, but implied by it:
    /// `check_test_instance` has nothing to check without some prior
    /// registration. Worker launchers call this when a worker starts and
    /// [`Backend::check_test_instance`] reports `false` once it exits or
    /// is cleaned up.
    async fn register_test_instance(&self, test_id: &TestId, instance_id: &str) -> BackendResult<()>;

    /// Whether a worker process registered under `instance_id` still runs.
    async fn check_test_instance(&self, test_id: &TestId, instance_id: &str) -> BackendResult<bool>;

    /// Tears down all workers belonging to a test.
    async fn clean_test_instances(&self, test_id: &TestId) -> BackendResult<()>;

    /// Appends a numeric sample.
    async fn add_metric(&self, scenario_id: &ScenarioId, name: &str, value: f64) -> BackendResult<()>;

    async fn get_metric_total(&self, scenario_id: &ScenarioId, name: &str) -> BackendResult<Option<f64>>;

    async fn get_last_metric(&self, scenario_id: &ScenarioId, name: &str) -> BackendResult<Option<f64>>;

    async fn get_metric_statistics(
        &self,
        scenario_id: &ScenarioId,
        name: &str,
    ) -> BackendResult<Option<MetricStatistics>>;

    /// Fraction of samples strictly above `split_point`.
    async fn get_metric_rate(
        &self,
        scenario_id: &ScenarioId,
        name: &str,
        split_point: f64,
    ) -> BackendResult<Option<f64>>;
}
