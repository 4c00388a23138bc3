//! Worker launchers (§6): how a scenario's actual execution — its
//! [`crate::scenario::ScenarioRuntime`] driving the load model, plus one
//! [`crate::user::UserScheduler`] per manager spawned along the way — gets
//! onto compute. [`crate::test_runner::TestRunner`] only needs `launch` and
//! `is_running`; everything else is launcher-internal.

pub mod docker;
pub mod kube;
pub mod local;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::model::{Scenario, ScenarioId, TestId};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to launch worker: {0}")]
    LaunchFailed(String),
    #[error(transparent)]
    Backend(#[from] crate::backend::BackendError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

/// Starts the process(es) that run one scenario and its users, and answers
/// whether they're still alive (test_runner.rs's "Scenario Exited
/// Unexpectedly" check, §4.8).
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Launches whatever hosts this scenario's load model and its users.
    /// Must not block waiting for the scenario to finish; the caller polls
    /// `Backend::move_scenario_result` separately.
    async fn launch(
        &self,
        test_id: &TestId,
        scenario_id: &ScenarioId,
        scenario: Arc<Scenario>,
        context: serde_json::Value,
    ) -> WorkerResult<()>;

    /// True while the worker(s) launched for this scenario are still
    /// running (or haven't been asked about before — an unknown id is
    /// reported as running, since "no record" and "finished and reported"
    /// are indistinguishable without extra bookkeeping this trait doesn't
    /// require of implementations).
    async fn is_running(&self, test_id: &TestId, scenario_id: &ScenarioId) -> bool;

    /// Tears down every worker belonging to a test, e.g. once all
    /// scenarios have reported a result.
    async fn shutdown_test(&self, test_id: &TestId) -> WorkerResult<()>;
}
