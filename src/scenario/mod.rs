//! Scenario Runtime (§4.6) and the policy/reducer types a
//! [`crate::model::Scenario`] is built from (§9 Design Notes).

pub mod builder;
pub mod runtime;

pub use builder::ScenarioBuilder;
pub use runtime::ScenarioRuntime;

use std::sync::Arc;

use crate::model::Result as InvocationResult;
use crate::user::runner::UserCommands;

/// User-level execution policy (§4.3): when to invoke the scenario body.
#[derive(Clone)]
pub enum UserLoopFn {
    WhileHasWork { poll_timeout_ms: u64 },
    WhileAlive,
    IterationsPerSecondLimited { limit: u64 },
}

impl UserLoopFn {
    pub fn while_has_work(poll_timeout_ms: u64) -> Self {
        Self::WhileHasWork { poll_timeout_ms }
    }

    pub fn while_alive() -> Self {
        Self::WhileAlive
    }

    pub fn iterations_per_second_limited(limit: u64) -> Self {
        Self::IterationsPerSecondLimited { limit }
    }

    pub async fn run(&self, commands: &UserCommands) {
        match self {
            Self::WhileHasWork { poll_timeout_ms } => {
                crate::user::loops::while_has_work(commands, *poll_timeout_ms).await
            }
            Self::WhileAlive => crate::user::loops::while_alive(commands).await,
            Self::IterationsPerSecondLimited { limit } => {
                crate::user::loops::iterations_per_second_limited(commands, *limit).await
            }
        }
    }
}

impl Default for UserLoopFn {
    fn default() -> Self {
        Self::while_has_work(1000)
    }
}

pub use crate::load_model::LoadModelFn;

/// Reduces a batch of results into the scenario's running aggregate.
/// Defaults to "latest wins" (see [`ScenarioRuntime::aggregate_results`]).
pub type ResultAggregatorFn =
    Arc<dyn Fn(serde_json::Value, &[InvocationResult]) -> serde_json::Value + Send + Sync>;

/// Produces error strings for a batch of results. Defaults to
/// [`basic_verification`].
pub type ResultVerifierFn = Arc<dyn Fn(&[InvocationResult]) -> Vec<String> + Send + Sync>;

/// One `* {type}: {message}\n{logs}` line per errored result, matching
/// the original `basic_verification` (`cicadad/core/scenario.py`). Since
/// this crate's `Result.exception` is already a plain string, `{type}` is
/// fixed to the literal `Exception`.
pub fn basic_verification(latest_results: &[InvocationResult]) -> Vec<String> {
    latest_results
        .iter()
        .filter_map(|r| {
            r.exception
                .as_ref()
                .map(|message| format!("* Exception: {message}\n{}", r.logs))
        })
        .collect()
}
