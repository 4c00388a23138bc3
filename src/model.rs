//! Core data model: identifiers, results, events, and the static scenario record.
//!
//! Everything here is plain data. Components that *do* things (the
//! backend, the scenario runtime, the user loops) live in their own
//! modules and operate on these types.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::scenario::{LoadModelFn, ResultAggregatorFn, ResultVerifierFn, UserLoopFn};

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

opaque_id!(TestId);
opaque_id!(ScenarioId);
opaque_id!(UserManagerId);
opaque_id!(UserId);
opaque_id!(ResultId);
opaque_id!(EventId);

/// A single user invocation's output. Created by a user runner; immutable;
/// consumed exactly-once per successful fetch from the per-scenario queue.
///
/// Invariant: `exception.is_some()` implies the result counts as failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Result {
    pub id: ResultId,
    pub output: serde_json::Value,
    pub exception: Option<String>,
    pub logs: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub time_taken: f64,
}

impl Result {
    pub fn is_failure(&self) -> bool {
        self.exception.is_some()
    }
}

/// Aggregate outcome of a whole scenario run. One per scenario per test,
/// created once by the Scenario Runtime when the load model completes or
/// throws.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub id: ResultId,
    pub output: serde_json::Value,
    pub exception: Option<String>,
    pub logs: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub time_taken: f64,
    pub succeeded: usize,
    pub failed: usize,
}

impl ScenarioResult {
    pub fn skipped() -> Self {
        Self {
            id: ResultId::new(),
            output: serde_json::Value::Null,
            exception: Some("Skipped".to_string()),
            logs: String::new(),
            timestamp: chrono::Utc::now(),
            time_taken: 0.0,
            succeeded: 0,
            failed: 0,
        }
    }

    pub fn exited_unexpectedly() -> Self {
        Self {
            id: ResultId::new(),
            output: serde_json::Value::Null,
            exception: Some("Scenario Exited".to_string()),
            logs: String::new(),
            timestamp: chrono::Utc::now(),
            time_taken: 0.0,
            succeeded: 0,
            failed: 0,
        }
    }
}

/// Fan-out message from scenario to the user managers hosting its users.
///
/// Two canonical kinds are used by the engine: `START_USERS` and
/// `STOP_USERS`, both carrying `{"IDs": [UserId, ...]}` as payload.
/// Additional kinds may be sent via `send_user_events` for custom
/// coordination between a scenario and its users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEvent {
    pub kind: String,
    pub payload: serde_json::Value,
}

pub const START_USERS: &str = "START_USERS";
pub const STOP_USERS: &str = "STOP_USERS";

impl UserEvent {
    pub fn start_users(ids: &[UserId]) -> Self {
        Self {
            kind: START_USERS.to_string(),
            payload: serde_json::json!({ "IDs": ids.iter().map(|i| i.0.clone()).collect::<Vec<_>>() }),
        }
    }

    pub fn stop_users(ids: &[UserId]) -> Self {
        Self {
            kind: STOP_USERS.to_string(),
            payload: serde_json::json!({ "IDs": ids.iter().map(|i| i.0.clone()).collect::<Vec<_>>() }),
        }
    }

    /// The `IDs` carried by a `START_USERS`/`STOP_USERS` event, if present.
    pub fn ids(&self) -> Vec<UserId> {
        self.payload
            .get("IDs")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| UserId(s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Control-plane message from a test (or scenario, within a test) to the
/// controller console.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestEvent {
    pub kind: TestEventKind,
    pub payload: TestEventPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestEventKind {
    TestStarted,
    TestErrored,
    TestFinished,
    ScenarioStarted,
    ScenarioFinished,
    ScenarioMetric,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TestEventPayload {
    Status {
        #[serde(skip_serializing_if = "Option::is_none")]
        scenario: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        scenario_id: Option<String>,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },
    Metric {
        scenario: String,
        metrics: HashMap<String, Option<String>>,
    },
}

/// Derived statistics the backend computes on demand over a metric series.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricStatistics {
    pub min: f64,
    pub median: f64,
    pub average: f64,
    pub max: f64,
    pub len: usize,
}

/// A named unit of load-testing logic with a function body and scheduling
/// policy. Built exclusively via [`crate::scenario::ScenarioBuilder`];
/// declared once at program start and never mutated afterwards.
#[derive(Clone)]
pub struct Scenario {
    pub name: String,
    pub(crate) func: ScenarioFn,
    pub user_loop: UserLoopFn,
    pub load_model: LoadModelFn,
    /// Names of scenarios this one depends on; resolved to ids at scheduling time.
    pub dependencies: Vec<String>,
    pub result_aggregator: Option<ResultAggregatorFn>,
    pub result_verifier: ResultVerifierFn,
    pub output_transformer: Option<Arc<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>>,
    pub users_per_instance: usize,
    pub raise_exception: bool,
    pub metric_collectors: Vec<crate::metrics::MetricCollector>,
    pub console_metric_displays: HashMap<String, crate::metrics::ConsoleMetricDisplay>,
    pub tags: Vec<String>,
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("users_per_instance", &self.users_per_instance)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// A shared, append-only text buffer handed to a scenario body for one
/// invocation, standing in for the original implementation's process-wide
/// stdout redirect (`cicadad/util/printing.stdout_redirect`) — Rust has no
/// safe equivalent across concurrently-running tasks, so user code writes
/// to this handle explicitly instead. Its contents become `Result.logs`
/// once the invocation finishes (§4.4).
#[derive(Clone, Default)]
pub struct ScenarioLog(Arc<Mutex<String>>);

impl ScenarioLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, text: impl AsRef<str>) {
        self.0.lock().unwrap().push_str(text.as_ref());
    }

    pub fn writeln(&self, text: impl AsRef<str>) {
        let mut buf = self.0.lock().unwrap();
        buf.push_str(text.as_ref());
        buf.push('\n');
    }

    /// A snapshot of everything written so far.
    pub fn read(&self) -> String {
        self.0.lock().unwrap().clone()
    }
}

/// The user-supplied scenario body: given the accumulated test context and
/// a log handle to write to, produce an output value or fail.
///
/// Panics raised inside the future are caught by the user runner and
/// translated into `Result.exception` (see `crate::user::runner`).
pub type ScenarioFn = Arc<
    dyn Fn(
            serde_json::Value,
            ScenarioLog,
        ) -> futures::future::BoxFuture<'static, std::result::Result<serde_json::Value, String>>
        + Send
        + Sync,
>;
