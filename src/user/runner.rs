//! User Runner (§4.4) and the `UserCommands` capability surface consumed
//! by user loop policies (§9 Polymorphism).
//!
//! One invocation path: invoke the scenario function, measure elapsed
//! time, translate a caught panic into the `exception` field (message
//! plus backtrace appended to the log), timestamp, assign a fresh
//! `ResultId`, and forward through `report_result` to the [`UserBuffer`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Mutex;

use crate::model::{ResultId, STOP_USERS, Result as InvocationResult, ScenarioFn, ScenarioLog, UserId};
use crate::panic_util::panic_message;
use crate::user::buffer::UserBuffer;

/// Capabilities given to a scenario's user loop: `is_up`, `has_work`,
/// `run`, `report_result`.
pub struct UserCommands {
    user_id: UserId,
    buffer: Arc<UserBuffer>,
    func: ScenarioFn,
    context: serde_json::Value,
    available_work: AtomicU64,
    reported: AtomicUsize,
    /// Serializes `has_work`'s read-modify-write of `available_work`
    /// against the buffer refill, mirroring the buffer's own single
    /// consumer-per-user discipline.
    work_lock: Mutex<()>,
}

impl UserCommands {
    pub fn new(
        user_id: UserId,
        buffer: Arc<UserBuffer>,
        func: ScenarioFn,
        context: serde_json::Value,
    ) -> Self {
        Self {
            user_id,
            buffer,
            func,
            context,
            available_work: AtomicU64::new(0),
            reported: AtomicUsize::new(0),
            work_lock: Mutex::new(()),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Reads `STOP_USERS` events; true iff this user's id is not present
    /// in any such event's `IDs` (§4.3, adopting the broadcast-driven
    /// definition per §9's Open Question resolution).
    pub async fn is_up(&self) -> bool {
        let events = self.buffer.get_user_events(&self.user_id, STOP_USERS).await;
        !events.iter().any(|e| e.ids().contains(&self.user_id))
    }

    /// True if the local work counter is >= 1 (decrements it), or, after
    /// one attempted refill via the buffer within `poll_timeout_ms`.
    pub async fn has_work(&self, poll_timeout_ms: u64) -> bool {
        let _guard = self.work_lock.lock().await;

        if self.available_work.load(Ordering::SeqCst) < 1 {
            let refill = tokio::time::timeout(
                Duration::from_millis(poll_timeout_ms),
                self.buffer.get_user_work(&self.user_id),
            )
            .await
            .unwrap_or(0);

            self.available_work.fetch_add(refill, Ordering::SeqCst);
        }

        let available = self.available_work.load(Ordering::SeqCst);
        if available > 0 {
            self.available_work.fetch_sub(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Invokes the scenario body once, capturing a thrown failure as
    /// `(None, Some(message), logs)`. `logs` is whatever the scenario body
    /// wrote to its [`ScenarioLog`] handle, with a panic backtrace appended
    /// if it panicked.
    pub async fn run(&self) -> (serde_json::Value, Option<String>, String) {
        let log = ScenarioLog::new();
        let fut = (self.func)(self.context.clone(), log.clone());

        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(output)) => (output, None, log.read()),
            Ok(Err(message)) => (serde_json::Value::Null, Some(message), log.read()),
            Err(panic) => {
                let message = panic_message(&panic);
                let backtrace = std::backtrace::Backtrace::force_capture();
                let mut logs = log.read();
                logs.push_str(&format!("panicked, backtrace:\n{backtrace}"));
                (serde_json::Value::Null, Some(message), logs)
            }
        }
    }

    /// Runs the scenario once and reports the result through the buffer;
    /// the combination used by every user loop policy.
    pub async fn run_and_report(&self) {
        let start = tokio::time::Instant::now();
        let (output, exception, logs) = self.run().await;
        let time_taken = start.elapsed().as_secs_f64();
        self.report_result(output, exception, logs, time_taken).await;
    }

    pub async fn report_result(
        &self,
        output: serde_json::Value,
        exception: Option<String>,
        logs: String,
        time_taken: f64,
    ) {
        let result = InvocationResult {
            id: ResultId::new(),
            output,
            exception,
            logs,
            timestamp: chrono::Utc::now(),
            time_taken,
        };
        self.buffer.add_user_result(result).await;
        self.reported.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of results reported so far by this user, for tests and metrics.
    pub fn reported_count(&self) -> usize {
        self.reported.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::backend::memory::MemoryBackend;

    async fn commands_with_func(func: ScenarioFn) -> UserCommands {
        let backend = Arc::new(MemoryBackend::new());
        let test_id = backend
            .create_test(serde_json::json!({}), String::new(), vec![], Default::default())
            .await
            .unwrap();
        let scenario_id = backend
            .create_scenario(&test_id, "s", "e30=".into(), 1, vec![])
            .await
            .unwrap();
        let managers = backend.create_users(&test_id, &scenario_id, 1).await.unwrap();
        let manager_id = managers[0].clone();
        let events = backend
            .get_user_events(&manager_id, crate::model::START_USERS)
            .await
            .unwrap();
        let user_id = events[0].ids()[0].clone();

        let buffer = Arc::new(UserBuffer::new(manager_id, backend));
        buffer.add_users(&[user_id.clone()]).await;

        UserCommands::new(user_id, buffer, func, serde_json::json!({}))
    }

    #[tokio::test]
    async fn run_captures_successful_output() {
        let func: ScenarioFn = Arc::new(|_ctx, _log| Box::pin(async { Ok(serde_json::json!(42)) }));
        let commands = commands_with_func(func).await;

        let (output, exception, _logs) = commands.run().await;
        assert_eq!(output, serde_json::json!(42));
        assert!(exception.is_none());
    }

    #[tokio::test]
    async fn run_captures_declared_failure() {
        let func: ScenarioFn = Arc::new(|_ctx, _log| Box::pin(async { Err("boom".to_string()) }));
        let commands = commands_with_func(func).await;

        let (output, exception, _logs) = commands.run().await;
        assert_eq!(output, serde_json::Value::Null);
        assert_eq!(exception.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn run_captures_panics_as_exceptions() {
        let func: ScenarioFn = Arc::new(|_ctx, _log| Box::pin(async { panic!("assertion failed") }));
        let commands = commands_with_func(func).await;

        let (output, exception, logs) = commands.run().await;
        assert_eq!(output, serde_json::Value::Null);
        assert_eq!(exception.as_deref(), Some("assertion failed"));
        assert!(logs.contains("backtrace"));
    }

    #[tokio::test]
    async fn run_captures_logs_written_by_the_scenario_body() {
        let func: ScenarioFn = Arc::new(|_ctx, log| {
            Box::pin(async move {
                log.writeln("starting checkout");
                log.write("done");
                Ok(serde_json::Value::Null)
            })
        });
        let commands = commands_with_func(func).await;

        let (_output, _exception, logs) = commands.run().await;
        assert_eq!(logs, "starting checkout\ndone");
    }
}
