//! User Loop policies (§4.3): when a single user invokes the scenario
//! body. All three provided policies return when `is_up()` first reads
//! false.

use std::time::Duration;

use crate::user::runner::UserCommands;

/// Runs the scenario if work is available, else cycles the poll.
///
/// `has_work` returns true if the local work counter is >= 1
/// (decrementing it), or, if 0, after one attempted refill via the
/// buffer within `poll_timeout_ms`.
pub async fn while_has_work(commands: &UserCommands, poll_timeout_ms: u64) {
    while commands.is_up().await {
        if commands.has_work(poll_timeout_ms).await {
            commands.run_and_report().await;
        }
    }
}

/// Runs the scenario every cycle with no work gating.
pub async fn while_alive(commands: &UserCommands) {
    while commands.is_up().await {
        commands.run_and_report().await;
    }
}

/// Allows up to `limit` iterations per wall-clock second; the cycle
/// boundary resets independently of how many ran.
pub async fn iterations_per_second_limited(commands: &UserCommands, limit: u64) {
    let mut remaining = limit;
    let mut second_start = tokio::time::Instant::now();

    while commands.is_up().await {
        if remaining > 0 {
            commands.run_and_report().await;
            remaining -= 1;
        } else {
            let elapsed = second_start.elapsed();
            let remainder = Duration::from_secs(1).saturating_sub(elapsed);
            if !remainder.is_zero() {
                tokio::time::sleep(remainder).await;
            }
        }

        if second_start.elapsed() >= Duration::from_secs(1) {
            remaining = limit;
            second_start = tokio::time::Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::model::{ScenarioId, TestId, UserId, UserManagerId};
    use crate::user::buffer::UserBuffer;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn fixture() -> (UserCommands, Arc<MemoryBackend>, ScenarioId) {
        let backend = Arc::new(MemoryBackend::new());
        let test_id = backend
            .create_test(serde_json::json!({}), String::new(), vec![], Default::default())
            .await
            .unwrap();
        let scenario_id = backend
            .create_scenario(&test_id, "s", "e30=".into(), 5, vec![])
            .await
            .unwrap();
        let managers = backend.create_users(&test_id, &scenario_id, 1).await.unwrap();
        let manager_id: UserManagerId = managers[0].clone();
        let events = backend
            .get_user_events(&manager_id, crate::model::START_USERS)
            .await
            .unwrap();
        let user_id: UserId = events[0].ids()[0].clone();

        let buffer = Arc::new(UserBuffer::new(manager_id, backend.clone()));
        buffer.add_users(&[user_id.clone()]).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let func: crate::model::ScenarioFn = Arc::new(move |_ctx, _log| {
            let calls = calls2.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!(calls.load(Ordering::SeqCst)))
            })
        });

        let commands = UserCommands::new(user_id, buffer, func, serde_json::json!({}));
        (commands, backend, scenario_id)
    }

    #[tokio::test]
    async fn while_has_work_runs_once_per_token_then_stops() {
        let (commands, backend, scenario_id) = fixture().await;
        backend.distribute_work(&scenario_id, 2).await.unwrap();

        // `is_up` drains `STOP_USERS` on its very first call, so calling
        // `stop_users` before the loop starts would stop it before it ever
        // runs. Delay the stop past the loop's first couple of iterations.
        let backend2 = backend.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(40)).await;
            backend2.stop_users(&scenario_id, 1).await.unwrap();
        });

        while_has_work(&commands, 10).await;

        assert!(commands.reported_count() >= 1);
    }

    #[tokio::test]
    async fn while_alive_stops_as_soon_as_stop_users_seen() {
        let (commands, backend, scenario_id) = fixture().await;
        backend.stop_users(&scenario_id, 1).await.unwrap();

        while_alive(&commands).await;

        assert_eq!(commands.reported_count(), 0);
    }
}
