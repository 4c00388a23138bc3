//! Load Models (§4.7): the scheduling policies that drive a
//! [`crate::scenario::ScenarioRuntime`] from start to completion.
//!
//! Ported from the closures in `cicadad/core/scenario.py`. Each strategy
//! there is a function returning a function; here each is a variant of one
//! enum so a [`crate::model::Scenario`] can hold one by value and the
//! engine can dispatch on it without boxing a trait object per scenario.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::scenario::ScenarioRuntime;

type ThresholdFn = Arc<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;
type NextUsersFn = Arc<dyn Fn(usize) -> usize + Send + Sync>;
type UpdateAggregateFn = Arc<dyn Fn(usize, &serde_json::Value) -> serde_json::Value + Send + Sync>;

/// One scheduling strategy for a scenario's run. See each constructor's doc
/// for the original closure it replaces.
#[derive(Clone)]
pub enum LoadModelFn {
    NIterations {
        iterations: u64,
        users: usize,
        wait_period: Duration,
        timeout: Option<Duration>,
        skip_scaledown: bool,
    },
    RunScenarioOnce {
        wait_period: Duration,
        timeout: Duration,
    },
    NSeconds {
        seconds: Duration,
        users: usize,
        wait_period: Duration,
        skip_scaledown: bool,
    },
    NUsersRamping {
        seconds: Duration,
        target_users: usize,
        wait_period: Duration,
        /// Original default is `true`: rest at `target_users` rather than
        /// scaling back to zero once the ramp completes.
        skip_scaledown: bool,
    },
    RampUsersToThreshold {
        initial_users: usize,
        threshold: ThresholdFn,
        next_users: NextUsersFn,
        update_aggregate: UpdateAggregateFn,
        period: Duration,
        period_limit: Option<u64>,
        wait_period: Duration,
        skip_scaledown: bool,
    },
    LoadStages {
        stages: Vec<LoadModelFn>,
    },
}

impl LoadModelFn {
    /// Starts `users` users, adds `iterations` work tokens up front, and
    /// polls until `iterations` results have been collected (or `timeout`
    /// elapses, which records a "Timed out waiting for results" error
    /// instead of the original's raised `AssertionError`). Scales to zero
    /// afterward unless `skip_scaledown` is set.
    /// `cicadad/core/scenario.py::n_iterations`.
    pub fn n_iterations(iterations: u64, users: usize, wait_period: Duration, timeout: Option<Duration>) -> Self {
        Self::NIterations { iterations, users, wait_period, timeout, skip_scaledown: false }
    }

    /// Starts one user, adds one work token, and retries (re-adding a work
    /// token each cycle) until a clean result is collected or `timeout`
    /// elapses. `cicadad/core/scenario.py::run_scenario_once`.
    pub fn run_scenario_once(timeout: Duration) -> Self {
        Self::RunScenarioOnce { wait_period: Duration::from_secs(1), timeout }
    }

    /// Starts `users` users and lets them run for `seconds`, then scales to
    /// zero unless `skip_scaledown` is set.
    /// `cicadad/core/scenario.py::n_seconds`.
    pub fn n_seconds(seconds: Duration, users: usize, wait_period: Duration) -> Self {
        Self::NSeconds { seconds, users, wait_period, skip_scaledown: false }
    }

    /// Linearly ramps the user count from its current value to
    /// `target_users` over `seconds`. Rests at `target_users` when done
    /// (matching the original's `skip_scaledown = True` default); call
    /// [`Self::then_scale_to_zero`] to scale back down instead.
    /// `cicadad/core/scenario.py::n_users_ramping`.
    pub fn n_users_ramping(seconds: Duration, target_users: usize, wait_period: Duration) -> Self {
        Self::NUsersRamping { seconds, target_users, wait_period, skip_scaledown: true }
    }

    /// Repeatedly raises the user count (via `next_users`, default `n + 10`)
    /// once per `period` until `threshold` of the aggregated result is met
    /// or `period_limit` scaling events have happened, recording progress
    /// via `update_aggregate` (default `Users: {n}`).
    /// `cicadad/core/scenario.py::ramp_users_to_threshold`.
    pub fn ramp_users_to_threshold(
        initial_users: usize,
        threshold: ThresholdFn,
        period: Duration,
        wait_period: Duration,
        period_limit: Option<u64>,
    ) -> Self {
        Self::RampUsersToThreshold {
            initial_users,
            threshold,
            next_users: Arc::new(|n| n + 10),
            update_aggregate: Arc::new(|n, _agg| serde_json::Value::String(format!("Users: {n}"))),
            period,
            period_limit,
            wait_period,
            skip_scaledown: false,
        }
    }

    pub fn with_next_users(mut self, f: NextUsersFn) -> Self {
        if let Self::RampUsersToThreshold { next_users, .. } = &mut self {
            *next_users = f;
        }
        self
    }

    pub fn with_update_aggregate(mut self, f: UpdateAggregateFn) -> Self {
        if let Self::RampUsersToThreshold { update_aggregate, .. } = &mut self {
            *update_aggregate = f;
        }
        self
    }

    /// Skips the trailing scale-to-zero for strategies that scale down by
    /// default (`n_iterations`, `n_seconds`, `ramp_users_to_threshold`).
    pub fn skip_scaledown(mut self) -> Self {
        match &mut self {
            Self::NIterations { skip_scaledown, .. }
            | Self::NSeconds { skip_scaledown, .. }
            | Self::RampUsersToThreshold { skip_scaledown, .. } => *skip_scaledown = true,
            _ => {}
        }
        self
    }

    /// For `n_users_ramping`, which by default rests at `target_users`:
    /// scale to zero once the ramp finishes instead.
    pub fn then_scale_to_zero(mut self) -> Self {
        if let Self::NUsersRamping { skip_scaledown, .. } = &mut self {
            *skip_scaledown = false;
        }
        self
    }

    /// Runs each load model in order, then unconditionally scales to zero.
    /// `cicadad/core/scenario.py::load_stages`.
    pub fn load_stages(stages: Vec<LoadModelFn>) -> Self {
        Self::LoadStages { stages }
    }

    /// Drives `runtime` to completion under this strategy.
    pub fn run<'a>(&'a self, runtime: &'a mut ScenarioRuntime) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            match self {
                Self::NIterations { iterations, users, wait_period, timeout, skip_scaledown } => {
                    run_n_iterations(runtime, *iterations, *users, *wait_period, *timeout, *skip_scaledown).await
                }
                Self::RunScenarioOnce { wait_period, timeout } => {
                    run_scenario_once(runtime, *wait_period, *timeout).await
                }
                Self::NSeconds { seconds, users, wait_period, skip_scaledown } => {
                    run_n_seconds(runtime, *seconds, *users, *wait_period, *skip_scaledown).await
                }
                Self::NUsersRamping { seconds, target_users, wait_period, skip_scaledown } => {
                    run_n_users_ramping(runtime, *seconds, *target_users, *wait_period, *skip_scaledown).await
                }
                Self::RampUsersToThreshold {
                    initial_users,
                    threshold,
                    next_users,
                    update_aggregate,
                    period,
                    period_limit,
                    wait_period,
                    skip_scaledown,
                } => {
                    run_ramp_users_to_threshold(
                        runtime,
                        *initial_users,
                        threshold.clone(),
                        next_users.clone(),
                        update_aggregate.clone(),
                        *period,
                        *period_limit,
                        *wait_period,
                        *skip_scaledown,
                    )
                    .await
                }
                Self::LoadStages { stages } => {
                    for stage in stages {
                        stage.run(runtime).await;
                    }
                    runtime.scale_users(0).await;
                }
            }
        })
    }
}

async fn poll_once(runtime: &mut ScenarioRuntime) -> usize {
    let latest = runtime.get_latest_results(None, usize::MAX).await;
    runtime.aggregate_results(&latest);
    runtime.verify_results(&latest);
    runtime.collect_datastore_metrics(&latest).await;
    latest.len()
}

async fn run_n_iterations(
    runtime: &mut ScenarioRuntime,
    iterations: u64,
    users: usize,
    wait_period: Duration,
    timeout: Option<Duration>,
    skip_scaledown: bool,
) {
    runtime.scale_users(users).await;
    runtime.add_work(iterations).await;

    let start = tokio::time::Instant::now();
    let mut collected = 0u64;

    while collected < iterations {
        if let Some(timeout) = timeout {
            if start.elapsed() > timeout {
                runtime.record_error("Timed out waiting for results".to_string());
                break;
            }
        }

        collected += poll_once(runtime).await as u64;
        tokio::time::sleep(wait_period).await;
    }

    if !skip_scaledown {
        runtime.scale_users(0).await;
    }
}

async fn run_scenario_once(runtime: &mut ScenarioRuntime, wait_period: Duration, timeout: Duration) {
    runtime.scale_users(1).await;
    runtime.add_work(1).await;

    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        poll_once(runtime).await;

        if runtime.errors().is_empty() && runtime.num_results_collected() > 0 {
            break;
        }

        tokio::time::sleep(wait_period).await;
        runtime.add_work(1).await;
    }

    runtime.scale_users(0).await;
}

async fn run_n_seconds(
    runtime: &mut ScenarioRuntime,
    seconds: Duration,
    users: usize,
    wait_period: Duration,
    skip_scaledown: bool,
) {
    runtime.scale_users(users).await;

    let start = tokio::time::Instant::now();
    loop {
        poll_once(runtime).await;
        if start.elapsed() > seconds {
            break;
        }
        tokio::time::sleep(wait_period).await;
    }

    if !skip_scaledown {
        runtime.scale_users(0).await;
    }
}

async fn run_n_users_ramping(
    runtime: &mut ScenarioRuntime,
    seconds: Duration,
    target_users: usize,
    wait_period: Duration,
    skip_scaledown: bool,
) {
    let starting_users = runtime.num_users();
    let steps = (seconds.as_secs_f64() / wait_period.as_secs_f64()).max(1.0);
    let delta_per_step = (target_users as f64 - starting_users as f64) / steps;
    let mut buffered = 0.0_f64;

    let start = tokio::time::Instant::now();
    while start.elapsed() <= seconds {
        buffered += delta_per_step;
        let whole = buffered.trunc() as i64;
        if whole > 0 {
            runtime.start_users(whole as usize).await;
            buffered -= whole as f64;
        } else if whole < 0 {
            runtime.stop_users((-whole) as usize).await;
            buffered -= whole as f64;
        }

        poll_once(runtime).await;
        tokio::time::sleep(wait_period).await;
    }

    if skip_scaledown {
        runtime.scale_users(target_users).await;
    } else {
        runtime.scale_users(0).await;
    }
}

async fn run_ramp_users_to_threshold(
    runtime: &mut ScenarioRuntime,
    initial_users: usize,
    threshold: ThresholdFn,
    next_users: NextUsersFn,
    update_aggregate: UpdateAggregateFn,
    period: Duration,
    period_limit: Option<u64>,
    wait_period: Duration,
    skip_scaledown: bool,
) {
    runtime.scale_users(initial_users).await;

    let mut period_count = 0u64;
    let mut period_start = tokio::time::Instant::now();

    while !threshold(&runtime.aggregated_results) && period_limit.map(|limit| period_count < limit).unwrap_or(true) {
        poll_once(runtime).await;
        tokio::time::sleep(wait_period).await;

        if period_start.elapsed() >= period {
            let next = next_users(runtime.num_users());
            runtime.scale_users(next).await;
            period_count += 1;
            period_start = tokio::time::Instant::now();
        }
    }

    let current = runtime.num_users();
    runtime.aggregated_results = update_aggregate(current, &runtime.aggregated_results);

    if !skip_scaledown {
        runtime.scale_users(0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::backend::memory::MemoryBackend;
    use crate::model::Scenario;
    use crate::scenario::{ScenarioRuntime, UserLoopFn};
    use std::sync::Arc;

    async fn runtime_for(func: crate::model::ScenarioFn, users_per_instance: usize) -> ScenarioRuntime {
        let backend = Arc::new(MemoryBackend::new());
        let test_id = backend
            .create_test(serde_json::json!({}), String::new(), vec![], Default::default())
            .await
            .unwrap();
        let scenario = Arc::new(Scenario {
            name: "s".to_string(),
            func,
            user_loop: UserLoopFn::while_has_work(50),
            load_model: LoadModelFn::run_scenario_once(Duration::from_secs(5)),
            dependencies: vec![],
            result_aggregator: None,
            result_verifier: Arc::new(crate::scenario::basic_verification),
            output_transformer: None,
            users_per_instance,
            raise_exception: true,
            metric_collectors: vec![],
            console_metric_displays: Default::default(),
            tags: vec![],
        });
        let scenario_id = backend
            .create_scenario(&test_id, "s", "e30=".into(), users_per_instance, vec![])
            .await
            .unwrap();

        ScenarioRuntime::new(backend, test_id, scenario_id, scenario, serde_json::json!({}))
    }

    #[tokio::test]
    async fn n_iterations_scales_down_after_collecting_enough_results() {
        let func: crate::model::ScenarioFn = Arc::new(|_ctx, _log| Box::pin(async { Ok(serde_json::json!(1)) }));
        let mut runtime = runtime_for(func, 10).await;

        run_n_iterations(&mut runtime, 3, 2, Duration::from_millis(5), Some(Duration::from_secs(5)), false).await;

        assert_eq!(runtime.num_users(), 0);
        assert!(runtime.num_results_collected() >= 3);
    }

    #[tokio::test]
    async fn n_iterations_records_timeout_error() {
        // No users ever run the scenario body, so results never arrive.
        let func: crate::model::ScenarioFn = Arc::new(|_ctx, _log| Box::pin(async { Ok(serde_json::Value::Null) }));
        let mut runtime = runtime_for(func, 0).await;

        run_n_iterations(&mut runtime, 1, 0, Duration::from_millis(5), Some(Duration::from_millis(20)), false).await;

        assert!(runtime.errors().iter().any(|e| e.contains("Timed out")));
    }

    #[tokio::test]
    async fn n_seconds_runs_for_roughly_the_requested_duration() {
        let func: crate::model::ScenarioFn = Arc::new(|_ctx, _log| Box::pin(async { Ok(serde_json::Value::Null) }));
        let mut runtime = runtime_for(func, 5).await;

        let start = tokio::time::Instant::now();
        run_n_seconds(&mut runtime, Duration::from_millis(30), 1, Duration::from_millis(5), false).await;

        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(runtime.num_users(), 0);
    }

    #[tokio::test]
    async fn n_users_ramping_rests_at_target_by_default() {
        let func: crate::model::ScenarioFn = Arc::new(|_ctx, _log| Box::pin(async { Ok(serde_json::Value::Null) }));
        let mut runtime = runtime_for(func, 10).await;

        run_n_users_ramping(&mut runtime, Duration::from_millis(20), 4, Duration::from_millis(5), true).await;

        assert_eq!(runtime.num_users(), 4);
    }
}
