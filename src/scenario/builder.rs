//! [`ScenarioBuilder`]: the only supported way to construct a
//! [`crate::model::Scenario`] (§9 Design Notes), mirroring the
//! `with_x(mut self, ...) -> Self` chain the teacher uses for its record
//! types (`framework.rs::TestRecord`).

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::metrics::{ConsoleMetricDisplay, MetricCollector};
use crate::model::{Scenario, ScenarioFn, ScenarioLog};
use crate::scenario::{LoadModelFn, ResultAggregatorFn, ResultVerifierFn, UserLoopFn, basic_verification};

/// Builds a [`Scenario`]. `name` and the scenario body are required; every
/// other field has the same default as `cicadad/core/scenario.py`'s
/// `Scenario` model: `user_loop = while_has_work()`, `load_model =
/// run_scenario_once()`, `result_verifier = basic_verification`,
/// `users_per_instance = 50`, `raise_exception = true`, and the three
/// console metric collectors/displays (`runtime`, `pass_or_fail`,
/// `results_per_second`).
pub struct ScenarioBuilder {
    name: String,
    func: ScenarioFn,
    user_loop: UserLoopFn,
    load_model: LoadModelFn,
    dependencies: Vec<String>,
    result_aggregator: Option<ResultAggregatorFn>,
    result_verifier: ResultVerifierFn,
    output_transformer: Option<Arc<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>>,
    users_per_instance: usize,
    raise_exception: bool,
    metric_collectors: Vec<MetricCollector>,
    console_metric_displays: HashMap<String, ConsoleMetricDisplay>,
    tags: Vec<String>,
}

impl ScenarioBuilder {
    /// `func` is the scenario body: given the test's context, produce an
    /// output value or a declared failure message. Panics inside it are
    /// caught by the user runner, not here.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(
                serde_json::Value,
                ScenarioLog,
            ) -> BoxFuture<'static, std::result::Result<serde_json::Value, String>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
            user_loop: UserLoopFn::default(),
            load_model: LoadModelFn::run_scenario_once(std::time::Duration::from_secs(15)),
            dependencies: Vec::new(),
            result_aggregator: None,
            result_verifier: Arc::new(basic_verification),
            output_transformer: None,
            users_per_instance: 50,
            raise_exception: true,
            metric_collectors: vec![
                crate::metrics::runtime_seconds(),
                crate::metrics::pass_or_fail(),
                crate::metrics::results_per_second(),
            ],
            console_metric_displays: HashMap::from([
                ("runtimes".to_string(), crate::metrics::console_stats("runtime_seconds")),
                (
                    "results_per_second".to_string(),
                    crate::metrics::console_stats("results_per_second"),
                ),
                ("success_rate".to_string(), crate::metrics::console_percent("pass_or_fail", 0.5)),
            ]),
            tags: Vec::new(),
        }
    }

    pub fn with_user_loop(mut self, user_loop: UserLoopFn) -> Self {
        self.user_loop = user_loop;
        self
    }

    pub fn with_load_model(mut self, load_model: LoadModelFn) -> Self {
        self.load_model = load_model;
        self
    }

    pub fn with_dependency(mut self, scenario_name: impl Into<String>) -> Self {
        self.dependencies.push(scenario_name.into());
        self
    }

    pub fn with_result_aggregator(mut self, aggregator: ResultAggregatorFn) -> Self {
        self.result_aggregator = Some(aggregator);
        self
    }

    pub fn with_result_verifier(mut self, verifier: ResultVerifierFn) -> Self {
        self.result_verifier = verifier;
        self
    }

    pub fn with_output_transformer<F>(mut self, transformer: F) -> Self
    where
        F: Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        self.output_transformer = Some(Arc::new(transformer));
        self
    }

    pub fn with_users_per_instance(mut self, users_per_instance: usize) -> Self {
        self.users_per_instance = users_per_instance;
        self
    }

    pub fn without_raising_exceptions(mut self) -> Self {
        self.raise_exception = false;
        self
    }

    /// Replaces the default metric collectors; pass an empty vec to
    /// disable metric collection entirely.
    pub fn with_metric_collectors(mut self, collectors: Vec<MetricCollector>) -> Self {
        self.metric_collectors = collectors;
        self
    }

    pub fn with_console_metric_display(mut self, name: impl Into<String>, display: ConsoleMetricDisplay) -> Self {
        self.console_metric_displays.insert(name.into(), display);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn build(self) -> Scenario {
        Scenario {
            name: self.name,
            func: self.func,
            user_loop: self.user_loop,
            load_model: self.load_model,
            dependencies: self.dependencies,
            result_aggregator: self.result_aggregator,
            result_verifier: self.result_verifier,
            output_transformer: self.output_transformer,
            users_per_instance: self.users_per_instance,
            raise_exception: self.raise_exception,
            metric_collectors: self.metric_collectors,
            console_metric_displays: self.console_metric_displays,
            tags: self.tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_func(
        _ctx: serde_json::Value,
        _log: ScenarioLog,
    ) -> BoxFuture<'static, std::result::Result<serde_json::Value, String>> {
        Box::pin(async { Ok(serde_json::Value::Null) })
    }

    #[test]
    fn defaults_match_the_documented_scenario_defaults() {
        let scenario = ScenarioBuilder::new("my-scenario", noop_func).build();

        assert_eq!(scenario.name, "my-scenario");
        assert_eq!(scenario.users_per_instance, 50);
        assert!(scenario.raise_exception);
        assert_eq!(scenario.metric_collectors.len(), 3);
        assert!(scenario.console_metric_displays.contains_key("runtimes"));
        assert!(scenario.console_metric_displays.contains_key("results_per_second"));
        assert!(scenario.console_metric_displays.contains_key("success_rate"));
    }

    #[test]
    fn builder_overrides_apply() {
        let scenario = ScenarioBuilder::new("s", noop_func)
            .with_users_per_instance(5)
            .without_raising_exceptions()
            .with_dependency("upstream")
            .with_tag("smoke")
            .build();

        assert_eq!(scenario.users_per_instance, 5);
        assert!(!scenario.raise_exception);
        assert_eq!(scenario.dependencies, vec!["upstream".to_string()]);
        assert_eq!(scenario.tags, vec!["smoke".to_string()]);
    }
}
