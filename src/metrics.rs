//! Metric collectors (push results into the backend's per-scenario metric
//! store) and console metric displays (pull from it for the CLI reporter).
//!
//! Ported from `cicadad/metrics/collectors.py` and
//! `cicadad/metrics/console.py`: both modules are plain functions-returning-
//! functions there, which this crate models as `Arc<dyn Fn>` type aliases so
//! a [`crate::model::Scenario`] can carry a `Vec`/`HashMap` of them.

use std::sync::Arc;

use crate::backend::Backend;
use crate::model::{Result as InvocationResult, ScenarioId};

/// Extracts a series of numeric samples from a batch of results and pushes
/// each into the backend under `name` (§7 `add_metric`).
pub type MetricCollector = Arc<
    dyn Fn(&[InvocationResult], ScenarioId, Arc<dyn Backend>) -> futures::future::BoxFuture<'static, ()>
        + Send
        + Sync,
>;

/// Reads a derived statistic back out of the backend and formats it for the
/// console reporter. Returns `None` if the backend has no samples yet.
pub type ConsoleMetricDisplay = Arc<
    dyn Fn(ScenarioId, Arc<dyn Backend>) -> futures::future::BoxFuture<'static, Option<String>>
        + Send
        + Sync,
>;

fn collector_values(
    name: &'static str,
    extract: fn(&[InvocationResult]) -> Vec<f64>,
) -> MetricCollector {
    Arc::new(move |results, scenario_id, backend| {
        let values = extract(results);
        Box::pin(async move {
            for value in values {
                if let Err(err) = backend.add_metric(&scenario_id, name, value).await {
                    tracing::warn!("failed to record metric {name}: {err}");
                }
            }
        })
    })
}

/// Per-result wall-clock duration in seconds.
pub fn runtime_seconds() -> MetricCollector {
    collector_values("runtime_seconds", |results| {
        results.iter().map(|r| r.time_taken).collect()
    })
}

/// 0 for a failed result, 1 for a successful one.
pub fn pass_or_fail() -> MetricCollector {
    collector_values("pass_or_fail", |results| {
        results
            .iter()
            .map(|r| if r.exception.is_some() { 0.0 } else { 1.0 })
            .collect()
    })
}

/// Single-sample metric: results collected per second, spanning the batch's
/// earliest to latest timestamp (rounded up to whole seconds). Empty for
/// batches of fewer than two results.
pub fn results_per_second() -> MetricCollector {
    collector_values("results_per_second", |results| {
        if results.len() < 2 {
            return Vec::new();
        }
        let min = results.iter().map(|r| r.timestamp).min().unwrap();
        let max = results.iter().map(|r| r.timestamp).max().unwrap();
        let seconds = (max - min).num_milliseconds() as f64 / 1000.0;
        let seconds = seconds.ceil().max(1.0);
        vec![results.len() as f64 / seconds]
    })
}

/// Wraps an arbitrary per-result collector (user-supplied `collector(latest)
/// -> impl IntoIterator<Item = f64>`) the same way `console_collector` does
/// in the original: every returned value is pushed to the backend under
/// `name`.
pub fn console_collector<F>(name: &'static str, collector: F) -> MetricCollector
where
    F: Fn(&[InvocationResult]) -> Vec<f64> + Send + Sync + 'static,
{
    let collector = Arc::new(collector);
    Arc::new(move |results, scenario_id, backend| {
        let values = collector(results);
        Box::pin(async move {
            for value in values {
                if let Err(err) = backend.add_metric(&scenario_id, name, value).await {
                    tracing::warn!("failed to record metric {name}: {err}");
                }
            }
        })
    })
}

/// `Min: x, Median: x, Average: x, Max: x, Len: n` for a metric series.
pub fn console_stats(metric_name: &'static str) -> ConsoleMetricDisplay {
    Arc::new(move |scenario_id, backend| {
        Box::pin(async move {
            let stats = backend.get_metric_statistics(&scenario_id, metric_name).await.ok().flatten()?;
            Some(format!(
                "Min: {:.3}, Median: {:.3}, Average: {:.3}, Max: {:.3}, Len: {}",
                stats.min, stats.median, stats.average, stats.max, stats.len
            ))
        })
    })
}

/// Running total of a metric's samples.
pub fn console_count(metric_name: &'static str) -> ConsoleMetricDisplay {
    Arc::new(move |scenario_id, backend| {
        Box::pin(async move {
            let total = backend.get_metric_total(&scenario_id, metric_name).await.ok().flatten()?;
            Some(format!("{total:.3}"))
        })
    })
}

/// Most recently recorded sample of a metric.
pub fn console_latest(metric_name: &'static str) -> ConsoleMetricDisplay {
    Arc::new(move |scenario_id, backend| {
        Box::pin(async move {
            let last = backend.get_last_metric(&scenario_id, metric_name).await.ok().flatten()?;
            Some(format!("{last:.3}"))
        })
    })
}

/// Fraction of a metric's samples strictly above `split_point`.
pub fn console_percent(metric_name: &'static str, split_point: f64) -> ConsoleMetricDisplay {
    Arc::new(move |scenario_id, backend| {
        Box::pin(async move {
            let rate = backend
                .get_metric_rate(&scenario_id, metric_name, split_point)
                .await
                .ok()
                .flatten()?;
            Some(format!("{rate:.3}"))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::model::TestId;
    use std::sync::Arc;

    async fn scenario_with_metrics(values: &[f64]) -> (Arc<MemoryBackend>, ScenarioId) {
        let backend = Arc::new(MemoryBackend::new());
        let test_id = backend
            .create_test(serde_json::json!({}), String::new(), vec![], Default::default())
            .await
            .unwrap();
        let scenario_id = backend
            .create_scenario(&test_id, "s", "e30=".into(), 1, vec![])
            .await
            .unwrap();
        for v in values {
            backend.add_metric(&scenario_id, "latency", *v).await.unwrap();
        }
        (backend, scenario_id)
    }

    #[tokio::test]
    async fn runtime_seconds_extracts_time_taken() {
        let (backend, scenario_id) = scenario_with_metrics(&[]).await;
        let results = vec![InvocationResult {
            id: crate::model::ResultId::new(),
            output: serde_json::Value::Null,
            exception: None,
            logs: String::new(),
            timestamp: chrono::Utc::now(),
            time_taken: 1.5,
        }];

        let collect = runtime_seconds();
        collect(&results, scenario_id.clone(), backend.clone()).await;

        let total = backend.get_metric_total(&scenario_id, "runtime_seconds").await.unwrap();
        assert_eq!(total, Some(1.5));
    }

    #[tokio::test]
    async fn console_stats_reports_none_without_samples() {
        let (backend, scenario_id) = scenario_with_metrics(&[]).await;
        let display = console_stats("latency");
        assert_eq!(display(scenario_id, backend).await, None);
    }

    #[tokio::test]
    async fn console_latest_reports_last_value() {
        let (backend, scenario_id) = scenario_with_metrics(&[1.0, 2.0, 3.0]).await;
        let display = console_latest("latency");
        assert_eq!(display(scenario_id, backend).await, Some("3.000".to_string()));
    }
}
