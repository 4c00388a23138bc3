//! Console reporting (§7 ambient stack): turns the `TestEvent` stream the
//! controller drains from the backend into the terminal output a human
//! watches during `surge run`.
//!
//! Grounded on the teacher's `report::ConsoleReporter` — same use of
//! `indicatif` for a live progress bar and `console::style` for colored
//! PASS/FAIL/SKIP output — adapted from a `Reporter` trait driven by
//! `TestRecord`/`TestResult` to one driven by polling
//! `Backend::get_test_events`. Full per-scenario detail (exception,
//! output, logs, timings) lives in the `ScenarioResult`s
//! `TestRunner::run` returns; this module prints a live play-by-play from
//! events as the run progresses, and a final table once that map is in
//! hand.

use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::backend::Backend;
use crate::model::{ScenarioResult, TestEventKind, TestEventPayload, TestId};

/// Running tally built up from the live `TestEvent` stream: enough to
/// drive the progress bar and a coarse pass/fail/skip count without
/// needing the full `ScenarioResult`s (those only land once
/// `TestRunner::run` returns).
#[derive(Debug, Default)]
pub struct EventTally {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl EventTally {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Polls `Backend::get_test_events` and renders them to the terminal as
/// they arrive, the same role the teacher's `ConsoleReporter` plays for a
/// `RunResult` it's handed all at once.
pub struct ConsoleReporter {
    bar: ProgressBar,
    debug: bool,
}

impl ConsoleReporter {
    pub fn new(expected_scenarios: u64, debug: bool) -> Self {
        let bar = ProgressBar::new(expected_scenarios);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} scenarios",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
        );
        Self { bar, debug }
    }

    /// Handles one `TestEvent`, printing and updating the bar as needed.
    /// Returns `Some((name, failed))` when the event was a
    /// `ScenarioFinished`, so callers can fold it into an [`EventTally`].
    pub fn on_event(&self, kind: TestEventKind, payload: &TestEventPayload) -> Option<(String, bool)> {
        match kind {
            TestEventKind::TestStarted => {
                if let TestEventPayload::Status { message, .. } = payload {
                    self.bar.println(format!("{} {message}", style("==>").bold().blue()));
                }
                None
            }
            TestEventKind::ScenarioStarted => {
                if let TestEventPayload::Status { scenario: Some(name), .. } = payload {
                    self.bar.println(format!("{} {name}", style("start").cyan()));
                }
                None
            }
            TestEventKind::ScenarioMetric => {
                if let TestEventPayload::Metric { scenario, metrics } = payload {
                    for (name, value) in metrics {
                        let value = value.as_deref().unwrap_or("-");
                        self.bar.println(format!("  {scenario} {name}: {value}"));
                    }
                }
                None
            }
            TestEventKind::ScenarioFinished => {
                if let TestEventPayload::Status { scenario: Some(name), message, .. } = payload {
                    let failed = message != "Scenario finished";
                    let label = if failed { style("FAIL").red().bold() } else { style("PASS").green().bold() };
                    self.bar.println(format!("{label} {name} - {message}"));
                    self.bar.inc(1);
                    return Some((name.clone(), failed));
                }
                None
            }
            TestEventKind::TestErrored => {
                if let TestEventPayload::Status { message, .. } = payload {
                    self.bar.println(format!("{} {message}", style("ERROR").red().bold()));
                }
                None
            }
            TestEventKind::TestFinished => {
                if let TestEventPayload::Status { message, .. } = payload {
                    self.bar.finish_with_message(message.clone());
                }
                None
            }
        }
    }

    /// Prints the final table: per-scenario exception, output, logs (on
    /// failure or when `debug` is set), time taken, and succeeded/failed
    /// counts, matching §7's "controller prints per-scenario pass/fail
    /// sections".
    pub fn print_summary(&self, results: &std::collections::HashMap<String, ScenarioResult>) {
        let succeeded = results.values().filter(|r| r.exception.is_none()).count();
        let failed = results.values().filter(|r| r.exception.is_some()).count();

        println!();
        println!("{} succeeded, {} failed", style(succeeded).green(), style(failed).red());

        for (name, result) in results {
            let status =
                if result.exception.is_some() { style("FAIL").red().bold() } else { style("PASS").green().bold() };
            println!(
                "{status} {name} ({:.2}s, {} ok / {} failed)",
                result.time_taken, result.succeeded, result.failed
            );

            if let Some(exception) = &result.exception {
                println!("  Exception: {exception}");
            }
            if self.debug || result.exception.is_some() {
                if !result.logs.is_empty() {
                    println!("  Logs:\n{}", indent(&result.logs));
                }
                println!("  Output: {}", result.output);
            }
        }
    }
}

fn indent(text: &str) -> String {
    text.lines().map(|line| format!("    {line}")).collect::<Vec<_>>().join("\n")
}

/// Polls `Backend::get_test_events` on a fixed interval, feeding every
/// event through `reporter.on_event` and folding `ScenarioFinished`
/// outcomes into an [`EventTally`], until `TEST_FINISHED` is observed.
pub async fn watch_test(
    backend: &dyn Backend,
    test_id: &TestId,
    reporter: &ConsoleReporter,
    poll_period: Duration,
) -> anyhow::Result<EventTally> {
    let mut tally = EventTally::default();

    loop {
        let events = backend.get_test_events(test_id).await?;
        let mut finished = false;

        for event in events {
            if matches!(event.kind, TestEventKind::TestFinished) {
                finished = true;
            }
            if let Some((_, failed)) = reporter.on_event(event.kind, &event.payload) {
                if failed {
                    tally.failed += 1;
                } else {
                    tally.succeeded += 1;
                }
            }
        }

        if finished {
            break;
        }
        tokio::time::sleep(poll_period).await;
    }

    Ok(tally)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TestEventPayload;

    #[test]
    fn scenario_finished_increments_bar_and_reports_pass() {
        let reporter = ConsoleReporter::new(2, false);
        let payload = TestEventPayload::Status {
            scenario: Some("checkout".to_string()),
            scenario_id: Some("sid".to_string()),
            message: "Scenario finished".to_string(),
            context: None,
        };
        let outcome = reporter.on_event(TestEventKind::ScenarioFinished, &payload);
        assert_eq!(outcome, Some(("checkout".to_string(), false)));
    }

    #[test]
    fn scenario_finished_with_exception_message_reports_failure() {
        let reporter = ConsoleReporter::new(1, false);
        let payload = TestEventPayload::Status {
            scenario: Some("checkout".to_string()),
            scenario_id: None,
            message: "boom".to_string(),
            context: None,
        };
        let outcome = reporter.on_event(TestEventKind::ScenarioFinished, &payload);
        assert_eq!(outcome, Some(("checkout".to_string(), true)));
    }

    #[test]
    fn event_tally_success_requires_zero_failures() {
        let mut tally = EventTally::default();
        assert!(tally.success());
        tally.failed = 1;
        assert!(!tally.success());
    }
}
