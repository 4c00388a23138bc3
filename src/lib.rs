//! # surge
//!
//! A distributed load-testing engine: a test runner that drives scenarios
//! through a dependency DAG, a scenario runtime that scales users and
//! drives a load model, a user-side buffer/scheduler/runner that executes
//! scenario bodies, and a backend protocol that is the single
//! synchronization point between all of the above.
//!
//! ## Architecture
//!
//! ```text
//!   Test Runner ──CreateScenario──► Backend ◄──results/metrics── Scenario Runtime
//!       │                                                              │
//!       │ launches workers                                    drives Load Model
//!       ▼                                                              │
//!  WorkerLauncher ──spawns──► User Scheduler ──spawns──► User Runner ──┘
//!                                   │                        │
//!                                   └── User Buffer ◄─────────┘
//! ```
//!
//! ### Data model ([`model`], [`context`])
//!
//! Opaque identifiers, `Result`/`ScenarioResult`/`UserEvent`/`TestEvent`,
//! and the static [`model::Scenario`] record built by
//! [`scenario::ScenarioBuilder`].
//!
//! ### Backend ([`backend`])
//!
//! [`backend::Backend`] is the RPC surface every other component talks
//! through; [`backend::memory::MemoryBackend`] is the in-process
//! reference implementation used by `LOCAL` mode and this crate's own
//! test suite.
//!
//! ### User-side ([`user`])
//!
//! [`user::UserBuffer`] (per-worker staging), [`user::loops`] (the
//! policies a user loop runs), [`user::UserCommands`] (what a loop
//! invokes), and [`user::UserScheduler`] (discovers new users and spawns
//! them).
//!
//! ### Scenario runtime ([`scenario`], [`load_model`])
//!
//! [`scenario::runtime::ScenarioRuntime`] owns one scenario's execution;
//! [`load_model::LoadModelFn`] is the policy that drives it (iteration
//! counts, ramps, thresholds, staged combinations).
//!
//! ### Test runner ([`test_runner`])
//!
//! [`test_runner::TestRunner`] drives the scenario dependency graph to
//! completion and emits the `TestEvent`s a controller consumes.
//!
//! ### Ambient stack
//!
//! [`config`] (TOML configuration), [`worker`] (Local/Docker/Kube launcher
//! implementations), [`report`] (console reporter), [`metrics`] (metric
//! collectors and console displays), [`panic_util`] (panic-payload
//! formatting).
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use surge::backend::Backend;
//! use surge::backend::memory::MemoryBackend;
//! use surge::scenario::ScenarioBuilder;
//! use surge::test_runner::TestRunner;
//! use surge::worker::local::LocalLauncher;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
//!     let launcher = Arc::new(LocalLauncher::new(backend.clone()));
//!
//!     let scenario = ScenarioBuilder::new("checkout", |_ctx, log| {
//!         Box::pin(async move {
//!             log.writeln("checkout started");
//!             Ok(serde_json::json!({"ok": true}))
//!         })
//!     })
//!     .build();
//!
//!     let test_id = backend
//!         .create_test(serde_json::json!({}), String::new(), vec![], Default::default())
//!         .await?;
//!
//!     let runner = TestRunner::new(backend, launcher, test_id, vec![Arc::new(scenario)]);
//!     let results = runner.run(&[]).await?;
//!     println!("{results:?}");
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod load_model;
pub mod metrics;
pub mod model;
pub mod panic_util;
pub mod report;
pub mod scenario;
pub mod test_runner;
pub mod user;
pub mod worker;

pub use backend::Backend;
pub use config::{Config, load_config};
pub use model::{Result as InvocationResult, Scenario, ScenarioResult, TestEvent, UserEvent};
pub use scenario::ScenarioBuilder;
pub use test_runner::TestRunner;
