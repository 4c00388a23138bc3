//! Configuration loading and schema (§2, §6 ambient stack).
//!
//! `surge.toml` describes the backend address, worker provisioning mode,
//! per-run timeouts, and the tags/env every `surge run` invocation carries
//! by default, following the teacher's `config::{load_config,
//! load_config_str}` shape and its tagged-enum-per-variant convention
//! (`ProviderConfig`/`FrameworkConfig` in `config/schema.rs`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Root configuration structure for `surge`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core run settings.
    #[serde(default)]
    pub surge: SurgeConfig,

    /// Worker provisioning mode and its mode-specific settings.
    pub worker: SchedulingMetadata,

    /// Report configuration (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,
}

/// Core `surge` execution settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SurgeConfig {
    /// Address the in-process or networked backend listens on / is reached at.
    #[serde(default = "default_backend_address")]
    pub backend_address: String,

    /// Directory holding the `surge` binary for `LOCAL` workers.
    pub backend_location: Option<PathBuf>,

    /// Overall per-test deadline in seconds (§5 "controller polices
    /// per-test deadlines").
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,

    /// Deadline for the test to report `TEST_STARTED` before the
    /// controller gives up.
    #[serde(default = "default_test_start_timeout")]
    pub test_start_timeout_secs: u64,

    /// Tags every `surge run` filters scenarios by unless overridden on
    /// the command line.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Environment variables forwarded to worker processes.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Exit non-zero if any scenario failed. Disabled via
    /// `--no-exit-unsuccessful`.
    #[serde(default = "default_true")]
    pub exit_unsuccessful: bool,

    /// Tear down workers after the run. Disabled via `--no-cleanup`.
    #[serde(default = "default_true")]
    pub cleanup: bool,
}

impl Default for SurgeConfig {
    fn default() -> Self {
        Self {
            backend_address: default_backend_address(),
            backend_location: None,
            test_timeout_secs: default_test_timeout(),
            test_start_timeout_secs: default_test_start_timeout(),
            tags: Vec::new(),
            env: HashMap::new(),
            exit_unsuccessful: true,
            cleanup: true,
        }
    }
}

fn default_backend_address() -> String {
    "127.0.0.1:7222".to_string()
}

fn default_test_timeout() -> u64 {
    900
}

fn default_test_start_timeout() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

/// Worker provisioning mode, tagged by `mode` in TOML (§6, §9). Each
/// variant carries exactly the scheduling-metadata fields spec.md lists
/// for that mode.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SchedulingMetadata {
    /// Runs workers as tasks within the controller's own process.
    Local {
        /// Path to the `surge` binary/runtime driving worker commands.
        runtime_path: Option<PathBuf>,
        test_file_path: Option<PathBuf>,
        #[serde(default = "default_logdir")]
        logdir: PathBuf,
    },
    /// Runs one container per worker via `bollard`.
    Docker {
        image: String,
        #[serde(default)]
        network: Option<String>,
    },
    /// Runs one pod per worker by shelling out to `kubectl`.
    Kube {
        image: String,
        namespace: String,
    },
}

fn default_logdir() -> PathBuf {
    PathBuf::from("./surge-logs")
}

impl SchedulingMetadata {
    /// The `mode` discriminant as the CLI and scheduling-metadata JSON
    /// blob spell it (`LOCAL`/`DOCKER`/`KUBE`).
    pub fn mode_name(&self) -> &'static str {
        match self {
            SchedulingMetadata::Local { .. } => "LOCAL",
            SchedulingMetadata::Docker { .. } => "DOCKER",
            SchedulingMetadata::Kube { .. } => "KUBE",
        }
    }

    /// The JSON object sent to `Backend::create_test` for this mode (§6).
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("SchedulingMetadata always serializes")
    }
}

/// Console reporting settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Print per-result output/logs even for successful scenarios.
    #[serde(default)]
    pub debug: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self { debug: false }
    }
}

/// Loads configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    load_config_str(&content).with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// Loads configuration from a TOML string.
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("failed to parse config")?;
    Ok(config)
}

/// The `surge.toml` scaffold written by `surge init` (§6's `init [path]`).
pub fn scaffold_toml() -> &'static str {
    r#"[surge]
backend_address = "127.0.0.1:7222"
test_timeout_secs = 900
test_start_timeout_secs = 60
tags = []

[worker]
mode = "local"
logdir = "./surge-logs"

[report]
debug = false
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_scheduling_metadata() {
        let config = load_config_str(scaffold_toml()).unwrap();
        assert!(matches!(config.worker, SchedulingMetadata::Local { .. }));
        assert_eq!(config.surge.test_timeout_secs, 900);
    }

    #[test]
    fn parses_docker_scheduling_metadata() {
        let toml = r#"
            [surge]
            backend_address = "127.0.0.1:7222"

            [worker]
            mode = "docker"
            image = "surge-worker:latest"
            network = "surge-net"
        "#;
        let config = load_config_str(toml).unwrap();
        match config.worker {
            SchedulingMetadata::Docker { image, network } => {
                assert_eq!(image, "surge-worker:latest");
                assert_eq!(network.as_deref(), Some("surge-net"));
            }
            other => panic!("expected Docker, got {other:?}"),
        }
    }

    #[test]
    fn rejects_invalid_mode() {
        let toml = r#"
            [worker]
            mode = "nonexistent"
        "#;
        assert!(load_config_str(toml).is_err());
    }

    #[test]
    fn scheduling_metadata_mode_name_matches_cli_spelling() {
        let meta = SchedulingMetadata::Kube { image: "i".into(), namespace: "ns".into() };
        assert_eq!(meta.mode_name(), "KUBE");
        assert_eq!(meta.to_json()["namespace"], serde_json::json!("ns"));
    }
}
