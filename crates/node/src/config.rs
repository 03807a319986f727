//! Node configuration

use anyhow::{Context, Result};
use node_lib::{NodeSettings, Service};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Service hosted from startup
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// Memory footprint of one worker
    pub memory: u64,
    pub target_rt_ms: f64,
    #[serde(default)]
    pub target_allocation: f64,
}

/// Node configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Memory shared by all worker pools
    #[serde(default = "default_memory")]
    pub memory: u64,

    #[serde(default = "default_control_period_ms")]
    pub control_period_ms: u64,

    /// Smoothing factor of the allocation filters
    #[serde(default = "default_alpha")]
    pub alpha: f64,

    /// Closed-loop control; false applies each service's target allocation
    #[serde(default = "default_control")]
    pub control: bool,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// CSV allocation log, written in addition to the tracing output
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Emit the allocation log at all
    #[serde(default = "default_verbose")]
    pub verbose: bool,

    /// Per-service queue bound; unbounded when absent
    #[serde(default)]
    pub max_pending: Option<usize>,

    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

fn default_node_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "1".to_string())
}

fn default_memory() -> u64 {
    8192
}

fn default_control_period_ms() -> u64 {
    9000
}

fn default_alpha() -> f64 {
    0.9
}

fn default_control() -> bool {
    true
}

fn default_verbose() -> bool {
    true
}

fn default_api_port() -> u16 {
    8080
}

fn default_history_capacity() -> usize {
    node_lib::history::DEFAULT_MAX_RECORDS
}

impl NodeConfig {
    /// Load configuration from the file named by `NODE_CONFIG` (if any) and
    /// `NODE_*` environment variables, the latter taking precedence
    pub fn load() -> Result<Self> {
        let path = std::env::var("NODE_CONFIG").ok().map(PathBuf::from);
        Self::load_from(path)
    }

    pub fn load_from(path: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = &path {
            builder = builder.add_source(config::File::from(path.as_path()));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("NODE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read node configuration")?;

        config
            .try_deserialize()
            .context("Invalid node configuration")
    }

    pub fn settings(&self) -> NodeSettings {
        let settings = NodeSettings::new(
            self.node_id.clone(),
            self.memory,
            Duration::from_millis(self.control_period_ms),
            self.alpha,
            self.control,
        )
        .with_history_capacity(self.history_capacity);

        match self.max_pending {
            Some(max) => settings.with_max_pending(max),
            None => settings,
        }
    }

    pub fn services(&self) -> Vec<Service> {
        self.services
            .iter()
            .map(|s| {
                Service::new(s.name.clone(), s.memory, s.target_rt_ms)
                    .with_target_allocation(s.target_allocation)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let config = NodeConfig::load_from(None).unwrap();
        let settings = config.settings();

        assert_eq!(settings.control_period, Duration::from_millis(9000));
        assert!(settings.validate().is_ok());
        assert_eq!(settings.executor.max_pending, None);
    }

    #[test]
    fn test_file_with_services() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
node_id = "edge-3"
memory = 384
control_period_ms = 1000
control = false
max_pending = 50

[[services]]
name = "a"
memory = 128
target_rt_ms = 120.0
target_allocation = 2.0

[[services]]
name = "b"
memory = 256
target_rt_ms = 100.0
"#
        )
        .unwrap();

        let config = NodeConfig::load_from(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.node_id, "edge-3");

        let settings = config.settings();
        assert_eq!(settings.memory, 384);
        assert!(!settings.control_enabled);
        assert_eq!(settings.executor.max_pending, Some(50));

        let services = config.services();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].target_allocation, 2.0);
        assert_eq!(services[1].target_allocation, 0.0);
        assert!(services.iter().all(|s| s.validate().is_ok()));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = NodeConfig::load_from(Some(PathBuf::from("/nonexistent/node.toml")));
        assert!(result.is_err());
    }
}
