//! Server configuration: loading, defaulting, and validation. Follows the
//! teacher's `Config::from_file` pattern — read the file to a `String`,
//! deserialize into a `RawConfig`, apply defaults for absent fields,
//! validate, and hand back the immutable `Config` the rest of the process
//! borrows.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

/// HyperLogLog register sizing, shared by every HyperLogLogNode.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HyperLogLogConfig {
    #[serde(default = "default_register_log")]
    pub register_log: u8,
    #[serde(default = "default_register_width")]
    pub register_width: u8,
}

impl Default for HyperLogLogConfig {
    fn default() -> Self {
        HyperLogLogConfig {
            register_log: default_register_log(),
            register_width: default_register_width(),
        }
    }
}

fn default_register_log() -> u8 {
    14
}
fn default_register_width() -> u8 {
    6
}

/// The raw shape of the `[curiodb]` TOML table, every field optional so a
/// missing or partial config file still produces a bootable `Config`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawCuriodb {
    persist_after: Option<i64>,
    sleep_after: Option<u64>,
    #[serde(default)]
    hyperloglog: HyperLogLogConfig,
    keynodes: Option<usize>,
    listen: Option<String>,
    node: Option<String>,
    #[serde(default)]
    nodes: HashMap<String, String>,
    data_dir: Option<String>,
    log_level: Option<String>,
    aggregator_timeout_ms: Option<u64>,
    databases: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    curiodb: RawCuriodb,
}

/// The validated, immutable configuration the running process operates on.
#[derive(Debug, Clone)]
pub struct Config {
    /// Write debounce in ms; 0 = synchronous, negative = disabled.
    pub persist_after_ms: i64,
    /// Passivation delay in ms; 0 = passivation disabled.
    pub sleep_after_ms: u64,
    pub hyperloglog: HyperLogLogConfig,
    /// Number of KeyManager partitions this node owns.
    pub keynodes: usize,
    /// Address this node's TCP listener binds to.
    pub listen: String,
    /// This node's id within `nodes`.
    pub node: String,
    /// The full static cluster topology, node-id -> listen URI.
    pub nodes: HashMap<String, String>,
    pub data_dir: PathBuf,
    pub log_level: String,
    pub aggregator_timeout_ms: u64,
    pub databases: usize,
}

fn default_keynodes() -> usize {
    4
}
fn default_listen() -> String {
    "127.0.0.1:6380".to_string()
}
fn default_node() -> String {
    "node-1".to_string()
}
fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_aggregator_timeout_ms() -> u64 {
    2000
}
fn default_databases() -> usize {
    16
}

impl Default for Config {
    fn default() -> Self {
        Config {
            persist_after_ms: 100,
            sleep_after_ms: 0,
            hyperloglog: HyperLogLogConfig::default(),
            keynodes: default_keynodes(),
            listen: default_listen(),
            node: default_node(),
            nodes: HashMap::new(),
            data_dir: PathBuf::from(default_data_dir()),
            log_level: default_log_level(),
            aggregator_timeout_ms: default_aggregator_timeout_ms(),
            databases: default_databases(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML from '{path}'"))?;

        let defaults = Config::default();
        let config = Config {
            persist_after_ms: raw.curiodb.persist_after.unwrap_or(defaults.persist_after_ms),
            sleep_after_ms: raw.curiodb.sleep_after.unwrap_or(defaults.sleep_after_ms),
            hyperloglog: raw.curiodb.hyperloglog,
            keynodes: raw.curiodb.keynodes.unwrap_or(defaults.keynodes),
            listen: raw.curiodb.listen.unwrap_or(defaults.listen),
            node: raw.curiodb.node.unwrap_or(defaults.node),
            nodes: raw.curiodb.nodes,
            data_dir: raw.curiodb.data_dir.map(PathBuf::from).unwrap_or(defaults.data_dir),
            log_level: raw.curiodb.log_level.unwrap_or(defaults.log_level),
            aggregator_timeout_ms: raw
                .curiodb
                .aggregator_timeout_ms
                .unwrap_or(defaults.aggregator_timeout_ms),
            databases: raw.curiodb.databases.unwrap_or(defaults.databases),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.listen.trim().is_empty() {
            return Err(anyhow!("curiodb.listen cannot be empty"));
        }
        if self.keynodes == 0 {
            return Err(anyhow!("curiodb.keynodes must be at least 1"));
        }
        if self.databases == 0 {
            return Err(anyhow!("curiodb.databases must be at least 1"));
        }
        if !self.nodes.is_empty() && !self.nodes.contains_key(&self.node) {
            warn!(
                node = %self.node,
                "this node's id is not present in curiodb.nodes; cluster topology may be incomplete"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn from_file_applies_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[curiodb]\nkeynodes = 8\n").unwrap();
        let config = Config::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.keynodes, 8);
        assert_eq!(config.listen, default_listen());
        assert_eq!(config.aggregator_timeout_ms, default_aggregator_timeout_ms());
    }

    #[test]
    fn zero_keynodes_is_rejected() {
        let mut config = Config::default();
        config.keynodes = 0;
        assert!(config.validate().is_err());
    }
}
