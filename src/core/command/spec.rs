//! The command descriptor table: for every command name, the type of
//! ValueNode it targets, its keyedness/write/overwrite flags, its arity, and
//! its reply when the key is absent. Loaded once from an embedded TOML
//! document — the same format an operator would hand-edit to add a command
//! without touching Rust source.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Embedded at compile time; this is the "external table" described in the
/// system's configuration surface.
const TABLE_TOML: &str = include_str!("table.toml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    String,
    Hash,
    List,
    Set,
    #[serde(rename = "sortedset")]
    SortedSet,
    Bitmap,
    #[serde(rename = "hyperloglog")]
    HyperLogLog,
    Keys,
    Client,
    Aggregate,
}

impl NodeType {
    /// The string `TYPE` should report for a key owned by a node of this kind.
    pub fn type_name(self) -> &'static str {
        match self {
            NodeType::String => "string",
            NodeType::Hash => "hash",
            NodeType::List => "list",
            NodeType::Set => "set",
            NodeType::SortedSet => "zset",
            NodeType::Bitmap => "string",
            NodeType::HyperLogLog => "string",
            NodeType::Keys | NodeType::Client | NodeType::Aggregate => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgsSpec {
    Fixed(i64),
    Range(i64, i64),
    Many(i64),
    Pairs,
}

impl ArgsSpec {
    /// `count` is the number of elements following the command name (the key,
    /// if keyed, counts as one of them).
    pub fn matches(self, count: usize) -> bool {
        let count = count as i64;
        match self {
            ArgsSpec::Fixed(n) => count == n,
            ArgsSpec::Range(a, b) => count >= a && count <= b,
            ArgsSpec::Many(min) => count >= min,
            ArgsSpec::Pairs => count >= 2 && count % 2 == 0,
        }
    }
}

impl<'de> Deserialize<'de> for ArgsSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_args_spec(&raw).map_err(serde::de::Error::custom)
    }
}

fn parse_args_spec(raw: &str) -> Result<ArgsSpec, String> {
    if raw == "pairs" {
        return Ok(ArgsSpec::Pairs);
    }
    if let Some(min) = raw.strip_suffix("-many") {
        return min
            .parse::<i64>()
            .map(ArgsSpec::Many)
            .map_err(|e| e.to_string());
    }
    if let Some((a, b)) = raw.split_once('-') {
        let a = a.parse::<i64>().map_err(|e| e.to_string())?;
        let b = b.parse::<i64>().map_err(|e| e.to_string())?;
        return Ok(ArgsSpec::Range(a, b));
    }
    raw.parse::<i64>()
        .map(ArgsSpec::Fixed)
        .map_err(|e| e.to_string())
}

/// The reply a descriptor says to send when the targeted key does not exist,
/// without ever materializing a ValueNode for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefaultReply {
    Empty,
    Ok,
    Nil,
    Zero,
    NegOne,
    NegTwo,
    EmptySeq,
    /// An array of nils, one per requested field (e.g. `HMGET` on a missing hash).
    Nils,
    Zeros,
    ScanEmpty,
    /// The literal Redis `TYPE` reply for a missing key: `+none`.
    NoneType,
    Error,
    /// No default: always forward to (and lazily create) the owning ValueNode.
    Forward,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    pub node_type: NodeType,
    pub keyed: bool,
    pub writes: bool,
    #[serde(default)]
    pub overwrites: bool,
    pub args: ArgsSpec,
    pub default: DefaultReply,
}

#[derive(Debug, Deserialize)]
struct RawTable {
    command: Vec<CommandSpec>,
}

pub static COMMAND_TABLE: Lazy<HashMap<String, CommandSpec>> = Lazy::new(|| {
    let raw: RawTable = toml::from_str(TABLE_TOML).expect("embedded command table must parse");
    raw.command.into_iter().map(|c| (c.name.clone(), c)).collect()
});

pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    COMMAND_TABLE.get(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_parses_and_covers_core_commands() {
        for cmd in ["get", "set", "hset", "lpush", "zadd", "sadd", "del", "ping"] {
            assert!(lookup(cmd).is_some(), "missing descriptor for {cmd}");
        }
    }

    #[test]
    fn args_spec_parses_variants() {
        assert_eq!(parse_args_spec("1").unwrap(), ArgsSpec::Fixed(1));
        assert_eq!(parse_args_spec("2-4").unwrap(), ArgsSpec::Range(2, 4));
        assert_eq!(parse_args_spec("1-many").unwrap(), ArgsSpec::Many(1));
        assert_eq!(parse_args_spec("pairs").unwrap(), ArgsSpec::Pairs);
    }

    #[test]
    fn get_descriptor_shape_matches_spec() {
        let get = lookup("get").unwrap();
        assert_eq!(get.node_type, NodeType::String);
        assert!(get.keyed);
        assert!(!get.writes);
        assert_eq!(get.default, DefaultReply::Nil);
    }
}
