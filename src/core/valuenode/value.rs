//! The typed value a ValueNode owns, and the small envelope of lifecycle
//! metadata (expiry, dirty flag) that rides alongside it.

use crate::core::command::NodeType;
use crate::core::sortedset::SortedSet;
use crate::core::valuenode::hll::HyperLogLog;
use bytes::Bytes;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Str(Bytes),
    Bitmap(Vec<u8>),
    Hll(HyperLogLog),
    Hash(IndexMap<Bytes, Bytes>),
    List(VecDeque<Bytes>),
    Set(IndexSet<Bytes>),
    SortedSet(SortedSet),
}

impl Value {
    pub fn node_type(&self) -> NodeType {
        match self {
            Value::Str(_) => NodeType::String,
            Value::Bitmap(_) => NodeType::Bitmap,
            Value::Hll(_) => NodeType::HyperLogLog,
            Value::Hash(_) => NodeType::Hash,
            Value::List(_) => NodeType::List,
            Value::Set(_) => NodeType::Set,
            Value::SortedSet(_) => NodeType::SortedSet,
        }
    }

    pub fn empty_for(node_type: NodeType) -> Option<Value> {
        match node_type {
            NodeType::String => Some(Value::Str(Bytes::new())),
            NodeType::Bitmap => Some(Value::Bitmap(Vec::new())),
            NodeType::HyperLogLog => Some(Value::Hll(HyperLogLog::new())),
            NodeType::Hash => Some(Value::Hash(IndexMap::new())),
            NodeType::List => Some(Value::List(VecDeque::new())),
            NodeType::Set => Some(Value::Set(IndexSet::new())),
            NodeType::SortedSet => Some(Value::SortedSet(SortedSet::new())),
            NodeType::Keys | NodeType::Client | NodeType::Aggregate => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Value::Str(b) => b.is_empty(),
            Value::Bitmap(b) => b.iter().all(|&byte| byte == 0),
            Value::Hll(_) => false,
            Value::Hash(m) => m.is_empty(),
            Value::List(l) => l.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::SortedSet(z) => z.is_empty(),
        }
    }
}

/// Expiry is tracked by the owning KeyManager's `NodeEntry`, not here: a
/// ValueNode only ever sees the bare typed value. This keeps TTL bookkeeping
/// (and the single-shot expiry timer) in one place regardless of which type
/// owns the key.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}
