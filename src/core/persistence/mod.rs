//! Snapshot-based durability. Every ValueNode's value round-trips through a
//! single `bincode`-encoded file named after its (db, key) identity; writes
//! go to a temp file and are renamed into place so a crash mid-write never
//! leaves a corrupt snapshot behind. There is no write-ahead log: this is
//! "snapshot-only" persistence, chosen for simplicity at the cost of losing
//! writes that land between two debounced saves.

use crate::core::command::NodeType;
use crate::core::valuenode::Value;
use bincode::config;
use bytes::Bytes;
use dashmap::DashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy)]
pub enum PersistenceMode {
    /// `persist-after = 0`: every write snapshots before the reply goes out.
    Sync,
    /// `persist-after > 0`: writes coalesce into one snapshot per debounce window.
    Debounced(Duration),
    /// `persist-after < 0`: never snapshot.
    Disabled,
}

impl PersistenceMode {
    pub fn from_millis(ms: i64) -> Self {
        match ms.cmp(&0) {
            std::cmp::Ordering::Equal => PersistenceMode::Sync,
            std::cmp::Ordering::Less => PersistenceMode::Disabled,
            std::cmp::Ordering::Greater => PersistenceMode::Debounced(Duration::from_millis(ms as u64)),
        }
    }
}

/// A cheaply-clonable reference to the snapshot store, handed to every
/// ValueNode at spawn time.
#[derive(Clone)]
pub struct PersistenceHandle {
    mode: PersistenceMode,
    data_dir: Arc<PathBuf>,
    pending: Arc<DashSet<(usize, Bytes)>>,
}

impl PersistenceHandle {
    pub fn new(data_dir: PathBuf, mode: PersistenceMode) -> Self {
        PersistenceHandle {
            mode,
            data_dir: Arc::new(data_dir),
            pending: Arc::new(DashSet::new()),
        }
    }

    fn path_for(&self, db: usize, key: &Bytes, node_type: NodeType) -> PathBuf {
        self.data_dir.join(format!("{db}-{}-{}.snap", type_slug(node_type), hex::encode(key)))
    }

    /// Writes the snapshot immediately, regardless of mode. Used for a clean
    /// passivation flush and by `schedule_save` under `Sync` mode.
    pub async fn save(&self, db: usize, key: &Bytes, value: &Value) {
        if matches!(self.mode, PersistenceMode::Disabled) {
            return;
        }
        if let Err(e) = self.write(db, key, value).await {
            error!(db, key = %String::from_utf8_lossy(key), error = %e, "snapshot write failed");
        }
    }

    async fn write(&self, db: usize, key: &Bytes, value: &Value) -> std::io::Result<()> {
        fs::create_dir_all(self.data_dir.as_path()).await?;
        let path = self.path_for(db, key, value.node_type());
        let tmp_path = path.with_extension("snap.tmp");
        let bytes = bincode::serde::encode_to_vec(value, config::standard())
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        fs::write(&tmp_path, &bytes).await?;
        fs::rename(&tmp_path, &path).await?;
        debug!(db, key = %String::from_utf8_lossy(key), bytes = bytes.len(), "snapshot written");
        Ok(())
    }

    /// Schedules a save per `persist-after`'s configured mode. Duplicate
    /// schedules for the same (db, key) while one is already pending are
    /// coalesced into the in-flight one.
    pub fn schedule_save(&self, db: usize, key: Bytes, value: Value) {
        match self.mode {
            PersistenceMode::Disabled => {}
            PersistenceMode::Sync => {
                let this = self.clone();
                tokio::spawn(async move { this.save(db, &key, &value).await });
            }
            PersistenceMode::Debounced(delay) => {
                let marker = (db, key.clone());
                if !self.pending.insert(marker.clone()) {
                    return;
                }
                let this = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    this.pending.remove(&marker);
                    this.save(db, &key, &value).await;
                });
            }
        }
    }

    /// Removes a key's snapshot file, if any. Called when a ValueNode is deleted.
    pub async fn delete(&self, db: usize, key: &Bytes) {
        for node_type in ALL_NODE_TYPES {
            let path = self.path_for(db, key, node_type);
            match fs::remove_file(&path).await {
                Ok(()) => debug!(db, key = %String::from_utf8_lossy(key), "snapshot deleted"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => error!(db, key = %String::from_utf8_lossy(key), error = %e, "snapshot delete failed"),
            }
        }
    }

    /// Loads a previously snapshotted value, if one exists, for actor recovery.
    pub async fn load(&self, db: usize, key: &Bytes, node_type: NodeType) -> Option<Value> {
        let path = self.path_for(db, key, node_type);
        let bytes = fs::read(&path).await.ok()?;
        match bincode::serde::decode_from_slice::<Value, _>(&bytes, config::standard()) {
            Ok((value, _)) => Some(value),
            Err(e) => {
                error!(db, key = %String::from_utf8_lossy(key), error = %e, "snapshot decode failed");
                None
            }
        }
    }
}

const ALL_NODE_TYPES: [NodeType; 7] = [
    NodeType::String,
    NodeType::Bitmap,
    NodeType::HyperLogLog,
    NodeType::Hash,
    NodeType::List,
    NodeType::Set,
    NodeType::SortedSet,
];

fn type_slug(node_type: NodeType) -> &'static str {
    match node_type {
        NodeType::String => "str",
        NodeType::Bitmap => "bitmap",
        NodeType::HyperLogLog => "hll",
        NodeType::Hash => "hash",
        NodeType::List => "list",
        NodeType::Set => "set",
        NodeType::SortedSet => "zset",
        NodeType::Keys | NodeType::Client | NodeType::Aggregate => "keys",
    }
}

/// The KeyManager's own durable state is the `(db, key) -> node-type`
/// skeleton, not the values themselves (those are each ValueNode's own
/// snapshot). One file per partition, named by partition index.
pub mod skeleton {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SkeletonEntry {
        pub db: usize,
        pub key: Bytes,
        pub node_type: NodeType,
        pub expires_at_ms: Option<i64>,
    }

    pub async fn save(data_dir: &Path, partition: usize, entries: &[SkeletonEntry]) -> std::io::Result<()> {
        fs::create_dir_all(data_dir).await?;
        let path = data_dir.join(format!("keys-{partition}.snap"));
        let tmp_path = path.with_extension("snap.tmp");
        let bytes = bincode::serde::encode_to_vec(entries, config::standard())
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        fs::write(&tmp_path, &bytes).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    pub async fn load(data_dir: &Path, partition: usize) -> Vec<SkeletonEntry> {
        let path = data_dir.join(format!("keys-{partition}.snap"));
        let Ok(bytes) = fs::read(&path).await else {
            return Vec::new();
        };
        bincode::serde::decode_from_slice(&bytes, config::standard())
            .map(|(entries, _)| entries)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::valuenode::Value;
    use tempfile::tempdir;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let handle = PersistenceHandle::new(dir.path().to_path_buf(), PersistenceMode::Sync);
        let key = Bytes::from_static(b"greeting");
        let value = Value::Str(Bytes::from_static(b"hello"));
        handle.save(0, &key, &value).await;
        let loaded = handle.load(0, &key, value.node_type()).await;
        assert_eq!(loaded, Some(value));
    }

    #[tokio::test]
    async fn delete_removes_snapshot() {
        let dir = tempdir().unwrap();
        let handle = PersistenceHandle::new(dir.path().to_path_buf(), PersistenceMode::Sync);
        let key = Bytes::from_static(b"k");
        let value = Value::Str(Bytes::from_static(b"v"));
        handle.save(0, &key, &value).await;
        handle.delete(0, &key).await;
        assert_eq!(handle.load(0, &key, value.node_type()).await, None);
    }
}
