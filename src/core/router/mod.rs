//! Consistent-hash dispatch from a decoded command to the KeyManager
//! partition that owns its key. Stateless and synchronous: delivery is
//! best-effort over a bounded channel, with FIFO ordering preserved per
//! (partition, sender).

use crate::core::command::Payload;
use crate::core::DbError;
use bytes::Bytes;
use crc::{Crc, CRC_16_USB};
use tokio::sync::mpsc;

/// Same algorithm the teacher repo uses for cluster slot assignment: CRC16
/// over the key (or its `{...}` hash tag, if present), which is stable across
/// process restarts — unlike a randomly-seeded `DefaultHasher`, a NodeEntry
/// recovered from a snapshot always lands back on the partition that saved it.
const CRC16_ALGO: Crc<u16> = Crc::<u16>::new(&CRC_16_USB);

/// The inbox every KeyManager partition listens on.
pub type PartitionSender = mpsc::Sender<Payload>;

pub struct Router {
    partitions: Vec<PartitionSender>,
}

impl Router {
    pub fn new(partitions: Vec<PartitionSender>) -> Self {
        assert!(!partitions.is_empty(), "router needs at least one partition");
        Router { partitions }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Which partition owns `key`. A `{tag}` substring, if present and
    /// non-empty, is hashed instead of the whole key so related keys can be
    /// forced onto the same partition.
    pub fn partition_for(&self, key: &[u8]) -> usize {
        let hashed = hash_tag(key).unwrap_or(key);
        let checksum = CRC16_ALGO.checksum(hashed);
        checksum as usize % self.partitions.len()
    }

    /// Routes `payload` to the partition that owns its key.
    pub async fn route(&self, payload: Payload) -> Result<(), DbError> {
        let partition = self.partition_for(&payload.key);
        self.partitions[partition]
            .send(payload)
            .await
            .map_err(DbError::from)
    }

    /// Delivers `payload` to a specific partition, bypassing key hashing.
    /// Used for broadcasts (`KEYS`, `FLUSHALL`, ...) where the caller already
    /// knows it wants every partition, and for internal follow-ups (`RENAME`,
    /// `SMOVE`) whose destination key hashes independently of the source.
    pub async fn send_to(&self, partition: usize, payload: Payload) -> Result<(), DbError> {
        self.partitions[partition]
            .send(payload)
            .await
            .map_err(DbError::from)
    }

    pub fn partitions(&self) -> impl Iterator<Item = usize> {
        0..self.partitions.len()
    }
}

fn hash_tag(key: &[u8]) -> Option<&[u8]> {
    let start = key.iter().position(|&b| b == b'{')?;
    let end_offset = key[start + 1..].iter().position(|&b| b == b'}')?;
    let end = start + 1 + end_offset;
    if end > start + 1 {
        Some(&key[start + 1..end])
    } else {
        None
    }
}

/// Helper for code that needs a key as a routing target without owning a
/// `Bytes` already (e.g. constructing a follow-up payload).
pub fn as_key(s: impl Into<Bytes>) -> Bytes {
    s.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_tag_extracts_braced_substring() {
        assert_eq!(hash_tag(b"user:{123}:name"), Some(&b"123"[..]));
        assert_eq!(hash_tag(b"user:{}:name"), None);
        assert_eq!(hash_tag(b"plain-key"), None);
    }

    #[tokio::test]
    async fn partition_for_is_stable_across_calls() {
        let (tx, _rx) = mpsc::channel(8);
        let router = Router::new(vec![tx.clone(), tx.clone(), tx]);
        let a = router.partition_for(b"some-key");
        let b = router.partition_for(b"some-key");
        assert_eq!(a, b);
        assert!(a < 3);
    }

    #[tokio::test]
    async fn hash_tagged_keys_collide_on_purpose() {
        let (tx, _rx) = mpsc::channel(8);
        let router = Router::new(vec![tx.clone(), tx.clone(), tx]);
        assert_eq!(
            router.partition_for(b"foo:{tag}:a"),
            router.partition_for(b"bar:{tag}:b")
        );
    }
}
