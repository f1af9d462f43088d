//! `NodeEntry` is everything a KeyManager partition remembers about a key
//! that isn't the value itself: its type, its owning actor's mailbox (absent
//! while passivated), and its expiry. Generation counters let stale timer
//! fires recognize themselves without a real cancellation handle.

use crate::core::command::{NodeType, Payload};
use tokio::sync::mpsc;

#[derive(Debug)]
pub struct NodeEntry {
    pub node_type: NodeType,
    pub handle: Option<mpsc::Sender<Payload>>,
    pub expires_at_ms: Option<i64>,
    pub expire_generation: u64,
}

impl NodeEntry {
    pub fn new(node_type: NodeType, handle: mpsc::Sender<Payload>) -> Self {
        NodeEntry {
            node_type,
            handle: Some(handle),
            expires_at_ms: None,
            expire_generation: 0,
        }
    }

    pub fn is_passivated(&self) -> bool {
        self.handle.is_none()
    }
}
