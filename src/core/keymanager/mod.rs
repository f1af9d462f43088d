//! The KeyManager: one actor per partition, tracking which keys it owns and
//! the type/expiry/mailbox state of each, plus that partition's slice of the
//! pub/sub registry. Everything the Router hands a partition passes through
//! here before (if at all) reaching a ValueNode.

mod entry;
mod manager;
mod pubsub;

pub use manager::{spawn, spawn_on, KeyManagerDeps};
