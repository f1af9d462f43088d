//! `Payload` is the single message shape that flows from a ClientSession
//! through the Router to a KeyManager and onward to a ValueNode. Internal
//! pseudo-commands (the `_`-prefixed ones in the descriptor table) are built
//! and sent the same way, so dispatch logic never has to special-case them.

use crate::core::protocol::Reply;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

/// Whatever a `(p)subscribe`/`(p)unsubscribe` internal command needs besides
/// the usual (db, command, key, args): the subscribing session's identity
/// and, for the subscribe direction, the push handle the KeyManager should
/// register for later `PUBLISH` delivery. Unrelated to the wire-level
/// `PubSubPush` type's payload content, which lives with the registry.
#[derive(Debug, Clone)]
pub struct PubSubSubscription {
    pub subscriber_id: u64,
    pub push: Option<mpsc::Sender<super::PubSubPush>>,
}

/// One command, already resolved to a lowercase name and a target key,
/// travelling toward the ValueNode (or KeyManager) that owns it.
#[derive(Debug)]
pub struct Payload {
    pub db: usize,
    pub command: String,
    pub key: Bytes,
    pub args: Vec<Bytes>,
    pub reply_to: oneshot::Sender<Reply>,
    pub pubsub: Option<PubSubSubscription>,
}

impl Payload {
    pub fn new(db: usize, command: impl Into<String>, key: Bytes, args: Vec<Bytes>) -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (
            Payload {
                db,
                command: command.into(),
                key,
                args,
                reply_to: tx,
                pubsub: None,
            },
            rx,
        )
    }

    pub fn with_pubsub(mut self, sub: PubSubSubscription) -> Self {
        self.pubsub = Some(sub);
        self
    }

    /// Sends a reply, swallowing the error: a dropped receiver just means the
    /// caller stopped waiting (timed out, or the connection closed).
    pub fn reply(self, reply: Reply) {
        let _ = self.reply_to.send(reply);
    }
}
