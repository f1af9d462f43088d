//! The out-of-band message a KeyManager's pub/sub registry pushes to a
//! subscribed session, independent of that session's own command/reply
//! cycle. Lives alongside `Payload` since `PubSubSubscription` carries a
//! sender for this type through the same channel commands travel on.

use bytes::Bytes;

#[derive(Debug, Clone)]
pub enum PubSubPush {
    Message { channel: Bytes, payload: Bytes },
    PMessage { pattern: Bytes, channel: Bytes, payload: Bytes },
}
