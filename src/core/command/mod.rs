//! Command metadata: the descriptor table every incoming command is checked
//! against before it is routed, plus the `Payload` message shape used for
//! everything that travels past the ClientSession.

mod payload;
mod pubsub;
mod spec;

pub use payload::{Payload, PubSubSubscription};
pub use pubsub::PubSubPush;
pub use spec::{lookup, ArgsSpec, CommandSpec, DefaultReply, NodeType};
