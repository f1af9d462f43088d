//! State carried by a single client connection across commands: which
//! logical database it has SELECTed and which channels/patterns it has
//! subscribed to, so UNSUBSCRIBE-with-no-arguments and connection cleanup
//! both know what to tear down.

use bytes::Bytes;
use std::collections::HashSet;

#[derive(Debug)]
pub struct SessionState {
    pub db: usize,
    pub subscribed_channels: HashSet<Bytes>,
    pub subscribed_patterns: HashSet<Bytes>,
    pub quit: bool,
}

impl SessionState {
    pub fn new() -> Self {
        SessionState {
            db: 0,
            subscribed_channels: HashSet::new(),
            subscribed_patterns: HashSet::new(),
            quit: false,
        }
    }

    pub fn total_subscriptions(&self) -> usize {
        self.subscribed_channels.len() + self.subscribed_patterns.len()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
