//! Per-partition pub/sub registry. Channel subscriptions are local to the
//! partition that owns the channel name (itself hashed like any other key);
//! pattern subscriptions are broadcast to every partition by the
//! ClientSession, since any channel might match a pattern regardless of
//! which partition it hashes to.

use crate::core::command::PubSubPush;
use crate::core::glob::glob_match;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::mpsc;

#[derive(Debug, Default)]
pub struct PubSubRegistry {
    channels: HashMap<Bytes, HashMap<u64, mpsc::Sender<PubSubPush>>>,
    patterns: HashMap<Bytes, HashMap<u64, mpsc::Sender<PubSubPush>>>,
}

impl PubSubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, channel: Bytes, subscriber_id: u64, push: mpsc::Sender<PubSubPush>) {
        self.channels.entry(channel).or_default().insert(subscriber_id, push);
    }

    pub fn unsubscribe(&mut self, channel: &Bytes, subscriber_id: u64) {
        if let Some(subs) = self.channels.get_mut(channel) {
            subs.remove(&subscriber_id);
            if subs.is_empty() {
                self.channels.remove(channel);
            }
        }
    }

    pub fn psubscribe(&mut self, pattern: Bytes, subscriber_id: u64, push: mpsc::Sender<PubSubPush>) {
        self.patterns.entry(pattern).or_default().insert(subscriber_id, push);
    }

    pub fn punsubscribe(&mut self, pattern: &Bytes, subscriber_id: u64) {
        if let Some(subs) = self.patterns.get_mut(pattern) {
            subs.remove(&subscriber_id);
            if subs.is_empty() {
                self.patterns.remove(pattern);
            }
        }
    }

    /// Drops every subscription belonging to `subscriber_id`, channel and
    /// pattern alike. Called when a ClientSession disconnects.
    pub fn drop_subscriber(&mut self, subscriber_id: u64) {
        self.channels.retain(|_, subs| {
            subs.remove(&subscriber_id);
            !subs.is_empty()
        });
        self.patterns.retain(|_, subs| {
            subs.remove(&subscriber_id);
            !subs.is_empty()
        });
    }

    /// Delivers `payload` to direct subscribers of `channel` plus every
    /// pattern subscriber whose pattern matches it. Returns the number of
    /// deliveries attempted (Redis's `PUBLISH` reply), regardless of whether
    /// the subscriber's push channel is still open.
    pub fn publish(&self, channel: &Bytes, payload: Bytes) -> usize {
        let mut count = 0;
        if let Some(subs) = self.channels.get(channel) {
            for push in subs.values() {
                let _ = push.try_send(PubSubPush::Message {
                    channel: channel.clone(),
                    payload: payload.clone(),
                });
                count += 1;
            }
        }
        for (pattern, subs) in &self.patterns {
            if glob_match(pattern, channel) {
                for push in subs.values() {
                    let _ = push.try_send(PubSubPush::PMessage {
                        pattern: pattern.clone(),
                        channel: channel.clone(),
                        payload: payload.clone(),
                    });
                    count += 1;
                }
            }
        }
        count
    }

    pub fn channel_names(&self, pattern: Option<&[u8]>) -> Vec<Bytes> {
        self.channels
            .keys()
            .filter(|name| match pattern {
                Some(p) => glob_match(p, name),
                None => true,
            })
            .cloned()
            .collect()
    }

    pub fn channel_subscriber_count(&self, channel: &Bytes) -> usize {
        self.channels.get(channel).map_or(0, |s| s.len())
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_channel_and_pattern_subscribers() {
        let mut reg = PubSubRegistry::new();
        let (ctx, mut crx) = mpsc::channel(4);
        let (ptx, mut prx) = mpsc::channel(4);
        reg.subscribe(Bytes::from("news"), 1, ctx);
        reg.psubscribe(Bytes::from("news.*"), 2, ptx);

        let delivered = reg.publish(&Bytes::from("news"), Bytes::from("hi"));
        assert_eq!(delivered, 1);
        assert!(matches!(crx.try_recv(), Ok(PubSubPush::Message { .. })));
        assert!(prx.try_recv().is_err());
    }

    #[test]
    fn drop_subscriber_removes_empty_entries() {
        let mut reg = PubSubRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        reg.subscribe(Bytes::from("a"), 1, tx);
        reg.drop_subscriber(1);
        assert_eq!(reg.channel_subscriber_count(&Bytes::from("a")), 0);
    }
}
