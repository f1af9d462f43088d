//! The KeyManager: one per partition, owning `db -> key -> NodeEntry` and
//! the partition's pub/sub registry. Every command the Router hands this
//! partition passes through here first; commands whose descriptor names a
//! value type are forwarded on (lazily materializing the owning ValueNode),
//! everything else (`DEL`, `EXPIRE`, `TYPE`, `RENAME`, pub/sub, `KEYS`, ...)
//! is served directly.

use super::entry::NodeEntry;
use super::pubsub::PubSubRegistry;
use crate::core::command::{lookup, CommandSpec, DefaultReply, NodeType, Payload};
use crate::core::glob::glob_match;
use crate::core::persistence::skeleton::{self, SkeletonEntry};
use crate::core::persistence::PersistenceHandle;
use crate::core::protocol::Reply;
use crate::core::router::Router;
use crate::core::valuenode::{self, now_ms, ActorDeps, NodeEvent, TtlAction, Value};
use crate::core::DbError;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct KeyManagerDeps {
    pub partition: usize,
    pub router: Arc<Router>,
    pub persistence: PersistenceHandle,
    pub sleep_after: Option<Duration>,
    pub data_dir: PathBuf,
}

/// Spawns the partition's task and returns the sender end of its mailbox.
pub fn spawn(deps: KeyManagerDeps) -> mpsc::Sender<Payload> {
    let (payload_tx, payload_rx) = mpsc::channel(1024);
    tokio::spawn(run(deps, payload_rx));
    payload_tx
}

/// Spawns the partition's task against a mailbox created ahead of time.
/// Building the full set of partition senders (to hand every partition a
/// `Router` that already knows about all of them, itself included) has to
/// happen before any partition task starts, so the channel can't be created
/// inside this function the way plain `spawn` does it.
pub fn spawn_on(deps: KeyManagerDeps, payload_rx: mpsc::Receiver<Payload>) {
    tokio::spawn(run(deps, payload_rx));
}

enum TimerFired {
    Expire { db: usize, key: Bytes, generation: u64 },
}

struct Manager {
    partition: usize,
    router: Arc<Router>,
    persistence: PersistenceHandle,
    sleep_after: Option<Duration>,
    data_dir: PathBuf,
    databases: HashMap<usize, HashMap<Bytes, NodeEntry>>,
    pubsub: PubSubRegistry,
    events_tx: mpsc::Sender<NodeEvent>,
    timer_tx: mpsc::Sender<TimerFired>,
}

async fn run(deps: KeyManagerDeps, mut payload_rx: mpsc::Receiver<Payload>) {
    let (events_tx, mut events_rx) = mpsc::channel::<NodeEvent>(1024);
    let (timer_tx, mut timer_rx) = mpsc::channel::<TimerFired>(1024);
    let mut manager = Manager {
        partition: deps.partition,
        router: deps.router,
        persistence: deps.persistence,
        sleep_after: deps.sleep_after,
        data_dir: deps.data_dir,
        databases: HashMap::new(),
        pubsub: PubSubRegistry::new(),
        events_tx,
        timer_tx,
    };
    manager.recover().await;
    info!(partition = manager.partition, "keymanager partition ready");

    loop {
        tokio::select! {
            received = payload_rx.recv() => {
                match received {
                    Some(payload) => manager.handle_payload(payload).await,
                    None => break,
                }
            }
            Some(event) = events_rx.recv() => manager.handle_node_event(event).await,
            Some(fired) = timer_rx.recv() => manager.handle_timer(fired).await,
        }
    }
    debug!(partition = manager.partition, "keymanager partition shutting down");
}

impl Manager {
    async fn recover(&mut self) {
        let entries = skeleton::load(&self.data_dir, self.partition).await;
        if entries.is_empty() {
            return;
        }
        info!(partition = self.partition, count = entries.len(), "replaying keymanager skeleton");
        for se in entries {
            let SkeletonEntry { db, key, node_type, expires_at_ms } = se;
            let mut entry = NodeEntry {
                node_type,
                handle: None,
                expires_at_ms,
                expire_generation: 0,
            };
            if self.sleep_after.is_none() {
                let initial = self.persistence.load(db, &key, node_type).await;
                entry.handle = Some(self.spawn_node(db, key.clone(), node_type, initial));
            }
            if let Some(at) = entry.expires_at_ms {
                self.arm_expiry_timer(db, key.clone(), at, entry.expire_generation);
            }
            self.databases.entry(db).or_default().insert(key, entry);
        }
    }

    fn spawn_node(&self, db: usize, key: Bytes, node_type: NodeType, initial: Option<Value>) -> mpsc::Sender<Payload> {
        let deps = ActorDeps {
            router: self.router.clone(),
            persistence: self.persistence.clone(),
            sleep_after: self.sleep_after,
            events_tx: self.events_tx.clone(),
        };
        valuenode::spawn(db, key, node_type, initial, deps)
    }

    fn build_skeleton(&self) -> Vec<SkeletonEntry> {
        self.databases
            .iter()
            .flat_map(|(&db, keys)| {
                keys.iter().map(move |(key, entry)| SkeletonEntry {
                    db,
                    key: key.clone(),
                    node_type: entry.node_type,
                    expires_at_ms: entry.expires_at_ms,
                })
            })
            .collect()
    }

    /// Fire-and-forget: the skeleton is small (identities, not values), so a
    /// plain write on every structural change is cheap enough not to need
    /// the debounce the value snapshots get.
    fn schedule_skeleton_save(&self) {
        let entries = self.build_skeleton();
        let data_dir = self.data_dir.clone();
        let partition = self.partition;
        tokio::spawn(async move {
            if let Err(e) = skeleton::save(&data_dir, partition, &entries).await {
                error!(partition, error = %e, "keymanager skeleton save failed");
            }
        });
    }

    fn arm_expiry_timer(&self, db: usize, key: Bytes, at_ms: i64, generation: u64) {
        let delay = Duration::from_millis((at_ms - now_ms()).max(0) as u64);
        let timer_tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timer_tx.send(TimerFired::Expire { db, key, generation }).await;
        });
    }

    /// Lazily evicts an expired entry (invariant 4: expired keys vanish
    /// before any user-visible command observes them). Returns whether a
    /// prune happened.
    fn prune_if_expired(&mut self, db: usize, key: &Bytes) -> bool {
        let now = now_ms();
        let expired = self
            .databases
            .get(&db)
            .and_then(|m| m.get(key))
            .and_then(|e| e.expires_at_ms)
            .is_some_and(|at| at <= now);
        if expired {
            self.databases.get_mut(&db).map(|m| m.remove(key));
            let persistence = self.persistence.clone();
            let dead_key = key.clone();
            tokio::spawn(async move { persistence.delete(db, &dead_key).await });
            self.schedule_skeleton_save();
            debug!(db, key = %String::from_utf8_lossy(key), "lazily expired key");
        }
        expired
    }

    async fn delete_entry(&mut self, db: usize, key: &Bytes) -> bool {
        let existed = self.databases.get_mut(&db).and_then(|m| m.remove(key)).is_some();
        if existed {
            self.persistence.delete(db, key).await;
            self.schedule_skeleton_save();
        }
        existed
    }

    /// Returns the live mailbox for (db, key), respawning it from its last
    /// snapshot if it had been passivated. The entry must already exist.
    async fn ensure_materialized(&mut self, db: usize, key: &Bytes) -> mpsc::Sender<Payload> {
        if let Some(handle) = self.databases.get(&db).and_then(|m| m.get(key)).and_then(|e| e.handle.clone()) {
            return handle;
        }
        let node_type = self.databases.get(&db).and_then(|m| m.get(key)).map(|e| e.node_type).expect("entry must exist");
        let initial = self.persistence.load(db, key, node_type).await;
        let handle = self.spawn_node(db, key.clone(), node_type, initial);
        if let Some(entry) = self.databases.get_mut(&db).and_then(|m| m.get_mut(key)) {
            entry.handle = Some(handle.clone());
        }
        handle
    }

    async fn partition_has_key(&self, partition: usize, db: usize, key: &Bytes) -> bool {
        if partition == self.partition {
            return self.databases.get(&db).map(|m| m.contains_key(key)).unwrap_or(false);
        }
        let (query, rx) = Payload::new(db, "_existskey", key.clone(), vec![]);
        if self.router.send_to(partition, query).await.is_err() {
            return false;
        }
        matches!(rx.await, Ok(Reply::Integer(1)))
    }

    async fn handle_payload(&mut self, payload: Payload) {
        if payload.command == "_existskey" {
            self.prune_if_expired(payload.db, &payload.key);
            let exists = self.databases.get(&payload.db).map(|m| m.contains_key(&payload.key)).unwrap_or(false);
            payload.reply(Reply::bool(exists));
            return;
        }

        let Some(spec) = lookup(&payload.command) else {
            let command = payload.command.clone();
            payload.reply(Reply::from(DbError::UnknownCommand(command)));
            return;
        };

        match spec.node_type {
            NodeType::Keys => self.handle_keys(payload).await,
            NodeType::Client | NodeType::Aggregate => {
                payload.reply(Reply::from(DbError::Generic(format!(
                    "'{}' cannot be served by a partition directly",
                    payload.command
                ))));
            }
            value_type => self.handle_value(spec, value_type, payload).await,
        }
    }

    async fn handle_value(&mut self, spec: &'static CommandSpec, node_type: NodeType, payload: Payload) {
        let db = payload.db;
        let key = payload.key.clone();
        self.prune_if_expired(db, &key);

        let existing_type = self.databases.get(&db).and_then(|m| m.get(&key)).map(|e| e.node_type);

        if payload.command == "setnx" && existing_type.is_some() {
            payload.reply(Reply::Integer(0));
            return;
        }

        if let Some(existing) = existing_type {
            if existing != node_type {
                if spec.overwrites {
                    self.delete_entry(db, &key).await;
                } else {
                    payload.reply(Reply::from(DbError::WrongType));
                    return;
                }
            }
        }

        let missing = self.databases.get(&db).and_then(|m| m.get(&key)).is_none();
        if missing {
            if spec.default != DefaultReply::Forward {
                let reply = default_reply(spec.default, &payload);
                payload.reply(reply);
                return;
            }
            let handle = self.spawn_node(db, key.clone(), node_type, None);
            self.databases.entry(db).or_default().insert(key.clone(), NodeEntry::new(node_type, handle));
            self.schedule_skeleton_save();
        }

        let handle = self.ensure_materialized(db, &key).await;
        if handle.send(payload).await.is_err() {
            warn!(db, key = %String::from_utf8_lossy(&key), "value node mailbox closed, dropping stale entry");
            self.databases.get_mut(&db).map(|m| m.remove(&key));
        }
    }

    async fn handle_keys(&mut self, payload: Payload) {
        match payload.command.as_str() {
            "_del" => self.cmd_del(payload).await,
            "exists" => self.cmd_exists(payload),
            "expire" => self.cmd_expire(payload, 1000, false).await,
            "pexpire" => self.cmd_expire(payload, 1, false).await,
            "expireat" => self.cmd_expire(payload, 1000, true).await,
            "pexpireat" => self.cmd_expire(payload, 1, true).await,
            "persist" => self.cmd_persist(payload),
            "ttl" => self.cmd_ttl(payload, 1000),
            "pttl" => self.cmd_ttl(payload, 1),
            "type" => self.cmd_type(payload),
            "rename" => self.cmd_rename(payload, false).await,
            "renamenx" => self.cmd_rename(payload, true).await,
            "publish" => self.cmd_publish(payload),
            "_subscribe" => self.cmd_subscribe(payload, false),
            "_unsubscribe" => self.cmd_unsubscribe(payload, false),
            "_psubscribe" => self.cmd_subscribe(payload, true),
            "_punsubscribe" => self.cmd_unsubscribe(payload, true),
            "_keys" => self.cmd_keys(payload),
            "_randomkey" => self.cmd_randomkey(payload),
            "_dbsize" => self.cmd_dbsize(payload),
            "_flushdb" => self.cmd_flushdb(payload).await,
            "_flushall" => self.cmd_flushall(payload).await,
            "_channels" => self.cmd_channels(payload),
            "_numsub" => self.cmd_numsub(payload),
            "_numpat" => self.cmd_numpat(payload),
            other => payload.reply(Reply::from(DbError::UnknownCommand(other.to_string()))),
        }
    }

    async fn cmd_del(&mut self, payload: Payload) {
        let db = payload.db;
        let key = payload.key.clone();
        self.prune_if_expired(db, &key);
        let existed = self.delete_entry(db, &key).await;
        payload.reply(Reply::bool(existed));
    }

    fn cmd_exists(&mut self, payload: Payload) {
        let db = payload.db;
        let keys: Vec<Bytes> = std::iter::once(payload.key.clone()).chain(payload.args.iter().skip(1).cloned()).collect();
        let mut count = 0i64;
        for key in &keys {
            self.prune_if_expired(db, key);
            if self.databases.get(&db).map(|m| m.contains_key(key)).unwrap_or(false) {
                count += 1;
            }
        }
        payload.reply(Reply::Integer(count));
    }

    async fn cmd_expire(&mut self, payload: Payload, unit_ms: i64, absolute: bool) {
        let db = payload.db;
        let key = payload.key.clone();
        self.prune_if_expired(db, &key);
        if self.databases.get(&db).map(|m| m.contains_key(&key)).unwrap_or(false) == false {
            payload.reply(Reply::Integer(0));
            return;
        }
        let amount = match payload.args.get(1).and_then(|b| std::str::from_utf8(b).ok()).and_then(|s| s.parse::<i64>().ok()) {
            Some(n) => n,
            None => {
                payload.reply(Reply::from(DbError::NotAnInteger));
                return;
            }
        };
        let at = if absolute { amount.saturating_mul(unit_ms) } else { now_ms().saturating_add(amount.saturating_mul(unit_ms)) };
        if at <= now_ms() {
            self.delete_entry(db, &key).await;
            payload.reply(Reply::Integer(1));
            return;
        }
        let generation = {
            let entry = self.databases.get_mut(&db).and_then(|m| m.get_mut(&key)).expect("existence checked above");
            entry.expires_at_ms = Some(at);
            entry.expire_generation += 1;
            entry.expire_generation
        };
        self.arm_expiry_timer(db, key.clone(), at, generation);
        self.schedule_skeleton_save();
        payload.reply(Reply::Integer(1));
    }

    fn cmd_persist(&mut self, payload: Payload) {
        let db = payload.db;
        let key = payload.key.clone();
        self.prune_if_expired(db, &key);
        let had_ttl = match self.databases.get_mut(&db).and_then(|m| m.get_mut(&key)) {
            Some(entry) if entry.expires_at_ms.is_some() => {
                entry.expires_at_ms = None;
                entry.expire_generation += 1;
                true
            }
            _ => false,
        };
        if had_ttl {
            self.schedule_skeleton_save();
        }
        payload.reply(Reply::bool(had_ttl));
    }

    fn cmd_ttl(&mut self, payload: Payload, unit_ms: i64) {
        let db = payload.db;
        let key = payload.key.clone();
        self.prune_if_expired(db, &key);
        let reply = match self.databases.get(&db).and_then(|m| m.get(&key)) {
            None => Reply::Integer(-2),
            Some(entry) => match entry.expires_at_ms {
                None => Reply::Integer(-1),
                Some(at) => {
                    let remaining = (at - now_ms()).max(0);
                    Reply::Integer((remaining + unit_ms - 1) / unit_ms)
                }
            },
        };
        payload.reply(reply);
    }

    fn cmd_type(&mut self, payload: Payload) {
        let db = payload.db;
        let key = payload.key.clone();
        self.prune_if_expired(db, &key);
        let reply = match self.databases.get(&db).and_then(|m| m.get(&key)) {
            Some(entry) => Reply::Simple(entry.node_type.type_name().to_string()),
            None => Reply::Simple("none".to_string()),
        };
        payload.reply(reply);
    }

    async fn cmd_rename(&mut self, payload: Payload, nx: bool) {
        let db = payload.db;
        let key = payload.key.clone();
        self.prune_if_expired(db, &key);
        if !self.databases.get(&db).map(|m| m.contains_key(&key)).unwrap_or(false) {
            payload.reply(Reply::from(DbError::NoSuchKey));
            return;
        }
        let Some(dest) = payload.args.get(1).cloned() else {
            payload.reply(Reply::from(DbError::SyntaxError));
            return;
        };
        if dest == key {
            payload.reply(Reply::ok());
            return;
        }
        if nx {
            let dest_partition = self.router.partition_for(&dest);
            if self.partition_has_key(dest_partition, db, &dest).await {
                payload.reply(Reply::Integer(0));
                return;
            }
        }

        let handle = self.ensure_materialized(db, &key).await;
        let Payload { db, key: source_key, reply_to, .. } = payload;
        let rewritten = Payload {
            db,
            command: "_rename".to_string(),
            key: source_key,
            args: vec![dest],
            reply_to,
            pubsub: None,
        };
        if handle.send(rewritten).await.is_err() {
            warn!(db, "rename target mailbox closed before relay could be delivered");
        }
        self.databases.get_mut(&db).map(|m| m.remove(&key));
        self.schedule_skeleton_save();
    }

    fn cmd_publish(&mut self, payload: Payload) {
        let channel = payload.key.clone();
        let message = payload.args.get(1).cloned().unwrap_or_default();
        let count = self.pubsub.publish(&channel, message);
        payload.reply(Reply::Integer(count as i64));
    }

    fn cmd_subscribe(&mut self, payload: Payload, pattern: bool) {
        let target = payload.key.clone();
        let Some(sub) = payload.pubsub.clone() else {
            payload.reply(Reply::from(DbError::Generic("subscribe payload missing subscription handle".into())));
            return;
        };
        let Some(push) = sub.push else {
            payload.reply(Reply::from(DbError::Generic("subscribe payload missing push handle".into())));
            return;
        };
        if pattern {
            self.pubsub.psubscribe(target, sub.subscriber_id, push);
        } else {
            self.pubsub.subscribe(target, sub.subscriber_id, push);
        }
        payload.reply(Reply::ok());
    }

    fn cmd_unsubscribe(&mut self, payload: Payload, pattern: bool) {
        let target = payload.key.clone();
        if let Some(id) = payload.pubsub.as_ref().map(|s| s.subscriber_id) {
            if pattern {
                self.pubsub.punsubscribe(&target, id);
            } else {
                self.pubsub.unsubscribe(&target, id);
            }
        }
        payload.reply(Reply::ok());
    }

    fn cmd_keys(&mut self, payload: Payload) {
        let db = payload.db;
        let Some(pattern) = payload.args.first().cloned() else {
            payload.reply(Reply::Array(Vec::new()));
            return;
        };
        let now = now_ms();
        let names: Vec<Bytes> = self
            .databases
            .get(&db)
            .map(|m| {
                m.iter()
                    .filter(|(_, e)| e.expires_at_ms.map(|at| at > now).unwrap_or(true))
                    .filter(|(k, _)| glob_match(&pattern, k))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();
        payload.reply(Reply::array_of_bulk(names));
    }

    fn cmd_randomkey(&mut self, payload: Payload) {
        let db = payload.db;
        let now = now_ms();
        let candidate = self.databases.get(&db).and_then(|m| {
            let live: Vec<&Bytes> = m.iter().filter(|(_, e)| e.expires_at_ms.map(|at| at > now).unwrap_or(true)).map(|(k, _)| k).collect();
            if live.is_empty() {
                None
            } else {
                Some(live[rand::random::<usize>() % live.len()].clone())
            }
        });
        payload.reply(match candidate {
            Some(k) => Reply::bulk(k),
            None => Reply::Nil,
        });
    }

    fn cmd_dbsize(&mut self, payload: Payload) {
        let db = payload.db;
        let now = now_ms();
        let count = self
            .databases
            .get(&db)
            .map(|m| m.values().filter(|e| e.expires_at_ms.map(|at| at > now).unwrap_or(true)).count())
            .unwrap_or(0);
        payload.reply(Reply::Integer(count as i64));
    }

    async fn cmd_flushdb(&mut self, payload: Payload) {
        let db = payload.db;
        if let Some(keys) = self.databases.remove(&db) {
            for key in keys.keys() {
                self.persistence.delete(db, key).await;
            }
        }
        self.schedule_skeleton_save();
        payload.reply(Reply::ok());
    }

    async fn cmd_flushall(&mut self, payload: Payload) {
        let all: Vec<(usize, Bytes)> = self.databases.iter().flat_map(|(&db, m)| m.keys().cloned().map(move |k| (db, k))).collect();
        self.databases.clear();
        for (db, key) in all {
            self.persistence.delete(db, &key).await;
        }
        self.schedule_skeleton_save();
        payload.reply(Reply::ok());
    }

    fn cmd_channels(&mut self, payload: Payload) {
        let pattern = payload.args.first().cloned();
        let names = self.pubsub.channel_names(pattern.as_deref());
        payload.reply(Reply::array_of_bulk(names));
    }

    fn cmd_numsub(&mut self, payload: Payload) {
        let mut out = Vec::with_capacity(payload.args.len() * 2);
        for channel in &payload.args {
            out.push(Reply::bulk(channel.clone()));
            out.push(Reply::Integer(self.pubsub.channel_subscriber_count(channel) as i64));
        }
        payload.reply(Reply::Array(out));
    }

    fn cmd_numpat(&mut self, payload: Payload) {
        payload.reply(Reply::Integer(self.pubsub.pattern_count() as i64));
    }

    async fn handle_node_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Idle { db, key } => {
                if let Some(entry) = self.databases.get_mut(&db).and_then(|m| m.get_mut(&key)) {
                    entry.handle = None;
                }
            }
            NodeEvent::Deleted { db, key } => {
                if self.databases.get_mut(&db).and_then(|m| m.remove(&key)).is_some() {
                    self.schedule_skeleton_save();
                }
                self.persistence.delete(db, &key).await;
            }
            NodeEvent::TtlChanged { db, key, ttl } => {
                let mut changed = false;
                if let Some(entry) = self.databases.get_mut(&db).and_then(|m| m.get_mut(&key)) {
                    match ttl {
                        TtlAction::Keep => {}
                        TtlAction::Clear => {
                            entry.expires_at_ms = None;
                            entry.expire_generation += 1;
                            changed = true;
                        }
                        TtlAction::SetAt(at) => {
                            entry.expires_at_ms = Some(at);
                            entry.expire_generation += 1;
                            changed = true;
                        }
                    }
                }
                if changed {
                    let generation = self.databases.get(&db).and_then(|m| m.get(&key)).map(|e| e.expire_generation).unwrap_or(0);
                    if let TtlAction::SetAt(at) = ttl {
                        self.arm_expiry_timer(db, key.clone(), at, generation);
                    }
                    self.schedule_skeleton_save();
                }
            }
        }
    }

    async fn handle_timer(&mut self, fired: TimerFired) {
        let TimerFired::Expire { db, key, generation } = fired;
        let current = self.databases.get(&db).and_then(|m| m.get(&key)).map(|e| e.expire_generation);
        if current != Some(generation) {
            return;
        }
        self.delete_entry(db, &key).await;
    }
}

fn default_reply(default: DefaultReply, payload: &Payload) -> Reply {
    match default {
        DefaultReply::Empty => Reply::bulk(Bytes::new()),
        DefaultReply::Ok => Reply::ok(),
        DefaultReply::Nil => Reply::Nil,
        DefaultReply::Zero => Reply::Integer(0),
        DefaultReply::NegOne => Reply::Integer(-1),
        DefaultReply::NegTwo => Reply::Integer(-2),
        DefaultReply::EmptySeq => Reply::Array(Vec::new()),
        DefaultReply::Nils => Reply::Array(vec![Reply::Nil; payload.args.len().saturating_sub(1)]),
        DefaultReply::Zeros => Reply::Array(vec![Reply::Integer(0); payload.args.len().saturating_sub(1)]),
        DefaultReply::ScanEmpty => Reply::Array(vec![Reply::bulk(Bytes::from_static(b"0")), Reply::Array(Vec::new())]),
        DefaultReply::NoneType => Reply::Simple("none".to_string()),
        DefaultReply::Error => Reply::from(DbError::NoSuchKey),
        DefaultReply::Forward => unreachable!("forward has no default reply"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::NodeType as NT;
    use tempfile::tempdir;

    fn test_deps(partition: usize, data_dir: PathBuf) -> KeyManagerDeps {
        let (tx, _rx) = mpsc::channel(8);
        KeyManagerDeps {
            partition,
            router: Arc::new(Router::new(vec![tx])),
            persistence: PersistenceHandle::new(data_dir, crate::core::persistence::PersistenceMode::Sync),
            sleep_after: None,
            data_dir: PathBuf::new(),
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trips_through_a_partition() {
        let dir = tempdir().unwrap();
        let mut deps = test_deps(0, dir.path().to_path_buf());
        deps.data_dir = dir.path().to_path_buf();
        let tx = spawn(deps);

        let (set_payload, set_rx) = Payload::new(0, "set", Bytes::from("k"), vec![Bytes::new(), Bytes::from("v")]);
        tx.send(set_payload).await.unwrap();
        assert_eq!(set_rx.await.unwrap(), Reply::ok());

        let (get_payload, get_rx) = Payload::new(0, "get", Bytes::from("k"), vec![Bytes::new()]);
        tx.send(get_payload).await.unwrap();
        assert_eq!(get_rx.await.unwrap(), Reply::Bulk(Bytes::from("v")));
    }

    #[tokio::test]
    async fn wrongtype_is_rejected_without_overwrite() {
        let dir = tempdir().unwrap();
        let mut deps = test_deps(0, dir.path().to_path_buf());
        deps.data_dir = dir.path().to_path_buf();
        let tx = spawn(deps);

        let (set_payload, set_rx) = Payload::new(0, "set", Bytes::from("k"), vec![Bytes::new(), Bytes::from("v")]);
        tx.send(set_payload).await.unwrap();
        set_rx.await.unwrap();

        let (hset_payload, hset_rx) = Payload::new(0, "hset", Bytes::from("k"), vec![Bytes::new(), Bytes::from("f"), Bytes::from("v")]);
        tx.send(hset_payload).await.unwrap();
        assert_eq!(hset_rx.await.unwrap(), Reply::Error(DbError::WrongType));
    }

    #[tokio::test]
    async fn missing_key_returns_descriptor_default() {
        let dir = tempdir().unwrap();
        let mut deps = test_deps(0, dir.path().to_path_buf());
        deps.data_dir = dir.path().to_path_buf();
        let tx = spawn(deps);

        let (get_payload, get_rx) = Payload::new(0, "get", Bytes::from("missing"), vec![Bytes::new()]);
        tx.send(get_payload).await.unwrap();
        assert_eq!(get_rx.await.unwrap(), Reply::Nil);
    }

    #[test]
    fn node_type_matches_string_family() {
        assert_eq!(NT::String.type_name(), "string");
    }
}
