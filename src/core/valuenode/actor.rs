//! The ValueNode actor: one `tokio::task` per materialized key, owning a
//! single typed value and serializing every mutation through its mailbox.

use super::outcome::{ExecOutcome, TtlAction};
use super::value::Value;
use super::{bitmap, hash, hllcmd, list, set, string, zset};
use crate::core::command::{NodeType, Payload};
use crate::core::persistence::PersistenceHandle;
use crate::core::protocol::Reply;
use crate::core::router::Router;
use crate::core::DbError;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant as TokioInstant;
use tracing::{debug, trace, warn};

/// What a ValueNode reports back to its owning KeyManager. The KeyManager
/// never touches a key's value directly; everything it needs to know about
/// a key's lifecycle comes through this channel.
#[derive(Debug)]
pub enum NodeEvent {
    /// The actor's mailbox sat empty past `sleep-after`; its last write is
    /// flushed to disk and the task is exiting. The KeyManager should drop
    /// its handle but keep the `NodeEntry` (type + expiry) for lazy replay.
    Idle { db: usize, key: Bytes },
    /// The key was deleted (explicit `DEL`, emptied collection, or replaced
    /// by a `RENAME` target write). The KeyManager should drop the entry
    /// entirely.
    Deleted { db: usize, key: Bytes },
    /// A command changed (or should change) this key's expiry; only the
    /// KeyManager holds expiry state, so the actor reports the desired
    /// action rather than applying it itself.
    TtlChanged { db: usize, key: Bytes, ttl: TtlAction },
}

pub struct ActorDeps {
    pub router: Arc<Router>,
    pub persistence: PersistenceHandle,
    pub sleep_after: Option<Duration>,
    pub events_tx: mpsc::Sender<NodeEvent>,
}

/// Spawns the actor and returns the sender end of its mailbox. `initial`, if
/// present, is the value replayed from the last snapshot.
pub fn spawn(
    db: usize,
    key: Bytes,
    node_type: NodeType,
    initial: Option<Value>,
    deps: ActorDeps,
) -> mpsc::Sender<Payload> {
    let (tx, rx) = mpsc::channel(64);
    let value = initial.or_else(|| Value::empty_for(node_type)).expect("node_type always has an empty value");
    tokio::spawn(run(db, key, value, rx, deps));
    tx
}

async fn run(db: usize, key: Bytes, mut value: Value, mut rx: mpsc::Receiver<Payload>, deps: ActorDeps) {
    let ActorDeps {
        router,
        persistence,
        sleep_after,
        events_tx,
    } = deps;
    let mut dirty = false;
    let mut blocked: VecDeque<BlockedPop> = VecDeque::new();

    loop {
        let idle_deadline = sleep_after.filter(|_| blocked.is_empty()).map(|d| TokioInstant::now() + d);
        let block_deadline = earliest_deadline(&blocked);

        let next = tokio::select! {
            msg = rx.recv() => Some(msg),
            _ = tokio::time::sleep_until(idle_deadline.unwrap_or_else(TokioInstant::now)), if idle_deadline.is_some() => {
                if dirty {
                    persistence.save(db, &key, &value).await;
                }
                let _ = events_tx.send(NodeEvent::Idle { db, key: key.clone() }).await;
                debug!(%db, key = %String::from_utf8_lossy(&key), "value node passivated");
                return;
            }
            _ = tokio::time::sleep_until(block_deadline.unwrap_or_else(TokioInstant::now)), if block_deadline.is_some() => {
                expire_blocked(&mut blocked).await;
                None
            }
        };

        let Some(next) = next else {
            continue;
        };
        let Some(payload) = next else {
            // Mailbox closed: the owning KeyManager is gone (shutdown).
            return;
        };

        trace!(command = %payload.command, key = %String::from_utf8_lossy(&payload.key), "value node executing");

        if payload.command == "_rename" {
            handle_rename(db, &key, &mut value, payload, &router, &events_tx).await;
            return;
        }

        if matches!(payload.command.as_str(), "blpop" | "brpop" | "brpoplpush" | "rpoplpush") {
            handle_list_pop(db, &key, &mut value, payload, &mut blocked, &router, &events_tx, &persistence, &mut dirty).await;
            continue;
        }

        let is_smove = payload.command == "smove";
        let is_push = matches!(payload.command.as_str(), "lpush" | "rpush" | "lpushx" | "rpushx" | "_lstore");
        let result = dispatch(&payload.command, &mut value, &payload.args);

        if is_smove {
            if let Ok((outcome, _)) = &result {
                if outcome.reply == Reply::Integer(1) {
                    relay_smove(db, &payload.args, &router).await;
                }
            }
        }

        let should_stop = apply_outcome(result, &mut value, payload, db, &key, &events_tx, &persistence, &mut dirty).await;
        if should_stop {
            return;
        }

        if is_push {
            drain_blocked(db, &key, &mut value, &mut blocked, &router, &events_tx, &persistence, &mut dirty).await;
        }
    }
}

/// A client pop request that couldn't be satisfied immediately, waiting for
/// either a push that grows the list or its own deadline.
struct BlockedPop {
    payload: Payload,
    kind: BlockKind,
    deadline: Option<TokioInstant>,
}

enum BlockKind {
    Left,
    Right,
    RPopLPush { dest: Bytes },
}

fn earliest_deadline(blocked: &VecDeque<BlockedPop>) -> Option<TokioInstant> {
    blocked.iter().filter_map(|b| b.deadline).min()
}

/// Pops one element per `kind`'s direction. `Err(WrongType)` if the key holds
/// something other than a list; `Ok(None)` if the list is empty.
fn pop_one(value: &mut Value, kind: &BlockKind) -> Result<Option<Bytes>, DbError> {
    let list = match value {
        Value::List(l) => l,
        _ => return Err(DbError::WrongType),
    };
    Ok(match kind {
        BlockKind::Left => list.pop_front(),
        BlockKind::Right | BlockKind::RPopLPush { .. } => list.pop_back(),
    })
}

/// `BLPOP`/`BRPOP`/`BRPOPLPUSH`/`RPOPLPUSH`: pop immediately if an element is
/// available, otherwise (for the blocking variants) enqueue the request with
/// its deadline. `RPOPLPUSH` never blocks: an empty source replies nil.
async fn handle_list_pop(
    db: usize,
    key: &Bytes,
    value: &mut Value,
    payload: Payload,
    blocked: &mut VecDeque<BlockedPop>,
    router: &Arc<Router>,
    events_tx: &mpsc::Sender<NodeEvent>,
    persistence: &PersistenceHandle,
    dirty: &mut bool,
) {
    let can_block = payload.command != "rpoplpush";
    let kind = match payload.command.as_str() {
        "blpop" => BlockKind::Left,
        "brpop" => BlockKind::Right,
        "brpoplpush" | "rpoplpush" => {
            let Some(dest) = payload.args.get(1).cloned() else {
                payload.reply(Reply::from(DbError::SyntaxError));
                return;
            };
            BlockKind::RPopLPush { dest }
        }
        _ => unreachable!("only called for list pop commands"),
    };

    match pop_one(value, &kind) {
        Err(e) => payload.reply(Reply::from(e)),
        Ok(Some(item)) => complete_pop(db, key, value, payload, &kind, item, router, events_tx, persistence, dirty).await,
        Ok(None) if !can_block => payload.reply(Reply::Nil),
        Ok(None) => {
            let timeout_index = if matches!(kind, BlockKind::RPopLPush { .. }) { 2 } else { 1 };
            match parse_deadline(payload.args.get(timeout_index)) {
                Ok(deadline) => blocked.push_back(BlockedPop { payload, kind, deadline }),
                Err(e) => payload.reply(Reply::from(e)),
            }
        }
    }
}

/// Replies to (and drops) every blocked request whose deadline has passed.
async fn expire_blocked(blocked: &mut VecDeque<BlockedPop>) {
    let now = TokioInstant::now();
    let mut remaining = VecDeque::with_capacity(blocked.len());
    for entry in blocked.drain(..) {
        match entry.deadline {
            Some(d) if d <= now => {
                let reply = match entry.kind {
                    BlockKind::Left | BlockKind::Right => Reply::NilArray,
                    BlockKind::RPopLPush { .. } => Reply::Nil,
                };
                entry.payload.reply(reply);
            }
            _ => remaining.push_back(entry),
        }
    }
    *blocked = remaining;
}

/// After a push grows the list, replays blocked requests FIFO for as long as
/// elements remain.
async fn drain_blocked(
    db: usize,
    key: &Bytes,
    value: &mut Value,
    blocked: &mut VecDeque<BlockedPop>,
    router: &Arc<Router>,
    events_tx: &mpsc::Sender<NodeEvent>,
    persistence: &PersistenceHandle,
    dirty: &mut bool,
) {
    while !value.is_empty() {
        let Some(entry) = blocked.pop_front() else { break };
        match pop_one(value, &entry.kind) {
            Ok(Some(item)) => complete_pop(db, key, value, entry.payload, &entry.kind, item, router, events_tx, persistence, dirty).await,
            Ok(None) => break,
            Err(e) => entry.payload.reply(Reply::from(e)),
        }
    }
}

/// Finishes a successful pop: for `RPOPLPUSH`/`BRPOPLPUSH`, routes the popped
/// element onward as an `RPUSH` to the destination key; schedules a snapshot;
/// reports deletion if the list emptied; and replies to the original caller.
async fn complete_pop(
    db: usize,
    key: &Bytes,
    value: &mut Value,
    payload: Payload,
    kind: &BlockKind,
    item: Bytes,
    router: &Arc<Router>,
    events_tx: &mpsc::Sender<NodeEvent>,
    persistence: &PersistenceHandle,
    dirty: &mut bool,
) {
    *dirty = true;
    persistence.schedule_save(db, key.clone(), value.clone());

    if let BlockKind::RPopLPush { dest } = kind {
        let (push_payload, push_rx) = Payload::new(db, "rpush", dest.clone(), vec![Bytes::new(), item.clone()]);
        let partition = router.partition_for(dest);
        if router.send_to(partition, push_payload).await.is_ok() {
            let _ = push_rx.await;
        }
    }

    if value.is_empty() {
        persistence.delete(db, key).await;
        let _ = events_tx.send(NodeEvent::Deleted { db, key: key.clone() }).await;
    }

    let reply = match kind {
        BlockKind::Left | BlockKind::Right => Reply::Array(vec![Reply::Bulk(key.clone()), Reply::Bulk(item)]),
        BlockKind::RPopLPush { .. } => Reply::Bulk(item),
    };
    payload.reply(reply);
}

fn parse_deadline(arg: Option<&Bytes>) -> Result<Option<TokioInstant>, DbError> {
    let arg = arg.ok_or(DbError::SyntaxError)?;
    let seconds: f64 = std::str::from_utf8(arg).map_err(|_| DbError::NotAFloat)?.parse().map_err(|_| DbError::NotAFloat)?;
    if seconds < 0.0 {
        return Err(DbError::Generic("timeout is negative".to_string()));
    }
    if seconds == 0.0 {
        // Per real Redis (and the open question this resolves): 0 means wait
        // forever, not "expire immediately".
        Ok(None)
    } else {
        Ok(Some(TokioInstant::now() + Duration::from_secs_f64(seconds)))
    }
}

/// Applies a dispatch result to the actor's state: installs a replacement
/// value, schedules a snapshot on mutation, forwards TTL changes to the
/// KeyManager, replies to the caller, and tells the caller whether the actor
/// should stop (the key was deleted).
async fn apply_outcome(
    result: Result<(ExecOutcome, Option<Value>), DbError>,
    value: &mut Value,
    payload: Payload,
    db: usize,
    key: &Bytes,
    events_tx: &mpsc::Sender<NodeEvent>,
    persistence: &PersistenceHandle,
    dirty: &mut bool,
) -> bool {
    match result {
        Ok((outcome, replacement)) => {
            if let Some(new_value) = replacement {
                *value = new_value;
            }
            if !matches!(outcome.ttl, TtlAction::Keep) {
                let _ = events_tx
                    .send(NodeEvent::TtlChanged {
                        db,
                        key: key.clone(),
                        ttl: outcome.ttl,
                    })
                    .await;
            }
            if outcome.mutated {
                *dirty = true;
                persistence.schedule_save(db, key.clone(), value.clone());
            }
            if outcome.delete {
                persistence.delete(db, key).await;
                let _ = events_tx.send(NodeEvent::Deleted { db, key: key.clone() }).await;
                payload.reply(outcome.reply);
                return true;
            }
            payload.reply(outcome.reply);
            false
        }
        Err(e) => {
            warn!(command = %payload.command, error = %e, "value node command failed");
            payload.reply(Reply::from(e));
            false
        }
    }
}

/// `SMOVE source destination member`: after removing the member from this
/// (source) set, routes the matching `SADD` to the destination key.
async fn relay_smove(db: usize, args: &[Bytes], router: &Arc<Router>) {
    if args.len() != 3 {
        return;
    }
    let dest = args[1].clone();
    let member = args[2].clone();
    let (sadd_payload, sadd_rx) = Payload::new(db, "sadd", dest.clone(), vec![Bytes::new(), member]);
    let partition = router.partition_for(&dest);
    if router.send_to(partition, sadd_payload).await.is_ok() {
        let _ = sadd_rx.await;
    }
}

/// Dispatches a single command against the owned value. Returns the outcome
/// plus an optional replacement value for handlers that construct a brand
/// new one (`SET`, the `_*STORE` family, `SETNX`/`GETSET`).
fn dispatch(command: &str, value: &mut Value, args: &[Bytes]) -> Result<(ExecOutcome, Option<Value>), DbError> {
    match command {
        "get" => string::get(Some(value)).map(|o| (o, None)),
        "set" => string::set(Some(value), args),
        "setnx" => string::setnx(Some(value), args),
        "setex" | "psetex" => string_setex(command, args),
        "getset" => string::getset(Some(value), args),
        "append" => string::append(value, args).map(|o| (o, None)),
        "getrange" => string::getrange(Some(value), args).map(|o| (o, None)),
        "setrange" => string::setrange(value, args).map(|o| (o, None)),
        "strlen" => string::strlen(Some(value)).map(|o| (o, None)),
        "incr" => string::incr_by(value, 1).map(|o| (o, None)),
        "decr" => string::incr_by(value, -1).map(|o| (o, None)),
        "incrby" => string::incr_by(value, parse_i64(args.get(1))?).map(|o| (o, None)),
        "decrby" => string::incr_by(value, -parse_i64(args.get(1))?).map(|o| (o, None)),
        "incrbyfloat" => string::incr_by_float(value, parse_f64(args.get(1))?).map(|o| (o, None)),

        "setbit" => bitmap::setbit(value, args).map(|o| (o, None)),
        "getbit" => bitmap::getbit(Some(value), args).map(|o| (o, None)),
        "bitcount" => bitmap::bitcount(Some(value), args).map(|o| (o, None)),
        "bitpos" => bitmap::bitpos(Some(value), args).map(|o| (o, None)),
        "_bget" => bitmap::bget(Some(value)).map(|o| (o, None)),
        "_bstore" => bitmap::bstore(args).map(|(o, v)| (o, Some(v))),

        "pfadd" => hllcmd::pfadd(value, args).map(|o| (o, None)),
        "_pfcount" => hllcmd::pfcount(Some(value)).map(|o| (o, None)),
        "_pfget" => hllcmd::pfget(Some(value)).map(|o| (o, None)),
        "_pfstore" => hllcmd::pfstore(args).map(|(o, v)| (o, Some(v))),

        "hset" => hash::hset(value, args).map(|o| (o, None)),
        "hmset" => hash_hmset(value, args),
        "hsetnx" => hash::hsetnx(value, args).map(|o| (o, None)),
        "hget" => hash::hget(Some(value), args).map(|o| (o, None)),
        "hmget" => hash::hmget(Some(value), args).map(|o| (o, None)),
        "hgetall" => hash::hgetall(Some(value)).map(|o| (o, None)),
        "hdel" => hash::hdel(value, args).map(|o| (o, None)),
        "hkeys" => hash::hkeys(Some(value)).map(|o| (o, None)),
        "hvals" => hash::hvals(Some(value)).map(|o| (o, None)),
        "hlen" => hash::hlen(Some(value)).map(|o| (o, None)),
        "hexists" => hash::hexists(Some(value), args).map(|o| (o, None)),
        "hincrby" => hash::hincrby(value, args).map(|o| (o, None)),
        "hincrbyfloat" => hash::hincrbyfloat(value, args).map(|o| (o, None)),
        "hscan" => hash::hscan(Some(value)).map(|o| (o, None)),
        "_hstore" => hash::hstore(args).map(|(o, v)| (o, Some(v))),

        "lpush" => list::lpush(value, args).map(|o| (o, None)),
        "rpush" => list::rpush(value, args).map(|o| (o, None)),
        "lpushx" => list::lpush(value, args).map(|o| (o, None)),
        "rpushx" => list::rpush(value, args).map(|o| (o, None)),
        "lpop" => list::lpop(value, args).map(|o| (o, None)),
        "rpop" => list::rpop(value, args).map(|o| (o, None)),
        "llen" => list::llen(Some(value)).map(|o| (o, None)),
        "lrange" => list::lrange(Some(value), args).map(|o| (o, None)),
        "ltrim" => list::ltrim(value, args).map(|o| (o, None)),
        "lset" => list::lset(value, args).map(|o| (o, None)),
        "lindex" => list::lindex(Some(value), args).map(|o| (o, None)),
        "lrem" => list::lrem(value, args).map(|o| (o, None)),
        "linsert" => list::linsert(value, args).map(|o| (o, None)),
        "_lstore" => list::lstore(args).map(|(o, v)| (o, Some(v))),

        "sadd" => set::sadd(value, args).map(|o| (o, None)),
        "srem" => set::srem(value, args).map(|o| (o, None)),
        "scard" => set::scard(Some(value)).map(|o| (o, None)),
        "sismember" => set::sismember(Some(value), args).map(|o| (o, None)),
        "smembers" => set::smembers(Some(value)).map(|o| (o, None)),
        "srandmember" => set::srandmember(Some(value), args).map(|o| (o, None)),
        "spop" => set::spop(value, args).map(|o| (o, None)),
        "smove" => set::smove(value, args).map(|o| (o, None)),
        "_sget" => set::sget(Some(value)).map(|o| (o, None)),
        "sscan" => set::sscan(Some(value)).map(|o| (o, None)),
        "_sstore" => set::sstore(args).map(|(o, v)| (o, Some(v))),

        "zadd" => zset::zadd(value, args).map(|o| (o, None)),
        "zrem" => zset::zrem(value, args).map(|o| (o, None)),
        "zcard" => zset::zcard(Some(value)).map(|o| (o, None)),
        "zscore" => zset::zscore(Some(value), args).map(|o| (o, None)),
        "zincrby" => zset::zincrby(value, args).map(|o| (o, None)),
        "zrank" => zset::zrank(Some(value), args).map(|o| (o, None)),
        "zrevrank" => zset::zrevrank(Some(value), args).map(|o| (o, None)),
        "zrange" => zset::zrange(Some(value), args).map(|o| (o, None)),
        "zrevrange" => zset::zrevrange(Some(value), args).map(|o| (o, None)),
        "zrangebyscore" => zset::zrangebyscore(Some(value), args).map(|o| (o, None)),
        "zrevrangebyscore" => zset::zrevrangebyscore(Some(value), args).map(|o| (o, None)),
        "zrangebylex" => zset::zrangebylex(Some(value), args).map(|o| (o, None)),
        "zrevrangebylex" => zset::zrevrangebylex(Some(value), args).map(|o| (o, None)),
        "zcount" => zset::zcount(Some(value), args).map(|o| (o, None)),
        "zlexcount" => zset::zlexcount(Some(value), args).map(|o| (o, None)),
        "zremrangebyrank" => zset::zremrangebyrank(value, args).map(|o| (o, None)),
        "zremrangebyscore" => zset::zremrangebyscore(value, args).map(|o| (o, None)),
        "zremrangebylex" => zset::zremrangebylex(value, args).map(|o| (o, None)),
        "_zget" => zset::zget(Some(value)).map(|o| (o, None)),
        "_zstore" => zset::zstore(args).map(|(o, v)| (o, Some(v))),

        other => Err(DbError::UnknownCommand(other.to_string())),
    }
}

fn string_setex(command: &str, args: &[Bytes]) -> Result<(ExecOutcome, Option<Value>), DbError> {
    if args.len() != 3 {
        return Err(DbError::SyntaxError);
    }
    let amount: i64 = std::str::from_utf8(&args[1]).map_err(|_| DbError::NotAnInteger)?.parse().map_err(|_| DbError::NotAnInteger)?;
    let at = if command == "setex" {
        super::value::now_ms() + amount * 1000
    } else {
        super::value::now_ms() + amount
    };
    Ok((
        ExecOutcome {
            reply: Reply::ok(),
            mutated: true,
            delete: false,
            ttl: TtlAction::SetAt(at),
        },
        Some(Value::Str(args[2].clone())),
    ))
}

/// `HMSET` shares `HSET`'s field-setting logic but replies `+OK` rather than
/// the count of newly-added fields.
fn hash_hmset(value: &mut Value, args: &[Bytes]) -> Result<(ExecOutcome, Option<Value>), DbError> {
    let outcome = hash::hset(value, args)?;
    Ok((ExecOutcome { reply: Reply::ok(), ..outcome }, None))
}

fn parse_i64(arg: Option<&Bytes>) -> Result<i64, DbError> {
    let arg = arg.ok_or(DbError::SyntaxError)?;
    std::str::from_utf8(arg).map_err(|_| DbError::NotAnInteger)?.parse().map_err(|_| DbError::NotAnInteger)
}

fn parse_f64(arg: Option<&Bytes>) -> Result<f64, DbError> {
    let arg = arg.ok_or(DbError::SyntaxError)?;
    std::str::from_utf8(arg).map_err(|_| DbError::NotAFloat)?.parse().map_err(|_| DbError::NotAFloat)
}

/// `RENAME`/`RENAMENX`: this actor owns the source key. It builds the
/// appropriate `_*STORE` payload for its current value, routes it to the
/// destination, then deletes itself.
async fn handle_rename(
    db: usize,
    key: &Bytes,
    value: &mut Value,
    payload: Payload,
    router: &Arc<Router>,
    events_tx: &mpsc::Sender<NodeEvent>,
) {
    let Some(dest) = payload.args.first().cloned() else {
        payload.reply(Reply::from(DbError::SyntaxError));
        return;
    };
    let (store_command, store_args): (&str, Vec<Bytes>) = match value {
        Value::Str(b) => ("set", vec![dest.clone(), b.clone()]),
        Value::Bitmap(b) => ("_bstore", vec![Bytes::from(b.clone())]),
        Value::Hll(h) => ("_pfstore", vec![h.serialize()]),
        Value::Hash(m) => ("_hstore", m.iter().flat_map(|(k, v)| [k.clone(), v.clone()]).collect()),
        Value::List(l) => ("_lstore", l.iter().cloned().collect()),
        Value::Set(s) => ("_sstore", s.iter().cloned().collect()),
        Value::SortedSet(z) => (
            "_zstore",
            z.iter().flat_map(|e| [Bytes::from(e.score.to_string()), e.member.clone()]).collect(),
        ),
    };

    let (store_payload, store_rx) = Payload::new(db, store_command, dest.clone(), store_args);
    let partition = router.partition_for(&dest);
    if router.send_to(partition, store_payload).await.is_ok() {
        let _ = store_rx.await;
    }

    let _ = events_tx.send(NodeEvent::Deleted { db, key: key.clone() }).await;
    payload.reply(Reply::ok());
}
