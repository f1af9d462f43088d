//! Aggregators: one-shot scatter/gather tasks for commands that touch more
//! than one key. The ClientSession spawns one per multi-key command instead
//! of routing it to a single partition; the aggregator fans out unicast or
//! broadcast requests, reduces the replies, and answers the original
//! caller's `reply_to` exactly once.

use crate::core::command::Payload;
use crate::core::protocol::Reply;
use crate::core::router::Router;
use crate::core::valuenode::HyperLogLog;
use crate::core::DbError;
use bytes::Bytes;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

pub struct AggregatorDeps {
    pub router: Arc<Router>,
    pub timeout: Duration,
}

/// Spawns the fan-out task; the caller never awaits it directly, since the
/// reply reaches the original client through `payload.reply_to`.
pub fn spawn(payload: Payload, deps: AggregatorDeps) {
    tokio::spawn(run(payload, deps));
}

async fn run(payload: Payload, deps: AggregatorDeps) {
    let reply = match tokio::time::timeout(deps.timeout, dispatch(&payload, &deps.router)).await {
        Ok(reply) => reply,
        Err(_) => Reply::from(DbError::Timeout),
    };
    payload.reply(reply);
}

async fn dispatch(payload: &Payload, router: &Router) -> Reply {
    match payload.command.as_str() {
        "mget" => mget(payload, router).await,
        "mset" => mset(payload, router).await,
        "msetnx" => msetnx(payload, router).await,
        "del" => del(payload, router).await,
        "sdiff" | "sinter" | "sunion" => set_op(payload, router).await,
        "sdiffstore" | "sinterstore" | "sunionstore" => set_op_store(payload, router).await,
        "zunionstore" | "zinterstore" => zset_op_store(payload, router).await,
        "bitop" => bitop(payload, router).await,
        "pfcount" => pfcount(payload, router).await,
        "pfmerge" => pfmerge(payload, router).await,
        "keys" => keys_cmd(payload, router).await,
        "scan" => scan_cmd(payload, router).await,
        "dbsize" => dbsize_cmd(payload, router).await,
        "randomkey" => randomkey_cmd(payload, router).await,
        "flushdb" => flush_cmd(payload, router, "_flushdb").await,
        "flushall" => flush_cmd(payload, router, "_flushall").await,
        "pubsub" => pubsub_cmd(payload, router).await,
        other => Reply::from(DbError::UnknownCommand(other.to_string())),
    }
}

/// Routes one request per key to the partition that owns it.
async fn scatter_unicast(router: &Router, db: usize, command: &'static str, keys: &[Bytes]) -> Vec<Reply> {
    let futs = keys.iter().cloned().map(|key| async move {
        let (payload, rx) = Payload::new(db, command, key.clone(), vec![Bytes::new()]);
        let partition = router.partition_for(&key);
        match router.send_to(partition, payload).await {
            Ok(()) => rx.await.unwrap_or_else(|_| Reply::from(DbError::Generic("partition died".into()))),
            Err(e) => Reply::from(e),
        }
    });
    join_all(futs).await
}

async fn scatter_set_pairs(router: &Router, db: usize, pairs: &[(Bytes, Bytes)]) -> Vec<Reply> {
    let futs = pairs.iter().cloned().map(|(key, value)| async move {
        let (payload, rx) = Payload::new(db, "set", key.clone(), vec![Bytes::new(), value]);
        let partition = router.partition_for(&key);
        match router.send_to(partition, payload).await {
            Ok(()) => rx.await.unwrap_or_else(|_| Reply::from(DbError::Generic("partition died".into()))),
            Err(e) => Reply::from(e),
        }
    });
    join_all(futs).await
}

/// Sends the same request to every partition, e.g. `KEYS`/`FLUSHALL`.
async fn broadcast(router: &Router, db: usize, command: &'static str, args: Vec<Bytes>) -> Vec<Reply> {
    let futs = router.partitions().map(|partition| {
        let args = args.clone();
        async move {
            let (payload, rx) = Payload::new(db, command, Bytes::new(), args);
            match router.send_to(partition, payload).await {
                Ok(()) => rx.await.unwrap_or_else(|_| Reply::from(DbError::Generic("partition died".into()))),
                Err(e) => Reply::from(e),
            }
        }
    });
    join_all(futs).await
}

fn chunk_pairs(args: &[Bytes]) -> Vec<(Bytes, Bytes)> {
    args.chunks(2).filter(|c| c.len() == 2).map(|c| (c[0].clone(), c[1].clone())).collect()
}

async fn mget(payload: &Payload, router: &Router) -> Reply {
    let replies = scatter_unicast(router, payload.db, "get", &payload.args).await;
    Reply::Array(replies)
}

async fn mset(payload: &Payload, router: &Router) -> Reply {
    let pairs = chunk_pairs(&payload.args);
    scatter_set_pairs(router, payload.db, &pairs).await;
    Reply::ok()
}

async fn msetnx(payload: &Payload, router: &Router) -> Reply {
    let pairs = chunk_pairs(&payload.args);
    let keys: Vec<Bytes> = pairs.iter().map(|(k, _)| k.clone()).collect();
    let existence = scatter_unicast(router, payload.db, "exists", &keys).await;
    if existence.iter().any(|r| !matches!(r, Reply::Integer(0))) {
        return Reply::Integer(0);
    }
    scatter_set_pairs(router, payload.db, &pairs).await;
    Reply::Integer(1)
}

async fn del(payload: &Payload, router: &Router) -> Reply {
    let replies = scatter_unicast(router, payload.db, "_del", &payload.args).await;
    let count = replies.iter().filter(|r| matches!(r, Reply::Integer(1))).count();
    Reply::Integer(count as i64)
}

fn reply_to_set(reply: Reply) -> HashSet<Bytes> {
    match reply {
        Reply::Array(items) => items
            .into_iter()
            .filter_map(|r| match r {
                Reply::Bulk(b) => Some(b),
                _ => None,
            })
            .collect(),
        _ => HashSet::new(),
    }
}

fn combine_sets(command: &str, mut sets: Vec<HashSet<Bytes>>) -> Vec<Bytes> {
    if sets.is_empty() {
        return Vec::new();
    }
    let first = sets.remove(0);
    let result = match command {
        "sdiff" | "sdiffstore" => sets.into_iter().fold(first, |acc, s| acc.difference(&s).cloned().collect()),
        "sinter" | "sinterstore" => sets.into_iter().fold(first, |acc, s| acc.intersection(&s).cloned().collect()),
        "sunion" | "sunionstore" => sets.into_iter().fold(first, |acc, s| acc.union(&s).cloned().collect()),
        _ => HashSet::new(),
    };
    result.into_iter().collect()
}

async fn set_op(payload: &Payload, router: &Router) -> Reply {
    let replies = scatter_unicast(router, payload.db, "smembers", &payload.args).await;
    let sets: Vec<HashSet<Bytes>> = replies.into_iter().map(reply_to_set).collect();
    Reply::array_of_bulk(combine_sets(&payload.command, sets))
}

async fn set_op_store(payload: &Payload, router: &Router) -> Reply {
    let Some((dest, sources)) = payload.args.split_first() else {
        return Reply::from(DbError::SyntaxError);
    };
    let replies = scatter_unicast(router, payload.db, "smembers", sources).await;
    let sets: Vec<HashSet<Bytes>> = replies.into_iter().map(reply_to_set).collect();
    let combined = combine_sets(&payload.command, sets);
    let count = combined.len();
    let (store_payload, store_rx) = Payload::new(payload.db, "_sstore", dest.clone(), combined);
    let partition = router.partition_for(dest);
    if router.send_to(partition, store_payload).await.is_ok() {
        let _ = store_rx.await;
    }
    Reply::Integer(count as i64)
}

#[derive(Clone, Copy)]
enum ZAggregate {
    Sum,
    Min,
    Max,
}

struct ZStoreArgs {
    dest: Bytes,
    keys: Vec<Bytes>,
    weights: Vec<f64>,
    aggregate: ZAggregate,
}

fn parse_zstore_args(args: &[Bytes]) -> Option<ZStoreArgs> {
    let dest = args.first()?.clone();
    let numkeys: usize = std::str::from_utf8(args.get(1)?).ok()?.parse().ok()?;
    if args.len() < 2 + numkeys {
        return None;
    }
    let keys: Vec<Bytes> = args[2..2 + numkeys].to_vec();
    let mut idx = 2 + numkeys;
    let mut weights = vec![1.0; numkeys];
    let mut aggregate = ZAggregate::Sum;
    while idx < args.len() {
        let token = std::str::from_utf8(&args[idx]).ok()?.to_ascii_uppercase();
        match token.as_str() {
            "WEIGHTS" => {
                for w in weights.iter_mut() {
                    idx += 1;
                    *w = std::str::from_utf8(args.get(idx)?).ok()?.parse().ok()?;
                }
                idx += 1;
            }
            "AGGREGATE" => {
                idx += 1;
                aggregate = match std::str::from_utf8(args.get(idx)?).ok()?.to_ascii_uppercase().as_str() {
                    "SUM" => ZAggregate::Sum,
                    "MIN" => ZAggregate::Min,
                    "MAX" => ZAggregate::Max,
                    _ => return None,
                };
                idx += 1;
            }
            _ => return None,
        }
    }
    Some(ZStoreArgs { dest, keys, weights, aggregate })
}

fn reply_to_zmap(reply: Reply) -> HashMap<Bytes, f64> {
    let mut map = HashMap::new();
    if let Reply::Array(items) = reply {
        let mut iter = items.into_iter();
        while let (Some(member), Some(score)) = (iter.next(), iter.next()) {
            if let (Reply::Bulk(member), Reply::Bulk(score)) = (member, score) {
                if let Ok(score) = std::str::from_utf8(&score).unwrap_or("").parse::<f64>() {
                    map.insert(member, score);
                }
            }
        }
    }
    map
}

fn apply_aggregate(aggregate: ZAggregate, a: f64, b: f64) -> f64 {
    match aggregate {
        ZAggregate::Sum => a + b,
        ZAggregate::Min => a.min(b),
        ZAggregate::Max => a.max(b),
    }
}

fn combine_zmaps(maps: Vec<HashMap<Bytes, f64>>, weights: &[f64], aggregate: ZAggregate, union: bool) -> HashMap<Bytes, f64> {
    let required = maps.len();
    let mut combined: HashMap<Bytes, f64> = HashMap::new();
    let mut seen: HashMap<Bytes, usize> = HashMap::new();
    for (idx, map) in maps.into_iter().enumerate() {
        let weight = weights.get(idx).copied().unwrap_or(1.0);
        for (member, score) in map {
            let weighted = score * weight;
            *seen.entry(member.clone()).or_insert(0) += 1;
            combined
                .entry(member)
                .and_modify(|acc| *acc = apply_aggregate(aggregate, *acc, weighted))
                .or_insert(weighted);
        }
    }
    if union {
        combined
    } else {
        combined.into_iter().filter(|(member, _)| seen.get(member).copied().unwrap_or(0) == required).collect()
    }
}

/// Mirrors the ValueNode's own score rendering (`valuenode::zset::format_score`)
/// so a `_ZSTORE` relay round-trips through the same textual form.
fn format_score(score: f64) -> String {
    if score.fract() == 0.0 && score.abs() < 1e17 {
        format!("{}", score as i64)
    } else {
        let mut buf = ryu::Buffer::new();
        buf.format(score).trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

async fn zset_op_store(payload: &Payload, router: &Router) -> Reply {
    let Some(parsed) = parse_zstore_args(&payload.args) else {
        return Reply::from(DbError::SyntaxError);
    };
    let replies = scatter_unicast(router, payload.db, "_zget", &parsed.keys).await;
    let maps: Vec<HashMap<Bytes, f64>> = replies.into_iter().map(reply_to_zmap).collect();
    let is_union = payload.command == "zunionstore";
    let combined = combine_zmaps(maps, &parsed.weights, parsed.aggregate, is_union);
    let mut members: Vec<(Bytes, f64)> = combined.into_iter().collect();
    members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
    let count = members.len();
    let mut store_args = Vec::with_capacity(count * 2);
    for (member, score) in members {
        store_args.push(Bytes::from(format_score(score)));
        store_args.push(member);
    }
    let (store_payload, store_rx) = Payload::new(payload.db, "_zstore", parsed.dest.clone(), store_args);
    let partition = router.partition_for(&parsed.dest);
    if router.send_to(partition, store_payload).await.is_ok() {
        let _ = store_rx.await;
    }
    Reply::Integer(count as i64)
}

fn combine_bitmaps(op: &str, bitmaps: Vec<Vec<u8>>) -> Option<Vec<u8>> {
    match op {
        "NOT" => Some(bitmaps.into_iter().next().unwrap_or_default().into_iter().map(|b| !b).collect()),
        "AND" | "OR" | "XOR" => {
            let max_len = bitmaps.iter().map(|b| b.len()).max().unwrap_or(0);
            let mut result = vec![0u8; max_len];
            for (idx, bitmap) in bitmaps.iter().enumerate() {
                for (i, slot) in result.iter_mut().enumerate() {
                    let byte = bitmap.get(i).copied().unwrap_or(0);
                    *slot = if idx == 0 {
                        byte
                    } else {
                        match op {
                            "AND" => *slot & byte,
                            "OR" => *slot | byte,
                            "XOR" => *slot ^ byte,
                            _ => unreachable!(),
                        }
                    };
                }
            }
            Some(result)
        }
        _ => None,
    }
}

async fn bitop(payload: &Payload, router: &Router) -> Reply {
    let Some(op) = payload.args.first() else {
        return Reply::from(DbError::SyntaxError);
    };
    let op_str = String::from_utf8_lossy(op).to_ascii_uppercase();
    let Some(dest) = payload.args.get(1).cloned() else {
        return Reply::from(DbError::SyntaxError);
    };
    let sources: Vec<Bytes> = payload.args.get(2..).map(|s| s.to_vec()).unwrap_or_default();
    if sources.is_empty() || (op_str == "NOT" && sources.len() != 1) {
        return Reply::from(DbError::SyntaxError);
    }
    let replies = scatter_unicast(router, payload.db, "_bget", &sources).await;
    let bitmaps: Vec<Vec<u8>> = replies
        .into_iter()
        .map(|r| match r {
            Reply::Bulk(b) => b.to_vec(),
            _ => Vec::new(),
        })
        .collect();
    let Some(combined) = combine_bitmaps(&op_str, bitmaps) else {
        return Reply::from(DbError::SyntaxError);
    };
    let len = combined.len();
    let (store_payload, store_rx) = Payload::new(payload.db, "_bstore", dest.clone(), vec![Bytes::from(combined)]);
    let partition = router.partition_for(&dest);
    if router.send_to(partition, store_payload).await.is_ok() {
        let _ = store_rx.await;
    }
    Reply::Integer(len as i64)
}

async fn pfcount(payload: &Payload, router: &Router) -> Reply {
    let replies = scatter_unicast(router, payload.db, "_pfcount", &payload.args).await;
    let total: i64 = replies
        .iter()
        .map(|r| match r {
            Reply::Integer(n) => *n,
            _ => 0,
        })
        .sum();
    Reply::Integer(total)
}

async fn pfmerge(payload: &Payload, router: &Router) -> Reply {
    let Some((dest, sources)) = payload.args.split_first() else {
        return Reply::from(DbError::SyntaxError);
    };
    let replies = scatter_unicast(router, payload.db, "_pfget", sources).await;
    let mut merged = HyperLogLog::new();
    for reply in replies {
        if let Reply::Bulk(bytes) = reply {
            if let Some(sketch) = HyperLogLog::deserialize(&bytes) {
                merged.merge(&sketch);
            }
        }
    }
    let (store_payload, store_rx) = Payload::new(payload.db, "_pfstore", dest.clone(), vec![merged.serialize()]);
    let partition = router.partition_for(dest);
    if router.send_to(partition, store_payload).await.is_ok() {
        let _ = store_rx.await;
    }
    Reply::ok()
}

async fn keys_cmd(payload: &Payload, router: &Router) -> Reply {
    let pattern = payload.args.first().cloned().unwrap_or_else(|| Bytes::from_static(b"*"));
    let replies = broadcast(router, payload.db, "_keys", vec![pattern]).await;
    Reply::Array(flatten_arrays(replies))
}

fn parse_match_pattern(rest: &[Bytes]) -> Option<Bytes> {
    rest.iter().position(|tok| tok.eq_ignore_ascii_case(b"MATCH")).and_then(|i| rest.get(i + 1)).cloned()
}

async fn scan_cmd(payload: &Payload, router: &Router) -> Reply {
    let pattern = payload.args.get(1..).and_then(parse_match_pattern).unwrap_or_else(|| Bytes::from_static(b"*"));
    let replies = broadcast(router, payload.db, "_keys", vec![pattern]).await;
    let all = flatten_arrays(replies);
    Reply::Array(vec![Reply::bulk(Bytes::from_static(b"0")), Reply::Array(all)])
}

fn flatten_arrays(replies: Vec<Reply>) -> Vec<Reply> {
    replies
        .into_iter()
        .flat_map(|r| match r {
            Reply::Array(items) => items,
            _ => Vec::new(),
        })
        .collect()
}

async fn dbsize_cmd(payload: &Payload, router: &Router) -> Reply {
    let replies = broadcast(router, payload.db, "_dbsize", vec![]).await;
    let total: i64 = replies
        .iter()
        .map(|r| match r {
            Reply::Integer(n) => *n,
            _ => 0,
        })
        .sum();
    Reply::Integer(total)
}

async fn randomkey_cmd(payload: &Payload, router: &Router) -> Reply {
    let replies = broadcast(router, payload.db, "_randomkey", vec![]).await;
    let candidates: Vec<Bytes> = replies
        .into_iter()
        .filter_map(|r| match r {
            Reply::Bulk(b) => Some(b),
            _ => None,
        })
        .collect();
    if candidates.is_empty() {
        Reply::Nil
    } else {
        Reply::bulk(candidates[rand::random::<usize>() % candidates.len()].clone())
    }
}

async fn flush_cmd(payload: &Payload, router: &Router, command: &'static str) -> Reply {
    broadcast(router, payload.db, command, vec![]).await;
    Reply::ok()
}

async fn pubsub_cmd(payload: &Payload, router: &Router) -> Reply {
    let Some(sub) = payload.args.first() else {
        return Reply::from(DbError::SyntaxError);
    };
    let sub = String::from_utf8_lossy(sub).to_ascii_uppercase();
    match sub.as_str() {
        "CHANNELS" => {
            let pattern = payload.args.get(1).cloned();
            let args = pattern.map(|p| vec![p]).unwrap_or_default();
            let replies = broadcast(router, payload.db, "_channels", args).await;
            Reply::Array(flatten_arrays(replies))
        }
        "NUMSUB" => {
            let channels = payload.args.get(1..).unwrap_or(&[]);
            let mut out = Vec::with_capacity(channels.len() * 2);
            for channel in channels {
                let (p, rx) = Payload::new(payload.db, "_numsub", channel.clone(), vec![channel.clone()]);
                let partition = router.partition_for(channel);
                let delivered = router.send_to(partition, p).await.is_ok();
                match if delivered { rx.await.ok() } else { None } {
                    Some(Reply::Array(items)) => out.extend(items),
                    _ => {
                        out.push(Reply::bulk(channel.clone()));
                        out.push(Reply::Integer(0));
                    }
                }
            }
            Reply::Array(out)
        }
        "NUMPAT" => {
            let replies = broadcast(router, payload.db, "_numpat", vec![]).await;
            let total: i64 = replies
                .iter()
                .map(|r| match r {
                    Reply::Integer(n) => *n,
                    _ => 0,
                })
                .sum();
            Reply::Integer(total)
        }
        _ => Reply::from(DbError::SyntaxError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_sets_handles_each_operator() {
        let a: HashSet<Bytes> = ["a", "b", "c"].into_iter().map(|s| Bytes::from_static(s.as_bytes())).collect();
        let b: HashSet<Bytes> = ["b", "c"].into_iter().map(|s| Bytes::from_static(s.as_bytes())).collect();
        let mut diff = combine_sets("sdiff", vec![a.clone(), b.clone()]);
        diff.sort();
        assert_eq!(diff, vec![Bytes::from_static(b"a")]);

        let mut inter = combine_sets("sinter", vec![a.clone(), b.clone()]);
        inter.sort();
        assert_eq!(inter, vec![Bytes::from_static(b"b"), Bytes::from_static(b"c")]);

        let union = combine_sets("sunion", vec![a, b]);
        assert_eq!(union.len(), 3);
    }

    #[test]
    fn combine_bitmaps_and_pads_missing_bytes_as_zero() {
        let result = combine_bitmaps("AND", vec![vec![0xFF, 0xFF], vec![0x0F]]).unwrap();
        assert_eq!(result, vec![0x0F, 0x00]);
    }

    #[test]
    fn combine_bitmaps_not_inverts_single_input() {
        let result = combine_bitmaps("NOT", vec![vec![0b1010_1010]]).unwrap();
        assert_eq!(result, vec![0b0101_0101]);
    }

    #[test]
    fn parse_zstore_args_reads_weights_and_aggregate() {
        let args: Vec<Bytes> = ["dest", "2", "a", "b", "WEIGHTS", "2", "3", "AGGREGATE", "MAX"]
            .into_iter()
            .map(|s| Bytes::from_static(s.as_bytes()))
            .collect();
        let parsed = parse_zstore_args(&args).unwrap();
        assert_eq!(parsed.dest, Bytes::from_static(b"dest"));
        assert_eq!(parsed.keys, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert_eq!(parsed.weights, vec![2.0, 3.0]);
        assert!(matches!(parsed.aggregate, ZAggregate::Max));
    }

    #[test]
    fn combine_zmaps_intersection_requires_presence_in_every_map() {
        let mut a = HashMap::new();
        a.insert(Bytes::from_static(b"x"), 1.0);
        a.insert(Bytes::from_static(b"y"), 1.0);
        let mut b = HashMap::new();
        b.insert(Bytes::from_static(b"x"), 5.0);
        let combined = combine_zmaps(vec![a, b], &[1.0, 1.0], ZAggregate::Sum, false);
        assert_eq!(combined.get(&Bytes::from_static(b"x")), Some(&6.0));
        assert_eq!(combined.get(&Bytes::from_static(b"y")), None);
    }
}
