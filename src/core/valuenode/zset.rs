//! `sortedset`-type command execution.

use super::outcome::ExecOutcome;
use super::value::Value;
use crate::core::protocol::Reply;
use crate::core::sortedset::{LexBoundary, ScoreBoundary, SortedSet, ZSetEntry};
use crate::core::DbError;
use bytes::Bytes;

fn as_zset(value: &Value) -> Result<&SortedSet, DbError> {
    match value {
        Value::SortedSet(z) => Ok(z),
        _ => Err(DbError::WrongType),
    }
}

fn as_zset_mut(value: &mut Value) -> Result<&mut SortedSet, DbError> {
    match value {
        Value::SortedSet(z) => Ok(z),
        _ => Err(DbError::WrongType),
    }
}

fn parse_score(arg: &Bytes) -> Result<f64, DbError> {
    std::str::from_utf8(arg).map_err(|_| DbError::NotAFloat)?.parse().map_err(|_| DbError::NotAFloat)
}

fn parse_score_boundary(arg: &Bytes) -> Result<ScoreBoundary, DbError> {
    let s = std::str::from_utf8(arg).map_err(|_| DbError::NotAFloat)?;
    Ok(match s {
        "-inf" => ScoreBoundary::NegInfinity,
        "+inf" | "inf" => ScoreBoundary::PosInfinity,
        _ if s.starts_with('(') => ScoreBoundary::Exclusive(s[1..].parse().map_err(|_| DbError::NotAFloat)?),
        _ => ScoreBoundary::Inclusive(s.parse().map_err(|_| DbError::NotAFloat)?),
    })
}

fn parse_lex_boundary(arg: &Bytes) -> Result<LexBoundary, DbError> {
    if arg.as_ref() == b"-" {
        return Ok(LexBoundary::Min);
    }
    if arg.as_ref() == b"+" {
        return Ok(LexBoundary::Max);
    }
    match arg.first() {
        Some(b'[') => Ok(LexBoundary::Inclusive(arg.slice(1..))),
        Some(b'(') => Ok(LexBoundary::Exclusive(arg.slice(1..))),
        _ => Err(DbError::SyntaxError),
    }
}

pub fn zadd(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() < 3 || args.len() % 2 != 1 {
        return Err(DbError::SyntaxError);
    }
    let zset = as_zset_mut(value)?;
    let mut added = 0;
    for pair in args[1..].chunks_exact(2) {
        let score = parse_score(&pair[0])?;
        if zset.add(score, pair[1].clone()) {
            added += 1;
        }
    }
    Ok(ExecOutcome::write(Reply::Integer(added)))
}

pub fn zrem(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() < 2 {
        return Err(DbError::SyntaxError);
    }
    let zset = as_zset_mut(value)?;
    let mut removed = 0;
    for member in &args[1..] {
        if zset.remove(member) {
            removed += 1;
        }
    }
    let outcome = ExecOutcome::write(Reply::Integer(removed));
    Ok(if zset.is_empty() { outcome.deleting() } else { outcome })
}

pub fn zcard(existing: Option<&Value>) -> Result<ExecOutcome, DbError> {
    let len = existing.map(as_zset).transpose()?.map(|z| z.len()).unwrap_or(0);
    Ok(ExecOutcome::read(Reply::Integer(len as i64)))
}

pub fn zscore(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 2 {
        return Err(DbError::SyntaxError);
    }
    let reply = existing
        .map(as_zset)
        .transpose()?
        .and_then(|z| z.get_score(&args[1]))
        .map(|s| Reply::bulk(format_score(s)))
        .unwrap_or(Reply::Nil);
    Ok(ExecOutcome::read(reply))
}

pub fn zincrby(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 3 {
        return Err(DbError::SyntaxError);
    }
    let delta = parse_score(&args[1])?;
    let zset = as_zset_mut(value)?;
    let new_score = zset.increment_score(&args[2], delta);
    Ok(ExecOutcome::write(Reply::bulk(format_score(new_score))))
}

pub fn zrank(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    rank(existing, args, false)
}

pub fn zrevrank(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    rank(existing, args, true)
}

fn rank(existing: Option<&Value>, args: &[Bytes], reverse: bool) -> Result<ExecOutcome, DbError> {
    if args.len() != 2 {
        return Err(DbError::SyntaxError);
    }
    let zset = existing.map(as_zset).transpose()?;
    let reply = zset
        .and_then(|z| if reverse { z.get_rev_rank(&args[1]) } else { z.get_rank(&args[1]) })
        .map(|r| Reply::Integer(r as i64))
        .unwrap_or(Reply::Nil);
    Ok(ExecOutcome::read(reply))
}

pub fn zrange(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    range(existing, args, false)
}

pub fn zrevrange(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    range(existing, args, true)
}

fn range(existing: Option<&Value>, args: &[Bytes], reverse: bool) -> Result<ExecOutcome, DbError> {
    if args.len() < 3 {
        return Err(DbError::SyntaxError);
    }
    let with_scores = args.len() > 3 && String::from_utf8_lossy(&args[3]).eq_ignore_ascii_case("withscores");
    let start: i64 = std::str::from_utf8(&args[1]).map_err(|_| DbError::NotAnInteger)?.parse().map_err(|_| DbError::NotAnInteger)?;
    let stop: i64 = std::str::from_utf8(&args[2]).map_err(|_| DbError::NotAnInteger)?.parse().map_err(|_| DbError::NotAnInteger)?;
    let entries = existing
        .map(as_zset)
        .transpose()?
        .map(|z| if reverse { z.get_rev_range(start, stop) } else { z.get_range(start, stop) })
        .unwrap_or_default();
    Ok(ExecOutcome::read(entries_to_reply(entries, with_scores)))
}

pub fn zrangebyscore(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    range_by_score(existing, args, false)
}

pub fn zrevrangebyscore(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    range_by_score(existing, args, true)
}

fn range_by_score(existing: Option<&Value>, args: &[Bytes], reverse: bool) -> Result<ExecOutcome, DbError> {
    if args.len() < 3 {
        return Err(DbError::SyntaxError);
    }
    let (min_arg, max_arg) = if reverse { (&args[2], &args[1]) } else { (&args[1], &args[2]) };
    let min = parse_score_boundary(min_arg)?;
    let max = parse_score_boundary(max_arg)?;
    let with_scores = args[3..].iter().any(|a| a.eq_ignore_ascii_case(b"withscores"));
    let mut entries = existing.map(as_zset).transpose()?.map(|z| z.get_range_by_score(min, max)).unwrap_or_default();
    if reverse {
        entries.reverse();
    }
    Ok(ExecOutcome::read(entries_to_reply(entries, with_scores)))
}

pub fn zrangebylex(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    range_by_lex(existing, args, false)
}

pub fn zrevrangebylex(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    range_by_lex(existing, args, true)
}

fn range_by_lex(existing: Option<&Value>, args: &[Bytes], reverse: bool) -> Result<ExecOutcome, DbError> {
    if args.len() < 3 {
        return Err(DbError::SyntaxError);
    }
    let (min_arg, max_arg) = if reverse { (&args[2], &args[1]) } else { (&args[1], &args[2]) };
    let min = parse_lex_boundary(min_arg)?;
    let max = parse_lex_boundary(max_arg)?;
    let mut entries = existing.map(as_zset).transpose()?.map(|z| z.get_range_by_lex(&min, &max)).unwrap_or_default();
    if reverse {
        entries.reverse();
    }
    Ok(ExecOutcome::read(entries_to_reply(entries, false)))
}

pub fn zcount(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 3 {
        return Err(DbError::SyntaxError);
    }
    let min = parse_score_boundary(&args[1])?;
    let max = parse_score_boundary(&args[2])?;
    let count = existing.map(as_zset).transpose()?.map(|z| z.get_range_by_score(min, max).len()).unwrap_or(0);
    Ok(ExecOutcome::read(Reply::Integer(count as i64)))
}

pub fn zlexcount(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 3 {
        return Err(DbError::SyntaxError);
    }
    let min = parse_lex_boundary(&args[1])?;
    let max = parse_lex_boundary(&args[2])?;
    let count = existing.map(as_zset).transpose()?.map(|z| z.get_range_by_lex(&min, &max).len()).unwrap_or(0);
    Ok(ExecOutcome::read(Reply::Integer(count as i64)))
}

pub fn zremrangebyrank(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 3 {
        return Err(DbError::SyntaxError);
    }
    let start: i64 = std::str::from_utf8(&args[1]).map_err(|_| DbError::NotAnInteger)?.parse().map_err(|_| DbError::NotAnInteger)?;
    let stop: i64 = std::str::from_utf8(&args[2]).map_err(|_| DbError::NotAnInteger)?.parse().map_err(|_| DbError::NotAnInteger)?;
    let zset = as_zset_mut(value)?;
    let removed = zset.remove_range_by_rank(start, stop);
    let outcome = ExecOutcome::write(Reply::Integer(removed as i64));
    Ok(if zset.is_empty() { outcome.deleting() } else { outcome })
}

pub fn zremrangebyscore(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 3 {
        return Err(DbError::SyntaxError);
    }
    let min = parse_score_boundary(&args[1])?;
    let max = parse_score_boundary(&args[2])?;
    let zset = as_zset_mut(value)?;
    let removed = zset.remove_range_by_score(min, max);
    let outcome = ExecOutcome::write(Reply::Integer(removed as i64));
    Ok(if zset.is_empty() { outcome.deleting() } else { outcome })
}

pub fn zremrangebylex(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 3 {
        return Err(DbError::SyntaxError);
    }
    let min = parse_lex_boundary(&args[1])?;
    let max = parse_lex_boundary(&args[2])?;
    let zset = as_zset_mut(value)?;
    let removed = zset.remove_range_by_lex(&min, &max);
    let outcome = ExecOutcome::write(Reply::Integer(removed as i64));
    Ok(if zset.is_empty() { outcome.deleting() } else { outcome })
}

/// Internal: returns the full member→score map for a ZUNIONSTORE/ZINTERSTORE scatter.
pub fn zget(existing: Option<&Value>) -> Result<ExecOutcome, DbError> {
    let entries = existing.map(as_zset).transpose()?.map(|z| z.iter().cloned().collect()).unwrap_or_default();
    Ok(ExecOutcome::read(entries_to_reply(entries, true)))
}

/// Internal: installs a complete member/score map as this key's new value,
/// used by `ZUNIONSTORE`/`ZINTERSTORE` and the `RENAME` relay.
pub fn zstore(args: &[Bytes]) -> Result<(ExecOutcome, Value), DbError> {
    if args.len() % 2 != 0 {
        return Err(DbError::SyntaxError);
    }
    let mut zset = SortedSet::new();
    for pair in args.chunks_exact(2) {
        let score = parse_score(&pair[0])?;
        zset.add(score, pair[1].clone());
    }
    let len = zset.len() as i64;
    Ok((ExecOutcome::write(Reply::Integer(len)), Value::SortedSet(zset)))
}

fn entries_to_reply(entries: Vec<ZSetEntry>, with_scores: bool) -> Reply {
    let mut items = Vec::with_capacity(entries.len() * if with_scores { 2 } else { 1 });
    for entry in entries {
        items.push(Reply::Bulk(entry.member));
        if with_scores {
            items.push(Reply::bulk(format_score(entry.score)));
        }
    }
    Reply::Array(items)
}

fn format_score(score: f64) -> String {
    if score.fract() == 0.0 && score.abs() < 1e17 {
        format!("{}", score as i64)
    } else {
        let mut buf = ryu::Buffer::new();
        buf.format(score).trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zadd_then_zrange_orders_by_score() {
        let mut v = Value::SortedSet(SortedSet::new());
        zadd(&mut v, &[Bytes::new(), Bytes::from_static(b"2"), Bytes::from_static(b"b"), Bytes::from_static(b"1"), Bytes::from_static(b"a")]).unwrap();
        let outcome = zrange(Some(&v), &[Bytes::new(), Bytes::from_static(b"0"), Bytes::from_static(b"-1")]).unwrap();
        assert_eq!(
            outcome.reply,
            Reply::Array(vec![Reply::bulk(Bytes::from_static(b"a")), Reply::bulk(Bytes::from_static(b"b"))])
        );
    }

    #[test]
    fn zscore_missing_member_is_nil() {
        let v = Value::SortedSet(SortedSet::new());
        let outcome = zscore(Some(&v), &[Bytes::new(), Bytes::from_static(b"x")]).unwrap();
        assert_eq!(outcome.reply, Reply::Nil);
    }
}
