//! `set`-type command execution.

use super::outcome::ExecOutcome;
use super::value::Value;
use crate::core::protocol::Reply;
use crate::core::DbError;
use bytes::Bytes;
use indexmap::IndexSet;
use rand::seq::SliceRandom;
use rand::thread_rng;

fn as_set(value: &Value) -> Result<&IndexSet<Bytes>, DbError> {
    match value {
        Value::Set(s) => Ok(s),
        _ => Err(DbError::WrongType),
    }
}

fn as_set_mut(value: &mut Value) -> Result<&mut IndexSet<Bytes>, DbError> {
    match value {
        Value::Set(s) => Ok(s),
        _ => Err(DbError::WrongType),
    }
}

pub fn sadd(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() < 2 {
        return Err(DbError::SyntaxError);
    }
    let set = as_set_mut(value)?;
    let mut added = 0;
    for member in &args[1..] {
        if set.insert(member.clone()) {
            added += 1;
        }
    }
    Ok(ExecOutcome::write(Reply::Integer(added)))
}

pub fn srem(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() < 2 {
        return Err(DbError::SyntaxError);
    }
    let set = as_set_mut(value)?;
    let mut removed = 0;
    for member in &args[1..] {
        if set.shift_remove(member) {
            removed += 1;
        }
    }
    let outcome = ExecOutcome::write(Reply::Integer(removed));
    Ok(if set.is_empty() { outcome.deleting() } else { outcome })
}

pub fn scard(existing: Option<&Value>) -> Result<ExecOutcome, DbError> {
    let len = existing.map(as_set).transpose()?.map(|s| s.len()).unwrap_or(0);
    Ok(ExecOutcome::read(Reply::Integer(len as i64)))
}

pub fn sismember(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 2 {
        return Err(DbError::SyntaxError);
    }
    let found = existing.map(as_set).transpose()?.is_some_and(|s| s.contains(&args[1]));
    Ok(ExecOutcome::read(Reply::bool(found)))
}

pub fn smembers(existing: Option<&Value>) -> Result<ExecOutcome, DbError> {
    let set = existing.map(as_set).transpose()?;
    let items = set.map(|s| s.iter().cloned().map(Reply::Bulk).collect()).unwrap_or_default();
    Ok(ExecOutcome::read(Reply::Array(items)))
}

pub fn srandmember(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    let set = existing.map(as_set).transpose()?;
    let Some(set) = set.filter(|s| !s.is_empty()) else {
        return Ok(ExecOutcome::read(if args.len() > 1 {
            Reply::Array(vec![])
        } else {
            Reply::Nil
        }));
    };
    if args.len() <= 1 {
        let member = set.iter().collect::<Vec<_>>().choose(&mut thread_rng()).unwrap().clone().clone();
        return Ok(ExecOutcome::read(Reply::Bulk(member)));
    }
    let count: i64 = std::str::from_utf8(&args[1]).map_err(|_| DbError::NotAnInteger)?.parse().map_err(|_| DbError::NotAnInteger)?;
    let items: Vec<&Bytes> = set.iter().collect();
    let chosen: Vec<Reply> = if count >= 0 {
        let n = (count as usize).min(items.len());
        let mut sample = items.clone();
        sample.shuffle(&mut thread_rng());
        sample.into_iter().take(n).cloned().map(Reply::Bulk).collect()
    } else {
        let n = (-count) as usize;
        (0..n)
            .map(|_| Reply::Bulk((*items.choose(&mut thread_rng()).unwrap()).clone()))
            .collect()
    };
    Ok(ExecOutcome::read(Reply::Array(chosen)))
}

pub fn spop(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    let set = as_set_mut(value)?;
    if args.len() <= 1 {
        let Some(member) = set.iter().collect::<Vec<_>>().choose(&mut thread_rng()).map(|b| (*b).clone()) else {
            return Ok(ExecOutcome::read(Reply::Nil));
        };
        set.shift_remove(&member);
        let outcome = ExecOutcome::write(Reply::Bulk(member));
        return Ok(if set.is_empty() { outcome.deleting() } else { outcome });
    }
    let count: usize = std::str::from_utf8(&args[1]).map_err(|_| DbError::NotAnInteger)?.parse().map_err(|_| DbError::NotAnInteger)?;
    let mut items: Vec<Bytes> = set.iter().cloned().collect();
    items.shuffle(&mut thread_rng());
    let popped: Vec<Bytes> = items.into_iter().take(count).collect();
    for item in &popped {
        set.shift_remove(item);
    }
    let outcome = ExecOutcome::write(Reply::array_of_bulk(popped));
    Ok(if set.is_empty() { outcome.deleting() } else { outcome })
}

/// `SMOVE source destination member`: removes `member` from this (the
/// source) set. The caller is responsible for routing the follow-up `SADD`
/// to the destination key once this reports success.
pub fn smove(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 3 {
        return Err(DbError::SyntaxError);
    }
    let set = as_set_mut(value)?;
    let member = &args[2];
    if !set.shift_remove(member) {
        return Ok(ExecOutcome::read(Reply::Integer(0)));
    }
    let outcome = ExecOutcome::write(Reply::Integer(1));
    Ok(if set.is_empty() { outcome.deleting() } else { outcome })
}

/// Full-dump cursor simplification (matching the aggregator's own `SCAN`):
/// every member comes back in one call and the cursor is always `"0"`.
pub fn sscan(existing: Option<&Value>) -> Result<ExecOutcome, DbError> {
    let set = existing.map(as_set).transpose()?;
    let items = set.map(|s| s.iter().cloned().map(Reply::Bulk).collect()).unwrap_or_default();
    Ok(ExecOutcome::read(Reply::Array(vec![Reply::bulk(Bytes::from_static(b"0")), Reply::Array(items)])))
}

/// Internal: returns the raw members for a SDIFF/SINTER/SUNION scatter.
pub fn sget(existing: Option<&Value>) -> Result<ExecOutcome, DbError> {
    let set = existing.map(as_set).transpose()?;
    let items = set.map(|s| s.iter().cloned().map(Reply::Bulk).collect()).unwrap_or_default();
    Ok(ExecOutcome::read(Reply::Array(items)))
}

/// Internal: installs a complete member set as this key's new value, used by
/// `SDIFFSTORE`/`SINTERSTORE`/`SUNIONSTORE` and the `RENAME` relay.
pub fn sstore(args: &[Bytes]) -> Result<(ExecOutcome, Value), DbError> {
    let set: IndexSet<Bytes> = args.iter().cloned().collect();
    let len = set.len() as i64;
    Ok((ExecOutcome::write(Reply::Integer(len)), Value::Set(set)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sadd_counts_only_new_members() {
        let mut v = Value::Set(IndexSet::new());
        let outcome = sadd(&mut v, &[Bytes::new(), Bytes::from_static(b"a"), Bytes::from_static(b"a")]).unwrap();
        assert_eq!(outcome.reply, Reply::Integer(1));
    }

    #[test]
    fn srem_marks_delete_when_set_becomes_empty() {
        let mut set = IndexSet::new();
        set.insert(Bytes::from_static(b"a"));
        let mut v = Value::Set(set);
        let outcome = srem(&mut v, &[Bytes::new(), Bytes::from_static(b"a")]).unwrap();
        assert!(outcome.delete);
    }
}
