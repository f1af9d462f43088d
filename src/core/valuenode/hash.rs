//! `hash`-type command execution.

use super::outcome::ExecOutcome;
use super::value::Value;
use crate::core::protocol::Reply;
use crate::core::DbError;
use bytes::Bytes;
use indexmap::IndexMap;

fn as_hash(value: &Value) -> Result<&IndexMap<Bytes, Bytes>, DbError> {
    match value {
        Value::Hash(h) => Ok(h),
        _ => Err(DbError::WrongType),
    }
}

fn as_hash_mut(value: &mut Value) -> Result<&mut IndexMap<Bytes, Bytes>, DbError> {
    match value {
        Value::Hash(h) => Ok(h),
        _ => Err(DbError::WrongType),
    }
}

pub fn hset(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() < 3 || args.len() % 2 != 1 {
        return Err(DbError::SyntaxError);
    }
    let hash = as_hash_mut(value)?;
    let mut added = 0;
    for pair in args[1..].chunks_exact(2) {
        if hash.insert(pair[0].clone(), pair[1].clone()).is_none() {
            added += 1;
        }
    }
    Ok(ExecOutcome::write(Reply::Integer(added)))
}

pub fn hsetnx(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 3 {
        return Err(DbError::SyntaxError);
    }
    let hash = as_hash_mut(value)?;
    if hash.contains_key(&args[1]) {
        return Ok(ExecOutcome::read(Reply::Integer(0)));
    }
    hash.insert(args[1].clone(), args[2].clone());
    Ok(ExecOutcome::write(Reply::Integer(1)))
}

pub fn hget(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 2 {
        return Err(DbError::SyntaxError);
    }
    let hash = existing.map(as_hash).transpose()?;
    let reply = hash
        .and_then(|h| h.get(&args[1]))
        .map(|v| Reply::Bulk(v.clone()))
        .unwrap_or(Reply::Nil);
    Ok(ExecOutcome::read(reply))
}

pub fn hmget(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() < 2 {
        return Err(DbError::SyntaxError);
    }
    let hash = existing.map(as_hash).transpose()?;
    let items = args[1..]
        .iter()
        .map(|field| {
            hash.and_then(|h| h.get(field))
                .map(|v| Reply::Bulk(v.clone()))
                .unwrap_or(Reply::Nil)
        })
        .collect();
    Ok(ExecOutcome::read(Reply::Array(items)))
}

pub fn hgetall(existing: Option<&Value>) -> Result<ExecOutcome, DbError> {
    let hash = existing.map(as_hash).transpose()?;
    let mut items = Vec::new();
    if let Some(hash) = hash {
        for (k, v) in hash {
            items.push(Reply::Bulk(k.clone()));
            items.push(Reply::Bulk(v.clone()));
        }
    }
    Ok(ExecOutcome::read(Reply::Array(items)))
}

pub fn hdel(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() < 2 {
        return Err(DbError::SyntaxError);
    }
    let hash = as_hash_mut(value)?;
    let mut removed = 0;
    for field in &args[1..] {
        if hash.shift_remove(field).is_some() {
            removed += 1;
        }
    }
    let now_empty = hash.is_empty();
    let outcome = ExecOutcome::write(Reply::Integer(removed));
    Ok(if now_empty { outcome.deleting() } else { outcome })
}

pub fn hkeys(existing: Option<&Value>) -> Result<ExecOutcome, DbError> {
    let hash = existing.map(as_hash).transpose()?;
    let items = hash
        .map(|h| h.keys().cloned().map(Reply::Bulk).collect())
        .unwrap_or_default();
    Ok(ExecOutcome::read(Reply::Array(items)))
}

pub fn hvals(existing: Option<&Value>) -> Result<ExecOutcome, DbError> {
    let hash = existing.map(as_hash).transpose()?;
    let items = hash
        .map(|h| h.values().cloned().map(Reply::Bulk).collect())
        .unwrap_or_default();
    Ok(ExecOutcome::read(Reply::Array(items)))
}

pub fn hlen(existing: Option<&Value>) -> Result<ExecOutcome, DbError> {
    let len = existing.map(as_hash).transpose()?.map(|h| h.len()).unwrap_or(0);
    Ok(ExecOutcome::read(Reply::Integer(len as i64)))
}

pub fn hexists(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 2 {
        return Err(DbError::SyntaxError);
    }
    let found = existing.map(as_hash).transpose()?.is_some_and(|h| h.contains_key(&args[1]));
    Ok(ExecOutcome::read(Reply::bool(found)))
}

pub fn hincrby(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 3 {
        return Err(DbError::SyntaxError);
    }
    let delta: i64 = std::str::from_utf8(&args[2])
        .map_err(|_| DbError::NotAnInteger)?
        .parse()
        .map_err(|_| DbError::NotAnInteger)?;
    let hash = as_hash_mut(value)?;
    let current: i64 = match hash.get(&args[1]) {
        Some(v) => std::str::from_utf8(v).map_err(|_| DbError::NotAnInteger)?.parse().map_err(|_| DbError::NotAnInteger)?,
        None => 0,
    };
    let next = current.checked_add(delta).ok_or(DbError::Overflow)?;
    hash.insert(args[1].clone(), Bytes::from(next.to_string()));
    Ok(ExecOutcome::write(Reply::Integer(next)))
}

pub fn hincrbyfloat(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 3 {
        return Err(DbError::SyntaxError);
    }
    let delta: f64 = std::str::from_utf8(&args[2])
        .map_err(|_| DbError::NotAFloat)?
        .parse()
        .map_err(|_| DbError::NotAFloat)?;
    let hash = as_hash_mut(value)?;
    let current: f64 = match hash.get(&args[1]) {
        Some(v) => std::str::from_utf8(v).map_err(|_| DbError::NotAFloat)?.parse().map_err(|_| DbError::NotAFloat)?,
        None => 0.0,
    };
    let next = current + delta;
    let formatted = format!("{next}");
    hash.insert(args[1].clone(), Bytes::from(formatted.clone()));
    Ok(ExecOutcome::write(Reply::bulk(formatted)))
}

/// Full-dump cursor simplification (matching the aggregator's own `SCAN`):
/// every field/value pair comes back in one call and the cursor is always
/// `"0"`, so there is never a second page to ask for.
pub fn hscan(existing: Option<&Value>) -> Result<ExecOutcome, DbError> {
    let hash = existing.map(as_hash).transpose()?;
    let mut items = Vec::new();
    if let Some(hash) = hash {
        for (k, v) in hash {
            items.push(Reply::Bulk(k.clone()));
            items.push(Reply::Bulk(v.clone()));
        }
    }
    Ok(ExecOutcome::read(Reply::Array(vec![Reply::bulk(Bytes::from_static(b"0")), Reply::Array(items)])))
}

/// Internal: installs a complete field map as this key's new value, used by
/// the `RENAME` relay.
pub fn hstore(args: &[Bytes]) -> Result<(ExecOutcome, Value), DbError> {
    if args.len() % 2 != 0 {
        return Err(DbError::SyntaxError);
    }
    let mut map = IndexMap::new();
    for pair in args.chunks_exact(2) {
        map.insert(pair[0].clone(), pair[1].clone());
    }
    Ok((ExecOutcome::write(Reply::ok()), Value::Hash(map)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hset_counts_only_new_fields() {
        let mut v = Value::Hash(IndexMap::new());
        let outcome = hset(&mut v, &[Bytes::new(), Bytes::from_static(b"a"), Bytes::from_static(b"1")]).unwrap();
        assert_eq!(outcome.reply, Reply::Integer(1));
        let outcome = hset(&mut v, &[Bytes::new(), Bytes::from_static(b"a"), Bytes::from_static(b"2")]).unwrap();
        assert_eq!(outcome.reply, Reply::Integer(0));
    }

    #[test]
    fn hdel_marks_delete_when_empty() {
        let mut map = IndexMap::new();
        map.insert(Bytes::from_static(b"a"), Bytes::from_static(b"1"));
        let mut v = Value::Hash(map);
        let outcome = hdel(&mut v, &[Bytes::new(), Bytes::from_static(b"a")]).unwrap();
        assert!(outcome.delete);
    }
}
