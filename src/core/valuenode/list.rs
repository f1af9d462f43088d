//! `list`-type command execution. Blocking variants (`BLPOP`/`BRPOP`/
//! `BRPOPLPUSH`) are special-cased in the actor loop before it reaches
//! `dispatch()`: an unsatisfied pop is queued with its deadline and replayed
//! FIFO once a push grows the list, or timed out by racing the mailbox
//! against the queue's earliest deadline in `tokio::select!`. This module
//! only implements the non-blocking mechanics those requests pop against.

use super::outcome::ExecOutcome;
use super::value::Value;
use crate::core::protocol::Reply;
use crate::core::DbError;
use bytes::Bytes;
use std::collections::VecDeque;

fn as_list(value: &Value) -> Result<&VecDeque<Bytes>, DbError> {
    match value {
        Value::List(l) => Ok(l),
        _ => Err(DbError::WrongType),
    }
}

fn as_list_mut(value: &mut Value) -> Result<&mut VecDeque<Bytes>, DbError> {
    match value {
        Value::List(l) => Ok(l),
        _ => Err(DbError::WrongType),
    }
}

pub fn lpush(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() < 2 {
        return Err(DbError::SyntaxError);
    }
    let list = as_list_mut(value)?;
    for item in &args[1..] {
        list.push_front(item.clone());
    }
    Ok(ExecOutcome::write(Reply::Integer(list.len() as i64)))
}

pub fn rpush(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() < 2 {
        return Err(DbError::SyntaxError);
    }
    let list = as_list_mut(value)?;
    for item in &args[1..] {
        list.push_back(item.clone());
    }
    Ok(ExecOutcome::write(Reply::Integer(list.len() as i64)))
}

pub fn lpop(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    let list = as_list_mut(value)?;
    pop(list, args, VecDeque::pop_front)
}

pub fn rpop(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    let list = as_list_mut(value)?;
    pop(list, args, VecDeque::pop_back)
}

fn pop(
    list: &mut VecDeque<Bytes>,
    args: &[Bytes],
    take: impl Fn(&mut VecDeque<Bytes>) -> Option<Bytes>,
) -> Result<ExecOutcome, DbError> {
    let count = if args.len() > 1 {
        Some(parse_usize(&args[1])?)
    } else {
        None
    };
    match count {
        None => {
            let popped = take(list);
            let outcome = match popped {
                Some(v) => ExecOutcome::write(Reply::Bulk(v)),
                None => ExecOutcome::read(Reply::Nil),
            };
            Ok(if list.is_empty() { outcome.deleting() } else { outcome })
        }
        Some(n) => {
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                match take(list) {
                    Some(v) => items.push(Reply::Bulk(v)),
                    None => break,
                }
            }
            let outcome = if items.is_empty() {
                ExecOutcome::read(Reply::NilArray)
            } else {
                ExecOutcome::write(Reply::Array(items))
            };
            Ok(if list.is_empty() { outcome.deleting() } else { outcome })
        }
    }
}

pub fn llen(existing: Option<&Value>) -> Result<ExecOutcome, DbError> {
    let len = existing.map(as_list).transpose()?.map(|l| l.len()).unwrap_or(0);
    Ok(ExecOutcome::read(Reply::Integer(len as i64)))
}

pub fn lrange(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 3 {
        return Err(DbError::SyntaxError);
    }
    let list = existing.map(as_list).transpose()?;
    let Some(list) = list else {
        return Ok(ExecOutcome::read(Reply::Array(vec![])));
    };
    let (start, stop) = resolve_range(list.len(), parse_i64(&args[1])?, parse_i64(&args[2])?);
    let items = match (start, stop) {
        Some((s, e)) => list.iter().skip(s).take(e - s + 1).cloned().map(Reply::Bulk).collect(),
        None => vec![],
    };
    Ok(ExecOutcome::read(Reply::Array(items)))
}

pub fn ltrim(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 3 {
        return Err(DbError::SyntaxError);
    }
    let list = as_list_mut(value)?;
    let (start, stop) = resolve_range(list.len(), parse_i64(&args[1])?, parse_i64(&args[2])?);
    let kept: VecDeque<Bytes> = match (start, stop) {
        Some((s, e)) => list.iter().skip(s).take(e - s + 1).cloned().collect(),
        None => VecDeque::new(),
    };
    *list = kept;
    let outcome = ExecOutcome::write(Reply::ok());
    Ok(if list.is_empty() { outcome.deleting() } else { outcome })
}

pub fn lset(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 3 {
        return Err(DbError::SyntaxError);
    }
    let list = as_list_mut(value)?;
    let index = resolve_index(list.len(), parse_i64(&args[1])?).ok_or(DbError::IndexOutOfRange)?;
    list[index] = args[2].clone();
    Ok(ExecOutcome::write(Reply::ok()))
}

pub fn lindex(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 2 {
        return Err(DbError::SyntaxError);
    }
    let list = existing.map(as_list).transpose()?;
    let reply = list
        .and_then(|l| resolve_index(l.len(), parse_i64(&args[1]).ok()?).and_then(|i| l.get(i)))
        .map(|v| Reply::Bulk(v.clone()))
        .unwrap_or(Reply::Nil);
    Ok(ExecOutcome::read(reply))
}

pub fn lrem(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 3 {
        return Err(DbError::SyntaxError);
    }
    let count = parse_i64(&args[1])?;
    let target = &args[2];
    let list = as_list_mut(value)?;
    let mut removed = 0i64;

    if count >= 0 {
        let limit = if count == 0 { usize::MAX } else { count as usize };
        let mut kept = VecDeque::with_capacity(list.len());
        for item in list.drain(..) {
            if removed < limit as i64 && &item == target {
                removed += 1;
            } else {
                kept.push_back(item);
            }
        }
        *list = kept;
    } else {
        let limit = (-count) as usize;
        let mut kept: VecDeque<Bytes> = VecDeque::with_capacity(list.len());
        for item in list.drain(..).rev() {
            if (removed as usize) < limit && &item == target {
                removed += 1;
            } else {
                kept.push_front(item);
            }
        }
        *list = kept;
    }

    let outcome = ExecOutcome::write(Reply::Integer(removed));
    Ok(if list.is_empty() { outcome.deleting() } else { outcome })
}

pub fn linsert(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 4 {
        return Err(DbError::SyntaxError);
    }
    let before = match String::from_utf8_lossy(&args[1]).to_ascii_uppercase().as_str() {
        "BEFORE" => true,
        "AFTER" => false,
        _ => return Err(DbError::SyntaxError),
    };
    let list = as_list_mut(value)?;
    let Some(pos) = list.iter().position(|v| v == &args[2]) else {
        return Ok(ExecOutcome::read(Reply::Integer(-1)));
    };
    let insert_at = if before { pos } else { pos + 1 };
    list.insert(insert_at, args[3].clone());
    Ok(ExecOutcome::write(Reply::Integer(list.len() as i64)))
}

/// Internal: installs a complete element list as this key's new value, used
/// by the `RENAME` relay.
pub fn lstore(args: &[Bytes]) -> Result<(ExecOutcome, Value), DbError> {
    let list: VecDeque<Bytes> = args.iter().cloned().collect();
    Ok((ExecOutcome::write(Reply::ok()), Value::List(list)))
}

fn resolve_index(len: usize, index: i64) -> Option<usize> {
    let len = len as i64;
    let i = if index < 0 { len + index } else { index };
    if i < 0 || i >= len {
        None
    } else {
        Some(i as usize)
    }
}

fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    if len == 0 {
        return None;
    }
    let start = if start < 0 { (len + start).max(0) } else { start.min(len) };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

fn parse_i64(arg: &Bytes) -> Result<i64, DbError> {
    std::str::from_utf8(arg).map_err(|_| DbError::NotAnInteger)?.parse().map_err(|_| DbError::NotAnInteger)
}

fn parse_usize(arg: &Bytes) -> Result<usize, DbError> {
    std::str::from_utf8(arg).map_err(|_| DbError::NotAnInteger)?.parse().map_err(|_| DbError::NotAnInteger)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpush_then_lrange_preserves_order() {
        let mut v = Value::List(VecDeque::new());
        rpush(&mut v, &[Bytes::new(), Bytes::from_static(b"a"), Bytes::from_static(b"b")]).unwrap();
        let outcome = lrange(Some(&v), &[Bytes::new(), Bytes::from_static(b"0"), Bytes::from_static(b"-1")]).unwrap();
        assert_eq!(
            outcome.reply,
            Reply::Array(vec![Reply::bulk(Bytes::from_static(b"a")), Reply::bulk(Bytes::from_static(b"b"))])
        );
    }

    #[test]
    fn lpop_on_last_element_marks_delete() {
        let mut v = Value::List(VecDeque::from(vec![Bytes::from_static(b"only")]));
        let outcome = lpop(&mut v, &[Bytes::new()]).unwrap();
        assert!(outcome.delete);
    }

    #[test]
    fn lrem_negative_count_removes_from_tail() {
        let mut v = Value::List(VecDeque::from(vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"a"),
        ]));
        let outcome = lrem(&mut v, &[Bytes::new(), Bytes::from_static(b"-1"), Bytes::from_static(b"a")]).unwrap();
        assert_eq!(outcome.reply, Reply::Integer(1));
        assert_eq!(v, Value::List(VecDeque::from(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")])));
    }
}
