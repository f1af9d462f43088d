//! `string`-type command execution: GET/SET and friends, plus INCR/APPEND.

use super::outcome::{ExecOutcome, TtlAction};
use super::value::{now_ms, Value};
use crate::core::protocol::Reply;
use crate::core::DbError;
use bytes::Bytes;

fn as_str(value: &Value) -> Result<&Bytes, DbError> {
    match value {
        Value::Str(b) => Ok(b),
        _ => Err(DbError::WrongType),
    }
}

fn as_str_mut(value: &mut Value) -> Result<&mut Bytes, DbError> {
    match value {
        Value::Str(b) => Ok(b),
        _ => Err(DbError::WrongType),
    }
}

/// `SET key value [EX s|PX ms|EXAT ts|PXAT ts|KEEPTTL] [NX|XX] [GET]`.
/// Descriptor-level overwrite already guarantees the caller may replace any
/// existing type, so this always succeeds unless `NX`/`XX` veto it.
pub fn set(existing: Option<&Value>, args: &[Bytes]) -> Result<(ExecOutcome, Option<Value>), DbError> {
    if args.len() < 2 {
        return Err(DbError::SyntaxError);
    }
    let value = args[1].clone();

    let mut ttl = TtlAction::Clear;
    let mut nx = false;
    let mut xx = false;
    let mut get = false;
    let mut i = 2;
    while i < args.len() {
        let opt = String::from_utf8_lossy(&args[i]).to_ascii_uppercase();
        match opt.as_str() {
            "EX" => {
                let secs: i64 = parse_arg(args.get(i + 1))?;
                ttl = TtlAction::SetAt(now_ms() + secs * 1000);
                i += 2;
            }
            "PX" => {
                let ms: i64 = parse_arg(args.get(i + 1))?;
                ttl = TtlAction::SetAt(now_ms() + ms);
                i += 2;
            }
            "EXAT" => {
                let secs: i64 = parse_arg(args.get(i + 1))?;
                ttl = TtlAction::SetAt(secs * 1000);
                i += 2;
            }
            "PXAT" => {
                let ms: i64 = parse_arg(args.get(i + 1))?;
                ttl = TtlAction::SetAt(ms);
                i += 2;
            }
            "KEEPTTL" => {
                ttl = TtlAction::Keep;
                i += 1;
            }
            "NX" => {
                nx = true;
                i += 1;
            }
            "XX" => {
                xx = true;
                i += 1;
            }
            "GET" => {
                get = true;
                i += 1;
            }
            _ => return Err(DbError::SyntaxError),
        }
    }
    if nx && xx {
        return Err(DbError::SyntaxError);
    }

    // Only a same-typed old value is meaningful for `GET`; a type mismatch
    // under the `overwrites` flag just means "no previous string to return".
    let old = existing.and_then(|v| as_str(v).ok()).cloned();
    if (nx && existing.is_some()) || (xx && existing.is_none()) {
        let reply = if get {
            old.map(Reply::Bulk).unwrap_or(Reply::Nil)
        } else {
            Reply::Nil
        };
        return Ok((ExecOutcome::read(reply), None));
    }

    let reply = if get {
        old.map(Reply::Bulk).unwrap_or(Reply::Nil)
    } else {
        Reply::ok()
    };
    Ok((
        ExecOutcome {
            reply,
            mutated: true,
            delete: false,
            ttl,
        },
        Some(Value::Str(value)),
    ))
}

pub fn get(existing: Option<&Value>) -> Result<ExecOutcome, DbError> {
    match existing {
        None => Ok(ExecOutcome::read(Reply::Nil)),
        Some(v) => Ok(ExecOutcome::read(Reply::Bulk(as_str(v)?.clone()))),
    }
}

pub fn setnx(existing: Option<&Value>, args: &[Bytes]) -> Result<(ExecOutcome, Option<Value>), DbError> {
    if args.len() != 2 {
        return Err(DbError::SyntaxError);
    }
    if existing.is_some() {
        return Ok((ExecOutcome::read(Reply::Integer(0)), None));
    }
    Ok((
        ExecOutcome::write(Reply::Integer(1)),
        Some(Value::Str(args[1].clone())),
    ))
}

pub fn getset(existing: Option<&Value>, args: &[Bytes]) -> Result<(ExecOutcome, Option<Value>), DbError> {
    if args.len() != 2 {
        return Err(DbError::SyntaxError);
    }
    let old = existing.and_then(|v| as_str(v).ok()).cloned();
    let reply = old.map(Reply::Bulk).unwrap_or(Reply::Nil);
    Ok((
        ExecOutcome::write(reply).with_ttl(TtlAction::Clear),
        Some(Value::Str(args[1].clone())),
    ))
}

pub fn append(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 2 {
        return Err(DbError::SyntaxError);
    }
    let s = as_str_mut(value)?;
    let mut buf = s.to_vec();
    buf.extend_from_slice(&args[1]);
    *s = Bytes::from(buf);
    Ok(ExecOutcome::write(Reply::Integer(s.len() as i64)))
}

pub fn strlen(existing: Option<&Value>) -> Result<ExecOutcome, DbError> {
    let len = existing.map(as_str).transpose()?.map(|b| b.len()).unwrap_or(0);
    Ok(ExecOutcome::read(Reply::Integer(len as i64)))
}

pub fn getrange(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 3 {
        return Err(DbError::SyntaxError);
    }
    let s = existing.map(as_str).transpose()?.cloned().unwrap_or_default();
    let start: i64 = parse_arg(Some(&args[1]))?;
    let end: i64 = parse_arg(Some(&args[2]))?;
    let len = s.len() as i64;
    if len == 0 {
        return Ok(ExecOutcome::read(Reply::bulk(Bytes::new())));
    }
    let mut start = if start < 0 { (len + start).max(0) } else { start.min(len) };
    let mut end = if end < 0 { len + end } else { end.min(len - 1) };
    if start > end || start >= len {
        return Ok(ExecOutcome::read(Reply::bulk(Bytes::new())));
    }
    if end < 0 {
        end = 0;
    }
    if start < 0 {
        start = 0;
    }
    let slice = s.slice(start as usize..=end as usize);
    Ok(ExecOutcome::read(Reply::Bulk(slice)))
}

pub fn setrange(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 3 {
        return Err(DbError::SyntaxError);
    }
    let offset: usize = parse_arg(Some(&args[1]))?;
    let patch = &args[2];
    let s = as_str_mut(value)?;
    let mut buf = s.to_vec();
    if buf.len() < offset + patch.len() {
        buf.resize(offset + patch.len(), 0);
    }
    buf[offset..offset + patch.len()].copy_from_slice(patch);
    *s = Bytes::from(buf);
    Ok(ExecOutcome::write(Reply::Integer(s.len() as i64)))
}

pub fn incr_by(value: &mut Value, delta: i64) -> Result<ExecOutcome, DbError> {
    let s = as_str_mut(value)?;
    let current: i64 = if s.is_empty() {
        0
    } else {
        String::from_utf8_lossy(s)
            .parse()
            .map_err(|_| DbError::NotAnInteger)?
    };
    let next = current.checked_add(delta).ok_or(DbError::Overflow)?;
    *s = Bytes::from(next.to_string());
    Ok(ExecOutcome::write(Reply::Integer(next)))
}

pub fn incr_by_float(value: &mut Value, delta: f64) -> Result<ExecOutcome, DbError> {
    let s = as_str_mut(value)?;
    let current: f64 = if s.is_empty() {
        0.0
    } else {
        String::from_utf8_lossy(s)
            .parse()
            .map_err(|_| DbError::NotAFloat)?
    };
    let next = current + delta;
    let formatted = format_float(next);
    *s = Bytes::from(formatted.clone());
    Ok(ExecOutcome::write(Reply::bulk(formatted)))
}

fn format_float(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e17 {
        format!("{}", f as i64)
    } else {
        let mut buf = ryu::Buffer::new();
        buf.format(f).trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

fn parse_arg<T: std::str::FromStr>(arg: Option<&Bytes>) -> Result<T, DbError> {
    let arg = arg.ok_or(DbError::SyntaxError)?;
    std::str::from_utf8(arg)
        .map_err(|_| DbError::SyntaxError)?
        .parse()
        .map_err(|_| DbError::SyntaxError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_on_missing_is_nil() {
        let outcome = get(None).unwrap();
        assert_eq!(outcome.reply, Reply::Nil);
    }

    #[test]
    fn append_extends_existing_string() {
        let mut v = Value::Str(Bytes::from_static(b"hello"));
        let outcome = append(&mut v, &[Bytes::new(), Bytes::from_static(b" world")]).unwrap();
        assert_eq!(outcome.reply, Reply::Integer(11));
        assert_eq!(v, Value::Str(Bytes::from_static(b"hello world")));
    }

    #[test]
    fn incr_by_rejects_non_integer() {
        let mut v = Value::Str(Bytes::from_static(b"not-a-number"));
        assert!(matches!(incr_by(&mut v, 1), Err(DbError::NotAnInteger)));
    }

    #[test]
    fn getrange_handles_negative_indices() {
        let v = Value::Str(Bytes::from_static(b"Hello World"));
        let outcome = getrange(Some(&v), &[Bytes::new(), Bytes::from_static(b"-5"), Bytes::from_static(b"-1")]).unwrap();
        assert_eq!(outcome.reply, Reply::bulk(Bytes::from_static(b"World")));
    }
}
