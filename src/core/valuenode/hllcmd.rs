//! `hyperloglog`-type command execution.

use super::hll::HyperLogLog;
use super::outcome::ExecOutcome;
use super::value::Value;
use crate::core::protocol::Reply;
use crate::core::DbError;
use bytes::Bytes;

fn as_hll(value: &Value) -> Result<&HyperLogLog, DbError> {
    match value {
        Value::Hll(h) => Ok(h),
        _ => Err(DbError::WrongType),
    }
}

fn as_hll_mut(value: &mut Value) -> Result<&mut HyperLogLog, DbError> {
    match value {
        Value::Hll(h) => Ok(h),
        _ => Err(DbError::WrongType),
    }
}

pub fn pfadd(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() < 2 {
        return Err(DbError::SyntaxError);
    }
    let hll = as_hll_mut(value)?;
    let mut changed = false;
    for item in &args[1..] {
        if hll.add(item) {
            changed = true;
        }
    }
    let reply = Reply::Integer(changed as i64);
    Ok(if changed { ExecOutcome::write(reply) } else { ExecOutcome::read(reply) })
}

/// Internal: used by `PFCOUNT` on a single key, and as one input to the
/// aggregator's summed multi-key count.
pub fn pfcount(existing: Option<&Value>) -> Result<ExecOutcome, DbError> {
    let count = existing.map(as_hll).transpose()?.map(|h| h.count()).unwrap_or(0);
    Ok(ExecOutcome::read(Reply::Integer(count as i64)))
}

/// Internal: returns the serialized sketch for `PFMERGE` to fold together.
pub fn pfget(existing: Option<&Value>) -> Result<ExecOutcome, DbError> {
    let bytes = existing
        .map(as_hll)
        .transpose()?
        .map(|h| h.serialize())
        .unwrap_or_default();
    Ok(ExecOutcome::read(Reply::Bulk(bytes)))
}

/// Internal: installs a merged sketch as this key's new value.
pub fn pfstore(args: &[Bytes]) -> Result<(ExecOutcome, Value), DbError> {
    let sketch = args
        .first()
        .and_then(HyperLogLog::deserialize)
        .ok_or(DbError::SyntaxError)?;
    Ok((ExecOutcome::write(Reply::ok()), Value::Hll(sketch)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pfadd_reports_cardinality_change() {
        let mut v = Value::Hll(HyperLogLog::new());
        let outcome = pfadd(&mut v, &[Bytes::new(), Bytes::from_static(b"a")]).unwrap();
        assert_eq!(outcome.reply, Reply::Integer(1));
        let outcome = pfadd(&mut v, &[Bytes::new(), Bytes::from_static(b"a")]).unwrap();
        assert_eq!(outcome.reply, Reply::Integer(0));
    }
}
