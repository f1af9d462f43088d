//! `bitmap`-type command execution: SETBIT/GETBIT/BITCOUNT/BITPOS, plus the
//! internal `_BGET`/`_BSTORE` pair the BITOP aggregator uses.

use super::outcome::ExecOutcome;
use super::value::Value;
use crate::core::protocol::Reply;
use crate::core::DbError;
use bytes::Bytes;

fn as_bitmap(value: &Value) -> Result<&Vec<u8>, DbError> {
    match value {
        Value::Bitmap(b) => Ok(b),
        _ => Err(DbError::WrongType),
    }
}

fn as_bitmap_mut(value: &mut Value) -> Result<&mut Vec<u8>, DbError> {
    match value {
        Value::Bitmap(b) => Ok(b),
        _ => Err(DbError::WrongType),
    }
}

fn parse_usize(arg: &Bytes) -> Result<usize, DbError> {
    std::str::from_utf8(arg)
        .map_err(|_| DbError::NotAnInteger)?
        .parse()
        .map_err(|_| DbError::NotAnInteger)
}

fn parse_i64(arg: &Bytes) -> Result<i64, DbError> {
    std::str::from_utf8(arg)
        .map_err(|_| DbError::NotAnInteger)?
        .parse()
        .map_err(|_| DbError::NotAnInteger)
}

pub fn setbit(value: &mut Value, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 3 {
        return Err(DbError::SyntaxError);
    }
    let offset = parse_usize(&args[1])?;
    let bit = parse_usize(&args[2])?;
    if bit != 0 && bit != 1 {
        return Err(DbError::SyntaxError);
    }
    let bitmap = as_bitmap_mut(value)?;
    let byte_idx = offset / 8;
    let bit_idx = 7 - (offset % 8);
    if bitmap.len() <= byte_idx {
        bitmap.resize(byte_idx + 1, 0);
    }
    let old = (bitmap[byte_idx] >> bit_idx) & 1;
    if bit == 1 {
        bitmap[byte_idx] |= 1 << bit_idx;
    } else {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
    Ok(ExecOutcome::write(Reply::Integer(old as i64)))
}

pub fn getbit(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() != 2 {
        return Err(DbError::SyntaxError);
    }
    let offset = parse_usize(&args[1])?;
    let bitmap = existing.map(as_bitmap).transpose()?;
    let bit = bitmap
        .and_then(|b| {
            let byte_idx = offset / 8;
            b.get(byte_idx).map(|byte| (byte >> (7 - (offset % 8))) & 1)
        })
        .unwrap_or(0);
    Ok(ExecOutcome::read(Reply::Integer(bit as i64)))
}

pub fn bitcount(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    let bitmap = existing.map(as_bitmap).transpose()?.cloned().unwrap_or_default();
    let (start, end) = if args.len() >= 3 {
        (parse_i64(&args[1])?, parse_i64(&args[2])?)
    } else {
        (0, -1)
    };
    let len = bitmap.len() as i64;
    if len == 0 {
        return Ok(ExecOutcome::read(Reply::Integer(0)));
    }
    let start = if start < 0 { (len + start).max(0) } else { start.min(len) };
    let end = if end < 0 { len + end } else { end.min(len - 1) };
    if start > end || start >= len || end < 0 {
        return Ok(ExecOutcome::read(Reply::Integer(0)));
    }
    let count: u32 = bitmap[start as usize..=end as usize]
        .iter()
        .map(|b| b.count_ones())
        .sum();
    Ok(ExecOutcome::read(Reply::Integer(count as i64)))
}

pub fn bitpos(existing: Option<&Value>, args: &[Bytes]) -> Result<ExecOutcome, DbError> {
    if args.len() < 2 {
        return Err(DbError::SyntaxError);
    }
    let target_bit = parse_usize(&args[1])?;
    if target_bit != 0 && target_bit != 1 {
        return Err(DbError::SyntaxError);
    }
    let bitmap = existing.map(as_bitmap).transpose()?.cloned().unwrap_or_default();
    let len = bitmap.len() as i64;
    let range_given = args.len() >= 3;
    let start = if args.len() >= 3 { parse_i64(&args[2])? } else { 0 };
    let end = if args.len() >= 4 { parse_i64(&args[3])? } else { -1 };
    let start = if start < 0 { (len + start).max(0) } else { start.min(len) };
    let end = if end < 0 { len + end } else { end.min(len - 1) };

    if len == 0 || start > end || start >= len {
        return Ok(ExecOutcome::read(Reply::Integer(if target_bit == 0 && !range_given { 0 } else { -1 })));
    }

    for byte_idx in start as usize..=(end as usize) {
        let byte = bitmap[byte_idx];
        for bit_in_byte in 0..8 {
            let bit = (byte >> (7 - bit_in_byte)) & 1;
            if bit as usize == target_bit {
                return Ok(ExecOutcome::read(Reply::Integer((byte_idx * 8 + bit_in_byte) as i64)));
            }
        }
    }
    // Searching for a 0 past an all-ones buffer conceptually finds the first
    // bit beyond it, unless the caller pinned an explicit range.
    if target_bit == 0 && !range_given {
        return Ok(ExecOutcome::read(Reply::Integer(len * 8)));
    }
    Ok(ExecOutcome::read(Reply::Integer(-1)))
}

/// Internal: returns the raw bitmap bytes for the BITOP aggregator to combine.
pub fn bget(existing: Option<&Value>) -> Result<ExecOutcome, DbError> {
    let bitmap = existing.map(as_bitmap).transpose()?.cloned().unwrap_or_default();
    Ok(ExecOutcome::read(Reply::bulk(Bytes::from(bitmap))))
}

/// Internal: installs a BITOP-combined bitmap as this key's new value.
pub fn bstore(args: &[Bytes]) -> Result<(ExecOutcome, Value), DbError> {
    let bytes = args.first().cloned().unwrap_or_default();
    let len = bytes.len() as i64;
    Ok((
        ExecOutcome::write(Reply::Integer(len)),
        Value::Bitmap(bytes.to_vec()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setbit_then_getbit_round_trips() {
        let mut v = Value::Bitmap(Vec::new());
        setbit(&mut v, &[Bytes::new(), Bytes::from_static(b"7"), Bytes::from_static(b"1")]).unwrap();
        let outcome = getbit(Some(&v), &[Bytes::new(), Bytes::from_static(b"7")]).unwrap();
        assert_eq!(outcome.reply, Reply::Integer(1));
    }

    #[test]
    fn bitcount_counts_set_bits() {
        let v = Value::Bitmap(vec![0xff, 0x00]);
        let outcome = bitcount(Some(&v), &[]).unwrap();
        assert_eq!(outcome.reply, Reply::Integer(8));
    }

    #[test]
    fn bitpos_finds_first_set_bit() {
        let v = Value::Bitmap(vec![0x00, 0x0f]);
        let outcome = bitpos(Some(&v), &[Bytes::new(), Bytes::from_static(b"1")]).unwrap();
        assert_eq!(outcome.reply, Reply::Integer(12));
    }
}
