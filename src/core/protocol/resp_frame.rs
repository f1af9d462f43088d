//! Implements the RESP1-style frame structure and the `Encoder`/`Decoder` used
//! on the client-facing TCP stream. Typed frames (`+`/`-`/`:`/`$`/`*`) and the
//! inline (whitespace-split) form are both accepted on input; only typed
//! frames are ever emitted.

use crate::core::DbError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

/// Hard ceilings so a malformed or hostile frame can't force an unbounded
/// allocation before we've even dispatched a command.
const MAX_FRAME_ELEMENTS: usize = 1_024 * 1_024;
const MAX_BULK_STRING_SIZE: usize = 512 * 1024 * 1024;

/// The wire-level representation of a single RESP frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Null,
    NullArray,
    Array(Vec<RespFrame>),
}

impl RespFrame {
    /// Every decoded command, typed or inline, is normalized to this shape:
    /// an array of bulk strings. Returns `None` for anything else (e.g. a
    /// bare `+OK\r\n` arriving on the wrong side of the connection).
    pub fn into_command_args(self) -> Option<Vec<Bytes>> {
        match self {
            RespFrame::Array(items) => items
                .into_iter()
                .map(|f| match f {
                    RespFrame::BulkString(b) => Some(b),
                    RespFrame::SimpleString(s) => Some(Bytes::from(s)),
                    RespFrame::Integer(i) => Some(Bytes::from(i.to_string())),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct RespCodec;

impl Encoder<RespFrame> for RespCodec {
    type Error = DbError;

    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(item, dst);
        Ok(())
    }
}

fn encode_frame(item: RespFrame, dst: &mut BytesMut) {
    match item {
        RespFrame::SimpleString(s) => {
            dst.extend_from_slice(b"+");
            dst.extend_from_slice(s.as_bytes());
            dst.extend_from_slice(CRLF);
        }
        RespFrame::Error(s) => {
            dst.extend_from_slice(b"-");
            dst.extend_from_slice(s.as_bytes());
            dst.extend_from_slice(CRLF);
        }
        RespFrame::Integer(i) => {
            dst.extend_from_slice(b":");
            let mut buf = itoa::Buffer::new();
            dst.extend_from_slice(buf.format(i).as_bytes());
            dst.extend_from_slice(CRLF);
        }
        RespFrame::BulkString(b) => {
            dst.extend_from_slice(b"$");
            dst.extend_from_slice(b.len().to_string().as_bytes());
            dst.extend_from_slice(CRLF);
            dst.extend_from_slice(&b);
            dst.extend_from_slice(CRLF);
        }
        RespFrame::Null => dst.extend_from_slice(b"$-1\r\n"),
        RespFrame::NullArray => dst.extend_from_slice(b"*-1\r\n"),
        RespFrame::Array(items) => {
            dst.extend_from_slice(b"*");
            dst.extend_from_slice(items.len().to_string().as_bytes());
            dst.extend_from_slice(CRLF);
            for item in items {
                encode_frame(item, dst);
            }
        }
    }
}

impl Decoder for RespCodec {
    type Item = RespFrame;
    type Error = DbError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let result = if is_typed_prefix(src[0]) {
            parse_frame(src)
        } else {
            parse_inline(src)
        };
        match result {
            Ok((frame, len)) => {
                src.advance(len);
                Ok(Some(frame))
            }
            Err(FrameError::Incomplete) => Ok(None),
            Err(FrameError::Invalid(e)) => Err(e),
        }
    }
}

/// Parsing outcome distinct from `DbError`: "need more bytes" must never be
/// mistaken for a protocol error that should close the connection.
enum FrameError {
    Incomplete,
    Invalid(DbError),
}

impl From<DbError> for FrameError {
    fn from(e: DbError) -> Self {
        FrameError::Invalid(e)
    }
}

fn incomplete<T>() -> Result<T, FrameError> {
    Err(FrameError::Incomplete)
}

fn is_typed_prefix(b: u8) -> bool {
    matches!(b, b'+' | b'-' | b':' | b'$' | b'*')
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(CRLF_LEN).position(|w| w == CRLF)
}

fn parse_line(src: &[u8]) -> Result<(&[u8], usize), FrameError> {
    match find_crlf(src) {
        Some(pos) => Ok((&src[..pos], pos + CRLF_LEN)),
        None => incomplete(),
    }
}

/// Inline commands are a single line split on runs of whitespace, e.g. `PING\r\n`
/// or `SET foo bar\r\n`. An empty line decodes to an empty array (a no-op).
fn parse_inline(src: &[u8]) -> Result<(RespFrame, usize), FrameError> {
    let (line, len) = parse_line(src)?;
    let args = line
        .split(|&b| b == b' ' || b == b'\t')
        .filter(|s| !s.is_empty())
        .map(|s| RespFrame::BulkString(Bytes::copy_from_slice(s)))
        .collect();
    Ok((RespFrame::Array(args), len))
}

fn parse_frame(src: &[u8]) -> Result<(RespFrame, usize), FrameError> {
    if src.is_empty() {
        return incomplete();
    }
    match src[0] {
        b'+' => parse_simple_string(src),
        b'-' => parse_error(src),
        b':' => parse_integer(src),
        b'$' => parse_bulk_string(src),
        b'*' => parse_array(src),
        _ => Err(DbError::SyntaxError.into()),
    }
}

fn parse_simple_string(src: &[u8]) -> Result<(RespFrame, usize), FrameError> {
    let (line, len) = parse_line(&src[1..])?;
    Ok((
        RespFrame::SimpleString(String::from_utf8_lossy(line).to_string()),
        len + 1,
    ))
}

fn parse_error(src: &[u8]) -> Result<(RespFrame, usize), FrameError> {
    let (line, len) = parse_line(&src[1..])?;
    Ok((
        RespFrame::Error(String::from_utf8_lossy(line).to_string()),
        len + 1,
    ))
}

fn parse_integer(src: &[u8]) -> Result<(RespFrame, usize), FrameError> {
    let (line, len) = parse_line(&src[1..])?;
    let i = String::from_utf8_lossy(line)
        .parse::<i64>()
        .map_err(|_| FrameError::Invalid(DbError::SyntaxError))?;
    Ok((RespFrame::Integer(i), len + 1))
}

fn parse_bulk_string(src: &[u8]) -> Result<(RespFrame, usize), FrameError> {
    let (line, len_of_line) = parse_line(&src[1..])?;
    let str_len = String::from_utf8_lossy(line)
        .parse::<isize>()
        .map_err(|_| FrameError::Invalid(DbError::SyntaxError))?;

    if str_len == -1 {
        return Ok((RespFrame::Null, len_of_line + 1));
    }
    if str_len < 0 {
        return Err(DbError::SyntaxError.into());
    }
    let str_len = str_len as usize;
    if str_len > MAX_BULK_STRING_SIZE {
        return Err(DbError::SyntaxError.into());
    }

    let prefix_len = len_of_line + 1;
    if src.len() < prefix_len + str_len + CRLF_LEN {
        return incomplete();
    }
    if &src[prefix_len + str_len..prefix_len + str_len + CRLF_LEN] != CRLF {
        return Err(DbError::SyntaxError.into());
    }

    let data = Bytes::copy_from_slice(&src[prefix_len..prefix_len + str_len]);
    Ok((RespFrame::BulkString(data), prefix_len + str_len + CRLF_LEN))
}

fn parse_array(src: &[u8]) -> Result<(RespFrame, usize), FrameError> {
    let (line, len_of_line) = parse_line(&src[1..])?;
    let arr_len = String::from_utf8_lossy(line)
        .parse::<isize>()
        .map_err(|_| FrameError::Invalid(DbError::SyntaxError))?;

    if arr_len == -1 {
        return Ok((RespFrame::NullArray, len_of_line + 1));
    }
    if arr_len < 0 {
        return Err(DbError::SyntaxError.into());
    }
    let arr_len = arr_len as usize;
    if arr_len > MAX_FRAME_ELEMENTS {
        return Err(DbError::SyntaxError.into());
    }

    let mut items = Vec::with_capacity(arr_len);
    let mut cursor = len_of_line + 1;
    for _ in 0..arr_len {
        let (frame, frame_len) = parse_frame(&src[cursor..])?;
        items.push(frame);
        cursor += frame_len;
    }
    Ok((RespFrame::Array(items), cursor))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> RespFrame {
        let mut buf = BytesMut::from(bytes);
        let mut codec = RespCodec;
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn decodes_typed_array() {
        let frame = decode_one(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
        let args = frame.into_command_args().unwrap();
        assert_eq!(args, vec![Bytes::from("GET"), Bytes::from("foo")]);
    }

    #[test]
    fn decodes_inline_command() {
        let frame = decode_one(b"SET  foo   bar\r\n");
        let args = frame.into_command_args().unwrap();
        assert_eq!(
            args,
            vec![Bytes::from("SET"), Bytes::from("foo"), Bytes::from("bar")]
        );
    }

    #[test]
    fn incomplete_frame_waits_for_more_data() {
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$3\r\nfo"[..]);
        let mut codec = RespCodec;
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn round_trips_bulk_and_array() {
        let frame = RespFrame::Array(vec![
            RespFrame::BulkString(Bytes::from("a")),
            RespFrame::Integer(7),
            RespFrame::Null,
        ]);
        let mut buf = BytesMut::new();
        let mut codec = RespCodec;
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = decode_one(&buf);
        assert_eq!(decoded, frame);
    }
}
