//! `Reply` is the value type command execution logic actually produces. It is
//! a thin layer above `RespFrame` so ValueNodes, the KeyManager and
//! Aggregators never need to think about wire-level framing.

use super::RespFrame;
use crate::core::DbError;
use bytes::Bytes;

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple(String),
    Bulk(Bytes),
    Integer(i64),
    Nil,
    NilArray,
    Array(Vec<Reply>),
    Error(DbError),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Simple("OK".to_string())
    }

    pub fn bulk(s: impl Into<Bytes>) -> Self {
        Reply::Bulk(s.into())
    }

    pub fn bool(b: bool) -> Self {
        Reply::Integer(b as i64)
    }

    pub fn array_of_bulk<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        Reply::Array(items.into_iter().map(|i| Reply::Bulk(i.into())).collect())
    }
}

impl From<DbError> for Reply {
    fn from(e: DbError) -> Self {
        Reply::Error(e)
    }
}

impl From<Reply> for RespFrame {
    fn from(val: Reply) -> Self {
        match val {
            Reply::Simple(s) => RespFrame::SimpleString(s),
            Reply::Bulk(b) => RespFrame::BulkString(b),
            Reply::Integer(i) => RespFrame::Integer(i),
            Reply::Nil => RespFrame::Null,
            Reply::NilArray => RespFrame::NullArray,
            Reply::Array(items) => RespFrame::Array(items.into_iter().map(Into::into).collect()),
            Reply::Error(e) => RespFrame::Error(e.to_string()),
        }
    }
}
