//! The client-facing error type for the whole datastore.

use thiserror::Error;

/// All failures that can be surfaced to a connected client, plus the handful
/// of internal conditions (timeouts, task death) that get mapped onto one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("ERR syntax error")]
    SyntaxError,

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR no such key")]
    NoSuchKey,

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR value is not a valid float")]
    NotAFloat,

    #[error("ERR increment or decrement would overflow")]
    Overflow,

    #[error("ERR index out of range")]
    IndexOutOfRange,

    #[error("ERR timeout")]
    Timeout,

    #[error("ERR {0}")]
    Generic(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> Self {
        DbError::Io(e.to_string())
    }
}

impl From<std::num::ParseIntError> for DbError {
    fn from(_: std::num::ParseIntError) -> Self {
        DbError::NotAnInteger
    }
}

impl From<std::num::ParseFloatError> for DbError {
    fn from(_: std::num::ParseFloatError) -> Self {
        DbError::NotAFloat
    }
}

impl From<std::string::FromUtf8Error> for DbError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        DbError::SyntaxError
    }
}

/// A send/recv failure on an internal channel means the peer task has already
/// exited; treat that as a cancelled request rather than panicking the caller.
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for DbError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        DbError::Generic("request cancelled".into())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for DbError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        DbError::Generic("request cancelled".into())
    }
}
