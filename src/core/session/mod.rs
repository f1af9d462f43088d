//! A persistent per-connection actor: RESP framing, command lookup, and the
//! three-way split between locally-answered "client" commands, Aggregator
//! fan-out, and single-partition routing.

mod handler;
mod state;

pub use handler::{run, SessionDeps};
