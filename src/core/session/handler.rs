//! The per-connection actor: frames the socket, looks up each command's
//! descriptor, and either answers it locally, fans it out through an
//! Aggregator, or routes it to the owning partition. Mirrors the command
//! path laid out for `ConnectionHandler` in the teacher repo, minus
//! replication/TLS/ACL, which this system does not have.

use super::state::SessionState;
use crate::core::aggregator::{self, AggregatorDeps};
use crate::core::command::{lookup, NodeType, Payload, PubSubPush, PubSubSubscription};
use crate::core::protocol::{Reply, RespCodec, RespFrame};
use crate::core::router::Router;
use crate::core::DbError;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Everything a session needs to act on a command: where to route it and how
/// long an aggregator is allowed to take.
#[derive(Clone)]
pub struct SessionDeps {
    pub router: Arc<Router>,
    pub aggregator_timeout: Duration,
    pub db_count: usize,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// Runs one client connection to completion. Consumes the socket; returns
/// when the peer disconnects, QUITs, or the process-wide shutdown fires.
pub async fn run(stream: TcpStream, addr: SocketAddr, session_id: u64, deps: SessionDeps) {
    let span = tracing::info_span!("session", id = session_id);
    let _enter = span.enter();
    info!(%addr, "client connected");

    let mut framed = Framed::new(stream, RespCodec);
    let mut state = SessionState::new();
    let (push_tx, mut push_rx) = mpsc::channel::<PubSubPush>(256);
    let mut shutdown_rx = deps.shutdown_tx.subscribe();

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                let _ = framed.send(RespFrame::Error("SHUTDOWN server is shutting down".into())).await;
                break;
            }
            push = push_rx.recv() => {
                let Some(push) = push else { continue };
                if framed.send(encode_push(push).into()).await.is_err() {
                    break;
                }
            }
            frame = framed.next() => {
                match frame {
                    Some(Ok(frame)) => {
                        let Some(args) = frame.into_command_args() else { continue };
                        if args.is_empty() {
                            continue;
                        }
                        let reply = dispatch(&args, session_id, &push_tx, &mut state, &deps).await;
                        if framed.send(reply.into()).await.is_err() {
                            break;
                        }
                        if state.quit {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(%addr, error = %e, "connection error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    cleanup(session_id, &deps.router, &mut state).await;
    info!(%addr, "client disconnected");
}

fn encode_push(push: PubSubPush) -> Reply {
    match push {
        PubSubPush::Message { channel, payload } => {
            Reply::Array(vec![Reply::bulk("message"), Reply::bulk(channel), Reply::bulk(payload)])
        }
        PubSubPush::PMessage { pattern, channel, payload } => Reply::Array(vec![
            Reply::bulk("pmessage"),
            Reply::bulk(pattern),
            Reply::bulk(channel),
            Reply::bulk(payload),
        ]),
    }
}

async fn dispatch(
    args: &[Bytes],
    session_id: u64,
    push_tx: &mpsc::Sender<PubSubPush>,
    state: &mut SessionState,
    deps: &SessionDeps,
) -> Reply {
    let name = String::from_utf8_lossy(&args[0]).to_ascii_lowercase();
    let rest = &args[1..];

    match name.as_str() {
        "subscribe" | "psubscribe" if rest.is_empty() => {
            return Reply::from(DbError::WrongArity(name));
        }
        "subscribe" | "unsubscribe" | "psubscribe" | "punsubscribe" => {
            return handle_subscription_command(&name, rest, session_id, push_tx, state, deps).await;
        }
        _ => {}
    }

    let Some(spec) = lookup(&name) else {
        return Reply::from(DbError::UnknownCommand(name));
    };
    if !spec.args.matches(rest.len()) {
        return Reply::from(DbError::WrongArity(name));
    }

    match spec.node_type {
        NodeType::Client => exec_client_command(&name, rest, state, deps),
        NodeType::Aggregate => {
            let key = rest.first().cloned().unwrap_or_default();
            let (payload, rx) = Payload::new(state.db, name.clone(), key, rest.to_vec());
            aggregator::spawn(payload, AggregatorDeps { router: deps.router.clone(), timeout: deps.aggregator_timeout });
            rx.await.unwrap_or_else(|_| Reply::from(DbError::Generic("aggregator vanished".into())))
        }
        _ => {
            let Some(key) = (if spec.keyed { rest.first().cloned() } else { Some(Bytes::new()) }) else {
                return Reply::from(DbError::SyntaxError);
            };
            let (payload, rx) = Payload::new(state.db, name.clone(), key, rest.to_vec());
            match deps.router.route(payload).await {
                Ok(()) => rx.await.unwrap_or_else(|_| Reply::from(DbError::Generic("partition vanished".into()))),
                Err(e) => Reply::from(e),
            }
        }
    }
}

fn exec_client_command(name: &str, rest: &[Bytes], state: &mut SessionState, deps: &SessionDeps) -> Reply {
    match name {
        "ping" => rest.first().cloned().map(Reply::Bulk).unwrap_or_else(|| Reply::Simple("PONG".into())),
        "echo" => Reply::Bulk(rest[0].clone()),
        "select" => match std::str::from_utf8(&rest[0]).ok().and_then(|s| s.parse::<usize>().ok()) {
            Some(db) if db < deps.db_count => {
                state.db = db;
                Reply::ok()
            }
            _ => Reply::from(DbError::Generic("DB index is out of range".into())),
        },
        "time" => {
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
            Reply::array_of_bulk([now.as_secs().to_string(), now.subsec_micros().to_string()])
        }
        "quit" => {
            state.quit = true;
            Reply::ok()
        }
        "shutdown" => {
            let _ = deps.shutdown_tx.send(());
            state.quit = true;
            Reply::ok()
        }
        _ => Reply::from(DbError::UnknownCommand(name.to_string())),
    }
}

async fn handle_subscription_command(
    name: &str,
    rest: &[Bytes],
    session_id: u64,
    push_tx: &mpsc::Sender<PubSubPush>,
    state: &mut SessionState,
    deps: &SessionDeps,
) -> Reply {
    match name {
        "subscribe" => {
            let mut acks = Vec::with_capacity(rest.len());
            for channel in rest {
                subscribe_channel(channel.clone(), session_id, push_tx.clone(), deps).await;
                state.subscribed_channels.insert(channel.clone());
                acks.push(Reply::Array(vec![
                    Reply::bulk("subscribe"),
                    Reply::Bulk(channel.clone()),
                    Reply::Integer(state.total_subscriptions() as i64),
                ]));
            }
            Reply::Array(acks)
        }
        "psubscribe" => {
            let mut acks = Vec::with_capacity(rest.len());
            for pattern in rest {
                subscribe_pattern(pattern.clone(), session_id, push_tx.clone(), deps).await;
                state.subscribed_patterns.insert(pattern.clone());
                acks.push(Reply::Array(vec![
                    Reply::bulk("psubscribe"),
                    Reply::Bulk(pattern.clone()),
                    Reply::Integer(state.total_subscriptions() as i64),
                ]));
            }
            Reply::Array(acks)
        }
        "unsubscribe" => {
            let targets: Vec<Bytes> = if rest.is_empty() {
                state.subscribed_channels.iter().cloned().collect()
            } else {
                rest.to_vec()
            };
            let mut acks = Vec::with_capacity(targets.len().max(1));
            for channel in targets {
                unsubscribe_channel(channel.clone(), session_id, &deps.router).await;
                state.subscribed_channels.remove(&channel);
                acks.push(Reply::Array(vec![
                    Reply::bulk("unsubscribe"),
                    Reply::Bulk(channel),
                    Reply::Integer(state.total_subscriptions() as i64),
                ]));
            }
            if acks.is_empty() {
                acks.push(Reply::Array(vec![
                    Reply::bulk("unsubscribe"),
                    Reply::Nil,
                    Reply::Integer(state.total_subscriptions() as i64),
                ]));
            }
            Reply::Array(acks)
        }
        "punsubscribe" => {
            let targets: Vec<Bytes> = if rest.is_empty() {
                state.subscribed_patterns.iter().cloned().collect()
            } else {
                rest.to_vec()
            };
            let mut acks = Vec::with_capacity(targets.len().max(1));
            for pattern in targets {
                unsubscribe_pattern(pattern.clone(), session_id, &deps.router).await;
                state.subscribed_patterns.remove(&pattern);
                acks.push(Reply::Array(vec![
                    Reply::bulk("punsubscribe"),
                    Reply::Bulk(pattern),
                    Reply::Integer(state.total_subscriptions() as i64),
                ]));
            }
            if acks.is_empty() {
                acks.push(Reply::Array(vec![
                    Reply::bulk("punsubscribe"),
                    Reply::Nil,
                    Reply::Integer(state.total_subscriptions() as i64),
                ]));
            }
            Reply::Array(acks)
        }
        _ => unreachable!("only called for (un)subscribe commands"),
    }
}

async fn subscribe_channel(channel: Bytes, session_id: u64, push_tx: mpsc::Sender<PubSubPush>, deps: &SessionDeps) {
    let sub = PubSubSubscription { subscriber_id: session_id, push: Some(push_tx) };
    let (payload, rx) = Payload::new(0, "_subscribe", channel, vec![]);
    let payload = payload.with_pubsub(sub);
    if deps.router.route(payload).await.is_ok() {
        let _ = rx.await;
    }
}

async fn unsubscribe_channel(channel: Bytes, session_id: u64, router: &Router) {
    let sub = PubSubSubscription { subscriber_id: session_id, push: None };
    let (payload, rx) = Payload::new(0, "_unsubscribe", channel, vec![]);
    let payload = payload.with_pubsub(sub);
    if router.route(payload).await.is_ok() {
        let _ = rx.await;
    }
}

async fn subscribe_pattern(pattern: Bytes, session_id: u64, push_tx: mpsc::Sender<PubSubPush>, deps: &SessionDeps) {
    let mut rxs = Vec::new();
    for partition in deps.router.partitions() {
        let sub = PubSubSubscription { subscriber_id: session_id, push: Some(push_tx.clone()) };
        let (payload, rx) = Payload::new(0, "_psubscribe", pattern.clone(), vec![]);
        let payload = payload.with_pubsub(sub);
        if deps.router.send_to(partition, payload).await.is_ok() {
            rxs.push(rx);
        }
    }
    for rx in rxs {
        let _ = rx.await;
    }
}

async fn unsubscribe_pattern(pattern: Bytes, session_id: u64, router: &Router) {
    let mut rxs = Vec::new();
    for partition in router.partitions() {
        let sub = PubSubSubscription { subscriber_id: session_id, push: None };
        let (payload, rx) = Payload::new(0, "_punsubscribe", pattern.clone(), vec![]);
        let payload = payload.with_pubsub(sub);
        if router.send_to(partition, payload).await.is_ok() {
            rxs.push(rx);
        }
    }
    for rx in rxs {
        let _ = rx.await;
    }
}

/// Routes unsubscribes for every channel/pattern still held when the
/// connection ends, whether by QUIT or peer close.
async fn cleanup(session_id: u64, router: &Arc<Router>, state: &mut SessionState) {
    for channel in state.subscribed_channels.drain().collect::<Vec<_>>() {
        unsubscribe_channel(channel, session_id, router).await;
    }
    for pattern in state.subscribed_patterns.drain().collect::<Vec<_>>() {
        unsubscribe_pattern(pattern, session_id, router).await;
    }
    debug!("subscriptions cleaned up");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_deps() -> SessionDeps {
        let (tx, _rx) = mpsc::channel(8);
        SessionDeps {
            router: Arc::new(Router::new(vec![tx])),
            aggregator_timeout: Duration::from_millis(50),
            db_count: 16,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    async fn run_dispatch(args: &[&str], state: &mut SessionState, deps: &SessionDeps) -> Reply {
        let (push_tx, _push_rx) = mpsc::channel(8);
        let args: Vec<Bytes> = args.iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect();
        dispatch(&args, 1, &push_tx, state, deps).await
    }

    #[tokio::test]
    async fn ping_without_argument_replies_pong() {
        let deps = test_deps();
        let mut state = SessionState::new();
        assert_eq!(run_dispatch(&["PING"], &mut state, &deps).await, Reply::Simple("PONG".into()));
    }

    #[tokio::test]
    async fn echo_replies_with_its_argument() {
        let deps = test_deps();
        let mut state = SessionState::new();
        let reply = run_dispatch(&["ECHO", "hi"], &mut state, &deps).await;
        assert_eq!(reply, Reply::Bulk(Bytes::from_static(b"hi")));
    }

    #[tokio::test]
    async fn select_switches_the_current_database() {
        let deps = test_deps();
        let mut state = SessionState::new();
        let reply = run_dispatch(&["SELECT", "3"], &mut state, &deps).await;
        assert_eq!(reply, Reply::ok());
        assert_eq!(state.db, 3);
    }

    #[tokio::test]
    async fn select_out_of_range_is_rejected() {
        let deps = test_deps();
        let mut state = SessionState::new();
        let reply = run_dispatch(&["SELECT", "99"], &mut state, &deps).await;
        assert!(matches!(reply, Reply::Error(_)));
        assert_eq!(state.db, 0);
    }

    #[tokio::test]
    async fn quit_sets_the_quit_flag() {
        let deps = test_deps();
        let mut state = SessionState::new();
        let reply = run_dispatch(&["QUIT"], &mut state, &deps).await;
        assert_eq!(reply, Reply::ok());
        assert!(state.quit);
    }

    #[tokio::test]
    async fn unknown_command_is_reported() {
        let deps = test_deps();
        let mut state = SessionState::new();
        let reply = run_dispatch(&["BOGUS"], &mut state, &deps).await;
        assert_eq!(reply, Reply::from(DbError::UnknownCommand("bogus".into())));
    }

    #[tokio::test]
    async fn wrong_arity_is_reported() {
        let deps = test_deps();
        let mut state = SessionState::new();
        let reply = run_dispatch(&["GET"], &mut state, &deps).await;
        assert_eq!(reply, Reply::from(DbError::WrongArity("get".into())));
    }

    #[tokio::test]
    async fn bare_subscribe_is_wrong_arity() {
        let deps = test_deps();
        let mut state = SessionState::new();
        let reply = run_dispatch(&["SUBSCRIBE"], &mut state, &deps).await;
        assert_eq!(reply, Reply::from(DbError::WrongArity("subscribe".into())));
    }
}
