//! The accept loop: hands each incoming connection to its own session task
//! and waits on a shutdown signal (Ctrl-C, SIGTERM, or an internal SHUTDOWN
//! command) to drain them.

use super::context::ServerContext;
use crate::core::session::{self, SessionDeps};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinSet;
use tracing::{error, info};

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }
}

pub async fn run(ctx: ServerContext) {
    let ServerContext { router, listener, shutdown_tx, aggregator_timeout, db_count } = ctx;

    let session_deps = SessionDeps {
        router,
        aggregator_timeout,
        db_count,
        shutdown_tx: shutdown_tx.clone(),
    };

    let next_session_id = AtomicU64::new(1);
    let mut client_tasks = JoinSet::new();
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            biased;

            _ = await_shutdown_signal() => {
                info!("shutting down");
                let _ = shutdown_tx.send(());
                break;
            }
            _ = shutdown_rx.recv() => {
                info!("shutdown requested by a client");
                break;
            }
            Some(finished) = client_tasks.join_next(), if !client_tasks.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!(error = %e, "a client session task panicked");
                    }
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let session_id = next_session_id.fetch_add(1, Ordering::Relaxed);
                        let deps = session_deps.clone();
                        client_tasks.spawn(async move {
                            session::run(stream, addr, session_id, deps).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                    }
                }
            }
        }
    }

    info!(outstanding = client_tasks.len(), "waiting for client sessions to finish");
    while client_tasks.join_next().await.is_some() {}
    info!("all client sessions finished");
}
