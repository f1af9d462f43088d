//! Builds every piece of startup state: the partition channels, the
//! `Router` that knows about all of them, one `KeyManager` task per
//! partition, and the TCP listener.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::persistence::{PersistenceHandle, PersistenceMode};
use crate::core::router::Router;
use crate::core::keymanager::{self, KeyManagerDeps};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

pub async fn setup(config: Config) -> Result<ServerContext> {
    info!(
        keynodes = config.keynodes,
        node = %config.node,
        "initializing curiodb"
    );

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("failed to create data directory '{}'", config.data_dir.display()))?;

    let mut senders = Vec::with_capacity(config.keynodes);
    let mut receivers = Vec::with_capacity(config.keynodes);
    for _ in 0..config.keynodes {
        let (tx, rx) = mpsc::channel(1024);
        senders.push(tx);
        receivers.push(rx);
    }
    let router = Arc::new(Router::new(senders));

    let persistence_mode = PersistenceMode::from_millis(config.persist_after_ms);
    let sleep_after = (config.sleep_after_ms > 0).then(|| Duration::from_millis(config.sleep_after_ms));

    for (partition, payload_rx) in receivers.into_iter().enumerate() {
        let deps = KeyManagerDeps {
            partition,
            router: router.clone(),
            persistence: PersistenceHandle::new(config.data_dir.clone(), persistence_mode),
            sleep_after,
            data_dir: config.data_dir.clone(),
        };
        keymanager::spawn_on(deps, payload_rx);
    }
    info!(partitions = config.keynodes, "keymanager partitions ready");

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind listener on '{}'", config.listen))?;
    info!(listen = %config.listen, "curiodb listening");

    let (shutdown_tx, _) = broadcast::channel(1);

    Ok(ServerContext {
        router,
        listener,
        shutdown_tx,
        aggregator_timeout: Duration::from_millis(config.aggregator_timeout_ms),
        db_count: config.databases,
    })
}
