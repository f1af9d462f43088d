//! Holds everything the main accept loop needs once startup has finished.

use crate::core::router::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

pub struct ServerContext {
    pub router: Arc<Router>,
    pub listener: TcpListener,
    pub shutdown_tx: broadcast::Sender<()>,
    pub aggregator_timeout: Duration,
    pub db_count: usize,
}
