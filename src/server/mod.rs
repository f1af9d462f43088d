//! Process-level wiring: turns a loaded `Config` into a bound listener and
//! runs the accept loop to completion.

mod connection_loop;
mod context;
mod initialization;

use crate::config::Config;
use anyhow::Result;

pub async fn run(config: Config) -> Result<()> {
    let ctx = initialization::setup(config).await?;
    connection_loop::run(ctx).await;
    Ok(())
}
