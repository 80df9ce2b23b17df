// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Node startup — assembles the host and serves the HTTP/WS edge.
//!
//! # Startup sequence
//!
//! 1. Build the model provider from config.
//! 2. Construct [`NodeState`] (spawns the alarm pump).
//! 3. Scan the data directory and re-arm persisted alarms — hibernated
//!    instances with pending schedules wake on time even after a restart.
//! 4. Serve axum until ctrl-c; clear timers on the way out.

use std::sync::Arc;

use tracing::info;

use warren_config::Config;

use crate::host::NodeState;
use crate::http;

/// Start the node.  Blocks until shutdown.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let model = warren_model::from_config(&config.model)?;
    info!(
        provider = model.name(),
        model = model.model_name(),
        "model provider ready"
    );

    let node = NodeState::new(Arc::clone(&config), model);
    node.restore_alarms()?;

    let listener = tokio::net::TcpListener::bind(&config.http.bind).await?;
    info!(bind = %config.http.bind, "warren node listening");

    let app = http::router(Arc::clone(&node));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    node.shutdown();
    Ok(())
}

/// Bind to an ephemeral port and serve in the background.  Returns the bound
/// address; used by integration tests and embedded setups.
pub async fn spawn(config: Config) -> anyhow::Result<(std::net::SocketAddr, Arc<NodeState>)> {
    let model = warren_model::from_config(&config.model)?;
    spawn_with_model(config, model).await
}

/// Like [`spawn`] but with an explicit provider — tests inject scripted
/// mocks this way.
pub async fn spawn_with_model(
    config: Config,
    model: Arc<dyn warren_model::ModelProvider>,
) -> anyhow::Result<(std::net::SocketAddr, Arc<NodeState>)> {
    let config = Arc::new(config);
    let node = NodeState::new(Arc::clone(&config), model);
    node.restore_alarms()?;

    let listener = tokio::net::TcpListener::bind(&config.http.bind).await?;
    let addr = listener.local_addr()?;
    let app = http::router(Arc::clone(&node));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((addr, node))
}
