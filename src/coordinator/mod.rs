//! Coordinator side: catalog, execution registry, HTTP/SSE façade.
//!
//! The coordinator holds no durable state. The catalog is rebuilt from
//! retained announcements on every broker connect, and outstanding
//! executions are lost across a restart by design.

// Rust guideline compliant 2026-02

pub mod catalog;
pub mod executions;
pub mod routes;

use std::sync::Arc;

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::broker::{BrokerClient, MessageHandler, OnConnect, QoS};
use crate::config::Config;
use crate::protocol::ACTIONS_FILTER;

use catalog::ActionCatalog;
use executions::ExecutionRegistry;
use routes::AppState;

/// Run the coordinator until interrupted.
pub async fn run(config: Config) -> Result<()> {
    let catalog = Arc::new(ActionCatalog::default());
    let executions = Arc::new(ExecutionRegistry::default());

    let client_id = format!("tinpot-coordinator-{}", Uuid::new_v4().simple());
    let catalog_sub = Arc::clone(&catalog);
    let on_connect: OnConnect = Arc::new(move |client| {
        // Retained announcements replay right after the SUBACK, so the
        // catalog resynchronizes without further work.
        let cat = Arc::clone(&catalog_sub);
        let handler: MessageHandler = Arc::new(move |topic, payload| cat.apply(topic, payload));
        match client.subscribe(ACTIONS_FILTER, QoS::AtLeastOnce, handler) {
            Ok(_token) => log::debug!("[coordinator] catalog subscription issued"),
            Err(e) => log::warn!("[coordinator] failed to subscribe to catalog: {e}"),
        }
    });
    let broker = BrokerClient::connect(&config.broker_url, &client_id, on_connect)?;

    let state = AppState {
        catalog,
        executions,
        broker,
        sync_timeout: config.sync_timeout,
    };
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("bind HTTP listener on port {}", config.http_port))?;
    log::info!("[coordinator] listening on http://0.0.0.0:{}", config.http_port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    log::info!("[coordinator] shutting down");
}
