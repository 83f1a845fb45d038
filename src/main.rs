//! uptrail - self-hosted uptime monitoring
//!
//! Probes registered services on their own cadence, records every outcome,
//! serves time-bucketed series over the history and notifies on up/down
//! transitions.

mod aggregate;
mod config;
mod db;
mod engine;
mod error;
mod notify;
mod probe;
mod scheduler;
mod web;

use config::ServerConfig;
use db::Store;
use engine::Engine;
use notify::Dispatcher;
use probe::NetworkProber;
use scheduler::{RetentionManager, Scheduler};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("uptrail=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting uptrail on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);
    if cfg.api_secret_generated {
        tracing::info!("Generated API secret: {}", cfg.api_secret);
    }

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Add sample service if none exist
    if store.get_services()?.is_empty() {
        tracing::info!("Adding sample service: Google");
        let mut service = db::Service {
            name: "Google".to_string(),
            address: "https://google.com".to_string(),
            expected_status: 200,
            ..Default::default()
        };
        store.add_service(&mut service)?;
    }

    let dispatcher = Arc::new(Dispatcher::new(
        notify::default_catalog(),
        cfg.failure_threshold,
        cfg.notifier_timeout,
    ));
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        Arc::new(NetworkProber),
        dispatcher.clone(),
    ));
    let engine = Arc::new(Engine::new(store.clone(), scheduler, dispatcher));

    // Start probing
    engine.start().await?;

    let retention = RetentionManager::new(store, cfg.remove_after_days, cfg.cleanup_interval);
    retention.start();

    // Start web server
    let server = Server::new(cfg, engine.clone());
    let result = server.start().await;

    retention.stop().await;
    engine.shutdown().await;

    result
}
