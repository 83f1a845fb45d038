//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::engine::Engine;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub engine: Arc<Engine>,
}

/// JSON API server.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, engine: Arc<Engine>) -> Self {
        Self {
            state: AppState { config, engine },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        router(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}

pub(crate) fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::handle_health))
        // Services
        .route(
            "/api/services",
            get(handlers::handle_list_services).post(handlers::handle_create_service),
        )
        .route(
            "/api/services/{id}",
            get(handlers::handle_get_service)
                .post(handlers::handle_update_service)
                .delete(handlers::handle_delete_service),
        )
        .route(
            "/api/services/{id}/failures",
            get(handlers::handle_get_failures).delete(handlers::handle_delete_failures),
        )
        .route("/api/services/{id}/hits_data", get(handlers::handle_hits_data))
        .route("/api/services/{id}/ping_data", get(handlers::handle_ping_data))
        .route("/api/services/{id}/failure_data", get(handlers::handle_failure_data))
        .route("/api/services/{id}/uptime", get(handlers::handle_uptime))
        .route("/api/reorder/services", post(handlers::handle_reorder))
        // Notifiers
        .route("/api/notifiers", get(handlers::handle_list_notifiers))
        .route(
            "/api/notifier/{method}",
            get(handlers::handle_get_notifier).post(handlers::handle_update_notifier),
        )
        .route("/api/notifier/{method}/test", post(handlers::handle_test_notifier))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
        .with_state(state)
}
