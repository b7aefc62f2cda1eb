//! HTTP gateway for nosrelay.
//!
//! Exposes `POST /api/chat`, which streams a completion back as plain text,
//! and `GET /health`.
//!
//! Built on Axum; one relay task per in-flight chat.

pub mod chat;
pub mod error;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, header};
use axum::{
    Router,
    response::Json,
    routing::{get, post},
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use nosrelay_config::{AppConfig, GatewayConfig, RelayConfig};
use nosrelay_core::{ContextResolver, Upstream};
use nosrelay_providers::{OpenAiCompatUpstream, context_resolver};

pub use chat::ChatRequest;
pub use error::{ApiError, ErrorResponse};

/// Long-lived collaborators shared by every request.
pub struct RelayState {
    pub relay: RelayConfig,
    pub upstream: Arc<dyn Upstream>,
    pub resolver: ContextResolver,
}

impl RelayState {
    /// Wire the HTTP upstream and the price source described by `config`.
    pub fn from_config(config: &AppConfig) -> nosrelay_core::Result<Self> {
        let upstream = OpenAiCompatUpstream::from_config(&config.relay)?;
        let resolver = context_resolver(&config.price)?;
        Ok(Self {
            relay: config.relay.clone(),
            upstream: Arc::new(upstream),
            resolver,
        })
    }
}

pub type SharedState = Arc<RelayState>;

/// Build the Axum router with all gateway routes.
pub fn build_router(state: SharedState, gateway: &GatewayConfig) -> Router {
    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/api/chat", post(chat::chat_handler))
        .with_state(state);

    let router = match gateway.allowed_origin.as_deref().map(str::parse::<HeaderValue>) {
        Some(Ok(origin)) => router.layer(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE])
                .max_age(std::time::Duration::from_secs(3600)),
        ),
        Some(Err(e)) => {
            warn!(error = %e, "Ignoring invalid allowed_origin");
            router
        }
        None => router,
    };

    router.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(gateway.body_limit_bytes)),
    )
}

/// Start the gateway HTTP server.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let state = Arc::new(RelayState::from_config(&config)?);
    if config.relay.api_key.is_none() {
        warn!("No server-side API key configured; requests must carry their own key");
    }
    let app = build_router(state, &config.gateway);

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
