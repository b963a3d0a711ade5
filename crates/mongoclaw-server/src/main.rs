use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use mongoclaw_core::Config;
use mongoclaw_runtime::{AiProvider, Runtime, StaticProvider};
use opentelemetry_otlp::WithExportConfig;
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::prelude::*;

#[derive(Clone)]
struct AppState {
    runtime: Arc<Runtime>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    let provider = build_provider(&config)?;
    let runtime = Arc::new(Runtime::start(config, provider).await?);
    let state = AppState {
        runtime: runtime.clone(),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let addr: SocketAddr = std::env::var("HTTP_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".into())
        .parse()?;
    info!("http listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "http server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    server.abort();
    let _ = server.await;
    match Arc::try_unwrap(runtime) {
        Ok(runtime) => runtime.shutdown().await,
        Err(_) => tracing::warn!("runtime still referenced at shutdown"),
    }
    Ok(())
}

fn init_tracing() {
    // Optional OTLP pipeline alongside the fmt layer.
    if let Ok(endpoint) = std::env::var("OTLP_ENDPOINT") {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .ok();
        if let Some(tracer) = tracer {
            let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
            let subscriber = tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::EnvFilter::from_default_env())
                .with(telemetry);
            tracing::subscriber::set_global_default(subscriber).ok();
            return;
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Provider adapters are deployment-specific; the built-in `static` provider
/// exists for smoke tests and dry runs.
fn build_provider(config: &Config) -> anyhow::Result<Arc<dyn AiProvider>> {
    match config.ai.default_provider.as_str() {
        "static" => {
            let content = std::env::var("AI_STATIC_RESPONSE").unwrap_or_else(|_| "{}".into());
            Ok(Arc::new(StaticProvider::new(content)))
        }
        other => anyhow::bail!(
            "no adapter registered for AI provider '{other}'; \
             set AI_DEFAULT_PROVIDER=static or inject an adapter at build time"
        ),
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    if state.runtime.ready().await {
        (
            StatusCode::OK,
            Json(json!({"status": "ready", "leader": state.runtime.is_leader()})),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable"})),
        )
    }
}

async fn metrics() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (
        StatusCode::OK,
        String::from_utf8(buffer).unwrap_or_default(),
    )
}
