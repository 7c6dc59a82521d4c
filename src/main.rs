mod api;
mod config;
mod dispatch;
mod models;
mod normalize;
mod params;
mod sheets;

use std::sync::Arc;

use anyhow::Result;
use axum::{
    http::{
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, ORIGIN},
        HeaderName, Method,
    },
    routing::{get, post},
    Router,
};
use config::Config;
use dispatch::Dispatcher;
use sheets::SheetsSink;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub dispatcher: Dispatcher,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vapi_ticket_webhook=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    let settings = config.sheets_settings();
    if settings.is_none() {
        info!(
            has_spreadsheet_id = config.spreadsheet_id.is_some(),
            has_credentials = config.has_credentials(),
            "Sheets persistence disabled"
        );
    }

    let sink = Arc::new(SheetsSink::new(settings));
    let state = AppState {
        dispatcher: Dispatcher::new(sink, config.sheets_timeout),
        config: config.clone(),
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("vapi-ticket-webhook listening on {}", config.bind_addr);
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/api/test", get(api::diagnostics))
        .route(
            "/api/vapi/events",
            post(api::vapi_events).fallback(api::method_not_allowed),
        )
        .route(
            "/api/vapi/webhook",
            post(api::vapi_events).fallback(api::method_not_allowed),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    CONTENT_TYPE,
                    AUTHORIZATION,
                    HeaderName::from_static("x-requested-with"),
                    ACCEPT,
                    ORIGIN,
                ]),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
