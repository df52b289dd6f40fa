//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{OpenAiAnsweringAdapter, StagedFileTransport},
    config::{Config, ConfigError},
    error::ApiError,
    web::{
        create_session_handler, download_document_handler, end_session_handler, rest::ApiDoc,
        state::AppState, upload_document_handler, ws_handler,
    },
};
use async_openai::{config::OpenAIConfig, Client};
use axum::{
    extract::DefaultBodyLimit,
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderValue, Method,
    },
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Initialize Service Adapters ---
    let openai_config = OpenAIConfig::new().with_api_key(
        config
            .openai_api_key
            .as_ref()
            .ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?,
    );
    let openai_client = Client::with_config(openai_config);

    let answering = Arc::new(OpenAiAnsweringAdapter::new(
        openai_client,
        config.qa_model.clone(),
    )?);
    let transport = Arc::new(StagedFileTransport::new(
        config.upload_dir.clone(),
        config.upload_chunk_bytes,
    ));
    info!("Staging uploads in {:?}.", config.upload_dir);

    // --- 3. Build the Shared AppState ---
    let app_state = Arc::new(AppState::new(config.clone(), answering, transport));
    app_state.clone().spawn_idle_sweeper(config.session_idle_ttl);
    info!(
        "Sessions idle for {:?} are ended.",
        config.session_idle_ttl
    );

    let origin = config.cors_origin.parse::<HeaderValue>().map_err(|e| {
        ApiError::Config(ConfigError::InvalidValue(
            "CORS_ORIGIN".to_string(),
            e.to_string(),
        ))
    })?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, ACCEPT]);

    // --- 4. Create the Web Router ---
    let api_router = Router::new()
        .route("/sessions", post(create_session_handler))
        .route(
            "/sessions/{id}/document",
            post(upload_document_handler).get(download_document_handler),
        )
        .route("/sessions/{id}", delete(end_session_handler))
        .route("/ws", get(ws_handler))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(cors)
        .with_state(app_state);

    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 5. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
