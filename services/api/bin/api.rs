//! Main Entrypoint for the Voxline API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the model catalogs and the speech and language clients.
//! 3. Constructing the lifecycle controller that owns every session.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and closing all sessions on shutdown.

use anyhow::Context;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use voxline_api::{config::Config, router::create_router, state::AppState};
use voxline_core::{
    lifecycle::{LifecycleController, ServiceSet},
    llm_client::OpenAICompatibleClient,
    provisioner::{
        ModelDependency, ModelKind, Provisioner,
        catalog::{ModelCatalog, OllamaCatalog, SpeachesCatalog},
    },
    speech::{SpeachesStt, SpeachesTts},
};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing services...");

    // --- 3. Initialize Shared Services ---
    let ollama: Arc<dyn ModelCatalog> = Arc::new(OllamaCatalog::new(&config.ollama_base_url));
    let speaches: Arc<dyn ModelCatalog> =
        Arc::new(SpeachesCatalog::new(&config.speaches_base_url));

    let services = ServiceSet {
        stt: Arc::new(SpeachesStt::new(&config.speaches_base_url, &config.stt_model)),
        llm: Arc::new(OpenAICompatibleClient::ollama(
            &config.ollama_base_url,
            config.ollama_model.clone(),
        )),
        tts: Arc::new(
            SpeachesTts::new(&config.speaches_base_url, config.synthesis_config())
                .context("Invalid speech synthesis settings")?,
        ),
        dependencies: vec![
            ModelDependency::new(speaches.clone(), &config.stt_model, ModelKind::Stt),
            ModelDependency::new(ollama.clone(), &config.ollama_model, ModelKind::Llm),
            ModelDependency::new(speaches.clone(), &config.tts_model, ModelKind::Tts),
        ],
    };

    let lifecycle =
        LifecycleController::new(Provisioner::new(), services, config.session_settings());

    let app_state = Arc::new(AppState {
        lifecycle: lifecycle.clone(),
        ollama,
        speaches,
        config: Arc::new(config.clone()),
    });

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        llm = %config.ollama_model,
        stt = %config.stt_model,
        tts = %config.tts_model,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    lifecycle.close_all().await;
    info!("Server has shut down.");
    Ok(())
}
