//! Main Entrypoint for the Viva API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Choosing session storage: Postgres when configured, otherwise none.
//! 3. Initializing the examiner and reference material services.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use sqlx::PgPool;
use std::{collections::HashMap, fs, net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use viva_api::{
    config::{Config, Provider},
    db::{EchoSessionStore, PgSessionStore, SessionStore},
    router::create_router,
    state::AppState,
};
use viva_core::{
    examiner::LlmExaminer,
    llm_client::LlmClient,
    source::{LlmSourceMaterialService, SourceMaterialService, StaticSourceMaterialService},
};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1/";
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal. Shutting down gracefully..."),
        Err(e) => error!(error = %e, "Failed to listen for Ctrl+C; shutting down"),
    }
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &std::path::Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    let entries = fs::read_dir(prompts_path)
        .with_context(|| format!("Failed to read prompts from {}", prompts_path.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content);
        }
    }
    Ok(prompts)
}

/// Connects to Postgres when `DATABASE_URL` is set. Without it, examinations
/// still run but nothing is stored.
async fn session_store(config: &Config) -> anyhow::Result<Arc<dyn SessionStore>> {
    let Some(database_url) = &config.database_url else {
        warn!("DATABASE_URL is not set; completed examinations will not be stored.");
        return Ok(Arc::new(EchoSessionStore));
    };
    let pool = PgPool::connect(database_url)
        .await
        .context("Failed to connect to database")?;
    let store = PgSessionStore::new(pool);
    store.run_migrations().await?;
    info!("Database connection established and migrations are up-to-date.");
    Ok(Arc::new(store))
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
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Storage ---
    let store = session_store(&config).await?;

    // --- 4. Initialize Shared Services ---
    let prompts = load_prompts(&config.prompts_path)?;
    let openai_config = match &config.provider {
        Provider::OpenAI => {
            info!("Using OpenAI provider.");
            let api_key = config
                .openai_api_key
                .as_ref()
                .context("OPENAI_API_KEY is required for the openai provider")?;
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base(OPENAI_API_BASE)
        }
        Provider::Gemini => {
            info!("Using Gemini provider.");
            let api_key = config
                .gemini_api_key
                .as_ref()
                .context("GEMINI_API_KEY is required for the gemini provider")?;
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base(GEMINI_API_BASE)
        }
    };
    let client = LlmClient::new(openai_config, config.chat_model.clone());
    let examiner = LlmExaminer::new(client.clone(), prompts.clone())
        .context("Failed to initialize the examiner")?;
    let source_service: Arc<dyn SourceMaterialService> = if config.generate_source {
        Arc::new(LlmSourceMaterialService::new(client, prompts))
    } else {
        info!("GENERATE_SOURCE is off; missing reference material uses fixed notes.");
        Arc::new(StaticSourceMaterialService)
    };

    let app_state = Arc::new(AppState {
        store,
        examiner: Arc::new(examiner),
        source_service,
        config: Arc::new(config.clone()),
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        provider = ?config.provider,
        model = %config.chat_model,
        bind_address = %config.bind_address,
        min_rounds = config.policy.rounds.min_rounds,
        max_rounds = config.policy.rounds.max_rounds,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
