//! Main Entrypoint for the GitVoice API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the project workspace, tool executor and advisor.
//! 3. Constructing the Axum router and applying middleware.
//! 4. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use gitvoice_api::{
    config::Config,
    router::create_router,
    state::AppState,
    ws::{
        dispatch::FunctionDispatcher, provider::OpenAIRealtimeConnector,
        registry::SessionRegistry,
    },
};
use gitvoice_core::{
    advisor::LLMAdvisor, executor::CommandToolExecutor, project::LocalWorkspace,
};
use std::{collections::HashMap, fs, net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const DEFAULT_SYSTEM_PROMPT: &str = "You are GitVoice, a concise voice assistant for git \
repositories. Use the provided tools to inspect projects, commit changes and manage issues. \
Ask the user to select a project before running project tools. Keep spoken answers short.";

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C.");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &std::path::Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    for entry in std::fs::read_dir(prompts_path)? {
        let entry = entry?;
        let path = entry.path();
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

    // --- 3. Initialize Shared Services ---
    let system_prompt = match load_prompts(&config.prompts_path) {
        Ok(mut prompts) => prompts.remove("system_prompt"),
        Err(e) => {
            warn!(path = %config.prompts_path.display(), error = %e, "Could not read prompts directory.");
            None
        }
    }
    .unwrap_or_else(|| {
        info!("Using the built-in system prompt.");
        DEFAULT_SYSTEM_PROMPT.to_string()
    });

    let workspace = LocalWorkspace::new(config.workspace_root.clone());
    let openai_config = OpenAIConfig::new()
        .with_api_key(&config.openai_api_key)
        .with_api_base("https://api.openai.com/v1/");
    let dispatcher = Arc::new(FunctionDispatcher::new(
        Arc::new(workspace.clone()),
        Arc::new(CommandToolExecutor::new(workspace)),
        Arc::new(LLMAdvisor::new(openai_config, config.advisor_model.clone())),
    ));
    let connector = Arc::new(OpenAIRealtimeConnector {
        url: config.realtime_url.clone(),
        model: config.realtime_model.clone(),
        api_key: config.openai_api_key.clone(),
        voice: config.realtime_voice.clone(),
        ready_timeout: config.upstream_ready_timeout,
    });

    let sessions = Arc::new(SessionRegistry::new());
    let app_state = Arc::new(AppState {
        sessions: sessions.clone(),
        dispatcher,
        connector,
        system_prompt: Arc::new(system_prompt),
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
        realtime_model = %config.realtime_model,
        advisor_model = %config.advisor_model,
        workspace_root = %config.workspace_root.display(),
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

    sessions.close_all().await;
    info!("Server has shut down.");
    Ok(())
}
