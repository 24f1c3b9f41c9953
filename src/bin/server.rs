//! turnpace HTTP server binary.
//!
//! Receives inbound message webhooks from a messaging gateway, paces the
//! replies and schedules follow-ups.
//!
//! # Environment Variables
//!
//! - `PORT` — HTTP port (default: 8080)
//! - `GATEWAY_URL` — base URL of the outbound messaging gateway (required)
//! - `GATEWAY_TOKEN` — bearer token for the gateway (optional)
//! - `GATEWAY_TIMEOUT_SECS` — per-request gateway timeout (default: 10)
//! - `TURNPACE_TEMPLATES` — YAML follow-up template book (optional)
//! - `LLM_API_KEY`, `LLM_BASE_URL`, `LLM_MODEL`, `LLM_SYSTEM_PROMPT` — reply generator
//! - `TURNPACE_CONFIG` and friends — see [`turnpace::config`]
//! - `RUST_LOG` — Tracing filter (default: "info,turnpace=debug")
//!
//! # Usage
//!
//! ```bash
//! GATEWAY_URL=http://localhost:3000 cargo run --bin server
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use turnpace::config::OrchestratorConfig;
use turnpace::interfaces::http::DEFAULT_GATEWAY_TIMEOUT;
use turnpace::interfaces::{
    ChatCompletionsGenerator, Collaborators, GeneratorSettings, HttpTransport, InMemoryProfileStore,
    LexicalClassifier,
};
use turnpace::orchestrator::{Orchestrator, OrchestratorOptions};
use turnpace::persuasion::TemplateBook;
use turnpace::server::{app_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,turnpace=debug".into()),
        )
        .init();

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let bind_addr = format!("0.0.0.0:{}", port);

    let config = OrchestratorConfig::from_env().context("invalid orchestrator configuration")?;

    let gateway_url = std::env::var("GATEWAY_URL").context("GATEWAY_URL must be set")?;
    let gateway_timeout = match std::env::var("GATEWAY_TIMEOUT_SECS") {
        Ok(raw) => Duration::from_secs(
            raw.parse()
                .with_context(|| format!("GATEWAY_TIMEOUT_SECS is not a number: {}", raw))?,
        ),
        Err(_) => DEFAULT_GATEWAY_TIMEOUT,
    };
    let mut transport = HttpTransport::with_timeout(gateway_url, gateway_timeout)
        .context("failed to build gateway transport")?;
    if let Ok(token) = std::env::var("GATEWAY_TOKEN") {
        transport = transport.with_token(token);
    }

    let generator = ChatCompletionsGenerator::new(GeneratorSettings::from_env())
        .context("failed to build reply generator")?;
    tracing::info!(model = %generator.settings().model, "reply generator ready");

    let templates = match std::env::var("TURNPACE_TEMPLATES") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read template book {}", path))?;
            TemplateBook::from_yaml_str(&raw)
                .with_context(|| format!("invalid template book {}", path))?
        }
        Err(_) => TemplateBook::default(),
    };

    let collaborators = Collaborators {
        transport: Arc::new(transport),
        classifier: Arc::new(LexicalClassifier::new()),
        generator: Arc::new(generator),
        store: Arc::new(InMemoryProfileStore::new()),
    };
    let orchestrator = Orchestrator::start_with(
        config,
        collaborators,
        OrchestratorOptions {
            templates,
            seed: None,
        },
    );

    let state = AppState::new(orchestrator);
    let app = app_router(state.clone());

    tracing::info!("turnpace server starting on {}", bind_addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET    /health                       — liveness probe");
    tracing::info!("  POST   /conversations/:id/messages   — inbound fragment");
    tracing::info!("  GET    /conversations/:id            — conversation status");
    tracing::info!("  POST   /conversations/:id/follow-ups — arm follow-ups");
    tracing::info!("  DELETE /conversations/:id/follow-ups — cancel follow-ups");

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {}", e);
            }
        })
        .await
        .context("server failed")?;

    let flushed = state.orchestrator.shutdown().await;
    tracing::info!(flushed, "turnpace server stopped");
    Ok(())
}
