// evolution-api-rs/src/main.rs
// Prompt evolution service - operator API and daily scheduler
// Port 8090 - HTTP/JSON entry point for operators

use std::sync::Arc;

use anyhow::Context;
use completion_client::HttpCompletionClient;
use evolution_api::{create_router, logging, scheduler, AppState};
use prompt_evolution::{NdjsonTranscriptSource, PipelineOrchestrator};
use shared_types::config::BootstrapConfig;
use shared_types::{
    EvolutionConfig, FileKvStore, KvStore, MemoryKvStore, PromptContent, StorageBackend,
};

const DEFAULT_PORT: u16 = 8090;

async fn open_storage(config: &EvolutionConfig) -> anyhow::Result<Arc<dyn KvStore>> {
    Ok(match config.storage.backend {
        StorageBackend::Memory => {
            tracing::warn!("using in-memory storage; versions and runs are lost on restart");
            Arc::new(MemoryKvStore::new())
        }
        StorageBackend::File => {
            let store = FileKvStore::open(&config.storage.data_dir)
                .await
                .with_context(|| {
                    format!("opening data directory {}", config.storage.data_dir.display())
                })?;
            Arc::new(store)
        }
    })
}

/// Install the seed prompt when the store has no active version yet.
async fn bootstrap_if_empty(
    orchestrator: &PipelineOrchestrator,
    bootstrap: &BootstrapConfig,
) -> anyhow::Result<()> {
    let store = orchestrator.store();
    if let Some(active) = store.get_active().await? {
        tracing::info!(version_id = %active.version_id, "active prompt version loaded");
        return Ok(());
    }
    let Some(path) = &bootstrap.prompt_path else {
        tracing::warn!("no active prompt version and no bootstrap.prompt_path; runs will fail until one is installed");
        return Ok(());
    };

    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading seed prompt {}", path.display()))?;
    let content: PromptContent = serde_json::from_str(&raw)
        .with_context(|| format!("parsing seed prompt {}", path.display()))?;
    let version = store
        .bootstrap(content, "seed prompt", "operator:bootstrap")
        .await?;
    tracing::info!(version_id = %version.version_id, path = %path.display(), "prompt store bootstrapped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config_rs::load_dotenv();
    let config = EvolutionConfig::load().context("loading configuration")?;
    logging::init_logging(&config.logging).context("installing tracing subscriber")?;

    let kv = open_storage(&config).await?;
    let completion = Arc::new(HttpCompletionClient::new(&config.completion)?);
    let source = Arc::new(NdjsonTranscriptSource::new(&config.transcripts.dir));
    let orchestrator = Arc::new(PipelineOrchestrator::from_config(
        &config, kv, source, completion,
    )?);

    bootstrap_if_empty(&orchestrator, &config.bootstrap).await?;

    let scheduler_task = if config.scheduler.enabled {
        let schedule = scheduler::parse_schedule(&config.scheduler.cron)
            .with_context(|| format!("invalid cron expression '{}'", config.scheduler.cron))?;
        tracing::info!(cron = %config.scheduler.cron, "scheduler enabled");
        Some(scheduler::spawn_scheduler(orchestrator.clone(), schedule))
    } else {
        tracing::info!("scheduler disabled");
        None
    };

    let app = create_router(AppState::new(orchestrator));
    let addr = config_rs::get_bind_address("EVOLUTION_API", DEFAULT_PORT);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "evolution API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(task) = scheduler_task {
        task.abort();
    }
    Ok(())
}
