//! lexa-ingest - Lexicon ingest microservice
//!
//! Imports dictionary dumps and annotates lyric corpora as resumable,
//! chunked background jobs. HTTP REST for job control, SSE for progress.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use lexa_common::config::{ContinuationMode, RootFolderInitializer, RootFolderResolver};
use lexa_common::events::EventBus;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lexa_ingest::cascade::{HttpClassifier, CLASSIFIER_DEPENDENCY};
use lexa_ingest::engine::{
    recover_jobs, run_recovery_sweeps, run_worker, ChunkQueue, ChunkedJobEngine, CorpusAnnotateProcessor,
    DictionaryImportProcessor, GenerativeDeps,
};
use lexa_ingest::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, RetryPolicy};
use lexa_ingest::AppState;

/// Command-line arguments for lexa-ingest
#[derive(Parser, Debug)]
#[command(name = "lexa-ingest")]
#[command(about = "Lexicon ingest microservice")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "5731", env = "LEXA_PORT")]
    port: u16,

    /// Root folder holding the database
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Path to the TOML config file
    #[arg(short, long, env = "LEXA_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let toml_config = lexa_common::config::load_toml_config(args.config.as_deref())?;

    let default_filter = format!("lexa_ingest={0},lexa_common={0},tower_http=info", toml_config.logging.level);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting lexa-ingest on port {}", args.port);
    info!(
        "Version: {} (git {}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP")
    );

    // Root folder: CLI → ENV → TOML → OS default
    let root_folder = RootFolderResolver::new("lexa-ingest")
        .with_cli_arg(args.root_folder.clone())
        .with_toml_config(&toml_config)
        .resolve();
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;

    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());
    let db_pool = lexa_ingest::db::init_database_pool(&db_path).await?;

    let event_bus = EventBus::new(256);
    let breakers = Arc::new(CircuitBreakerRegistry::with_event_bus(event_bus.clone()));

    // Generative fallback is optional; without an endpoint the cascade stops
    // at the local strategies.
    let generative = match toml_config.classifier.endpoint.clone() {
        Some(endpoint) => {
            let api_key = match lexa_ingest::config::resolve_classifier_api_key(&db_pool, &toml_config).await? {
                Some((key, source)) => {
                    let toml_path = args.config.clone().or_else(lexa_common::config::default_config_path);
                    if let Err(e) = lexa_ingest::config::migrate_key_to_database(
                        &key,
                        source,
                        &db_pool,
                        toml_path.as_deref(),
                    )
                    .await
                    {
                        warn!("Classifier key migration failed: {}", e);
                    }
                    Some(key)
                }
                None => None,
            };

            let classifier = HttpClassifier::new(&toml_config.classifier, endpoint.clone(), api_key)
                .context("Failed to build classifier client")?;
            let breaker = breakers.get_or_create(
                CLASSIFIER_DEPENDENCY,
                CircuitBreakerConfig::from_preset(toml_config.classifier.breaker),
            );
            info!("Generative classifier: {}", endpoint);
            Some(GenerativeDeps {
                classifier: Arc::new(classifier),
                breaker,
                retry: RetryPolicy::from_classifier_config(&toml_config.classifier),
            })
        }
        None => {
            info!("No classifier endpoint configured, generative fallback disabled");
            None
        }
    };

    let shutdown = CancellationToken::new();
    let engine_config = toml_config.engine.clone();

    let mut engine = ChunkedJobEngine::new(db_pool, event_bus, engine_config.clone())
        .with_processor(Arc::new(DictionaryImportProcessor))
        .with_processor(Arc::new(CorpusAnnotateProcessor::new(
            toml_config.cascade.clone(),
            generative,
        )));

    let worker_rx = match engine_config.continuation {
        ContinuationMode::Queue => {
            let (queue, rx) = ChunkQueue::bounded(engine_config.queue_capacity);
            engine = engine.with_queue(queue);
            Some(rx)
        }
        ContinuationMode::Loop => None,
    };
    if let Some(rx) = worker_rx {
        tokio::spawn(run_worker(engine.clone(), rx, shutdown.clone()));
    }
    info!(
        worker_id = engine.worker_id(),
        chunk_size = engine_config.chunk_size,
        continuation = ?engine_config.continuation,
        "Job engine ready"
    );

    match recover_jobs(&engine).await {
        Ok(report) => info!(
            resumed = report.resumed.len(),
            finalized = report.finalized.len(),
            "Startup recovery complete"
        ),
        Err(e) => warn!("Startup recovery failed: {}", e),
    }
    tokio::spawn(run_recovery_sweeps(
        engine.clone(),
        Duration::from_millis(engine_config.lease_ttl_ms),
        shutdown.clone(),
    ));

    let state = AppState::new(engine, breakers, &toml_config.rate_limit);
    let app = lexa_ingest::build_router(state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("Server error")?;

    shutdown.cancel();
    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM and cancels background tasks
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
    shutdown.cancel();
}
