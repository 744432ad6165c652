use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use usv_pipeline::config::AppConfig;
use usv_pipeline::handlers::AppState;
use usv_pipeline::metrics::Metrics;
use usv_pipeline::routes;
use usv_pipeline::services::audit::AuditRecorder;
use usv_pipeline::services::blob_store::BlobStore;
use usv_pipeline::services::remote_store::{RemoteStore, S3RemoteStore};
use usv_pipeline::services::work_queue::WorkQueue;
use usv_pipeline::workers::cleanup::CleanupWorker;
use usv_pipeline::workers::ingest::{DropSource, FtpDrop, IngestWorker, LocalDrop};
use usv_pipeline::workers::transfer::TransferWorker;
use usv_pipeline::workers::validation::ValidationWorker;
use usv_pipeline::workers::{Worker, QUEUE_POLL_INTERVAL, VISIBILITY_TIMEOUT};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = AppConfig::load()?;
    init_tracing(&cfg);

    tracing::info!(
        "starting usv pipeline: container={}, validation_queue={}, transfer_queue={}, cleanup_queue={}",
        cfg.container_name,
        cfg.validation_queue_name,
        cfg.transfer_queue_name,
        cfg.cleanup_queue_name
    );
    tracing::info!(
        "remote store: endpoint={}, bucket={}",
        cfg.remote.endpoint_url.as_deref().unwrap_or("default"),
        cfg.remote.bucket_name
    );

    // --- Storage ---
    let db = connect_db(&cfg.database_url).await?;
    let store = BlobStore::new(db.clone(), cfg.data_dir.clone(), cfg.container_name.clone())
        .await
        .context("initializing payload store")?;
    let queue = WorkQueue::new(db.clone())
        .await
        .context("initializing work queues")?;
    let audit = AuditRecorder::new(db.clone())
        .await
        .context("initializing audit recorder")?;
    let remote: Arc<dyn RemoteStore> = Arc::new(S3RemoteStore::connect(&cfg.remote).await);
    let metrics = Arc::new(Metrics::default());

    // --- Workers ---
    let root = CancellationToken::new();
    let mut workers = vec![
        Worker::new(
            "validation",
            Arc::new(ValidationWorker::new(
                store.clone(),
                queue.clone(),
                cfg.validation_queue_name.clone(),
                cfg.transfer_queue_name.clone(),
                VISIBILITY_TIMEOUT,
                Arc::clone(&metrics),
            )),
            QUEUE_POLL_INTERVAL,
            cfg.processing_batch_size,
            cfg.operation_retry_count,
            root.child_token(),
        ),
        Worker::new(
            "transfer",
            Arc::new(TransferWorker::new(
                store.clone(),
                queue.clone(),
                Arc::clone(&remote),
                cfg.transfer_queue_name.clone(),
                cfg.cleanup_queue_name.clone(),
                VISIBILITY_TIMEOUT,
                Arc::clone(&metrics),
            )),
            QUEUE_POLL_INTERVAL,
            cfg.processing_batch_size,
            cfg.operation_retry_count,
            root.child_token(),
        ),
        Worker::new(
            "cleanup",
            Arc::new(CleanupWorker::new(
                store.clone(),
                queue.clone(),
                audit,
                cfg.cleanup_queue_name.clone(),
                cfg.retention(),
                VISIBILITY_TIMEOUT,
                Arc::clone(&metrics),
            )),
            QUEUE_POLL_INTERVAL,
            cfg.processing_batch_size,
            cfg.operation_retry_count,
            root.child_token(),
        ),
    ];

    if cfg.ftp.watch_enabled {
        let watch_dir = cfg
            .ftp
            .watch_dir
            .clone()
            .context("FTP_WATCH_DIR is required when FTP_WATCH_ENABLED is true")?;
        let source: Arc<dyn DropSource> = if cfg.ftp.remote_drop() {
            tracing::info!(
                "watching ftp drop at {}:{} (staging {})",
                cfg.ftp.host,
                cfg.ftp.port,
                watch_dir.display()
            );
            Arc::new(FtpDrop::new(cfg.ftp.clone()))
        } else {
            tracing::info!("watching local drop directory {}", watch_dir.display());
            Arc::new(LocalDrop)
        };
        workers.push(Worker::new(
            "ftp-watcher",
            Arc::new(IngestWorker::new(
                store.clone(),
                queue.clone(),
                source,
                watch_dir,
                cfg.validation_queue_name.clone(),
                Arc::clone(&metrics),
            )),
            cfg.ftp.poll_interval,
            cfg.processing_batch_size,
            cfg.operation_retry_count,
            root.child_token(),
        ));
    }

    for worker in &workers {
        worker.start();
    }

    // --- Status surface ---
    let state = AppState {
        workers: workers.iter().map(Worker::handle).collect(),
        metrics,
    };
    let app: Router = routes::routes::routes().with_state(state);
    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding status server to {addr}"))?;
    tracing::info!("status server listening on http://{addr}");

    let server_token = root.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_token.cancelled().await })
            .await
    });

    // --- Graceful shutdown ---
    shutdown_signal().await;
    tracing::info!("shutdown signal received");
    root.cancel();

    let stop_all = async {
        futures::future::join_all(workers.iter().map(Worker::stop)).await;
    };
    if tokio::time::timeout(cfg.shutdown_timeout, stop_all).await.is_err() {
        tracing::warn!("worker shutdown timed out, exiting anyway");
        return Ok(());
    }

    match tokio::time::timeout(cfg.shutdown_timeout, server).await {
        Ok(Ok(Ok(()))) => tracing::info!("all services shut down gracefully"),
        Ok(Ok(Err(err))) => tracing::warn!("status server error during shutdown: {err}"),
        Ok(Err(err)) => tracing::warn!("status server task failed: {err}"),
        Err(_) => tracing::warn!("status server shutdown timed out, exiting anyway"),
    }
    Ok(())
}

fn init_tracing(cfg: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cfg.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Open (and if necessary create) the SQLite database behind `url`.
async fn connect_db(url: &str) -> Result<SqlitePool> {
    let db_path = url.trim_start_matches("sqlite://").trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }
    }
    let options: SqliteConnectOptions = url
        .parse::<SqliteConnectOptions>()
        .with_context(|| format!("parsing database url `{url}`"))?;
    let db = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options.create_if_missing(true))
        .await
        .with_context(|| format!("connecting to {url}"))?;
    Ok(db)
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install ctrl-c handler: {err}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install sigterm handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
