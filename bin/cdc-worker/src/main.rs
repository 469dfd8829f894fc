//! CDC Worker
//!
//! Watches a MongoDB collection's change stream and drives a lakehouse-bound
//! sink with at-least-once delivery, checkpointing resume tokens to a
//! relational store so a restart resumes without gaps.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `CDC_DB_TYPE` | `sqlite` | Backend for checkpoints/schema registry/job registry: `sqlite`, `postgres`, `mysql` |
//! | `CDC_DB_URL` | `sqlite::memory:` | Connection URL for the above |
//! | `CDC_MONGO_URI` | - | MongoDB connection string (required) |
//! | `CDC_JOB_ID` | - | Stream job id (required) |
//! | `CDC_JOB_NAME` | same as job id | Human-readable job name |
//! | `CDC_USER_ID` | `0` | Owning user id, recorded on the job |
//! | `CDC_DATABASE` | - | Source MongoDB database (required) |
//! | `CDC_COLLECTION` | - | Source MongoDB collection (required) |
//! | `CDC_SINK_TABLE` | same as collection | Logical sink table name |
//! | `CDC_SINK_BASE_PATH` | `./cdc-sink` | Directory the default file sink writes into |
//! | `CDC_BATCH_SIZE` | `100` | Max events per flush |
//! | `CDC_BATCH_INTERVAL_SECONDS` | `10` | Max seconds before a partial batch flushes |
//! | `CDC_METRICS_PORT` | `9090` | Metrics/health port |
//! | `CDC_SHUTDOWN_TIMEOUT_SECONDS` | `30` | Grace period for in-flight watchers on shutdown |
//! | `RUST_LOG` | `info` | Log level |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use cdc_common::job::JobConfig;
use cdc_common::ChangeEvent;
use cdc_checkpoint::{BackendCheckpointStore, CheckpointStore};
use cdc_registry::JobRegistry;
use cdc_schema_registry::SchemaRegistry;
use cdc_stream::SinkCallback;
use cdc_supervisor::{SinkFactory, StreamJobSupervisor};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{} environment variable is required", key))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("starting cdc-worker");

    let db_type = env_or("CDC_DB_TYPE", "sqlite");
    let db_url = env_or("CDC_DB_URL", "sqlite::memory:");
    let mongo_uri = env_required("CDC_MONGO_URI")?;
    let job_id = env_required("CDC_JOB_ID")?;
    let database = env_required("CDC_DATABASE")?;
    let collection = env_required("CDC_COLLECTION")?;
    let metrics_port: u16 = env_or_parse("CDC_METRICS_PORT", 9090);
    let shutdown_timeout = Duration::from_secs(env_or_parse("CDC_SHUTDOWN_TIMEOUT_SECONDS", 30));

    let job_config = JobConfig {
        job_id: job_id.clone(),
        job_name: env_or("CDC_JOB_NAME", &job_id),
        user_id: env_or_parse("CDC_USER_ID", 0),
        source_uri: mongo_uri.clone(),
        database,
        collection: collection.clone(),
        filter_pipeline: None,
        sink_table: env_or("CDC_SINK_TABLE", &collection),
        sink_base_path: env_or("CDC_SINK_BASE_PATH", "./cdc-sink"),
        batch_size: env_or_parse("CDC_BATCH_SIZE", 100),
        batch_interval_seconds: env_or_parse("CDC_BATCH_INTERVAL_SECONDS", 10),
        enabled: true,
        description: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        created_by: "cdc-worker".to_string(),
    };

    let checkpoint_store = create_checkpoint_store(&db_type, &db_url).await?;
    let schema_registry = create_schema_registry(&db_type, &db_url).await?;
    let job_registry = create_job_registry(&db_type, &db_url).await?;
    info!(db_type, "persistence layer initialized");

    let mongo_client = mongodb::Client::with_uri_str(&mongo_uri).await?;
    info!("connected to MongoDB source");

    if job_registry.get_job(&job_id).await?.is_none() {
        job_registry.create_job(job_config.clone()).await?;
    }

    let sink_factory = Arc::new(FileSinkFactory);
    let supervisor = StreamJobSupervisor::new(
        mongo_client,
        checkpoint_store,
        Some(schema_registry),
        sink_factory,
    );
    supervisor.spawn_health_monitor(Duration::from_secs(30));
    supervisor.spawn_signal_handler(shutdown_timeout);

    let execution_id = job_registry.start_job(&job_id, cdc_common::job::JobTrigger::Manual).await?;
    supervisor.start_stream_job(job_config)?;
    info!(job_id, execution_id, "stream job started");

    let (metrics_shutdown_tx, _) = broadcast::channel::<()>(1);
    let metrics_handle = spawn_metrics_server(metrics_port, metrics_shutdown_tx.subscribe()).await?;

    while supervisor.is_running() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let _ = metrics_shutdown_tx.send(());
    let _ = tokio::time::timeout(shutdown_timeout, metrics_handle).await;

    info!("cdc-worker shutdown complete");
    Ok(())
}

async fn create_checkpoint_store(db_type: &str, db_url: &str) -> Result<Arc<dyn CheckpointStore>> {
    match db_type {
        "sqlite" => {
            let pool = SqlitePoolOptions::new().max_connections(5).connect(db_url).await?;
            let backend = cdc_checkpoint::sqlite::SqliteCheckpointBackend::new(pool);
            backend.init_schema().await?;
            Ok(Arc::new(BackendCheckpointStore::new(backend)))
        }
        "postgres" => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .test_before_acquire(true)
                .connect(db_url)
                .await?;
            let backend = cdc_checkpoint::postgres::PostgresCheckpointBackend::new(pool);
            backend.init_schema().await?;
            Ok(Arc::new(BackendCheckpointStore::new(backend)))
        }
        "mysql" => {
            let pool = MySqlPoolOptions::new().max_connections(10).connect(db_url).await?;
            let backend = cdc_checkpoint::mysql::MySqlCheckpointBackend::new(pool);
            backend.init_schema().await?;
            Ok(Arc::new(BackendCheckpointStore::new(backend)))
        }
        other => Err(anyhow::anyhow!("unknown CDC_DB_TYPE: {}", other)),
    }
}

async fn create_schema_registry(db_type: &str, db_url: &str) -> Result<Arc<dyn SchemaRegistry>> {
    match db_type {
        "sqlite" => {
            let pool = SqlitePoolOptions::new().max_connections(5).connect(db_url).await?;
            let registry = cdc_schema_registry::sqlite::SqliteSchemaRegistry::new(pool);
            registry.init_schema().await?;
            Ok(Arc::new(registry))
        }
        "postgres" => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .test_before_acquire(true)
                .connect(db_url)
                .await?;
            let registry = cdc_schema_registry::postgres::PostgresSchemaRegistry::new(pool);
            registry.init_schema().await?;
            Ok(Arc::new(registry))
        }
        "mysql" => {
            let pool = MySqlPoolOptions::new().max_connections(10).connect(db_url).await?;
            let registry = cdc_schema_registry::mysql::MySqlSchemaRegistry::new(pool);
            registry.init_schema().await?;
            Ok(Arc::new(registry))
        }
        other => Err(anyhow::anyhow!("unknown CDC_DB_TYPE: {}", other)),
    }
}

async fn create_job_registry(db_type: &str, db_url: &str) -> Result<Arc<dyn JobRegistry>> {
    match db_type {
        "sqlite" => {
            let pool = SqlitePoolOptions::new().max_connections(5).connect(db_url).await?;
            let registry = cdc_registry::sqlite::SqliteJobRegistry::new(pool);
            registry.init_schema().await?;
            Ok(Arc::new(registry))
        }
        "postgres" => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .test_before_acquire(true)
                .connect(db_url)
                .await?;
            let registry = cdc_registry::postgres::PostgresJobRegistry::new(pool);
            registry.init_schema().await?;
            Ok(Arc::new(registry))
        }
        "mysql" => {
            let pool = MySqlPoolOptions::new().max_connections(10).connect(db_url).await?;
            let registry = cdc_registry::mysql::MySqlJobRegistry::new(pool);
            registry.init_schema().await?;
            Ok(Arc::new(registry))
        }
        other => Err(anyhow::anyhow!("unknown CDC_DB_TYPE: {}", other)),
    }
}

/// Default sink: appends each batch as newline-delimited JSON under
/// `sink_base_path/sink_table.jsonl`. Lakehouse writers (Hudi/Iceberg) are
/// out of scope; this exists so the worker is runnable end to end.
struct FileSink {
    path: PathBuf,
}

#[async_trait]
impl SinkCallback for FileSink {
    async fn call(&self, batch: &[ChangeEvent]) -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&self.path).await?;
        for event in batch {
            let line = serde_json::to_string(event)?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
        Ok(())
    }
}

struct FileSinkFactory;

impl SinkFactory for FileSinkFactory {
    fn build_sink(&self, job: &JobConfig) -> Arc<dyn SinkCallback> {
        let path = PathBuf::from(&job.sink_base_path).join(format!("{}.jsonl", job.sink_table));
        Arc::new(FileSink { path })
    }
}

async fn spawn_metrics_server(
    port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<tokio::task::JoinHandle<()>> {
    let recorder_handle = PrometheusBuilder::new().install_recorder()?;

    let app = axum::Router::new()
        .route("/metrics", axum::routing::get(move || async move { recorder_handle.render() }))
        .route("/healthz", axum::routing::get(health_handler));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics server listening");

    Ok(tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
            .ok();
    }))
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "UP" }))
}
