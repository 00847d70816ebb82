//! Blotter crime-statistics ingestion service.
//!
//! Main entry point. Initializes storage, the rate-limited fetch client,
//! and the worker pools, then runs until a shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use blotter_core::{storage::Storage, Clock, RealClock};
use blotter_fetch::{
    CircuitBreaker, FetchClient, FetchStorage, FetchWorker, KeyPool, PostgresFetchStorage,
    WorkerPool,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting blotter ingestion service");

    let config = Config::load()?;
    info!(
        database_url = %config.database_url_masked(),
        api_base_url = %config.api_base_url,
        worker_count = config.worker_count,
        heavy_worker_count = config.heavy_worker_count,
        api_keys = config.api_key_list().len(),
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    run_migrations(&db_pool).await?;
    info!("Database migrations completed");

    let clock: Arc<dyn Clock> = Arc::new(RealClock);
    let storage = Arc::new(Storage::new(db_pool.clone()));
    let fetch_storage: Arc<dyn FetchStorage> =
        Arc::new(PostgresFetchStorage::new(storage, clock.clone()));

    let keys =
        Arc::new(KeyPool::new(config.api_key_list(), config.key_cooldown(), clock.clone())?);
    let circuits = Arc::new(CircuitBreaker::new(config.to_circuit_config(), clock.clone()));
    let client =
        Arc::new(FetchClient::new(config.to_client_config(), keys, circuits, clock.clone())?);

    let cancel = CancellationToken::new();
    let mut pool = WorkerPool::new(cancel.clone());
    for _ in 0..config.worker_count {
        pool.spawn(FetchWorker::new(
            config.to_worker_config(),
            fetch_storage.clone(),
            client.clone(),
            clock.clone(),
            cancel.clone(),
        ));
    }
    for _ in 0..config.heavy_worker_count {
        pool.spawn(FetchWorker::new(
            config.to_heavy_worker_config(),
            fetch_storage.clone(),
            client.clone(),
            clock.clone(),
            cancel.clone(),
        ));
    }
    info!(workers = pool.worker_count(), "Blotter is draining the fetch queue");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    pool.shutdown_graceful(Duration::from_secs(config.shutdown_timeout_seconds)).await?;

    db_pool.close().await;
    info!("Database connections closed");

    info!("Blotter shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,blotter=debug"))
        .expect("Invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Runs database migrations.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_ledger (
            id BIGSERIAL PRIMARY KEY,
            ori TEXT NOT NULL,
            offense TEXT NOT NULL,
            year INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            worker_id UUID,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            UNIQUE(ori, offense, year)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create job_ledger table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_messages (
            id BIGSERIAL PRIMARY KEY,
            job JSONB NOT NULL,
            enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            claimed_by TEXT,
            claimed_at TIMESTAMPTZ,
            acked_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create queue_messages table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letters (
            id BIGSERIAL PRIMARY KEY,
            ori TEXT NOT NULL,
            offense TEXT NOT NULL,
            year INTEGER NOT NULL,
            error TEXT NOT NULL,
            failed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create dead_letters table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS crime_records (
            ori TEXT NOT NULL,
            offense TEXT NOT NULL,
            year INTEGER NOT NULL,
            actual_count BIGINT NOT NULL,
            clearance_count BIGINT,
            months_reported INTEGER,
            population BIGINT,
            population_pct DOUBLE PRECISION,
            parsed_ok BOOLEAN NOT NULL,
            parse_error TEXT,
            raw_json JSONB NOT NULL,
            fetched_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (ori, offense, year)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create crime_records table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS agencies (
            ori TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            is_heavy_lift BOOLEAN NOT NULL DEFAULT FALSE,
            enriched_offenses JSONB NOT NULL DEFAULT '[]',
            enrichment_status TEXT NOT NULL DEFAULT 'pending',
            last_enriched_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create agencies table")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_queue_messages_deliverable
        ON queue_messages(enqueued_at, id)
        WHERE acked_at IS NULL
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create queue_messages deliverable index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_job_ledger_status
        ON job_ledger(status)
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create job_ledger status index")?;

    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
