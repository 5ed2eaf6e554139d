mod aggregate;
mod api;
mod broadcast;
mod classify;
mod config;
mod devices;
mod error;
mod grpc;
mod ingest;
mod latest;
mod model;
mod mqtt;
mod pipeline;
mod store;
mod telemetry;

use crate::api::AppState;
use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::devices::DeviceTracker;
use crate::grpc::{serve_uds, IngestService};
use crate::ingest::TelemetryIngestor;
use crate::latest::LatestCache;
use crate::pipeline::{
    spawn_worker, BatchCommand, DeadLetter, IngestStats, PipelineHandle, RetryPolicy,
    WorkerSettings,
};
use crate::store::{MemoryStore, PgStore, ReadingStore};
use anyhow::{Context, Result};
use chrono::Utc;
use futures::future;
use std::sync::Arc;
use tokio::sync::mpsc;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,barn_telemetry=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "barn-telemetry"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn build_store(config: &Config) -> Result<ReadingStore> {
    let Some(url) = &config.database_url else {
        tracing::warn!("no database url configured; readings are kept in memory only");
        return Ok(ReadingStore::Memory(MemoryStore::new()));
    };
    let store = PgStore::connect(url, config.db_pool_size)
        .await
        .context("failed to connect to the reading store")?;
    store
        .ensure_schema()
        .await
        .context("failed to create sensor_readings schema")?;
    Ok(ReadingStore::Postgres(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;
    for warning in &config.warnings {
        tracing::warn!(%warning, "configuration value ignored");
    }
    tracing::info!(
        timezone = config.timezone.name(),
        thresholds = ?config.thresholds,
        "starting barn telemetry"
    );

    let store = build_store(&config).await?;
    let latest = LatestCache::new();
    if let ReadingStore::Postgres(_) = &store {
        match store.latest_per_sensor().await {
            Ok(rows) => {
                let warmed = latest.warm(rows);
                tracing::info!(sensors = warmed, "warmed latest-reading cache");
            }
            Err(err) => tracing::warn!(error=%err, "failed to warm latest-reading cache"),
        }
    }

    let stats = Arc::new(IngestStats::new());
    let (tx, rx) = mpsc::channel::<BatchCommand>(config.max_queue.max(1));
    let pipeline = PipelineHandle::new(tx, stats.clone())
        .with_overflow(DeadLetter::new(config.dead_letter_path.clone()));
    let worker_handle = spawn_worker(
        store.clone(),
        rx,
        stats.clone(),
        WorkerSettings {
            batch_size: config.batch_size,
            flush_interval: config.flush_interval(),
            retry: RetryPolicy {
                max_attempts: config.retry_max_attempts,
                base_backoff: config.retry_base_backoff(),
                max_backoff: config.retry_max_backoff(),
            },
            dead_letter: DeadLetter::new(config.dead_letter_path.clone()),
        },
    );

    let ingestor = TelemetryIngestor::new(
        pipeline,
        config.thresholds,
        latest,
        Broadcaster::new(config.broadcast_capacity),
        DeviceTracker::new(config.uptime_window(), config.device_log_capacity),
        config.heartbeat_timeout(),
    );

    let grpc_service = IngestService::new(ingestor.clone());
    let grpc_path = config.grpc_socket_path.clone();
    let grpc_handle = tokio::spawn(async move { serve_uds(&grpc_path, grpc_service).await });

    let http_state = AppState {
        ingestor: ingestor.clone(),
        store,
        timezone: config.timezone,
    };
    let http_addr = config.http_listen_addr;
    let http_handle = tokio::spawn(async move { api::serve(http_addr, http_state).await });

    let mqtt_handle = if config.enable_mqtt_listener {
        let config_clone = config.clone();
        let ingestor_clone = ingestor.clone();
        Some(tokio::spawn(async move {
            mqtt::run_listener(config_clone, ingestor_clone).await
        }))
    } else {
        None
    };

    let sweeper_handle = {
        let ingestor = ingestor.clone();
        let interval = config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                ingestor.sweep_stale_devices(Utc::now());
                let pruned = ingestor.broadcaster().prune_idle();
                if pruned > 0 {
                    tracing::debug!(pruned, "dropped idle barn channels");
                }
            }
        })
    };

    tokio::select! {
        res = grpc_handle => {
            match res {
                Ok(Err(err)) => tracing::error!(error=%err, "gRPC server exited"),
                Err(err) => tracing::error!(error=%err, "gRPC task failed"),
                Ok(Ok(())) => {}
            }
        }
        res = http_handle => {
            match res {
                Ok(Err(err)) => tracing::error!(error=%err, "HTTP server exited"),
                Err(err) => tracing::error!(error=%err, "HTTP task failed"),
                Ok(Ok(())) => {}
            }
        }
        _ = async {
            if let Some(handle) = mqtt_handle {
                if let Err(err) = handle.await { tracing::warn!(error=%err, "MQTT task failed"); }
            } else {
                future::pending::<()>().await;
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    sweeper_handle.abort();
    if let Err(err) = ingestor.flush().await {
        tracing::warn!(error=%err, "final flush failed");
    }
    drop(ingestor);
    worker_handle.abort();

    Ok(())
}
