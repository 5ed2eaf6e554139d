use crate::error::StoreUnavailableError;
use crate::model::SensorReading;
use crate::store::ReadingStore;
use anyhow::Result;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum BatchCommand {
    Reading(SensorReading),
    Flush(oneshot::Sender<()>),
}

/// Where a reading went when handed to persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    Queued,
    /// The queue was full; the reading went to the dead-letter sink instead.
    DeadLettered,
}

#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<BatchCommand>,
    stats: Arc<IngestStats>,
    overflow: DeadLetter,
}

impl PipelineHandle {
    pub fn new(tx: mpsc::Sender<BatchCommand>, stats: Arc<IngestStats>) -> Self {
        Self {
            tx,
            stats,
            overflow: DeadLetter::default(),
        }
    }

    /// Sink for readings that arrive while the queue is full.
    pub fn with_overflow(mut self, overflow: DeadLetter) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Never waits for queue capacity. A full queue dead-letters the reading;
    /// only a closed queue is an error.
    pub fn enqueue(&self, reading: SensorReading) -> Result<Handoff, StoreUnavailableError> {
        let queue_depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        match self.tx.try_send(BatchCommand::Reading(reading)) {
            Ok(()) => {
                tracing::trace!(queue_depth, "queued reading");
                Ok(Handoff::Queued)
            }
            Err(TrySendError::Full(command)) => {
                self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                let BatchCommand::Reading(lost) = command else {
                    return Ok(Handoff::DeadLettered);
                };
                self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    sensor = %lost.sensor_id,
                    ts = %lost.timestamp,
                    queue_depth = queue_depth - 1,
                    "persistence queue full; dead-lettering reading"
                );
                let overflow = self.overflow.clone();
                tokio::spawn(async move {
                    if let Err(err) = overflow.write(&[lost], "persistence queue full").await {
                        tracing::error!(error=%err, "failed to append dead-letter file");
                    }
                });
                Ok(Handoff::DeadLettered)
            }
            Err(TrySendError::Closed(command)) => {
                self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                if let BatchCommand::Reading(lost) = command {
                    tracing::error!(
                        sensor = %lost.sensor_id,
                        ts = %lost.timestamp,
                        "persistence queue closed; reading not queued"
                    );
                }
                Err(StoreUnavailableError::new("persistence queue closed"))
            }
        }
    }

    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(BatchCommand::Flush(tx)).await;
        let _ = rx.await;
        Ok(())
    }
}

#[derive(Debug)]
pub struct IngestStats {
    pub queue_depth: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub inflight_flushes: AtomicU64,
    pub persisted: AtomicU64,
    pub retries: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub rejected: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            queue_depth: AtomicU64::new(0),
            last_flush_unix_ms: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            average_flush_micros: AtomicU64::new(0),
            inflight_flushes: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based): base * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Where readings go after the last retry fails. Every reading is logged; with
/// a path configured each one is also appended as a JSON line.
#[derive(Debug, Clone, Default)]
pub struct DeadLetter {
    path: Option<PathBuf>,
}

impl DeadLetter {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub async fn write(&self, readings: &[SensorReading], reason: &str) -> Result<()> {
        let mut lines = String::new();
        for reading in readings {
            let line = serde_json::to_string(reading)?;
            tracing::error!(
                sensor = %reading.sensor_id,
                barn = %reading.barn_id,
                reading = %line,
                reason,
                "dead-lettered reading"
            );
            lines.push_str(&line);
            lines.push('\n');
        }

        if let Some(path) = &self.path {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(lines.as_bytes()).await?;
            file.flush().await?;
        }
        Ok(())
    }
}

pub struct WorkerSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry: RetryPolicy,
    pub dead_letter: DeadLetter,
}

pub fn spawn_worker(
    store: ReadingStore,
    mut rx: mpsc::Receiver<BatchCommand>,
    stats: Arc<IngestStats>,
    settings: WorkerSettings,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let batch_size = settings.batch_size.max(1);
        let mut buffer: Vec<SensorReading> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(settings.flush_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = flush(&store, &mut buffer, &stats, &settings).await {
                        tracing::warn!(error=%err, "flush on interval failed");
                    }
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(BatchCommand::Reading(reading)) => {
                            stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                            buffer.push(reading);
                            if buffer.len() >= batch_size {
                                if let Err(err) = flush(&store, &mut buffer, &stats, &settings).await {
                                    tracing::warn!(error=%err, "flush on batch size failed");
                                }
                            }
                        }
                        Some(BatchCommand::Flush(done)) => {
                            if let Err(err) = flush(&store, &mut buffer, &stats, &settings).await {
                                tracing::warn!(error=%err, "flush on demand failed");
                            }
                            let _ = done.send(());
                        }
                        None => {
                            if let Err(err) = flush(&store, &mut buffer, &stats, &settings).await {
                                tracing::warn!(error=%err, "flush during shutdown failed");
                            }
                            break;
                        }
                    }
                }
            }
        }
    })
}

/// Writes the buffered batch, retrying with backoff. After the last attempt the
/// batch is dead-lettered and the error returned.
async fn flush(
    store: &ReadingStore,
    buffer: &mut Vec<SensorReading>,
    stats: &Arc<IngestStats>,
    settings: &WorkerSettings,
) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }

    let started = Instant::now();
    let items = std::mem::take(buffer);
    let len = items.len();
    let max_attempts = settings.retry.max_attempts.max(1);
    stats.inflight_flushes.fetch_add(1, Ordering::Relaxed);

    let mut attempt = 0u32;
    let outcome = loop {
        attempt += 1;
        match store.insert_batch(&items).await {
            Ok(inserted) => break Ok(inserted),
            Err(err) => {
                stats.record_error(err.to_string());
                if attempt >= max_attempts {
                    break Err(err);
                }
                let delay = settings.retry.backoff(attempt);
                stats.retries.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %err,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    len,
                    store = store.kind(),
                    "batch insert failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    };
    stats.inflight_flushes.fetch_sub(1, Ordering::Relaxed);

    match outcome {
        Ok(inserted) => {
            let inserted = inserted as usize;
            if inserted < len {
                tracing::debug!(
                    inserted,
                    skipped = len.saturating_sub(inserted),
                    "skipped duplicate reading rows"
                );
            }
            stats.persisted.fetch_add(inserted as u64, Ordering::Relaxed);
            stats.last_batch_len.store(len as u64, Ordering::Relaxed);
            let now = Utc::now().timestamp_millis() as u64;
            stats.last_flush_unix_ms.store(now, Ordering::Relaxed);
            let micros = started.elapsed().as_micros() as u64;
            let prev = stats.average_flush_micros.load(Ordering::Relaxed);
            let avg = if prev == 0 {
                micros
            } else {
                (prev + micros) / 2
            };
            stats.average_flush_micros.store(avg, Ordering::Relaxed);
            stats.clear_error();
            tracing::debug!(len, micros, attempts = attempt, "flushed readings batch");
            Ok(())
        }
        Err(err) => {
            tracing::error!(error=%err, len, attempts = attempt, "giving up on readings batch");
            stats.dead_lettered.fetch_add(len as u64, Ordering::Relaxed);
            if let Err(dl_err) = settings.dead_letter.write(&items, &err.to_string()).await {
                tracing::error!(error=%dl_err, "failed to append dead-letter file");
            }
            Err(err.into())
        }
    }
}
