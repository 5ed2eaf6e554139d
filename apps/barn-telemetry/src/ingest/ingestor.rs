use super::TelemetryIngestor;
use crate::broadcast::{Broadcaster, PublishOutcome, ReadingEvent};
use crate::classify::{classify_reading, Thresholds};
use crate::devices::{DeviceEvent, DeviceLogEntry, DeviceTracker};
use crate::error::IngestError;
use crate::latest::{CacheUpdate, LatestCache};
use crate::model::{AlertLevel, SensorReading, ValidatedReading};
use crate::pipeline::{Handoff, IngestStats, PipelineHandle};
use crate::telemetry::{sensor_id_from_topic, validate_payload};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Outcome of one accepted reading.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub reading: SensorReading,
    pub cache: CacheUpdate,
    /// `None` when the reading was older than (or equal to) the cached one and
    /// so was not published.
    pub broadcast: Option<PublishOutcome>,
    pub handoff: Handoff,
}

impl TelemetryIngestor {
    pub fn new(
        pipeline: PipelineHandle,
        thresholds: Thresholds,
        latest: LatestCache,
        broadcaster: Broadcaster,
        devices: DeviceTracker,
        heartbeat_timeout: std::time::Duration,
    ) -> Self {
        let heartbeat_timeout = ChronoDuration::from_std(heartbeat_timeout)
            .unwrap_or_else(|_| ChronoDuration::minutes(5));
        Self {
            pipeline,
            thresholds,
            latest,
            broadcaster,
            devices,
            heartbeat_timeout,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.pipeline.stats()
    }

    pub async fn flush(&self) -> Result<()> {
        self.pipeline.flush().await
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn latest(&self) -> &LatestCache {
        &self.latest
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn devices(&self) -> &DeviceTracker {
        &self.devices
    }

    /// Validates a raw JSON payload and pushes it through the pipeline. A
    /// rejected payload is logged with its raw text and never reaches the
    /// store, cache or subscribers.
    pub async fn ingest_payload(
        &self,
        topic: Option<&str>,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<IngestReport, IngestError> {
        // simd-json parses in place, so validate a scratch copy and keep the
        // raw bytes for the rejection log.
        let mut scratch = payload.to_vec();
        match validate_payload(&mut scratch, received_at) {
            Ok(validated) => self.ingest_validated(validated).await,
            Err(err) => {
                self.stats().rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    topic = topic.unwrap_or("-"),
                    sensor = topic.and_then(sensor_id_from_topic).unwrap_or("-"),
                    field = err.field().unwrap_or("-"),
                    payload = %String::from_utf8_lossy(payload),
                    error = %err,
                    "rejected sensor payload"
                );
                Err(err.into())
            }
        }
    }

    pub async fn ingest_validated(
        &self,
        validated: ValidatedReading,
    ) -> Result<IngestReport, IngestError> {
        let (reading, classification) = classify_reading(validated, &self.thresholds);

        // Publishing happens under the sensor's cache slot, so subscribers see
        // one sensor's readings in timestamp order.
        let (cache, broadcast) = self.latest.offer_with(&reading, |accepted| {
            self.broadcaster.publish(ReadingEvent::from(accepted))
        });
        if broadcast.is_none() {
            tracing::debug!(
                sensor = %reading.sensor_id,
                ts = %reading.timestamp,
                ?cache,
                "reading not newer than cached; persisted only"
            );
        }
        self.devices.touch(&reading.sensor_id, Utc::now());

        if reading.alert_level == AlertLevel::Danger {
            tracing::warn!(
                sensor = %reading.sensor_id,
                barn = %reading.barn_id,
                gases = %classification.describe(AlertLevel::Danger),
                "critical gas levels detected in barn {}",
                reading.barn_id
            );
        }

        // Every validated reading is persisted, in order or not; historical
        // buckets need the complete set.
        let handoff = self.pipeline.enqueue(reading.clone())?;

        Ok(IngestReport {
            reading,
            cache,
            broadcast,
            handoff,
        })
    }

    pub fn record_device_event(
        &self,
        device_id: &str,
        event: DeviceEvent,
        at: DateTime<Utc>,
        type_hint: Option<&str>,
    ) -> Option<DeviceLogEntry> {
        self.devices.record(device_id, event, at, type_hint)
    }

    /// Disconnects online devices that have gone quiet for longer than the
    /// heartbeat timeout.
    pub fn sweep_stale_devices(&self, now: DateTime<Utc>) -> Vec<String> {
        let swept = self.devices.sweep_stale(now, self.heartbeat_timeout);
        for device_id in &swept {
            tracing::warn!(
                device = %device_id,
                timeout_secs = self.heartbeat_timeout.num_seconds(),
                "device heartbeat timed out"
            );
        }
        swept
    }
}
