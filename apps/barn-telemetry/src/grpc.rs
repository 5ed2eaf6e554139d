use crate::devices::DeviceEvent;
use crate::devices::DeviceEventType;
use crate::error::IngestError;
use crate::ingest::TelemetryIngestor;
use crate::pipeline::IngestStats;
use anyhow::Result;
use chrono::{TimeZone, Utc};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{transport::Server, Request, Response, Status};
use tonic_health::server::health_reporter;

pub mod proto {
    tonic::include_proto!("barn.ingest");
}

use proto::ingestor_server::{Ingestor, IngestorServer};
use proto::{
    DeviceEventRequest, DeviceEventResponse, HealthRequest, HealthResponse, PushReadingsRequest,
    PushReadingsResponse, Rejection,
};

#[derive(Clone)]
pub struct IngestService {
    ingestor: TelemetryIngestor,
}

impl IngestService {
    pub fn new(ingestor: TelemetryIngestor) -> Self {
        Self { ingestor }
    }

    fn to_health(&self, stats: &Arc<IngestStats>) -> HealthResponse {
        HealthResponse {
            queue_depth: stats.queue_depth.load(Ordering::Relaxed),
            last_flush_unix_ms: stats.last_flush_unix_ms.load(Ordering::Relaxed),
            last_batch_len: stats.last_batch_len.load(Ordering::Relaxed),
            average_flush_ms: stats.average_flush_micros.load(Ordering::Relaxed) as f64 / 1000.0,
            mqtt_connected: stats.mqtt_connected.load(Ordering::Relaxed),
            inflight_flushes: stats.inflight_flushes.load(Ordering::Relaxed),
            last_error: stats.last_error().unwrap_or_default(),
            build: env!("CARGO_PKG_VERSION").to_string(),
            retries: stats.retries.load(Ordering::Relaxed),
            dead_lettered: stats.dead_lettered.load(Ordering::Relaxed),
            rejected: stats.rejected.load(Ordering::Relaxed),
            persisted: stats.persisted.load(Ordering::Relaxed),
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[tonic::async_trait]
impl Ingestor for IngestService {
    async fn get_health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        let stats = self.ingestor.stats();
        Ok(Response::new(self.to_health(&stats)))
    }

    /// Same path as MQTT. Invalid payloads are reported per index and do not
    /// fail the call; an unreachable store does.
    async fn push_readings(
        &self,
        request: Request<PushReadingsRequest>,
    ) -> Result<Response<PushReadingsResponse>, Status> {
        let payload = request.into_inner();
        let received_at = Utc::now();
        let mut accepted = 0u64;
        let mut rejected = Vec::new();

        for (index, reading) in payload.readings.into_iter().enumerate() {
            let topic = Some(reading.topic.as_str()).filter(|t| !t.trim().is_empty());
            match self
                .ingestor
                .ingest_payload(topic, &reading.payload, received_at)
                .await
            {
                Ok(_) => accepted += 1,
                Err(IngestError::Invalid(err)) => rejected.push(Rejection {
                    index: index as u32,
                    field: err.field().unwrap_or_default().to_string(),
                    reason: err.to_string(),
                }),
                Err(IngestError::Unavailable(err)) => {
                    return Err(Status::unavailable(format!("failed to ingest: {err}")));
                }
            }
        }

        if payload.force_flush {
            let _ = self.ingestor.flush().await;
        }

        let stats = self.ingestor.stats();
        Ok(Response::new(PushReadingsResponse {
            accepted,
            queued: stats.queue_depth.load(Ordering::Relaxed),
            rejected,
        }))
    }

    async fn record_device_event(
        &self,
        request: Request<DeviceEventRequest>,
    ) -> Result<Response<DeviceEventResponse>, Status> {
        let req = request.into_inner();
        let device_id = req.device_id.trim().to_string();
        if device_id.is_empty() {
            return Err(Status::invalid_argument("device_id is required"));
        }
        let event_type: DeviceEventType = req
            .event_type
            .parse()
            .map_err(|err| Status::invalid_argument(format!("{err}")))?;
        let at = if req.timestamp_ms == 0 {
            Utc::now()
        } else {
            Utc.timestamp_millis_opt(req.timestamp_ms)
                .single()
                .ok_or_else(|| Status::invalid_argument("invalid timestamp"))?
        };

        let status = non_empty(req.status);
        if event_type == DeviceEventType::StatusChange && status.is_none() {
            return Err(Status::invalid_argument("status_change requires status"));
        }
        let reason = non_empty(req.reason);
        let event = DeviceEvent::from_parts(
            event_type,
            reason.as_deref(),
            non_empty(req.message),
            non_empty(req.error_code),
            status.as_deref(),
        );
        let device_type = non_empty(req.device_type);

        let entry = self
            .ingestor
            .record_device_event(&device_id, event, at, device_type.as_deref())
            .ok_or_else(|| Status::invalid_argument("device_id is required"))?;
        let state = self
            .ingestor
            .devices()
            .state(&entry.device_id)
            .ok_or_else(|| Status::not_found(format!("unknown device {device_id}")))?;

        Ok(Response::new(DeviceEventResponse {
            status: state.status.as_str().to_string(),
            total_connections: state.total_connections,
            total_disconnections: state.total_disconnections,
            error_count: state.error_count,
        }))
    }

    async fn flush(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        let _ = self.ingestor.flush().await;
        let stats = self.ingestor.stats();
        Ok(Response::new(self.to_health(&stats)))
    }
}

pub async fn serve_uds(socket_path: &str, service: IngestService) -> Result<()> {
    if Path::new(socket_path).exists() {
        tokio::fs::remove_file(socket_path).await.ok();
    }

    let uds = UnixListener::bind(socket_path)?;
    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_serving::<IngestorServer<IngestService>>()
        .await;

    let incoming = UnixListenerStream::new(uds);

    Server::builder()
        .add_service(health_service)
        .add_service(IngestorServer::new(service))
        .serve_with_incoming(incoming)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::proto::RawReading;
    use super::*;
    use crate::broadcast::Broadcaster;
    use crate::classify::Thresholds;
    use crate::devices::DeviceTracker;
    use crate::latest::LatestCache;
    use crate::pipeline::{spawn_worker, IngestStats, PipelineHandle, WorkerSettings};
    use crate::store::{MemoryStore, ReadingStore};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn service(memory: &MemoryStore) -> IngestService {
        let stats = Arc::new(IngestStats::new());
        let (tx, rx) = mpsc::channel(16);
        spawn_worker(
            ReadingStore::Memory(memory.clone()),
            rx,
            stats.clone(),
            WorkerSettings {
                batch_size: 10,
                flush_interval: Duration::from_secs(3600),
                retry: Default::default(),
                dead_letter: Default::default(),
            },
        );
        IngestService::new(TelemetryIngestor::new(
            PipelineHandle::new(tx, stats),
            Thresholds::default(),
            LatestCache::new(),
            Broadcaster::new(8),
            DeviceTracker::new(chrono::Duration::hours(24), 50),
            Duration::from_secs(300),
        ))
    }

    #[tokio::test]
    async fn push_readings_reports_rejections_by_index() {
        let memory = MemoryStore::new();
        let svc = service(&memory);
        let good = br#"{"sensorId":"S1","barnId":"B1","methanePpm":1,"co2Ppm":1,"nh3Ppm":1,"temperature":1,"humidity":1,"timestamp":"2024-03-01T09:00:00Z"}"#;
        let bad = br#"{"sensorId":"S1","barnId":"B1","methanePpm":1,"co2Ppm":1,"nh3Ppm":1,"temperature":1}"#;

        let response = svc
            .push_readings(Request::new(PushReadingsRequest {
                readings: vec![
                    RawReading {
                        topic: "sensors/gas/S1".into(),
                        payload: good.to_vec(),
                    },
                    RawReading {
                        topic: String::new(),
                        payload: bad.to_vec(),
                    },
                ],
                force_flush: true,
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.accepted, 1);
        assert_eq!(response.rejected.len(), 1);
        assert_eq!(response.rejected[0].index, 1);
        assert_eq!(response.rejected[0].field, "humidity");
        assert_eq!(memory.len().await, 1);

        let health = svc
            .get_health(Request::new(HealthRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(health.persisted, 1);
        assert_eq!(health.rejected, 1);
    }

    #[tokio::test]
    async fn record_device_event_drives_the_state_machine() {
        let svc = service(&MemoryStore::new());
        let send = |event_type: &str, reason: &str| DeviceEventRequest {
            device_id: "RFID-1".into(),
            event_type: event_type.into(),
            reason: reason.into(),
            ..Default::default()
        };

        let connected = svc
            .record_device_event(Request::new(send("connected", "")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(connected.status, "online");
        assert_eq!(connected.total_connections, 1);

        let dropped = svc
            .record_device_event(Request::new(send("disconnected", "network lost")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(dropped.status, "offline");
        assert_eq!(dropped.total_disconnections, 1);

        let err = svc
            .record_device_event(Request::new(send("rebooted", "")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        let err = svc
            .record_device_event(Request::new(DeviceEventRequest {
                device_id: "  ".into(),
                event_type: "heartbeat".into(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }
}
