use crate::broadcast::{Subscription, Topic};
use crate::devices::DeviceEventType;
use crate::error::{InvalidFilterError, QueryError};
use crate::ingest::TelemetryIngestor;
use crate::model::AggregationPeriod;
use crate::store::{ReadingFilter, ReadingStore, SortOrder, DEFAULT_PAGE_LIMIT};
use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;

const MAX_LOG_LIMIT: usize = 1000;
const DEFAULT_LOG_LIMIT: usize = 50;
const DEFAULT_CHART_WINDOW_HOURS: i64 = 24;

#[derive(Clone)]
pub struct AppState {
    pub ingestor: TelemetryIngestor,
    pub store: ReadingStore,
    pub timezone: Tz,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    field: Option<&'static str>,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            field: None,
        }
    }
}

impl From<InvalidFilterError> for ApiError {
    fn from(err: InvalidFilterError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: err.to_string(),
            field: Some(err.field),
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::InvalidFilter(err) => err.into(),
            QueryError::Unavailable(err) => {
                tracing::error!(error = %err, "reading query failed");
                Self {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    message: err.to_string(),
                    field: None,
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.message, "field": self.field });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn blank_to_none(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_date(field: &'static str, raw: Option<String>) -> ApiResult<Option<DateTime<Utc>>> {
    match blank_to_none(raw) {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|_| InvalidFilterError::new(field, format!("{raw:?} is not an ISO-8601 timestamp")).into()),
    }
}

fn parse_number<T: std::str::FromStr>(field: &'static str, raw: Option<String>) -> ApiResult<Option<T>> {
    match blank_to_none(raw) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| InvalidFilterError::new(field, format!("{raw:?} is not a number")).into()),
    }
}

fn parse_aggregation(raw: Option<String>) -> ApiResult<Option<AggregationPeriod>> {
    match blank_to_none(raw) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<AggregationPeriod>()
            .map(Some)
            .map_err(|err| InvalidFilterError::new("aggregation", err.to_string()).into()),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadingsQuery {
    sensor_id: Option<String>,
    barn_id: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    aggregation: Option<String>,
    page: Option<String>,
    limit: Option<String>,
    sort_order: Option<String>,
}

impl ReadingsQuery {
    fn into_filter(self) -> ApiResult<ReadingFilter> {
        let sort_order = match blank_to_none(self.sort_order).as_deref() {
            None => SortOrder::default(),
            Some(raw) if raw.eq_ignore_ascii_case("asc") => SortOrder::Asc,
            Some(raw) if raw.eq_ignore_ascii_case("desc") => SortOrder::Desc,
            Some(raw) => {
                return Err(InvalidFilterError::new("sortOrder", format!("{raw:?} is not asc or desc")).into())
            }
        };
        // Ids are kept as sent so an explicit blank is rejected by validation.
        Ok(ReadingFilter {
            sensor_id: self.sensor_id,
            barn_id: self.barn_id,
            start_date: parse_date("startDate", self.start_date)?,
            end_date: parse_date("endDate", self.end_date)?,
            aggregation: parse_aggregation(self.aggregation)?.unwrap_or_default(),
            page: parse_number("page", self.page)?.unwrap_or(1),
            limit: parse_number("limit", self.limit)?.unwrap_or(DEFAULT_PAGE_LIMIT),
            sort_order,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestQuery {
    barn_id: Option<String>,
    sensor_ids: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartQuery {
    start_date: Option<String>,
    end_date: Option<String>,
    aggregation: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsQuery {
    limit: Option<String>,
    event_type: Option<String>,
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.ingestor.stats();
    let broadcaster = state.ingestor.broadcaster();
    Json(json!({
        "status": "ok",
        "store": state.store.kind(),
        "mqttConnected": stats.mqtt_connected.load(Ordering::Relaxed),
        "queueDepth": stats.queue_depth.load(Ordering::Relaxed),
        "cachedSensors": state.ingestor.latest().len(),
        "thresholds": state.ingestor.thresholds(),
        "globalSubscribers": broadcaster.subscriber_count(&Topic::Global),
        "barnChannels": broadcaster.barn_channel_count(),
        "published": broadcaster.stats().published.load(Ordering::Relaxed),
        "deliveries": broadcaster.stats().deliveries.load(Ordering::Relaxed),
    }))
}

async fn get_readings(
    State(state): State<AppState>,
    Query(query): Query<ReadingsQuery>,
) -> ApiResult<impl IntoResponse> {
    let filter = query.into_filter()?;
    let page = state.store.get_readings(&filter, state.timezone).await?;
    Ok(Json(page))
}

async fn get_latest(
    State(state): State<AppState>,
    Query(query): Query<LatestQuery>,
) -> ApiResult<impl IntoResponse> {
    let barn_id = blank_to_none(query.barn_id);
    let sensor_ids: Option<Vec<String>> = blank_to_none(query.sensor_ids).map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect()
    });
    let latest = state
        .ingestor
        .latest()
        .query(barn_id.as_deref(), sensor_ids.as_deref());
    Ok(Json(latest))
}

async fn get_chart(
    State(state): State<AppState>,
    Path(barn_id): Path<String>,
    Query(query): Query<ChartQuery>,
) -> ApiResult<impl IntoResponse> {
    let end = parse_date("endDate", query.end_date)?.unwrap_or_else(Utc::now);
    let start = parse_date("startDate", query.start_date)?
        .unwrap_or(end - Duration::hours(DEFAULT_CHART_WINDOW_HOURS));
    let aggregation = parse_aggregation(query.aggregation)?.unwrap_or(AggregationPeriod::Hourly);
    let chart = state
        .store
        .chart_data(&barn_id, start, end, aggregation, state.timezone)
        .await?;
    Ok(Json(chart))
}

async fn list_devices(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.ingestor.devices().list())
}

async fn device_statistics(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state
        .ingestor
        .devices()
        .statistics(&device_id, Utc::now())
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("unknown device {device_id}")))
}

async fn device_logs(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = parse_number::<usize>("limit", query.limit)?
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .clamp(1, MAX_LOG_LIMIT);
    let event_type = match blank_to_none(query.event_type) {
        None => None,
        Some(raw) => Some(
            raw.parse::<DeviceEventType>()
                .map_err(|err| ApiError::from(InvalidFilterError::new("eventType", err.to_string())))?,
        ),
    };
    state
        .ingestor
        .devices()
        .logs(&device_id, limit, event_type)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("unknown device {device_id}")))
}

fn sse(
    subscription: Subscription,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>> + Send + 'static> {
    let name = subscription.topic().event_name();
    tracing::info!(subscriber = %subscription.id(), channel = %name, "live stream opened");
    let stream = subscription
        .into_stream()
        .map(move |reading| Event::default().event(&name).json_data(reading.as_ref()));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn stream_global(State(state): State<AppState>) -> impl IntoResponse {
    sse(state.ingestor.broadcaster().subscribe_global())
}

async fn stream_barn(State(state): State<AppState>, Path(barn_id): Path<String>) -> impl IntoResponse {
    sse(state.ingestor.broadcaster().subscribe_barn(&barn_id))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/readings", get(get_readings))
        .route("/v1/readings/latest", get(get_latest))
        .route("/v1/charts/{barn_id}", get(get_chart))
        .route("/v1/devices", get(list_devices))
        .route("/v1/devices/{device_id}/statistics", get(device_statistics))
        .route("/v1/devices/{device_id}/logs", get(device_logs))
        .route("/v1/stream/global", get(stream_global))
        .route("/v1/stream/barns/{barn_id}", get(stream_barn))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http query api listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Broadcaster;
    use crate::classify::Thresholds;
    use crate::devices::{DeviceEvent, DeviceTracker};
    use crate::latest::LatestCache;
    use crate::pipeline::{spawn_worker, IngestStats, PipelineHandle, WorkerSettings};
    use crate::store::MemoryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn state() -> AppState {
        let store = ReadingStore::Memory(MemoryStore::new());
        let stats = Arc::new(IngestStats::new());
        let (tx, rx) = mpsc::channel(64);
        spawn_worker(
            store.clone(),
            rx,
            stats.clone(),
            WorkerSettings {
                batch_size: 100,
                flush_interval: std::time::Duration::from_secs(3600),
                retry: Default::default(),
                dead_letter: Default::default(),
            },
        );
        let ingestor = TelemetryIngestor::new(
            PipelineHandle::new(tx, stats),
            Thresholds::default(),
            LatestCache::new(),
            Broadcaster::new(16),
            DeviceTracker::new(Duration::hours(24), 100),
            std::time::Duration::from_secs(300),
        );
        AppState {
            ingestor,
            store,
            timezone: Tz::UTC,
        }
    }

    async fn seed(state: &AppState) {
        for (sensor, minute, methane) in [("S1", 0, 10), ("S1", 20, 20), ("S1", 50, 30), ("S2", 5, 700)] {
            let payload = format!(
                r#"{{"sensorId":"{sensor}","barnId":"B1","methanePpm":{methane},"co2Ppm":400,"nh3Ppm":5,"temperature":20,"humidity":50,"timestamp":"2024-03-01T09:{minute:02}:00Z"}}"#
            );
            state
                .ingestor
                .ingest_payload(None, payload.as_bytes(), Utc::now())
                .await
                .unwrap();
        }
        state.ingestor.flush().await.unwrap();
    }

    async fn get_json(state: &AppState, uri: &str) -> (StatusCode, Value) {
        let response = router(state.clone())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn healthz_reports_store_and_subscribers() {
        let state = state();
        let _sub = state.ingestor.broadcaster().subscribe_global();
        let (status, body) = get_json(&state, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"], "memory");
        assert_eq!(body["globalSubscribers"], 1);
    }

    #[tokio::test]
    async fn hourly_aggregation_over_http() {
        let state = state();
        seed(&state).await;

        let (status, body) = get_json(
            &state,
            "/v1/readings?sensorId=S1&aggregation=hourly&startDate=2024-03-01T09:00:00Z&endDate=2024-03-01T10:00:00Z",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        let row = &body["data"][0];
        assert_eq!(row["readingCount"], 3);
        assert_eq!(row["avgMethanePpm"], 20.0);
        assert_eq!(row["minMethanePpm"], 10.0);
        assert_eq!(row["maxMethanePpm"], 30.0);
    }

    #[tokio::test]
    async fn raw_readings_page_newest_first() {
        let state = state();
        seed(&state).await;

        let (status, body) = get_json(&state, "/v1/readings?barnId=B1&limit=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 4);
        assert_eq!(body["totalPages"], 2);
        assert_eq!(body["data"][0]["timestamp"], "2024-03-01T09:50:00Z");
        assert_eq!(body["data"][1]["sensorId"], "S1");
    }

    #[tokio::test]
    async fn malformed_filters_are_bad_requests() {
        let state = state();
        let (status, body) = get_json(
            &state,
            "/v1/readings?startDate=2024-03-02T00:00:00Z&endDate=2024-03-01T00:00:00Z",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "startDate");

        let (status, body) = get_json(&state, "/v1/readings?limit=5000").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["field"], "limit");

        let (status, _) = get_json(&state, "/v1/readings?aggregation=monthly").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_range_is_an_empty_page() {
        let state = state();
        seed(&state).await;
        let (status, body) = get_json(
            &state,
            "/v1/readings?startDate=2030-01-01T00:00:00Z&endDate=2030-01-02T00:00:00Z",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 0);
        assert_eq!(body["data"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn unavailable_store_is_503() {
        let memory = MemoryStore::new();
        let mut state = state();
        state.store = ReadingStore::Memory(memory.clone());
        memory.set_available(false);
        let (status, _) = get_json(&state, "/v1/readings").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn latest_filters_by_barn_and_sensor_ids() {
        let state = state();
        seed(&state).await;
        let (_, body) = get_json(&state, "/v1/readings/latest?barnId=B1&sensorIds=S2,%20S9").await;
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["sensorId"], "S2");
        assert_eq!(rows[0]["reading"]["alertLevel"], "warning");
    }

    #[tokio::test]
    async fn chart_has_a_series_per_metric() {
        let state = state();
        seed(&state).await;
        let (status, body) = get_json(
            &state,
            "/v1/charts/B1?startDate=2024-03-01T00:00:00Z&endDate=2024-03-02T00:00:00Z&aggregation=hourly",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let series = body["series"].as_array().unwrap();
        assert_eq!(series.len(), 6);
        assert_eq!(series[0]["metric"], "methanePpm");
        assert_eq!(series[0]["points"][0]["value"], 190.0);
        assert_eq!(series[5]["points"][0]["value"], 4.0);
    }

    #[tokio::test]
    async fn device_endpoints_report_statistics_and_logs() {
        let state = state();
        let now = Utc::now();
        let devices = state.ingestor.devices();
        devices.record("RFID-9", DeviceEvent::Connected, now - Duration::hours(2), None);
        devices.record("RFID-9", DeviceEvent::Heartbeat, now - Duration::hours(1), None);

        let (status, body) = get_json(&state, "/v1/devices/RFID-9/statistics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "online");
        assert_eq!(body["deviceType"], "rfid_reader");
        assert_eq!(body["totalConnections"], 1);

        let (_, body) = get_json(&state, "/v1/devices/RFID-9/logs?limit=1").await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["eventType"], "heartbeat");

        let (_, body) = get_json(&state, "/v1/devices/RFID-9/logs?eventType=connected").await;
        assert_eq!(body[0]["eventType"], "connected");

        let (status, _) = get_json(&state, "/v1/devices/NOPE/statistics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = get_json(&state, "/v1/devices").await;
        assert_eq!(body[0]["deviceId"], "RFID-9");
    }
}
