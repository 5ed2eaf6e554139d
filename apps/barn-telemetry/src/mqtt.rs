use crate::config::Config;
use crate::devices::DeviceEvent;
use crate::ingest::TelemetryIngestor;
use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use simd_json::prelude::ValueAsScalar;
use simd_json::BorrowedValue;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Duration};

/// Publishes handled at once; the event loop stops polling while all are busy.
pub const MAX_INFLIGHT_PUBLISHES: usize = 64;

/// Where a publish on one of the subscribed filters should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    Reading,
    DeviceStatus(&'a str),
    DeviceHeartbeat(&'a str),
    DeviceError(&'a str),
}

/// `<sensor_prefix>/<sensorId>` carries readings;
/// `<device_prefix>/devices/<deviceId>/{status,heartbeat,error}` carries lifecycle.
pub fn route_topic<'a>(sensor_prefix: &str, device_prefix: &str, topic: &'a str) -> Option<Route<'a>> {
    if let Some(rest) = topic
        .strip_prefix(sensor_prefix)
        .and_then(|rest| rest.strip_prefix('/'))
    {
        if !rest.is_empty() && !rest.contains('/') {
            return Some(Route::Reading);
        }
    }

    let rest = topic
        .strip_prefix(device_prefix)?
        .strip_prefix("/devices/")?;
    let (device_id, kind) = rest.split_once('/')?;
    if device_id.trim().is_empty() {
        return None;
    }
    match kind {
        "status" => Some(Route::DeviceStatus(device_id)),
        "heartbeat" => Some(Route::DeviceHeartbeat(device_id)),
        "error" => Some(Route::DeviceError(device_id)),
        _ => None,
    }
}

pub fn subscriptions(config: &Config) -> [String; 4] {
    let devices = format!("{}/devices/+", config.mqtt_device_topic_prefix);
    [
        format!("{}/+", config.mqtt_sensor_topic_prefix),
        format!("{devices}/status"),
        format!("{devices}/heartbeat"),
        format!("{devices}/error"),
    ]
}

pub async fn run_listener(config: Config, ingestor: TelemetryIngestor) -> Result<()> {
    let filters = subscriptions(&config);
    let inflight = Arc::new(Semaphore::new(MAX_INFLIGHT_PUBLISHES));
    'connect: loop {
        let mut mqttoptions = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);
        let stats = ingestor.stats();

        for filter in &filters {
            if let Err(err) = client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
                tracing::warn!(error=%err, topic=%filter, "failed to subscribe to MQTT; retrying");
                stats.set_mqtt_connected(false);
                sleep(Duration::from_secs(2)).await;
                continue 'connect;
            }
            tracing::info!(topic=%filter, "subscribed");
        }
        stats.set_mqtt_connected(true);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let received_at = Utc::now();
                    let Ok(permit) = inflight.clone().acquire_owned().await else {
                        continue;
                    };
                    let payload = publish.payload.to_vec();
                    let topic = publish.topic.clone();
                    let ingestor = ingestor.clone();
                    let sensor_prefix = config.mqtt_sensor_topic_prefix.clone();
                    let device_prefix = config.mqtt_device_topic_prefix.clone();
                    tokio::spawn(async move {
                        handle_publish(
                            &ingestor,
                            &sensor_prefix,
                            &device_prefix,
                            &topic,
                            payload,
                            received_at,
                        )
                        .await;
                        drop(permit);
                    });
                }
                Ok(_) => {}
                Err(err) => {
                    stats.set_mqtt_connected(false);
                    tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}

async fn handle_publish(
    ingestor: &TelemetryIngestor,
    sensor_prefix: &str,
    device_prefix: &str,
    topic: &str,
    mut payload: Vec<u8>,
    received_at: DateTime<Utc>,
) {
    let Some(route) = route_topic(sensor_prefix, device_prefix, topic) else {
        tracing::debug!(topic, "ignoring publish on unrouted topic");
        return;
    };

    let (device_id, kind) = match route {
        Route::Reading => {
            // Rejections are logged by the ingestor with the raw payload.
            match ingestor
                .ingest_payload(Some(topic), &payload, received_at)
                .await
            {
                Ok(report) => tracing::trace!(
                    topic,
                    level = %report.reading.alert_level,
                    cache = ?report.cache,
                    published = report.broadcast.is_some(),
                    handoff = ?report.handoff,
                    "reading ingested"
                ),
                Err(err) => tracing::debug!(error=%err, topic, "reading not ingested"),
            }
            return;
        }
        Route::DeviceStatus(id) => (id, DeviceTopic::Status),
        Route::DeviceHeartbeat(id) => (id, DeviceTopic::Heartbeat),
        Route::DeviceError(id) => (id, DeviceTopic::Error),
    };

    let raw = String::from_utf8_lossy(&payload).into_owned();
    let parsed = parse_device_payload(&mut payload);
    let Some(event) = parsed.to_event(kind) else {
        tracing::warn!(topic, payload = %raw, "device status message without a status");
        return;
    };
    let at = parsed.timestamp.unwrap_or(received_at);
    ingestor.record_device_event(device_id, event, at, parsed.device_type.as_deref());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceTopic {
    Status,
    Heartbeat,
    Error,
}

#[derive(Debug, Default, PartialEq)]
struct DeviceMessage {
    status: Option<String>,
    reason: Option<String>,
    message: Option<String>,
    error_code: Option<String>,
    device_type: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

impl DeviceMessage {
    fn to_event(&self, kind: DeviceTopic) -> Option<DeviceEvent> {
        match kind {
            DeviceTopic::Status => Some(DeviceEvent::from_status(
                self.status.as_deref()?,
                self.reason.as_deref(),
                self.message.clone(),
            )),
            DeviceTopic::Heartbeat => Some(DeviceEvent::Heartbeat),
            DeviceTopic::Error => Some(DeviceEvent::Error {
                error_code: self.error_code.clone(),
                message: self.message.clone(),
            }),
        }
    }
}

fn trimmed(value: Option<&BorrowedValue>) -> Option<String> {
    value
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

/// Lifecycle payloads are JSON objects; a bare non-JSON body on a status topic
/// is taken as the status itself. Heartbeats may be empty.
fn parse_device_payload(payload: &mut [u8]) -> DeviceMessage {
    let first = payload.iter().copied().find(|byte| !byte.is_ascii_whitespace());
    match first {
        None => return DeviceMessage::default(),
        Some(b'{') => {}
        Some(_) => {
            let text = std::str::from_utf8(payload).unwrap_or("").trim();
            return DeviceMessage {
                status: Some(text.trim_matches('"').to_string()).filter(|s| !s.is_empty()),
                ..DeviceMessage::default()
            };
        }
    }

    let Ok(BorrowedValue::Object(obj)) = simd_json::to_borrowed_value(payload) else {
        return DeviceMessage::default();
    };

    let timestamp = match obj.get("timestamp") {
        Some(value) => value
            .as_str()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
            .or_else(|| {
                value
                    .as_i64()
                    .or_else(|| value.as_u64().map(|v| v as i64))
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            }),
        None => None,
    };
    let device_type = match obj.get("metadata") {
        Some(BorrowedValue::Object(metadata)) => trimmed(metadata.get("type")),
        _ => None,
    };

    DeviceMessage {
        status: trimmed(obj.get("status")),
        reason: trimmed(obj.get("reason")),
        message: trimmed(obj.get("message")).or_else(|| trimmed(obj.get("error"))),
        error_code: trimmed(obj.get("errorCode")).or_else(|| trimmed(obj.get("code"))),
        device_type,
        timestamp,
    }
}
