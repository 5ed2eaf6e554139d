use crate::aggregate::round2;
use crate::error::ParseEnumError;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    #[default]
    Offline,
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    GasSensor,
    RfidReader,
}

impl DeviceType {
    /// Explicit type from metadata wins, then hints in the id, then gas sensor.
    pub fn infer(device_id: &str, hint: Option<&str>) -> Self {
        match hint.map(|raw| raw.trim().to_ascii_lowercase()).as_deref() {
            Some("rfid_reader" | "rfid" | "reader") => return DeviceType::RfidReader,
            Some("gas_sensor" | "gas" | "sensor") => return DeviceType::GasSensor,
            _ => {}
        }
        let id = device_id.to_ascii_uppercase();
        if id.contains("GAS") || id.contains("SENSOR") {
            DeviceType::GasSensor
        } else if id.contains("RFID") || id.contains("READER") {
            DeviceType::RfidReader
        } else {
            DeviceType::GasSensor
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectReason {
    Intentional,
    Timeout,
    Error,
    Network,
    Unknown,
}

impl DisconnectReason {
    /// Maps a free-text reason reported by firmware.
    pub fn from_raw(reason: Option<&str>) -> Self {
        let Some(reason) = reason.map(str::to_ascii_lowercase) else {
            return DisconnectReason::Unknown;
        };
        if reason.contains("intentional") || reason.contains("graceful") {
            DisconnectReason::Intentional
        } else if reason.contains("timeout") {
            DisconnectReason::Timeout
        } else if reason.contains("error") {
            DisconnectReason::Error
        } else if reason.contains("network") {
            DisconnectReason::Network
        } else {
            DisconnectReason::Unknown
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEventType {
    Connected,
    Disconnected,
    Heartbeat,
    Error,
    StatusChange,
}

impl FromStr for DeviceEventType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "connected" => Ok(DeviceEventType::Connected),
            "disconnected" => Ok(DeviceEventType::Disconnected),
            "heartbeat" => Ok(DeviceEventType::Heartbeat),
            "error" => Ok(DeviceEventType::Error),
            "status_change" | "status-change" => Ok(DeviceEventType::StatusChange),
            other => Err(ParseEnumError {
                kind: "device event type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "eventType", rename_all = "snake_case")]
pub enum DeviceEvent {
    Connected,
    Disconnected {
        #[serde(rename = "disconnectReason")]
        reason: DisconnectReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Heartbeat,
    Error {
        #[serde(rename = "errorCode", skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    StatusChange {
        #[serde(rename = "reportedStatus")]
        reported: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl DeviceEvent {
    pub fn event_type(&self) -> DeviceEventType {
        match self {
            DeviceEvent::Connected => DeviceEventType::Connected,
            DeviceEvent::Disconnected { .. } => DeviceEventType::Disconnected,
            DeviceEvent::Heartbeat => DeviceEventType::Heartbeat,
            DeviceEvent::Error { .. } => DeviceEventType::Error,
            DeviceEvent::StatusChange { .. } => DeviceEventType::StatusChange,
        }
    }

    /// Status topics report `online|connected|offline|disconnected`; anything
    /// else is kept as an audit-only status change.
    pub fn from_status(status: &str, reason: Option<&str>, message: Option<String>) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "online" | "connected" => DeviceEvent::Connected,
            "offline" | "disconnected" => DeviceEvent::Disconnected {
                reason: DisconnectReason::from_raw(reason),
                message,
            },
            _ => DeviceEvent::StatusChange {
                reported: status.trim().to_string(),
                message,
            },
        }
    }

    pub fn from_parts(
        event_type: DeviceEventType,
        reason: Option<&str>,
        message: Option<String>,
        error_code: Option<String>,
        status: Option<&str>,
    ) -> Self {
        match event_type {
            DeviceEventType::Connected => DeviceEvent::Connected,
            DeviceEventType::Disconnected => DeviceEvent::Disconnected {
                reason: DisconnectReason::from_raw(reason),
                message,
            },
            DeviceEventType::Heartbeat => DeviceEvent::Heartbeat,
            DeviceEventType::Error => DeviceEvent::Error {
                error_code,
                message,
            },
            DeviceEventType::StatusChange => DeviceEvent::StatusChange {
                reported: status.unwrap_or_default().to_string(),
                message,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLogEntry {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub previous_status: DeviceStatus,
    pub status: DeviceStatus,
    #[serde(flatten)]
    pub event: DeviceEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConnectionState {
    pub device_id: String,
    pub device_type: DeviceType,
    pub status: DeviceStatus,
    pub total_connections: u64,
    pub total_disconnections: u64,
    pub error_count: u64,
    pub registered_at: DateTime<Utc>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_disconnect_reason: Option<DisconnectReason>,
    pub last_disconnect_message: Option<String>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
}

impl DeviceConnectionState {
    fn new(device_id: &str, device_type: DeviceType, at: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            device_type,
            status: DeviceStatus::Offline,
            total_connections: 0,
            total_disconnections: 0,
            error_count: 0,
            registered_at: at,
            last_connected_at: None,
            last_disconnected_at: None,
            last_heartbeat_at: None,
            last_error_at: None,
            last_seen_at: None,
            last_disconnect_reason: None,
            last_disconnect_message: None,
            last_error_code: None,
            last_error_message: None,
        }
    }

    fn apply(&mut self, event: &DeviceEvent, at: DateTime<Utc>) {
        match event {
            DeviceEvent::Connected => {
                self.status = DeviceStatus::Online;
                self.total_connections += 1;
                self.last_connected_at = Some(at);
                self.last_seen_at = Some(at);
            }
            DeviceEvent::Disconnected { reason, message } => {
                self.status = DeviceStatus::Offline;
                self.total_disconnections += 1;
                self.last_disconnected_at = Some(at);
                self.last_disconnect_reason = Some(*reason);
                self.last_disconnect_message = message.clone();
                if *reason == DisconnectReason::Error {
                    self.error_count += 1;
                    self.last_error_at = Some(at);
                    self.last_error_message = message.clone();
                }
            }
            DeviceEvent::Heartbeat => {
                self.last_heartbeat_at = Some(at);
                self.last_seen_at = Some(at);
            }
            DeviceEvent::Error {
                error_code,
                message,
            } => {
                self.status = DeviceStatus::Error;
                self.error_count += 1;
                self.last_error_at = Some(at);
                self.last_error_code = error_code.clone();
                self.last_error_message = message.clone();
            }
            DeviceEvent::StatusChange { .. } => {}
        }
    }

    fn last_activity(&self) -> Option<DateTime<Utc>> {
        [
            self.last_heartbeat_at,
            self.last_seen_at,
            self.last_connected_at,
        ]
        .into_iter()
        .flatten()
        .max()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventCounts {
    pub connected: u64,
    pub disconnected: u64,
    pub heartbeat: u64,
    pub error: u64,
    pub status_change: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatistics {
    #[serde(flatten)]
    pub state: DeviceConnectionState,
    pub uptime_percentage: f64,
    pub uptime_window_hours: f64,
    pub event_counts: EventCounts,
}

/// One stretch of `online` time. `end` is `None` while the device is still up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnlineSpan {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

/// Connection history kept apart from the capped event log, so heartbeat
/// volume never evicts the connect that opened the current session.
#[derive(Debug, Default)]
struct UptimeHistory {
    spans: VecDeque<OnlineSpan>,
    last_event_at: Option<DateTime<Utc>>,
}

impl UptimeHistory {
    fn observe(&mut self, event: &DeviceEvent, at: DateTime<Utc>, window: Duration) {
        let latest = self.last_event_at.map_or(at, |seen| seen.max(at));
        self.last_event_at = Some(latest);
        match event {
            DeviceEvent::Connected => {
                if !self.spans.back().is_some_and(|span| span.end.is_none()) {
                    self.spans.push_back(OnlineSpan {
                        start: at,
                        end: None,
                    });
                }
            }
            DeviceEvent::Disconnected { .. } | DeviceEvent::Error { .. } => {
                if let Some(span) = self.spans.back_mut().filter(|span| span.end.is_none()) {
                    span.end = Some(at.max(span.start));
                }
            }
            DeviceEvent::Heartbeat | DeviceEvent::StatusChange { .. } => {}
        }

        // Nothing that closed before the newest event's window can count again.
        let horizon = latest - window;
        while self
            .spans
            .front()
            .is_some_and(|span| span.end.is_some_and(|end| end < horizon))
        {
            self.spans.pop_front();
        }
    }
}

/// Online time within `[window_end - window, window_end]` as a percentage.
///
/// Open spans run to `window_end`. A device with no recorded event inside the
/// window reports 0.
pub fn uptime_percentage(
    spans: &[OnlineSpan],
    last_event_at: Option<DateTime<Utc>>,
    window_end: DateTime<Utc>,
    window: Duration,
) -> f64 {
    if window <= Duration::zero() {
        return 0.0;
    }
    let window_start = window_end - window;
    if !last_event_at.is_some_and(|at| at >= window_start) {
        return 0.0;
    }

    let online = spans
        .iter()
        .map(|span| {
            let from = span.start.max(window_start);
            let to = span.end.unwrap_or(window_end).min(window_end);
            (to - from).max(Duration::zero())
        })
        .fold(Duration::zero(), |total, span| total + span);

    let pct = online.num_milliseconds() as f64 / window.num_milliseconds() as f64 * 100.0;
    round2(pct.clamp(0.0, 100.0))
}

#[derive(Debug)]
struct DeviceRecord {
    state: DeviceConnectionState,
    log: VecDeque<DeviceLogEntry>,
    uptime: UptimeHistory,
}

type Slot = Arc<Mutex<DeviceRecord>>;

/// Connection state per device. The map lock is only taken for writing when a
/// device registers; events lock the one device they concern.
#[derive(Clone)]
pub struct DeviceTracker {
    devices: Arc<RwLock<HashMap<String, Slot>>>,
    uptime_window: Duration,
    log_capacity: usize,
}

impl DeviceTracker {
    pub fn new(uptime_window: Duration, log_capacity: usize) -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            uptime_window,
            log_capacity: log_capacity.max(1),
        }
    }

    fn existing(&self, device_id: &str) -> Option<Slot> {
        self.devices
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(device_id)
            .cloned()
    }

    fn slot(&self, device_id: &str, type_hint: Option<&str>, at: DateTime<Utc>) -> Slot {
        if let Some(slot) = self.existing(device_id) {
            return slot;
        }
        let mut devices = self
            .devices
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        devices
            .entry(device_id.to_string())
            .or_insert_with(|| {
                let device_type = DeviceType::infer(device_id, type_hint);
                tracing::info!(device = %device_id, ?device_type, "auto-registering device");
                Arc::new(Mutex::new(DeviceRecord {
                    state: DeviceConnectionState::new(device_id, device_type, at),
                    log: VecDeque::new(),
                    uptime: UptimeHistory::default(),
                }))
            })
            .clone()
    }

    /// Applies one lifecycle event and appends it to the device log. Returns
    /// `None` only for a blank device id.
    pub fn record(
        &self,
        device_id: &str,
        event: DeviceEvent,
        at: DateTime<Utc>,
        type_hint: Option<&str>,
    ) -> Option<DeviceLogEntry> {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return None;
        }
        let slot = self.slot(device_id, type_hint, at);
        let mut record = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let previous_status = record.state.status;
        record.state.apply(&event, at);
        record.uptime.observe(&event, at, self.uptime_window);
        let entry = DeviceLogEntry {
            device_id: device_id.to_string(),
            timestamp: at,
            previous_status,
            status: record.state.status,
            event,
        };
        if record.log.len() >= self.log_capacity {
            record.log.pop_front();
        }
        record.log.push_back(entry.clone());

        if previous_status != record.state.status {
            tracing::info!(
                device = %device_id,
                from = previous_status.as_str(),
                to = record.state.status.as_str(),
                event = ?entry.event.event_type(),
                "device status changed"
            );
        }
        Some(entry)
    }

    /// A reading arrived from this device; no log entry.
    pub fn touch(&self, device_id: &str, at: DateTime<Utc>) {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return;
        }
        let slot = self.slot(device_id, None, at);
        let mut record = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if record.state.last_seen_at.map_or(true, |seen| seen < at) {
            record.state.last_seen_at = Some(at);
        }
    }

    pub fn state(&self, device_id: &str) -> Option<DeviceConnectionState> {
        let slot = self.existing(device_id)?;
        let record = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(record.state.clone())
    }

    pub fn statistics(&self, device_id: &str, now: DateTime<Utc>) -> Option<DeviceStatistics> {
        let slot = self.existing(device_id)?;
        let record = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let log: Vec<DeviceLogEntry> = record.log.iter().cloned().collect();
        let spans: Vec<OnlineSpan> = record.uptime.spans.iter().copied().collect();

        let mut event_counts = EventCounts::default();
        for entry in &log {
            match entry.event.event_type() {
                DeviceEventType::Connected => event_counts.connected += 1,
                DeviceEventType::Disconnected => event_counts.disconnected += 1,
                DeviceEventType::Heartbeat => event_counts.heartbeat += 1,
                DeviceEventType::Error => event_counts.error += 1,
                DeviceEventType::StatusChange => event_counts.status_change += 1,
            }
        }

        Some(DeviceStatistics {
            state: record.state.clone(),
            uptime_percentage: uptime_percentage(
                &spans,
                record.uptime.last_event_at,
                now,
                self.uptime_window,
            ),
            uptime_window_hours: self.uptime_window.num_minutes() as f64 / 60.0,
            event_counts,
        })
    }

    /// Newest first, optionally restricted to one event type.
    pub fn logs(
        &self,
        device_id: &str,
        limit: usize,
        event_type: Option<DeviceEventType>,
    ) -> Option<Vec<DeviceLogEntry>> {
        let slot = self.existing(device_id)?;
        let record = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entries: Vec<DeviceLogEntry> = record
            .log
            .iter()
            .rev()
            .filter(|entry| event_type.map_or(true, |wanted| entry.event.event_type() == wanted))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(limit);
        Some(entries)
    }

    pub fn list(&self) -> Vec<DeviceConnectionState> {
        let slots: Vec<Slot> = self
            .devices
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        let mut states: Vec<DeviceConnectionState> = slots
            .iter()
            .map(|slot| {
                slot.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .state
                    .clone()
            })
            .collect();
        states.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        states
    }

    /// Marks online devices silent for longer than `timeout` as disconnected
    /// with reason `timeout`. Returns the affected ids.
    pub fn sweep_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let cutoff = now - timeout;
        let stale: Vec<String> = self
            .list()
            .into_iter()
            .filter(|state| state.status == DeviceStatus::Online)
            .filter(|state| state.last_activity().map_or(true, |seen| seen < cutoff))
            .map(|state| state.device_id)
            .collect();

        let mut swept = Vec::with_capacity(stale.len());
        for device_id in stale {
            // Re-check under the device lock; a heartbeat may have landed.
            let still_stale = self.existing(&device_id).is_some_and(|slot| {
                let record = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                record.state.status == DeviceStatus::Online
                    && record
                        .state
                        .last_activity()
                        .map_or(true, |seen| seen < cutoff)
            });
            if !still_stale {
                continue;
            }
            let message = format!(
                "No heartbeat received for {} seconds",
                timeout.num_seconds()
            );
            self.record(
                &device_id,
                DeviceEvent::Disconnected {
                    reason: DisconnectReason::Timeout,
                    message: Some(message),
                },
                now,
                None,
            );
            swept.push(device_id);
        }
        swept
    }
}
