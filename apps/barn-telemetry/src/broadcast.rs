use crate::error::BroadcastError;
use crate::model::{AlertLevel, SensorReading};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use uuid::Uuid;

pub const GLOBAL_EVENT: &str = "reading:global";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingValues {
    pub methane_ppm: f64,
    pub co2_ppm: f64,
    pub nh3_ppm: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: DateTime<Utc>,
}

/// Payload of both `reading:<barnId>` and `reading:global`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingEvent {
    pub sensor_id: String,
    pub barn_id: String,
    pub reading: ReadingValues,
    pub alert_level: AlertLevel,
}

impl From<&SensorReading> for ReadingEvent {
    fn from(reading: &SensorReading) -> Self {
        Self {
            sensor_id: reading.sensor_id.clone(),
            barn_id: reading.barn_id.clone(),
            reading: ReadingValues {
                methane_ppm: reading.methane_ppm,
                co2_ppm: reading.co2_ppm,
                nh3_ppm: reading.nh3_ppm,
                temperature: reading.temperature,
                humidity: reading.humidity,
                timestamp: reading.timestamp,
            },
            alert_level: reading.alert_level,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Global,
    Barn(String),
}

impl Topic {
    pub fn event_name(&self) -> String {
        match self {
            Topic::Global => GLOBAL_EVENT.to_string(),
            Topic::Barn(barn_id) => format!("reading:{barn_id}"),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.event_name())
    }
}

type Sender = broadcast::Sender<Arc<ReadingEvent>>;

#[derive(Debug, Default)]
pub struct BroadcastStats {
    pub published: AtomicU64,
    pub deliveries: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    pub barn_receivers: usize,
    pub global_receivers: usize,
}

struct Channels {
    capacity: usize,
    global: Sender,
    barns: RwLock<HashMap<String, Sender>>,
    stats: BroadcastStats,
}

/// Fan-out of classified readings to a global channel and lazily created
/// per-barn channels. Each subscriber owns a ring of `capacity` events; one
/// that falls behind loses its oldest events and never slows the publisher.
#[derive(Clone)]
pub struct Broadcaster {
    channels: Arc<Channels>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (global, _) = broadcast::channel(capacity);
        Self {
            channels: Arc::new(Channels {
                capacity,
                global,
                barns: RwLock::new(HashMap::new()),
                stats: BroadcastStats::default(),
            }),
        }
    }

    /// Never blocks and never fails; a channel without subscribers just
    /// reports zero receivers.
    pub fn publish(&self, event: ReadingEvent) -> PublishOutcome {
        let barn_id = event.barn_id.clone();
        let event = Arc::new(event);

        let barn_receivers = {
            let barns = self
                .channels
                .barns
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            barns
                .get(&barn_id)
                .and_then(|tx| tx.send(event.clone()).ok())
                .unwrap_or(0)
        };
        let global_receivers = self.channels.global.send(event).unwrap_or(0);

        let stats = &self.channels.stats;
        stats.published.fetch_add(1, Ordering::Relaxed);
        stats
            .deliveries
            .fetch_add((barn_receivers + global_receivers) as u64, Ordering::Relaxed);
        tracing::trace!(
            barn = %barn_id,
            barn_receivers,
            global_receivers,
            "published reading"
        );

        PublishOutcome {
            barn_receivers,
            global_receivers,
        }
    }

    pub fn subscribe_global(&self) -> Subscription {
        Subscription::new(Topic::Global, self.channels.global.subscribe())
    }

    pub fn subscribe_barn(&self, barn_id: &str) -> Subscription {
        let rx = {
            let mut barns = self
                .channels
                .barns
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            barns
                .entry(barn_id.to_string())
                .or_insert_with(|| broadcast::channel(self.channels.capacity).0)
                .subscribe()
        };
        Subscription::new(Topic::Barn(barn_id.to_string()), rx)
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        match topic {
            Topic::Global => self.channels.global.receiver_count(),
            Topic::Barn(barn_id) => self
                .channels
                .barns
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(barn_id)
                .map_or(0, |tx| tx.receiver_count()),
        }
    }

    pub fn barn_channel_count(&self) -> usize {
        self.channels
            .barns
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Drops barn channels nobody listens to; returns how many went.
    pub fn prune_idle(&self) -> usize {
        let mut barns = self
            .channels
            .barns
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = barns.len();
        barns.retain(|_, tx| tx.receiver_count() > 0);
        before - barns.len()
    }

    pub fn stats(&self) -> &BroadcastStats {
        &self.channels.stats
    }
}

/// A live subscriber. Dropping it releases the slot in the channel.
pub struct Subscription {
    id: Uuid,
    topic: Topic,
    rx: broadcast::Receiver<Arc<ReadingEvent>>,
    dropped: u64,
}

impl Subscription {
    fn new(topic: Topic, rx: broadcast::Receiver<Arc<ReadingEvent>>) -> Self {
        let id = Uuid::new_v4();
        tracing::debug!(subscriber = %id, channel = %topic, "subscriber connected");
        Self {
            id,
            topic,
            rx,
            dropped: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Events lost to lag so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn lagged(&mut self, skipped: u64) -> BroadcastError {
        self.dropped += skipped;
        tracing::warn!(
            subscriber = %self.id,
            channel = %self.topic,
            skipped,
            "slow subscriber dropped oldest readings"
        );
        BroadcastError::Lagged {
            subscriber: self.id,
            channel: self.topic.event_name(),
            skipped,
        }
    }

    /// Next event. A `Lagged` error reports the loss once; the following call
    /// resumes at the oldest retained event.
    pub async fn recv(&mut self) -> Result<Arc<ReadingEvent>, BroadcastError> {
        match self.rx.recv().await {
            Ok(event) => Ok(event),
            Err(RecvError::Lagged(skipped)) => Err(self.lagged(skipped)),
            Err(RecvError::Closed) => Err(BroadcastError::Closed {
                channel: self.topic.event_name(),
            }),
        }
    }

    pub fn try_recv(&mut self) -> Result<Option<Arc<ReadingEvent>>, BroadcastError> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Lagged(skipped)) => Err(self.lagged(skipped)),
            Err(TryRecvError::Closed) => Err(BroadcastError::Closed {
                channel: self.topic.event_name(),
            }),
        }
    }

    /// Stream that skips over lag and ends when the channel closes.
    pub fn into_stream(self) -> impl Stream<Item = Arc<ReadingEvent>> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            loop {
                match sub.recv().await {
                    Ok(event) => return Some((event, sub)),
                    Err(BroadcastError::Lagged { .. }) => continue,
                    Err(BroadcastError::Closed { .. }) => return None,
                }
            }
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        tracing::debug!(
            subscriber = %self.id,
            channel = %self.topic,
            dropped = self.dropped(),
            "subscriber disconnected"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn event(barn: &str, methane: f64) -> ReadingEvent {
        ReadingEvent {
            sensor_id: "S1".into(),
            barn_id: barn.into(),
            reading: ReadingValues {
                methane_ppm: methane,
                co2_ppm: 400.0,
                nh3_ppm: 1.0,
                temperature: 20.0,
                humidity: 50.0,
                timestamp: "2024-03-01T09:00:00Z".parse().unwrap(),
            },
            alert_level: AlertLevel::Normal,
        }
    }

    #[tokio::test]
    async fn global_subscriber_receives_when_barn_has_nobody() {
        let broadcaster = Broadcaster::new(16);
        let mut global = broadcaster.subscribe_global();

        let outcome = broadcaster.publish(event("B1", 1.0));
        assert_eq!(
            outcome,
            PublishOutcome {
                barn_receivers: 0,
                global_receivers: 1
            }
        );
        let received = global.recv().await.unwrap();
        assert_eq!(received.barn_id, "B1");
    }

    #[tokio::test]
    async fn barn_subscribers_only_see_their_barn() {
        let broadcaster = Broadcaster::new(16);
        let mut barn_one = broadcaster.subscribe_barn("B1");
        let mut barn_two = broadcaster.subscribe_barn("B2");

        broadcaster.publish(event("B1", 1.0));
        broadcaster.publish(event("B2", 2.0));

        assert_eq!(barn_one.recv().await.unwrap().reading.methane_ppm, 1.0);
        assert!(barn_one.try_recv().unwrap().is_none());
        assert_eq!(barn_two.recv().await.unwrap().reading.methane_ppm, 2.0);
        assert_eq!(barn_one.topic().event_name(), "reading:B1");
    }

    #[tokio::test]
    async fn lagging_subscriber_loses_oldest_without_blocking_others() {
        let broadcaster = Broadcaster::new(2);
        let mut slow = broadcaster.subscribe_global();
        let mut fast = broadcaster.subscribe_global();

        for i in 1..=5 {
            broadcaster.publish(event("B1", f64::from(i)));
            let seen = fast.recv().await.unwrap();
            assert_eq!(seen.reading.methane_ppm, f64::from(i));
        }

        let err = slow.recv().await.unwrap_err();
        assert!(matches!(err, BroadcastError::Lagged { skipped: 3, .. }));
        assert_eq!(slow.dropped(), 3);
        assert_eq!(slow.recv().await.unwrap().reading.methane_ppm, 4.0);
        assert_eq!(slow.recv().await.unwrap().reading.methane_ppm, 5.0);
    }

    #[tokio::test]
    async fn dropped_subscriptions_release_barn_channels() {
        let broadcaster = Broadcaster::new(4);
        let sub = broadcaster.subscribe_barn("B1");
        let _keep = broadcaster.subscribe_barn("B2");
        assert_eq!(broadcaster.subscriber_count(&Topic::Barn("B1".into())), 1);

        drop(sub);
        assert_eq!(broadcaster.prune_idle(), 1);
        assert_eq!(broadcaster.barn_channel_count(), 1);
        assert_eq!(broadcaster.publish(event("B1", 1.0)).barn_receivers, 0);
    }

    #[tokio::test]
    async fn stream_skips_lag_and_keeps_going() {
        let broadcaster = Broadcaster::new(1);
        let sub = broadcaster.subscribe_barn("B1");
        broadcaster.publish(event("B1", 1.0));
        broadcaster.publish(event("B1", 2.0));

        let mut stream = Box::pin(sub.into_stream());
        let next = stream.next().await.unwrap();
        assert_eq!(next.reading.methane_ppm, 2.0);
    }
}
