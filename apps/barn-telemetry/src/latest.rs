use crate::model::{LatestReading, SensorReading};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// What happened when a reading was offered to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUpdate {
    Inserted,
    Replaced { previous: DateTime<Utc> },
    /// Older than the cached reading; cache untouched.
    Stale { current: DateTime<Utc> },
    /// Same timestamp as the cached reading; cache untouched.
    Duplicate,
}

impl CacheUpdate {
    pub fn accepted(&self) -> bool {
        matches!(self, CacheUpdate::Inserted | CacheUpdate::Replaced { .. })
    }
}

type Slot = Arc<Mutex<LatestReading>>;

/// Latest reading per sensor. The outer map is only write-locked to add a new
/// sensor; updates lock the one sensor's slot.
#[derive(Clone, Default)]
pub struct LatestCache {
    slots: Arc<RwLock<HashMap<String, Slot>>>,
}

impl LatestCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, sensor_id: &str) -> Option<Slot> {
        let slots = self
            .slots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.get(sensor_id).cloned()
    }

    /// Stores `reading` only if it is strictly newer than the cached one.
    pub fn offer(&self, reading: &SensorReading) -> CacheUpdate {
        self.offer_with(reading, |_| ()).0
    }

    /// Like [`offer`](Self::offer), but runs `on_accept` while the sensor's
    /// slot is still locked, so whatever it emits follows cache order.
    pub fn offer_with<R>(
        &self,
        reading: &SensorReading,
        on_accept: impl FnOnce(&SensorReading) -> R,
    ) -> (CacheUpdate, Option<R>) {
        let slot = match self.slot(&reading.sensor_id) {
            Some(slot) => slot,
            None => {
                let mut slots = self
                    .slots
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                match slots.get(&reading.sensor_id) {
                    Some(slot) => slot.clone(),
                    None => {
                        let slot = Arc::new(Mutex::new(LatestReading::from(reading.clone())));
                        let held = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                        slots.insert(reading.sensor_id.clone(), slot.clone());
                        drop(slots);
                        let emitted = on_accept(reading);
                        drop(held);
                        return (CacheUpdate::Inserted, Some(emitted));
                    }
                }
            }
        };

        let mut current = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let cached_at = current.reading.timestamp;
        if reading.timestamp > cached_at {
            *current = LatestReading::from(reading.clone());
            let emitted = on_accept(reading);
            (
                CacheUpdate::Replaced {
                    previous: cached_at,
                },
                Some(emitted),
            )
        } else if reading.timestamp == cached_at {
            (CacheUpdate::Duplicate, None)
        } else {
            (CacheUpdate::Stale { current: cached_at }, None)
        }
    }

    #[cfg(test)]
    pub fn get(&self, sensor_id: &str) -> Option<LatestReading> {
        let slot = self.slot(sensor_id)?;
        let entry = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(entry.clone())
    }

    /// Entries matching both optional filters, sorted by sensor id.
    pub fn query(&self, barn_id: Option<&str>, sensor_ids: Option<&[String]>) -> Vec<LatestReading> {
        let slots: Vec<Slot> = {
            let slots = self
                .slots
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slots
                .iter()
                .filter(|(id, _)| sensor_ids.map_or(true, |ids| ids.iter().any(|want| want == *id)))
                .map(|(_, slot)| slot.clone())
                .collect()
        };

        let mut entries: Vec<LatestReading> = slots
            .iter()
            .map(|slot| slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone())
            .filter(|entry| barn_id.map_or(true, |barn| entry.barn_id == barn))
            .collect();
        entries.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));
        entries
    }

    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Seeds the cache from persisted readings; returns how many entries moved.
    pub fn warm(&self, readings: impl IntoIterator<Item = SensorReading>) -> usize {
        readings
            .into_iter()
            .filter(|reading| self.offer(reading).accepted())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AlertLevel;

    fn reading(sensor: &str, barn: &str, minute: i64) -> SensorReading {
        SensorReading {
            sensor_id: sensor.to_string(),
            barn_id: barn.to_string(),
            methane_ppm: minute as f64,
            co2_ppm: 400.0,
            nh3_ppm: 2.0,
            temperature: 20.0,
            humidity: 50.0,
            timestamp: "2024-03-01T09:00:00Z".parse::<DateTime<Utc>>().unwrap()
                + chrono::Duration::minutes(minute),
            alert_level: AlertLevel::Normal,
        }
    }

    #[test]
    fn never_regresses_in_timestamp() {
        let cache = LatestCache::new();
        assert_eq!(cache.offer(&reading("S1", "B1", 10)), CacheUpdate::Inserted);
        let stale = cache.offer(&reading("S1", "B1", 5));
        assert!(matches!(stale, CacheUpdate::Stale { .. }));
        assert!(!stale.accepted());

        let cached = cache.get("S1").unwrap();
        assert_eq!(cached.reading.methane_ppm, 10.0);
        assert_eq!(cached.last_updated, reading("S1", "B1", 10).timestamp);
    }

    #[test]
    fn equal_timestamps_are_duplicates() {
        let cache = LatestCache::new();
        cache.offer(&reading("S1", "B1", 3));
        let mut again = reading("S1", "B1", 3);
        again.methane_ppm = 99.0;
        assert_eq!(cache.offer(&again), CacheUpdate::Duplicate);
        assert_eq!(cache.get("S1").unwrap().reading.methane_ppm, 3.0);
    }

    #[test]
    fn query_filters_by_barn_and_sensor() {
        let cache = LatestCache::new();
        cache.offer(&reading("S2", "B1", 1));
        cache.offer(&reading("S1", "B1", 1));
        cache.offer(&reading("S3", "B2", 1));

        let barn: Vec<String> = cache
            .query(Some("B1"), None)
            .into_iter()
            .map(|entry| entry.sensor_id)
            .collect();
        assert_eq!(barn, vec!["S1", "S2"]);

        let wanted = vec!["S3".to_string(), "S9".to_string()];
        let picked = cache.query(None, Some(&wanted));
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].barn_id, "B2");
        assert!(cache.query(Some("B1"), Some(&wanted)).is_empty());
    }

    #[test]
    fn warm_keeps_the_newest_per_sensor() {
        let cache = LatestCache::new();
        let moved = cache.warm(vec![
            reading("S1", "B1", 7),
            reading("S1", "B1", 2),
            reading("S2", "B1", 4),
        ]);
        assert_eq!(moved, 2);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("S1").unwrap().reading.methane_ppm, 7.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_offers_settle_on_the_newest() {
        let cache = LatestCache::new();
        let mut tasks = Vec::new();
        for minute in 0..200 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache.offer(&reading("S1", "B1", (minute * 37) % 200));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(cache.get("S1").unwrap().reading.methane_ppm, 199.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn accepted_offers_emit_in_timestamp_order() {
        let cache = LatestCache::new();
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for minute in 0..200 {
            let cache = cache.clone();
            let emitted = emitted.clone();
            tasks.push(tokio::spawn(async move {
                cache.offer_with(&reading("S1", "B1", (minute * 37) % 200), |accepted| {
                    emitted.lock().unwrap().push(accepted.timestamp);
                });
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let emitted = emitted.lock().unwrap();
        assert!(!emitted.is_empty());
        assert!(emitted.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(
            emitted.last().copied(),
            Some(cache.get("S1").unwrap().reading.timestamp)
        );
    }

    #[test]
    fn rejected_offers_do_not_run_the_callback() {
        let cache = LatestCache::new();
        let (first, emitted) = cache.offer_with(&reading("S1", "B1", 5), |r| r.methane_ppm);
        assert_eq!(first, CacheUpdate::Inserted);
        assert_eq!(emitted, Some(5.0));

        let (stale, emitted) = cache.offer_with(&reading("S1", "B1", 1), |r| r.methane_ppm);
        assert!(matches!(stale, CacheUpdate::Stale { .. }));
        assert_eq!(emitted, None);
    }
}
