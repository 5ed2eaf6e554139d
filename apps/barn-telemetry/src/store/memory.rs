use super::{ReadingFilter, SortOrder};
use crate::error::StoreUnavailableError;
use crate::model::SensorReading;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Ordered in-process store. Used when no database is configured and by tests;
/// it can be flipped unavailable to exercise the retry path.
#[derive(Clone)]
pub struct MemoryStore {
    rows: Arc<RwLock<BTreeMap<(String, DateTime<Utc>), SensorReading>>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: Arc::new(RwLock::new(BTreeMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    #[cfg(test)]
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreUnavailableError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreUnavailableError::new("in-memory store marked unavailable"))
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub(super) async fn insert_batch(
        &self,
        readings: &[SensorReading],
    ) -> Result<u64, StoreUnavailableError> {
        self.check()?;
        let mut rows = self.rows.write().await;
        let mut inserted = 0u64;
        for reading in readings {
            let key = (reading.sensor_id.clone(), reading.timestamp);
            if let std::collections::btree_map::Entry::Vacant(slot) = rows.entry(key) {
                slot.insert(reading.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    pub(super) async fn range(
        &self,
        filter: &ReadingFilter,
    ) -> Result<Vec<SensorReading>, StoreUnavailableError> {
        self.check()?;
        let rows = self.rows.read().await;
        let mut matched: Vec<SensorReading> = rows
            .values()
            .filter(|reading| filter.matches(reading))
            .cloned()
            .collect();
        matched.sort_by(|a, b| (a.timestamp, &a.sensor_id).cmp(&(b.timestamp, &b.sensor_id)));
        Ok(matched)
    }

    pub(super) async fn raw_page(
        &self,
        filter: &ReadingFilter,
    ) -> Result<(Vec<SensorReading>, u64), StoreUnavailableError> {
        let mut matched = self.range(filter).await?;
        if filter.sort_order == SortOrder::Desc {
            matched.reverse();
        }
        let total = matched.len() as u64;
        let page = matched
            .into_iter()
            .skip(filter.offset())
            .take(filter.limit as usize)
            .collect();
        Ok((page, total))
    }

    pub(super) async fn latest_per_sensor(&self) -> Result<Vec<SensorReading>, StoreUnavailableError> {
        self.check()?;
        let rows = self.rows.read().await;
        let mut latest: HashMap<&str, &SensorReading> = HashMap::new();
        // Keys sort by (sensor, ts), so the last one seen per sensor wins.
        for ((sensor_id, _), reading) in rows.iter() {
            latest.insert(sensor_id.as_str(), reading);
        }
        let mut out: Vec<SensorReading> = latest.into_values().cloned().collect();
        out.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AlertLevel;

    fn reading(sensor: &str, at: &str) -> SensorReading {
        SensorReading {
            sensor_id: sensor.into(),
            barn_id: "B1".into(),
            methane_ppm: 1.0,
            co2_ppm: 1.0,
            nh3_ppm: 1.0,
            temperature: 1.0,
            humidity: 1.0,
            timestamp: at.parse().unwrap(),
            alert_level: AlertLevel::Normal,
        }
    }

    #[tokio::test]
    async fn duplicate_keys_are_skipped() {
        let store = MemoryStore::new();
        let inserted = store
            .insert_batch(&[
                reading("S1", "2024-03-01T09:00:00Z"),
                reading("S1", "2024-03-01T09:00:00Z"),
                reading("S2", "2024-03-01T09:00:00Z"),
            ])
            .await
            .unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn latest_per_sensor_picks_newest_rows() {
        let store = MemoryStore::new();
        store
            .insert_batch(&[
                reading("S1", "2024-03-01T09:30:00Z"),
                reading("S1", "2024-03-01T09:00:00Z"),
                reading("S2", "2024-03-01T08:00:00Z"),
            ])
            .await
            .unwrap();
        let latest = store.latest_per_sensor().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].timestamp, "2024-03-01T09:30:00Z".parse::<DateTime<Utc>>().unwrap());
    }
}
