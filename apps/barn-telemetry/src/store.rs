mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::aggregate::{aggregate, chart_series};
use crate::error::{InvalidFilterError, QueryError, StoreUnavailableError};
use crate::model::{AggregatedReading, AggregationPeriod, ChartData, SensorReading};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_LIMIT: u32 = 100;
pub const MAX_PAGE_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadingFilter {
    pub sensor_id: Option<String>,
    pub barn_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub aggregation: AggregationPeriod,
    pub page: u32,
    pub limit: u32,
    pub sort_order: SortOrder,
}

impl Default for ReadingFilter {
    fn default() -> Self {
        Self {
            sensor_id: None,
            barn_id: None,
            start_date: None,
            end_date: None,
            aggregation: AggregationPeriod::None,
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
            sort_order: SortOrder::Desc,
        }
    }
}

impl ReadingFilter {
    pub fn validate(&self) -> Result<(), InvalidFilterError> {
        for (field, value) in [("sensorId", &self.sensor_id), ("barnId", &self.barn_id)] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                return Err(InvalidFilterError::new(field, "must not be empty"));
            }
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start >= end {
                return Err(InvalidFilterError::new(
                    "startDate",
                    format!("must be before endDate ({start} >= {end})"),
                ));
            }
        }
        if self.page == 0 {
            return Err(InvalidFilterError::new("page", "must be at least 1"));
        }
        if self.limit == 0 || self.limit > MAX_PAGE_LIMIT {
            return Err(InvalidFilterError::new(
                "limit",
                format!("must be between 1 and {MAX_PAGE_LIMIT}"),
            ));
        }
        Ok(())
    }

    /// `[startDate, endDate)` plus the id filters.
    pub fn matches(&self, reading: &SensorReading) -> bool {
        self.sensor_id.as_deref().map_or(true, |id| reading.sensor_id == id)
            && self.barn_id.as_deref().map_or(true, |id| reading.barn_id == id)
            && self.start_date.map_or(true, |start| reading.timestamp >= start)
            && self.end_date.map_or(true, |end| reading.timestamp < end)
    }

    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize).saturating_mul(self.limit as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u64,
}

impl<T> Page<T> {
    pub fn new(data: Vec<T>, total: u64, filter: &ReadingFilter) -> Self {
        let limit = u64::from(filter.limit.max(1));
        Self {
            data,
            total,
            page: filter.page,
            limit: filter.limit,
            total_pages: total.div_ceil(limit),
        }
    }

    /// Pages an already ordered, complete result set.
    pub fn slice(all: Vec<T>, filter: &ReadingFilter) -> Self {
        let total = all.len() as u64;
        let data = all
            .into_iter()
            .skip(filter.offset())
            .take(filter.limit as usize)
            .collect();
        Self::new(data, total, filter)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReadingsPage {
    Raw(Page<SensorReading>),
    Aggregated(Page<AggregatedReading>),
}

/// Append-only reading storage keyed by `(sensorId, timestamp)`.
#[derive(Clone)]
pub enum ReadingStore {
    Postgres(PgStore),
    Memory(MemoryStore),
}

impl ReadingStore {
    pub fn kind(&self) -> &'static str {
        match self {
            ReadingStore::Postgres(_) => "postgres",
            ReadingStore::Memory(_) => "memory",
        }
    }

    /// Returns how many rows were new; duplicates are skipped.
    pub async fn insert_batch(&self, readings: &[SensorReading]) -> Result<u64, StoreUnavailableError> {
        match self {
            ReadingStore::Postgres(store) => Ok(store.insert_batch(readings).await?),
            ReadingStore::Memory(store) => store.insert_batch(readings).await,
        }
    }

    /// Every reading matching `filter`, oldest first. Pagination is ignored.
    pub async fn range(&self, filter: &ReadingFilter) -> Result<Vec<SensorReading>, StoreUnavailableError> {
        match self {
            ReadingStore::Postgres(store) => Ok(store.range(filter).await?),
            ReadingStore::Memory(store) => store.range(filter).await,
        }
    }

    pub async fn latest_per_sensor(&self) -> Result<Vec<SensorReading>, StoreUnavailableError> {
        match self {
            ReadingStore::Postgres(store) => Ok(store.latest_per_sensor().await?),
            ReadingStore::Memory(store) => store.latest_per_sensor().await,
        }
    }

    pub async fn get_readings(
        &self,
        filter: &ReadingFilter,
        tz: Tz,
    ) -> Result<ReadingsPage, QueryError> {
        filter.validate()?;

        if filter.aggregation == AggregationPeriod::None {
            let (rows, total) = match self {
                ReadingStore::Postgres(store) => store
                    .raw_page(filter)
                    .await
                    .map_err(StoreUnavailableError::from)?,
                ReadingStore::Memory(store) => store.raw_page(filter).await?,
            };
            return Ok(ReadingsPage::Raw(Page::new(rows, total, filter)));
        }

        let rows = self.range(filter).await?;
        let aggregated = aggregate(&rows, filter.aggregation, tz);
        Ok(ReadingsPage::Aggregated(Page::slice(aggregated, filter)))
    }

    pub async fn chart_data(
        &self,
        barn_id: &str,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        aggregation: AggregationPeriod,
        tz: Tz,
    ) -> Result<ChartData, QueryError> {
        let filter = ReadingFilter {
            barn_id: Some(barn_id.to_string()),
            start_date: Some(start_date),
            end_date: Some(end_date),
            aggregation,
            ..ReadingFilter::default()
        };
        filter.validate()?;

        let rows = self.range(&filter).await?;
        Ok(ChartData {
            barn_id: barn_id.to_string(),
            aggregation,
            start_date,
            end_date,
            series: chart_series(&rows, aggregation, tz),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AlertLevel;

    fn ts(raw: &str) -> DateTime<Utc> {
        raw.parse().unwrap()
    }

    fn reading(sensor: &str, barn: &str, at: &str, methane: f64) -> SensorReading {
        SensorReading {
            sensor_id: sensor.into(),
            barn_id: barn.into(),
            methane_ppm: methane,
            co2_ppm: 500.0,
            nh3_ppm: 3.0,
            temperature: 19.0,
            humidity: 70.0,
            timestamp: ts(at),
            alert_level: AlertLevel::Normal,
        }
    }

    async fn seeded() -> ReadingStore {
        let store = ReadingStore::Memory(MemoryStore::new());
        store
            .insert_batch(&[
                reading("S1", "B1", "2024-03-01T09:00:00Z", 10.0),
                reading("S1", "B1", "2024-03-01T09:20:00Z", 20.0),
                reading("S1", "B1", "2024-03-01T09:50:00Z", 30.0),
                reading("S2", "B1", "2024-03-01T10:10:00Z", 40.0),
                reading("S3", "B2", "2024-03-01T09:30:00Z", 50.0),
            ])
            .await
            .unwrap();
        store
    }

    #[test]
    fn filter_validation_rejects_malformed_queries() {
        let bad_range = ReadingFilter {
            start_date: Some(ts("2024-03-02T00:00:00Z")),
            end_date: Some(ts("2024-03-01T00:00:00Z")),
            ..ReadingFilter::default()
        };
        assert_eq!(bad_range.validate().unwrap_err().field, "startDate");

        let zero_page = ReadingFilter {
            page: 0,
            ..ReadingFilter::default()
        };
        assert_eq!(zero_page.validate().unwrap_err().field, "page");

        let huge = ReadingFilter {
            limit: MAX_PAGE_LIMIT + 1,
            ..ReadingFilter::default()
        };
        assert_eq!(huge.validate().unwrap_err().field, "limit");

        let blank = ReadingFilter {
            barn_id: Some(" ".into()),
            ..ReadingFilter::default()
        };
        assert_eq!(blank.validate().unwrap_err().field, "barnId");
    }

    #[tokio::test]
    async fn raw_pages_are_newest_first_by_default() {
        let store = seeded().await;
        let filter = ReadingFilter {
            barn_id: Some("B1".into()),
            limit: 3,
            ..ReadingFilter::default()
        };
        let ReadingsPage::Raw(page) = store.get_readings(&filter, Tz::UTC).await.unwrap() else {
            panic!("expected raw rows");
        };
        assert_eq!(page.total, 4);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.data[0].timestamp, ts("2024-03-01T10:10:00Z"));

        let second = ReadingFilter {
            page: 2,
            sort_order: SortOrder::Asc,
            ..filter
        };
        let ReadingsPage::Raw(page) = store.get_readings(&second, Tz::UTC).await.unwrap() else {
            panic!("expected raw rows");
        };
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0].sensor_id, "S2");
    }

    #[tokio::test]
    async fn range_end_is_exclusive() {
        let store = seeded().await;
        let filter = ReadingFilter {
            sensor_id: Some("S1".into()),
            start_date: Some(ts("2024-03-01T09:00:00Z")),
            end_date: Some(ts("2024-03-01T09:50:00Z")),
            ..ReadingFilter::default()
        };
        let rows = store.range(&filter).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].timestamp < rows[1].timestamp);
    }

    #[tokio::test]
    async fn out_of_range_queries_are_empty_not_errors() {
        let store = seeded().await;
        let filter = ReadingFilter {
            start_date: Some(ts("2030-01-01T00:00:00Z")),
            aggregation: AggregationPeriod::Daily,
            ..ReadingFilter::default()
        };
        let ReadingsPage::Aggregated(page) = store.get_readings(&filter, Tz::UTC).await.unwrap()
        else {
            panic!("expected aggregated rows");
        };
        assert!(page.data.is_empty());
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn hourly_aggregation_through_the_store() {
        let store = seeded().await;
        let filter = ReadingFilter {
            barn_id: Some("B1".into()),
            aggregation: AggregationPeriod::Hourly,
            ..ReadingFilter::default()
        };
        let ReadingsPage::Aggregated(page) = store.get_readings(&filter, Tz::UTC).await.unwrap()
        else {
            panic!("expected aggregated rows");
        };
        assert_eq!(page.total, 2);
        let first = &page.data[0];
        assert_eq!(first.sensor_id, "S1");
        assert_eq!(first.reading_count, 3);
        assert_eq!(first.avg_methane_ppm, 20.0);
        assert_eq!(page.data[1].period_start, ts("2024-03-01T10:00:00Z"));
    }

    #[tokio::test]
    async fn chart_data_requires_a_valid_window() {
        let store = seeded().await;
        let err = store
            .chart_data(
                "B1",
                ts("2024-03-02T00:00:00Z"),
                ts("2024-03-01T00:00:00Z"),
                AggregationPeriod::Hourly,
                Tz::UTC,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidFilter(_)));

        let chart = store
            .chart_data(
                "B1",
                ts("2024-03-01T00:00:00Z"),
                ts("2024-03-02T00:00:00Z"),
                AggregationPeriod::Hourly,
                Tz::UTC,
            )
            .await
            .unwrap();
        assert_eq!(chart.series[0].points.len(), 2);
    }

    #[tokio::test]
    async fn unavailable_memory_store_surfaces_errors() {
        let memory = MemoryStore::new();
        memory.set_available(false);
        let store = ReadingStore::Memory(memory.clone());
        assert!(store
            .insert_batch(&[reading("S1", "B1", "2024-03-01T09:00:00Z", 1.0)])
            .await
            .is_err());
        let err = store
            .get_readings(&ReadingFilter::default(), Tz::UTC)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Unavailable(_)));

        memory.set_available(true);
        assert_eq!(
            store
                .insert_batch(&[reading("S1", "B1", "2024-03-01T09:00:00Z", 1.0)])
                .await
                .unwrap(),
            1
        );
    }
}
