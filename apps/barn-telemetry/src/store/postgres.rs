use super::{ReadingFilter, SortOrder};
use crate::model::{AlertLevel, SensorReading};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

const SELECT_READINGS: &str = "SELECT sensor_id, barn_id, methane_ppm, co2_ppm, nh3_ppm, \
     temperature, humidity, ts, alert_level FROM sensor_readings WHERE TRUE";

// Nine binds per row keeps a chunk well under the 65535 parameter cap.
const INSERT_CHUNK: usize = 1000;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sensor_readings (
                sensor_id text not null,
                barn_id text not null,
                methane_ppm double precision not null,
                co2_ppm double precision not null,
                nh3_ppm double precision not null,
                temperature double precision not null,
                humidity double precision not null,
                ts timestamptz not null,
                alert_level text not null,
                inserted_at timestamptz not null default now(),
                primary key (sensor_id, ts)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS sensor_readings_barn_ts_idx ON sensor_readings (barn_id, ts)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS sensor_readings_ts_idx ON sensor_readings (ts)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_batch(&self, readings: &[SensorReading]) -> Result<u64, sqlx::Error> {
        let mut inserted = 0u64;
        for chunk in readings.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO sensor_readings (sensor_id, barn_id, methane_ppm, co2_ppm, nh3_ppm, temperature, humidity, ts, alert_level) ",
            );
            builder.push_values(chunk.iter(), |mut b, reading| {
                b.push_bind(&reading.sensor_id)
                    .push_bind(&reading.barn_id)
                    .push_bind(reading.methane_ppm)
                    .push_bind(reading.co2_ppm)
                    .push_bind(reading.nh3_ppm)
                    .push_bind(reading.temperature)
                    .push_bind(reading.humidity)
                    .push_bind(reading.timestamp)
                    .push_bind(reading.alert_level.as_str());
            });
            builder.push(" ON CONFLICT (sensor_id, ts) DO NOTHING");
            let result = builder.build().execute(&self.pool).await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, filter: &ReadingFilter) {
        if let Some(sensor_id) = &filter.sensor_id {
            builder.push(" AND sensor_id = ").push_bind(sensor_id.clone());
        }
        if let Some(barn_id) = &filter.barn_id {
            builder.push(" AND barn_id = ").push_bind(barn_id.clone());
        }
        if let Some(start) = filter.start_date {
            builder.push(" AND ts >= ").push_bind(start);
        }
        if let Some(end) = filter.end_date {
            builder.push(" AND ts < ").push_bind(end);
        }
    }

    pub async fn range(&self, filter: &ReadingFilter) -> Result<Vec<SensorReading>, sqlx::Error> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_READINGS);
        Self::push_filters(&mut builder, filter);
        builder.push(" ORDER BY ts ASC, sensor_id ASC");
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(decode_reading).collect()
    }

    pub async fn raw_page(
        &self,
        filter: &ReadingFilter,
    ) -> Result<(Vec<SensorReading>, u64), sqlx::Error> {
        let mut count: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM sensor_readings WHERE TRUE");
        Self::push_filters(&mut count, filter);
        let total: i64 = count.build().fetch_one(&self.pool).await?.try_get(0)?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(SELECT_READINGS);
        Self::push_filters(&mut builder, filter);
        builder.push(match filter.sort_order {
            SortOrder::Asc => " ORDER BY ts ASC, sensor_id ASC",
            SortOrder::Desc => " ORDER BY ts DESC, sensor_id DESC",
        });
        builder
            .push(" LIMIT ")
            .push_bind(i64::from(filter.limit))
            .push(" OFFSET ")
            .push_bind(filter.offset() as i64);
        let rows = builder.build().fetch_all(&self.pool).await?;
        let readings = rows
            .iter()
            .map(decode_reading)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((readings, total.max(0) as u64))
    }

    pub async fn latest_per_sensor(&self) -> Result<Vec<SensorReading>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (sensor_id)
                sensor_id, barn_id, methane_ppm, co2_ppm, nh3_ppm,
                temperature, humidity, ts, alert_level
            FROM sensor_readings
            ORDER BY sensor_id, ts DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_reading).collect()
    }
}

fn decode_reading(row: &PgRow) -> Result<SensorReading, sqlx::Error> {
    let raw_level: String = row.try_get("alert_level")?;
    let alert_level: AlertLevel = raw_level
        .parse()
        .map_err(|err| sqlx::Error::ColumnDecode {
            index: "alert_level".to_string(),
            source: Box::new(err),
        })?;
    Ok(SensorReading {
        sensor_id: row.try_get("sensor_id")?,
        barn_id: row.try_get("barn_id")?,
        methane_ppm: row.try_get("methane_ppm")?,
        co2_ppm: row.try_get("co2_ppm")?,
        nh3_ppm: row.try_get("nh3_ppm")?,
        temperature: row.try_get("temperature")?,
        humidity: row.try_get("humidity")?,
        timestamp: row.try_get::<DateTime<Utc>, _>("ts")?,
        alert_level,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    async fn setup_test_store(database_url: &str, schema: &str) -> anyhow::Result<PgStore> {
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
            .execute(&admin_pool)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA {schema}"))
            .execute(&admin_pool)
            .await?;
        drop(admin_pool);

        let schema_name = schema.to_string();
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .after_connect(move |conn, _meta| {
                let schema = schema_name.clone();
                Box::pin(async move {
                    sqlx::query(&format!("SET search_path TO {schema}"))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        let store = PgStore::from_pool(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    fn reading(sensor: &str, at: &str, level: AlertLevel) -> SensorReading {
        SensorReading {
            sensor_id: sensor.into(),
            barn_id: "B1".into(),
            methane_ppm: 600.0,
            co2_ppm: 800.0,
            nh3_ppm: 4.0,
            temperature: 17.5,
            humidity: 66.0,
            timestamp: at.parse().unwrap(),
            alert_level: level,
        }
    }

    #[tokio::test]
    async fn postgres_round_trip_and_paging() -> anyhow::Result<()> {
        if env::var("BARN_INTEGRATION_TEST").ok().as_deref() != Some("1") {
            return Ok(());
        }
        let Ok(database_url) = env::var("BARN_TEST_DATABASE_URL") else {
            return Ok(());
        };
        let store = setup_test_store(&database_url, "barn_telemetry_test").await?;

        let inserted = store
            .insert_batch(&[
                reading("S1", "2024-03-01T09:00:00Z", AlertLevel::Warning),
                reading("S1", "2024-03-01T09:00:00Z", AlertLevel::Warning),
                reading("S1", "2024-03-01T09:30:00Z", AlertLevel::Normal),
                reading("S2", "2024-03-01T09:10:00Z", AlertLevel::Danger),
            ])
            .await?;
        assert_eq!(inserted, 3);

        let filter = ReadingFilter {
            barn_id: Some("B1".into()),
            limit: 2,
            ..ReadingFilter::default()
        };
        let (rows, total) = store.raw_page(&filter).await?;
        assert_eq!(total, 3);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].sensor_id, "S1");
        assert_eq!(rows[1].alert_level, AlertLevel::Danger);

        let latest = store.latest_per_sensor().await?;
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].timestamp, "2024-03-01T09:30:00Z".parse::<DateTime<Utc>>()?);

        let windowed = store
            .range(&ReadingFilter {
                end_date: Some("2024-03-01T09:30:00Z".parse()?),
                ..ReadingFilter::default()
            })
            .await?;
        assert_eq!(windowed.len(), 2);
        Ok(())
    }
}
