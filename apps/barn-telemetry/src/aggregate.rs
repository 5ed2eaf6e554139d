use crate::model::{
    AggregatedReading, AggregationPeriod, AlertLevel, ChartPoint, ChartSeries, SensorReading,
};
use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

const GAP_SEARCH_MINUTES: i64 = 180;

/// Calendar-aligned interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Bucket containing `ts`; `None` for [`AggregationPeriod::None`].
///
/// Hours follow the zone's offset at `ts`, so both repeated hours of a
/// fall-back transition get their own bucket. Days start at local midnight and
/// weeks on Monday 00:00 local; a midnight that falls in a DST gap resolves to
/// the first valid local instant after it.
pub fn bucket_for(ts: DateTime<Utc>, period: AggregationPeriod, tz: Tz) -> Option<Bucket> {
    match period {
        AggregationPeriod::None => None,
        AggregationPeriod::Hourly => {
            let offset = i64::from(ts.with_timezone(&tz).offset().fix().local_minus_utc());
            let secs = ts.timestamp();
            let start_secs = secs - (secs + offset).rem_euclid(3600);
            let start = Utc.timestamp_opt(start_secs, 0).single()?;
            Some(Bucket {
                start,
                end: start + Duration::hours(1),
            })
        }
        AggregationPeriod::Daily => {
            let date = ts.with_timezone(&tz).date_naive();
            Some(Bucket {
                start: start_of_local_day(tz, date)?,
                end: start_of_local_day(tz, date.succ_opt()?)?,
            })
        }
        AggregationPeriod::Weekly => {
            let date = ts.with_timezone(&tz).date_naive();
            let back = u64::from(date.weekday().num_days_from_monday());
            let monday = date.checked_sub_days(Days::new(back))?;
            Some(Bucket {
                start: start_of_local_day(tz, monday)?,
                end: start_of_local_day(tz, monday.checked_add_days(Days::new(7))?)?,
            })
        }
    }
}

pub fn bucket_start(ts: DateTime<Utc>, period: AggregationPeriod, tz: Tz) -> DateTime<Utc> {
    bucket_for(ts, period, tz).map_or(ts, |bucket| bucket.start)
}

fn start_of_local_day(tz: Tz, date: NaiveDate) -> Option<DateTime<Utc>> {
    first_valid_local(tz, date.and_hms_opt(0, 0, 0)?)
}

fn first_valid_local(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    for minutes in 0..=GAP_SEARCH_MINUTES {
        let candidate = naive + Duration::minutes(minutes);
        match tz.from_local_datetime(&candidate) {
            chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
            chrono::LocalResult::Ambiguous(a, b) => {
                return Some(a.with_timezone(&Utc).min(b.with_timezone(&Utc)))
            }
            chrono::LocalResult::None => continue,
        }
    }
    None
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy)]
struct Extent {
    sum: f64,
    min: f64,
    max: f64,
}

impl Extent {
    fn new(value: f64) -> Self {
        Self {
            sum: value,
            min: value,
            max: value,
        }
    }

    fn add(&mut self, value: f64) {
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn mean(&self, count: u64) -> f64 {
        round2(self.sum / count as f64)
    }
}

#[derive(Debug)]
struct BucketFold {
    count: u64,
    methane: Extent,
    co2: Extent,
    nh3: Extent,
    temperature: Extent,
    humidity: Extent,
    max_alert_level: AlertLevel,
}

impl BucketFold {
    fn new(reading: &SensorReading) -> Self {
        Self {
            count: 1,
            methane: Extent::new(reading.methane_ppm),
            co2: Extent::new(reading.co2_ppm),
            nh3: Extent::new(reading.nh3_ppm),
            temperature: Extent::new(reading.temperature),
            humidity: Extent::new(reading.humidity),
            max_alert_level: reading.alert_level,
        }
    }

    fn add(&mut self, reading: &SensorReading) {
        self.count += 1;
        self.methane.add(reading.methane_ppm);
        self.co2.add(reading.co2_ppm);
        self.nh3.add(reading.nh3_ppm);
        self.temperature.add(reading.temperature);
        self.humidity.add(reading.humidity);
        self.max_alert_level = self.max_alert_level.max(reading.alert_level);
    }

    fn finish(self, sensor_id: String, barn_id: String, bucket: Bucket) -> AggregatedReading {
        let n = self.count;
        AggregatedReading {
            sensor_id,
            barn_id,
            period_start: bucket.start,
            period_end: bucket.end,
            reading_count: n,
            min_methane_ppm: self.methane.min,
            avg_methane_ppm: self.methane.mean(n),
            max_methane_ppm: self.methane.max,
            min_co2_ppm: self.co2.min,
            avg_co2_ppm: self.co2.mean(n),
            max_co2_ppm: self.co2.max,
            min_nh3_ppm: self.nh3.min,
            avg_nh3_ppm: self.nh3.mean(n),
            max_nh3_ppm: self.nh3.max,
            min_temperature: self.temperature.min,
            avg_temperature: self.temperature.mean(n),
            max_temperature: self.temperature.max,
            min_humidity: self.humidity.min,
            avg_humidity: self.humidity.mean(n),
            max_humidity: self.humidity.max,
            max_alert_level: self.max_alert_level,
        }
    }
}

/// One row per `(sensorId, barnId, bucket)`, ordered by bucket start.
///
/// Readings are folded in `(sensorId, barnId, timestamp)` order whatever order
/// they arrive in, so the same reading set always produces the same floats.
pub fn aggregate(
    readings: &[SensorReading],
    period: AggregationPeriod,
    tz: Tz,
) -> Vec<AggregatedReading> {
    let mut ordered: Vec<&SensorReading> = readings.iter().collect();
    ordered.sort_by(|a, b| {
        (a.sensor_id.as_str(), a.barn_id.as_str(), a.timestamp).cmp(&(
            b.sensor_id.as_str(),
            b.barn_id.as_str(),
            b.timestamp,
        ))
    });

    let mut folds: BTreeMap<(DateTime<Utc>, String, String), (Bucket, BucketFold)> =
        BTreeMap::new();
    for reading in ordered {
        let Some(bucket) = bucket_for(reading.timestamp, period, tz) else {
            continue;
        };
        let key = (
            bucket.start,
            reading.sensor_id.clone(),
            reading.barn_id.clone(),
        );
        match folds.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert((bucket, BucketFold::new(reading)));
            }
            Entry::Occupied(mut slot) => slot.get_mut().1.add(reading),
        }
    }

    folds
        .into_iter()
        .map(|((_, sensor_id, barn_id), (bucket, fold))| fold.finish(sensor_id, barn_id, bucket))
        .collect()
}

pub const CHART_METRICS: [&str; 6] = [
    "methanePpm",
    "co2Ppm",
    "nh3Ppm",
    "temperature",
    "humidity",
    "readingCount",
];

/// Barn-wide series: one point per bucket holding the mean across every sensor
/// of the barn. With no aggregation each distinct timestamp is its own point.
pub fn chart_series(
    readings: &[SensorReading],
    period: AggregationPeriod,
    tz: Tz,
) -> Vec<ChartSeries> {
    let mut ordered: Vec<&SensorReading> = readings.iter().collect();
    ordered.sort_by(|a, b| {
        (a.timestamp, a.sensor_id.as_str()).cmp(&(b.timestamp, b.sensor_id.as_str()))
    });

    let mut sums: BTreeMap<DateTime<Utc>, (u64, [f64; 5])> = BTreeMap::new();
    for reading in ordered {
        let slot = sums
            .entry(bucket_start(reading.timestamp, period, tz))
            .or_insert((0, [0.0; 5]));
        slot.0 += 1;
        for (acc, value) in slot.1.iter_mut().zip([
            reading.methane_ppm,
            reading.co2_ppm,
            reading.nh3_ppm,
            reading.temperature,
            reading.humidity,
        ]) {
            *acc += value;
        }
    }

    CHART_METRICS
        .into_iter()
        .enumerate()
        .map(|(idx, metric)| ChartSeries {
            metric,
            points: sums
                .iter()
                .map(|(timestamp, (count, totals))| ChartPoint {
                    timestamp: *timestamp,
                    value: match totals.get(idx) {
                        Some(total) => round2(total / *count as f64),
                        None => *count as f64,
                    },
                })
                .collect(),
        })
        .collect()
}
