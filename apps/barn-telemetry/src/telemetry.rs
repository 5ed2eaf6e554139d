use crate::error::ValidationError;
use crate::model::ValidatedReading;
use chrono::{DateTime, Utc};
use serde::de::IgnoredAny;
use serde::Deserialize;
use std::borrow::Cow;

/// Inclusive physical bounds for the numeric payload fields.
pub const METHANE_BOUNDS: (f64, f64) = (0.0, 100_000.0);
pub const CO2_BOUNDS: (f64, f64) = (0.0, 100_000.0);
pub const NH3_BOUNDS: (f64, f64) = (0.0, 1_000.0);
pub const TEMPERATURE_BOUNDS: (f64, f64) = (-50.0, 100.0);
pub const HUMIDITY_BOUNDS: (f64, f64) = (0.0, 100.0);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BorrowedPayload<'a> {
    #[serde(default, borrow)]
    sensor_id: Option<Loose<'a>>,
    #[serde(default, borrow)]
    barn_id: Option<Loose<'a>>,
    #[serde(default, borrow)]
    methane_ppm: Option<Loose<'a>>,
    #[serde(default, borrow)]
    co2_ppm: Option<Loose<'a>>,
    #[serde(default, borrow)]
    nh3_ppm: Option<Loose<'a>>,
    #[serde(default, borrow)]
    temperature: Option<Loose<'a>>,
    #[serde(default, borrow)]
    humidity: Option<Loose<'a>>,
    #[serde(default, borrow)]
    timestamp: Option<Loose<'a>>,
}

/// Any JSON value, kept loose so type errors can name the field instead of
/// failing the whole document.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Loose<'a> {
    Num(f64),
    Str(#[serde(borrow)] Cow<'a, str>),
    Other(IgnoredAny),
}

fn required_str(field: &'static str, value: Option<Loose<'_>>) -> Result<String, ValidationError> {
    match value {
        None => Err(ValidationError::Missing { field }),
        Some(Loose::Str(raw)) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                Err(ValidationError::Missing { field })
            } else {
                Ok(trimmed.to_string())
            }
        }
        Some(_) => Err(ValidationError::WrongType {
            field,
            expected: "a string",
        }),
    }
}

fn bounded_number(
    field: &'static str,
    value: Option<Loose<'_>>,
    (min, max): (f64, f64),
) -> Result<f64, ValidationError> {
    let value = match value {
        None => return Err(ValidationError::Missing { field }),
        Some(Loose::Num(value)) => value,
        Some(_) => {
            return Err(ValidationError::WrongType {
                field,
                expected: "a number",
            })
        }
    };
    if !value.is_finite() || value < min || value > max {
        return Err(ValidationError::OutOfRange {
            field,
            min,
            max,
            value,
        });
    }
    Ok(value)
}

fn optional_timestamp(
    value: Option<Loose<'_>>,
    received_at: DateTime<Utc>,
) -> Result<DateTime<Utc>, ValidationError> {
    match value {
        None => Ok(received_at),
        Some(Loose::Str(raw)) => DateTime::parse_from_rfc3339(raw.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| ValidationError::BadTimestamp {
                field: "timestamp",
                value: raw.into_owned(),
            }),
        Some(_) => Err(ValidationError::WrongType {
            field: "timestamp",
            expected: "an ISO-8601 string",
        }),
    }
}

/// Validates a raw sensor payload. Pure: `received_at` stands in for a missing
/// `timestamp`. The buffer is parsed in place and left scrambled.
pub fn validate_payload(
    payload: &mut [u8],
    received_at: DateTime<Utc>,
) -> Result<ValidatedReading, ValidationError> {
    if payload.iter().find(|byte| !byte.is_ascii_whitespace()) != Some(&b'{') {
        return Err(ValidationError::Malformed("expected an object".to_string()));
    }
    let parsed: BorrowedPayload = simd_json::serde::from_slice(payload)
        .map_err(|err| ValidationError::Malformed(err.to_string()))?;

    Ok(ValidatedReading {
        sensor_id: required_str("sensorId", parsed.sensor_id)?,
        barn_id: required_str("barnId", parsed.barn_id)?,
        methane_ppm: bounded_number("methanePpm", parsed.methane_ppm, METHANE_BOUNDS)?,
        co2_ppm: bounded_number("co2Ppm", parsed.co2_ppm, CO2_BOUNDS)?,
        nh3_ppm: bounded_number("nh3Ppm", parsed.nh3_ppm, NH3_BOUNDS)?,
        temperature: bounded_number("temperature", parsed.temperature, TEMPERATURE_BOUNDS)?,
        humidity: bounded_number("humidity", parsed.humidity, HUMIDITY_BOUNDS)?,
        timestamp: optional_timestamp(parsed.timestamp, received_at)?,
    })
}

/// Trailing segment of `sensors/gas/<sensorId>`; used for log context only.
pub fn sensor_id_from_topic(topic: &str) -> Option<&str> {
    topic
        .rsplit('/')
        .next()
        .map(str::trim)
        .filter(|id| !id.is_empty() && !id.contains(['+', '#']))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received_at() -> DateTime<Utc> {
        "2024-03-01T12:00:00Z".parse().unwrap()
    }

    fn validate(json: &str) -> Result<ValidatedReading, ValidationError> {
        let mut bytes = json.as_bytes().to_vec();
        validate_payload(&mut bytes, received_at())
    }

    const VALID: &str = r#"{"sensorId":"S1","barnId":"B1","methanePpm":50,"co2Ppm":400.5,"nh3Ppm":5,"temperature":22,"humidity":60}"#;

    #[test]
    fn accepts_integer_and_float_fields() {
        let reading = validate(VALID).unwrap();
        assert_eq!(reading.sensor_id, "S1");
        assert_eq!(reading.barn_id, "B1");
        assert_eq!(reading.methane_ppm, 50.0);
        assert_eq!(reading.co2_ppm, 400.5);
        assert_eq!(reading.timestamp, received_at());
    }

    #[test]
    fn explicit_timestamp_wins_over_ingestion_time() {
        let reading = validate(
            r#"{"sensorId":"S1","barnId":"B1","methanePpm":1,"co2Ppm":1,"nh3Ppm":1,"temperature":1,"humidity":1,"timestamp":"2024-02-29T23:15:00+01:00"}"#,
        )
        .unwrap();
        assert_eq!(
            reading.timestamp,
            "2024-02-29T22:15:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn humidity_above_bound_names_the_field() {
        let err = validate(
            r#"{"sensorId":"S1","barnId":"B1","methanePpm":1,"co2Ppm":1,"nh3Ppm":1,"temperature":1,"humidity":150}"#,
        )
        .unwrap_err();
        assert_eq!(err.field(), Some("humidity"));
        assert!(matches!(err, ValidationError::OutOfRange { value, .. } if value == 150.0));
    }

    #[test]
    fn bounds_are_inclusive() {
        let reading = validate(
            r#"{"sensorId":"S1","barnId":"B1","methanePpm":100000,"co2Ppm":0,"nh3Ppm":1000,"temperature":-50,"humidity":100}"#,
        )
        .unwrap();
        assert_eq!(reading.temperature, -50.0);
        assert_eq!(reading.nh3_ppm, 1000.0);
    }

    #[test]
    fn missing_and_mistyped_fields_are_rejected() {
        let err = validate(r#"{"barnId":"B1","methanePpm":1,"co2Ppm":1,"nh3Ppm":1,"temperature":1,"humidity":1}"#)
            .unwrap_err();
        assert_eq!(err, ValidationError::Missing { field: "sensorId" });

        let err = validate(
            r#"{"sensorId":"S1","barnId":"B1","methanePpm":"lots","co2Ppm":1,"nh3Ppm":1,"temperature":1,"humidity":1}"#,
        )
        .unwrap_err();
        assert_eq!(err.field(), Some("methanePpm"));
        assert!(matches!(err, ValidationError::WrongType { .. }));

        let err = validate(
            r#"{"sensorId":"  ","barnId":"B1","methanePpm":1,"co2Ppm":1,"nh3Ppm":1,"temperature":1,"humidity":1}"#,
        )
        .unwrap_err();
        assert_eq!(err.field(), Some("sensorId"));

        let err = validate(
            r#"{"sensorId":"S1","barnId":"B1","methanePpm":1,"co2Ppm":1,"nh3Ppm":null,"temperature":1,"humidity":1}"#,
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::Missing { field: "nh3Ppm" });
    }

    #[test]
    fn unparseable_timestamp_is_a_hard_reject() {
        let err = validate(
            r#"{"sensorId":"S1","barnId":"B1","methanePpm":1,"co2Ppm":1,"nh3Ppm":1,"temperature":1,"humidity":1,"timestamp":"yesterday"}"#,
        )
        .unwrap_err();
        assert_eq!(err.field(), Some("timestamp"));
    }

    #[test]
    fn non_object_payloads_are_malformed() {
        assert!(matches!(validate("[1,2,3]"), Err(ValidationError::Malformed(_))));
        assert!(matches!(validate("not json"), Err(ValidationError::Malformed(_))));
    }

    #[test]
    fn topic_suffix_is_the_sensor_id() {
        assert_eq!(sensor_id_from_topic("sensors/gas/S-42"), Some("S-42"));
        assert_eq!(sensor_id_from_topic("sensors/gas/+"), None);
        assert_eq!(sensor_id_from_topic("sensors/gas/"), None);
    }
}
