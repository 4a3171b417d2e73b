use crate::error::{DomainError, DomainResult};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

/// Wire shape of one inbound queue message.
///
/// Every field is optional so that incomplete payloads deserialize and are
/// rejected by [`Reading::parse`] with a field-level error instead of an
/// opaque serde failure.
#[derive(Debug, Clone, Deserialize)]
pub struct RawReadingMessage {
    pub device_id: Option<String>,
    pub timestamp: Option<String>,
    pub temperature: Option<serde_json::Number>,
    pub humidity: Option<serde_json::Number>,
}

/// A validated sensor reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device_id: String,
    pub occurred_at: DateTime<Utc>,
    pub temperature: Decimal,
    pub humidity: Decimal,
}

impl Reading {
    /// Validate a wire message into a reading.
    ///
    /// All four fields must be present; the timestamp must parse as
    /// ISO-8601 (offset-free forms are interpreted as UTC).
    pub fn parse(msg: &RawReadingMessage) -> DomainResult<Self> {
        let device_id = match msg.device_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            Some(_) => return Err(DomainError::MalformedInput("empty device_id".to_string())),
            None => return Err(DomainError::MalformedInput("missing device_id".to_string())),
        };

        let raw_timestamp = msg
            .timestamp
            .as_deref()
            .ok_or_else(|| DomainError::MalformedInput("missing timestamp".to_string()))?;
        let occurred_at = parse_timestamp(raw_timestamp)?;

        let temperature = decimal_field(msg.temperature.as_ref(), "temperature")?;
        let humidity = decimal_field(msg.humidity.as_ref(), "humidity")?;

        Ok(Reading {
            device_id,
            occurred_at,
            temperature,
            humidity,
        })
    }
}

/// Parse an ISO-8601 timestamp, normalizing to UTC.
///
/// `Z` and explicit offsets are handled by the RFC 3339 parser; timestamps
/// with no offset at all are taken as UTC.
fn parse_timestamp(raw: &str) -> DomainResult<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }

    Err(DomainError::MalformedInput(format!(
        "unparsable timestamp: {raw}"
    )))
}

/// Convert a JSON number to a decimal via its textual form, so binary
/// float artifacts never enter the aggregate arithmetic.
fn decimal_field(value: Option<&serde_json::Number>, field: &str) -> DomainResult<Decimal> {
    let number = value
        .ok_or_else(|| DomainError::MalformedInput(format!("missing {field}")))?
        .to_string();

    Decimal::from_str(&number)
        .or_else(|_| Decimal::from_scientific(&number))
        .map_err(|_| DomainError::MalformedInput(format!("non-numeric {field}: {number}")))
}

/// Identifies one per-device, per-hour aggregation bucket.
///
/// `hour_bucket` is always aligned to the start of a UTC hour, so any two
/// readings falling in the same hour derive an identical key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub device_id: String,
    pub hour_bucket: DateTime<Utc>,
}

impl BucketKey {
    pub fn new(device_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            hour_bucket: truncate_to_hour(at),
        }
    }

    pub fn for_reading(reading: &Reading) -> Self {
        Self::new(reading.device_id.clone(), reading.occurred_at)
    }

    /// Canonical ISO-8601 rendering of the hour bucket, used as the
    /// store's sort key.
    pub fn hour_bucket_iso(&self) -> String {
        self.hour_bucket
            .to_rfc3339_opts(SecondsFormat::Secs, false)
    }
}

fn truncate_to_hour(at: DateTime<Utc>) -> DateTime<Utc> {
    let seconds = at.timestamp();
    let floored = seconds - seconds.rem_euclid(3600);
    // Flooring stays within the representable range of `at`.
    DateTime::<Utc>::from_timestamp(floored, 0).unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn message(
        device_id: Option<&str>,
        timestamp: Option<&str>,
        temperature: Option<f64>,
        humidity: Option<f64>,
    ) -> RawReadingMessage {
        RawReadingMessage {
            device_id: device_id.map(str::to_string),
            timestamp: timestamp.map(str::to_string),
            temperature: temperature.and_then(serde_json::Number::from_f64),
            humidity: humidity.and_then(serde_json::Number::from_f64),
        }
    }

    #[test]
    fn test_parse_valid_reading() {
        let msg = message(
            Some("sensor-1"),
            Some("2026-03-01T10:05:00Z"),
            Some(21.5),
            Some(48.0),
        );

        let reading = Reading::parse(&msg).unwrap();

        assert_eq!(reading.device_id, "sensor-1");
        assert_eq!(reading.temperature, dec!(21.5));
        assert_eq!(reading.humidity, dec!(48.0));
        assert_eq!(reading.occurred_at.to_rfc3339(), "2026-03-01T10:05:00+00:00");
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        let cases = [
            message(None, Some("2026-03-01T10:05:00Z"), Some(21.5), Some(48.0)),
            message(Some("sensor-1"), None, Some(21.5), Some(48.0)),
            message(Some("sensor-1"), Some("2026-03-01T10:05:00Z"), None, Some(48.0)),
            message(Some("sensor-1"), Some("2026-03-01T10:05:00Z"), Some(21.5), None),
        ];

        for msg in cases {
            let result = Reading::parse(&msg);
            assert!(matches!(result, Err(DomainError::MalformedInput(_))));
        }
    }

    #[test]
    fn test_parse_rejects_unparsable_timestamp() {
        let msg = message(Some("sensor-1"), Some("yesterday-ish"), Some(21.5), Some(48.0));

        let result = Reading::parse(&msg);

        assert!(matches!(result, Err(DomainError::MalformedInput(_))));
    }

    #[test]
    fn test_timestamp_forms_normalize_to_one_instant() {
        let forms = [
            "2026-03-01T10:05:00Z",
            "2026-03-01T10:05:00+00:00",
            "2026-03-01T10:05:00",
            "2026-03-01 10:05:00",
            "2026-03-01T17:05:00+07:00",
        ];

        let instants: Vec<DateTime<Utc>> = forms
            .iter()
            .map(|raw| parse_timestamp(raw).unwrap())
            .collect();

        for instant in &instants {
            assert_eq!(*instant, instants[0]);
        }
    }

    #[test]
    fn test_bucket_key_same_hour_same_key() {
        let early = parse_timestamp("2026-03-01T10:00:00Z").unwrap();
        let late = parse_timestamp("2026-03-01T10:59:59.999Z").unwrap();

        let a = BucketKey::new("sensor-1", early);
        let b = BucketKey::new("sensor-1", late);

        assert_eq!(a, b);
        assert_eq!(a.hour_bucket_iso(), "2026-03-01T10:00:00+00:00");
    }

    #[test]
    fn test_bucket_key_offset_normalized_before_truncation() {
        // 00:30+07:00 is 17:30 UTC of the previous day.
        let offset = parse_timestamp("2026-03-02T00:30:00+07:00").unwrap();
        let utc = parse_timestamp("2026-03-01T17:45:00Z").unwrap();

        assert_eq!(BucketKey::new("sensor-1", offset), BucketKey::new("sensor-1", utc));
    }

    #[test]
    fn test_bucket_key_adjacent_hours_differ() {
        let before = parse_timestamp("2026-03-01T10:59:59Z").unwrap();
        let after = parse_timestamp("2026-03-01T11:00:00Z").unwrap();

        assert_ne!(BucketKey::new("sensor-1", before), BucketKey::new("sensor-1", after));
    }

    #[test]
    fn test_decimal_field_preserves_textual_value() {
        let msg = RawReadingMessage {
            device_id: Some("sensor-1".to_string()),
            timestamp: Some("2026-03-01T10:05:00Z".to_string()),
            temperature: Some(serde_json::Number::from_f64(20.1).unwrap()),
            humidity: Some(serde_json::Number::from(55u32)),
        };

        let reading = Reading::parse(&msg).unwrap();

        assert_eq!(reading.temperature, dec!(20.1));
        assert_eq!(reading.humidity, dec!(55));
    }
}
