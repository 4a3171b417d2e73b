use crate::reading::Reading;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Running statistics for one (device, hour) bucket.
///
/// All measure fields are decimals so that the incremental average stays an
/// exact arithmetic mean across arbitrarily many merges; `count` is shared
/// between the temperature and humidity series.
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyAggregate {
    pub avg_temperature: Decimal,
    pub avg_humidity: Decimal,
    pub min_temperature: Decimal,
    pub max_temperature: Decimal,
    pub min_humidity: Decimal,
    pub max_humidity: Decimal,
    pub count: u64,
    pub last_updated: DateTime<Utc>,
}

impl HourlyAggregate {
    /// The aggregate for a bucket seeing its first reading.
    pub fn initial(reading: &Reading, now: DateTime<Utc>) -> Self {
        Self {
            avg_temperature: reading.temperature,
            avg_humidity: reading.humidity,
            min_temperature: reading.temperature,
            max_temperature: reading.temperature,
            min_humidity: reading.humidity,
            max_humidity: reading.humidity,
            count: 1,
            last_updated: now,
        }
    }

    /// Fold one reading into the aggregate, returning the next value.
    /// Inputs are left untouched; the merge is commutative and associative
    /// over the set of contributed readings.
    pub fn merge(&self, reading: &Reading, now: DateTime<Utc>) -> Self {
        let previous_count = Decimal::from(self.count);
        let new_count = Decimal::from(self.count + 1);

        Self {
            avg_temperature: (self.avg_temperature * previous_count + reading.temperature)
                / new_count,
            avg_humidity: (self.avg_humidity * previous_count + reading.humidity) / new_count,
            min_temperature: self.min_temperature.min(reading.temperature),
            max_temperature: self.max_temperature.max(reading.temperature),
            min_humidity: self.min_humidity.min(reading.humidity),
            max_humidity: self.max_humidity.max(reading.humidity),
            count: self.count + 1,
            last_updated: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn reading(temperature: Decimal, humidity: Decimal) -> Reading {
        Reading {
            device_id: "sensor-1".to_string(),
            occurred_at: Utc::now(),
            temperature,
            humidity,
        }
    }

    fn tolerance() -> Decimal {
        dec!(0.000000001)
    }

    #[test]
    fn test_initial_sets_all_measures_to_reading() {
        let now = Utc::now();

        let aggregate = HourlyAggregate::initial(&reading(dec!(20), dec!(50)), now);

        assert_eq!(aggregate.count, 1);
        assert_eq!(aggregate.avg_temperature, dec!(20));
        assert_eq!(aggregate.min_temperature, dec!(20));
        assert_eq!(aggregate.max_temperature, dec!(20));
        assert_eq!(aggregate.avg_humidity, dec!(50));
        assert_eq!(aggregate.min_humidity, dec!(50));
        assert_eq!(aggregate.max_humidity, dec!(50));
        assert_eq!(aggregate.last_updated, now);
    }

    #[test]
    fn test_merge_two_readings_scenario() {
        let now = Utc::now();
        let first = HourlyAggregate::initial(&reading(dec!(20), dec!(50)), now);

        let merged = first.merge(&reading(dec!(24), dec!(54)), now);

        assert_eq!(merged.count, 2);
        assert_eq!(merged.avg_temperature, dec!(22));
        assert_eq!(merged.min_temperature, dec!(20));
        assert_eq!(merged.max_temperature, dec!(24));
        assert_eq!(merged.avg_humidity, dec!(52));
        assert_eq!(merged.min_humidity, dec!(50));
        assert_eq!(merged.max_humidity, dec!(54));
    }

    #[test]
    fn test_merge_does_not_mutate_input() {
        let now = Utc::now();
        let first = HourlyAggregate::initial(&reading(dec!(20), dec!(50)), now);
        let snapshot = first.clone();

        let _ = first.merge(&reading(dec!(24), dec!(54)), now);

        assert_eq!(first, snapshot);
    }

    #[test]
    fn test_average_is_exact_mean_over_many_merges() {
        let now = Utc::now();
        let values: Vec<Decimal> = (1..=100).map(Decimal::from).collect();

        let mut aggregate = HourlyAggregate::initial(&reading(values[0], values[0]), now);
        for value in &values[1..] {
            aggregate = aggregate.merge(&reading(*value, *value), now);
        }

        let expected = values.iter().copied().sum::<Decimal>() / Decimal::from(values.len() as u64);
        assert_eq!(aggregate.count, 100);
        assert!((aggregate.avg_temperature - expected).abs() < tolerance());
        assert!((aggregate.avg_humidity - expected).abs() < tolerance());
    }

    #[test]
    fn test_min_max_monotonic_regardless_of_order() {
        let now = Utc::now();
        let values = [dec!(23.4), dec!(19.1), dec!(30.0), dec!(19.1), dec!(25.5)];

        let mut aggregate = HourlyAggregate::initial(&reading(values[0], values[0]), now);
        let mut min_seen = aggregate.min_temperature;
        let mut max_seen = aggregate.max_temperature;

        for value in &values[1..] {
            aggregate = aggregate.merge(&reading(*value, *value), now);
            assert!(aggregate.min_temperature <= min_seen);
            assert!(aggregate.max_temperature >= max_seen);
            min_seen = aggregate.min_temperature;
            max_seen = aggregate.max_temperature;
        }

        assert_eq!(aggregate.min_temperature, dec!(19.1));
        assert_eq!(aggregate.max_temperature, dec!(30.0));
    }

    #[test]
    fn test_average_bounded_by_min_and_max() {
        let now = Utc::now();
        let values = [dec!(12.5), dec!(18.75), dec!(9.0), dec!(21.25)];

        let mut aggregate = HourlyAggregate::initial(&reading(values[0], values[0]), now);
        for value in &values[1..] {
            aggregate = aggregate.merge(&reading(*value, *value), now);
        }

        assert!(aggregate.min_temperature <= aggregate.avg_temperature);
        assert!(aggregate.avg_temperature <= aggregate.max_temperature);
        assert!(aggregate.min_humidity <= aggregate.avg_humidity);
        assert!(aggregate.avg_humidity <= aggregate.max_humidity);
    }
}
