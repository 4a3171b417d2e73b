use crate::aggregate::HourlyAggregate;
use crate::error::{DomainError, DomainResult};
use crate::reading::{BucketKey, Reading};
use crate::store::{AggregateStore, WriteOutcome};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default conditional-write attempt budget per reading.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default base delay for backoff after a transient store failure.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Applies one reading's contribution to its bucket through a
/// compare-and-swap retry loop.
///
/// Each attempt re-reads the bucket, computes the candidate record from the
/// freshly observed state, and commits it with a conditional write. A lost
/// race re-enters the loop immediately; a transient store failure re-enters
/// it after bounded exponential backoff. The reading's contribution is
/// either one committed conditional write or nothing.
pub struct AggregateUpdateService {
    store: Arc<dyn AggregateStore>,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl AggregateUpdateService {
    pub fn new(store: Arc<dyn AggregateStore>) -> Self {
        Self::with_policy(store, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BACKOFF)
    }

    pub fn with_policy(
        store: Arc<dyn AggregateStore>,
        max_attempts: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
            retry_backoff,
        }
    }

    /// Apply one reading to its hour bucket, returning the bucket key it
    /// was merged into.
    pub async fn apply(&self, reading: &Reading) -> DomainResult<BucketKey> {
        let key = BucketKey::for_reading(reading);

        // Set after a transient failure, cleared after a conflict, so the
        // exhaustion error names the obstacle seen last.
        let mut transient: Option<anyhow::Error> = None;

        for attempt in 1..=self.max_attempts {
            let current = match self.store.get(&key).await {
                Ok(current) => current,
                Err(DomainError::StoreUnavailable(source)) => {
                    warn!(
                        device_id = %key.device_id,
                        hour_bucket = %key.hour_bucket_iso(),
                        attempt,
                        error = %source,
                        "store read failed, backing off"
                    );
                    transient = Some(source);
                    self.backoff(attempt).await;
                    continue;
                }
                Err(other) => return Err(other),
            };

            let now = Utc::now();
            let outcome = match &current {
                None => {
                    let record = HourlyAggregate::initial(reading, now);
                    self.store.insert(&key, &record).await
                }
                Some(observed) => {
                    let record = observed.record.merge(reading, now);
                    self.store.update(&key, &record, observed.version).await
                }
            };

            match outcome {
                Ok(WriteOutcome::Committed) => {
                    debug!(
                        device_id = %key.device_id,
                        hour_bucket = %key.hour_bucket_iso(),
                        attempt,
                        "committed reading to bucket"
                    );
                    return Ok(key);
                }
                Ok(WriteOutcome::Conflict) => {
                    debug!(
                        device_id = %key.device_id,
                        hour_bucket = %key.hour_bucket_iso(),
                        attempt,
                        "lost conditional write, retrying with fresh state"
                    );
                    transient = None;
                }
                Err(DomainError::StoreUnavailable(source)) => {
                    warn!(
                        device_id = %key.device_id,
                        hour_bucket = %key.hour_bucket_iso(),
                        attempt,
                        error = %source,
                        "conditional write failed, backing off"
                    );
                    transient = Some(source);
                    self.backoff(attempt).await;
                }
                Err(other) => return Err(other),
            }
        }

        match transient {
            Some(source) => Err(DomainError::StoreUnavailable(source)),
            None => Err(DomainError::ConcurrentUpdateExhausted {
                attempts: self.max_attempts,
            }),
        }
    }

    async fn backoff(&self, attempt: u32) {
        let factor = 1u32 << (attempt - 1).min(6);
        tokio::time::sleep(self.retry_backoff.saturating_mul(factor)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MockAggregateStore, VersionedAggregate};
    use mockall::Sequence;
    use rust_decimal_macros::dec;

    fn reading(temperature: rust_decimal::Decimal) -> Reading {
        Reading {
            device_id: "sensor-1".to_string(),
            occurred_at: "2026-03-01T10:05:00Z".parse().unwrap(),
            temperature,
            humidity: dec!(50),
        }
    }

    fn stored(version: i64, record: HourlyAggregate) -> VersionedAggregate {
        VersionedAggregate { version, record }
    }

    #[tokio::test]
    async fn test_apply_inserts_when_bucket_absent() {
        // Arrange
        let mut mock_store = MockAggregateStore::new();
        mock_store.expect_get().times(1).return_once(|_| Ok(None));
        mock_store
            .expect_insert()
            .withf(|key: &BucketKey, record: &HourlyAggregate| {
                key.device_id == "sensor-1"
                    && key.hour_bucket_iso() == "2026-03-01T10:00:00+00:00"
                    && record.count == 1
                    && record.avg_temperature == dec!(20)
            })
            .times(1)
            .return_once(|_, _| Ok(WriteOutcome::Committed));

        let service = AggregateUpdateService::new(Arc::new(mock_store));

        // Act
        let key = service.apply(&reading(dec!(20))).await.unwrap();

        // Assert
        assert_eq!(key.device_id, "sensor-1");
    }

    #[tokio::test]
    async fn test_apply_merges_when_bucket_present() {
        // Arrange
        let existing = HourlyAggregate::initial(&reading(dec!(20)), Utc::now());

        let mut mock_store = MockAggregateStore::new();
        mock_store
            .expect_get()
            .times(1)
            .return_once(move |_| Ok(Some(stored(3, existing))));
        mock_store
            .expect_update()
            .withf(|_key, record: &HourlyAggregate, expected: &i64| {
                record.count == 2 && record.avg_temperature == dec!(22) && *expected == 3
            })
            .times(1)
            .return_once(|_, _, _| Ok(WriteOutcome::Committed));

        let service = AggregateUpdateService::new(Arc::new(mock_store));

        // Act
        let result = service.apply(&reading(dec!(24))).await;

        // Assert
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_apply_retries_conflict_with_fresh_state() {
        // Arrange: the insert loses to a concurrent writer; the retry must
        // merge against the state that writer committed, not reuse its own.
        let mut seq = Sequence::new();
        let mut mock_store = MockAggregateStore::new();

        mock_store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(|_| Ok(None));
        mock_store
            .expect_insert()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(|_, _| Ok(WriteOutcome::Conflict));
        mock_store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(|_| {
                Ok(Some(stored(
                    1,
                    HourlyAggregate::initial(&reading(dec!(30)), Utc::now()),
                )))
            });
        mock_store
            .expect_update()
            .withf(|_key, record: &HourlyAggregate, expected: &i64| {
                record.count == 2 && record.avg_temperature == dec!(25) && *expected == 1
            })
            .times(1)
            .in_sequence(&mut seq)
            .return_once(|_, _, _| Ok(WriteOutcome::Committed));

        let service = AggregateUpdateService::new(Arc::new(mock_store));

        // Act
        let result = service.apply(&reading(dec!(20))).await;

        // Assert
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_apply_exhausts_budget_on_persistent_conflict() {
        // Arrange
        let mut mock_store = MockAggregateStore::new();
        mock_store.expect_get().times(3).returning(|_| Ok(None));
        mock_store
            .expect_insert()
            .times(3)
            .returning(|_, _| Ok(WriteOutcome::Conflict));

        let service = AggregateUpdateService::with_policy(
            Arc::new(mock_store),
            3,
            Duration::from_millis(1),
        );

        // Act
        let result = service.apply(&reading(dec!(20))).await;

        // Assert
        assert!(matches!(
            result,
            Err(DomainError::ConcurrentUpdateExhausted { attempts: 3 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_backs_off_and_recovers_from_transient_failure() {
        // Arrange
        let mut seq = Sequence::new();
        let mut mock_store = MockAggregateStore::new();

        mock_store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(|_| {
                Err(DomainError::StoreUnavailable(anyhow::anyhow!(
                    "connection reset"
                )))
            });
        mock_store
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(|_| Ok(None));
        mock_store
            .expect_insert()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(|_, _| Ok(WriteOutcome::Committed));

        let service = AggregateUpdateService::new(Arc::new(mock_store));

        // Act
        let result = service.apply(&reading(dec!(20))).await;

        // Assert
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_reports_store_unavailable_when_backend_stays_down() {
        // Arrange
        let mut mock_store = MockAggregateStore::new();
        mock_store.expect_get().times(2).returning(|_| {
            Err(DomainError::StoreUnavailable(anyhow::anyhow!(
                "connection reset"
            )))
        });

        let service = AggregateUpdateService::with_policy(
            Arc::new(mock_store),
            2,
            Duration::from_millis(1),
        );

        // Act
        let result = service.apply(&reading(dec!(20))).await;

        // Assert
        assert!(matches!(result, Err(DomainError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_apply_propagates_malformed_input_without_retry() {
        // Arrange
        let mut mock_store = MockAggregateStore::new();
        mock_store
            .expect_get()
            .times(1)
            .return_once(|_| Err(DomainError::MalformedInput("bad key".to_string())));

        let service = AggregateUpdateService::new(Arc::new(mock_store));

        // Act
        let result = service.apply(&reading(dec!(20))).await;

        // Assert
        assert!(matches!(result, Err(DomainError::MalformedInput(_))));
    }
}
