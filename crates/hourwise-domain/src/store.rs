use crate::aggregate::HourlyAggregate;
use crate::error::DomainResult;
use crate::reading::BucketKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Result of a conditional write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was applied.
    Committed,
    /// The stored record changed since it was read; nothing was written.
    Conflict,
}

/// An aggregate as read from the store, with the version used for
/// conditional writes.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedAggregate {
    pub version: i64,
    pub record: HourlyAggregate,
}

/// One row of a read-side range query.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceHourAggregate {
    pub device_id: String,
    pub hour_bucket: DateTime<Utc>,
    pub record: HourlyAggregate,
}

/// Input for range queries over a device's hour buckets.
#[derive(Debug, Clone)]
pub struct QueryRangeInput {
    pub device_id: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: i64,
}

/// Store trait for aggregate records.
/// Infrastructure (e.g., hourwise-postgres) implements this trait; the
/// conditional `insert`/`update` pair is the only synchronization mechanism
/// between concurrent writers of the same bucket.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Read the current record for a bucket, if any.
    async fn get(&self, key: &BucketKey) -> DomainResult<Option<VersionedAggregate>>;

    /// Create the record for a bucket iff none exists yet.
    async fn insert(&self, key: &BucketKey, record: &HourlyAggregate)
        -> DomainResult<WriteOutcome>;

    /// Overwrite the record for a bucket iff its stored version still
    /// equals `expected_version`; the version advances on commit.
    async fn update(
        &self,
        key: &BucketKey,
        record: &HourlyAggregate,
        expected_version: i64,
    ) -> DomainResult<WriteOutcome>;

    /// Aggregates for one device, most recent hour first, optionally
    /// bounded. Consumed by the external read API.
    async fn query_range(&self, input: QueryRangeInput) -> DomainResult<Vec<DeviceHourAggregate>>;

    /// Distinct device ids present in the store.
    async fn list_device_ids(&self) -> DomainResult<Vec<String>>;
}
