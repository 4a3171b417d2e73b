use crate::aggregate::HourlyAggregate;
use crate::error::DomainResult;
use crate::reading::BucketKey;
use crate::store::{
    AggregateStore, DeviceHourAggregate, QueryRangeInput, VersionedAggregate, WriteOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-memory implementation of [`AggregateStore`] with real version-check
/// semantics, backing the concurrency tests and local runs.
pub struct InMemoryAggregateStore {
    records: RwLock<HashMap<(String, DateTime<Utc>), VersionedAggregate>>,
}

impl InMemoryAggregateStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryAggregateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AggregateStore for InMemoryAggregateStore {
    async fn get(&self, key: &BucketKey) -> DomainResult<Option<VersionedAggregate>> {
        let records = self.records.read().await;
        Ok(records
            .get(&(key.device_id.clone(), key.hour_bucket))
            .cloned())
    }

    async fn insert(
        &self,
        key: &BucketKey,
        record: &HourlyAggregate,
    ) -> DomainResult<WriteOutcome> {
        let mut records = self.records.write().await;
        let entry = (key.device_id.clone(), key.hour_bucket);
        if records.contains_key(&entry) {
            return Ok(WriteOutcome::Conflict);
        }
        records.insert(
            entry,
            VersionedAggregate {
                version: 1,
                record: record.clone(),
            },
        );
        Ok(WriteOutcome::Committed)
    }

    async fn update(
        &self,
        key: &BucketKey,
        record: &HourlyAggregate,
        expected_version: i64,
    ) -> DomainResult<WriteOutcome> {
        let mut records = self.records.write().await;
        let entry = (key.device_id.clone(), key.hour_bucket);
        match records.get_mut(&entry) {
            Some(stored) if stored.version == expected_version => {
                stored.version += 1;
                stored.record = record.clone();
                Ok(WriteOutcome::Committed)
            }
            _ => Ok(WriteOutcome::Conflict),
        }
    }

    async fn query_range(&self, input: QueryRangeInput) -> DomainResult<Vec<DeviceHourAggregate>> {
        let records = self.records.read().await;
        let mut rows: Vec<DeviceHourAggregate> = records
            .iter()
            .filter(|((device_id, hour_bucket), _)| {
                *device_id == input.device_id
                    && input.start.map_or(true, |start| *hour_bucket >= start)
                    && input.end.map_or(true, |end| *hour_bucket <= end)
            })
            .map(|((device_id, hour_bucket), stored)| DeviceHourAggregate {
                device_id: device_id.clone(),
                hour_bucket: *hour_bucket,
                record: stored.record.clone(),
            })
            .collect();
        rows.sort_by(|a, b| b.hour_bucket.cmp(&a.hour_bucket));
        rows.truncate(input.limit.max(0) as usize);
        Ok(rows)
    }

    async fn list_device_ids(&self) -> DomainResult<Vec<String>> {
        let records = self.records.read().await;
        let mut device_ids: Vec<String> = records.keys().map(|(device_id, _)| device_id.clone()).collect();
        device_ids.sort();
        device_ids.dedup();
        Ok(device_ids)
    }
}
