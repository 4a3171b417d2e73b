use crate::client::PostgresClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hourwise_domain::{
    AggregateStore, BucketKey, DeviceHourAggregate, DomainError, DomainResult, HourlyAggregate,
    QueryRangeInput, VersionedAggregate, WriteOutcome,
};
use rust_decimal::Decimal;
use tracing::{debug, instrument};

const SCHEMA_SQL: &str = include_str!("../migrations/001_hourly_aggregates.sql");

const RECORD_COLUMNS: &str = "avg_temperature, avg_humidity, min_temperature, max_temperature, \
     min_humidity, max_humidity, reading_count, last_updated";

/// Aggregate row as stored in PostgreSQL.
#[derive(Debug, Clone)]
struct AggregateRow {
    avg_temperature: Decimal,
    avg_humidity: Decimal,
    min_temperature: Decimal,
    max_temperature: Decimal,
    min_humidity: Decimal,
    max_humidity: Decimal,
    reading_count: i64,
    last_updated: DateTime<Utc>,
}

impl AggregateRow {
    /// Columns in `RECORD_COLUMNS` order, starting at `offset` in the row.
    fn read(row: &tokio_postgres::Row, offset: usize) -> Self {
        Self {
            avg_temperature: row.get(offset),
            avg_humidity: row.get(offset + 1),
            min_temperature: row.get(offset + 2),
            max_temperature: row.get(offset + 3),
            min_humidity: row.get(offset + 4),
            max_humidity: row.get(offset + 5),
            reading_count: row.get(offset + 6),
            last_updated: row.get(offset + 7),
        }
    }
}

impl From<AggregateRow> for HourlyAggregate {
    fn from(row: AggregateRow) -> Self {
        HourlyAggregate {
            avg_temperature: row.avg_temperature,
            avg_humidity: row.avg_humidity,
            min_temperature: row.min_temperature,
            max_temperature: row.max_temperature,
            min_humidity: row.min_humidity,
            max_humidity: row.max_humidity,
            count: row.reading_count.max(0) as u64,
            last_updated: row.last_updated,
        }
    }
}

/// PostgreSQL implementation of [`AggregateStore`].
///
/// Conditional writes ride on the `version` column: inserts create version
/// 1 iff the bucket row is absent, updates advance the version iff it still
/// matches the one observed at read time.
#[derive(Clone)]
pub struct PostgresAggregateStore {
    client: PostgresClient,
}

impl PostgresAggregateStore {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }

    /// Create the aggregate table if it does not exist yet.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        let conn = self.client.get_connection().await?;
        conn.batch_execute(SCHEMA_SQL).await?;
        debug!("hourly_aggregates schema ensured");
        Ok(())
    }
}

fn store_unavailable(error: impl Into<anyhow::Error>) -> DomainError {
    DomainError::StoreUnavailable(error.into())
}

#[async_trait]
impl AggregateStore for PostgresAggregateStore {
    #[instrument(skip(self, key), fields(device_id = %key.device_id, hour_bucket = %key.hour_bucket_iso()))]
    async fn get(&self, key: &BucketKey) -> DomainResult<Option<VersionedAggregate>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::StoreUnavailable)?;

        let sql = format!(
            "SELECT version, {RECORD_COLUMNS} \
             FROM hourly_aggregates WHERE device_id = $1 AND hour_bucket = $2"
        );
        let row = conn
            .query_opt(sql.as_str(), &[&key.device_id, &key.hour_bucket])
            .await
            .map_err(store_unavailable)?;

        Ok(row.map(|row| VersionedAggregate {
            version: row.get(0),
            record: AggregateRow::read(&row, 1).into(),
        }))
    }

    #[instrument(skip(self, key, record), fields(device_id = %key.device_id, hour_bucket = %key.hour_bucket_iso()))]
    async fn insert(
        &self,
        key: &BucketKey,
        record: &HourlyAggregate,
    ) -> DomainResult<WriteOutcome> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::StoreUnavailable)?;

        let sql = format!(
            "INSERT INTO hourly_aggregates \
             (device_id, hour_bucket, {RECORD_COLUMNS}, version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 1) \
             ON CONFLICT (device_id, hour_bucket) DO NOTHING"
        );
        let rows = conn
            .execute(
                sql.as_str(),
                &[
                    &key.device_id,
                    &key.hour_bucket,
                    &record.avg_temperature,
                    &record.avg_humidity,
                    &record.min_temperature,
                    &record.max_temperature,
                    &record.min_humidity,
                    &record.max_humidity,
                    &(record.count as i64),
                    &record.last_updated,
                ],
            )
            .await
            .map_err(store_unavailable)?;

        if rows == 1 {
            Ok(WriteOutcome::Committed)
        } else {
            debug!("bucket already created by a concurrent writer");
            Ok(WriteOutcome::Conflict)
        }
    }

    #[instrument(skip(self, key, record), fields(device_id = %key.device_id, hour_bucket = %key.hour_bucket_iso(), expected_version))]
    async fn update(
        &self,
        key: &BucketKey,
        record: &HourlyAggregate,
        expected_version: i64,
    ) -> DomainResult<WriteOutcome> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::StoreUnavailable)?;

        let rows = conn
            .execute(
                "UPDATE hourly_aggregates SET \
                     avg_temperature = $3, avg_humidity = $4, \
                     min_temperature = $5, max_temperature = $6, \
                     min_humidity = $7, max_humidity = $8, \
                     reading_count = $9, last_updated = $10, \
                     version = version + 1 \
                 WHERE device_id = $1 AND hour_bucket = $2 AND version = $11",
                &[
                    &key.device_id,
                    &key.hour_bucket,
                    &record.avg_temperature,
                    &record.avg_humidity,
                    &record.min_temperature,
                    &record.max_temperature,
                    &record.min_humidity,
                    &record.max_humidity,
                    &(record.count as i64),
                    &record.last_updated,
                    &expected_version,
                ],
            )
            .await
            .map_err(store_unavailable)?;

        if rows == 1 {
            Ok(WriteOutcome::Committed)
        } else {
            debug!(expected_version, "stored version moved, conditional write lost");
            Ok(WriteOutcome::Conflict)
        }
    }

    #[instrument(skip(self, input), fields(device_id = %input.device_id, limit = input.limit))]
    async fn query_range(&self, input: QueryRangeInput) -> DomainResult<Vec<DeviceHourAggregate>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::StoreUnavailable)?;

        let sql = format!(
            "SELECT device_id, hour_bucket, {RECORD_COLUMNS} \
             FROM hourly_aggregates \
             WHERE device_id = $1 \
               AND ($2::timestamptz IS NULL OR hour_bucket >= $2) \
               AND ($3::timestamptz IS NULL OR hour_bucket <= $3) \
             ORDER BY hour_bucket DESC \
             LIMIT $4"
        );
        let rows = conn
            .query(
                sql.as_str(),
                &[&input.device_id, &input.start, &input.end, &input.limit],
            )
            .await
            .map_err(store_unavailable)?;

        Ok(rows
            .iter()
            .map(|row| DeviceHourAggregate {
                device_id: row.get(0),
                hour_bucket: row.get(1),
                record: AggregateRow::read(row, 2).into(),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn list_device_ids(&self) -> DomainResult<Vec<String>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::StoreUnavailable)?;

        let rows = conn
            .query(
                "SELECT DISTINCT device_id FROM hourly_aggregates ORDER BY device_id",
                &[],
            )
            .await
            .map_err(store_unavailable)?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }
}
