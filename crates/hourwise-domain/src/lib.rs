pub mod aggregate;
pub mod error;
pub mod in_memory_store;
pub mod ingest_service;
pub mod reading;
pub mod store;
pub mod update_service;

pub use aggregate::HourlyAggregate;
pub use error::{DomainError, DomainResult};
pub use in_memory_store::InMemoryAggregateStore;
pub use ingest_service::{BatchFailure, BatchSummary, InboundReading, ReadingIngestService};
pub use reading::{BucketKey, RawReadingMessage, Reading};
pub use store::{
    AggregateStore, DeviceHourAggregate, QueryRangeInput, VersionedAggregate, WriteOutcome,
};
pub use update_service::AggregateUpdateService;
