pub mod aggregation_worker;

pub use aggregation_worker::{AggregationWorker, AggregationWorkerConfig, WorkerProcess};
