use crate::error::{DomainError, DomainResult};
use crate::reading::{RawReadingMessage, Reading};
use crate::update_service::AggregateUpdateService;
use std::sync::Arc;
use tracing::{debug, warn};

/// One raw queue message handed to the coordinator, with a caller-supplied
/// reference used in failure reports.
#[derive(Debug, Clone)]
pub struct InboundReading {
    pub reference: String,
    pub payload: Vec<u8>,
}

/// A single reading that did not commit, tagged with why.
#[derive(Debug)]
pub struct BatchFailure {
    pub index: usize,
    pub reference: String,
    pub reason: DomainError,
}

/// Outcome of one batch: how many readings committed, and an ordered list
/// of the ones that did not.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub processed: usize,
    pub failures: Vec<BatchFailure>,
}

/// Batch coordinator: feeds each inbound reading through validation and the
/// conditional-write protocol, isolating failures per reading.
pub struct ReadingIngestService {
    update_service: Arc<AggregateUpdateService>,
}

impl ReadingIngestService {
    pub fn new(update_service: Arc<AggregateUpdateService>) -> Self {
        Self { update_service }
    }

    /// Process one inbound batch. A failed reading is recorded and skipped;
    /// it never aborts the remainder of the batch.
    pub async fn ingest_batch(&self, batch: Vec<InboundReading>) -> BatchSummary {
        let mut summary = BatchSummary::default();

        for (index, inbound) in batch.into_iter().enumerate() {
            match self.ingest_one(&inbound).await {
                Ok(()) => {
                    debug!(reference = %inbound.reference, "reading committed");
                    summary.processed += 1;
                }
                Err(reason) => {
                    warn!(
                        reference = %inbound.reference,
                        error = %reason,
                        "reading failed"
                    );
                    summary.failures.push(BatchFailure {
                        index,
                        reference: inbound.reference,
                        reason,
                    });
                }
            }
        }

        summary
    }

    async fn ingest_one(&self, inbound: &InboundReading) -> DomainResult<()> {
        let message: RawReadingMessage = serde_json::from_slice(&inbound.payload)
            .map_err(|e| DomainError::MalformedInput(format!("invalid JSON payload: {e}")))?;
        let reading = Reading::parse(&message)?;

        self.update_service.apply(&reading).await?;
        Ok(())
    }
}
