use crate::consumer::{BatchProcessor, ProcessingResult};
use async_nats::jetstream::Message;
use hourwise_domain::{BatchSummary, DomainError, InboundReading, ReadingIngestService};
use std::sync::Arc;
use tracing::info;

/// Create a [`BatchProcessor`] that feeds fetched messages through the
/// batch coordinator and turns its summary into per-message dispositions.
pub fn create_reading_processor(service: Arc<ReadingIngestService>) -> BatchProcessor {
    Box::new(move |messages: &[Message]| {
        let service = Arc::clone(&service);

        // Copy payloads and subjects out of the borrowed slice before the
        // async block takes ownership.
        let batch: Vec<InboundReading> = messages
            .iter()
            .enumerate()
            .map(|(idx, msg)| InboundReading {
                reference: format!("{}[{}]", msg.subject, idx),
                payload: msg.payload.to_vec(),
            })
            .collect();

        Box::pin(async move {
            let batch_len = batch.len();
            let summary = service.ingest_batch(batch).await;

            info!(
                processed = summary.processed,
                failed = summary.failures.len(),
                "Finished reading batch"
            );

            Ok(dispositions_from_summary(batch_len, summary))
        })
    })
}

/// Map the coordinator's failure taxonomy to queue dispositions:
/// committed readings are acknowledged, malformed readings are terminated
/// (redelivering them can never succeed), everything else is rejected for
/// redelivery.
fn dispositions_from_summary(batch_len: usize, summary: BatchSummary) -> ProcessingResult {
    let mut result = ProcessingResult::default();
    let mut failed = vec![false; batch_len];

    for failure in summary.failures {
        if failure.index >= batch_len {
            continue;
        }
        failed[failure.index] = true;
        match &failure.reason {
            DomainError::MalformedInput(_) => {
                result.term.push((failure.index, failure.reason.to_string()));
            }
            DomainError::ConcurrentUpdateExhausted { .. } | DomainError::StoreUnavailable(_) => {
                result
                    .nak
                    .push((failure.index, Some(failure.reason.to_string())));
            }
        }
    }

    result.ack = (0..batch_len).filter(|idx| !failed[*idx]).collect();
    result
}
