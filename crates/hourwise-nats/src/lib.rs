pub mod client;
pub mod consumer;
pub mod reading_processor;

pub use client::NatsClient;
pub use consumer::{BatchProcessor, NatsConsumer, ProcessingResult};
pub use reading_processor::create_reading_processor;
