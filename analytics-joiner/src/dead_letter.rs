use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_kafka::kafka_producer::{send_keyed_json, KafkaContext, KafkaProduceError};
use rdkafka::producer::FutureProducer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{HalfRecord, MergedRecord};

/// What failed to reach the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum DeadLetterRecord {
    /// A merged record whose delivery failed permanently or ran out of retries.
    Merged(MergedRecord),
    /// A half evicted from the join cache before its partner arrived.
    OrphanedHalf(HalfRecord),
}

impl DeadLetterRecord {
    pub fn correlation_key(&self) -> &str {
        match self {
            DeadLetterRecord::Merged(record) => &record.id,
            DeadLetterRecord::OrphanedHalf(half) => &half.correlation_key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DeadLetterRecord::Merged(_) => "merged",
            DeadLetterRecord::OrphanedHalf(_) => "orphaned_half",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    pub record: DeadLetterRecord,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEnvelope {
    pub fn new(record: DeadLetterRecord, error: impl Into<String>) -> Self {
        Self {
            record,
            error: error.into(),
            failed_at: Utc::now(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error(transparent)]
    Produce(#[from] KafkaProduceError),
}

/// Escape path for records that could not be delivered.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn write(&self, envelope: &DeadLetterEnvelope) -> Result<(), DeadLetterError>;
}

/// Produces dead-letter envelopes as JSON to a Kafka topic, keyed by correlation key.
pub struct KafkaDeadLetterProducer {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaDeadLetterProducer {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterProducer {
    async fn write(&self, envelope: &DeadLetterEnvelope) -> Result<(), DeadLetterError> {
        send_keyed_json(
            &self.producer,
            &self.topic,
            Some(envelope.record.correlation_key()),
            envelope,
        )
        .await?;
        Ok(())
    }
}
