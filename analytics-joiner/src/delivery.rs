use std::sync::Arc;

use metrics::counter;
use tracing::{error, info, warn};

use crate::dead_letter::{DeadLetterEnvelope, DeadLetterRecord, DeadLetterSink};
use crate::error::DeliveryError;
use crate::event::MergedRecord;
use crate::metrics_consts::{
    DEAD_LETTERS_WRITTEN, DEAD_LETTER_WRITE_FAILURES, DELIVERY_ATTEMPTS, DELIVERY_RETRIES,
    MESSAGES_FAILED, MESSAGES_PROCESSED,
};
use crate::retry::RetryPolicy;
use crate::sink::AnalyticsSink;

/// Successful hand-off of a merged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub attempts: u32,
}

/// Sends merged records to the sink with bounded retries, dead-lettering what never gets through.
pub struct DeliveryPipeline {
    sink: Arc<dyn AnalyticsSink>,
    dead_letter: Arc<dyn DeadLetterSink>,
    retry_policy: RetryPolicy,
}

impl DeliveryPipeline {
    pub fn new(
        sink: Arc<dyn AnalyticsSink>,
        dead_letter: Arc<dyn DeadLetterSink>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            sink,
            dead_letter,
            retry_policy,
        }
    }

    /// Deliver `record`, or dead-letter it once delivery has definitively failed.
    pub async fn deliver(&self, record: MergedRecord) -> Result<Ack, DeliveryError> {
        match self.send_with_retries(&record).await {
            Ok(ack) => {
                counter!(MESSAGES_PROCESSED).increment(1);
                Ok(ack)
            }
            Err(delivery_error) => {
                counter!(MESSAGES_FAILED).increment(1);
                warn!(
                    id = %record.id,
                    attempts = delivery_error.attempts(),
                    error = %delivery_error,
                    "delivery failed, routing record to dead letters"
                );
                self.dead_letter(
                    DeadLetterRecord::Merged(record),
                    delivery_error.to_string(),
                )
                .await;
                Err(delivery_error)
            }
        }
    }

    async fn send_with_retries(&self, record: &MergedRecord) -> Result<Ack, DeliveryError> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            counter!(DELIVERY_ATTEMPTS).increment(1);

            let error = match self.sink.send(record).await {
                Ok(()) => return Ok(Ack { attempts: attempt }),
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(DeliveryError::Permanent {
                    attempts: attempt,
                    source: error,
                });
            }

            if !self.retry_policy.should_retry(attempt) {
                return Err(DeliveryError::Exhausted {
                    attempts: attempt,
                    source: error,
                });
            }

            let wait = self.retry_policy.retry_interval(attempt, error.retry_after());
            info!(
                id = %record.id,
                attempt,
                wait_ms = wait.as_millis() as u64,
                error = %error,
                "delivery attempt failed, retrying"
            );
            counter!(DELIVERY_RETRIES).increment(1);
            tokio::time::sleep(wait).await;
        }
    }

    /// Best-effort write to the dead-letter channel. Failures are logged and counted only.
    pub async fn dead_letter(&self, record: DeadLetterRecord, error: String) {
        let kind = record.kind();
        let envelope = DeadLetterEnvelope::new(record, error);

        match self.dead_letter.write(&envelope).await {
            Ok(()) => {
                counter!(DEAD_LETTERS_WRITTEN, "kind" => kind).increment(1);
            }
            Err(write_error) => {
                counter!(DEAD_LETTER_WRITE_FAILURES, "kind" => kind).increment(1);
                error!(
                    key = %envelope.record.correlation_key(),
                    kind,
                    error = %write_error,
                    "failed to write dead letter"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common_kafka::kafka_producer::KafkaProduceError;
    use serde_json::json;

    use super::*;
    use crate::dead_letter::MockDeadLetterSink;
    use crate::error::SinkError;
    use crate::test_utils::{record_counters, RecordingDeadLetters, RecordingSink};

    fn record() -> MergedRecord {
        MergedRecord {
            id: "C1".to_string(),
            customer: json!({"id": "C1"}),
            inventory: json!({"id": "C1"}),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let sink = Arc::new(RecordingSink::with_script(
            vec![Err(SinkError::transient("503")), Err(SinkError::transient("503"))],
            Ok(()),
        ));
        let dead_letters = Arc::new(RecordingDeadLetters::default());
        let pipeline =
            DeliveryPipeline::new(sink.clone(), dead_letters.clone(), RetryPolicy::default());

        let ack = pipeline.deliver(record()).await.unwrap();

        assert_eq!(ack.attempts, 3);
        assert_eq!(sink.attempts(), 3);
        assert!(dead_letters.envelopes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_makes_five_attempts_with_growing_gaps() {
        let sink = Arc::new(RecordingSink::failing(SinkError::transient("503")));
        let dead_letters = Arc::new(RecordingDeadLetters::default());
        let pipeline =
            DeliveryPipeline::new(sink.clone(), dead_letters.clone(), RetryPolicy::default());

        let error = pipeline.deliver(record()).await.unwrap_err();

        assert!(matches!(error, DeliveryError::Exhausted { attempts: 5, .. }));
        let instants = sink.attempt_instants();
        assert_eq!(instants.len(), 5);
        let gaps: Vec<Duration> = instants.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.windows(2).all(|g| g[1] > g[0]), "gaps not increasing: {gaps:?}");
        assert_eq!(gaps[0], Duration::from_secs(2));

        let envelopes = dead_letters.envelopes();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].record.correlation_key(), "C1");
        assert!(!envelopes[0].error.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let sink = Arc::new(RecordingSink::failing(SinkError::permanent("400")));
        let dead_letters = Arc::new(RecordingDeadLetters::default());
        let pipeline =
            DeliveryPipeline::new(sink.clone(), dead_letters.clone(), RetryPolicy::default());

        let error = pipeline.deliver(record()).await.unwrap_err();

        assert!(matches!(error, DeliveryError::Permanent { attempts: 1, .. }));
        assert_eq!(sink.attempts(), 1);
        assert_eq!(dead_letters.envelopes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_is_honoured() {
        let sink = Arc::new(RecordingSink::with_script(
            vec![Err(SinkError::Transient {
                message: "429".to_string(),
                retry_after: Some(Duration::from_secs(3)),
            })],
            Ok(()),
        ));
        let pipeline = DeliveryPipeline::new(
            sink.clone(),
            Arc::new(RecordingDeadLetters::default()),
            RetryPolicy::build(2, Duration::from_secs(2))
                .maximum_interval(Duration::from_secs(30))
                .provide(),
        );

        pipeline.deliver(record()).await.unwrap();

        let instants = sink.attempt_instants();
        assert_eq!(instants[1] - instants[0], Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_constant_retry_after_still_grows_gaps() {
        let sink = Arc::new(RecordingSink::failing(SinkError::Transient {
            message: "503".to_string(),
            retry_after: Some(Duration::from_secs(10)),
        }));
        let pipeline = DeliveryPipeline::new(
            sink.clone(),
            Arc::new(RecordingDeadLetters::default()),
            RetryPolicy::default(),
        );

        pipeline.deliver(record()).await.unwrap_err();

        let instants = sink.attempt_instants();
        let gaps: Vec<Duration> = instants.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(10),
                Duration::from_secs(16),
            ]
        );
    }

    #[test]
    fn test_outcome_counters() {
        let ((), counters) = record_counters(async {
            let accepted = DeliveryPipeline::new(
                Arc::new(RecordingSink::accepting()),
                Arc::new(RecordingDeadLetters::default()),
                RetryPolicy::default(),
            );
            accepted.deliver(record()).await.unwrap();
            accepted.deliver(record()).await.unwrap();

            let rejected = DeliveryPipeline::new(
                Arc::new(RecordingSink::failing(SinkError::permanent("400"))),
                Arc::new(RecordingDeadLetters::default()),
                RetryPolicy::default(),
            );
            rejected.deliver(record()).await.unwrap_err();

            let exhausted = DeliveryPipeline::new(
                Arc::new(RecordingSink::failing(SinkError::transient("503"))),
                Arc::new(RecordingDeadLetters::default()),
                RetryPolicy::default(),
            );
            exhausted.deliver(record()).await.unwrap_err();
        });

        assert_eq!(counters.get(MESSAGES_PROCESSED), Some(&2));
        assert_eq!(counters.get(MESSAGES_FAILED), Some(&2));
        assert_eq!(counters.get(DEAD_LETTERS_WRITTEN), Some(&2));
        assert_eq!(counters.get(DELIVERY_ATTEMPTS), Some(&8));
        assert_eq!(counters.get(DELIVERY_RETRIES), Some(&4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_write_failure_is_contained() {
        let mut dead_letters = MockDeadLetterSink::new();
        dead_letters
            .expect_write()
            .withf(|envelope| envelope.record.correlation_key() == "C1")
            .times(1)
            .returning(|_| Err(KafkaProduceError::KafkaProduceCanceled.into()));
        let pipeline = DeliveryPipeline::new(
            Arc::new(RecordingSink::failing(SinkError::permanent("400"))),
            Arc::new(dead_letters),
            RetryPolicy::default(),
        );

        let error = pipeline.deliver(record()).await.unwrap_err();

        assert_eq!(error.attempts(), 1);
    }
}
