use std::sync::Arc;

use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::dead_letter::DeadLetterRecord;
use crate::dedup::DedupFilter;
use crate::delivery::DeliveryPipeline;
use crate::event::InboundEvent;
use crate::join_cache::JoinCache;
use crate::metrics_consts::{DECODE_FAILURES, MESSAGES_FAILED};

/// Terminal state of one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    DecodeFailed,
    Duplicate,
    /// Waiting in the join cache for its partner.
    Cached,
    Delivered,
    DeadLettered,
}

/// Runs one event through decode, dedup, join and delivery.
pub struct JoinProcessor {
    dedup: Arc<DedupFilter>,
    cache: Arc<JoinCache>,
    delivery: Arc<DeliveryPipeline>,
}

impl JoinProcessor {
    pub fn new(
        dedup: Arc<DedupFilter>,
        cache: Arc<JoinCache>,
        delivery: Arc<DeliveryPipeline>,
    ) -> Self {
        Self {
            dedup,
            cache,
            delivery,
        }
    }

    pub fn cache(&self) -> &JoinCache {
        &self.cache
    }

    /// Every error is contained here: the returned outcome is always terminal for `event`.
    pub async fn process(&self, event: InboundEvent) -> ProcessingOutcome {
        let half = match event.decode() {
            Ok(half) => half,
            Err(error) => {
                warn!(
                    side = %event.side,
                    partition = event.partition,
                    offset = event.offset,
                    error = %error,
                    "dropping malformed event"
                );
                counter!(DECODE_FAILURES, "side" => event.side.as_str()).increment(1);
                counter!(MESSAGES_FAILED).increment(1);
                return ProcessingOutcome::DecodeFailed;
            }
        };

        if self.dedup.is_duplicate(&event).await {
            debug!(
                key = %half.correlation_key,
                side = %event.side,
                offset = event.offset,
                "skipping duplicate event"
            );
            return ProcessingOutcome::Duplicate;
        }

        let Some(merged) = self.cache.offer(half) else {
            return ProcessingOutcome::Cached;
        };

        match self.delivery.deliver(merged).await {
            Ok(_) => ProcessingOutcome::Delivered,
            Err(_) => ProcessingOutcome::DeadLettered,
        }
    }

    /// Dead-letter every half the join cache gave up on. Returns how many were routed.
    pub async fn reap_orphans(&self) -> usize {
        let orphans = self.cache.take_orphans(Instant::now());
        let count = orphans.len();

        for (half, reason) in orphans {
            debug!(
                key = %half.correlation_key,
                side = %half.side,
                reason = reason.as_str(),
                "evicting unpaired half"
            );
            self.delivery
                .dead_letter(
                    DeadLetterRecord::OrphanedHalf(half),
                    format!("no partner arrived ({})", reason.as_str()),
                )
                .await;
        }

        count
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::SinkError;
    use crate::join_cache::JoinCacheConfig;
    use crate::retry::RetryPolicy;
    use crate::metrics_consts::{DUPLICATE_EVENTS, MESSAGES_PROCESSED};
    use crate::test_utils::{
        customer_event, inventory_event, record_counters, MemoryFingerprintStore,
        RecordingDeadLetters, RecordingSink,
    };

    struct Harness {
        processor: JoinProcessor,
        sink: Arc<RecordingSink>,
        dead_letters: Arc<RecordingDeadLetters>,
    }

    fn harness(sink: RecordingSink, cache_config: JoinCacheConfig) -> Harness {
        let sink = Arc::new(sink);
        let dead_letters = Arc::new(RecordingDeadLetters::default());
        let dedup = DedupFilter::new(
            Arc::new(MemoryFingerprintStore::default()),
            Duration::from_secs(3600),
        );
        let delivery = DeliveryPipeline::new(
            sink.clone(),
            dead_letters.clone(),
            RetryPolicy::default(),
        );
        Harness {
            processor: JoinProcessor::new(
                Arc::new(dedup),
                Arc::new(JoinCache::new(cache_config)),
                Arc::new(delivery),
            ),
            sink,
            dead_letters,
        }
    }

    #[tokio::test]
    async fn test_happy_path_pairs_and_delivers_once() {
        let h = harness(RecordingSink::accepting(), JoinCacheConfig::default());

        assert_eq!(
            h.processor
                .process(customer_event(r#"{"id":"C1","name":"Ada"}"#, 0))
                .await,
            ProcessingOutcome::Cached
        );
        assert_eq!(
            h.processor
                .process(inventory_event(r#"{"id":"C1","sku":"P1"}"#, 0))
                .await,
            ProcessingOutcome::Delivered
        );

        let records = h.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].customer["name"], "Ada");
        assert_eq!(records[0].inventory["sku"], "P1");
        assert_eq!(h.processor.cache().pending_keys(), 0);
    }

    #[tokio::test]
    async fn test_redelivered_event_is_skipped() {
        let h = harness(RecordingSink::accepting(), JoinCacheConfig::default());
        let payload = r#"{"id":"C1","name":"Ada"}"#;

        h.processor.process(customer_event(payload, 0)).await;
        assert_eq!(
            h.processor.process(customer_event(payload, 1)).await,
            ProcessingOutcome::Duplicate
        );
        h.processor
            .process(inventory_event(r#"{"id":"C1","sku":"P1"}"#, 0))
            .await;

        assert_eq!(h.sink.attempts(), 1);
    }

    #[tokio::test]
    async fn test_malformed_event_touches_nothing() {
        let h = harness(RecordingSink::accepting(), JoinCacheConfig::default());

        assert_eq!(
            h.processor
                .process(customer_event(r#"{"id":"broken" "missing colon"}"#, 0))
                .await,
            ProcessingOutcome::DecodeFailed
        );

        assert_eq!(h.processor.cache().pending_keys(), 0);
        assert_eq!(h.sink.attempts(), 0);
        assert!(h.dead_letters.envelopes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_is_dead_lettered() {
        let h = harness(
            RecordingSink::failing(SinkError::transient("503")),
            JoinCacheConfig::default(),
        );

        h.processor.process(customer_event(r#"{"id":"C1"}"#, 0)).await;
        let outcome = h.processor.process(inventory_event(r#"{"id":"C1"}"#, 0)).await;

        assert_eq!(outcome, ProcessingOutcome::DeadLettered);
        assert_eq!(h.sink.attempts(), 5);
        assert_eq!(h.dead_letters.envelopes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_dead_letters_expired_halves() {
        let h = harness(
            RecordingSink::accepting(),
            JoinCacheConfig {
                pending_ttl: Some(Duration::from_secs(60)),
                max_pending_keys: 100,
            },
        );

        h.processor.process(customer_event(r#"{"id":"lonely"}"#, 0)).await;
        assert_eq!(h.processor.reap_orphans().await, 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(h.processor.reap_orphans().await, 1);

        let envelopes = h.dead_letters.envelopes();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].record.correlation_key(), "lonely");
        assert!(matches!(
            envelopes[0].record,
            DeadLetterRecord::OrphanedHalf(_)
        ));
        assert_eq!(h.processor.cache().pending_keys(), 0);
    }

    #[test]
    fn test_decode_failures_and_deliveries_are_counted() {
        let ((), counters) = record_counters(async {
            let h = harness(RecordingSink::accepting(), JoinCacheConfig::default());

            h.processor.process(customer_event("not json", 0)).await;
            h.processor.process(inventory_event("", 0)).await;
            h.processor.process(customer_event(r#"{"id":"C1"}"#, 1)).await;
            h.processor.process(customer_event(r#"{"id":"C1"}"#, 2)).await;
            h.processor.process(inventory_event(r#"{"id":"C1"}"#, 1)).await;
        });

        assert_eq!(counters.get(DECODE_FAILURES), Some(&2));
        assert_eq!(counters.get(MESSAGES_FAILED), Some(&2));
        assert_eq!(counters.get(MESSAGES_PROCESSED), Some(&1));
        assert_eq!(counters.get(DUPLICATE_EVENTS), Some(&1));
    }
}
