use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::counter;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::BorrowedMessage;
use rdkafka::{ClientConfig, Message};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};

use crate::event::{InboundEvent, StreamTopics};
use crate::kafka::context::{offsets_to_list, JoinConsumerContext};
use crate::kafka::tracker::InFlightTracker;
use crate::kafka::types::Partition;
use crate::metrics_consts::{
    MESSAGES_IGNORED, MESSAGES_RECEIVED, OFFSET_COMMITS, OFFSET_COMMIT_FAILURES,
};
use crate::processor::JoinProcessor;

const METADATA_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub max_in_flight_messages: usize,
    pub commit_interval: Duration,
    pub shutdown_timeout: Duration,
}

/// Reads both input topics and runs each message through the processor on its own task.
///
/// Offsets are only committed up to the contiguous prefix of messages whose processing has
/// terminated, on a periodic tick, on revocation and once more on shutdown.
pub struct JoinConsumer {
    consumer: StreamConsumer<JoinConsumerContext>,
    topics: StreamTopics,
    processor: Arc<JoinProcessor>,
    tracker: Arc<InFlightTracker>,
    settings: ConsumerSettings,
}

impl JoinConsumer {
    pub fn new(
        client_config: &ClientConfig,
        topics: StreamTopics,
        processor: Arc<JoinProcessor>,
        settings: ConsumerSettings,
    ) -> Result<Self> {
        let tracker = Arc::new(InFlightTracker::with_capacity(
            settings.max_in_flight_messages,
        ));
        let context = JoinConsumerContext::new(tracker.clone());

        let consumer: StreamConsumer<JoinConsumerContext> = client_config
            .create_with_context(context)
            .context("Failed to create Kafka consumer")?;

        let metadata = consumer
            .fetch_metadata(None, METADATA_TIMEOUT)
            .context("Failed to fetch metadata from Kafka brokers")?;
        info!(
            "Successfully connected to Kafka brokers. Found {} topics.",
            metadata.topics().len()
        );

        consumer
            .subscribe(&topics.names())
            .context("Failed to subscribe to input topics")?;
        info!(
            customer_topic = %topics.customer,
            inventory_topic = %topics.inventory,
            "Subscribed to input topics"
        );

        Ok(Self {
            consumer,
            topics,
            processor,
            tracker,
            settings,
        })
    }

    pub fn tracker(&self) -> Arc<InFlightTracker> {
        self.tracker.clone()
    }

    /// Consume until `shutdown` resolves, then drain in-flight work and commit one final time.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Starting join consumer");

        let mut shutdown = std::pin::pin!(shutdown);
        let mut commit_tick = tokio::time::interval(self.settings.commit_interval);
        commit_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let permit = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = commit_tick.tick() => {
                    self.commit_offsets(CommitMode::Async);
                    continue;
                }
                permit = self.tracker.acquire() => permit.context("in-flight semaphore closed")?,
            };

            let message = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = commit_tick.tick() => {
                    self.commit_offsets(CommitMode::Async);
                    continue;
                }
                message = self.consumer.recv() => message,
            };

            match message {
                Ok(message) => self.dispatch(&message, permit),
                Err(e) => {
                    error!("Error receiving message: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        info!(
            in_flight = self.tracker.in_flight_count(),
            "Shutdown signal received, draining in-flight messages"
        );
        if !self
            .tracker
            .wait_until_idle(self.settings.shutdown_timeout)
            .await
        {
            warn!(
                in_flight = self.tracker.in_flight_count(),
                "Shutdown timeout reached with messages still in flight"
            );
        }

        match self.commit_offsets(CommitMode::Sync) {
            Some(Ok(())) => info!("Final offsets committed successfully"),
            Some(Err(e)) => error!("Failed to commit final offsets: {}", e),
            None => info!("No offsets left to commit"),
        }

        info!("Join consumer stopped");
        Ok(())
    }

    fn dispatch(&self, message: &BorrowedMessage<'_>, permit: OwnedSemaphorePermit) {
        let topic = message.topic();
        let Some(side) = self.topics.side_for(topic) else {
            warn!(topic, "Ignoring message from unexpected topic");
            counter!(MESSAGES_IGNORED).increment(1);
            return;
        };

        let event = InboundEvent::new(
            side,
            message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            message.partition(),
            message.offset(),
        );
        counter!(MESSAGES_RECEIVED, "side" => side.as_str()).increment(1);
        debug!(
            topic,
            partition = event.partition,
            offset = event.offset,
            "Dispatching message"
        );

        let handle = self.tracker.track(
            Partition::new(topic, event.partition),
            event.offset,
            permit,
        );
        let processor = self.processor.clone();
        tokio::spawn(async move {
            processor.process(event).await;
            handle.complete();
        });
    }

    /// Commit everything that became safe since the last commit. `None` when there was nothing.
    fn commit_offsets(&self, mode: CommitMode) -> Option<Result<(), KafkaError>> {
        let offsets = self.tracker.committable_offsets();
        if offsets.is_empty() {
            debug!("No safe offsets to commit");
            return None;
        }

        let (mode_label, sync) = match mode {
            CommitMode::Sync => ("sync", true),
            CommitMode::Async => ("async", false),
        };

        let result =
            offsets_to_list(&offsets).and_then(|list| self.consumer.commit(&list, mode));

        match &result {
            Ok(()) => {
                counter!(OFFSET_COMMITS, "mode" => mode_label).increment(1);
                // Async acknowledgements arrive through the context's commit callback.
                if sync {
                    for offset in &offsets {
                        self.tracker.mark_committed(offset.partition(), offset.offset());
                    }
                }
                debug!(partitions = offsets.len(), "Committed safe offsets");
            }
            Err(e) => {
                counter!(OFFSET_COMMIT_FAILURES, "mode" => mode_label).increment(1);
                error!("Failed to commit safe offsets: {}", e);
            }
        }

        Some(result)
    }
}
