use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use common_kafka::kafka_producer::create_kafka_producer;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::dead_letter::KafkaDeadLetterProducer;
use crate::dedup::{DedupFilter, RedisFingerprintStore};
use crate::delivery::DeliveryPipeline;
use crate::join_cache::JoinCache;
use crate::kafka::JoinConsumer;
use crate::processor::JoinProcessor;
use crate::sink::HttpSink;

/// Wires the dedup store, join cache, sink, dead-letter producer and consumer together.
pub struct JoinService {
    consumer: JoinConsumer,
    processor: Arc<JoinProcessor>,
    reap_interval: Duration,
    shutdown_timeout: Duration,
}

impl JoinService {
    pub async fn new(config: Config) -> Result<Self> {
        config.validate().with_context(|| {
            format!(
                "Configuration validation failed for consumer group '{}'",
                config.consumer.kafka_consumer_group
            )
        })?;

        let store = RedisFingerprintStore::new(&config.redis_url, config.redis_timeout())
            .with_context(|| format!("Invalid REDIS_URL '{}'", config.redis_url))?;
        let dedup = DedupFilter::new(Arc::new(store), config.dedup_ttl());

        let endpoint = config.analytics_endpoint()?;
        let sink = HttpSink::new(endpoint.clone(), config.request_timeout())
            .context("Failed to build analytics HTTP client")?;
        info!(endpoint = %endpoint, "Delivering merged records");

        let producer = create_kafka_producer(&config.kafka)
            .await
            .context("Failed to create dead-letter Kafka producer")?;
        let dead_letters = KafkaDeadLetterProducer::new(producer, &config.kafka_dlq_topic);

        let delivery = DeliveryPipeline::new(
            Arc::new(sink),
            Arc::new(dead_letters),
            config.retry_policy(),
        );
        let processor = Arc::new(JoinProcessor::new(
            Arc::new(dedup),
            Arc::new(JoinCache::new(config.join_cache_config())),
            Arc::new(delivery),
        ));

        let consumer = JoinConsumer::new(
            &config.consumer.client_config(&config.kafka),
            config.topics(),
            processor.clone(),
            config.consumer_settings(),
        )
        .with_context(|| {
            format!(
                "Failed to start consuming '{}' and '{}' as group '{}'",
                config.kafka_customer_topic,
                config.kafka_inventory_topic,
                config.consumer.kafka_consumer_group
            )
        })?;

        Ok(Self {
            consumer,
            processor,
            reap_interval: config.join_reap_interval(),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
        })
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(shutdown_signal()).await
    }

    /// Run the service with a custom shutdown signal (useful for testing)
    pub async fn run_with_shutdown(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!("Starting analytics joiner service");

        let (stop_tx, stop_rx) = watch::channel(false);
        let reaper = spawn_reaper(self.processor.clone(), self.reap_interval, stop_rx.clone());

        let mut consumer_stop = stop_rx;
        let consumer = self.consumer;
        let consumer_handle = tokio::spawn(async move {
            consumer
                .run(async move {
                    // The sender lives until the service returns.
                    consumer_stop.wait_for(|stop| *stop).await.ok();
                })
                .await
        });

        shutdown.await;
        info!("Received shutdown signal, shutting down gracefully...");
        stop_tx.send_replace(true);

        // The consumer drains for up to shutdown_timeout itself, plus the final commit.
        let grace = self.shutdown_timeout + Duration::from_secs(5);
        match tokio::time::timeout(grace, consumer_handle).await {
            Ok(Ok(Ok(()))) => info!("Consumer stopped normally"),
            Ok(Ok(Err(e))) => error!("Consumer stopped with error: {e:#}"),
            Ok(Err(e)) => error!("Consumer task panicked: {e:#}"),
            Err(_) => error!("Consumer shutdown timed out after {:?}", grace),
        }

        if let Err(e) = reaper.await {
            error!("Join cache reaper panicked: {e:#}");
        }

        info!(
            pending_keys = self.processor.cache().pending_keys(),
            "Analytics joiner stopped"
        );
        Ok(())
    }
}

fn spawn_reaper(
    processor: Arc<JoinProcessor>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        // The first tick completes immediately.
        tick.tick().await;

        loop {
            tokio::select! {
                _ = async { stop.wait_for(|stop| *stop).await.map(|_| ()) } => break,
                _ = tick.tick() => {
                    let reaped = processor.reap_orphans().await;
                    if reaped > 0 {
                        info!(reaped, "Dead-lettered unpaired halves");
                    }
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl+c signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join_cache::JoinCacheConfig;
    use crate::retry::RetryPolicy;
    use crate::test_utils::{
        customer_event, MemoryFingerprintStore, RecordingDeadLetters, RecordingSink,
    };

    #[tokio::test(start_paused = true)]
    async fn test_reaper_dead_letters_expired_halves_until_stopped() {
        let dead_letters = Arc::new(RecordingDeadLetters::default());
        let processor = Arc::new(JoinProcessor::new(
            Arc::new(DedupFilter::new(
                Arc::new(MemoryFingerprintStore::default()),
                Duration::from_secs(3600),
            )),
            Arc::new(JoinCache::new(JoinCacheConfig {
                pending_ttl: Some(Duration::from_secs(60)),
                max_pending_keys: 10,
            })),
            Arc::new(DeliveryPipeline::new(
                Arc::new(RecordingSink::accepting()),
                dead_letters.clone(),
                RetryPolicy::default(),
            )),
        ));
        processor.process(customer_event(r#"{"id":"C1"}"#, 0)).await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let reaper = spawn_reaper(processor.clone(), Duration::from_secs(30), stop_rx);

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(dead_letters.envelopes().len(), 1);
        assert_eq!(processor.cache().pending_keys(), 0);

        stop_tx.send_replace(true);
        reaper.await.unwrap();
    }
}
