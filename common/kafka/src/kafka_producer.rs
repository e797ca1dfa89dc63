use std::time::Duration;

use metrics::gauge;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientContext;
use serde::Serialize;
use serde_json::error::Error as SerdeError;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;

const METADATA_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Default)]
pub struct KafkaContext;

impl ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("kafka_callback_queue_depth").set(stats.replyq as f64);
    }
}

/// Create a producer and verify we can reach the brokers.
///
/// Failing to fetch metadata is returned as an error: callers treat it as fatal at startup.
pub async fn create_kafka_producer(
    config: &KafkaConfig,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let client_config = config.producer_client_config();

    debug!("rdkafka configuration: {:?}", client_config);
    let api: FutureProducer<KafkaContext> = client_config.create_with_context(KafkaContext)?;

    // "Ping" the Kafka brokers by requesting metadata
    match api.client().fetch_metadata(None, METADATA_TIMEOUT) {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to serialize: {error}")]
    SerializationError { error: SerdeError },
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("failed to produce to kafka (timeout)")]
    KafkaProduceCanceled,
}

/// Serialize `item` as JSON and produce it to `topic`, waiting for the broker acknowledgement.
pub async fn send_keyed_json<T, C>(
    kafka_producer: &FutureProducer<C>,
    topic: &str,
    key: Option<&str>,
    item: &T,
) -> Result<(), KafkaProduceError>
where
    T: Serialize,
    C: ClientContext + 'static,
{
    let payload = serde_json::to_string(item)
        .map_err(|error| KafkaProduceError::SerializationError { error })?;

    let record = FutureRecord {
        topic,
        key,
        payload: Some(&payload),
        timestamp: None,
        partition: None,
        headers: None,
    };

    let delivery = kafka_producer
        .send_result(record)
        .map_err(|(error, _)| KafkaProduceError::KafkaProduceError { error })?;

    match delivery.await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err((error, _))) => Err(KafkaProduceError::KafkaProduceError { error }),
        Err(_) => Err(KafkaProduceError::KafkaProduceCanceled),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test::create_mock_kafka;

    #[tokio::test]
    async fn test_send_keyed_json_to_mock_cluster() {
        let (cluster, producer) = create_mock_kafka().await;
        cluster
            .create_topic("analytics_dlq", 1, 1)
            .expect("failed to create mock topic");

        let result = send_keyed_json(
            &producer,
            "analytics_dlq",
            Some("C1"),
            &json!({"id": "C1", "error": "boom"}),
        )
        .await;

        assert!(result.is_ok(), "produce failed: {result:?}");
    }
}
