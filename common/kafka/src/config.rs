use envconfig::Envconfig;
use rdkafka::ClientConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32, // Maximum number of messages in the in-memory producer queue

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
}

impl KafkaConfig {
    /// Settings shared by every client we create: brokers, stats and TLS.
    fn base_client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("statistics.interval.ms", "10000");

        if self.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        client_config
    }

    pub fn producer_client_config(&self) -> ClientConfig {
        let mut client_config = self.base_client_config();
        client_config
            .set("linger.ms", self.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                self.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", self.kafka_compression_codec.to_owned())
            .set(
                "queue.buffering.max.kbytes",
                (self.kafka_producer_queue_mib * 1024).to_string(),
            )
            .set(
                "queue.buffering.max.messages",
                self.kafka_producer_queue_messages.to_string(),
            );

        client_config
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    #[envconfig(default = "enterprise-consumer")]
    pub kafka_consumer_group: String,

    // "earliest" so a fresh consumer group joins both streams from the start.
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "45000")]
    pub kafka_session_timeout_ms: u32,
}

impl ConsumerConfig {
    /// Build a client config for a manually committing consumer.
    ///
    /// Both automatic commits and automatic offset storing are disabled: offsets only
    /// advance when the owning service explicitly commits them.
    pub fn client_config(&self, common: &KafkaConfig) -> ClientConfig {
        let mut client_config = common.base_client_config();
        client_config
            .set("group.id", &self.kafka_consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &self.kafka_consumer_offset_reset)
            .set(
                "session.timeout.ms",
                self.kafka_session_timeout_ms.to_string(),
            );

        client_config
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_consumer_config_disables_auto_commit() {
        let common = KafkaConfig::init_from_hashmap(&HashMap::new()).unwrap();
        let consumer = ConsumerConfig::init_from_hashmap(&HashMap::new()).unwrap();

        let client_config = consumer.client_config(&common);

        assert_eq!(client_config.get("enable.auto.commit"), Some("false"));
        assert_eq!(client_config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(client_config.get("group.id"), Some("enterprise-consumer"));
        assert_eq!(client_config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(client_config.get("security.protocol"), None);
    }

    #[test]
    fn test_tls_applies_to_producer() {
        let mut env = HashMap::new();
        env.insert("KAFKA_TLS".to_string(), "true".to_string());
        env.insert("KAFKA_PRODUCER_QUEUE_MIB".to_string(), "2".to_string());
        let common = KafkaConfig::init_from_hashmap(&env).unwrap();

        let client_config = common.producer_client_config();

        assert_eq!(client_config.get("security.protocol"), Some("ssl"));
        assert_eq!(client_config.get("queue.buffering.max.kbytes"), Some("2048"));
    }
}
