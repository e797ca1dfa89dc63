use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use common_kafka::config::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;
use reqwest::Url;

use crate::event::StreamTopics;
use crate::join_cache::JoinCacheConfig;
use crate::kafka::ConsumerSettings;
use crate::retry::RetryPolicy;

const ANALYTICS_PATH: &str = "/analytics/data";

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "9000")]
    pub port: u16,

    // Emit JSON log lines instead of human-readable ones
    #[envconfig(default = "false")]
    pub log_json: bool,

    // Kafka configuration
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(default = "customer_data")]
    pub kafka_customer_topic: String,

    #[envconfig(default = "inventory_data")]
    pub kafka_inventory_topic: String,

    #[envconfig(default = "analytics_dlq")]
    pub kafka_dlq_topic: String,

    // Analytics sink
    #[envconfig(default = "http://localhost:4010")]
    pub analytics_base_url: String,

    #[envconfig(default = "5000")]
    pub request_timeout_ms: u64,

    // Dedup store
    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(default = "100")]
    pub redis_timeout_ms: u64,

    #[envconfig(default = "3600")] // 1 hour
    pub dedup_ttl_secs: u64,

    // Consumer processing configuration
    #[envconfig(default = "100")]
    pub max_in_flight_messages: usize,

    #[envconfig(default = "1000")]
    pub commit_interval_ms: u64,

    #[envconfig(default = "30")] // 30 seconds
    pub shutdown_timeout_secs: u64,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,

    // Join cache eviction
    #[envconfig(default = "3600")] // 0 disables expiry
    pub join_pending_ttl_secs: u64,

    #[envconfig(default = "100000")]
    pub join_max_pending_keys: usize,

    #[envconfig(default = "60")]
    pub join_reap_interval_secs: u64,
}

#[derive(Envconfig, Clone, Debug)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "RETRY_MAX_ATTEMPTS", default = "5")]
    pub max_attempts: u32,

    #[envconfig(from = "RETRY_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "RETRY_INITIAL_INTERVAL_MS", default = "2000")]
    pub initial_interval_ms: u64,

    #[envconfig(from = "RETRY_MAXIMUM_INTERVAL_MS")]
    pub maximum_interval_ms: Option<u64>,
}

impl Config {
    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.retry_policy.max_attempts == 0 {
            bail!("RETRY_MAX_ATTEMPTS must be at least 1");
        }
        if self.retry_policy.backoff_coefficient < 2 {
            bail!("RETRY_BACKOFF_COEFFICIENT must be at least 2 so retry delays keep growing");
        }
        if self.retry_policy.initial_interval_ms == 0 {
            bail!("RETRY_INITIAL_INTERVAL_MS must be positive");
        }
        let policy = self.retry_policy();
        if let Some(maximum_interval) = policy.maximum_interval {
            let last_step = policy.backoff_step(policy.max_attempts.saturating_sub(1));
            if policy.max_attempts > 1 && maximum_interval < last_step {
                bail!(
                    "RETRY_MAXIMUM_INTERVAL_MS must be at least the last backoff step ({}ms)",
                    last_step.as_millis()
                );
            }
        }
        if self.max_in_flight_messages == 0 {
            bail!("MAX_IN_FLIGHT_MESSAGES must be at least 1");
        }
        if self.join_max_pending_keys == 0 {
            bail!("JOIN_MAX_PENDING_KEYS must be at least 1");
        }
        if self.commit_interval_ms == 0 || self.join_reap_interval_secs == 0 {
            bail!("COMMIT_INTERVAL_MS and JOIN_REAP_INTERVAL_SECS must be positive");
        }
        if self.redis_timeout_ms == 0 {
            bail!("REDIS_TIMEOUT_MS must be positive");
        }
        if self.kafka_customer_topic == self.kafka_inventory_topic {
            bail!("customer and inventory topics must differ");
        }
        self.analytics_endpoint()?;
        Ok(())
    }

    pub fn bind_address(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }

    /// `{ANALYTICS_BASE_URL}/analytics/data`, tolerating a trailing slash on the base.
    pub fn analytics_endpoint(&self) -> Result<Url> {
        let endpoint = format!(
            "{}{}",
            self.analytics_base_url.trim_end_matches('/'),
            ANALYTICS_PATH
        );
        Url::parse(&endpoint)
            .with_context(|| format!("invalid ANALYTICS_BASE_URL {}", self.analytics_base_url))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn redis_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_timeout_ms)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn join_reap_interval(&self) -> Duration {
        Duration::from_secs(self.join_reap_interval_secs)
    }

    pub fn topics(&self) -> StreamTopics {
        StreamTopics::new(&self.kafka_customer_topic, &self.kafka_inventory_topic)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let mut builder = RetryPolicy::build(
            self.retry_policy.backoff_coefficient,
            Duration::from_millis(self.retry_policy.initial_interval_ms),
        )
        .max_attempts(self.retry_policy.max_attempts);

        if let Some(maximum_interval_ms) = self.retry_policy.maximum_interval_ms {
            builder = builder.maximum_interval(Duration::from_millis(maximum_interval_ms));
        }

        builder.provide()
    }

    pub fn join_cache_config(&self) -> JoinCacheConfig {
        JoinCacheConfig {
            pending_ttl: (self.join_pending_ttl_secs > 0)
                .then(|| Duration::from_secs(self.join_pending_ttl_secs)),
            max_pending_keys: self.join_max_pending_keys,
        }
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            max_in_flight_messages: self.max_in_flight_messages,
            commit_interval: Duration::from_millis(self.commit_interval_ms),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]);

        assert!(config.validate().is_ok());
        assert_eq!(config.bind_address().unwrap().port(), 9000);
        assert_eq!(config.consumer.kafka_consumer_group, "enterprise-consumer");
        assert_eq!(config.kafka_dlq_topic, "analytics_dlq");
        assert_eq!(
            config.analytics_endpoint().unwrap().as_str(),
            "http://localhost:4010/analytics/data"
        );
        assert_eq!(config.dedup_ttl(), Duration::from_secs(3600));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.join_cache_config(), JoinCacheConfig::default());
        let topics = config.topics();
        assert_eq!(topics.names(), ["customer_data", "inventory_data"]);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("ANALYTICS_BASE_URL", "https://analytics.internal:8443/"),
            ("RETRY_MAX_ATTEMPTS", "3"),
            ("RETRY_MAXIMUM_INTERVAL_MS", "10000"),
            ("JOIN_PENDING_TTL_SECS", "0"),
            ("KAFKA_HOSTS", "kafka:9092"),
            ("KAFKA_CONSUMER_GROUP", "joiner-test"),
        ]);

        assert!(config.validate().is_ok());
        assert_eq!(
            config.analytics_endpoint().unwrap().as_str(),
            "https://analytics.internal:8443/analytics/data"
        );
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.maximum_interval, Some(Duration::from_secs(10)));
        assert_eq!(config.join_cache_config().pending_ttl, None);
        assert_eq!(config.kafka.kafka_hosts, "kafka:9092");
        assert_eq!(config.consumer.kafka_consumer_group, "joiner-test");
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let cases = [
            ("RETRY_MAX_ATTEMPTS", "0"),
            ("RETRY_BACKOFF_COEFFICIENT", "1"),
            ("RETRY_MAXIMUM_INTERVAL_MS", "10000"),
            ("MAX_IN_FLIGHT_MESSAGES", "0"),
            ("JOIN_MAX_PENDING_KEYS", "0"),
            ("ANALYTICS_BASE_URL", "not a url"),
            ("KAFKA_INVENTORY_TOPIC", "customer_data"),
        ];

        for (key, value) in cases {
            assert!(
                config(&[(key, value)]).validate().is_err(),
                "{key}={value} should be rejected"
            );
        }
    }
}
