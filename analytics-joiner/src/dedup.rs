use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use metrics::counter;
use redis::aio::MultiplexedConnection;
use redis::{AsyncConnectionConfig, RedisError};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::event::InboundEvent;
use crate::metrics_consts::{DEDUP_STORE_FALLBACKS, DUPLICATE_EVENTS};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum DedupStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("dedup store unavailable: {0}")]
    Unavailable(String),
}

/// Shared, expiring record of fingerprints that have already been handled.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    /// Atomically record `fingerprint` unless it is already present.
    ///
    /// Returns `true` when the fingerprint was newly recorded, `false` when it was already there.
    async fn insert_if_absent(
        &self,
        fingerprint: &str,
        ttl: Duration,
    ) -> Result<bool, DedupStoreError>;
}

struct ConnectionState {
    connection: Option<MultiplexedConnection>,
    retry_at: Option<Instant>,
}

/// Fingerprint store backed by Redis `SET NX EX`.
///
/// The connection is established lazily and re-established after I/O failures, with a short
/// backoff so an unreachable Redis costs one failed connect per backoff window.
pub struct RedisFingerprintStore {
    client: redis::Client,
    connection_config: AsyncConnectionConfig,
    state: Mutex<ConnectionState>,
}

impl RedisFingerprintStore {
    pub fn new(url: &str, response_timeout: Duration) -> Result<Self, DedupStoreError> {
        let client = redis::Client::open(url)?;
        let connection_config = AsyncConnectionConfig::new()
            .set_response_timeout(response_timeout)
            .set_connection_timeout(CONNECTION_TIMEOUT);

        Ok(Self {
            client,
            connection_config,
            state: Mutex::new(ConnectionState {
                connection: None,
                retry_at: None,
            }),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, DedupStoreError> {
        let mut state = self.state.lock().await;

        if let Some(connection) = &state.connection {
            return Ok(connection.clone());
        }

        if let Some(retry_at) = state.retry_at {
            if Instant::now() < retry_at {
                return Err(DedupStoreError::Unavailable(
                    "waiting to reconnect".to_string(),
                ));
            }
        }

        match self
            .client
            .get_multiplexed_async_connection_with_config(&self.connection_config)
            .await
        {
            Ok(connection) => {
                debug!("connected to redis dedup store");
                state.connection = Some(connection.clone());
                state.retry_at = None;
                Ok(connection)
            }
            Err(error) => {
                state.retry_at = Some(Instant::now() + RECONNECT_BACKOFF);
                Err(error.into())
            }
        }
    }

    async fn reset_connection(&self) {
        let mut state = self.state.lock().await;
        state.connection = None;
        state.retry_at = Some(Instant::now() + RECONNECT_BACKOFF);
    }
}

#[async_trait]
impl FingerprintStore for RedisFingerprintStore {
    async fn insert_if_absent(
        &self,
        fingerprint: &str,
        ttl: Duration,
    ) -> Result<bool, DedupStoreError> {
        let mut connection = self.connection().await?;

        let result = redis::cmd("SET")
            .arg(fingerprint)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<Option<String>>(&mut connection)
            .await;

        match result {
            Ok(reply) => Ok(reply.is_some()),
            Err(error) => {
                if error.is_io_error() || error.is_timeout() || error.is_connection_dropped() {
                    self.reset_connection().await;
                }
                Err(error.into())
            }
        }
    }
}

/// Hex SHA-256 over the stream side and the raw bytes of the event.
///
/// Identical bytes arriving on different sides produce different fingerprints.
pub fn fingerprint(event: &InboundEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.side.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(&event.raw_payload);
    format!("{:x}", hasher.finalize())
}

/// Decides whether an inbound event has already been handled.
pub struct DedupFilter {
    store: Arc<dyn FingerprintStore>,
    ttl: Duration,
    fallback: DashSet<String>,
}

impl DedupFilter {
    pub fn new(store: Arc<dyn FingerprintStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            fallback: DashSet::new(),
        }
    }

    /// Check and record the event's fingerprint in one step.
    ///
    /// Store failures are never surfaced: the decision falls back to a process-local set
    /// that has no expiry and is not shared with other instances.
    pub async fn is_duplicate(&self, event: &InboundEvent) -> bool {
        let fingerprint = fingerprint(event);

        let duplicate = match self.store.insert_if_absent(&fingerprint, self.ttl).await {
            Ok(inserted) => !inserted,
            Err(error) => {
                warn!(
                    error = %error,
                    "dedup store unavailable, using local fallback"
                );
                counter!(DEDUP_STORE_FALLBACKS).increment(1);
                !self.fallback.insert(fingerprint)
            }
        };

        if duplicate {
            counter!(DUPLICATE_EVENTS, "side" => event.side.as_str()).increment(1);
        }

        duplicate
    }

    pub fn fallback_len(&self) -> usize {
        self.fallback.len()
    }
}
