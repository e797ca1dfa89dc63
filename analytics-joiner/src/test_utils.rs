//! In-memory fakes for the pipeline's external collaborators.
//!
//! Used by unit tests and by the integration tests under `tests/`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::kafka_producer::KafkaProduceError;
use tokio::time::Instant;

use crate::dead_letter::{DeadLetterEnvelope, DeadLetterError, DeadLetterSink};
use crate::dedup::{DedupStoreError, FingerprintStore};
use crate::error::SinkError;
use crate::event::{InboundEvent, MergedRecord, StreamSide};
use crate::sink::AnalyticsSink;

/// Fingerprint store with per-entry expiry measured on the tokio clock.
#[derive(Default)]
pub struct MemoryFingerprintStore {
    entries: Mutex<HashMap<String, Instant>>,
}

impl MemoryFingerprintStore {
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FingerprintStore for MemoryFingerprintStore {
    async fn insert_if_absent(
        &self,
        fingerprint: &str,
        ttl: Duration,
    ) -> Result<bool, DedupStoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();

        match entries.get(fingerprint) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                entries.insert(fingerprint.to_string(), now + ttl);
                Ok(true)
            }
        }
    }
}

/// Fingerprint store that always fails, as if Redis were down.
pub struct UnreachableFingerprintStore;

#[async_trait]
impl FingerprintStore for UnreachableFingerprintStore {
    async fn insert_if_absent(
        &self,
        _fingerprint: &str,
        _ttl: Duration,
    ) -> Result<bool, DedupStoreError> {
        Err(DedupStoreError::Unavailable("connection refused".to_string()))
    }
}

/// Sink that replays scripted results and remembers when each attempt happened.
pub struct RecordingSink {
    script: Mutex<VecDeque<Result<(), SinkError>>>,
    otherwise: Result<(), SinkError>,
    attempts: Mutex<Vec<(Instant, MergedRecord)>>,
}

impl RecordingSink {
    /// Accepts every record.
    pub fn accepting() -> Self {
        Self::with_script(Vec::new(), Ok(()))
    }

    /// Fails every attempt with `error`.
    pub fn failing(error: SinkError) -> Self {
        Self::with_script(Vec::new(), Err(error))
    }

    /// Returns the scripted results in order, then `otherwise` forever.
    pub fn with_script(
        script: Vec<Result<(), SinkError>>,
        otherwise: Result<(), SinkError>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            otherwise,
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn attempt_instants(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    pub fn records(&self) -> Vec<MergedRecord> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, record)| record.clone())
            .collect()
    }
}

#[async_trait]
impl AnalyticsSink for RecordingSink {
    async fn send(&self, record: &MergedRecord) -> Result<(), SinkError> {
        self.attempts
            .lock()
            .unwrap()
            .push((Instant::now(), record.clone()));

        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.otherwise.clone())
    }
}

/// Dead-letter channel that keeps envelopes in memory, or rejects them all.
#[derive(Default)]
pub struct RecordingDeadLetters {
    envelopes: Mutex<Vec<DeadLetterEnvelope>>,
    fail: bool,
}

impl RecordingDeadLetters {
    pub fn failing() -> Self {
        Self {
            envelopes: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn envelopes(&self) -> Vec<DeadLetterEnvelope> {
        self.envelopes.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for RecordingDeadLetters {
    async fn write(&self, envelope: &DeadLetterEnvelope) -> Result<(), DeadLetterError> {
        if self.fail {
            return Err(KafkaProduceError::KafkaProduceCanceled.into());
        }
        self.envelopes.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

pub fn customer_event(payload: &str, offset: i64) -> InboundEvent {
    InboundEvent::new(StreamSide::Customer, payload.as_bytes().to_vec(), 0, offset)
}

pub fn inventory_event(payload: &str, offset: i64) -> InboundEvent {
    InboundEvent::new(StreamSide::Inventory, payload.as_bytes().to_vec(), 0, offset)
}

/// Run `future` on a paused current-thread runtime with a thread-local debugging recorder and
/// return its output with every counter total, summed across labels.
#[cfg(test)]
pub(crate) fn record_counters<F: std::future::Future>(
    future: F,
) -> (F::Output, HashMap<String, u64>) {
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let output = metrics::with_local_recorder(&recorder, || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
            .block_on(future)
    });

    let mut counters = HashMap::new();
    for (key, _, _, value) in snapshotter.snapshot().into_vec() {
        if let DebugValue::Counter(count) = value {
            *counters.entry(key.key().name().to_string()).or_insert(0) += count;
        }
    }
    (output, counters)
}
