use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

use crate::kafka::types::{Partition, PartitionOffset};
use crate::metrics_consts::{KAFKA_CONSUMER_IN_FLIGHT_MESSAGES, MESSAGES_AUTO_COMPLETED};

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct PartitionProgress {
    in_flight: BTreeSet<i64>,
    /// Completed offsets above the processed watermark.
    completed: BTreeSet<i64>,
    /// Highest offset such that it and everything tracked before it has terminated.
    processed: Option<i64>,
    /// Next offset to read, as last acknowledged by the broker.
    committed: Option<i64>,
}

impl PartitionProgress {
    fn advance(&mut self) {
        let candidate = match self.in_flight.first() {
            Some(lowest_in_flight) => self.completed.range(..*lowest_in_flight).next_back(),
            None => self.completed.last(),
        }
        .copied();

        if let Some(offset) = candidate {
            self.completed = self.completed.split_off(&(offset + 1));
            self.processed = Some(self.processed.map_or(offset, |p| p.max(offset)));
        }
    }

    fn pending_commit(&mut self) -> Option<i64> {
        self.advance();
        let next = self.processed? + 1;
        match self.committed {
            Some(committed) if committed >= next => None,
            _ => Some(next),
        }
    }
}

/// Tracks which offsets are being processed, per partition, and which are safe to commit.
///
/// The committable position of a partition only ever covers a contiguous prefix of terminated
/// messages: an offset still in flight blocks every offset after it.
pub struct InFlightTracker {
    partitions: Mutex<HashMap<Partition, PartitionProgress>>,
    semaphore: Arc<Semaphore>,
}

impl InFlightTracker {
    pub fn with_capacity(max_in_flight: usize) -> Self {
        Self {
            partitions: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
        }
    }

    fn partitions(&self) -> MutexGuard<'_, HashMap<Partition, PartitionProgress>> {
        // A panic while holding the lock leaves the sets consistent; keep going.
        self.partitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for a free processing slot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.semaphore.clone().acquire_owned().await
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Start tracking a message. The returned handle holds `permit` until it completes.
    pub fn track(
        self: &Arc<Self>,
        partition: Partition,
        offset: i64,
        permit: OwnedSemaphorePermit,
    ) -> InFlightMessage {
        {
            let mut partitions = self.partitions();
            let progress = partitions.entry(partition.clone()).or_default();
            if !progress.in_flight.insert(offset) {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset,
                    "offset tracked twice"
                );
            }
        }
        self.publish_in_flight();

        InFlightMessage {
            tracker: self.clone(),
            partition,
            offset,
            completed: false,
            _permit: permit,
        }
    }

    fn complete(&self, partition: &Partition, offset: i64) {
        {
            let mut partitions = self.partitions();
            // Partitions forgotten on revocation ignore late completions.
            if let Some(progress) = partitions.get_mut(partition) {
                if progress.in_flight.remove(&offset) {
                    progress.completed.insert(offset);
                }
            }
        }
        self.publish_in_flight();
    }

    fn publish_in_flight(&self) {
        gauge!(KAFKA_CONSUMER_IN_FLIGHT_MESSAGES).set(self.in_flight_count() as f64);
    }

    pub fn in_flight_count(&self) -> usize {
        self.partitions()
            .values()
            .map(|progress| progress.in_flight.len())
            .sum()
    }

    /// Offsets (next offset to read) that can be committed and have not been acknowledged yet.
    pub fn committable_offsets(&self) -> Vec<PartitionOffset> {
        let mut partitions = self.partitions();
        let mut offsets: Vec<_> = partitions
            .iter_mut()
            .filter_map(|(partition, progress)| {
                progress
                    .pending_commit()
                    .map(|next| PartitionOffset::new(partition.clone(), next))
            })
            .collect();
        offsets.sort_by(|a, b| a.partition().cmp(b.partition()));
        offsets
    }

    /// Like `committable_offsets`, restricted to `only`.
    pub fn committable_offsets_for(&self, only: &[Partition]) -> Vec<PartitionOffset> {
        let mut partitions = self.partitions();
        only.iter()
            .filter_map(|partition| {
                partitions
                    .get_mut(partition)
                    .and_then(|progress| progress.pending_commit())
                    .map(|next| PartitionOffset::new(partition.clone(), next))
            })
            .collect()
    }

    /// Record that the broker acknowledged `next_offset` for `partition`.
    pub fn mark_committed(&self, partition: &Partition, next_offset: i64) {
        let mut partitions = self.partitions();
        if let Some(progress) = partitions.get_mut(partition) {
            let committed = progress.committed.map_or(next_offset, |c| c.max(next_offset));
            progress.committed = Some(committed);
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = committed,
                "offset committed"
            );
        }
    }

    pub fn committed_offset(&self, partition: &Partition) -> Option<i64> {
        self.partitions()
            .get(partition)
            .and_then(|progress| progress.committed)
    }

    /// Stop tracking partitions that were revoked from this consumer.
    pub fn forget_partitions(&self, revoked: &[Partition]) {
        {
            let mut partitions = self.partitions();
            for partition in revoked {
                if let Some(progress) = partitions.remove(partition) {
                    if !progress.in_flight.is_empty() {
                        debug!(
                            topic = partition.topic(),
                            partition = partition.partition_number(),
                            in_flight = progress.in_flight.len(),
                            "forgetting partition with messages still in flight"
                        );
                    }
                }
            }
        }
        self.publish_in_flight();
    }

    /// Wait until every tracked message has terminated. Returns `false` on timeout.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let wait = async {
            while self.in_flight_count() > 0 {
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

/// Handle for a message being processed.
///
/// Completing it (explicitly or by dropping it) lets the commit point move past its offset and
/// releases its processing slot.
pub struct InFlightMessage {
    tracker: Arc<InFlightTracker>,
    partition: Partition,
    offset: i64,
    completed: bool,
    _permit: OwnedSemaphorePermit,
}

impl InFlightMessage {
    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn complete(mut self) {
        self.tracker.complete(&self.partition, self.offset);
        self.completed = true;
    }
}

impl Drop for InFlightMessage {
    fn drop(&mut self) {
        if !self.completed {
            error!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                offset = self.offset,
                "in-flight message dropped without completion, completing it now"
            );
            counter!(MESSAGES_AUTO_COMPLETED).increment(1);
            self.tracker.complete(&self.partition, self.offset);
        }
    }
}
