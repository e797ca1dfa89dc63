use std::sync::Arc;

use metrics::counter;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::kafka::tracker::InFlightTracker;
use crate::kafka::types::{Partition, PartitionOffset};
use crate::metrics_consts::{OFFSET_COMMITS, OFFSET_COMMIT_FAILURES};

pub fn offsets_to_list(offsets: &[PartitionOffset]) -> KafkaResult<TopicPartitionList> {
    let mut topic_partition_list = TopicPartitionList::new();
    for offset in offsets {
        topic_partition_list.add_partition_offset(
            offset.topic(),
            offset.partition_number(),
            Offset::Offset(offset.offset()),
        )?;
    }
    Ok(topic_partition_list)
}

/// Consumer context that commits the safe prefix of revoked partitions before giving them up.
pub struct JoinConsumerContext {
    tracker: Arc<InFlightTracker>,
}

impl JoinConsumerContext {
    pub fn new(tracker: Arc<InFlightTracker>) -> Self {
        Self { tracker }
    }

    fn commit_revoked(&self, base_consumer: &BaseConsumer<Self>, revoked: &[Partition]) {
        let offsets = self.tracker.committable_offsets_for(revoked);
        if offsets.is_empty() {
            return;
        }

        let result = offsets_to_list(&offsets)
            .and_then(|list| base_consumer.commit(&list, CommitMode::Sync));

        match result {
            Ok(()) => {
                counter!(OFFSET_COMMITS, "mode" => "revoke").increment(1);
                for offset in &offsets {
                    self.tracker.mark_committed(offset.partition(), offset.offset());
                }
                info!(partitions = offsets.len(), "committed offsets for revoked partitions");
            }
            Err(e) => {
                counter!(OFFSET_COMMIT_FAILURES, "mode" => "revoke").increment(1);
                error!("Failed to commit offsets for revoked partitions: {}", e);
            }
        }
    }
}

impl ClientContext for JoinConsumerContext {}

impl ConsumerContext for JoinConsumerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    debug!("Empty revocation, nothing to do");
                    return;
                }

                let revoked: Vec<Partition> =
                    partitions.elements().into_iter().map(Partition::from).collect();
                info!(count = revoked.len(), "Partitions revoked: {:?}", revoked);

                self.commit_revoked(base_consumer, &revoked);
                self.tracker.forget_partitions(&revoked);
            }
            Rebalance::Assign(partitions) => {
                info!(count = partitions.count(), "Partitions being assigned");
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            let assigned: Vec<Partition> =
                partitions.elements().into_iter().map(Partition::from).collect();
            info!(count = assigned.len(), "Partitions assigned: {:?}", assigned);
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => {
                for elem in offsets.elements() {
                    if let Offset::Offset(next) = elem.offset() {
                        self.tracker.mark_committed(&Partition::from(elem), next);
                    }
                }
            }
            Err(e) => {
                counter!(OFFSET_COMMIT_FAILURES, "mode" => "callback").increment(1);
                warn!("Offset commit reported failure: {}", e);
            }
        }
    }
}
