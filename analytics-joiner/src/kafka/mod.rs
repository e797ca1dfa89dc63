// Kafka module - concurrent consumption with contiguous-prefix commits
pub mod consumer;
pub mod context;
pub mod tracker;
pub mod types;

pub use consumer::{ConsumerSettings, JoinConsumer};
pub use tracker::{InFlightMessage, InFlightTracker};
pub use types::{Partition, PartitionOffset};
