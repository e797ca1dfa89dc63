pub mod config;
pub mod kafka_producer;
pub mod test;
