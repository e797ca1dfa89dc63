//! Joins the customer and inventory streams into merged analytics records.
//!
//! Every inbound event flows through the same stages: decode, dedup against the shared
//! fingerprint store, offer to the join cache and, once both halves of a key are present,
//! delivery to the analytics sink with a dead-letter fallback. Consumption progress is only
//! committed for contiguous runs of events whose processing has finished.

pub mod config;
pub mod dead_letter;
pub mod dedup;
pub mod delivery;
pub mod error;
pub mod event;
pub mod join_cache;
pub mod kafka;
pub mod metrics_consts;
pub mod processor;
pub mod retry;
pub mod server;
pub mod service;
pub mod sink;
pub mod test_utils;
