use metrics::{describe_counter, describe_gauge, Unit};

// ==== Pipeline outcome metrics ====
/// Counter for merged records acknowledged by the analytics sink
pub const MESSAGES_PROCESSED: &str = "messages_processed_total";

/// Counter for events that failed terminally (decode failures and dead-lettered deliveries)
pub const MESSAGES_FAILED: &str = "messages_failed_total";

/// Counter for events read from either input topic (label: side)
pub const MESSAGES_RECEIVED: &str = "messages_received_total";

/// Counter for events skipped because their fingerprint was already recorded
pub const DUPLICATE_EVENTS: &str = "duplicate_events_total";

/// Counter for payloads that could not be decoded (label: side)
pub const DECODE_FAILURES: &str = "decode_failures_total";

// ==== Dedup store metrics ====
/// Counter for dedup decisions taken by the in-process fallback set
pub const DEDUP_STORE_FALLBACKS: &str = "dedup_store_fallbacks_total";

// ==== Delivery metrics ====
pub const DELIVERY_ATTEMPTS: &str = "delivery_attempts_total";
pub const DELIVERY_RETRIES: &str = "delivery_retries_total";

/// Counter for dead-letter envelopes written (label: kind)
pub const DEAD_LETTERS_WRITTEN: &str = "dead_letters_written_total";

/// Counter for dead-letter envelopes that could not be written (label: kind)
pub const DEAD_LETTER_WRITE_FAILURES: &str = "dead_letter_write_failures_total";

// ==== Join cache metrics ====
/// Gauge for correlation keys waiting on their partner half
pub const JOIN_PENDING_KEYS: &str = "join_pending_keys";

/// Counter for halves evicted before a partner arrived (label: reason)
pub const JOIN_ORPHANS_EVICTED: &str = "join_orphans_evicted_total";

// ==== Kafka consumer metrics ====
pub const KAFKA_CONSUMER_IN_FLIGHT_MESSAGES: &str = "kafka_consumer_in_flight_messages";

/// Counter for in-flight handles dropped without being completed
pub const MESSAGES_AUTO_COMPLETED: &str = "kafka_messages_auto_completed_total";

/// Counter for offset commits sent to the broker (label: mode)
pub const OFFSET_COMMITS: &str = "kafka_offset_commits_total";

pub const OFFSET_COMMIT_FAILURES: &str = "kafka_offset_commit_failures_total";

/// Counter for messages from topics we did not subscribe to
pub const MESSAGES_IGNORED: &str = "kafka_messages_ignored_total";

/// Register descriptions with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(
        MESSAGES_PROCESSED,
        Unit::Count,
        "Merged records acknowledged by the analytics sink"
    );
    describe_counter!(
        MESSAGES_FAILED,
        Unit::Count,
        "Events that failed terminally"
    );
    describe_counter!(
        MESSAGES_RECEIVED,
        Unit::Count,
        "Events read from input topics"
    );
    describe_counter!(
        DUPLICATE_EVENTS,
        Unit::Count,
        "Events skipped as duplicates"
    );
    describe_counter!(
        DECODE_FAILURES,
        Unit::Count,
        "Payloads that failed to decode"
    );
    describe_counter!(
        DEDUP_STORE_FALLBACKS,
        Unit::Count,
        "Dedup decisions taken by the local fallback"
    );
    describe_counter!(
        DELIVERY_ATTEMPTS,
        Unit::Count,
        "Requests sent to the analytics sink"
    );
    describe_counter!(DELIVERY_RETRIES, Unit::Count, "Delivery retries scheduled");
    describe_counter!(
        DEAD_LETTERS_WRITTEN,
        Unit::Count,
        "Dead-letter envelopes written"
    );
    describe_counter!(
        DEAD_LETTER_WRITE_FAILURES,
        Unit::Count,
        "Dead-letter envelopes that could not be written"
    );
    describe_gauge!(
        JOIN_PENDING_KEYS,
        Unit::Count,
        "Keys waiting for a partner half"
    );
    describe_counter!(JOIN_ORPHANS_EVICTED, Unit::Count, "Halves evicted unpaired");
    describe_gauge!(
        KAFKA_CONSUMER_IN_FLIGHT_MESSAGES,
        Unit::Count,
        "Messages currently being processed"
    );
    describe_counter!(
        MESSAGES_AUTO_COMPLETED,
        Unit::Count,
        "In-flight handles dropped without completion"
    );
    describe_counter!(OFFSET_COMMITS, Unit::Count, "Offset commits sent");
    describe_counter!(
        OFFSET_COMMIT_FAILURES,
        Unit::Count,
        "Offset commits that failed"
    );
    describe_counter!(
        MESSAGES_IGNORED,
        Unit::Count,
        "Messages ignored by the consumer"
    );
}
