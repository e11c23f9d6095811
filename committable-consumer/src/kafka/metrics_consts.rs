// ==== Consumer stage metrics ====
/// Counter for records returned by the underlying client
pub const CONSUMER_RECORDS_POLLED: &str = "consumer_stage_records_polled_total";

/// Histogram for the number of records per poll (empty polls included)
pub const CONSUMER_POLL_BATCH_SIZE: &str = "consumer_stage_poll_batch_size";

/// Counter for polls that failed and terminated the stage
pub const CONSUMER_POLL_FAILURES: &str = "consumer_stage_poll_failures_total";

/// Counter for lifecycle transitions, labelled by target state
pub const CONSUMER_STAGE_TRANSITIONS: &str = "consumer_stage_transitions_total";

// ==== Offset commit metrics ====
/// Counter for acknowledgment calls handed to the client
pub const COMMITS_SUBMITTED: &str = "consumer_commits_submitted_total";

/// Counter for acknowledgment outcomes, labelled by status
pub const COMMITS_COMPLETED: &str = "consumer_commits_completed_total";

/// Counter for commits rejected because the stage was already shut down
pub const COMMITS_REJECTED_AFTER_SHUTDOWN: &str = "consumer_commits_rejected_after_shutdown_total";

/// Gauge for acknowledgment calls that have not reported back yet
pub const COMMITS_IN_FLIGHT: &str = "consumer_commits_in_flight";

/// Histogram for partitions included in a single acknowledgment call
pub const COMMIT_PARTITION_COUNT: &str = "consumer_commit_partition_count";

// ==== Kafka client metrics ====
/// Counter for errors reported by librdkafka, labelled by level and error kind
pub const KAFKA_CLIENT_ERROR: &str = "consumer_kafka_client_error_total";
