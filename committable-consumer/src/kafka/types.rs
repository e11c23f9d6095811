use rdkafka::message::{BorrowedMessage, Message};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

/// Position of a message: which client read it, from where, and at what offset.
///
/// Two offsets refer to the same partition iff client id, topic and partition
/// number all match. Offsets from different clients are never compared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionOffset {
    client_id: String,
    partition: Partition,
    offset: i64,
}

impl PartitionOffset {
    pub fn new(client_id: String, partition: Partition, offset: i64) -> Self {
        Self {
            client_id,
            partition,
            offset,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn is_same_partition(&self, other: &PartitionOffset) -> bool {
        self.client_id == other.client_id && self.partition == other.partition
    }
}

/// A record as handed out by the underlying client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    partition: Partition,
    offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    /// Broker or producer timestamp in milliseconds since the epoch, if known
    pub timestamp_ms: Option<i64>,
}

impl ConsumerRecord {
    pub fn new(
        partition: Partition,
        offset: i64,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
    ) -> Self {
        Self {
            partition,
            offset,
            key,
            payload,
            timestamp_ms: None,
        }
    }

    pub fn with_timestamp_ms(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map(Vec::len).unwrap_or(0)
    }
}

impl From<&BorrowedMessage<'_>> for ConsumerRecord {
    fn from(msg: &BorrowedMessage<'_>) -> Self {
        Self {
            partition: Partition::new(msg.topic().to_owned(), msg.partition()),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            payload: msg.payload().map(|p| p.to_vec()),
            timestamp_ms: msg.timestamp().to_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset(client_id: &str, topic: &str, partition: i32, offset: i64) -> PartitionOffset {
        PartitionOffset::new(
            client_id.to_string(),
            Partition::new(topic.to_string(), partition),
            offset,
        )
    }

    #[test]
    fn test_same_partition_requires_matching_client() {
        let a = offset("c1", "events", 0, 10);
        assert!(a.is_same_partition(&offset("c1", "events", 0, 99)));
        assert!(!a.is_same_partition(&offset("c2", "events", 0, 10)));
        assert!(!a.is_same_partition(&offset("c1", "events", 1, 10)));
        assert!(!a.is_same_partition(&offset("c1", "other", 0, 10)));
    }

    #[test]
    fn test_record_accessors() {
        let record = ConsumerRecord::new(
            Partition::new("events".to_string(), 3),
            42,
            Some(b"k".to_vec()),
            Some(b"value".to_vec()),
        )
        .with_timestamp_ms(1_700_000_000_000);

        assert_eq!(record.topic(), "events");
        assert_eq!(record.partition_number(), 3);
        assert_eq!(record.offset(), 42);
        assert_eq!(record.key(), Some(&b"k"[..]));
        assert_eq!(record.payload(), Some(&b"value"[..]));
        assert_eq!(record.payload_len(), 5);
        assert_eq!(record.timestamp_ms, Some(1_700_000_000_000));
    }
}
