//! Record and offset bookkeeping types shared by every subscription flavor.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A single topic partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// An immutable record as read from (or destined for) the broker.
///
/// `partition` and `offset` are populated on consumed records and left unset
/// on freshly built output records (the broker assigns them on append).
/// A `None` value is a tombstone: in compacted and state semantics it deletes
/// the entry for `key` rather than storing a null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: Option<i32>,
    pub offset: Option<i64>,
    pub key: String,
    pub value: Option<Vec<u8>>,
    /// Broker append timestamp, milliseconds since epoch.
    pub timestamp: Option<i64>,
}

impl Record {
    /// Build an output record with a value.
    pub fn new(topic: impl Into<String>, key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            offset: None,
            key: key.into(),
            value: Some(value),
            timestamp: None,
        }
    }

    /// Build a tombstone for `key` (deletes the entry in compacted semantics).
    pub fn tombstone(topic: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            offset: None,
            key: key.into(),
            value: None,
            timestamp: None,
        }
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// The partition this record was read from, if it was consumed.
    pub fn topic_partition(&self) -> Option<TopicPartition> {
        self.partition
            .map(|p| TopicPartition::new(self.topic.clone(), p))
    }
}

/// Per-partition next-offset-to-read positions.
///
/// This is what gets committed to the broker, or attached to a producer
/// transaction. Mutated only by the owning worker; the broker is the only
/// durable home for these positions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetMap {
    positions: HashMap<TopicPartition, i64>,
}

impl OffsetMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the position past a consumed record.
    pub fn observe(&mut self, record: &Record) {
        if let (Some(tp), Some(offset)) = (record.topic_partition(), record.offset) {
            let next = offset + 1;
            let entry = self.positions.entry(tp).or_insert(next);
            if *entry < next {
                *entry = next;
            }
        }
    }

    pub fn set(&mut self, tp: TopicPartition, next_offset: i64) {
        self.positions.insert(tp, next_offset);
    }

    pub fn get(&self, tp: &TopicPartition) -> Option<i64> {
        self.positions.get(tp).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TopicPartition, i64)> {
        self.positions.iter().map(|(tp, next)| (tp, *next))
    }

    /// Positions for every record in `records`.
    pub fn from_records(records: &[Record]) -> Self {
        let mut offsets = Self::new();
        for record in records {
            offsets.observe(record);
        }
        offsets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumed(topic: &str, partition: i32, offset: i64, key: &str) -> Record {
        Record {
            topic: topic.to_string(),
            partition: Some(partition),
            offset: Some(offset),
            key: key.to_string(),
            value: Some(b"v".to_vec()),
            timestamp: None,
        }
    }

    #[test]
    fn tombstone_has_no_value() {
        let record = Record::tombstone("chunks", "X");
        assert!(record.is_tombstone());
        assert_eq!(record.partition, None);
        assert_eq!(record.offset, None);
    }

    #[test]
    fn observe_advances_to_next_offset() {
        let mut offsets = OffsetMap::new();
        offsets.observe(&consumed("chunks", 0, 4, "a"));
        assert_eq!(offsets.get(&TopicPartition::new("chunks", 0)), Some(5));
    }

    #[test]
    fn observe_never_moves_backwards() {
        let mut offsets = OffsetMap::new();
        offsets.observe(&consumed("chunks", 1, 9, "a"));
        offsets.observe(&consumed("chunks", 1, 3, "b"));
        assert_eq!(offsets.get(&TopicPartition::new("chunks", 1)), Some(10));
    }

    #[test]
    fn output_records_do_not_contribute_positions() {
        let offsets = OffsetMap::from_records(&[Record::new("out", "k", b"v".to_vec())]);
        assert!(offsets.is_empty());
    }

    #[test]
    fn from_records_tracks_every_partition() {
        let offsets = OffsetMap::from_records(&[
            consumed("chunks", 0, 0, "a"),
            consumed("chunks", 1, 7, "b"),
            consumed("chunks", 0, 1, "c"),
        ]);
        assert_eq!(offsets.len(), 2);
        assert_eq!(offsets.get(&TopicPartition::new("chunks", 0)), Some(2));
        assert_eq!(offsets.get(&TopicPartition::new("chunks", 1)), Some(8));
    }
}
