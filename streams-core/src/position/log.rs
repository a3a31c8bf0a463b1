use std::cmp::Ordering;

use super::{MergePolicy, Origin, Position};

/// Offset reached in one partition of one stream, together with who reported it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    /// name of the stream (topic).
    pub stream: String,
    /// partition index within the stream.
    pub partition: i32,
    /// offset of the last message consumed in the partition.
    pub offset: i64,
    /// who reported this offset.
    pub origin: Origin,
}

impl PartitionOffset {
    pub fn new(stream: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            stream: stream.into(),
            partition,
            offset,
            origin: Origin::Source,
        }
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    fn is_key(&self, stream: &str, partition: i32) -> bool {
        self.partition == partition && self.stream == stream
    }

    /// Picks between `self` (incoming) and `base` for the same key.
    fn reconcile(&self, base: &PartitionOffset, policy: MergePolicy) -> PartitionOffset {
        match self.origin.cmp(&base.origin) {
            Ordering::Greater => self.clone(),
            Ordering::Less => base.clone(),
            Ordering::Equal if policy.pick(self.offset, base.offset) == self.offset => self.clone(),
            Ordering::Equal => base.clone(),
        }
    }
}

/// Position of a consumer over partitioned logs. Holds at most one entry per
/// `(stream, partition)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogPosition {
    entries: Vec<PartitionOffset>,
}

impl LogPosition {
    /// Builds a Position from entries. A repeated key keeps its first slot and takes the value of
    /// the last occurrence.
    pub fn new(entries: impl IntoIterator<Item = PartitionOffset>) -> Self {
        let mut position = LogPosition::default();
        for entry in entries {
            match position
                .entries
                .iter_mut()
                .find(|e| e.is_key(&entry.stream, entry.partition))
            {
                Some(existing) => *existing = entry,
                None => position.entries.push(entry),
            }
        }
        position
    }

    pub fn single(stream: impl Into<String>, partition: i32, offset: i64, origin: Origin) -> Self {
        Self {
            entries: vec![PartitionOffset::new(stream, partition, offset).with_origin(origin)],
        }
    }

    pub fn entries(&self) -> &[PartitionOffset] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, stream: &str, partition: i32) -> Option<&PartitionOffset> {
        self.entries.iter().find(|e| e.is_key(stream, partition))
    }

    /// Keeps only the entries of the given streams. Sources use it to drop partitions they do not
    /// own before acknowledging.
    pub fn filter_streams<S: AsRef<str>>(&self, streams: &[S]) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|e| streams.iter().any(|s| s.as_ref() == e.stream))
                .cloned()
                .collect(),
        }
    }
}

impl FromIterator<PartitionOffset> for LogPosition {
    fn from_iter<T: IntoIterator<Item = PartitionOffset>>(iter: T) -> Self {
        LogPosition::new(iter)
    }
}

impl IntoIterator for LogPosition {
    type Item = PartitionOffset;
    type IntoIter = std::vec::IntoIter<PartitionOffset>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl Position for LogPosition {
    fn merge(&self, base: Option<&Self>, policy: MergePolicy) -> Self {
        let Some(base) = base else {
            return self.clone();
        };

        let mut entries: Vec<PartitionOffset> = base
            .entries
            .iter()
            .filter(|e| self.get(&e.stream, e.partition).is_none())
            .cloned()
            .collect();

        // keys of self are unique, so every incoming entry lands in its own slot
        entries.extend(self.entries.iter().map(|incoming| {
            match base.get(&incoming.stream, incoming.partition) {
                Some(old) => incoming.reconcile(old, policy),
                None => incoming.clone(),
            }
        }));

        LogPosition { entries }
    }

    fn with_origin(mut self, origin: Origin) -> Self {
        for entry in self.entries.iter_mut() {
            entry.origin = origin;
        }
        self
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
