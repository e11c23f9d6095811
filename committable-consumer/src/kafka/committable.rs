use std::collections::hash_map::Entry;
use std::collections::HashMap;

use futures::future::{self, BoxFuture, FutureExt};

use crate::error::CommitError;
use crate::kafka::client::CommitOffsets;
use crate::kafka::commit_executor::CommitExecutor;
use crate::kafka::metrics_consts::COMMIT_PARTITION_COUNT;
use crate::kafka::types::{ConsumerRecord, Partition, PartitionOffset};

/// Completion of a `commit()` call. The acknowledgment is submitted when `commit()` is
/// called, so the handle may be dropped without cancelling the commit.
pub type CommitHandle = BoxFuture<'static, Result<(), CommitError>>;

/// Offset of a delivered message, bound to the stage that delivered it.
#[derive(Debug, Clone)]
pub struct CommittableOffset {
    partition_offset: PartitionOffset,
    executor: CommitExecutor,
}

impl CommittableOffset {
    pub(crate) fn new(partition_offset: PartitionOffset, executor: CommitExecutor) -> Self {
        Self {
            partition_offset,
            executor,
        }
    }

    pub fn partition_offset(&self) -> &PartitionOffset {
        &self.partition_offset
    }

    /// Commit just this offset. Same as committing a batch holding only this offset.
    pub fn commit(&self) -> CommitHandle {
        CommittableOffsetBatch::empty().updated(self).commit()
    }
}

/// A consumed record together with the handle to commit it
#[derive(Debug)]
pub struct CommittableMessage {
    record: ConsumerRecord,
    offset: CommittableOffset,
}

impl CommittableMessage {
    pub(crate) fn new(record: ConsumerRecord, offset: CommittableOffset) -> Self {
        Self { record, offset }
    }

    pub fn record(&self) -> &ConsumerRecord {
        &self.record
    }

    pub fn committable_offset(&self) -> &CommittableOffset {
        &self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.record.key()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.record.payload()
    }

    pub fn into_parts(self) -> (ConsumerRecord, CommittableOffset) {
        (self.record, self.offset)
    }

    pub fn into_offset(self) -> CommittableOffset {
        self.offset
    }

    pub fn into_record(self) -> ConsumerRecord {
        self.record
    }
}

#[derive(Debug, Clone)]
struct StageOffsets {
    executor: CommitExecutor,
    // highest consumed offset per partition, not yet +1
    offsets: HashMap<Partition, i64>,
}

impl StageOffsets {
    fn merge_offset(&mut self, partition: Partition, offset: i64) {
        self.offsets
            .entry(partition)
            .and_modify(|current| {
                if offset > *current {
                    *current = offset;
                }
            })
            .or_insert(offset);
    }
}

/// Accumulates offsets from any number of stages and commits them with one
/// acknowledgment per stage.
///
/// Offsets are grouped by the stage that delivered them, so stages configured with
/// the same client id still commit through their own client. Within a stage only the
/// highest offset per partition is kept, so folding offsets in any order (or merging
/// partial batches built elsewhere) ends up with the same batch.
#[derive(Debug, Clone, Default)]
pub struct CommittableOffsetBatch {
    // keyed by CommitExecutor::stage_id
    stages: HashMap<u64, StageOffsets>,
}

impl CommittableOffsetBatch {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns this batch with `offset` folded in.
    pub fn updated(mut self, offset: &CommittableOffset) -> Self {
        self.insert(offset);
        self
    }

    /// Returns the union of both batches.
    pub fn merged(mut self, other: CommittableOffsetBatch) -> Self {
        for (stage_id, group) in other.stages {
            match self.stages.entry(stage_id) {
                Entry::Occupied(mut existing) => {
                    let existing = existing.get_mut();
                    for (partition, offset) in group.offsets {
                        existing.merge_offset(partition, offset);
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(group);
                }
            }
        }
        self
    }

    fn insert(&mut self, offset: &CommittableOffset) {
        let partition_offset = offset.partition_offset();
        self.stages
            .entry(offset.executor.stage_id())
            .or_insert_with(|| StageOffsets {
                executor: offset.executor.clone(),
                offsets: HashMap::new(),
            })
            .merge_offset(partition_offset.partition().clone(), partition_offset.offset());
    }

    /// Highest offset held for a partition under the given client id, across every
    /// stage using that id
    pub fn get(&self, client_id: &str, partition: &Partition) -> Option<i64> {
        self.stages
            .values()
            .filter(|group| group.executor.client_id() == client_id)
            .filter_map(|group| group.offsets.get(partition))
            .max()
            .copied()
    }

    /// All offsets held, ordered by client, topic and partition
    pub fn offsets(&self) -> Vec<PartitionOffset> {
        let mut offsets: Vec<PartitionOffset> = self
            .stages
            .values()
            .flat_map(|group| {
                let client_id = group.executor.client_id();
                group.offsets.iter().map(move |(partition, offset)| {
                    PartitionOffset::new(client_id.to_string(), partition.clone(), *offset)
                })
            })
            .collect();
        offsets.sort();
        offsets
    }

    /// Number of partitions held across all stages
    pub fn len(&self) -> usize {
        self.stages.values().map(|group| group.offsets.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Number of stages a commit of this batch acknowledges through
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Submit one acknowledgment per stage, all at once.
    ///
    /// The handle resolves when every acknowledgment has succeeded and fails with the
    /// first failure seen. If any owning stage is already shut down the handle is
    /// failed before it is returned, while the other stages' acknowledgments still
    /// go out.
    pub fn commit(&self) -> CommitHandle {
        if self.is_empty() {
            return future::ready(Ok(())).boxed();
        }

        let mut pending = Vec::with_capacity(self.stages.len());
        let mut rejected = None;

        for group in self.stages.values() {
            let next_offsets: CommitOffsets = group
                .offsets
                .iter()
                .map(|(partition, offset)| (partition.clone(), offset.saturating_add(1)))
                .collect();
            metrics::histogram!(COMMIT_PARTITION_COUNT).record(next_offsets.len() as f64);

            match group.executor.submit(next_offsets) {
                Ok(receiver) => {
                    let client_id = group.executor.client_id().to_string();
                    pending.push(async move {
                        receiver
                            .await
                            .unwrap_or(Err(CommitError::Abandoned { client_id }))
                    });
                }
                Err(e) => {
                    rejected.get_or_insert(e);
                }
            }
        }

        if let Some(e) = rejected {
            return future::ready(Err(e)).boxed();
        }

        future::try_join_all(pending)
            .map(|result| result.map(|_| ()))
            .boxed()
    }
}

impl<'a> Extend<&'a CommittableOffset> for CommittableOffsetBatch {
    fn extend<I: IntoIterator<Item = &'a CommittableOffset>>(&mut self, iter: I) {
        for offset in iter {
            self.insert(offset);
        }
    }
}

impl Extend<CommittableOffset> for CommittableOffsetBatch {
    fn extend<I: IntoIterator<Item = CommittableOffset>>(&mut self, iter: I) {
        for offset in iter {
            self.insert(&offset);
        }
    }
}

impl FromIterator<CommittableOffset> for CommittableOffsetBatch {
    fn from_iter<I: IntoIterator<Item = CommittableOffset>>(iter: I) -> Self {
        let mut batch = Self::empty();
        batch.extend(iter);
        batch
    }
}
