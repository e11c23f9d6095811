use futures::stream::{Stream, StreamExt};

use crate::error::CommitError;
use crate::kafka::committable::{CommittableOffset, CommittableOffsetBatch};

/// Commit a stream of offsets in batches of at most `max_batch`.
///
/// Offsets already available are grouped without waiting for more, so a slow
/// upstream still commits promptly. Each batch is committed before the next one is
/// pulled, and the committed batch (or the commit failure) is yielded downstream.
pub fn commit_in_batches<S>(
    offsets: S,
    max_batch: usize,
) -> impl Stream<Item = Result<CommittableOffsetBatch, CommitError>>
where
    S: Stream<Item = CommittableOffset>,
{
    offsets
        .ready_chunks(max_batch.max(1))
        .then(|chunk| async move {
            let batch: CommittableOffsetBatch = chunk.into_iter().collect();
            batch.commit().await.map(|()| batch)
        })
}
