use std::collections::HashMap;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio::time::timeout;

use committable_consumer::kafka::test_utils::{
    fail_commits, partition, record, records, DeferredCommits, MockConsumerClient,
};
use committable_consumer::kafka::{
    committable_source, plain_source, CommittableMessage, CommittableOffsetBatch,
    CommittableSource, ConsumerRecord, ConsumerSettings, Control, StageState,
};
use committable_consumer::{ClientError, CommitError, ConsumerError};

const WAIT: Duration = Duration::from_secs(5);

fn settings(client_id: &str) -> ConsumerSettings {
    ConsumerSettings::new()
        .with_client_id(client_id)
        .with_poll_timeout(Duration::from_millis(5))
}

fn start(client: &MockConsumerClient, client_id: &str) -> (CommittableSource, Control) {
    committable_source(client.clone(), settings(client_id))
}

async fn next_message(source: &mut CommittableSource) -> CommittableMessage {
    timeout(WAIT, source.next())
        .await
        .expect("timed out waiting for a message")
        .expect("stream ended early")
        .expect("poll failed")
}

async fn wait_until(condition: impl Fn() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn observed(record: &ConsumerRecord) -> Observed {
    (
        record.partition_number(),
        record.offset(),
        record.payload().map(<[u8]>::to_vec),
    )
}

#[tokio::test]
async fn test_commit_single_record_acknowledges_next_offset() {
    let client = MockConsumerClient::new();
    client.enqueue(vec![record("events", 0, 41, "hello")]);
    let (mut source, control) = start(&client, "c1");

    let message = next_message(&mut source).await;
    assert_eq!(message.payload(), Some("hello".as_bytes()));

    let result = timeout(WAIT, message.committable_offset().commit())
        .await
        .unwrap();
    assert_eq!(result, Ok(()));
    assert_eq!(
        client.commits(),
        vec![HashMap::from([(partition("events", 0), 42)])]
    );

    control.shutdown().await;
}

#[tokio::test]
async fn test_failed_acknowledgment_resolves_with_that_failure() {
    let failure = ClientError::Other("coordinator unavailable".to_string());
    let client = MockConsumerClient::new().with_commit_handler(fail_commits(failure.clone()));
    client.enqueue(vec![record("events", 0, 7, "hello")]);
    let (mut source, control) = start(&client, "c1");

    let message = next_message(&mut source).await;
    let result = timeout(WAIT, message.committable_offset().commit())
        .await
        .unwrap();

    assert_eq!(result, Err(CommitError::Client(failure)));
    assert_eq!(client.commit_count(), 1);

    control.shutdown().await;
    assert!(client.is_closed());
}

type Observed = (i32, i64, Option<Vec<u8>>);

async fn consume_chunks(chunks: Vec<Vec<ConsumerRecord>>, expected: usize) -> Vec<Observed> {
    let client = MockConsumerClient::new();
    for chunk in chunks {
        client.enqueue(chunk);
    }
    let (source, control) = start(&client, "chunks");

    let seen: Vec<_> = timeout(
        WAIT,
        source
            .take(expected)
            .map(|message| observed(message.expect("poll failed").record()))
            .collect(),
    )
    .await
    .unwrap();

    control.shutdown().await;
    seen
}

#[tokio::test]
async fn test_chunking_is_invisible_downstream() {
    let all = records("events", 3, 1000, 10_000);
    let expected: Vec<_> = all.iter().map(observed).collect();

    let one_chunk = consume_chunks(vec![all.clone()], all.len()).await;
    assert_eq!(one_chunk, expected);

    let sized = all.chunks(97).map(<[ConsumerRecord]>::to_vec).collect();
    assert_eq!(consume_chunks(sized, all.len()).await, expected);

    let singletons = all.iter().cloned().map(|r| vec![r]).collect();
    assert_eq!(consume_chunks(singletons, all.len()).await, expected);

    let with_gaps = all
        .chunks(500)
        .flat_map(|chunk| [vec![], chunk.to_vec(), vec![]])
        .collect();
    assert_eq!(consume_chunks(with_gaps, all.len()).await, expected);
}

#[tokio::test]
async fn test_polls_only_on_demand() {
    let client = MockConsumerClient::new();
    for offset in 0..100 {
        client.enqueue(vec![record("events", 0, offset, "v")]);
    }
    let (mut source, control) =
        committable_source(client.clone(), settings("slow").with_buffer_size(4));

    wait_until(|| client.poll_count() >= 4).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.poll_count(), 4);
    assert_eq!(client.pending_responses(), 96);

    let first = next_message(&mut source).await;
    assert_eq!(first.record().offset(), 0);
    wait_until(|| client.poll_count() == 5).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.poll_count(), 5);

    control.shutdown().await;
}

#[tokio::test]
async fn test_stop_completes_stream_but_keeps_client_open() {
    let client = MockConsumerClient::new();
    client.enqueue(records("events", 0, 0, 3));
    let (mut source, control) = start(&client, "c1");

    let first = next_message(&mut source).await;
    timeout(WAIT, control.stop()).await.unwrap();
    assert_eq!(control.state(), StageState::Stopped);

    let rest: Vec<_> = timeout(WAIT, source.collect::<Vec<_>>()).await.unwrap();
    assert_eq!(rest.len(), 2);
    assert!(!client.is_closed());

    // commits still reach the client while stopped
    let result = timeout(WAIT, first.committable_offset().commit())
        .await
        .unwrap();
    assert_eq!(result, Ok(()));
    assert_eq!(client.commit_count(), 1);

    timeout(WAIT, control.shutdown()).await.unwrap();
    assert!(client.is_closed());
    assert_eq!(client.polls_after_close(), 0);
}

#[tokio::test]
async fn test_stop_leaves_queued_messages_receivable() {
    let client = MockConsumerClient::new();
    client.enqueue(records("events", 0, 0, 5));
    let (mut source, control) =
        committable_source(client.clone(), settings("c1").with_buffer_size(8));

    wait_until(|| client.pending_responses() == 0).await;
    timeout(WAIT, control.stop()).await.unwrap();
    assert_eq!(control.state(), StageState::Stopped);

    // stop() resolved before anything was received, all of it is still queued
    for expected in 0..5 {
        assert_eq!(next_message(&mut source).await.record().offset(), expected);
    }
    assert!(timeout(WAIT, source.next()).await.unwrap().is_none());

    timeout(WAIT, control.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_commit_after_shutdown_fails_immediately() {
    let client = MockConsumerClient::new();
    client.enqueue(records("events", 0, 0, 1));
    let (mut source, control) = start(&client, "c1");

    let offset = next_message(&mut source).await.into_offset();
    timeout(WAIT, control.shutdown()).await.unwrap();

    let result = offset
        .commit()
        .now_or_never()
        .expect("commit on a shut down stage should fail without waiting");
    assert_eq!(
        result,
        Err(CommitError::StageShutdown {
            client_id: "c1".to_string()
        })
    );
    assert_eq!(client.commit_count(), 0);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_commits() {
    let deferred = DeferredCommits::new();
    let client = MockConsumerClient::new().with_commit_handler(deferred.handler());
    client.enqueue(records("events", 0, 0, 2));
    let (mut source, control) = start(&client, "c1");

    let message = next_message(&mut source).await;
    let handle = message.committable_offset().commit();
    wait_until(|| deferred.len() == 1).await;

    let shutdown = {
        let control = control.clone();
        tokio::spawn(async move { control.shutdown().await })
    };
    let observer = {
        let control = control.clone();
        tokio::spawn(async move { control.is_shutdown().await })
    };

    wait_until(|| control.state() == StageState::ShuttingDown).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!shutdown.is_finished());
    assert!(!observer.is_finished());
    assert!(!client.is_closed());

    assert_eq!(deferred.succeed_all(), 1);

    timeout(WAIT, shutdown).await.unwrap().unwrap();
    timeout(WAIT, observer).await.unwrap().unwrap();
    assert_eq!(timeout(WAIT, handle).await.unwrap(), Ok(()));
    assert_eq!(client.close_count(), 1);
}

#[tokio::test]
async fn test_commit_submitted_while_draining_is_still_honoured() {
    let deferred = DeferredCommits::new();
    let client = MockConsumerClient::new().with_commit_handler(deferred.handler());
    client.enqueue(records("events", 0, 0, 2));
    let (mut source, control) = start(&client, "c1");

    let first = next_message(&mut source).await;
    let second = next_message(&mut source).await;
    let first_handle = first.committable_offset().commit();
    wait_until(|| deferred.len() == 1).await;

    let shutdown = {
        let control = control.clone();
        tokio::spawn(async move { control.shutdown().await })
    };
    wait_until(|| control.state() == StageState::ShuttingDown).await;

    let second_handle = second.committable_offset().commit();
    wait_until(|| deferred.len() == 2).await;
    assert_eq!(deferred.succeed_all(), 2);

    timeout(WAIT, shutdown).await.unwrap().unwrap();
    assert_eq!(first_handle.await, Ok(()));
    assert_eq!(second_handle.await, Ok(()));
    assert_eq!(client.close_count(), 1);
}

#[tokio::test]
async fn test_concurrent_lifecycle_calls_close_once() {
    let client = MockConsumerClient::new();
    client.enqueue(records("events", 0, 0, 10));
    let (_source, control) = start(&client, "c1");

    let mut calls = Vec::new();
    for i in 0..10 {
        let control = control.clone();
        calls.push(tokio::spawn(async move {
            if i % 2 == 0 {
                control.stop().await
            } else {
                control.shutdown().await
            }
        }));
    }
    for call in calls {
        timeout(WAIT, call).await.unwrap().unwrap();
    }

    timeout(WAIT, control.is_shutdown()).await.unwrap();
    assert_eq!(control.state(), StageState::Shutdown);
    assert_eq!(client.close_count(), 1);

    // repeated calls after the fact resolve immediately
    timeout(WAIT, control.stop()).await.unwrap();
    timeout(WAIT, control.shutdown()).await.unwrap();
    assert_eq!(client.close_count(), 1);
}

#[tokio::test]
async fn test_dropping_source_shuts_stage_down() {
    let client = MockConsumerClient::new();
    client.enqueue(records("events", 0, 0, 5));
    let (mut source, control) = start(&client, "c1");

    let offset = next_message(&mut source).await.into_offset();
    drop(source);

    timeout(WAIT, control.is_shutdown()).await.unwrap();
    assert!(client.is_closed());
    assert_eq!(client.polls_after_close(), 0);

    timeout(WAIT, control.stop()).await.unwrap();
    let result = offset.commit().now_or_never().unwrap();
    assert!(result.unwrap_err().is_stage_shutdown());
}

#[tokio::test]
async fn test_dropping_source_waits_for_pending_commits() {
    let deferred = DeferredCommits::new();
    let client = MockConsumerClient::new().with_commit_handler(deferred.handler());
    client.enqueue(records("events", 0, 0, 1));
    let (mut source, control) = start(&client, "c1");

    let handle = next_message(&mut source).await.committable_offset().commit();
    wait_until(|| deferred.len() == 1).await;
    drop(source);

    wait_until(|| control.state() == StageState::ShuttingDown).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!client.is_closed());

    deferred.succeed_all();
    timeout(WAIT, control.is_shutdown()).await.unwrap();
    assert_eq!(handle.await, Ok(()));
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_poll_failure_ends_stream_and_shuts_down() {
    let failure = ClientError::Other("broker gone".to_string());
    let client = MockConsumerClient::new();
    client.enqueue(records("events", 0, 0, 2));
    client.enqueue_error(failure.clone());
    client.enqueue(records("events", 0, 2, 2));
    let (source, control) = start(&client, "c1");

    let items: Vec<_> = timeout(WAIT, source.collect::<Vec<_>>()).await.unwrap();
    assert_eq!(items.len(), 3);
    assert!(items[0].is_ok());
    assert!(items[1].is_ok());
    assert_eq!(
        items[2].as_ref().map(|_| ()),
        Err(&ConsumerError::Poll(failure))
    );

    timeout(WAIT, control.is_shutdown()).await.unwrap();
    assert!(client.is_closed());
    assert_eq!(client.pending_responses(), 1);
    assert_eq!(client.polls_after_close(), 0);
}

#[tokio::test]
async fn test_batch_across_stages_commits_once_per_stage() {
    let clients: Vec<_> = (0..3).map(|_| MockConsumerClient::new()).collect();
    let mut controls = Vec::new();
    let mut batch = CommittableOffsetBatch::empty();

    for (i, client) in clients.iter().enumerate() {
        // same topic and partition everywhere, only the client id tells them apart
        client.enqueue(records("events", 0, 10 * i as i64, 3));
        let (mut source, control) = start(client, &format!("stage-{i}"));
        for _ in 0..3 {
            batch = batch.updated(next_message(&mut source).await.committable_offset());
        }
        controls.push((source, control));
    }

    assert_eq!(batch.stage_count(), 3);
    assert_eq!(batch.len(), 3);

    timeout(WAIT, batch.commit()).await.unwrap().unwrap();

    for (i, client) in clients.iter().enumerate() {
        assert_eq!(
            client.commits(),
            vec![HashMap::from([(partition("events", 0), 10 * i as i64 + 3)])]
        );
    }

    for (_source, control) in &controls {
        timeout(WAIT, control.shutdown()).await.unwrap();
    }
}

#[tokio::test]
async fn test_stages_sharing_client_id_commit_through_own_client() {
    let first = MockConsumerClient::new();
    let second = MockConsumerClient::new();
    first.enqueue(vec![record("events", 0, 0, "a")]);
    second.enqueue(vec![record("events", 1, 50, "b")]);
    let (mut first_source, first_control) = start(&first, "shared");
    let (mut second_source, second_control) = start(&second, "shared");

    let first_offset = next_message(&mut first_source).await.into_offset();
    let second_offset = next_message(&mut second_source).await.into_offset();

    let batch = CommittableOffsetBatch::empty()
        .updated(&first_offset)
        .updated(&second_offset);
    assert_eq!(batch.stage_count(), 2);

    timeout(WAIT, batch.commit()).await.unwrap().unwrap();
    assert_eq!(
        first.commits(),
        vec![HashMap::from([(partition("events", 0), 1)])]
    );
    assert_eq!(
        second.commits(),
        vec![HashMap::from([(partition("events", 1), 51)])]
    );

    // the namesake shutting down leaves the other stage committable
    timeout(WAIT, first_control.shutdown()).await.unwrap();
    let result = timeout(WAIT, second_offset.commit()).await.unwrap();
    assert_eq!(result, Ok(()));
    assert_eq!(second.commit_count(), 2);
    assert_eq!(first.commit_count(), 1);

    timeout(WAIT, second_control.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_batch_with_shut_down_stage_fails_but_commits_live_stage() {
    let gone = MockConsumerClient::new();
    let deferred = DeferredCommits::new();
    let live = MockConsumerClient::new().with_commit_handler(deferred.handler());
    gone.enqueue(vec![record("events", 0, 3, "a")]);
    live.enqueue(vec![record("events", 0, 8, "b")]);
    let (mut gone_source, gone_control) = start(&gone, "gone");
    let (mut live_source, live_control) = start(&live, "live");

    let batch = CommittableOffsetBatch::empty()
        .updated(next_message(&mut gone_source).await.committable_offset())
        .updated(next_message(&mut live_source).await.committable_offset());
    timeout(WAIT, gone_control.shutdown()).await.unwrap();

    let result = batch
        .commit()
        .now_or_never()
        .expect("a shut down stage in the batch should fail the commit at once");
    assert_eq!(
        result,
        Err(CommitError::StageShutdown {
            client_id: "gone".to_string()
        })
    );
    assert_eq!(gone.commit_count(), 0);

    // the live stage's acknowledgment went out anyway and is tracked until it resolves
    wait_until(|| deferred.len() == 1).await;
    assert_eq!(
        live.commits(),
        vec![HashMap::from([(partition("events", 0), 9)])]
    );

    let shutdown = {
        let control = live_control.clone();
        tokio::spawn(async move { control.shutdown().await })
    };
    wait_until(|| live_control.state() == StageState::ShuttingDown).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!shutdown.is_finished());

    assert_eq!(deferred.succeed_all(), 1);
    timeout(WAIT, shutdown).await.unwrap().unwrap();
    assert_eq!(live.close_count(), 1);
}

#[tokio::test]
async fn test_plain_source_yields_records() {
    let client = MockConsumerClient::new();
    client.enqueue(records("events", 1, 5, 3));
    let (source, control) = plain_source(client.clone(), settings("plain"));

    let offsets: Vec<_> = timeout(
        WAIT,
        source
            .take(3)
            .map(|record| record.unwrap().offset())
            .collect::<Vec<_>>(),
    )
    .await
    .unwrap();
    assert_eq!(offsets, vec![5, 6, 7]);

    timeout(WAIT, control.shutdown()).await.unwrap();
    assert!(client.is_closed());
    assert_eq!(client.commit_count(), 0);
}
