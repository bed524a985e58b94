//! End-to-end replay scenarios against the in-memory database.

use std::sync::Arc;
use std::time::Duration;

use changefeed_replay::binding::bind_stream;
use changefeed_replay::database::{TableColumn, TableDescription};
use changefeed_replay::pool::WriterPool;
use changefeed_replay::testing::{created_at, message, MockDatabase, MockSubscriptionFactory, RecordingCommitter};
use changefeed_replay::writer::WriterOptions;
use changefeed_replay::{
    ChangeStreamConfig, ColumnType, Database, Replicator, ReplicatorConfig, StatusCode,
    StreamBinding,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const UPSERT: &str = "DECLARE $rows AS List<Struct<id:Uint64?,v:Int64?>>; \
                      UPSERT INTO dst SELECT * FROM AS_TABLE($rows);";
const DELETE: &str = "DECLARE $keys AS List<Struct<id:Uint64?>>; \
                      DELETE FROM dst ON SELECT * FROM AS_TABLE($keys);";

fn rows_type(members: &[(&str, ColumnType)]) -> ColumnType {
    ColumnType::list(ColumnType::Struct(changefeed_replay::types::StructType::new(
        members
            .iter()
            .map(|(n, t)| ((*n).to_string(), t.clone()))
            .collect(),
    )))
}

fn database() -> MockDatabase {
    MockDatabase::new("/local")
        .with_table(
            "/local/src",
            TableDescription {
                columns: vec![
                    TableColumn::new("id", ColumnType::optional(ColumnType::Uint64)),
                    TableColumn::new("v", ColumnType::optional(ColumnType::Int64)),
                ],
                primary_keys: vec!["id".into()],
            },
        )
        .with_query(
            UPSERT,
            vec![(
                "$rows".into(),
                rows_type(&[
                    ("id", ColumnType::optional(ColumnType::Uint64)),
                    ("v", ColumnType::optional(ColumnType::Int64)),
                ]),
            )],
        )
        .with_query(
            DELETE,
            vec![(
                "$keys".into(),
                rows_type(&[("id", ColumnType::optional(ColumnType::Uint64))]),
            )],
        )
}

fn config(batch_size: usize, threads: usize, with_delete: bool) -> ChangeStreamConfig {
    let mut cfg = ChangeStreamConfig::new("src/feed", "replay");
    cfg.update_query = Some(UPSERT.into());
    if with_delete {
        cfg.delete_query = Some(DELETE.into());
    }
    cfg.batch_size = batch_size;
    cfg.threads = threads;
    cfg
}

fn update(id: u64) -> String {
    format!(r#"{{"key":[{id}],"update":{{"v":{id}}}}}"#)
}

fn erase(id: u64) -> String {
    format!(r#"{{"key":[{id}],"erase":{{}}}}"#)
}

async fn bound(db: &MockDatabase, cfg: &ChangeStreamConfig) -> StreamBinding {
    bind_stream(db, cfg, &[]).await.unwrap()
}

fn single_writer(binding: &StreamBinding, db: &Arc<MockDatabase>) -> WriterPool {
    let db: Arc<dyn Database> = db.clone();
    let options = WriterOptions {
        queue_capacity: 64,
        ..WriterOptions::default()
    };
    WriterPool::with_options(binding, &db, "replay", 1, &options, &CancellationToken::new())
}

#[tokio::test(start_paused = true)]
async fn test_full_batch_flushes_before_next_row() {
    let db = Arc::new(database());
    let binding = bound(&db, &config(4, 1, false)).await;
    let pool = single_writer(&binding, &db);
    let commits = Arc::new(RecordingCommitter::new());

    for offset in 0..5 {
        assert!(pool.dispatch(message(&commits, 0, offset, &update(offset))).await);
    }
    pool.start();
    tokio::time::sleep(Duration::from_millis(10)).await;
    pool.close().await;

    let executions = db.executions();
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0].rows.len(), 4);
    assert_eq!(executions[1].rows, vec![json!([4, 4])]);
    assert_eq!(executions[0].param_name, "$rows");
    assert_eq!(commits.ranges(), vec![(0, 0..4), (0, 4..5)]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_writes_retry_then_commit_once() {
    let db = Arc::new(database());
    let binding = bound(&db, &config(10, 1, false)).await;
    let pool = single_writer(&binding, &db);
    let commits = Arc::new(RecordingCommitter::new());
    db.fail_next(3, StatusCode::Overloaded);

    for offset in 0..3 {
        pool.dispatch(message(&commits, 0, offset, &update(offset))).await;
    }
    pool.start();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let executions = db.executions();
    assert_eq!(executions.len(), 4);
    assert!(executions[..3].iter().all(|e| !e.status.is_success()));
    assert!(executions[3].status.is_success());
    assert_eq!(executions[3].rows.len(), 3);

    assert_eq!(commits.ranges(), vec![(0, 0..3)]);
    let metrics = pool.metrics();
    assert_eq!(metrics.retries, 3);
    assert_eq!(metrics.batches_flushed, 1);
    assert_eq!(metrics.rows_written, 3);
    assert!(pool.status().is_success());
    assert_eq!(pool.last_write(), Some(created_at(2)));

    pool.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_backoff_commits_nothing() {
    let db = Arc::new(database());
    let binding = bound(&db, &config(10, 1, false)).await;
    let pool = single_writer(&binding, &db);
    let commits = Arc::new(RecordingCommitter::new());
    db.fail_next(u32::MAX, StatusCode::Unavailable);

    pool.dispatch(message(&commits, 0, 0, &update(1))).await;
    pool.start();
    tokio::time::sleep(Duration::from_secs(1)).await;
    pool.close().await;

    assert!(db.executions().len() > 1);
    assert_eq!(commits.committed(), 0);
    assert_eq!(pool.status().code, StatusCode::Unavailable);
    assert!(pool.last_write().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_close_waits_for_write_in_flight() {
    let db = Arc::new(database().with_execute_delay(Duration::from_secs(5)));
    let binding = bound(&db, &config(10, 1, false)).await;
    let pool = single_writer(&binding, &db);
    let commits = Arc::new(RecordingCommitter::new());

    pool.dispatch(message(&commits, 0, 0, &update(1))).await;
    pool.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(db.executions().is_empty());

    pool.close().await;

    let executions = db.executions();
    assert_eq!(executions.len(), 1);
    assert!(executions[0].status.is_success());
    assert_eq!(commits.ranges(), vec![(0, 0..1)]);
    assert_eq!(pool.metrics().rows_written, 1);
}

#[tokio::test(start_paused = true)]
async fn test_erase_without_delete_query_is_discarded() {
    let db = Arc::new(database());
    let binding = bound(&db, &config(10, 1, false)).await;
    assert!(binding.delete.is_discard());
    let pool = single_writer(&binding, &db);
    let commits = Arc::new(RecordingCommitter::new());

    pool.dispatch(message(&commits, 0, 0, r#"{"key":["42"],"erase":true}"#)).await;
    pool.dispatch(message(&commits, 0, 1, &update(7))).await;
    pool.start();
    tokio::time::sleep(Duration::from_millis(10)).await;
    pool.close().await;

    let executions = db.executions();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].query, UPSERT);
    assert_eq!(executions[0].rows, vec![json!([7, 7])]);
    assert_eq!(commits.ranges(), vec![(0, 0..1), (0, 1..2)]);
    let metrics = pool.metrics();
    assert_eq!(metrics.events_discarded, 1);
    assert_eq!(metrics.rows_written, 1);
}

#[tokio::test(start_paused = true)]
async fn test_interleaved_updates_and_deletes_keep_order() {
    let db = Arc::new(database());
    let binding = bound(&db, &config(10, 1, true)).await;
    let pool = single_writer(&binding, &db);
    let commits = Arc::new(RecordingCommitter::new());

    let bodies = [update(1), update(2), erase(1), erase(3), update(4)];
    for (offset, body) in (0u64..).zip(&bodies) {
        pool.dispatch(message(&commits, 0, offset, body)).await;
    }
    pool.start();
    tokio::time::sleep(Duration::from_millis(10)).await;
    pool.close().await;

    let executions = db.executions();
    let queries: Vec<&str> = executions.iter().map(|e| e.query.as_str()).collect();
    assert_eq!(queries, vec![UPSERT, DELETE, UPSERT]);
    assert_eq!(executions[1].param_name, "$keys");
    assert_eq!(executions[1].rows, vec![json!([1]), json!([3])]);
    assert_eq!(commits.ranges(), vec![(0, 0..2), (0, 2..4), (0, 4..5)]);
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_envelope_commits_with_next_write() {
    let db = Arc::new(database());
    let binding = bound(&db, &config(10, 1, false)).await;
    let pool = single_writer(&binding, &db);
    let commits = Arc::new(RecordingCommitter::new());

    pool.dispatch(message(&commits, 0, 0, &update(1))).await;
    pool.dispatch(message(&commits, 0, 1, r#"{"resolved":[1]}"#)).await;
    pool.dispatch(message(&commits, 0, 2, &update(2))).await;
    pool.start();
    tokio::time::sleep(Duration::from_millis(10)).await;
    pool.close().await;

    assert_eq!(db.executions().len(), 1);
    assert_eq!(commits.ranges(), vec![(0, 0..3)]);
    assert_eq!(pool.metrics().envelopes_dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_json_stops_writer() {
    let db = Arc::new(database());
    let binding = bound(&db, &config(10, 1, false)).await;
    let pool = single_writer(&binding, &db);
    let commits = Arc::new(RecordingCommitter::new());

    pool.dispatch(message(&commits, 0, 0, "{not json")).await;
    pool.start();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(pool.status().code, StatusCode::ClientInternalError);
    assert!(!pool.writers()[0].is_running());
    assert!(!pool.dispatch(message(&commits, 0, 1, &update(1))).await);
    assert_eq!(commits.committed(), 0);
    pool.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_replicator_commits_everything_processed() {
    for (messages, threads) in [(1u64, 1usize), (17, 2), (40, 3), (64, 8)] {
        let db = Arc::new(database());
        let factory = Arc::new(MockSubscriptionFactory::new());
        let feed = factory.feed("replay");
        let config = ReplicatorConfig {
            streams: vec![config(5, threads, true)],
            queries: Vec::new(),
        };

        let replicator = Replicator::build(&config, db.clone(), factory.clone()).await;
        assert!(replicator.warnings().is_empty());
        replicator.start().await;

        for offset in 0..messages {
            let body = if offset % 4 == 3 { erase(offset) } else { update(offset) };
            assert!(feed.push(offset % 5, offset, &body));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        replicator.close().await;

        assert_eq!(feed.committer().committed(), messages);
        let metrics = replicator.metrics();
        assert_eq!(metrics.commits, messages);
        assert_eq!(metrics.rows_written, messages);
        assert_eq!(db.written_rows().len() as u64, messages);
        assert!(feed.is_closed());

        let status = replicator.status();
        assert_eq!(status.len(), 1);
        assert!(status[0].ok);
        assert_eq!(status[0].changefeed, "/local/src/feed");
        assert_eq!(
            factory.subscribed(),
            vec![("/local/src/feed".to_string(), "replay".to_string())]
        );
    }
}

#[tokio::test]
async fn test_replicator_keeps_good_streams() {
    let db = Arc::new(database());
    let factory = Arc::new(MockSubscriptionFactory::new());
    let mut broken = config(5, 1, true);
    broken.consumer = "broken".into();
    broken.update_query = Some("SELECT 1".into());

    let config = ReplicatorConfig {
        streams: vec![config(5, 1, true), broken],
        queries: Vec::new(),
    };
    let replicator = Replicator::build(&config, db, factory).await;

    let info = replicator.info();
    assert_eq!(info.streams.len(), 1);
    assert_eq!(info.streams[0].consumer, "replay");
    assert_eq!(info.warnings.len(), 1);
    assert!(info.warnings[0].starts_with("can't create reader broken with problem: "));
    replicator.close().await;
}
