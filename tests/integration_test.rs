mod common;

use chrono::{TimeZone, Utc};
use common::*;
use serde_json::json;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tap_duckdb::catalog::{Catalog, Selection};
use tap_duckdb::singer::{Emitter, SharedBuffer};
use tap_duckdb::source::{MemoryExecutor, MemoryTable, RawColumn, RawValue};
use tap_duckdb::sync::{Bookmark, BookmarkComparison, ReplicationMethod, StateDocument, StreamState};
use tap_duckdb::{RunContext, Tap};
use tokio::io::AsyncWrite;
use tokio::sync::watch;

fn bookmark_at(day: u32) -> Bookmark {
    Bookmark::Timestamp(Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap())
}

fn resumed_state(day: u32) -> StateDocument {
    let mut state = StateDocument::default();
    state.bookmarks.insert(
        "main-orders".to_string(),
        StreamState {
            method: ReplicationMethod::IncrementalKey,
            replication_key: Some("updated_at".to_string()),
            bookmark: Some(bookmark_at(day)),
            version: 1,
            schema_fingerprint: None,
        },
    );
    state
}

fn ids(run: &Run, stream: &str) -> Vec<i64> {
    run.records(stream)
        .iter()
        .map(|r| r["id"].as_i64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_first_incremental_run_extracts_everything() {
    init_tracing();

    let source = MemoryExecutor::new().with_table(orders());
    let run = run(incremental_config(), StateDocument::default(), source).await;

    assert!(run.summary.is_success());
    assert_eq!(run.summary.completed, vec!["main-orders".to_string()]);
    assert_eq!(ids(&run, "main-orders"), vec![1, 2, 3, 4]);

    let first = run.records("main-orders")[0];
    assert_eq!(first["amount"], json!("10.00"));
    assert_eq!(first["updated_at"], json!("2023-12-31T00:00:00Z"));

    // Incremental streams are not versioned
    assert_eq!(run.of_type("ACTIVATE_VERSION").count(), 0);
    assert!(run.of_type("RECORD").all(|m| m.get("version").is_none()));

    let state = run.state.get("main-orders").unwrap();
    assert_eq!(state.method, ReplicationMethod::IncrementalKey);
    assert_eq!(state.replication_key.as_deref(), Some("updated_at"));
    assert_eq!(state.bookmark, Some(bookmark_at(3)));
    assert_eq!(state.version, 1);
    assert_eq!(
        run.last_state()["bookmarks"]["main-orders"]["bookmark"],
        json!({"type": "timestamp", "value": "2024-01-03T00:00:00Z"})
    );
}

#[tokio::test]
async fn test_resume_exclusive_emits_only_newer_rows() {
    let mut config = incremental_config();
    config.sync.bookmark_comparison = BookmarkComparison::Exclusive;

    let source = MemoryExecutor::new().with_table(orders());
    let run = run(config, resumed_state(1), source).await;

    assert!(run.summary.is_success());
    let updated: Vec<_> = run
        .records("main-orders")
        .iter()
        .map(|r| r["updated_at"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(updated, vec!["2024-01-02T00:00:00Z", "2024-01-03T00:00:00Z"]);

    let state = run.state.get("main-orders").unwrap();
    assert_eq!(state.bookmark, Some(bookmark_at(3)));
    assert_eq!(state.version, 1);
}

#[tokio::test]
async fn test_resume_inclusive_replays_boundary_row() {
    let source = MemoryExecutor::new().with_table(orders());
    let run = run(incremental_config(), resumed_state(1), source).await;

    assert_eq!(ids(&run, "main-orders"), vec![2, 3, 4]);
    assert_eq!(run.state.get("main-orders").unwrap().bookmark, Some(bookmark_at(3)));
}

#[tokio::test]
async fn test_rerun_with_final_state_is_idempotent() {
    let first = run(
        incremental_config(),
        StateDocument::default(),
        MemoryExecutor::new().with_table(orders()),
    )
    .await;
    let second = run(
        incremental_config(),
        first.state.clone(),
        MemoryExecutor::new().with_table(orders()),
    )
    .await;

    // Only the row sitting on the bookmark comes back
    assert_eq!(ids(&second, "main-orders"), vec![4]);
    assert_eq!(second.state, first.state);
}

#[tokio::test]
async fn test_full_table_versions_every_run() {
    let first = run(test_config(), StateDocument::default(), warehouse()).await;
    assert!(first.summary.is_success());
    assert_eq!(
        first.summary.completed,
        vec!["main-customers", "main-orders", "reporting-shipping"]
    );
    assert_eq!(first.summary.records, 7);

    let sequence = first.sequence("main-customers");
    let body: Vec<_> = sequence.iter().filter(|t| *t != "STATE").cloned().collect();
    assert_eq!(
        body,
        vec!["SCHEMA", "ACTIVATE_VERSION", "RECORD", "RECORD", "ACTIVATE_VERSION"]
    );
    assert!(first
        .of_type("RECORD")
        .filter(|m| m["stream"] == "main-customers")
        .all(|m| m["version"] == json!(1)));

    let second = run(test_config(), first.state.clone(), warehouse()).await;
    let customers = second.state.get("main-customers").unwrap();
    assert_eq!(customers.version, 2);
    assert_eq!(customers.method, ReplicationMethod::FullTable);
    assert!(customers.bookmark.is_none());

    // Known version: no leading ACTIVATE_VERSION, one after the load
    let activations: Vec<_> = second
        .of_type("ACTIVATE_VERSION")
        .filter(|m| m["stream"] == "main-customers")
        .collect();
    assert_eq!(activations.len(), 1);
    assert_eq!(activations[0]["version"], json!(2));
}

#[tokio::test]
async fn test_schema_precedes_records_and_state_ends_run() {
    let run = run(test_config(), StateDocument::default(), warehouse()).await;

    for stream in ["main-customers", "main-orders", "reporting-shipping"] {
        let sequence = run.sequence(stream);
        let schema = sequence.iter().position(|t| t == "SCHEMA").unwrap();
        let first_record = sequence.iter().position(|t| t == "RECORD").unwrap();
        assert!(schema < first_record, "{}: {:?}", stream, sequence);
    }
    assert_eq!(run.messages.last().unwrap()["type"], "STATE");
}

#[tokio::test]
async fn test_checkpoints_follow_emitted_records() {
    let mut config = incremental_config();
    config.sync.checkpoint_every = 2;

    let source = MemoryExecutor::new().with_table(orders());
    let run = run(config, StateDocument::default(), source).await;

    // Every STATE covers only records already written before it
    let mut last_seen: Option<String> = None;
    let mut states = 0;
    for message in &run.messages {
        match message["type"].as_str().unwrap() {
            "RECORD" => last_seen = Some(message["record"]["updated_at"].as_str().unwrap().to_string()),
            "STATE" => {
                states += 1;
                let bookmark = &message["value"]["bookmarks"]["main-orders"]["bookmark"]["value"];
                if let Some(value) = bookmark.as_str() {
                    assert!(last_seen.as_deref().is_some_and(|seen| value <= seen));
                }
            }
            _ => {}
        }
    }
    // Two mid-stream, end of stream, end of run
    assert_eq!(states, 4);
}

#[tokio::test]
async fn test_view_with_unsupported_type_is_discovered() {
    let buffer = SharedBuffer::new();
    let tap = Tap::new(RunContext::new(test_config(), Emitter::new(SharedBuffer::new())), warehouse());
    let warnings = tap.discover(buffer.clone()).await.unwrap();

    let catalog: Catalog = serde_json::from_slice(&buffer.contents()).unwrap();
    let ids: Vec<_> = catalog.streams.iter().map(|s| s.tap_stream_id.as_str()).collect();
    assert_eq!(ids, vec!["main-customers", "main-orders", "reporting-shipping"]);

    let shipping = &catalog.streams[2];
    assert_eq!(
        shipping.schema["properties"]["transit"]["type"],
        json!(["string", "null"])
    );
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].stream, "reporting-shipping");
    assert!(warnings[0].message.contains("INTERVAL"));

    let orders = &catalog.streams[1];
    assert_eq!(orders.key_properties, vec!["id".to_string()]);
    assert_eq!(
        orders.metadata[0].metadata["valid-replication-keys"][0],
        json!("updated_at")
    );
}

#[tokio::test]
async fn test_catalog_selection_limits_streams() {
    let catalog: Catalog = serde_json::from_value(json!({
        "streams": [
            {"tap_stream_id": "main-orders", "metadata": [{"breadcrumb": [], "metadata": {
                "selected": true, "replication-method": "INCREMENTAL", "replication-key": "id"}}]},
            {"tap_stream_id": "main-customers", "metadata": [{"breadcrumb": [], "metadata": {
                "selected": false}}]}
        ]
    }))
    .unwrap();

    let run = run_with(
        |emitter| RunContext::new(test_config(), emitter).with_selection(Selection::from_catalog(&catalog)),
        warehouse(),
    )
    .await;

    assert_eq!(run.summary.completed, vec!["main-orders".to_string()]);
    assert!(run.records("main-customers").is_empty());
    assert!(run.records("reporting-shipping").is_empty());

    let state = run.state.get("main-orders").unwrap();
    assert_eq!(state.replication_key.as_deref(), Some("id"));
    assert_eq!(state.bookmark, Some(Bookmark::Integer(4)));
}

#[tokio::test]
async fn test_concurrent_streams_use_own_executors() {
    let mut config = test_config();
    config.sync.max_concurrent_streams = 3;

    let source = warehouse();
    let buffer = SharedBuffer::new();
    let tap = Tap::new(RunContext::new(config, Emitter::new(buffer.clone())), source.clone());
    let summary = tap.run().await.unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.completed.len(), 3);
    // One catalog connection plus one per stream
    assert_eq!(source.connections(), 4);

    let messages = buffer.messages().unwrap();
    for stream in ["main-customers", "main-orders", "reporting-shipping"] {
        let schema = messages
            .iter()
            .position(|m| m["type"] == "SCHEMA" && m["stream"] == stream)
            .unwrap();
        let record = messages
            .iter()
            .position(|m| m["type"] == "RECORD" && m["stream"] == stream)
            .unwrap();
        assert!(schema < record);
    }
}

#[tokio::test]
async fn test_default_key_is_never_a_text_column() {
    let people = |rows: &[(&str, i128)]| {
        rows.iter().fold(
            MemoryTable::new("main", "people")
                .column(RawColumn::new("name", "VARCHAR"))
                .column(RawColumn::new("id", "INTEGER").primary_key()),
            |table, (name, id)| table.row(vec![RawValue::Text(name.to_string()), RawValue::Int(*id)]),
        )
    };

    let first = run(
        incremental_config(),
        StateDocument::default(),
        MemoryExecutor::new().with_table(people(&[("Zed", 1), ("Moe", 2)])),
    )
    .await;
    assert!(first.summary.is_success());
    let state = first.state.get("main-people").unwrap();
    assert_eq!(state.replication_key.as_deref(), Some("id"));
    assert_eq!(state.bookmark, Some(Bookmark::Integer(2)));

    // A new row whose name sorts first still comes through
    let second = run(
        incremental_config(),
        first.state.clone(),
        MemoryExecutor::new().with_table(people(&[("Zed", 1), ("Moe", 2), ("Ada", 3)])),
    )
    .await;
    assert_eq!(ids(&second, "main-people"), vec![2, 3]);
}

#[tokio::test]
async fn test_deselected_column_is_left_out() {
    let catalog: Catalog = serde_json::from_value(json!({
        "streams": [{"tap_stream_id": "main-orders", "metadata": [
            {"breadcrumb": [], "metadata": {"selected": true, "replication-method": "INCREMENTAL",
                "replication-key": "updated_at"}},
            {"breadcrumb": ["properties", "amount"], "metadata": {"selected": false}},
            {"breadcrumb": ["properties", "updated_at"], "metadata": {"selected": false}},
            {"breadcrumb": ["properties", "id"], "metadata": {"selected": false}}
        ]}]
    }))
    .unwrap();

    let run = run_with(
        |emitter| RunContext::new(test_config(), emitter).with_selection(Selection::from_catalog(&catalog)),
        warehouse(),
    )
    .await;
    assert!(run.summary.is_success());

    let schema = run
        .of_type("SCHEMA")
        .find(|m| m["stream"] == "main-orders")
        .unwrap();
    let properties = schema["schema"]["properties"].as_object().unwrap();
    let mut names: Vec<_> = properties.keys().map(String::as_str).collect();
    names.sort();
    // Key and replication key columns cannot be deselected
    assert_eq!(names, vec!["id", "updated_at"]);

    let records = run.records("main-orders");
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| r.get("amount").is_none()));
    assert_eq!(records[0]["id"], json!(1));
    assert_eq!(run.state.get("main-orders").unwrap().bookmark, Some(bookmark_at(3)));
}

/// Output sink that raises the stop signal once `limit` RECORDs went out.
struct StopAfterRecords {
    buffer: SharedBuffer,
    records: usize,
    limit: usize,
    stop: watch::Sender<bool>,
}

impl AsyncWrite for StopAfterRecords {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if buf.starts_with(br#"{"type":"RECORD""#) {
            self.records += 1;
            if self.records == self.limit {
                let _ = self.stop.send(true);
            }
        }
        Pin::new(&mut self.buffer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.buffer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.buffer).poll_shutdown(cx)
    }
}

#[tokio::test]
async fn test_stop_signal_cancels_after_current_record() {
    init_tracing();

    let (stop_tx, stop_rx) = watch::channel(false);
    let buffer = SharedBuffer::new();
    let sink = StopAfterRecords {
        buffer: buffer.clone(),
        records: 0,
        limit: 2,
        stop: stop_tx,
    };
    let zones = MemoryTable::new("main", "zones")
        .column(RawColumn::new("id", "INTEGER").primary_key())
        .row(vec![RawValue::Int(1)]);

    let tap = Tap::new(
        RunContext::new(incremental_config(), Emitter::new(sink)).with_stop_signal(stop_rx),
        MemoryExecutor::new().with_table(orders()).with_table(zones),
    );
    let summary = tap.run().await.unwrap();
    let messages = buffer.messages().unwrap();

    assert!(summary.cancelled);
    assert!(!summary.is_success());
    assert!(summary.completed.is_empty());
    assert!(summary.failed.is_empty());

    let ids: Vec<_> = messages
        .iter()
        .filter(|m| m["type"] == "RECORD")
        .map(|m| m["record"]["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2]);

    // Shutdown checkpoint, then the final one
    let states: Vec<_> = messages.iter().filter(|m| m["type"] == "STATE").collect();
    assert_eq!(states.len(), 2);
    for state in &states {
        assert_eq!(
            state["value"]["bookmarks"]["main-orders"]["bookmark"]["value"],
            json!("2024-01-01T00:00:00Z")
        );
    }
    assert_eq!(messages.last().unwrap()["type"], "STATE");
    assert!(messages.iter().all(|m| m["stream"] != "main-zones"));
    assert_eq!(
        tap.context().state().await.get("main-orders").unwrap().bookmark,
        Some(bookmark_at(1))
    );
}

#[tokio::test]
async fn test_stop_signal_before_start_extracts_nothing() {
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    stop_tx.send(true).unwrap();

    let run = run_with(
        |emitter| RunContext::new(incremental_config(), emitter).with_stop_signal(stop_rx),
        MemoryExecutor::new().with_table(orders()),
    )
    .await;

    assert!(run.summary.cancelled);
    assert!(!run.summary.is_success());
    assert!(run.records("main-orders").is_empty());
    assert_eq!(run.of_type("STATE").count(), 1);
}
