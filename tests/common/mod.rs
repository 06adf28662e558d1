#![allow(dead_code)]

use chrono::NaiveDate;
use serde_json::Value;
use tap_duckdb::singer::{Emitter, SharedBuffer};
use tap_duckdb::source::{MemoryExecutor, MemoryTable, ObjectKind, RawColumn, RawValue};
use tap_duckdb::sync::{ReplicationMethod, StateDocument};
use tap_duckdb::{Config, RunContext, RunSummary, Tap};

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("tap_duckdb=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn test_config() -> Config {
    Config::new("memory.duckdb", "memory")
}

pub fn incremental_config() -> Config {
    let mut config = test_config();
    config.sync.default_replication_method = ReplicationMethod::IncrementalKey;
    config
}

pub fn timestamp(day: u32) -> RawValue {
    let (year, month, day) = if day == 0 { (2023, 12, 31) } else { (2024, 1, day) };
    RawValue::Timestamp(
        NaiveDate::from_ymd_opt(year, month, day)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap(),
    )
}

/// `orders(id int pk, updated_at timestamp, amount decimal(10,2))`, rows
/// out of insertion order, stamped 2023-12-31 and 2024-01-01..03.
pub fn orders() -> MemoryTable {
    MemoryTable::new("main", "orders")
        .column(RawColumn::new("id", "INTEGER").primary_key())
        .column(RawColumn::new("updated_at", "TIMESTAMP"))
        .column(RawColumn::new("amount", "DECIMAL(10,2)"))
        .row(vec![RawValue::Int(3), timestamp(2), RawValue::Text("7.25".into())])
        .row(vec![RawValue::Int(1), timestamp(0), RawValue::Text("10.00".into())])
        .row(vec![RawValue::Int(4), timestamp(3), RawValue::Text("1.10".into())])
        .row(vec![RawValue::Int(2), timestamp(1), RawValue::Text("5.50".into())])
}

pub fn customers() -> MemoryTable {
    MemoryTable::new("main", "customers")
        .column(RawColumn::new("id", "BIGINT").primary_key())
        .column(RawColumn::new("name", "VARCHAR"))
        .row(vec![RawValue::Int(1), RawValue::Text("Ada".into())])
        .row(vec![RawValue::Int(2), RawValue::Text("Grace".into())])
}

/// A view with a column of a type that has no portable counterpart.
pub fn shipping_view() -> MemoryTable {
    MemoryTable::new("reporting", "shipping")
        .kind(ObjectKind::View)
        .column(RawColumn::new("order_id", "INTEGER"))
        .column(RawColumn::new("transit", "INTERVAL"))
        .row(vec![RawValue::Int(1), RawValue::Text("2 days".into())])
}

pub fn warehouse() -> MemoryExecutor {
    MemoryExecutor::new()
        .with_table(orders())
        .with_table(customers())
        .with_table(shipping_view())
}

/// Output and outcome of one run.
pub struct Run {
    pub summary: RunSummary,
    pub messages: Vec<Value>,
    pub state: StateDocument,
}

impl Run {
    pub fn of_type<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.messages.iter().filter(move |m| m["type"] == kind)
    }

    pub fn records(&self, stream: &str) -> Vec<&Value> {
        self.of_type("RECORD")
            .filter(|m| m["stream"] == stream)
            .map(|m| &m["record"])
            .collect()
    }

    /// Message types of one stream (plus every STATE), in output order.
    pub fn sequence(&self, stream: &str) -> Vec<String> {
        self.messages
            .iter()
            .filter(|m| m["type"] == "STATE" || m["stream"] == stream)
            .map(|m| m["type"].as_str().unwrap().to_string())
            .collect()
    }

    pub fn last_state(&self) -> &Value {
        self.of_type("STATE").last().map(|m| &m["value"]).unwrap()
    }
}

pub async fn run_with(ctx_for: impl FnOnce(Emitter) -> RunContext, source: MemoryExecutor) -> Run {
    let buffer = SharedBuffer::new();
    let ctx = ctx_for(Emitter::new(buffer.clone()));
    let tap = Tap::new(ctx, source);
    let summary = tap.run().await.unwrap();
    let state = tap.context().state().await;
    Run {
        summary,
        messages: buffer.messages().unwrap(),
        state,
    }
}

pub async fn run(config: Config, state: StateDocument, source: MemoryExecutor) -> Run {
    run_with(|emitter| RunContext::new(config, emitter).with_state(state), source).await
}
