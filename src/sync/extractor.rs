use futures::future;
use futures::stream::{BoxStream, StreamExt};
use std::cmp::Ordering;
use tracing::debug;

use super::planner::ExtractionPlan;
use super::state::compare_cursor;
use crate::catalog::{Record, StreamDescriptor, Value};
use crate::source::QueryExecutor;
use crate::{Error, Result};

/// Lazy, single-pass sequence of typed records for one stream.
pub type RecordStream = BoxStream<'static, Result<Record>>;

struct Progress {
    stream: String,
    cursor: Option<(usize, String)>,
    previous: Option<Value>,
    failed: bool,
}

/// Runs the planned query and coerces rows as they arrive.
///
/// The stream ends after the first error. When the plan orders by a cursor
/// column, rows that arrive out of order fail the stream with
/// [`Error::OutOfOrder`].
pub async fn extract(
    executor: &mut dyn QueryExecutor,
    descriptor: &StreamDescriptor,
    plan: &ExtractionPlan,
) -> Result<RecordStream> {
    debug!("Executing {}", plan.query);
    let rows = executor.execute(&plan.query).await?;

    let descriptor = descriptor.clone();
    let cursor = plan.query.order_by.as_ref().and_then(|column| {
        descriptor
            .columns
            .iter()
            .position(|c| &c.name == column)
            .map(|index| (index, column.clone()))
    });
    let progress = Progress {
        stream: plan.stream.clone(),
        cursor,
        previous: None,
        failed: false,
    };

    let records = rows.scan(progress, move |progress, row| {
        if progress.failed {
            return future::ready(None);
        }
        let result = row.and_then(|row| {
            descriptor
                .coerce_row(row)
                .map_err(|source| Error::Coercion {
                    stream: progress.stream.clone(),
                    source,
                })
                .and_then(|record| check_order(progress, record))
        });
        progress.failed = result.is_err();
        future::ready(Some(result))
    });
    Ok(records.boxed())
}

fn check_order(progress: &mut Progress, record: Record) -> Result<Record> {
    let Some((index, column)) = &progress.cursor else {
        return Ok(record);
    };
    let value = record
        .values()
        .get(*index)
        .map(|(_, v)| v.clone())
        .unwrap_or(Value::Null);
    if let Some(previous) = &progress.previous {
        if compare_cursor(previous, &value) == Some(Ordering::Greater) {
            return Err(Error::OutOfOrder {
                stream: progress.stream.clone(),
                column: column.clone(),
            });
        }
    }
    progress.previous = Some(value);
    Ok(record)
}
