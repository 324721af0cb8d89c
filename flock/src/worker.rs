// Copyright (c) 2020-present, UMD Database Group.
//
// This program is free software: you can use, redistribute, and/or modify
// it under the terms of the GNU Affero General Public License, version 3
// or later ("AGPL"), as published by the Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

//! Worker-side task execution: the glue between a [`WorkerPayload`] and the
//! embedded analytical engine (DataFusion). Shared by the `flock-function`
//! binary and by [`crate::dispatch::LocalDispatcher`], which runs tasks
//! in-process instead of invoking a remote function.
//!
//! The engine itself is an external collaborator: a task's subquery already
//! arrives fully concrete (every FROM position is a `READ_<FORMAT>([...])`
//! call over a literal file list). This module's only job is staging those
//! files where DataFusion can read them, running the query, and writing the
//! result back out through the BlobStore.

use crate::blobstore::BlobStore;
use crate::error::{FlockError, Result};
use crate::source::FileFormat;
use datafusion::arrow::csv::Writer as CsvWriter;
use datafusion::arrow::json::LineDelimitedWriter;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::prelude::{CsvReadOptions, NdJsonReadOptions, ParquetReadOptions, SessionContext};
use log::{debug, warn};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tempfile::NamedTempFile;

/// The worker invocation payload a Dispatcher delivers: the fully-rewritten
/// subquery, the key its result must be written to, and the dispatcher's own
/// correlation id for this invocation.
///
/// `request_id` is opaque to `execute_task`; it rides along in the payload
/// purely so a remote Dispatcher can recover it from the invocation's
/// `requestPayload` once AWS Lambda Destinations echoes it back on the
/// success/failure queue (the Invoke API's response doesn't surface AWS's own
/// request id to callers, so the Dispatcher mints its own instead).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPayload {
    pub query: String,
    pub key: String,
    pub request_id: String,
}

/// Run `payload.query` to completion and write its result to `payload.key`.
///
/// Fails with [`FlockError::TaskFailed`] for anything that goes wrong
/// running the query or writing its output; the caller (a Dispatcher
/// implementation or `LocalDispatcher`) is responsible for turning that into
/// a failure message on the CompletionBus.
pub async fn execute_task(store: &dyn BlobStore, payload: &WorkerPayload) -> Result<()> {
    debug!("executing task, writing to `{}`", payload.key);
    let calls = find_reader_calls(&payload.query);
    if calls.is_empty() {
        warn!("subquery for `{}` has no recognized source reader", payload.key);
        return Err(FlockError::TaskFailed(
            "subquery has no recognized source reader".to_owned(),
        ));
    }

    let ctx = SessionContext::new();
    let mut rewritten = String::with_capacity(payload.query.len());
    let mut cursor = 0;
    // Keep every staged tempfile alive until the query has run.
    let mut staged = Vec::new();

    for (call_idx, call) in calls.iter().enumerate() {
        rewritten.push_str(&payload.query[cursor..call.start]);
        cursor = call.end;

        let mut member_tables = Vec::with_capacity(call.files.len());
        for (file_idx, key) in call.files.iter().enumerate() {
            let table_name = format!("t{}_{}", call_idx, file_idx);
            let bytes = store
                .read(key)
                .await?
                .ok_or_else(|| FlockError::TaskFailed(format!("input object `{}` is missing", key)))?;

            let tmp = stage_bytes(&bytes)
                .map_err(|e| FlockError::TaskFailed(format!("staging `{}`: {}", key, e)))?;
            register(&ctx, &table_name, tmp.path(), call.format).await?;

            member_tables.push(table_name);
            staged.push(tmp);
        }

        let union = member_tables
            .iter()
            .map(|t| format!("SELECT * FROM {}", t))
            .collect::<Vec<_>>()
            .join(" UNION ALL ");
        rewritten.push('(');
        rewritten.push_str(&union);
        rewritten.push(')');
    }
    rewritten.push_str(&payload.query[cursor..]);

    let df = ctx
        .sql(&rewritten)
        .await
        .map_err(|e| FlockError::TaskFailed(e.to_string()))?;
    let batches = df
        .collect()
        .await
        .map_err(|e| FlockError::TaskFailed(e.to_string()))?;

    let format = FileFormat::infer(&payload.key).unwrap_or(FileFormat::Parquet);
    let bytes = encode_batches(&batches, format)?;
    let len = bytes.len();
    store.write(&payload.key, bytes).await?;
    debug!("wrote {} byte(s) to `{}`", len, payload.key);
    Ok(())
}

fn stage_bytes(bytes: &[u8]) -> std::io::Result<NamedTempFile> {
    let mut tmp = NamedTempFile::new()?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    Ok(tmp)
}

async fn register(ctx: &SessionContext, name: &str, path: &std::path::Path, format: FileFormat) -> Result<()> {
    let path = path.to_string_lossy().into_owned();
    match format {
        FileFormat::Parquet => ctx
            .register_parquet(name, &path, ParquetReadOptions::default())
            .await
            .map_err(|e| FlockError::TaskFailed(e.to_string())),
        FileFormat::JsonAuto => ctx
            .register_json(name, &path, NdJsonReadOptions::default())
            .await
            .map_err(|e| FlockError::TaskFailed(e.to_string())),
        FileFormat::CsvAuto => ctx
            .register_csv(name, &path, CsvReadOptions::new())
            .await
            .map_err(|e| FlockError::TaskFailed(e.to_string())),
    }
}

fn encode_batches(batches: &[RecordBatch], format: FileFormat) -> Result<Vec<u8>> {
    if batches.is_empty() {
        return Ok(Vec::new());
    }
    let schema = batches[0].schema();
    let mut buf = Vec::new();

    match format {
        FileFormat::Parquet => {
            let mut writer = ArrowWriter::try_new(&mut buf, schema, None)
                .map_err(|e| FlockError::TaskFailed(e.to_string()))?;
            for batch in batches {
                writer.write(batch).map_err(|e| FlockError::TaskFailed(e.to_string()))?;
            }
            writer.close().map_err(|e| FlockError::TaskFailed(e.to_string()))?;
        }
        FileFormat::CsvAuto => {
            let mut writer = CsvWriter::new(&mut buf);
            for batch in batches {
                writer.write(batch).map_err(|e| FlockError::TaskFailed(e.to_string()))?;
            }
        }
        FileFormat::JsonAuto => {
            let mut writer = LineDelimitedWriter::new(&mut buf);
            writer.write_batches(batches).map_err(|e| FlockError::TaskFailed(e.to_string()))?;
            writer.finish().map_err(|e| FlockError::TaskFailed(e.to_string()))?;
        }
    }
    Ok(buf)
}

/// One `READ_<FORMAT>([...])` occurrence found in a concrete subquery.
struct ReaderCall {
    start: usize,
    end: usize,
    format: FileFormat,
    files: Vec<String>,
}

const READER_FNS: &[(&str, FileFormat)] = &[
    ("READ_PARQUET", FileFormat::Parquet),
    ("SCAN_PARQUET", FileFormat::Parquet),
    ("READ_JSON_AUTO", FileFormat::JsonAuto),
    ("READ_CSV_AUTO", FileFormat::CsvAuto),
];

/// Find every `READER_FN([...])` call in `sql`, left to right, non-overlapping.
///
/// Implemented as direct text scanning rather than re-parsing `sql` with
/// `sqlparser`, since the array-literal argument syntax the Task Builder
/// emits (`['a', 'b']`) is not part of the dialect the planner's own parser
/// needs to understand.
fn find_reader_calls(sql: &str) -> Vec<ReaderCall> {
    let upper = sql.to_uppercase();
    let mut calls = Vec::new();
    let mut search_from = 0;

    while search_from < sql.len() {
        let next = READER_FNS
            .iter()
            .filter_map(|(name, format)| {
                upper[search_from..].find(name).map(|idx| (search_from + idx, *name, *format))
            })
            .min_by_key(|(idx, _, _)| *idx);

        let Some((start, name, format)) = next else {
            break;
        };

        let after_name = sql[start + name.len()..].trim_start();
        if !after_name.starts_with('(') {
            search_from = start + name.len();
            continue;
        }
        let open_paren = start + name.len() + (sql[start + name.len()..].len() - after_name.len());
        let Some(close_paren) = match_paren(sql, open_paren) else {
            break;
        };

        let files = extract_quoted(&sql[open_paren + 1..close_paren]);
        calls.push(ReaderCall {
            start,
            end: close_paren + 1,
            format,
            files,
        });
        search_from = close_paren + 1;
    }
    calls
}

fn match_paren(sql: &str, open_idx: usize) -> Option<usize> {
    let mut depth = 0i32;
    for (i, c) in sql.char_indices().skip(open_idx) {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn extract_quoted(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\'' {
            let mut lit = String::new();
            for c2 in chars.by_ref() {
                if c2 == '\'' {
                    break;
                }
                lit.push(c2);
            }
            out.push(lit);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_a_single_reader_call() {
        let sql = "SELECT a FROM READ_PARQUET(['s3://b/f1.parquet', 's3://b/f2.parquet']) t";
        let calls = find_reader_calls(sql);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].format, FileFormat::Parquet);
        assert_eq!(calls[0].files, vec!["s3://b/f1.parquet", "s3://b/f2.parquet"]);
    }

    #[test]
    fn finds_two_reader_calls_for_a_join() {
        let sql = "SELECT * FROM READ_PARQUET(['a']) x JOIN READ_JSON_AUTO(['b']) y ON x.id = y.id";
        let calls = find_reader_calls(sql);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].format, FileFormat::Parquet);
        assert_eq!(calls[1].format, FileFormat::JsonAuto);
    }

    #[test]
    fn no_reader_call_yields_empty() {
        assert!(find_reader_calls("SELECT 1").is_empty());
    }
}
