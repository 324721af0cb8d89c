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

//! The Task Builder (C4): given a stage and its concrete input, chunk it and
//! produce one self-contained subquery per chunk.
//!
//! Scan stages are partitionable and go through [`build_scan_tasks`]; every
//! other kind is single-task (fan-out 1) and goes through
//! [`build_dependent_task`], which substitutes each dependency's own output
//! files independently rather than globbing every dependency's outputs
//! together into one shared file list.

use super::Stage;
use crate::query;
use crate::source::FileFormat;

/// An atomic unit of work bound to a single worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub subquery: String,
    pub fingerprint: String,
    pub output_key: String,
}

/// Split `n` items into `k` contiguous, near-equal buckets: the first
/// `n mod k` buckets get `⌈n/k⌉` items, the rest get `⌊n/k⌋`. `k` is clamped
/// to `n` so no bucket is ever empty.
pub fn balanced_split<T: Clone>(items: &[T], k: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    let k = k.max(1).min(items.len());
    let n = items.len();
    let base = n / k;
    let remainder = n % k;

    let mut chunks = Vec::with_capacity(k);
    let mut start = 0;
    for i in 0..k {
        let size = base + if i < remainder { 1 } else { 0 };
        chunks.push(items[start..start + size].to_vec());
        start += size;
    }
    chunks
}

fn output_key_for(output_prefix: &str, fingerprint: &str, format: FileFormat) -> String {
    format!(
        "{}/{}.{}",
        output_prefix.trim_end_matches('/'),
        fingerprint,
        format.extension()
    )
}

fn reader_call(format: FileFormat, files: &[String]) -> String {
    let quoted: Vec<String> = files.iter().map(|f| format!("'{}'", f)).collect();
    format!("{}([{}])", format.reader_fn(), quoted.join(", "))
}

/// Build every Task for a Scan `stage`, chunking its resolved source files
/// into `k` buckets and rewriting each chunk's copy of `stage.sub_sql` to
/// read that chunk via the stage's reader format.
pub fn build_scan_tasks(stage: &Stage, output_prefix: &str, files: &[String], k: usize) -> Vec<Task> {
    let binding = match &stage.scan {
        Some(b) => b,
        None => return Vec::new(),
    };

    balanced_split(files, k)
        .into_iter()
        .map(|chunk| {
            let reader = reader_call(stage.format, &chunk);
            let subquery = stage.sub_sql.replacen(&binding.table_expr, &reader, 1);
            let fingerprint = query::fingerprint(&subquery);
            Task {
                output_key: output_key_for(output_prefix, &fingerprint, stage.format),
                fingerprint,
                subquery,
            }
        })
        .collect()
}

/// Build the single Task for a non-Scan stage. `dependency_outputs` gives,
/// for each of the stage's dependencies, the format its outputs were written
/// in and the full list of its output keys; each is substituted for that
/// dependency's placeholder identifier independently.
pub fn build_dependent_task(
    stage: &Stage,
    output_prefix: &str,
    dependency_outputs: &[(String, FileFormat, Vec<String>)],
) -> Task {
    let mut subquery = stage.sub_sql.clone();
    for (dep_id, dep_format, files) in dependency_outputs {
        let reader = reader_call(*dep_format, files);
        subquery = replace_identifier(&subquery, dep_id, &reader);
    }
    let fingerprint = query::fingerprint(&subquery);
    Task {
        output_key: output_key_for(output_prefix, &fingerprint, stage.format),
        fingerprint,
        subquery,
    }
}

/// Replace a bare identifier `ident` in `sql`, matched on word boundaries so
/// e.g. `s1` is not replaced inside `s10`.
fn replace_identifier(sql: &str, ident: &str, replacement: &str) -> String {
    if ident.is_empty() {
        return sql.to_owned();
    }
    let is_boundary = |c: Option<char>| !matches!(c, Some(c) if c.is_alphanumeric() || c == '_');

    let chars: Vec<char> = sql.chars().collect();
    let ident_chars: Vec<char> = ident.chars().collect();
    let mut out = String::with_capacity(sql.len());

    let mut i = 0;
    while i < chars.len() {
        if chars[i..].starts_with(ident_chars.as_slice())
            && is_boundary(if i == 0 { None } else { Some(chars[i - 1]) })
            && is_boundary(chars.get(i + ident_chars.len()).copied())
        {
            out.push_str(replacement);
            i += ident_chars.len();
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ScanBinding, Stage, StageKind};

    fn scan_stage(sub_sql: &str, table_expr: &str) -> Stage {
        Stage {
            id: "s1".to_owned(),
            kind: StageKind::Scan,
            sub_sql: sub_sql.to_owned(),
            alias: None,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            scan: Some(ScanBinding {
                table_expr: table_expr.to_owned(),
                format: FileFormat::Parquet,
            }),
            format: FileFormat::Parquet,
        }
    }

    #[test]
    fn balanced_split_matches_the_unbalanced_partitioning_scenario() {
        let files: Vec<String> = (1..=7).map(|i| format!("f{}", i)).collect();
        let chunks = balanced_split(&files, 3);
        let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![3, 2, 2]);

        let flattened: Vec<String> = chunks.into_iter().flatten().collect();
        assert_eq!(flattened, files);
    }

    #[test]
    fn balanced_split_clamps_k_to_input_len() {
        let files = vec!["a".to_owned(), "b".to_owned()];
        let chunks = balanced_split(&files, 10);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn balanced_split_of_empty_input_is_empty() {
        let files: Vec<String> = Vec::new();
        assert!(balanced_split(&files, 4).is_empty());
    }

    #[test]
    fn leaf_scan_two_partitions_yields_two_tasks_with_distinct_fingerprints() {
        let stage = scan_stage(
            "SELECT a FROM READ_PARQUET('s3://b/*')",
            "READ_PARQUET('s3://b/*')",
        );
        let files: Vec<String> = (1..=4).map(|i| format!("b/f{}.parquet", i)).collect();
        let tasks = build_scan_tasks(&stage, "out", &files, 2);

        assert_eq!(tasks.len(), 2);
        assert_ne!(tasks[0].fingerprint, tasks[1].fingerprint);
        for t in &tasks {
            assert_eq!(t.output_key, format!("out/{}.parquet", t.fingerprint));
        }
    }

    #[test]
    fn same_subquery_text_yields_the_same_fingerprint() {
        let stage = scan_stage(
            "SELECT a FROM READ_PARQUET('s3://b/*')",
            "READ_PARQUET('s3://b/*')",
        );
        let files = vec!["b/f1.parquet".to_owned(), "b/f2.parquet".to_owned()];
        let tasks1 = build_scan_tasks(&stage, "out", &files, 1);
        let tasks2 = build_scan_tasks(&stage, "out", &files, 1);
        assert_eq!(tasks1, tasks2);
    }

    #[test]
    fn dependent_task_substitutes_each_dependency_independently() {
        let stage = Stage {
            id: "r1".to_owned(),
            kind: StageKind::Join,
            sub_sql: "SELECT * FROM s_left JOIN s_right ON s_left.id = s_right.id".to_owned(),
            alias: None,
            dependencies: vec!["s_left".to_owned(), "s_right".to_owned()],
            dependents: Vec::new(),
            scan: None,
            format: FileFormat::Parquet,
        };
        let deps = vec![
            (
                "s_left".to_owned(),
                FileFormat::Parquet,
                vec!["out/left1.parquet".to_owned()],
            ),
            (
                "s_right".to_owned(),
                FileFormat::Parquet,
                vec!["out/right1.parquet".to_owned()],
            ),
        ];
        let task = build_dependent_task(&stage, "out", &deps);
        assert!(task.subquery.contains("READ_PARQUET(['out/left1.parquet'])"));
        assert!(task.subquery.contains("READ_PARQUET(['out/right1.parquet'])"));
        assert!(!task.subquery.contains("s_left"));
        assert!(!task.subquery.contains("s_right"));
    }

    #[test]
    fn identifier_replacement_respects_word_boundaries() {
        let sql = "SELECT * FROM s1 JOIN s10 ON s1.id = s10.id";
        let out = replace_identifier(sql, "s1", "REPL");
        assert_eq!(out, "SELECT * FROM REPL JOIN s10 ON REPL.id = s10.id");
    }
}
