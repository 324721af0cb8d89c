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

//! Source Resolver (C2): given a table expression identifying an
//! object-store glob, enumerate the matching files.
//!
//! Grouping by parent directory is performed directly over the keys a
//! `BlobStore::list` call returns, since listing (not querying) is the
//! Source Resolver's only job.

use crate::blobstore::BlobStore;
use crate::error::{FlockError, Result};

/// The reader function a table expression resolves to, which in turn
/// determines the writer format a worker uses for its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Parquet,
    JsonAuto,
    CsvAuto,
}

impl FileFormat {
    pub fn reader_fn(&self) -> &'static str {
        match self {
            FileFormat::Parquet => "READ_PARQUET",
            FileFormat::JsonAuto => "READ_JSON_AUTO",
            FileFormat::CsvAuto => "READ_CSV_AUTO",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Parquet => "parquet",
            FileFormat::JsonAuto => "json",
            FileFormat::CsvAuto => "csv",
        }
    }

    /// Infer a format from a file's extension or an explicit reader function
    /// name already present in the SQL (e.g. `READ_PARQUET`, `SCAN_PARQUET`).
    pub fn infer(hint: &str) -> Option<FileFormat> {
        let hint = hint.to_lowercase();
        if hint.contains("parquet") {
            Some(FileFormat::Parquet)
        } else if hint.contains("json") {
            Some(FileFormat::JsonAuto)
        } else if hint.contains("csv") {
            Some(FileFormat::CsvAuto)
        } else {
            None
        }
    }
}

/// The recognized `s3://` glob source, split into its bucket and the glob
/// pattern within it.
#[derive(Debug, Clone)]
pub struct SourceGlob {
    pub bucket: String,
    pub pattern: String,
}

impl SourceGlob {
    /// Parse a table expression string such as `s3://bucket/2024/*.parquet`
    /// into a `SourceGlob`.
    ///
    /// Fails with [`FlockError::InvalidSource`] when the text is not a
    /// recognized `s3://` URI — the single supported object-store scheme.
    pub fn parse(expr: &str) -> Result<SourceGlob> {
        let rest = expr
            .strip_prefix("s3://")
            .or_else(|| expr.strip_prefix("s3a://"))
            .ok_or_else(|| {
                FlockError::InvalidSource(format!(
                    "`{}` is not a recognized s3:// object-store URI",
                    expr
                ))
            })?;

        let (bucket, pattern) = rest.split_once('/').unwrap_or((rest, "*"));
        if bucket.is_empty() {
            return Err(FlockError::InvalidSource(format!(
                "`{}` has no bucket name",
                expr
            )));
        }

        Ok(SourceGlob {
            bucket: bucket.to_owned(),
            pattern: pattern.to_owned(),
        })
    }

    pub fn uri(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}

/// A file matched by a glob, plus its enclosing prefix (parent "directory").
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    pub key: String,
    pub prefix: String,
}

/// Run a glob against the store and group matches by parent prefix.
///
/// Fails with [`FlockError::SourceNotFound`] when the glob yields zero
/// files.
pub async fn resolve(store: &dyn BlobStore, glob: &SourceGlob) -> Result<Vec<ResolvedFile>> {
    let literal_prefix = literal_prefix_of(&glob.pattern);
    let keys = store.list(&format!("{}/{}", glob.bucket, literal_prefix)).await?;

    let matcher = glob_to_matcher(&glob.pattern);
    let mut files: Vec<ResolvedFile> = keys
        .into_iter()
        .filter(|key| {
            let relative = key
                .strip_prefix(&format!("{}/", glob.bucket))
                .unwrap_or(key.as_str());
            matcher(relative)
        })
        .map(|key| {
            let prefix = key.rsplit_once('/').map(|(p, _)| p.to_owned()).unwrap_or_default();
            ResolvedFile { key, prefix }
        })
        .collect();

    if files.is_empty() {
        return Err(FlockError::SourceNotFound(format!(
            "no files matched `{}/{}`",
            glob.bucket, glob.pattern
        )));
    }

    files.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(files)
}

/// List of unique prefixes (one per parent directory containing a match),
/// in deterministic order.
pub fn prefixes(files: &[ResolvedFile]) -> Vec<String> {
    let mut seen = Vec::new();
    for f in files {
        if !seen.contains(&f.prefix) {
            seen.push(f.prefix.clone());
        }
    }
    seen
}

/// The portion of a glob pattern before its first wildcard, used to narrow
/// the `BlobStore::list` call.
fn literal_prefix_of(pattern: &str) -> String {
    match pattern.find(['*', '?']) {
        Some(idx) => {
            let prefix = &pattern[..idx];
            prefix.rsplit_once('/').map(|(p, _)| p.to_owned()).unwrap_or_default()
        }
        None => pattern.rsplit_once('/').map(|(p, _)| p.to_owned()).unwrap_or_default(),
    }
}

/// Compile a `*`/`?` glob pattern into a matcher closure over a relative
/// key. `*` matches any run of characters (including `/`, since prefixes
/// are flat object-store keys, not filesystem directories); `?` matches a
/// single character.
fn glob_to_matcher(pattern: &str) -> impl Fn(&str) -> bool {
    let mut regex = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            c if "\\.+^$()[]{}|".contains(c) => {
                regex.push('\\');
                regex.push(c);
            }
            c => regex.push(c),
        }
    }
    regex.push('$');

    move |candidate: &str| simple_glob_match(&regex, candidate)
}

/// A tiny, dependency-free regex-like matcher supporting only `.*` (any
/// run) and `.` (any one char), which is all `glob_to_matcher` emits.
fn simple_glob_match(anchored_pattern: &str, text: &str) -> bool {
    let pattern = anchored_pattern
        .strip_prefix('^')
        .and_then(|p| p.strip_suffix('$'))
        .unwrap_or(anchored_pattern);

    fn matches(p: &[char], t: &[char]) -> bool {
        match p {
            [] => t.is_empty(),
            ['.', '*', rest @ ..] => {
                (0..=t.len()).any(|i| matches(rest, &t[i..]))
            }
            ['.', rest @ ..] => !t.is_empty() && matches(rest, &t[1..]),
            ['\\', c, rest @ ..] => !t.is_empty() && t[0] == *c && matches(rest, &t[1..]),
            [c, rest @ ..] => !t.is_empty() && t[0] == *c && matches(rest, &t[1..]),
        }
    }

    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    matches(&p, &t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::LocalBlobStore;

    #[tokio::test]
    async fn resolve_groups_by_parent_prefix() {
        let store = LocalBlobStore::new();
        store.write("bucket/2024/01/a.parquet", vec![]).await.unwrap();
        store.write("bucket/2024/01/b.parquet", vec![]).await.unwrap();
        store.write("bucket/2024/02/c.parquet", vec![]).await.unwrap();

        let glob = SourceGlob::parse("s3://bucket/2024/*/*.parquet").unwrap();
        let files = resolve(&store, &glob).await.unwrap();
        assert_eq!(files.len(), 3);

        let mut p = prefixes(&files);
        p.sort();
        assert_eq!(p, vec!["bucket/2024/01".to_owned(), "bucket/2024/02".to_owned()]);
    }

    #[tokio::test]
    async fn empty_glob_is_source_not_found() {
        let store = LocalBlobStore::new();
        let glob = SourceGlob::parse("s3://bucket/nothing/*").unwrap();
        assert!(matches!(resolve(&store, &glob).await, Err(FlockError::SourceNotFound(_))));
    }

    #[test]
    fn rejects_non_s3_uri() {
        assert!(SourceGlob::parse("gs://bucket/*").is_err());
        assert!(SourceGlob::parse("/local/path/*").is_err());
    }

    #[test]
    fn format_infers_from_extension() {
        assert_eq!(FileFormat::infer("a.parquet"), Some(FileFormat::Parquet));
        assert_eq!(FileFormat::infer("READ_JSON_AUTO"), Some(FileFormat::JsonAuto));
        assert_eq!(FileFormat::infer("a.csv"), Some(FileFormat::CsvAuto));
        assert_eq!(FileFormat::infer("a.txt"), None);
    }
}
