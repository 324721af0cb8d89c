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

//! Flock error types.

use std::error;
use std::fmt::{Display, Formatter};
use std::io;
use std::result;

use sqlparser::parser::ParserError;

/// Result type for operations that could result in a [`FlockError`].
pub type Result<T> = result::Result<T, FlockError>;

/// Crate-wide error type.
///
/// Variants map directly onto the error taxonomy of the query orchestrator:
/// the first six are raised by a specific component and are fatal for the
/// query or stage that raised them; `CacheInconsistency` is the only
/// internally recovered condition (the caller invalidates the entry and
/// re-dispatches the task). The remaining variants wrap errors from ambient
/// dependencies so that `?` can be used throughout without losing context.
#[derive(Debug)]
pub enum FlockError {
    /// Raised by the parser/canonicalizer when SQL text cannot be parsed.
    ParseError(String),
    /// Raised by the planner when a construct cannot be lowered to a stage
    /// (e.g. a top-level UNION, or more than one expression in FROM).
    UnsupportedDialect(String),
    /// Raised by the source resolver when a table expression cannot be
    /// recognized as a supported object-store URI.
    InvalidSource(String),
    /// Raised by the source resolver when a glob yields zero files.
    SourceNotFound(String),
    /// Raised when a configuration key is unknown or its value is out of
    /// range.
    ConfigError(String),
    /// Raised by the Dispatcher on a transport or worker-rejection failure.
    DispatchError(String),
    /// Raised by the Controller when a worker reports a task failure. Carries
    /// the raw worker-reported error payload.
    TaskFailed(String),
    /// Raised by the Controller when a stage's overall deadline expires.
    StageTimeout(String),
    /// A cache hit whose backing object is missing. Recovered internally by
    /// invalidating the entry and re-dispatching the task.
    CacheInconsistency(String),
    /// Raised at write time when `Mode::Write` is requested against a
    /// non-empty destination.
    DatasetExists(String),
    /// Error associated with I/O operations.
    Io(io::Error),
    /// Error returned when `sqlparser` fails on syntactically invalid SQL.
    Sql(ParserError),
    /// Error returned when Arrow is unexpectedly executed.
    Arrow(datafusion::arrow::error::ArrowError),
    /// Error returned when DataFusion is unexpectedly executed. Only
    /// surfaced from the worker binary, which owns the embedded engine.
    DataFusion(datafusion::error::DataFusionError),
    /// Error returned when serde_json fails to serialize or deserialize data.
    SerdeJson(serde_json::Error),
    /// Error returned as a consequence of an invariant violation. This error
    /// should not happen in normal usage of Flock; it indicates a bug.
    Internal(String),
}

impl From<io::Error> for FlockError {
    fn from(e: io::Error) -> Self {
        FlockError::Io(e)
    }
}

impl From<ParserError> for FlockError {
    fn from(e: ParserError) -> Self {
        FlockError::Sql(e)
    }
}

impl From<datafusion::arrow::error::ArrowError> for FlockError {
    fn from(e: datafusion::arrow::error::ArrowError) -> Self {
        FlockError::Arrow(e)
    }
}

impl From<datafusion::error::DataFusionError> for FlockError {
    fn from(e: datafusion::error::DataFusionError) -> Self {
        FlockError::DataFusion(e)
    }
}

impl From<serde_json::Error> for FlockError {
    fn from(e: serde_json::Error) -> Self {
        FlockError::SerdeJson(e)
    }
}

impl Display for FlockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FlockError::ParseError(d) => write!(f, "parse error: {}", d),
            FlockError::UnsupportedDialect(d) => write!(f, "unsupported dialect: {}", d),
            FlockError::InvalidSource(d) => write!(f, "invalid source: {}", d),
            FlockError::SourceNotFound(d) => write!(f, "source not found: {}", d),
            FlockError::ConfigError(d) => write!(f, "configuration error: {}", d),
            FlockError::DispatchError(d) => write!(f, "dispatch error: {}", d),
            FlockError::TaskFailed(d) => write!(f, "task failed: {}", d),
            FlockError::StageTimeout(d) => write!(f, "stage timeout: {}", d),
            FlockError::CacheInconsistency(d) => write!(f, "cache inconsistency: {}", d),
            FlockError::DatasetExists(d) => write!(f, "dataset already exists: {}", d),
            FlockError::Io(d) => write!(f, "IO error: {}", d),
            FlockError::Sql(d) => write!(f, "SQL error: {:?}", d),
            FlockError::Arrow(d) => write!(f, "Arrow error: {}", d),
            FlockError::DataFusion(d) => write!(f, "DataFusion error: {:?}", d),
            FlockError::SerdeJson(d) => write!(f, "serde_json error: {:?}", d),
            FlockError::Internal(d) => write!(
                f,
                "internal error: {}. This was likely caused by a bug in Flock's code, \
                 please file a bug report.",
                d
            ),
        }
    }
}

impl error::Error for FlockError {}
