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

//! Flock: a distributed SQL query orchestrator that fans analytical queries
//! out to a pool of stateless worker functions running an embedded engine
//! over object-storage data lakes.
//!
//! The crate is organized around the data flow a query takes:
//!
//! SQL text -> [`query`] (parse + canonicalize) -> [`plan`] (lower to a
//! stage DAG) -> [`controller`] (walk the DAG, build and dispatch
//! [`plan::task`]s via [`dispatch`], await completion via [`bus`]) ->
//! [`dataset`] (materialize the root stage's output, read back via
//! [`blobstore`]).
//!
//! [`session`] ties the above together behind one explicit, constructed
//! value instead of a process-wide singleton: a `Session` owns a
//! [`config::FlockConfig`] plus the three provider trait objects
//! (`Dispatcher`, `CompletionBus`, `BlobStore`) and the session-scoped
//! [`cache::CacheIndex`].

pub mod blobstore;
pub mod bus;
pub mod cache;
pub mod config;
pub mod controller;
pub mod dataset;
pub mod dispatch;
pub mod error;
pub mod plan;
pub mod query;
pub mod session;
pub mod source;
pub mod worker;

pub use error::{FlockError, Result};

/// A "prelude" for users of the flock crate; like the standard library's
/// prelude, this simplifies importing of common items, but must be imported
/// manually: `use flock::prelude::*;`.
pub mod prelude {
    pub use crate::blobstore::BlobStore;
    pub use crate::bus::CompletionBus;
    pub use crate::config::FlockConfig;
    pub use crate::dataset::{Dataset, Mode};
    pub use crate::dispatch::Dispatcher;
    pub use crate::error::{FlockError, Result};
    pub use crate::query::Query;
    pub use crate::session::Session;
}
