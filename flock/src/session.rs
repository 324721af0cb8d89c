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

//! An explicit, constructed `Session` rather than a process-wide
//! configuration singleton: every component that needs configuration or a
//! provider collaborator gets it passed in at construction.
//!
//! A `Session` owns a [`FlockConfig`] plus the three provider trait objects
//! (`Dispatcher`, `CompletionBus`, `BlobStore`) and the session-scoped
//! [`CacheIndex`]; every query submitted through it shares the same cache and
//! the same provider wiring.

use crate::blobstore::{BlobStore, LocalBlobStore};
use crate::bus::{CompletionBus, LocalCompletionBus};
use crate::cache::CacheIndex;
use crate::config::FlockConfig;
use crate::controller::Controller;
use crate::dataset::Dataset;
use crate::dispatch::{Dispatcher, LocalDispatcher};
use crate::error::Result;
use crate::plan;
use crate::query::Query;
use std::sync::Arc;

/// Entrypoint to a session against a pool of worker functions.
///
/// Construct one with [`Session::new`] (explicit collaborators, e.g. the AWS
/// `LambdaDispatcher`/`SqsCompletionBus`/`S3BlobStore` trio) or
/// [`Session::local`] (an in-process pool suitable for tests and the
/// `flock-cli --local` mode).
pub struct Session {
    config: FlockConfig,
    store: Arc<dyn BlobStore>,
    controller: Arc<Controller>,
}

impl Session {
    /// Build a session from explicit collaborators. No component reads
    /// global state; everything this session needs is passed in here.
    pub fn new(
        config: FlockConfig,
        store: Arc<dyn BlobStore>,
        dispatcher: Arc<dyn Dispatcher>,
        bus: Arc<dyn CompletionBus>,
    ) -> Self {
        let cache = Arc::new(CacheIndex::new());
        let controller = Arc::new(Controller::new(
            store.clone(),
            dispatcher,
            bus,
            cache,
            config.clone(),
        ));
        Session {
            config,
            store,
            controller,
        }
    }

    /// An in-process session: an in-memory `BlobStore`, a `tokio::spawn`
    /// pool standing in for worker invocations, and an in-memory completion
    /// bus. Used by the test suite and by `flock-cli`'s `--local` mode.
    pub fn local(config: FlockConfig) -> Self {
        let store: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new());
        let bus = Arc::new(LocalCompletionBus::new());
        let concurrency = match config.session.max_invocations {
            crate::config::MaxInvocations::Fixed(n) => n,
            crate::config::MaxInvocations::Auto => 16,
        };
        let dispatcher: Arc<dyn Dispatcher> =
            Arc::new(LocalDispatcher::new(store.clone(), bus.clone(), concurrency));
        Session::new(config, store, dispatcher, bus as Arc<dyn CompletionBus>)
    }

    pub fn config(&self) -> &FlockConfig {
        &self.config
    }

    /// Set a single `<group>.<name>` configuration key for the rest of this
    /// session's lifetime. Does not retroactively affect a `Dataset` already
    /// returned by `sql`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.config.set(key, value)
    }

    /// Parse and plan `sql`, returning a [`Dataset`] bound to this session's
    /// collaborators. The plan is not executed until the `Dataset` is
    /// consumed (`show()` or `write().save(..)`).
    pub fn sql(&self, sql: &str) -> Result<Dataset> {
        let query = Query::parse(sql)?;
        let plan = plan::plan(&query)?;
        let default_prefix = self.default_prefix(&query);
        Ok(Dataset::new(
            plan,
            self.controller.clone(),
            self.store.clone(),
            default_prefix,
        ))
    }

    /// Parse, plan, and immediately execute `sql` against the session cache
    /// prefix, returning every output object.
    pub async fn execute(&self, sql: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.sql(sql)?.show().await
    }

    /// The per-query cache prefix `Dataset::show` materializes to, absent an
    /// explicit destination: `<provider id>/flock-cache/<fingerprint>`.
    fn default_prefix(&self, query: &Query) -> String {
        format!(
            "{}/flock-cache/{}",
            self.config.session.provider_id, query.fingerprint
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_session_executes_a_leaf_scan() {
        let session = Session::local(FlockConfig::default());
        let store = session.store.clone();
        store
            .write("b/f1.parquet", vec![0u8; 4])
            .await
            .unwrap();
        store
            .write("b/f2.parquet", vec![0u8; 4])
            .await
            .unwrap();

        let dataset = session
            .sql("SELECT a FROM READ_PARQUET('s3://b/*.parquet')")
            .unwrap();
        let objects = dataset.show().await.unwrap();
        assert!(!objects.is_empty());
    }

    #[tokio::test]
    async fn repeated_sql_on_the_same_session_shares_the_cache() {
        let session = Session::local(FlockConfig::default());
        session
            .store
            .write("b/f1.parquet", vec![0u8; 4])
            .await
            .unwrap();

        let first = session
            .sql("SELECT a FROM READ_PARQUET('s3://b/*.parquet')")
            .unwrap()
            .show()
            .await
            .unwrap();
        let second = session
            .sql("SELECT a FROM READ_PARQUET('s3://b/*.parquet')")
            .unwrap()
            .show()
            .await
            .unwrap();

        assert_eq!(first.len(), second.len());
    }
}
