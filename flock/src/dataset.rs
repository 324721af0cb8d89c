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

//! The result of [`crate::session::Session::sql`]: a [`Plan`] bound to the
//! [`Controller`]/[`BlobStore`] it will run against, plus the cache prefix it
//! defaults to. Execution is lazy: nothing runs until `show()` or
//! `write().save(..)` is called, either against a session-scoped cache
//! prefix or a caller-supplied destination.

use crate::blobstore::BlobStore;
use crate::controller::Controller;
use crate::error::{FlockError, Result};
use crate::plan::Plan;
use std::sync::Arc;

/// How [`DatasetWriter::save`] should treat a non-empty destination prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Re-run the plan against the existing prefix. Tasks are already
    /// content-addressed by fingerprint, so repeated writes are naturally
    /// idempotent-append: no object is ever overwritten with different
    /// bytes for the same input.
    Append,
    /// Delete every object already under the destination prefix, then run
    /// the plan.
    Overwrite,
    /// The default. Fails with [`FlockError::DatasetExists`] if the
    /// destination prefix already holds any object.
    #[default]
    Write,
}

/// A query bound to the collaborators it will run against, not yet executed.
pub struct Dataset {
    plan: Plan,
    controller: Arc<Controller>,
    store: Arc<dyn BlobStore>,
    default_prefix: String,
}

impl Dataset {
    pub(crate) fn new(
        plan: Plan,
        controller: Arc<Controller>,
        store: Arc<dyn BlobStore>,
        default_prefix: String,
    ) -> Self {
        Dataset {
            plan,
            controller,
            store,
            default_prefix,
        }
    }

    /// The query this dataset was planned from.
    pub fn sql(&self) -> &str {
        &self.plan.query.sql
    }

    /// The root stage's fingerprint-derived id.
    pub fn root_id(&self) -> &str {
        &self.plan.root_id
    }

    /// The session-scoped cache prefix `show()` executes against, absent an
    /// explicit destination.
    pub fn default_prefix(&self) -> &str {
        &self.default_prefix
    }

    async fn execute_plan(&self, prefix: &str) -> Result<Vec<String>> {
        self.controller.execute(&self.plan, prefix).await
    }

    /// Execute the plan against the default cache prefix and read back every
    /// one of the root stage's output objects, keyed by their object-store
    /// key. Mirrors `Dataset.show()`.
    pub async fn show(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let keys = self.execute_plan(&self.default_prefix).await?;
        let mut objects = Vec::with_capacity(keys.len());
        for key in keys {
            let bytes = self.store.read(&key).await?.ok_or_else(|| {
                FlockError::Internal(format!(
                    "expected output object `{}` to exist immediately after execution",
                    key
                ))
            })?;
            objects.push((key, bytes));
        }
        Ok(objects)
    }

    /// Entrypoint for materializing this dataset's output to a caller-chosen
    /// destination path, analogous to `Dataset.write`.
    pub fn write(&self) -> DatasetWriter<'_> {
        DatasetWriter {
            dataset: self,
            mode: Mode::default(),
        }
    }
}

/// Builder for materializing a [`Dataset`] at a destination path under a
/// chosen [`Mode`].
pub struct DatasetWriter<'a> {
    dataset: &'a Dataset,
    mode: Mode,
}

impl<'a> DatasetWriter<'a> {
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Materialize the dataset's output under `path`, honoring `self.mode`.
    pub async fn save(&self, path: &str) -> Result<()> {
        let path = path.trim_end_matches('/');
        let store = self.dataset.store.as_ref();
        // `BlobStore::list` matches on a raw string prefix, so narrow it to
        // the path segment rather than letting e.g. `"out"` match `"out-v2/…"`.
        let list_prefix = format!("{}/", path);

        match self.mode {
            Mode::Write => {
                if !store.list(&list_prefix).await?.is_empty() {
                    return Err(FlockError::DatasetExists(format!(
                        "destination `{}` already has objects",
                        path
                    )));
                }
            }
            Mode::Overwrite => {
                for key in store.list(&list_prefix).await? {
                    store.delete(&key).await?;
                }
            }
            Mode::Append => {}
        }

        self.dataset.execute_plan(path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::LocalBlobStore;
    use crate::bus::LocalCompletionBus;
    use crate::cache::CacheIndex;
    use crate::config::FlockConfig;
    use crate::dispatch::{Dispatcher, LocalDispatcher};
    use crate::plan;
    use crate::query::Query;

    async fn dataset_over(store: Arc<dyn BlobStore>) -> Dataset {
        let bus = Arc::new(LocalCompletionBus::new());
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(LocalDispatcher::new(store.clone(), bus.clone(), 4));
        let controller = Arc::new(Controller::new(
            store.clone(),
            dispatcher,
            bus,
            Arc::new(CacheIndex::new()),
            FlockConfig::default(),
        ));

        let q = Query::parse("SELECT a FROM READ_PARQUET('s3://b/*.parquet')").unwrap();
        let p = plan::plan(&q).unwrap();
        Dataset::new(p, controller, store, "unused".to_owned())
    }

    #[tokio::test]
    async fn write_mode_ignores_a_sibling_prefix() {
        let blob = Arc::new(LocalBlobStore::new());
        blob.write("b/f1.parquet", vec![0u8; 4]).await.unwrap();
        blob.write("out-v2/stale.parquet", vec![9]).await.unwrap();
        let store: Arc<dyn BlobStore> = blob;

        let dataset = dataset_over(store).await;
        dataset.write().mode(Mode::Write).save("out").await.unwrap();
    }

    #[tokio::test]
    async fn overwrite_mode_does_not_delete_a_sibling_prefix() {
        let blob = Arc::new(LocalBlobStore::new());
        blob.write("b/f1.parquet", vec![0u8; 4]).await.unwrap();
        blob.write("out-v2/stale.parquet", vec![9]).await.unwrap();
        let store: Arc<dyn BlobStore> = blob;

        let dataset = dataset_over(store.clone()).await;
        dataset
            .write()
            .mode(Mode::Overwrite)
            .save("out")
            .await
            .unwrap();

        assert!(store.exists("out-v2/stale.parquet").await.unwrap());
    }
}
