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

//! The Controller (C5): walks a [`Plan`]'s stage DAG in dependency order,
//! building and dispatching each stage's Tasks, enforcing the session cache,
//! and coordinating completion via the CompletionBus.

use crate::blobstore::BlobStore;
use crate::bus::CompletionBus;
use crate::cache::CacheIndex;
use crate::config::{FlockConfig, MaxInvocations};
use crate::dispatch::Dispatcher;
use crate::error::{FlockError, Result};
use crate::plan::task::{self, Task};
use crate::plan::{Plan, Stage, StageKind};
use crate::source::{self, SourceGlob};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Executes a Plan against injected Dispatcher/CompletionBus/BlobStore
/// collaborators, per the explicit-`Session`-value design (no process-wide
/// singleton): every dependency this needs is passed in at construction.
pub struct Controller {
    store: Arc<dyn BlobStore>,
    dispatcher: Arc<dyn Dispatcher>,
    bus: Arc<dyn CompletionBus>,
    cache: Arc<CacheIndex>,
    config: FlockConfig,
}

impl Controller {
    pub fn new(
        store: Arc<dyn BlobStore>,
        dispatcher: Arc<dyn Dispatcher>,
        bus: Arc<dyn CompletionBus>,
        cache: Arc<CacheIndex>,
        config: FlockConfig,
    ) -> Self {
        Controller {
            store,
            dispatcher,
            bus,
            cache,
            config,
        }
    }

    /// Execute every stage of `plan` in topological order, writing outputs
    /// under `output_prefix`. Returns the root stage's output keys.
    pub async fn execute(&self, plan: &Plan, output_prefix: &str) -> Result<Vec<String>> {
        let order = plan.topological_order()?;
        info!(
            "executing plan for `{}` ({} stage(s)) under `{}`",
            plan.query.fingerprint,
            order.len(),
            output_prefix
        );
        let mut stage_outputs: HashMap<String, Vec<String>> = HashMap::new();

        for stage_id in &order {
            let stage = plan.get(stage_id).expect("topological_order returns known ids");
            debug!("executing stage `{}` ({:?})", stage.id, stage.kind);
            let outputs = self.execute_stage(stage, output_prefix, &stage_outputs).await?;
            stage_outputs.insert(stage_id.clone(), outputs);
        }

        Ok(stage_outputs.remove(&plan.root_id).unwrap_or_default())
    }

    async fn execute_stage(
        &self,
        stage: &Stage,
        output_prefix: &str,
        stage_outputs: &HashMap<String, Vec<String>>,
    ) -> Result<Vec<String>> {
        let tasks = self.build_tasks(stage, output_prefix, stage_outputs).await?;

        let now = Instant::now();
        let ttl = Duration::from_secs(self.config.session.cache_expiration_time_mins as u64 * 60);

        let mut pending: HashMap<String, Task> = HashMap::new();
        let mut outputs = Vec::with_capacity(tasks.len());

        for t in tasks {
            if self.cache.is_fresh(&t.fingerprint, ttl, now) {
                if self.store.exists(&t.output_key).await? {
                    outputs.push(t.output_key.clone());
                    continue;
                }
                // CacheInconsistency: backing object vanished. Recovered
                // locally by dropping the stale entry and re-dispatching.
                warn!("cache entry for `{}` has no backing object, re-dispatching", t.fingerprint);
                self.cache.invalidate(&t.fingerprint);
            }

            let request_id = self.dispatcher.submit(&t).await?;
            outputs.push(t.output_key.clone());
            pending.insert(request_id, t);
        }

        if pending.is_empty() {
            return Ok(outputs);
        }

        self.await_completion(&mut pending).await?;

        for t in pending.values() {
            self.cache.put(&t.fingerprint, Instant::now());
        }
        Ok(outputs)
    }

    async fn build_tasks(
        &self,
        stage: &Stage,
        output_prefix: &str,
        stage_outputs: &HashMap<String, Vec<String>>,
    ) -> Result<Vec<Task>> {
        match stage.kind {
            StageKind::Scan => {
                let binding = stage
                    .scan
                    .as_ref()
                    .ok_or_else(|| FlockError::Internal(format!("scan stage `{}` has no source binding", stage.id)))?;
                let glob_text = extract_glob(&binding.table_expr).ok_or_else(|| {
                    FlockError::InvalidSource(format!(
                        "couldn't find a source glob in `{}`",
                        binding.table_expr
                    ))
                })?;
                let glob = SourceGlob::parse(&glob_text)?;
                let resolved = source::resolve(self.store.as_ref(), &glob).await?;
                let files: Vec<String> = resolved.into_iter().map(|f| f.key).collect();

                let fan_out = self.config.session.max_invocations.resolve(files.len());
                Ok(task::build_scan_tasks(stage, output_prefix, &files, fan_out))
            }
            _ => {
                let dependency_outputs = stage
                    .dependencies
                    .iter()
                    .map(|dep_id| {
                        let files = stage_outputs.get(dep_id).cloned().unwrap_or_default();
                        (dep_id.clone(), stage.format, files)
                    })
                    .collect::<Vec<_>>();
                Ok(vec![task::build_dependent_task(stage, output_prefix, &dependency_outputs)])
            }
        }
    }

    /// Alternate success/failure polling until every pending task has
    /// reported, a reported failure short-circuits the stage, or the
    /// overall deadline expires.
    async fn await_completion(&self, pending: &mut HashMap<String, Task>) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(self.config.session.overall_timeout_secs as u64);
        let success_wait = Duration::from_secs(self.config.bus.poll_wait_success_secs as u64);
        let failure_wait = Duration::from_secs(self.config.bus.poll_wait_failure_secs as u64);
        let mut rounds_since_failure_check = 0u32;

        while !pending.is_empty() {
            if Instant::now() >= deadline {
                warn!(
                    "stage deadline expired with {} task(s) still outstanding",
                    pending.len()
                );
                self.bus.purge().await?;
                return Err(FlockError::StageTimeout(format!(
                    "{} task(s) still outstanding after {}s",
                    pending.len(),
                    self.config.session.overall_timeout_secs
                )));
            }

            let successes = self.bus.poll_success(success_wait).await?;
            let mut acked = Vec::with_capacity(successes.len());
            for msg in successes {
                if pending.remove(&msg.request_id).is_some() {
                    acked.push(msg.handle);
                }
            }
            if !acked.is_empty() {
                self.bus.ack(&acked).await?;
            }

            rounds_since_failure_check += 1;
            if rounds_since_failure_check >= self.config.bus.iterations_before_failure_check {
                rounds_since_failure_check = 0;
                let failures = self.bus.poll_failure(failure_wait).await?;
                if let Some(failure) = failures.into_iter().find(|f| pending.contains_key(&f.request_id)) {
                    warn!("task `{}` failed: {}", failure.request_id, failure.error_payload);
                    self.bus.purge().await?;
                    return Err(FlockError::TaskFailed(failure.error_payload));
                }
            }
        }
        Ok(())
    }
}

/// Pull the first single-quoted literal out of a table expression such as
/// `READ_PARQUET('s3://bucket/2024/*')`, or treat the whole expression as
/// the glob when it carries no reader-function wrapper at all.
fn extract_glob(table_expr: &str) -> Option<String> {
    match table_expr.split_once('\'') {
        Some((_, rest)) => rest.split('\'').next().map(|s| s.to_owned()),
        None => {
            let trimmed = table_expr.trim_matches(|c| c == '"' || c == '`');
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_owned())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::LocalBlobStore;
    use crate::bus::LocalCompletionBus;
    use crate::dispatch::LocalDispatcher;
    use crate::plan;
    use crate::query::Query;

    async fn seed(store: &LocalBlobStore, n: usize) {
        for i in 0..n {
            store
                .write(&format!("b/f{}.parquet", i), vec![0u8; 4])
                .await
                .unwrap();
        }
    }

    fn controller(
        store: Arc<dyn BlobStore>,
        dispatcher: Arc<dyn Dispatcher>,
        bus: Arc<dyn CompletionBus>,
    ) -> Controller {
        let mut config = FlockConfig::default();
        config.session.max_invocations = MaxInvocations::Fixed(2);
        config.bus.poll_wait_success_secs = 0;
        config.bus.poll_wait_failure_secs = 0;
        config.session.overall_timeout_secs = 5;
        Controller::new(store, dispatcher, bus, Arc::new(CacheIndex::new()), config)
    }

    #[tokio::test]
    async fn leaf_scan_dispatches_partitioned_tasks_and_completes() {
        let blob = Arc::new(LocalBlobStore::new());
        seed(&blob, 4).await;

        let bus = Arc::new(LocalCompletionBus::new());
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(LocalDispatcher::new(blob.clone(), bus.clone(), 4));
        let store: Arc<dyn BlobStore> = blob;

        let ctrl = controller(store, dispatcher, bus);
        let q = Query::parse("SELECT a FROM READ_PARQUET('s3://b/*.parquet')").unwrap();
        let p = plan::plan(&q).unwrap();

        let outputs = ctrl.execute(&p, "out").await.unwrap();
        assert_eq!(outputs.len(), 2);
    }
}
