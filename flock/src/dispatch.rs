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

//! The Dispatcher (C6): submit one task, get back an opaque request id,
//! fire-and-forget. Workers (or whatever stands in for them) report
//! completion out of band, via the CompletionBus.

use crate::bus::LocalCompletionBus;
use crate::config::WorkerConfig;
use crate::error::{FlockError, Result};
use crate::plan::task::Task;
use crate::worker::{self, WorkerPayload};
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// The remote-invocation side of task execution, abstracted over whichever
/// serverless platform backs it.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Deliver `task`'s subquery and output key to a worker. Returns
    /// immediately with a non-empty opaque request id.
    async fn submit(&self, task: &Task) -> Result<String>;

    /// Send `count` no-op warm-up invocations.
    async fn warm(&self, count: usize) -> Result<()>;

    /// Push the given worker configuration to the remote provider.
    async fn configure(&self, config: &WorkerConfig) -> Result<()>;
}

/// In-process Dispatcher used by tests and the `--local` CLI mode: runs each
/// task immediately via [`crate::worker::execute_task`] in a bounded pool of
/// spawned tasks, then posts the outcome to a [`LocalCompletionBus`] as a
/// stand-in for the worker's own out-of-band report.
pub struct LocalDispatcher {
    store: Arc<dyn crate::blobstore::BlobStore>,
    bus: Arc<LocalCompletionBus>,
    permits: Arc<Semaphore>,
    next_id: AtomicU64,
}

impl LocalDispatcher {
    pub fn new(
        store: Arc<dyn crate::blobstore::BlobStore>,
        bus: Arc<LocalCompletionBus>,
        max_concurrency: usize,
    ) -> Self {
        LocalDispatcher {
            store,
            bus,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn submit(&self, task: &Task) -> Result<String> {
        let request_id = format!("local-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let payload = WorkerPayload {
            query: task.subquery.clone(),
            key: task.output_key.clone(),
            request_id: request_id.clone(),
        };

        let store = self.store.clone();
        let bus = self.bus.clone();
        let permits = self.permits.clone();
        let rid = request_id.clone();

        debug!("submitted task `{}` -> `{}`", request_id, payload.key);
        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.expect("semaphore closed");
            match worker::execute_task(store.as_ref(), &payload).await {
                Ok(()) => bus.push_success(rid).await,
                Err(e) => {
                    warn!("task `{}` failed: {}", rid, e);
                    bus.push_failure(rid, e.to_string()).await
                }
            }
        });

        Ok(request_id)
    }

    async fn warm(&self, _count: usize) -> Result<()> {
        Ok(())
    }

    async fn configure(&self, _config: &WorkerConfig) -> Result<()> {
        Ok(())
    }
}

pub mod aws {
    //! AWS Lambda-backed Dispatcher: async invoke for task submission, plus
    //! warm-up invocations and function-configuration updates.

    use super::*;
    use crate::worker::WorkerPayload;
    use rusoto_lambda::{InvocationRequest, Lambda, LambdaClient, UpdateFunctionConfigurationRequest};

    pub struct LambdaDispatcher {
        client: LambdaClient,
        function_name: String,
        next_id: AtomicU64,
    }

    impl LambdaDispatcher {
        pub fn new(client: LambdaClient, function_name: impl Into<String>) -> Self {
            LambdaDispatcher {
                client,
                function_name: function_name.into(),
                next_id: AtomicU64::new(1),
            }
        }
    }

    #[async_trait]
    impl Dispatcher for LambdaDispatcher {
        async fn submit(&self, task: &Task) -> Result<String> {
            // The Invoke API's response carries no field AWS later reports
            // back on the success/failure queue, so this id (not AWS's own
            // request id) is what `requestPayload.request_id` lets
            // `SqsCompletionBus` correlate a message to a pending task.
            let request_id = format!(
                "{}-{}",
                self.function_name,
                self.next_id.fetch_add(1, Ordering::SeqCst)
            );
            let payload = WorkerPayload {
                query: task.subquery.clone(),
                key: task.output_key.clone(),
                request_id: request_id.clone(),
            };
            let body = serde_json::to_vec(&payload)?;

            let resp = self
                .client
                .invoke(InvocationRequest {
                    function_name: self.function_name.clone(),
                    payload: Some(body.into()),
                    invocation_type: Some("Event".to_owned()),
                    ..Default::default()
                })
                .await
                .map_err(|e| FlockError::DispatchError(e.to_string()))?;

            match resp.status_code {
                Some(202) => Ok(request_id),
                other => Err(FlockError::DispatchError(format!(
                    "lambda invoke returned unexpected status {:?}",
                    other
                ))),
            }
        }

        async fn warm(&self, count: usize) -> Result<()> {
            let warm_payload = serde_json::to_vec(&WorkerPayload {
                query: "SELECT 1".to_owned(),
                key: "/dev/null".to_owned(),
                request_id: "warmup".to_owned(),
            })?;
            for _ in 0..count {
                self.client
                    .invoke(InvocationRequest {
                        function_name: self.function_name.clone(),
                        payload: Some(warm_payload.clone().into()),
                        invocation_type: Some("Event".to_owned()),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| FlockError::DispatchError(e.to_string()))?;
            }
            Ok(())
        }

        async fn configure(&self, config: &WorkerConfig) -> Result<()> {
            self.client
                .update_function_configuration(UpdateFunctionConfigurationRequest {
                    function_name: self.function_name.clone(),
                    memory_size: Some(config.memory_size_mb as i64),
                    timeout: Some(config.timeout_secs as i64),
                    ..Default::default()
                })
                .await
                .map_err(|e| FlockError::DispatchError(e.to_string()))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::LocalBlobStore;
    use std::time::Duration;

    #[tokio::test]
    async fn submits_and_reports_success_for_a_runnable_task() {
        let store: Arc<dyn crate::blobstore::BlobStore> = Arc::new(LocalBlobStore::new());
        let bus = Arc::new(LocalCompletionBus::new());
        let dispatcher = LocalDispatcher::new(store, bus.clone(), 4);

        let task = Task {
            subquery: "SELECT 1".to_owned(),
            fingerprint: "fp".to_owned(),
            output_key: "out/fp.parquet".to_owned(),
        };

        let request_id = dispatcher.submit(&task).await.unwrap();
        assert!(!request_id.is_empty());

        // A subquery with no recognized reader call fails at `execute_task`;
        // this still exercises the submit -> spawn -> bus-report path.
        for _ in 0..20 {
            let failures = bus.poll_failure(Duration::from_millis(0)).await.unwrap();
            if !failures.is_empty() {
                assert_eq!(failures[0].request_id, request_id);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dispatched task never reported completion");
    }
}
