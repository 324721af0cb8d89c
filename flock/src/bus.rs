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

//! The CompletionBus is the out-of-band success/failure message channel
//! between workers and the Controller. It is polled, never pushed to, by the
//! Controller; workers (or, in the local/test case, the Dispatcher standing
//! in for them) are the producers.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;

/// An opaque handle to a polled message; must be passed back to `ack` to
/// avoid redelivery.
#[derive(Debug, Clone)]
pub struct MessageHandle(pub String);

/// A successfully completed task, as reported by a worker.
#[derive(Debug, Clone)]
pub struct SuccessMessage {
    pub request_id: String,
    pub handle: MessageHandle,
}

/// A failed task, as reported by a worker. `error_payload` is the raw
/// worker-origin error string.
#[derive(Debug, Clone)]
pub struct FailureMessage {
    pub request_id: String,
    pub error_payload: String,
    pub handle: MessageHandle,
}

/// The out-of-band success/failure message channel consumed by the
/// Controller.
#[async_trait]
pub trait CompletionBus: Send + Sync {
    /// Poll the success queue, waiting up to `max_wait` for at least one
    /// message (bounded wait; may return empty).
    async fn poll_success(&self, max_wait: Duration) -> Result<Vec<SuccessMessage>>;

    /// Poll the failure queue, waiting up to `max_wait`.
    async fn poll_failure(&self, max_wait: Duration) -> Result<Vec<FailureMessage>>;

    /// Batch-acknowledge (delete) the given handles.
    async fn ack(&self, handles: &[MessageHandle]) -> Result<()>;

    /// Discard all pending messages on both queues. Used after a stage fails
    /// to prevent stale failure messages from leaking into a later stage.
    async fn purge(&self) -> Result<()>;
}

/// An in-memory success/failure bus used by [`crate::dispatch::LocalDispatcher`]
/// and the test suite. Workers (here, the local dispatcher standing in for
/// them) push onto it directly with [`LocalCompletionBus::push_success`] /
/// [`LocalCompletionBus::push_failure`]; acknowledgement just drains the
/// matching entries.
#[derive(Default)]
pub struct LocalCompletionBus {
    success: Mutex<VecDeque<SuccessMessage>>,
    failure: Mutex<VecDeque<FailureMessage>>,
}

impl LocalCompletionBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_success(&self, request_id: String) {
        let handle = MessageHandle(request_id.clone());
        self.success.lock().await.push_back(SuccessMessage {
            request_id,
            handle,
        });
    }

    pub async fn push_failure(&self, request_id: String, error_payload: String) {
        let handle = MessageHandle(request_id.clone());
        self.failure.lock().await.push_back(FailureMessage {
            request_id,
            error_payload,
            handle,
        });
    }
}

#[async_trait]
impl CompletionBus for LocalCompletionBus {
    async fn poll_success(&self, _max_wait: Duration) -> Result<Vec<SuccessMessage>> {
        let mut q = self.success.lock().await;
        Ok(q.drain(..).collect())
    }

    async fn poll_failure(&self, _max_wait: Duration) -> Result<Vec<FailureMessage>> {
        let mut q = self.failure.lock().await;
        Ok(q.drain(..).collect())
    }

    async fn ack(&self, _handles: &[MessageHandle]) -> Result<()> {
        // Entries were already removed from the queues at poll time.
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        self.success.lock().await.clear();
        self.failure.lock().await.clear();
        Ok(())
    }
}

pub mod aws {
    //! AWS SQS-backed `CompletionBus`: two queues polled for success/failure
    //! messages, acknowledged by deleting the consumed receipts.

    use super::*;
    use crate::config::BusConfig;
    use crate::error::FlockError;
    use rusoto_sqs::{
        DeleteMessageBatchRequest, DeleteMessageBatchRequestEntry, Message,
        PurgeQueueRequest, ReceiveMessageRequest, Sqs, SqsClient,
    };
    use serde_json::Value;

    /// Completion bus backed by two AWS SQS queues.
    pub struct SqsCompletionBus {
        client: SqsClient,
        config: BusConfig,
    }

    impl SqsCompletionBus {
        pub fn new(client: SqsClient, config: BusConfig) -> Self {
            SqsCompletionBus { client, config }
        }

        fn parse_message(message: &Message, want_error: bool) -> Result<(String, String, String)> {
            let body = message
                .body
                .as_ref()
                .ok_or_else(|| FlockError::DispatchError("SQS message has no body".to_owned()))?;
            let body: Value = serde_json::from_str(body)?;

            // AWS Lambda Destinations echoes the original invocation payload
            // back verbatim under `requestPayload`; the Dispatcher's own
            // correlation id travels there as `request_id`, since AWS's own
            // `requestContext.requestId` for this invocation was never
            // observable at invoke time.
            let request_id = body
                .get("requestPayload")
                .and_then(|p| p.get("request_id"))
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    FlockError::DispatchError("SQS message missing requestPayload.request_id".to_owned())
                })?
                .to_owned();

            let error_payload = if want_error {
                body.get("responsePayload")
                    .and_then(|p| p.get("errorMessage"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_owned()
            } else {
                String::new()
            };

            let receipt_handle = message.receipt_handle.clone().unwrap_or_default();
            Ok((request_id, error_payload, receipt_handle))
        }
    }

    #[async_trait]
    impl CompletionBus for SqsCompletionBus {
        async fn poll_success(&self, max_wait: Duration) -> Result<Vec<SuccessMessage>> {
            let resp = self
                .client
                .receive_message(ReceiveMessageRequest {
                    queue_url: self.config.queue_success.clone(),
                    max_number_of_messages: Some(self.config.max_number_of_messages as i64),
                    visibility_timeout: Some(self.config.visibility_timeout_secs as i64),
                    wait_time_seconds: Some(max_wait.as_secs().min(20) as i64),
                    ..Default::default()
                })
                .await
                .map_err(|e| FlockError::DispatchError(e.to_string()))?;

            resp.messages
                .unwrap_or_default()
                .iter()
                .map(|m| {
                    let (request_id, _, receipt_handle) = Self::parse_message(m, false)?;
                    Ok(SuccessMessage {
                        request_id,
                        handle: MessageHandle(receipt_handle),
                    })
                })
                .collect()
        }

        async fn poll_failure(&self, max_wait: Duration) -> Result<Vec<FailureMessage>> {
            let resp = self
                .client
                .receive_message(ReceiveMessageRequest {
                    queue_url: self.config.queue_failure.clone(),
                    max_number_of_messages: Some(self.config.max_number_of_messages as i64),
                    visibility_timeout: Some(self.config.visibility_timeout_secs as i64),
                    wait_time_seconds: Some(max_wait.as_secs().min(20) as i64),
                    ..Default::default()
                })
                .await
                .map_err(|e| FlockError::DispatchError(e.to_string()))?;

            resp.messages
                .unwrap_or_default()
                .iter()
                .map(|m| {
                    let (request_id, error_payload, receipt_handle) = Self::parse_message(m, true)?;
                    Ok(FailureMessage {
                        request_id,
                        error_payload,
                        handle: MessageHandle(receipt_handle),
                    })
                })
                .collect()
        }

        async fn ack(&self, handles: &[MessageHandle]) -> Result<()> {
            if handles.is_empty() {
                return Ok(());
            }
            let entries = handles
                .iter()
                .enumerate()
                .map(|(i, h)| DeleteMessageBatchRequestEntry {
                    id: i.to_string(),
                    receipt_handle: h.0.clone(),
                })
                .collect();

            self.client
                .delete_message_batch(DeleteMessageBatchRequest {
                    queue_url: self.config.queue_success.clone(),
                    entries,
                })
                .await
                .map_err(|e| FlockError::DispatchError(e.to_string()))?;
            Ok(())
        }

        async fn purge(&self) -> Result<()> {
            for queue_url in [&self.config.queue_success, &self.config.queue_failure] {
                self.client
                    .purge_queue(PurgeQueueRequest {
                        queue_url: queue_url.clone(),
                    })
                    .await
                    .map_err(|e| FlockError::DispatchError(e.to_string()))?;
            }
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parse_message_reads_the_dispatcher_id_from_request_payload() {
            let message = Message {
                body: Some(
                    serde_json::json!({
                        "requestContext": {"requestId": "aws-internal-id", "condition": "Success"},
                        "requestPayload": {"query": "SELECT 1", "key": "out/a.parquet", "request_id": "FlockExecutor-7"},
                        "responsePayload": null
                    })
                    .to_string(),
                ),
                receipt_handle: Some("handle-1".to_owned()),
                ..Default::default()
            };

            let (request_id, _, receipt_handle) =
                SqsCompletionBus::parse_message(&message, false).unwrap();
            assert_eq!(request_id, "FlockExecutor-7");
            assert_eq!(receipt_handle, "handle-1");
        }

        #[test]
        fn parse_message_extracts_the_error_message_on_failure() {
            let message = Message {
                body: Some(
                    serde_json::json!({
                        "requestContext": {"requestId": "aws-internal-id", "condition": "RetriesExhausted"},
                        "requestPayload": {"query": "SELECT 1", "key": "out/a.parquet", "request_id": "FlockExecutor-8"},
                        "responsePayload": {"errorMessage": "boom", "errorType": "TaskFailed"}
                    })
                    .to_string(),
                ),
                receipt_handle: Some("handle-2".to_owned()),
                ..Default::default()
            };

            let (request_id, error_payload, _) =
                SqsCompletionBus::parse_message(&message, true).unwrap();
            assert_eq!(request_id, "FlockExecutor-8");
            assert_eq!(error_payload, "boom");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_poll_drains_queue() {
        let bus = LocalCompletionBus::new();
        bus.push_success("r1".to_owned()).await;
        bus.push_success("r2".to_owned()).await;

        let msgs = bus.poll_success(Duration::from_secs(0)).await.unwrap();
        assert_eq!(msgs.len(), 2);

        let msgs = bus.poll_success(Duration::from_secs(0)).await.unwrap();
        assert!(msgs.is_empty());
    }

    #[tokio::test]
    async fn purge_clears_both_queues() {
        let bus = LocalCompletionBus::new();
        bus.push_success("r1".to_owned()).await;
        bus.push_failure("r2".to_owned(), "boom".to_owned()).await;

        bus.purge().await.unwrap();

        assert!(bus.poll_success(Duration::from_secs(0)).await.unwrap().is_empty());
        assert!(bus.poll_failure(Duration::from_secs(0)).await.unwrap().is_empty());
    }
}
