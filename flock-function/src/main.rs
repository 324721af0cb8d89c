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

//! The worker side of task execution, deployed as one AWS Lambda function per
//! `worker.function_name`. Every invocation carries a single
//! [`flock::worker::WorkerPayload`]; this binary's only job is running it
//! against the embedded engine and writing the result to S3.
//!
//! Success and failure reporting back to the Controller happens entirely
//! through AWS's own asynchronous-invocation destination configuration: the
//! success/failure queues named by `bus.queue_success`/`bus.queue_failure`
//! are configured as the function's `OnSuccess`/`OnFailure` destinations, and
//! the envelope AWS puts on those queues already carries the
//! `requestPayload.request_id` / `responsePayload.errorMessage` shape
//! `flock::bus::aws::SqsCompletionBus` parses. This binary never talks to SQS
//! directly.

use flock::blobstore::aws::S3BlobStore;
use flock::worker::{self, WorkerPayload};
use flock::FlockError;
use lambda::{handler_fn, Context};
use rusoto_core::Region;
use rusoto_s3::S3Client;
use serde_json::Value;
use std::error::Error;
use std::str::FromStr;

const BUCKET_ENV: &str = "FLOCK_S3_BUCKET";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync + 'static>> {
    env_logger::init();
    lambda::run(handler_fn(handler)).await?;
    Ok(())
}

async fn handler(payload: WorkerPayload, _: Context) -> Result<Value, FlockError> {
    let bucket = std::env::var(BUCKET_ENV)
        .map_err(|_| FlockError::ConfigError(format!("`{}` is not set", BUCKET_ENV)))?;
    let region = std::env::var("AWS_REGION")
        .ok()
        .and_then(|r| Region::from_str(&r).ok())
        .unwrap_or(Region::UsEast1);

    let store = S3BlobStore::new(S3Client::new(region), bucket);
    worker::execute_task(&store, &payload).await?;

    Ok(Value::Null)
}
