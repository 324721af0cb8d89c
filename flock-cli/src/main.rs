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

//! Thin CLI entrypoint: parse args, build a [`Session`], submit one query,
//! print or write the result. No planning/execution logic lives here — it
//! all lives in the `flock` crate.

mod args;

use anyhow::{anyhow, Context, Result};
use clap::ArgMatches;
use flock::config::{BusConfig, FlockConfig, WorkerConfig};
use flock::dataset::Mode;
use flock::dispatch::Dispatcher;
use flock::session::Session;
use rusoto_core::Region;
use std::str::FromStr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = args::cli().get_matches();
    args::logging(&matches).init();

    let mut config = FlockConfig::default();
    for assignment in matches.values_of("set").into_iter().flatten() {
        let (key, value) = assignment
            .split_once('=')
            .ok_or_else(|| anyhow!("`--set {}` is not a `key=value` pair", assignment))?;
        config
            .set(key, value)
            .with_context(|| format!("applying `--set {}`", assignment))?;
    }
    if let Some(n) = matches.value_of("max-invocations") {
        config
            .set("session.max_invocations", n)
            .context("applying --max-invocations")?;
    }
    config.session.verbose = matches.is_present("verbose");
    if matches.is_present("warm-up") {
        config.worker.warm_up = true;
    }

    let session = build_session(&matches, config)
        .await
        .context("building a Flock session")?;

    let query = matches
        .value_of("query")
        .ok_or_else(|| anyhow!("a SQL query is required"))?;

    let dataset = session.sql(query).context("planning the query")?;

    match matches.value_of("output") {
        Some(path) => {
            let mode = match matches.value_of("mode").unwrap_or("write") {
                "append" => Mode::Append,
                "overwrite" => Mode::Overwrite,
                "write" => Mode::Write,
                other => return Err(anyhow!("unknown --mode `{}`", other)),
            };
            dataset
                .write()
                .mode(mode)
                .save(path)
                .await
                .with_context(|| format!("writing dataset to `{}`", path))?;
            println!("wrote dataset for stage `{}` to {}", dataset.root_id(), path);
        }
        None => {
            let objects = dataset.show().await.context("executing the query")?;
            for (key, bytes) in &objects {
                println!("{}\t{} bytes", key, bytes.len());
            }
            println!("{} output object(s)", objects.len());
        }
    }

    Ok(())
}

/// Build a [`Session`] from CLI flags: an in-process local session unless
/// `--bucket` names an S3 destination, in which case the AWS-backed
/// Dispatcher/CompletionBus/BlobStore trio is wired up.
async fn build_session(matches: &ArgMatches, config: FlockConfig) -> Result<Session> {
    let bucket = matches.value_of("bucket");
    if matches.is_present("local") || bucket.is_none() {
        return Ok(Session::local(config));
    }
    let bucket = bucket.unwrap().to_owned();

    let region = matches
        .value_of("region")
        .map(Region::from_str)
        .transpose()
        .context("parsing --region")?
        .unwrap_or(Region::UsEast1);

    let worker = WorkerConfig {
        function_name: matches
            .value_of("function-name")
            .unwrap_or(&config.worker.function_name)
            .to_owned(),
        ..config.worker.clone()
    };
    let bus_config = BusConfig {
        queue_success: matches
            .value_of("queue-success")
            .unwrap_or(&config.bus.queue_success)
            .to_owned(),
        queue_failure: matches
            .value_of("queue-failure")
            .unwrap_or(&config.bus.queue_failure)
            .to_owned(),
        ..config.bus.clone()
    };

    let store = Arc::new(flock::blobstore::aws::S3BlobStore::new(
        rusoto_s3::S3Client::new(region.clone()),
        bucket,
    ));
    let dispatcher = Arc::new(flock::dispatch::aws::LambdaDispatcher::new(
        rusoto_lambda::LambdaClient::new(region.clone()),
        worker.function_name.clone(),
    ));
    let bus = Arc::new(flock::bus::aws::SqsCompletionBus::new(
        rusoto_sqs::SqsClient::new(region),
        bus_config.clone(),
    ));

    let mut config = config;
    config.worker = worker;
    config.bus = bus_config;

    if config.worker.warm_up {
        dispatcher.warm(1).await.context("warming up the worker function")?;
    }

    Ok(Session::new(config, store, dispatcher, bus))
}
