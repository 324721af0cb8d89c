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

//! Argument parsing and logging setup for `flock-cli`.

use clap::{crate_version, App, AppSettings, Arg, ArgMatches};
use log::LevelFilter;

/// Build the top-level `App`. There is only one real job here — take a SQL
/// statement and a destination — so there is a single flat argument list
/// rather than a subcommand tree.
pub fn cli() -> App<'static> {
    App::new("flock")
        .version(crate_version!())
        .about("Submits one SQL statement to a Flock query orchestrator session")
        .author("UMD Database Group")
        .setting(AppSettings::DeriveDisplayOrder)
        .arg(
            Arg::new("query")
                .help("The SQL statement to execute")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("local")
                .long("local")
                .help("Run against an in-process session instead of AWS")
                .takes_value(false),
        )
        .arg(
            Arg::new("bucket")
                .long("bucket")
                .help("S3 bucket backing the BlobStore (implies an AWS session)")
                .takes_value(true),
        )
        .arg(
            Arg::new("region")
                .long("region")
                .help("AWS region for the Dispatcher/CompletionBus/BlobStore trio")
                .takes_value(true),
        )
        .arg(
            Arg::new("function-name")
                .long("function-name")
                .help("Name of the worker Lambda function (worker.function_name)")
                .takes_value(true),
        )
        .arg(
            Arg::new("queue-success")
                .long("queue-success")
                .help("Success completion queue name (bus.queue_success)")
                .takes_value(true),
        )
        .arg(
            Arg::new("queue-failure")
                .long("queue-failure")
                .help("Failure completion queue name (bus.queue_failure)")
                .takes_value(true),
        )
        .arg(
            Arg::new("warm-up")
                .long("warm-up")
                .help("Send one warm-up invocation before submitting tasks")
                .takes_value(false),
        )
        .arg(
            Arg::new("max-invocations")
                .long("max-invocations")
                .help("Scan stage fan-out ceiling: `auto` or a positive integer")
                .takes_value(true),
        )
        .arg(
            Arg::new("set")
                .long("set")
                .help("Set a `<group>.<name>=value` configuration key; may be repeated")
                .takes_value(true)
                .multiple_occurrences(true),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .help("Destination path to materialize the result to, instead of printing it")
                .takes_value(true),
        )
        .arg(
            Arg::new("mode")
                .long("mode")
                .help("Write mode for --output: write (default), overwrite, append")
                .takes_value(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase log verbosity; may be repeated")
                .takes_value(false)
                .multiple_occurrences(true),
        )
}

/// Build an `env_logger` builder at the verbosity implied by `-v`/`-vv`.
pub fn logging(matches: &ArgMatches) -> env_logger::Builder {
    let level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(level);
    builder
}
