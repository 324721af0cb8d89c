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

//! Session configuration.
//!
//! The configuration surface is a nested key-value set exposed as
//! `<group>.<name>` (worker / bus / session / engine). Rather than a single
//! reflective map that re-validates on every `__setattr__` (as the system
//! this crate replaces did), each group is its own typed, `Default`-able
//! struct with a per-field validator, and an explicit `apply()` that pushes
//! the group's settings to the remote provider.

use crate::dispatch::Dispatcher;
use crate::error::{FlockError, Result};

/// Either a fixed fan-out, or "auto" (fan-out equals the number of input
/// partitions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxInvocations {
    Auto,
    Fixed(usize),
}

impl MaxInvocations {
    /// Resolve against the number of partitionable inputs available to a
    /// Scan stage.
    pub fn resolve(&self, input_count: usize) -> usize {
        match self {
            MaxInvocations::Auto => input_count,
            MaxInvocations::Fixed(n) => (*n).min(input_count.max(1)),
        }
    }
}

/// `worker.*` — the serverless function backing the Dispatcher.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub function_name: String,
    pub memory_size_mb: u32,
    pub timeout_secs: u32,
    pub warm_up: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            function_name: "FlockExecutor".to_owned(),
            memory_size_mb: 128,
            timeout_secs: 30,
            warm_up: false,
        }
    }
}

impl WorkerConfig {
    pub fn set_memory_size_mb(&mut self, value: u32) -> Result<()> {
        if !(128..=10_240).contains(&value) {
            return Err(FlockError::ConfigError(
                "`worker.memory_size_mb` must be between 128 and 10240 MB".to_owned(),
            ));
        }
        self.memory_size_mb = value;
        Ok(())
    }

    pub fn set_timeout_secs(&mut self, value: u32) -> Result<()> {
        if !(3..=900).contains(&value) {
            return Err(FlockError::ConfigError(
                "`worker.timeout_secs` must be between 3 and 900 seconds".to_owned(),
            ));
        }
        self.timeout_secs = value;
        Ok(())
    }

    /// Push the current settings to the remote provider (e.g. update the AWS
    /// Lambda function configuration), and optionally warm it up.
    pub async fn apply(&self, dispatcher: &dyn Dispatcher) -> Result<()> {
        dispatcher.configure(self).await?;
        if self.warm_up {
            dispatcher.warm(1).await?;
        }
        Ok(())
    }
}

/// `bus.*` — the success/failure completion queues.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub queue_success: String,
    pub queue_failure: String,
    pub max_number_of_messages: u32,
    pub visibility_timeout_secs: u32,
    pub poll_wait_success_secs: u32,
    pub poll_wait_failure_secs: u32,
    pub iterations_before_failure_check: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            queue_success: "FlockSuccess".to_owned(),
            queue_failure: "FlockFailure".to_owned(),
            max_number_of_messages: 10,
            visibility_timeout_secs: 5,
            poll_wait_success_secs: 5,
            poll_wait_failure_secs: 2,
            iterations_before_failure_check: 3,
        }
    }
}

impl BusConfig {
    pub fn set_max_number_of_messages(&mut self, value: u32) -> Result<()> {
        if !(1..=10).contains(&value) {
            return Err(FlockError::ConfigError(
                "`bus.max_number_of_messages` must be between 1 and 10".to_owned(),
            ));
        }
        self.max_number_of_messages = value;
        Ok(())
    }

    pub fn set_visibility_timeout_secs(&mut self, value: u32) -> Result<()> {
        if value > 60 {
            return Err(FlockError::ConfigError(
                "`bus.visibility_timeout_secs` must be between 0 and 60 seconds".to_owned(),
            ));
        }
        self.visibility_timeout_secs = value;
        Ok(())
    }
}

/// `session.*` — cache/fan-out policy and provider selection.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_invocations: MaxInvocations,
    pub cache_expiration_time_mins: u32,
    pub task_timeout_secs: u32,
    pub overall_timeout_secs: u32,
    pub verbose: bool,
    /// Identifies the cloud provider backing this session's Dispatcher /
    /// CompletionBus / BlobStore trio (e.g. `"aws"`); also namespaces the
    /// default cache prefix so two providers sharing a bucket never collide.
    pub provider_id: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_invocations: MaxInvocations::Fixed(15),
            cache_expiration_time_mins: 15,
            task_timeout_secs: 60,
            overall_timeout_secs: 900,
            verbose: false,
            provider_id: "local".to_owned(),
        }
    }
}

impl SessionConfig {
    pub fn set_max_invocations(&mut self, value: &str) -> Result<()> {
        self.max_invocations = if value.eq_ignore_ascii_case("auto") {
            MaxInvocations::Auto
        } else {
            let n = value.parse::<usize>().map_err(|_| {
                FlockError::ConfigError(
                    "`session.max_invocations` must be `auto` or a positive integer".to_owned(),
                )
            })?;
            if n == 0 {
                return Err(FlockError::ConfigError(
                    "`session.max_invocations` must be greater than zero".to_owned(),
                ));
            }
            MaxInvocations::Fixed(n)
        };
        Ok(())
    }
}

/// `engine.*` — the embedded analytical engine used by workers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_path: String,
    pub read_only: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            database_path: ":memory:".to_owned(),
            read_only: false,
        }
    }
}

/// The full, validated configuration for a [`crate::session::Session`].
#[derive(Debug, Clone, Default)]
pub struct FlockConfig {
    pub worker: WorkerConfig,
    pub bus: BusConfig,
    pub session: SessionConfig,
    pub engine: EngineConfig,
}

impl FlockConfig {
    /// Set a single `<group>.<name>` key from its string representation,
    /// validating it against the owning group's rules.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let (group, name) = key.split_once('.').ok_or_else(|| {
            FlockError::ConfigError(format!("`{}` is not a `<group>.<name>` key", key))
        })?;

        match (group, name) {
            ("worker", "memory_size_mb") => {
                self.worker.set_memory_size_mb(parse(value)?)?;
            }
            ("worker", "timeout_secs") => {
                self.worker.set_timeout_secs(parse(value)?)?;
            }
            ("worker", "warm_up") => {
                self.worker.warm_up = parse(value)?;
            }
            ("worker", "function_name") => {
                self.worker.function_name = value.to_owned();
            }
            ("bus", "max_number_of_messages") => {
                self.bus.set_max_number_of_messages(parse(value)?)?;
            }
            ("bus", "visibility_timeout_secs") => {
                self.bus.set_visibility_timeout_secs(parse(value)?)?;
            }
            ("session", "max_invocations") => {
                self.session.set_max_invocations(value)?;
            }
            ("session", "cache_expiration_time") => {
                self.session.cache_expiration_time_mins = parse(value)?;
            }
            ("session", "verbose") => {
                self.session.verbose = parse(value)?;
            }
            ("session", "provider_id") => {
                self.session.provider_id = value.to_owned();
            }
            ("engine", "database") => {
                self.engine.database_path = value.to_owned();
            }
            ("engine", "read_only") => {
                self.engine.read_only = parse(value)?;
            }
            _ => {
                return Err(FlockError::ConfigError(format!(
                    "configuration `{}` doesn't exist",
                    key
                )))
            }
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| FlockError::ConfigError(format!("couldn't parse `{}`", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_key() {
        let mut cfg = FlockConfig::default();
        assert!(cfg.set("session.does_not_exist", "1").is_err());
    }

    #[test]
    fn rejects_out_of_range_memory() {
        let mut cfg = FlockConfig::default();
        assert!(cfg.set("worker.memory_size_mb", "64").is_err());
        assert!(cfg.set("worker.memory_size_mb", "256").is_ok());
        assert_eq!(cfg.worker.memory_size_mb, 256);
    }

    #[test]
    fn max_invocations_auto_resolves_to_input_count() {
        assert_eq!(MaxInvocations::Auto.resolve(7), 7);
        assert_eq!(MaxInvocations::Fixed(3).resolve(7), 3);
        assert_eq!(MaxInvocations::Fixed(10).resolve(2), 2);
    }
}
