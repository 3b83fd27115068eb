// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Describes an HA orchestrator config which may be parsed from a TOML file.

use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for one HA orchestrator server.
#[derive(Clone, Default, Serialize, Deserialize, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: Server,

    #[serde(default)]
    pub ha: HaConfig,
}

impl Config {
    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Config, ParseError> {
        let cfg = toml::from_str::<Config>(contents)?;
        cfg.ha.validate()?;
        Ok(cfg)
    }
}

/// Identity of the server process running the orchestrator.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Server {
    /// The identifier this server writes into the leases it takes. Must be
    /// unique among the servers sharing a work queue.
    pub id: u64,
}

impl Default for Server {
    fn default() -> Self {
        Self { id: 1 }
    }
}

/// Tunables for the HA worker pool and its retry policy. Every interval is
/// expressed in whole seconds.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct HaConfig {
    /// Number of worker threads per server.
    pub workers: usize,

    /// How long an idle worker sleeps before polling the queue again.
    pub time_to_sleep: u64,

    /// Attempts allowed per work item before it is closed with an alert.
    pub max_retries: u32,

    /// Window in which failures of a VM count against the same retry budget.
    /// Finished work items older than this are also eligible for cleanup.
    pub time_between_failures: u64,

    /// Interval between cleanup passes over finished work items.
    pub time_between_cleanup: u64,

    pub stop_retry_interval: u64,
    pub restart_retry_interval: u64,
    pub migrate_retry_interval: u64,
    pub investigate_retry_interval: u64,

    /// Restart VMs even if they are not marked HA-enabled.
    pub force_ha: bool,

    /// Host tag passed to the placement subsystem on HA restarts.
    pub ha_tag: Option<String>,

    /// Placement strategy used when a restart with the VM's own strategy
    /// runs out of capacity.
    pub ha_planner: String,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            time_to_sleep: 60,
            max_retries: 5,
            time_between_failures: 3600,
            time_between_cleanup: 86400,
            stop_retry_interval: 600,
            restart_retry_interval: 600,
            migrate_retry_interval: 120,
            investigate_retry_interval: 60,
            force_ha: false,
            ha_tag: None,
            ha_planner: "HAPlanner".to_string(),
        }
    }
}

impl HaConfig {
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.workers == 0 {
            return Err(ParseError::Invalid(
                "ha.workers must be at least 1".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(ParseError::Invalid(
                "ha.max-retries must be at least 1".to_string(),
            ));
        }
        if self.time_to_sleep == 0 {
            return Err(ParseError::Invalid(
                "ha.time-to-sleep must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn time_to_sleep(&self) -> Duration {
        Duration::from_secs(self.time_to_sleep)
    }

    pub fn time_between_cleanup(&self) -> Duration {
        Duration::from_secs(self.time_between_cleanup)
    }
}

/// Errors which may be returned when parsing the orchestrator configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    Config::from_toml_str(&contents)
}
