// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Context};
use serde::Deserialize;

use vmha::investigate::HostStatus;
use vmha::lifecycle::HostKind;
use vmha::work::VmType;

/// A simulated fleet and the failure to inject into it.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The `[server]` and `[ha]` tables, as read by a real server.
    #[serde(flatten)]
    pub orchestrator: vmha_config::Config,

    #[serde(default, rename = "host")]
    pub hosts: Vec<HostSpec>,

    #[serde(default, rename = "vm")]
    pub vms: Vec<VmSpec>,

    #[serde(default)]
    pub scenario: Scenario,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HostSpec {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub kind: Kind,
    #[serde(default = "default_location")]
    pub zone: u64,
    #[serde(default = "default_location")]
    pub pod: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VmSpec {
    pub id: u64,
    pub name: String,
    #[serde(default, rename = "type")]
    pub vm_type: Role,
    /// Host the VM is running on. Stopped if absent.
    pub host: Option<u64>,
    #[serde(default = "default_true")]
    pub ha_enabled: bool,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Kind {
    #[default]
    Routing,
    Storage,
}

impl From<Kind> for HostKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Routing => HostKind::Routing,
            Kind::Storage => HostKind::Storage,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    #[default]
    User,
    DomainRouter,
    ConsoleProxy,
    SecondaryStorageVm,
}

impl From<Role> for VmType {
    fn from(role: Role) -> Self {
        match role {
            Role::User => VmType::User,
            Role::DomainRouter => VmType::DomainRouter,
            Role::ConsoleProxy => VmType::ConsoleProxy,
            Role::SecondaryStorageVm => VmType::SecondaryStorageVm,
        }
    }
}

/// How a failed host appears to the rest of the cloud.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Failure {
    #[default]
    Disconnected,
    Down,
    Alert,
}

impl From<Failure> for HostStatus {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Disconnected => HostStatus::Disconnected,
            Failure::Down => HostStatus::Down,
            Failure::Alert => HostStatus::Alert,
        }
    }
}

/// What the fencing mechanisms do when asked to isolate a VM.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Fence {
    #[default]
    Succeed,
    Refuse,
    Unsupported,
}

impl Fence {
    pub fn result(self) -> Option<bool> {
        match self {
            Fence::Succeed => Some(true),
            Fence::Refuse => Some(false),
            Fence::Unsupported => None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Scenario {
    /// Hosts that fail once the fleet is up.
    pub fail_hosts: Vec<u64>,
    pub failure: Failure,
    pub fence: Fence,

    /// VMs investigators can vouch for, alive or dead. Any other VM on a
    /// failed host has undetermined liveness.
    pub alive_vms: Vec<u64>,
    pub dead_vms: Vec<u64>,

    /// Whether restarts begin with an investigation of the VM.
    pub investigate: bool,

    /// Starts that fail for lack of capacity before one succeeds.
    pub start_shortages: u32,

    /// Starts only succeed with the HA planner.
    pub default_planner_full: bool,

    /// Seconds to wait for the queue to drain.
    pub timeout: u64,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            fail_hosts: Vec::new(),
            failure: Failure::default(),
            fence: Fence::default(),
            alive_vms: Vec::new(),
            dead_vms: Vec::new(),
            investigate: true,
            start_shortages: 0,
            default_planner_full: false,
            timeout: 60,
        }
    }
}

fn default_location() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        self.orchestrator.ha.validate()?;

        let mut hosts = BTreeSet::new();
        for host in &self.hosts {
            if !hosts.insert(host.id) {
                bail!("host {} is defined more than once", host.id);
            }
        }
        let mut vms = BTreeSet::new();
        for vm in &self.vms {
            if !vms.insert(vm.id) {
                bail!("vm {} is defined more than once", vm.id);
            }
            if let Some(host) = vm.host {
                if !hosts.contains(&host) {
                    bail!("vm {} is placed on unknown host {host}", vm.id);
                }
            }
        }
        for host in &self.scenario.fail_hosts {
            if !hosts.contains(host) {
                bail!("cannot fail unknown host {host}");
            }
        }
        Ok(())
    }
}

pub fn parse<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config = toml::from_str::<Config>(&contents)
        .with_context(|| format!("parsing {}", path.display()))?;
    config.validate()?;
    Ok(config)
}
