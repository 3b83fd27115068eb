// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Liveness probes and fencing.
//!
//! When a host stops answering, the orchestrator cannot tell a crashed VM from
//! one that is running behind a network partition. Investigators are asked, in
//! priority order, whether the VM (or host agent) is alive; the first one with
//! a definite answer wins. If nobody knows, fence builders are asked, again in
//! order, to isolate the VM so that a restarted copy cannot corrupt shared
//! state. Only a successful fence (or a definite "dead") permits recovery.

use std::sync::Arc;

use slog::{debug, info, Logger};
use strum::Display;
use thiserror::Error;

use crate::lifecycle::{Host, VmRecord};

/// The connection status of a host as judged by an investigator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum HostStatus {
    Up,
    Down,
    Disconnected,
    Alert,
    Unknown,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvestigationError {
    /// The investigator has no way to determine this VM's state.
    #[error("unable to determine the state of VM {0}")]
    UnknownVm(String),

    /// The probe did not answer in time.
    #[error("probe timed out: {0}")]
    TimedOut(String),
}

/// A liveness probe.
pub trait Investigator: Send + Sync {
    fn name(&self) -> &str;

    /// Determines whether `vm` is still alive on `host`. Errors mean "ask
    /// someone else".
    fn is_vm_alive(
        &self,
        vm: &VmRecord,
        host: &Host,
    ) -> Result<bool, InvestigationError>;

    /// Determines the status of `host`'s agent, or `None` if this
    /// investigator cannot tell.
    fn is_agent_alive(&self, host: &Host) -> Option<HostStatus>;
}

/// A mechanism that can isolate a VM from shared storage and networks.
pub trait FenceBuilder: Send + Sync {
    fn name(&self) -> &str;

    /// Attempts to fence off `vm` on `host`. `Some(true)` means the VM is
    /// guaranteed isolated; anything else means this builder could not do it.
    fn fence_off(&self, vm: &VmRecord, host: &Host) -> Option<bool>;
}

/// The answer an investigator chain gives about a VM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Liveness {
    Alive { investigator: String },
    Dead { investigator: String },
    Undetermined,
}

/// Investigators in the order they are consulted.
#[derive(Clone, Default)]
pub struct InvestigatorChain {
    investigators: Vec<Arc<dyn Investigator>>,
}

impl InvestigatorChain {
    pub fn new(investigators: Vec<Arc<dyn Investigator>>) -> Self {
        Self { investigators }
    }

    pub fn is_empty(&self) -> bool {
        self.investigators.is_empty()
    }

    pub fn vm_liveness(
        &self,
        log: &Logger,
        vm: &VmRecord,
        host: &Host,
    ) -> Liveness {
        for investigator in self.investigators.iter() {
            match investigator.is_vm_alive(vm, host) {
                Ok(alive) => {
                    let investigator = investigator.name().to_string();
                    info!(log, "investigator determined VM liveness";
                          "investigator" => &investigator,
                          "alive" => alive);
                    return if alive {
                        Liveness::Alive { investigator }
                    } else {
                        Liveness::Dead { investigator }
                    };
                }
                Err(e) => {
                    debug!(log, "investigator could not determine VM state";
                           "investigator" => investigator.name(),
                           "error" => %e);
                }
            }
        }

        Liveness::Undetermined
    }

    pub fn host_status(
        &self,
        log: &Logger,
        host: &Host,
    ) -> Option<HostStatus> {
        for investigator in self.investigators.iter() {
            if let Some(status) = investigator.is_agent_alive(host) {
                info!(log, "investigator determined host status";
                      "investigator" => investigator.name(),
                      "host" => %host.id,
                      "status" => %status);
                return Some(status);
            }
            debug!(log, "investigator cannot determine host state";
                   "investigator" => investigator.name(),
                   "host" => %host.id);
        }

        None
    }
}

/// Fence builders in the order they are tried.
#[derive(Clone, Default)]
pub struct FenceChain {
    builders: Vec<Arc<dyn FenceBuilder>>,
}

impl FenceChain {
    pub fn new(builders: Vec<Arc<dyn FenceBuilder>>) -> Self {
        Self { builders }
    }

    /// Returns the name of the first builder that fenced the VM off, or
    /// `None` if every builder failed.
    pub fn fence_off(
        &self,
        log: &Logger,
        vm: &VmRecord,
        host: &Host,
    ) -> Option<String> {
        for builder in self.builders.iter() {
            match builder.fence_off(vm, host) {
                Some(true) => {
                    info!(log, "fenced off VM";
                          "fence_builder" => builder.name(),
                          "vm" => %vm.id,
                          "host" => %host.id);
                    return Some(builder.name().to_string());
                }
                result => {
                    debug!(log, "fence builder did not fence VM";
                           "fence_builder" => builder.name(),
                           "result" => ?result);
                }
            }
        }

        None
    }
}
