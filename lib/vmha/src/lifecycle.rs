// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The collaborators the HA orchestrator drives but does not implement: the
//! VM lifecycle manager, the resource manager, and the alert channel.

use strum::Display;
use thiserror::Error;

use crate::investigate::HostStatus;
use crate::vm_state::State;
use crate::work::{HostId, PodId, VmId, VmType, ZoneId};

/// What the orchestrator can observe about a VM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmRecord {
    pub id: VmId,
    pub name: String,
    pub vm_type: VmType,
    pub state: State,

    /// The host the VM currently occupies. Empty when the VM is stopped.
    pub host_id: Option<HostId>,
    pub last_host_id: Option<HostId>,

    /// Incremented on every change to the record.
    pub update_counter: u64,

    pub ha_enabled: bool,
    pub zone_id: ZoneId,
    pub pod_id: PodId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum HostKind {
    /// A hypervisor host that runs VMs.
    Routing,
    Storage,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    pub kind: HostKind,
    pub status: HostStatus,
    pub zone_id: ZoneId,
    pub pod_id: PodId,
}

/// Parameters for a start issued on behalf of HA.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StartParams {
    /// Host tag the placement subsystem should prefer.
    pub ha_tag: Option<String>,

    /// Set when the start is recovering a VM after a failure.
    pub ha_operation: bool,

    /// Placement strategy to use instead of the VM's own.
    pub planner: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum AlertType {
    Host,
    UserVm,
    DomainRouter,
    ConsoleProxy,
    SecondaryStorageVm,
}

impl From<VmType> for AlertType {
    fn from(vm_type: VmType) -> Self {
        match vm_type {
            VmType::DomainRouter => AlertType::DomainRouter,
            VmType::ConsoleProxy => AlertType::ConsoleProxy,
            VmType::SecondaryStorageVm => AlertType::SecondaryStorageVm,
            VmType::User => AlertType::UserVm,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alert {
    pub alert_type: AlertType,
    pub zone_id: ZoneId,
    pub pod_id: Option<PodId>,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),

    #[error("insufficient server capacity: {0}")]
    InsufficientServerCapacity(String),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("operation timed out: {0}")]
    OperationTimedOut(String),

    #[error("concurrent operation: {0}")]
    ConcurrentOperation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Entry points into the VM lifecycle manager. The manager owns the VM records
/// and does its own locking; none of these calls are made with orchestrator
/// locks held.
#[cfg_attr(test, mockall::automock)]
pub trait VmLifecycle: Send + Sync {
    fn find_vm(&self, vm: VmId) -> Option<VmRecord>;

    /// Every VM currently placed on `host`.
    fn list_by_host(&self, host: HostId) -> Vec<VmRecord>;

    fn advance_start(
        &self,
        vm: VmId,
        params: StartParams,
    ) -> Result<(), LifecycleError>;

    /// Stops a VM. With `force` the manager marks the VM stopped without
    /// waiting for its host and must not fail with a retryable error.
    fn advance_stop(&self, vm: VmId, force: bool)
        -> Result<(), LifecycleError>;

    fn migrate_away(
        &self,
        vm: VmId,
        source: HostId,
    ) -> Result<(), LifecycleError>;

    fn destroy(&self, vm: VmId, expunge: bool) -> Result<(), LifecycleError>;
}

#[cfg_attr(test, mockall::automock)]
pub trait ResourceManager: Send + Sync {
    fn find_host(&self, host: HostId) -> Option<Host>;

    /// Tells the resource manager `host` could not be evacuated of `vm`.
    fn migrate_away_failed(&self, host: HostId, vm: VmId);
}

/// The operator-facing alert channel. Delivery is fire-and-forget.
#[cfg_attr(test, mockall::automock)]
pub trait AlertSink: Send + Sync {
    fn send_alert(&self, alert: Alert);

    fn clear_alert(
        &self,
        alert_type: AlertType,
        zone: ZoneId,
        pod: Option<PodId>,
    );
}
