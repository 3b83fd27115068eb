// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The HA orchestrator.
//!
//! Callers report failures (a host went down, a VM must be evacuated, stopped
//! or destroyed) through the scheduling methods on [`Orchestrator`]. Each call
//! persists a [`WorkItem`] in the shared [`WorkQueue`] and wakes this server's
//! worker threads. A worker leases one item at a time, drives the VM toward
//! recovery through the [`VmLifecycle`] collaborator, and then either closes
//! the item or returns it to the queue with a later time to try.
//!
//! Several servers may share one queue. Leases keep them from processing the
//! same item concurrently; when a server leaves the cluster, the survivors
//! release its leases (see [`ClusterListener`]).

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use slog::{debug, error, info, warn, Logger};
use thiserror::Error;
use vmha_config::HaConfig;

use crate::cluster::ClusterListener;
use crate::investigate::{
    FenceBuilder, FenceChain, HostStatus, Investigator, InvestigatorChain,
};
use crate::lifecycle::{
    Alert, AlertSink, AlertType, HostKind, LifecycleError, ResourceManager,
    VmLifecycle, VmRecord,
};
use crate::queue::{QueueError, WorkQueue};
use crate::work::{
    HostId, NewWork, ServerId, Step, VmId, WorkId, WorkItem, WorkType,
};

mod process;
mod workers;

use workers::WakeSignal;

#[derive(Debug, Error)]
pub enum HaError {
    #[error("work queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("lifecycle operation failed: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// A forced stop reported an error it is never supposed to return.
    #[error("forced stop of {vm} failed: {source}")]
    ForcedStopFailed {
        vm: VmId,
        #[source]
        source: LifecycleError,
    },

    #[error("{0} is not a stop work type")]
    NotAStop(WorkType),

    #[error("processing of {0} panicked")]
    Panicked(WorkId),

    #[error("Failed to spawn an HA worker thread: {0}")]
    ThreadSpawnFailed(std::io::Error),
}

/// The services the orchestrator drives.
pub struct Collaborators {
    pub queue: Arc<dyn WorkQueue>,
    pub lifecycle: Arc<dyn VmLifecycle>,
    pub resources: Arc<dyn ResourceManager>,
    pub alerts: Arc<dyn AlertSink>,

    /// Liveness probes, in the order they are consulted.
    pub investigators: Vec<Arc<dyn Investigator>>,

    /// Fencing mechanisms, in the order they are tried.
    pub fence_builders: Vec<Arc<dyn FenceBuilder>>,
}

/// State shared between the orchestrator handle and its threads.
pub(crate) struct Inner {
    log: Logger,
    server_id: ServerId,
    config: HaConfig,
    queue: Arc<dyn WorkQueue>,
    lifecycle: Arc<dyn VmLifecycle>,
    resources: Arc<dyn ResourceManager>,
    alerts: Arc<dyn AlertSink>,
    investigators: InvestigatorChain,
    fencers: FenceChain,
    wake: WakeSignal,
}

impl Inner {
    /// The earliest time an item may be retried after waiting `secs`.
    fn after(&self, secs: u64) -> DateTime<Utc> {
        Utc::now() + seconds(secs)
    }

    fn retry_interval(&self, work_type: WorkType) -> u64 {
        match work_type {
            WorkType::HA => self.config.restart_retry_interval,
            WorkType::Migration => self.config.migrate_retry_interval,
            WorkType::Stop
            | WorkType::CheckStop
            | WorkType::ForceStop
            | WorkType::Destroy => self.config.stop_retry_interval,
        }
    }

    fn force_stop(&self, log: &Logger, vm: VmId) -> Result<(), HaError> {
        self.lifecycle.advance_stop(vm, true).map_err(|source| {
            error!(log, "forced stop failed, which should never happen";
                   "vm" => %vm,
                   "error" => %source);
            HaError::ForcedStopFailed { vm, source }
        })
    }

    fn vm_alert(&self, vm: &VmRecord, subject: String, body: String) {
        self.alerts.send_alert(Alert {
            alert_type: vm.vm_type.into(),
            zone_id: vm.zone_id,
            pod_id: Some(vm.pod_id),
            subject,
            body,
        });
    }

    /// Raises an alert about `work`, locating it by its VM (or, if the VM is
    /// gone, by its host).
    fn work_alert(&self, log: &Logger, work: &WorkItem, subject: String) {
        let body = format!("Work item: {work}");
        if let Some(vm) = self.lifecycle.find_vm(work.instance_id) {
            self.vm_alert(&vm, subject, body);
        } else if let Some(host) = self.resources.find_host(work.host_id) {
            self.alerts.send_alert(Alert {
                alert_type: work.vm_type.into(),
                zone_id: host.zone_id,
                pod_id: Some(host.pod_id),
                subject,
                body,
            });
        } else {
            warn!(log, "cannot locate work item for alert";
                  "subject" => subject);
        }
    }
}

/// Converts a configured interval, capped at a century.
fn seconds(secs: u64) -> chrono::Duration {
    const CENTURY: i64 = 100 * 365 * 24 * 60 * 60;
    let secs = i64::try_from(secs).unwrap_or(CENTURY).min(CENTURY);
    chrono::Duration::seconds(secs)
}

/// The HA work-queue engine for one server.
pub struct Orchestrator {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        log: Logger,
        server_id: ServerId,
        config: HaConfig,
        collaborators: Collaborators,
    ) -> Self {
        let log = log.new(slog::o!(
            "component" => "ha-orchestrator",
            "server" => server_id.0,
        ));
        Self {
            inner: Arc::new(Inner {
                log,
                server_id,
                config,
                queue: collaborators.queue,
                lifecycle: collaborators.lifecycle,
                resources: collaborators.resources,
                alerts: collaborators.alerts,
                investigators: InvestigatorChain::new(
                    collaborators.investigators,
                ),
                fencers: FenceChain::new(collaborators.fence_builders),
                wake: WakeSignal::new(),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.inner.server_id
    }

    pub fn config(&self) -> &HaConfig {
        &self.inner.config
    }

    /// Schedules a restart of `vm_id` after a failure of its host.
    ///
    /// With `investigate` set the host's failure is only suspected, so the
    /// worker will probe (and if need be fence) before restarting. Without it
    /// the VM is known to be gone and is stopped here, before the work is
    /// queued.
    pub fn schedule_restart(
        &self,
        vm_id: VmId,
        investigate: bool,
    ) -> Result<Option<WorkItem>, HaError> {
        let inner = &self.inner;
        let log = inner.log.new(slog::o!("vm" => vm_id.0));

        let Some(mut vm) = inner.lifecycle.find_vm(vm_id) else {
            warn!(log, "asked to restart a VM that does not exist");
            return Ok(None);
        };

        let Some(host_id) = vm.host_id else {
            debug!(log, "VM has no host, stopping it instead of restarting";
                   "state" => %vm.state);
            inner.force_stop(&log, vm_id)?;
            return Ok(None);
        };

        if !investigate {
            if !(inner.config.force_ha || vm.ha_enabled) {
                let host_name = inner
                    .resources
                    .find_host(host_id)
                    .map_or_else(|| host_id.to_string(), |host| host.name);
                inner.vm_alert(
                    &vm,
                    format!(
                        "VM (name: {}, id: {}) stopped unexpectedly on host \
                         {host_name}",
                        vm.name, vm.id
                    ),
                    format!(
                        "Virtual machine {} ({}) is not HA-enabled and will \
                         not be restarted",
                        vm.name, vm.vm_type
                    ),
                );
                debug!(log, "VM is not HA enabled");
            }

            inner.force_stop(&log, vm_id)?;
            let Some(reloaded) = inner.lifecycle.find_vm(vm_id) else {
                info!(log, "VM disappeared while being stopped");
                return Ok(None);
            };
            vm = reloaded;
        }

        let now = Utc::now();
        let window = seconds(inner.config.time_between_failures);
        let times_tried = inner
            .queue
            .find_previous_work(vm_id)?
            .iter()
            .find(|item| {
                item.times_tried > 0 && !item.can_schedule_new(window, now)
            })
            .map_or(0, |item| item.times_tried);

        let work = inner.queue.persist(NewWork {
            instance_id: vm_id,
            vm_type: vm.vm_type,
            work_type: WorkType::HA,
            step: if investigate {
                Step::Investigating
            } else {
                Step::Scheduled
            },
            host_id,
            previous_state: vm.state,
            previous_update_counter: vm.update_counter,
            times_tried,
        })?;
        info!(log, "scheduled restart"; "work" => %work);

        inner.wake.wake_all();
        Ok(Some(work))
    }

    /// Schedules restarts for every VM on a failed host, infrastructure VMs
    /// first. Returns the number of restarts scheduled.
    pub fn schedule_restart_for_vms_on_host(
        &self,
        host_id: HostId,
        investigate: bool,
    ) -> Result<usize, HaError> {
        let inner = &self.inner;
        let log = inner.log.new(slog::o!("host" => host_id.0));

        let Some(host) = inner.resources.find_host(host_id) else {
            warn!(log, "asked to restart VMs on a host that does not exist");
            return Ok(0);
        };
        if host.kind != HostKind::Routing {
            debug!(log, "not a routing host, nothing to restart";
                   "kind" => %host.kind);
            return Ok(0);
        }

        warn!(log, "host is down, restarting its VMs"; "name" => &host.name);
        inner.alerts.send_alert(Alert {
            alert_type: AlertType::Host,
            zone_id: host.zone_id,
            pod_id: Some(host.pod_id),
            subject: format!(
                "Host is down, name: {} ({})",
                host.name, host.id
            ),
            body: format!(
                "Host [name: {}, id: {}] is down. Restarting VMs that were \
                 on the host",
                host.name, host.id
            ),
        });

        let mut vms = inner.lifecycle.list_by_host(host_id);
        vms.sort_by_key(|vm| (vm.vm_type, vm.id));

        let mut scheduled = 0;
        for vm in vms {
            info!(log, "notifying HA of VM to restart"; "vm" => %vm.id);
            match self.schedule_restart(vm.id, investigate) {
                Ok(Some(_)) => scheduled += 1,
                Ok(None) => {}
                Err(e) => {
                    error!(log, "failed to schedule restart";
                           "vm" => %vm.id,
                           "error" => %e);
                }
            }
        }

        Ok(scheduled)
    }

    /// Schedules a stop of `vm_id`. Duplicate requests are ignored.
    pub fn schedule_stop(
        &self,
        vm_id: VmId,
        host_id: HostId,
        work_type: WorkType,
    ) -> Result<Option<WorkItem>, HaError> {
        if !matches!(
            work_type,
            WorkType::Stop | WorkType::CheckStop | WorkType::ForceStop
        ) {
            return Err(HaError::NotAStop(work_type));
        }

        let inner = &self.inner;
        if inner.queue.has_been_scheduled(vm_id, work_type)? {
            info!(inner.log, "stop already scheduled";
                  "vm" => %vm_id,
                  "type" => %work_type);
            return Ok(None);
        }

        let Some(vm) = inner.lifecycle.find_vm(vm_id) else {
            warn!(inner.log, "asked to stop a VM that does not exist";
                  "vm" => %vm_id);
            return Ok(None);
        };

        self.enqueue(&vm, work_type, host_id).map(Some)
    }

    /// Schedules evacuation of `vm_id` from its current host.
    pub fn schedule_migration(
        &self,
        vm_id: VmId,
    ) -> Result<Option<WorkItem>, HaError> {
        let inner = &self.inner;
        let Some(vm) = inner.lifecycle.find_vm(vm_id) else {
            warn!(inner.log, "asked to migrate a VM that does not exist";
                  "vm" => %vm_id);
            return Ok(None);
        };
        let Some(host_id) = vm.host_id else {
            info!(inner.log, "VM has no host, nothing to migrate";
                  "vm" => %vm_id);
            return Ok(None);
        };

        self.enqueue(&vm, WorkType::Migration, host_id).map(Some)
    }

    /// Schedules the completion of a destroy of `vm_id`, which was last on
    /// `host_id`.
    pub fn schedule_destroy(
        &self,
        vm_id: VmId,
        host_id: HostId,
    ) -> Result<Option<WorkItem>, HaError> {
        let inner = &self.inner;
        let Some(vm) = inner.lifecycle.find_vm(vm_id) else {
            warn!(inner.log, "asked to destroy a VM that does not exist";
                  "vm" => %vm_id);
            return Ok(None);
        };

        self.enqueue(&vm, WorkType::Destroy, host_id).map(Some)
    }

    /// Deletes unclaimed destroy work for `vm_id`.
    pub fn cancel_destroy(&self, vm_id: VmId) -> Result<usize, HaError> {
        let deleted = self.inner.queue.delete_work(vm_id, WorkType::Destroy)?;
        debug!(self.inner.log, "cancelled destroy work";
               "vm" => %vm_id,
               "deleted" => deleted);
        Ok(deleted)
    }

    /// Deletes migrations from `host_id` that nobody has started yet. For a
    /// storage host the pending work is its stops.
    pub fn cancel_scheduled_migrations(
        &self,
        host_id: HostId,
    ) -> Result<usize, HaError> {
        let inner = &self.inner;
        let work_type = match inner.resources.find_host(host_id) {
            Some(host) if host.kind == HostKind::Storage => WorkType::Stop,
            _ => WorkType::Migration,
        };
        let deleted =
            inner.queue.delete_unclaimed_for_host(host_id, work_type)?;
        info!(inner.log, "cancelled scheduled migrations";
              "host" => %host_id,
              "type" => %work_type,
              "deleted" => deleted);
        Ok(deleted)
    }

    /// Migrations some server is working on right now.
    pub fn find_taken_migration_work(
        &self,
    ) -> Result<Vec<WorkItem>, HaError> {
        Ok(self.inner.queue.find_taken_work(WorkType::Migration)?)
    }

    pub fn has_pending_ha_work(&self, vm_id: VmId) -> Result<bool, HaError> {
        self.has_pending(vm_id, WorkType::HA)
    }

    pub fn has_pending_migrations_work(
        &self,
        vm_id: VmId,
    ) -> Result<bool, HaError> {
        self.has_pending(vm_id, WorkType::Migration)
    }

    /// Asks the investigators whether a host's agent is alive. A host that no
    /// longer exists is reported as [`HostStatus::Alert`].
    pub fn investigate(&self, host_id: HostId) -> Option<HostStatus> {
        let inner = &self.inner;
        let Some(host) = inner.resources.find_host(host_id) else {
            return Some(HostStatus::Alert);
        };
        inner.investigators.host_status(&inner.log, &host)
    }

    /// Leases and processes a single due item on the calling thread. Returns
    /// `false` if nothing was claimable.
    pub fn run_once(&self) -> bool {
        self.inner.process_next(&self.inner.log)
    }

    fn has_pending(
        &self,
        vm_id: VmId,
        work_type: WorkType,
    ) -> Result<bool, HaError> {
        Ok(self
            .inner
            .queue
            .find_pending(vm_id)?
            .iter()
            .any(|item| item.work_type == work_type))
    }

    fn enqueue(
        &self,
        vm: &VmRecord,
        work_type: WorkType,
        host_id: HostId,
    ) -> Result<WorkItem, HaError> {
        let work = self.inner.queue.persist(NewWork {
            instance_id: vm.id,
            vm_type: vm.vm_type,
            work_type,
            step: Step::Scheduled,
            host_id,
            previous_state: vm.state,
            previous_update_counter: vm.update_counter,
            times_tried: 0,
        })?;
        info!(self.inner.log, "scheduled work"; "work" => %work);

        self.inner.wake.wake_all();
        Ok(work)
    }
}

impl ClusterListener for Orchestrator {
    fn on_server_joined(&self, servers: &[ServerId]) {
        info!(self.inner.log, "servers joined the cluster";
              "servers" => ?servers);
    }

    fn on_server_left(&self, servers: &[ServerId]) {
        let inner = &self.inner;
        let mut released = 0;
        for server in servers.iter().filter(|s| **s != inner.server_id) {
            match inner.queue.release(*server) {
                Ok(count) => {
                    info!(inner.log, "released leases of departed server";
                          "departed" => %server,
                          "released" => count);
                    released += count;
                }
                Err(e) => {
                    error!(inner.log, "failed to release leases";
                           "departed" => %server,
                           "error" => %e);
                }
            }
        }

        if released > 0 {
            inner.wake.wake_all();
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}
