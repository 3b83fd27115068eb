// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated cloud.
//!
//! [`SimCloud`] stands in for the VM lifecycle manager, the resource manager
//! and the alert channel at once. VM records change only through the
//! lifecycle [`StateMachine`], and every change bumps the record's update
//! counter, so the orchestrator's staleness checks behave as they would
//! against a real database. Knobs let callers inject the failures HA has to
//! cope with.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use slog::{debug, info, Logger};
use strum::Display;

use crate::investigate::{
    FenceBuilder, HostStatus, InvestigationError, Investigator,
};
use crate::lifecycle::{
    Alert, AlertSink, AlertType, Host, HostKind, LifecycleError,
    ResourceManager, StartParams, VmLifecycle, VmRecord,
};
use crate::vm_state::{
    is_vm_destroyed, is_vm_migrated, is_vm_started, is_vm_stopped, Event,
    State, StateMachine,
};
use crate::work::{HostId, PodId, VmId, VmType, ZoneId};

/// A call made into the simulated cloud.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimCall {
    AdvanceStart { vm: VmId, planner: Option<String> },
    AdvanceStop { vm: VmId, force: bool },
    MigrateAway { vm: VmId, source: HostId },
    Destroy { vm: VmId, expunge: bool },
    MigrateAwayFailed { host: HostId, vm: VmId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum UsageKind {
    Started,
    Stopped,
    Migrated,
    Destroyed,
}

/// A billing-relevant transition, as classified by the lifecycle predicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsageEvent {
    pub vm: VmId,
    pub kind: UsageKind,
    pub host: Option<HostId>,
}

#[derive(Default)]
struct Faults {
    /// Starts that fail for lack of capacity regardless of planner.
    start_shortages: u32,

    /// Starts fail unless an alternate planner is supplied.
    default_planner_full: bool,

    migration_blocked: bool,
    stop_timeouts: u32,
    destroy_timeouts: u32,
}

#[derive(Default)]
struct SimState {
    hosts: BTreeMap<HostId, Host>,
    vms: BTreeMap<VmId, VmRecord>,
    liveness: BTreeMap<VmId, bool>,
    fence_result: Option<bool>,
    faults: Faults,
    calls: Vec<SimCall>,
    alerts: Vec<Alert>,
    cleared: Vec<(AlertType, ZoneId, Option<PodId>)>,
    usage: Vec<UsageEvent>,
}

impl SimState {
    fn record(&self, id: VmId) -> Result<VmRecord, LifecycleError> {
        self.vms
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("no such VM: {id}").into())
    }

    fn set_host(&mut self, id: VmId, host: Option<HostId>) {
        if let Some(vm) = self.vms.get_mut(&id) {
            vm.host_id = host;
            if host.is_some() {
                vm.last_host_id = host;
            }
        }
    }

    /// An up routing host in `zone`, other than `except`.
    fn pick_host(
        &self,
        zone: ZoneId,
        except: Option<HostId>,
    ) -> Option<HostId> {
        self.hosts
            .values()
            .find(|host| {
                host.kind == HostKind::Routing
                    && host.status == HostStatus::Up
                    && host.zone_id == zone
                    && Some(host.id) != except
            })
            .map(|host| host.id)
    }

    fn host_is_up(&self, host: Option<HostId>) -> bool {
        host.and_then(|id| self.hosts.get(&id))
            .is_some_and(|host| host.status == HostStatus::Up)
    }
}

/// An in-memory fleet of hosts and VMs.
pub struct SimCloud {
    log: Logger,
    machine: StateMachine,
    state: Mutex<SimState>,
}

impl SimCloud {
    pub fn new(log: Logger) -> Arc<Self> {
        Arc::new(Self {
            log: log.new(slog::o!("component" => "sim-cloud")),
            machine: StateMachine::default(),
            state: Mutex::new(SimState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    /// Moves `id` to the state `event` leads to, bumping its update counter
    /// and recording any usage event the transition implies.
    fn apply(
        &self,
        state: &mut SimState,
        id: VmId,
        event: Event,
    ) -> Result<State, LifecycleError> {
        let vm = state
            .vms
            .get_mut(&id)
            .ok_or_else(|| anyhow!("no such VM: {id}"))?;
        let old = vm.state;
        let new = self
            .machine
            .transition(old, event)
            .map_err(anyhow::Error::from)?;
        vm.state = new;
        vm.update_counter += 1;

        let kind = if is_vm_started(old, event, new) {
            Some(UsageKind::Started)
        } else if is_vm_stopped(old, event, new) {
            Some(UsageKind::Stopped)
        } else if is_vm_migrated(old, event, new) {
            Some(UsageKind::Migrated)
        } else if is_vm_destroyed(old, event, new) {
            Some(UsageKind::Destroyed)
        } else {
            None
        };
        if let Some(kind) = kind {
            state.usage.push(UsageEvent { vm: id, kind, host: vm.host_id });
        }

        debug!(self.log, "VM transition";
               "vm" => %id,
               "from" => %old,
               "event" => %event,
               "to" => %new);
        Ok(new)
    }

    pub fn add_host(&self, host: Host) {
        self.lock().hosts.insert(host.id, host);
    }

    /// Creates a VM, started on `host` if one is given.
    pub fn add_vm(
        &self,
        id: VmId,
        name: &str,
        vm_type: VmType,
        ha_enabled: bool,
        host: Option<HostId>,
    ) -> Result<VmRecord, LifecycleError> {
        let mut state = self.lock();
        let (zone_id, pod_id) = host
            .and_then(|h| state.hosts.get(&h))
            .map_or((ZoneId(1), PodId(1)), |h| (h.zone_id, h.pod_id));
        let initial = StateMachine::initial_state(Event::CreateRequested)
            .ok_or_else(|| anyhow!("no initial state for new VMs"))?;
        state.vms.insert(
            id,
            VmRecord {
                id,
                name: name.to_string(),
                vm_type,
                state: initial,
                host_id: None,
                last_host_id: None,
                update_counter: 0,
                ha_enabled,
                zone_id,
                pod_id,
            },
        );

        if let Some(host) = host {
            self.apply(&mut state, id, Event::StartRequested)?;
            state.set_host(id, Some(host));
            self.apply(&mut state, id, Event::OperationSucceeded)?;
        }
        state.record(id)
    }

    pub fn set_host_status(&self, host: HostId, status: HostStatus) {
        if let Some(host) = self.lock().hosts.get_mut(&host) {
            info!(self.log, "host status changed";
                  "host" => %host.id,
                  "from" => %host.status,
                  "to" => %status);
            host.status = status;
        }
    }

    /// Sets what investigators report about `vm`; `None` means they cannot
    /// tell.
    pub fn set_vm_alive(&self, vm: VmId, alive: Option<bool>) {
        let mut state = self.lock();
        match alive {
            Some(alive) => state.liveness.insert(vm, alive),
            None => state.liveness.remove(&vm),
        };
    }

    pub fn set_fence_result(&self, result: Option<bool>) {
        self.lock().fence_result = result;
    }

    pub fn fail_next_starts(&self, count: u32) {
        self.lock().faults.start_shortages = count;
    }

    pub fn set_default_planner_full(&self, full: bool) {
        self.lock().faults.default_planner_full = full;
    }

    pub fn set_migration_blocked(&self, blocked: bool) {
        self.lock().faults.migration_blocked = blocked;
    }

    pub fn fail_next_stops(&self, count: u32) {
        self.lock().faults.stop_timeouts = count;
    }

    pub fn fail_next_destroys(&self, count: u32) {
        self.lock().faults.destroy_timeouts = count;
    }

    /// Applies an event reported by a host agent, outside any orchestrated
    /// operation.
    pub fn report(
        &self,
        vm: VmId,
        event: Event,
    ) -> Result<State, LifecycleError> {
        let mut state = self.lock();
        let new = self.apply(&mut state, vm, event)?;
        if matches!(new, State::Stopped | State::Destroyed) {
            state.set_host(vm, None);
        }
        Ok(new)
    }

    pub fn vm(&self, id: VmId) -> Option<VmRecord> {
        self.lock().vms.get(&id).cloned()
    }

    pub fn vms(&self) -> Vec<VmRecord> {
        self.lock().vms.values().cloned().collect()
    }

    pub fn host(&self, id: HostId) -> Option<Host> {
        self.lock().hosts.get(&id).cloned()
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.lock().calls.clone()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.lock().alerts.clone()
    }

    pub fn cleared_alerts(&self) -> Vec<(AlertType, ZoneId, Option<PodId>)> {
        self.lock().cleared.clone()
    }

    pub fn usage(&self) -> Vec<UsageEvent> {
        self.lock().usage.clone()
    }

    /// An investigator that answers from the knobs on this cloud.
    pub fn investigator(self: &Arc<Self>) -> Arc<dyn Investigator> {
        Arc::new(SimInvestigator { cloud: Arc::clone(self) })
    }

    /// A fence builder that answers from [`SimCloud::set_fence_result`].
    pub fn fencer(self: &Arc<Self>) -> Arc<dyn FenceBuilder> {
        Arc::new(SimFencer { cloud: Arc::clone(self) })
    }
}

impl VmLifecycle for SimCloud {
    fn find_vm(&self, vm: VmId) -> Option<VmRecord> {
        self.vm(vm)
    }

    fn list_by_host(&self, host: HostId) -> Vec<VmRecord> {
        self.lock()
            .vms
            .values()
            .filter(|vm| vm.host_id == Some(host))
            .cloned()
            .collect()
    }

    fn advance_start(
        &self,
        vm: VmId,
        params: StartParams,
    ) -> Result<(), LifecycleError> {
        let mut state = self.lock();
        state.calls.push(SimCall::AdvanceStart {
            vm,
            planner: params.planner.clone(),
        });
        let zone = state.record(vm)?.zone_id;
        self.apply(&mut state, vm, Event::StartRequested)?;

        let shortage = if state.faults.start_shortages > 0 {
            state.faults.start_shortages -= 1;
            true
        } else {
            state.faults.default_planner_full && params.planner.is_none()
        };
        let target = if shortage { None } else { state.pick_host(zone, None) };

        let Some(host) = target else {
            self.apply(&mut state, vm, Event::OperationFailed)?;
            return Err(LifecycleError::InsufficientCapacity(format!(
                "no host in {zone} can run {vm}"
            )));
        };
        state.set_host(vm, Some(host));
        self.apply(&mut state, vm, Event::OperationSucceeded)?;
        info!(self.log, "started VM"; "vm" => %vm, "host" => %host);
        Ok(())
    }

    fn advance_stop(
        &self,
        vm: VmId,
        force: bool,
    ) -> Result<(), LifecycleError> {
        let mut state = self.lock();
        state.calls.push(SimCall::AdvanceStop { vm, force });
        let record = state.record(vm)?;
        if record.state == State::Stopped {
            return Ok(());
        }

        if !force {
            if state.faults.stop_timeouts > 0 {
                state.faults.stop_timeouts -= 1;
                return Err(LifecycleError::OperationTimedOut(format!(
                    "stop of {vm}"
                )));
            }
            if !state.host_is_up(record.host_id) {
                return Err(LifecycleError::ResourceUnavailable(format!(
                    "host of {vm} is unreachable"
                )));
            }
        }

        let events: &[Event] = match record.state {
            State::Running | State::Stopping => {
                &[Event::StopRequested, Event::OperationSucceeded]
            }
            State::Starting | State::Migrating if force => {
                &[Event::AgentReportStopped]
            }
            State::Starting | State::Migrating => {
                return Err(LifecycleError::ConcurrentOperation(format!(
                    "{vm} is {}",
                    record.state
                )));
            }
            // Rejected by the transition table.
            _ => &[Event::StopRequested],
        };
        for event in events {
            self.apply(&mut state, vm, *event)?;
        }
        state.set_host(vm, None);
        Ok(())
    }

    fn migrate_away(
        &self,
        vm: VmId,
        source: HostId,
    ) -> Result<(), LifecycleError> {
        let mut state = self.lock();
        state.calls.push(SimCall::MigrateAway { vm, source });
        let record = state.record(vm)?;
        if record.host_id != Some(source) {
            return Err(LifecycleError::ConcurrentOperation(format!(
                "{vm} is not on {source}"
            )));
        }
        self.apply(&mut state, vm, Event::MigrationRequested)?;

        let target = if state.faults.migration_blocked {
            None
        } else {
            state.pick_host(record.zone_id, Some(source))
        };
        let Some(host) = target else {
            self.apply(&mut state, vm, Event::OperationFailed)?;
            return Err(LifecycleError::InsufficientServerCapacity(format!(
                "no host can take {vm} from {source}"
            )));
        };
        state.set_host(vm, Some(host));
        self.apply(&mut state, vm, Event::OperationSucceeded)?;
        info!(self.log, "migrated VM";
              "vm" => %vm,
              "from" => %source,
              "to" => %host);
        Ok(())
    }

    fn destroy(&self, vm: VmId, expunge: bool) -> Result<(), LifecycleError> {
        let mut state = self.lock();
        state.calls.push(SimCall::Destroy { vm, expunge });
        if state.faults.destroy_timeouts > 0 {
            state.faults.destroy_timeouts -= 1;
            return Err(LifecycleError::OperationTimedOut(format!(
                "destroy of {vm}"
            )));
        }

        if state.record(vm)?.state != State::Destroyed {
            self.apply(&mut state, vm, Event::DestroyRequested)?;
        }
        if expunge {
            self.apply(&mut state, vm, Event::ExpungeOperation)?;
        }
        state.set_host(vm, None);
        Ok(())
    }
}

impl ResourceManager for SimCloud {
    fn find_host(&self, host: HostId) -> Option<Host> {
        self.host(host)
    }

    fn migrate_away_failed(&self, host: HostId, vm: VmId) {
        self.lock().calls.push(SimCall::MigrateAwayFailed { host, vm });
    }
}

impl AlertSink for SimCloud {
    fn send_alert(&self, alert: Alert) {
        info!(self.log, "alert";
              "type" => %alert.alert_type,
              "subject" => &alert.subject);
        self.lock().alerts.push(alert);
    }

    fn clear_alert(
        &self,
        alert_type: AlertType,
        zone: ZoneId,
        pod: Option<PodId>,
    ) {
        self.lock().cleared.push((alert_type, zone, pod));
    }
}

/// Reports the liveness configured with [`SimCloud::set_vm_alive`], and the
/// status of hosts that are definitely up or down.
pub struct SimInvestigator {
    cloud: Arc<SimCloud>,
}

impl Investigator for SimInvestigator {
    fn name(&self) -> &str {
        "sim"
    }

    fn is_vm_alive(
        &self,
        vm: &VmRecord,
        _host: &Host,
    ) -> Result<bool, InvestigationError> {
        self.cloud
            .lock()
            .liveness
            .get(&vm.id)
            .copied()
            .ok_or_else(|| InvestigationError::UnknownVm(vm.name.clone()))
    }

    fn is_agent_alive(&self, host: &Host) -> Option<HostStatus> {
        let status = self.cloud.host(host.id)?.status;
        matches!(status, HostStatus::Up | HostStatus::Down).then_some(status)
    }
}

pub struct SimFencer {
    cloud: Arc<SimCloud>,
}

impl FenceBuilder for SimFencer {
    fn name(&self) -> &str {
        "sim"
    }

    fn fence_off(&self, _vm: &VmRecord, _host: &Host) -> Option<bool> {
        self.cloud.lock().fence_result
    }
}
