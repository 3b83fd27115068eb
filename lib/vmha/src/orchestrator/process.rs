// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Processing of a single leased work item.

use chrono::{DateTime, Utc};
use slog::{error, info, warn, Logger};

use super::{HaError, Inner};
use crate::investigate::{HostStatus, Liveness};
use crate::lifecycle::{LifecycleError, StartParams, VmRecord};
use crate::queue::QueueError;
use crate::vm_state::State;
use crate::work::{Step, WorkItem, WorkType};

/// What to do with an item after one pass over it.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum Disposition {
    /// Nothing further to do.
    Done,

    /// The item advanced to a new step and should be picked up again right
    /// away. Does not count as an attempt.
    Requeue,

    /// The attempt failed; try again no earlier than the given time.
    Retry(DateTime<Utc>),
}

/// Whether the VM is unchanged since `work` captured its snapshot.
fn snapshot_matches(work: &WorkItem, vm: &VmRecord) -> bool {
    vm.state == work.previous_state
        && vm.update_counter == work.previous_update_counter
}

fn is_retryable(e: &LifecycleError) -> bool {
    matches!(
        e,
        LifecycleError::InsufficientCapacity(_)
            | LifecycleError::ResourceUnavailable(_)
            | LifecycleError::OperationTimedOut(_)
            | LifecycleError::ConcurrentOperation(_)
    )
}

impl Inner {
    pub(super) fn work_log(&self, log: &Logger, work: &WorkItem) -> Logger {
        log.new(slog::o!(
            "work" => work.id.0,
            "vm" => work.instance_id.0,
            "type" => work.work_type.to_string(),
        ))
    }

    /// Runs one pass over a leased item and writes the outcome back to the
    /// queue. Fails only if the outcome could not be recorded.
    pub(super) fn process_work(
        &self,
        log: &Logger,
        mut work: WorkItem,
    ) -> Result<WorkItem, QueueError> {
        let log = self.work_log(log, &work);
        info!(log, "processing work"; "item" => %work);

        let result = match work.work_type {
            WorkType::HA => self.restart(&log, &mut work),
            WorkType::Migration => self.migrate(&log, &mut work),
            WorkType::Stop | WorkType::CheckStop | WorkType::ForceStop => {
                self.stop_vm(&log, &work)
            }
            WorkType::Destroy => self.destroy_vm(&log, &work),
        };

        self.conclude(&log, work, result)
    }

    /// Applies the outcome of a processing pass to `work` and persists it.
    pub(super) fn conclude(
        &self,
        log: &Logger,
        mut work: WorkItem,
        result: Result<Disposition, HaError>,
    ) -> Result<WorkItem, QueueError> {
        let charged = match result {
            Ok(Disposition::Done) => {
                info!(log, "work completed");
                work.step = Step::Done;
                work.release();
                false
            }
            Ok(Disposition::Requeue) => {
                info!(log, "work advanced"; "step" => %work.step);
                work.time_to_try = Utc::now();
                work.release();
                false
            }
            Ok(Disposition::Retry(when)) => {
                info!(log, "rescheduling work"; "time_to_try" => %when);
                work.reschedule(when);
                true
            }
            Err(e) => {
                error!(log, "unexpected error processing work"; "error" => %e);
                self.work_alert(
                    log,
                    &work,
                    format!("Unable to process {} work: {e}", work.work_type),
                );
                work.reschedule(
                    self.after(self.retry_interval(work.work_type)),
                );
                self.refresh_snapshot(&mut work);
                true
            }
        };

        if charged && work.times_tried >= self.config.max_retries {
            warn!(log, "giving up on work"; "times_tried" => work.times_tried);
            self.work_alert(
                log,
                &work,
                format!(
                    "Giving up on {} work for {} after {} attempts",
                    work.work_type, work.instance_id, work.times_tried
                ),
            );
            work.step = Step::Done;
        }

        // The lease has been dropped in the local copy, but the queue checks
        // it against the stored item, which this server still holds.
        self.queue.update(self.server_id, &work)?;
        Ok(work)
    }

    /// Re-arms the item's snapshot from the VM's current record so the next
    /// attempt acts on the VM as it is now.
    fn refresh_snapshot(&self, work: &mut WorkItem) {
        if let Some(vm) = self.lifecycle.find_vm(work.instance_id) {
            work.previous_state = vm.state;
            work.previous_update_counter = vm.update_counter;
        }
    }

    fn restart(
        &self,
        log: &Logger,
        work: &mut WorkItem,
    ) -> Result<Disposition, HaError> {
        let vm_id = work.instance_id;
        if !self.queue.list_future_ha_work(vm_id, work.id)?.is_empty() {
            info!(log, "a newer restart has been scheduled, cancelling");
            return Ok(Disposition::Done);
        }
        if self
            .queue
            .list_running_ha_work(vm_id)?
            .iter()
            .any(|other| other.id != work.id)
        {
            info!(log, "another restart of this VM is in progress, deferring");
            return Ok(Disposition::Retry(
                self.after(self.config.investigate_retry_interval),
            ));
        }

        let Some(vm) = self.lifecycle.find_vm(vm_id) else {
            info!(log, "VM no longer exists");
            return Ok(Disposition::Done);
        };

        if work.step == Step::Investigating {
            return self.investigate_vm(log, work, &vm);
        }

        if !snapshot_matches(work, &vm) {
            info!(log, "VM changed since restart was scheduled";
                  "state" => %vm.state,
                  "update_counter" => vm.update_counter);
            return Ok(Disposition::Done);
        }
        if !(self.config.force_ha || vm.ha_enabled) {
            info!(log, "VM is not HA enabled, not restarting");
            return Ok(Disposition::Done);
        }
        if vm.state != State::Stopped {
            info!(log, "VM is not stopped, nothing to restart";
                  "state" => %vm.state);
            return Ok(Disposition::Done);
        }

        let params = StartParams {
            ha_tag: self.config.ha_tag.clone(),
            ha_operation: true,
            planner: None,
        };
        let first = self.lifecycle.advance_start(vm_id, params.clone());
        let result = match first {
            Err(LifecycleError::InsufficientCapacity(reason)) => {
                info!(log, "no capacity for restart, retrying with HA planner";
                      "reason" => reason,
                      "planner" => &self.config.ha_planner);
                self.lifecycle.advance_start(
                    vm_id,
                    StartParams {
                        planner: Some(self.config.ha_planner.clone()),
                        ..params
                    },
                )
            }
            other => other,
        };

        match result {
            Ok(()) => match self.lifecycle.find_vm(vm_id) {
                Some(started) if started.state == State::Running => {
                    info!(log, "VM restarted"; "host" => ?started.host_id);
                    self.alerts.clear_alert(
                        started.vm_type.into(),
                        started.zone_id,
                        Some(started.pod_id),
                    );
                    return Ok(Disposition::Done);
                }
                current => {
                    warn!(log, "VM did not come up after restart";
                          "state" => ?current.map(|vm| vm.state));
                }
            },
            Err(e) if is_retryable(&e) => {
                warn!(log, "unable to restart VM"; "error" => %e);
                self.vm_alert(
                    &vm,
                    format!("Unable to restart {} ({})", vm.name, vm.id),
                    format!(
                        "Restart of {} which was on {} failed: {e}",
                        vm.name, work.host_id
                    ),
                );
            }
            Err(e) => return Err(e.into()),
        }

        self.refresh_snapshot(work);
        Ok(Disposition::Retry(self.after(self.config.restart_retry_interval)))
    }

    /// The Investigating step of a restart: decide whether the VM is truly
    /// gone, fence it if nobody can tell, and stop it so it can be restarted.
    fn investigate_vm(
        &self,
        log: &Logger,
        work: &mut WorkItem,
        vm: &VmRecord,
    ) -> Result<Disposition, HaError> {
        if !snapshot_matches(work, vm) || vm.host_id != Some(work.host_id) {
            info!(log, "VM changed since restart was scheduled";
                  "state" => %vm.state,
                  "update_counter" => vm.update_counter,
                  "host" => ?vm.host_id);
            return Ok(Disposition::Done);
        }

        match self.resources.find_host(work.host_id) {
            Some(host) => {
                let fenced =
                    match self.investigators.vm_liveness(log, vm, &host) {
                        Liveness::Dead { .. } => true,
                        Liveness::Alive { .. }
                            if host.status == HostStatus::Up =>
                        {
                            info!(log, "VM is alive on a healthy host");
                            return Ok(Disposition::Done);
                        }
                        Liveness::Alive { .. } => {
                            info!(log, "VM is alive but its host is not up";
                                  "host_status" => %host.status);
                            return Ok(Disposition::Retry(self.after(
                                self.config.investigate_retry_interval,
                            )));
                        }
                        Liveness::Undetermined => {
                            info!(log, "VM state unknown, fencing it off");
                            self.fencers.fence_off(log, vm, &host).is_some()
                        }
                    };

                if !fenced {
                    warn!(log, "unable to fence off VM, not restarting");
                    self.vm_alert(
                        vm,
                        format!(
                            "Unable to fence off {} ({}) on host {}",
                            vm.name, vm.id, host.name
                        ),
                        format!(
                            "{} cannot be restarted until it is known to be \
                             isolated from {}",
                            vm.name, host.name
                        ),
                    );
                    return Ok(Disposition::Retry(
                        self.after(self.config.restart_retry_interval),
                    ));
                }
            }
            None => {
                info!(log, "host was removed, skipping investigation";
                      "host" => %work.host_id);
            }
        }

        self.force_stop(log, vm.id)?;
        work.step = Step::Scheduled;
        self.refresh_snapshot(work);
        Ok(Disposition::Requeue)
    }

    fn migrate(
        &self,
        log: &Logger,
        work: &mut WorkItem,
    ) -> Result<Disposition, HaError> {
        let Some(vm) = self.lifecycle.find_vm(work.instance_id) else {
            info!(log, "VM no longer exists");
            return Ok(Disposition::Done);
        };
        if !snapshot_matches(work, &vm)
            || vm.state != State::Running
            || vm.host_id != Some(work.host_id)
        {
            info!(log, "VM changed since migration was scheduled";
                  "state" => %vm.state,
                  "update_counter" => vm.update_counter,
                  "host" => ?vm.host_id);
            return Ok(Disposition::Done);
        }

        work.step = Step::Migrating;
        self.queue.update(self.server_id, work)?;

        match self.lifecycle.migrate_away(vm.id, work.host_id) {
            Ok(()) => {
                info!(log, "VM migrated away"; "source" => %work.host_id);
                Ok(Disposition::Done)
            }
            Err(LifecycleError::InsufficientServerCapacity(reason)) => {
                warn!(log, "no capacity to migrate VM"; "reason" => reason);
                self.resources.migrate_away_failed(work.host_id, vm.id);
                self.refresh_snapshot(work);
                Ok(Disposition::Retry(
                    self.after(self.config.migrate_retry_interval),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn stop_vm(
        &self,
        log: &Logger,
        work: &WorkItem,
    ) -> Result<Disposition, HaError> {
        let Some(vm) = self.lifecycle.find_vm(work.instance_id) else {
            info!(log, "VM no longer exists");
            return Ok(Disposition::Done);
        };

        let (validate, force) = match work.work_type {
            WorkType::CheckStop => (true, false),
            WorkType::ForceStop => (true, true),
            _ => (false, false),
        };
        if validate
            && (!snapshot_matches(work, &vm)
                || vm.host_id != Some(work.host_id))
        {
            info!(log, "VM changed since stop was scheduled";
                  "state" => %vm.state,
                  "update_counter" => vm.update_counter,
                  "host" => ?vm.host_id);
            return Ok(Disposition::Done);
        }

        if force {
            self.force_stop(log, vm.id)?;
            return Ok(Disposition::Done);
        }

        match self.lifecycle.advance_stop(vm.id, false) {
            Ok(()) => {
                info!(log, "VM stopped");
                Ok(Disposition::Done)
            }
            Err(e) if is_retryable(&e) => {
                warn!(log, "unable to stop VM"; "error" => %e);
                Ok(Disposition::Retry(
                    self.after(self.config.stop_retry_interval),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn destroy_vm(
        &self,
        log: &Logger,
        work: &WorkItem,
    ) -> Result<Disposition, HaError> {
        let Some(vm) = self.lifecycle.find_vm(work.instance_id) else {
            info!(log, "VM no longer exists");
            return Ok(Disposition::Done);
        };
        if vm.state != State::Destroyed {
            info!(log, "VM is no longer destroyed"; "state" => %vm.state);
            return Ok(Disposition::Done);
        }

        match self.lifecycle.destroy(vm.id, false) {
            Ok(()) => {
                info!(log, "VM destroyed");
                Ok(Disposition::Done)
            }
            Err(e) if is_retryable(&e) => {
                warn!(log, "unable to destroy VM"; "error" => %e);
                Ok(Disposition::Retry(
                    self.after(self.config.stop_retry_interval),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::investigate::{
        FenceBuilder, HostStatus, InvestigationError, Investigator,
    };
    use crate::lifecycle::{AlertType, Host, LifecycleError, VmRecord};
    use crate::orchestrator::tests::{test_host, test_vm, Harness};
    use crate::queue::WorkQueue;
    use crate::vm_state::State;
    use crate::work::{HostId, NewWork, Step, VmId, VmType, WorkType};

    struct Answer(Result<bool, InvestigationError>);

    impl Investigator for Answer {
        fn name(&self) -> &str {
            "answer"
        }

        fn is_vm_alive(
            &self,
            _vm: &VmRecord,
            _host: &Host,
        ) -> Result<bool, InvestigationError> {
            self.0.clone()
        }

        fn is_agent_alive(&self, _host: &Host) -> Option<HostStatus> {
            None
        }
    }

    struct Fence(Option<bool>);

    impl FenceBuilder for Fence {
        fn name(&self) -> &str {
            "fence"
        }

        fn fence_off(&self, _vm: &VmRecord, _host: &Host) -> Option<bool> {
            self.0
        }
    }

    fn undetermined() -> Arc<dyn Investigator> {
        Arc::new(Answer(Err(InvestigationError::UnknownVm("vm1".into()))))
    }

    /// Seeds the queue with an HA item for a VM running on host 7.
    fn seed_investigation(h: &Harness) {
        h.queue
            .persist(NewWork {
                instance_id: VmId(1),
                vm_type: VmType::User,
                work_type: WorkType::HA,
                step: Step::Investigating,
                host_id: HostId(7),
                previous_state: State::Running,
                previous_update_counter: 10,
                times_tried: 0,
            })
            .unwrap();
    }

    fn seed(h: &Harness, work_type: WorkType, state: State) {
        h.queue
            .persist(NewWork {
                instance_id: VmId(1),
                vm_type: VmType::User,
                work_type,
                step: Step::Scheduled,
                host_id: HostId(7),
                previous_state: state,
                previous_update_counter: 10,
                times_tried: 0,
            })
            .unwrap();
    }

    #[test]
    fn unfenceable_vm_is_never_restarted() {
        let mut h = Harness::new();
        h.investigators = vec![undetermined()];
        h.fence_builders =
            vec![Arc::new(Fence(None)), Arc::new(Fence(Some(false)))];
        h.lifecycle
            .expect_find_vm()
            .returning(|_| Some(test_vm(1, State::Running, Some(7))));
        h.lifecycle.expect_advance_start().never();
        h.lifecycle.expect_advance_stop().never();
        h.lifecycle.expect_migrate_away().never();
        h.lifecycle.expect_destroy().never();
        h.resources
            .expect_find_host()
            .returning(|id| Some(test_host(id.0, HostStatus::Disconnected)));
        h.alerts
            .expect_send_alert()
            .withf(|alert| alert.subject.contains("Unable to fence"))
            .times(1)
            .return_const(());
        seed_investigation(&h);
        let (orch, queue) = h.build();

        assert!(orch.run_once());
        let item = &queue.snapshot()[0];
        assert_eq!(item.step, Step::Investigating);
        assert_eq!(item.times_tried, 1);
        assert_eq!(item.taken_by, None);
    }

    #[test]
    fn fenced_vm_is_stopped_and_rearmed_without_a_charge() {
        let mut h = Harness::new();
        h.investigators = vec![undetermined()];
        h.fence_builders = vec![Arc::new(Fence(Some(true)))];
        let mut seq = mockall::Sequence::new();
        h.lifecycle
            .expect_find_vm()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Some(test_vm(1, State::Running, Some(7))));
        h.lifecycle
            .expect_advance_stop()
            .withf(|vm, force| *vm == VmId(1) && *force)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        h.lifecycle
            .expect_find_vm()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                let mut vm = test_vm(1, State::Stopped, None);
                vm.update_counter = 12;
                Some(vm)
            });
        h.lifecycle.expect_advance_start().never();
        h.resources
            .expect_find_host()
            .returning(|id| Some(test_host(id.0, HostStatus::Disconnected)));
        seed_investigation(&h);
        let (orch, queue) = h.build();

        assert!(orch.run_once());
        let item = &queue.snapshot()[0];
        assert_eq!(item.step, Step::Scheduled);
        assert_eq!(item.times_tried, 0);
        assert_eq!(item.previous_state, State::Stopped);
        assert_eq!(item.previous_update_counter, 12);
        assert_eq!(item.taken_by, None);
    }

    #[test]
    fn live_vm_on_healthy_host_needs_nothing() {
        let mut h = Harness::new();
        h.investigators = vec![Arc::new(Answer(Ok(true)))];
        h.lifecycle
            .expect_find_vm()
            .returning(|_| Some(test_vm(1, State::Running, Some(7))));
        h.lifecycle.expect_advance_stop().never();
        h.resources
            .expect_find_host()
            .returning(|id| Some(test_host(id.0, HostStatus::Up)));
        seed_investigation(&h);
        let (orch, queue) = h.build();

        assert!(orch.run_once());
        assert!(queue.snapshot()[0].is_done());
    }

    #[test]
    fn live_vm_on_unreachable_host_is_checked_again() {
        let mut h = Harness::new();
        h.investigators = vec![Arc::new(Answer(Ok(true)))];
        h.lifecycle
            .expect_find_vm()
            .returning(|_| Some(test_vm(1, State::Running, Some(7))));
        h.lifecycle.expect_advance_stop().never();
        h.resources
            .expect_find_host()
            .returning(|id| Some(test_host(id.0, HostStatus::Alert)));
        seed_investigation(&h);
        let (orch, queue) = h.build();

        assert!(orch.run_once());
        let item = &queue.snapshot()[0];
        assert_eq!(item.step, Step::Investigating);
        assert_eq!(item.times_tried, 1);
    }

    #[test]
    fn stale_restart_is_a_no_op() {
        let mut h = Harness::new();
        h.investigators = vec![Arc::new(Answer(Ok(false)))];
        h.lifecycle.expect_find_vm().returning(|_| {
            let mut vm = test_vm(1, State::Running, Some(7));
            vm.update_counter = 11;
            Some(vm)
        });
        h.lifecycle.expect_advance_start().never();
        h.lifecycle.expect_advance_stop().never();
        h.resources.expect_find_host().never();
        seed_investigation(&h);
        let (orch, queue) = h.build();

        assert!(orch.run_once());
        assert!(queue.snapshot()[0].is_done());
    }

    #[test]
    fn stale_check_stop_is_a_no_op() {
        let mut h = Harness::new();
        h.lifecycle.expect_find_vm().returning(|_| {
            let mut vm = test_vm(1, State::Running, Some(7));
            vm.update_counter = 11;
            Some(vm)
        });
        h.lifecycle.expect_advance_stop().never();
        seed(&h, WorkType::CheckStop, State::Running);
        let (orch, queue) = h.build();

        assert!(orch.run_once());
        assert!(queue.snapshot()[0].is_done());
    }

    #[test]
    fn stop_of_vanished_vm_closes_quietly() {
        let mut h = Harness::new();
        h.lifecycle.expect_find_vm().returning(|_| None);
        h.lifecycle.expect_advance_stop().never();
        h.alerts.expect_send_alert().never();
        seed(&h, WorkType::ForceStop, State::Running);
        let (orch, queue) = h.build();

        assert!(orch.run_once());
        assert!(queue.snapshot()[0].is_done());
    }

    #[test]
    fn restart_falls_back_to_the_ha_planner() {
        let mut h = Harness::new();
        h.config.ha_tag = Some("ha".to_string());
        let mut seq = mockall::Sequence::new();
        h.lifecycle
            .expect_find_vm()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Some(test_vm(1, State::Stopped, None)));
        h.lifecycle
            .expect_advance_start()
            .withf(|_, params| {
                params.planner.is_none()
                    && params.ha_operation
                    && params.ha_tag.as_deref() == Some("ha")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Err(LifecycleError::InsufficientCapacity("full".into()))
            });
        h.lifecycle
            .expect_advance_start()
            .withf(|_, params| params.planner.as_deref() == Some("HAPlanner"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        h.lifecycle
            .expect_find_vm()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Some(test_vm(1, State::Running, Some(8))));
        h.alerts
            .expect_clear_alert()
            .withf(|alert_type, _, _| *alert_type == AlertType::UserVm)
            .times(1)
            .return_const(());
        seed(&h, WorkType::HA, State::Stopped);
        let (orch, queue) = h.build();

        assert!(orch.run_once());
        let item = &queue.snapshot()[0];
        assert!(item.is_done());
        assert_eq!(item.times_tried, 0);
    }

    #[test]
    fn failed_restarts_stop_at_the_retry_bound() {
        let mut h = Harness::new();
        h.lifecycle
            .expect_find_vm()
            .returning(|_| Some(test_vm(1, State::Stopped, None)));
        // Each attempt tries the VM's own planner, then the HA planner.
        h.lifecycle.expect_advance_start().times(6).returning(|_, _| {
            Err(LifecycleError::InsufficientCapacity("full".into()))
        });
        h.alerts
            .expect_send_alert()
            .withf(|alert| alert.subject.starts_with("Unable to restart"))
            .times(3)
            .return_const(());
        h.alerts
            .expect_send_alert()
            .withf(|alert| alert.subject.starts_with("Giving up"))
            .times(1)
            .return_const(());
        seed(&h, WorkType::HA, State::Stopped);
        let (orch, queue) = h.build();

        while orch.run_once() {}
        let item = &queue.snapshot()[0];
        assert!(item.is_done());
        assert_eq!(item.times_tried, 3);
    }

    #[test]
    fn disabled_ha_closes_scheduled_restart() {
        let mut h = Harness::new();
        h.lifecycle.expect_find_vm().returning(|_| {
            let mut vm = test_vm(1, State::Stopped, None);
            vm.ha_enabled = false;
            Some(vm)
        });
        h.lifecycle.expect_advance_start().never();
        seed(&h, WorkType::HA, State::Stopped);
        let (orch, queue) = h.build();

        assert!(orch.run_once());
        assert!(queue.snapshot()[0].is_done());
    }

    #[test]
    fn newer_restart_supersedes_older() {
        let mut h = Harness::new();
        h.lifecycle.expect_find_vm().never();
        seed(&h, WorkType::HA, State::Stopped);
        seed(&h, WorkType::HA, State::Stopped);
        let (orch, queue) = h.build();

        // The older item is due first and finds the newer one waiting.
        assert!(orch.run_once());
        let items = queue.snapshot();
        assert!(items[0].is_done());
        assert!(!items[1].is_done());
        assert_eq!(items[1].taken_by, None);
    }

    #[test]
    fn migration_capacity_failures_are_reported_and_bounded() {
        let mut h = Harness::new();
        h.lifecycle
            .expect_find_vm()
            .returning(|_| Some(test_vm(1, State::Running, Some(7))));
        h.lifecycle
            .expect_migrate_away()
            .withf(|vm, host| *vm == VmId(1) && *host == HostId(7))
            .times(3)
            .returning(|_, _| {
                Err(LifecycleError::InsufficientServerCapacity("full".into()))
            });
        h.resources
            .expect_migrate_away_failed()
            .withf(|host, vm| *host == HostId(7) && *vm == VmId(1))
            .times(3)
            .return_const(());
        h.alerts
            .expect_send_alert()
            .withf(|alert| alert.subject.starts_with("Giving up"))
            .times(1)
            .return_const(());
        seed(&h, WorkType::Migration, State::Running);
        let (orch, queue) = h.build();

        while orch.run_once() {}
        let item = &queue.snapshot()[0];
        assert!(item.is_done());
        assert_eq!(item.step, Step::Done);
        assert_eq!(item.times_tried, 3);
    }

    #[test]
    fn unexpected_migration_error_is_caught_and_rescheduled() {
        let mut h = Harness::new();
        h.lifecycle
            .expect_find_vm()
            .returning(|_| Some(test_vm(1, State::Running, Some(7))));
        h.lifecycle.expect_migrate_away().times(1).returning(|_, _| {
            Err(LifecycleError::Other(anyhow::anyhow!("agent exploded")))
        });
        h.resources.expect_migrate_away_failed().never();
        h.alerts
            .expect_send_alert()
            .withf(|alert| alert.subject.starts_with("Unable to process"))
            .times(1)
            .return_const(());
        seed(&h, WorkType::Migration, State::Running);
        let (orch, queue) = h.build();

        assert!(orch.run_once());
        let item = &queue.snapshot()[0];
        assert!(!item.is_done());
        assert_eq!(item.step, Step::Migrating);
        assert_eq!(item.times_tried, 1);
        assert_eq!(item.taken_by, None);
    }

    #[test]
    fn stale_migration_is_closed_without_acting() {
        let mut h = Harness::new();
        h.lifecycle.expect_find_vm().returning(|_| {
            // Rebooted in place since the migration was scheduled.
            let mut vm = test_vm(1, State::Running, Some(7));
            vm.update_counter = 99;
            Some(vm)
        });
        h.lifecycle.expect_migrate_away().never();
        h.resources.expect_migrate_away_failed().never();
        h.alerts.expect_send_alert().never();
        seed(&h, WorkType::Migration, State::Running);
        let (orch, queue) = h.build();

        assert!(orch.run_once());
        let item = &queue.snapshot()[0];
        assert!(item.is_done());
        assert_eq!(item.times_tried, 0);
    }

    #[test]
    fn migration_retry_tracks_the_current_record() {
        let mut h = Harness::new();
        let mut seq = mockall::Sequence::new();
        h.lifecycle
            .expect_find_vm()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Some(test_vm(1, State::Running, Some(7))));
        h.lifecycle
            .expect_migrate_away()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Err(LifecycleError::InsufficientServerCapacity("full".into()))
            });
        h.lifecycle.expect_find_vm().returning(|_| {
            let mut vm = test_vm(1, State::Running, Some(7));
            vm.update_counter = 12;
            Some(vm)
        });
        h.resources.expect_migrate_away_failed().return_const(());
        seed(&h, WorkType::Migration, State::Running);
        let (orch, queue) = h.build();

        assert!(orch.run_once());
        let item = &queue.snapshot()[0];
        assert!(!item.is_done());
        assert_eq!(item.previous_state, State::Running);
        assert_eq!(item.previous_update_counter, 12);
    }

    #[test]
    fn destroy_retries_timeouts() {
        let mut h = Harness::new();
        h.lifecycle
            .expect_find_vm()
            .returning(|_| Some(test_vm(1, State::Destroyed, None)));
        let mut seq = mockall::Sequence::new();
        h.lifecycle
            .expect_destroy()
            .withf(|vm, expunge| *vm == VmId(1) && !*expunge)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Err(LifecycleError::OperationTimedOut("agent".into()))
            });
        h.lifecycle
            .expect_destroy()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        seed(&h, WorkType::Destroy, State::Destroyed);
        let (orch, queue) = h.build();

        assert!(orch.run_once());
        assert_eq!(queue.snapshot()[0].times_tried, 1);
        assert!(orch.run_once());
        assert!(queue.snapshot()[0].is_done());
        assert!(!orch.run_once());
    }

    #[test]
    fn destroy_of_recovered_vm_does_nothing() {
        let mut h = Harness::new();
        h.lifecycle
            .expect_find_vm()
            .returning(|_| Some(test_vm(1, State::Stopped, None)));
        h.lifecycle.expect_destroy().never();
        seed(&h, WorkType::Destroy, State::Destroyed);
        let (orch, queue) = h.build();

        assert!(orch.run_once());
        assert!(queue.snapshot()[0].is_done());
    }
}
