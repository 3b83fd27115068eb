// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;
use std::time::{Duration, Instant};

use slog::Logger;
use vmha::config::HaConfig;
use vmha::investigate::HostStatus;
use vmha::lifecycle::{AlertType, Host, HostKind};
use vmha::queue::{InMemoryWorkQueue, QueueError, WorkQueue};
use vmha::sim::{SimCall, SimCloud};
use vmha::vm_state::{Event, State};
use vmha::work::{
    HostId, PodId, ServerId, Step, VmId, VmType, WorkType, ZoneId,
};
use vmha::{ClusterListener, Collaborators, HaError, Orchestrator};

fn test_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

fn config() -> HaConfig {
    HaConfig {
        max_retries: 3,
        stop_retry_interval: 0,
        restart_retry_interval: 0,
        migrate_retry_interval: 0,
        investigate_retry_interval: 0,
        ..Default::default()
    }
}

fn cloud() -> Arc<SimCloud> {
    let cloud = SimCloud::new(test_logger());
    for id in 1..=2 {
        cloud.add_host(Host {
            id: HostId(id),
            name: format!("host{id}"),
            kind: HostKind::Routing,
            status: HostStatus::Up,
            zone_id: ZoneId(1),
            pod_id: PodId(1),
        });
    }
    cloud
}

fn orchestrator(
    cloud: &Arc<SimCloud>,
    queue: &Arc<InMemoryWorkQueue>,
    server: ServerId,
    config: HaConfig,
) -> Orchestrator {
    Orchestrator::new(
        test_logger(),
        server,
        config,
        Collaborators {
            queue: queue.clone(),
            lifecycle: cloud.clone(),
            resources: cloud.clone(),
            alerts: cloud.clone(),
            investigators: vec![cloud.investigator()],
            fence_builders: vec![cloud.fencer()],
        },
    )
}

struct Fixture {
    cloud: Arc<SimCloud>,
    queue: Arc<InMemoryWorkQueue>,
    orch: Orchestrator,
}

fn fixture() -> Fixture {
    let cloud = cloud();
    let queue = Arc::new(InMemoryWorkQueue::new());
    let orch = orchestrator(&cloud, &queue, ServerId(1), config());
    Fixture { cloud, queue, orch }
}

fn add_user_vm(cloud: &SimCloud, id: u64, host: u64) {
    let name = format!("vm{id}");
    cloud
        .add_vm(VmId(id), &name, VmType::User, true, Some(HostId(host)))
        .unwrap();
}

#[test]
fn disconnected_host_is_fenced_then_restarted_elsewhere() {
    let f = fixture();
    add_user_vm(&f.cloud, 1, 1);
    f.cloud.set_host_status(HostId(1), HostStatus::Disconnected);
    f.cloud.set_fence_result(Some(true));

    assert_eq!(
        f.orch.schedule_restart_for_vms_on_host(HostId(1), true).unwrap(),
        1
    );
    let item = f.queue.snapshot()[0].clone();
    assert_eq!(item.work_type, WorkType::HA);
    assert_eq!(item.step, Step::Investigating);
    assert_eq!(item.previous_state, State::Running);
    assert_eq!(item.host_id, HostId(1));
    assert!(f
        .cloud
        .alerts()
        .iter()
        .any(|alert| alert.alert_type == AlertType::Host));

    // Investigation: nobody knows, so the VM is fenced and force-stopped.
    assert!(f.orch.run_once());
    let item = f.queue.get(item.id).unwrap();
    assert_eq!(item.step, Step::Scheduled);
    assert_eq!(item.times_tried, 0);
    assert_eq!(
        f.cloud.calls(),
        vec![SimCall::AdvanceStop { vm: VmId(1), force: true }]
    );

    // Restart on the surviving host.
    assert!(f.orch.run_once());
    let item = f.queue.get(item.id).unwrap();
    assert!(item.is_done());
    assert_eq!(item.times_tried, 0);
    assert_eq!(
        f.cloud.calls().last(),
        Some(&SimCall::AdvanceStart { vm: VmId(1), planner: None })
    );

    let vm = f.cloud.vm(VmId(1)).unwrap();
    assert_eq!(vm.state, State::Running);
    assert_eq!(vm.host_id, Some(HostId(2)));
    assert!(f
        .cloud
        .cleared_alerts()
        .iter()
        .any(|(alert_type, _, _)| *alert_type == AlertType::UserVm));
    assert!(!f.orch.run_once());
    assert!(!f.orch.has_pending_ha_work(VmId(1)).unwrap());
}

#[test]
fn vm_known_dead_needs_no_fence() {
    let f = fixture();
    add_user_vm(&f.cloud, 1, 1);
    f.cloud.set_host_status(HostId(1), HostStatus::Down);
    f.cloud.set_vm_alive(VmId(1), Some(false));

    f.orch.schedule_restart(VmId(1), true).unwrap();
    while f.orch.run_once() {}

    let vm = f.cloud.vm(VmId(1)).unwrap();
    assert_eq!(vm.state, State::Running);
    assert_eq!(vm.host_id, Some(HostId(2)));
}

#[test]
fn unfenceable_vm_is_left_alone() {
    let f = fixture();
    add_user_vm(&f.cloud, 1, 1);
    f.cloud.set_host_status(HostId(1), HostStatus::Disconnected);
    f.cloud.set_fence_result(None);

    f.orch.schedule_restart(VmId(1), true).unwrap();
    assert!(f.orch.run_once());
    let item = f.queue.snapshot()[0].clone();
    assert_eq!(item.step, Step::Investigating);
    assert_eq!(item.times_tried, 1);

    while f.orch.run_once() {}
    let item = f.queue.get(item.id).unwrap();
    assert!(item.is_done());
    assert_eq!(item.times_tried, 3);

    assert!(f.cloud.calls().is_empty());
    assert_eq!(f.cloud.vm(VmId(1)).unwrap().state, State::Running);
    let alerts = f.cloud.alerts();
    assert!(alerts.iter().any(|a| a.subject.starts_with("Unable to fence")));
    assert!(alerts.iter().any(|a| a.subject.starts_with("Giving up")));
}

#[test]
fn migration_without_capacity_gives_up_after_max_retries() {
    let f = fixture();
    add_user_vm(&f.cloud, 1, 1);
    f.cloud.set_migration_blocked(true);

    f.orch.schedule_migration(VmId(1)).unwrap();
    let mut passes = 0;
    while f.orch.run_once() {
        passes += 1;
    }
    assert_eq!(passes, 3);

    let calls = f.cloud.calls();
    let migrations = calls
        .iter()
        .filter(|c| {
            **c == SimCall::MigrateAway { vm: VmId(1), source: HostId(1) }
        })
        .count();
    let failures = calls
        .iter()
        .filter(|c| {
            **c == SimCall::MigrateAwayFailed { host: HostId(1), vm: VmId(1) }
        })
        .count();
    assert_eq!(migrations, 3);
    assert_eq!(failures, 3);

    let item = &f.queue.snapshot()[0];
    assert!(item.is_done());
    assert_eq!(item.times_tried, 3);
    assert!(f
        .cloud
        .alerts()
        .iter()
        .any(|alert| alert.subject.starts_with("Giving up")));
    assert_eq!(f.cloud.vm(VmId(1)).unwrap().host_id, Some(HostId(1)));
}

#[test]
fn successful_migration_moves_the_vm() {
    let f = fixture();
    add_user_vm(&f.cloud, 1, 1);

    f.orch.schedule_migration(VmId(1)).unwrap();
    assert!(f.orch.run_once());

    assert_eq!(f.cloud.vm(VmId(1)).unwrap().host_id, Some(HostId(2)));
    assert!(f.queue.snapshot()[0].is_done());
    assert!(!f.orch.has_pending_migrations_work(VmId(1)).unwrap());
}

#[test]
fn check_stop_is_skipped_when_the_vm_changed() {
    let f = fixture();
    add_user_vm(&f.cloud, 1, 1);

    f.orch.schedule_stop(VmId(1), HostId(1), WorkType::CheckStop).unwrap();
    // The agent reports in before the stop is processed; the state is the
    // same but the record is not.
    f.cloud.report(VmId(1), Event::AgentReportRunning).unwrap();

    assert!(f.orch.run_once());
    assert!(f.queue.snapshot()[0].is_done());
    assert!(f.cloud.calls().is_empty());
    assert_eq!(f.cloud.vm(VmId(1)).unwrap().state, State::Running);
}

#[test]
fn stop_retries_until_the_host_answers() {
    let f = fixture();
    add_user_vm(&f.cloud, 1, 1);
    f.cloud.fail_next_stops(1);

    f.orch.schedule_stop(VmId(1), HostId(1), WorkType::Stop).unwrap();
    assert!(f.orch.run_once());
    assert_eq!(f.queue.snapshot()[0].times_tried, 1);
    assert!(f.orch.run_once());

    assert!(f.queue.snapshot()[0].is_done());
    assert_eq!(f.cloud.vm(VmId(1)).unwrap().state, State::Stopped);
}

#[test]
fn known_failure_restarts_with_the_ha_planner() {
    let f = fixture();
    add_user_vm(&f.cloud, 1, 1);
    f.cloud.set_host_status(HostId(1), HostStatus::Down);
    f.cloud.set_default_planner_full(true);

    let item = f.orch.schedule_restart(VmId(1), false).unwrap().unwrap();
    assert_eq!(item.step, Step::Scheduled);
    assert_eq!(item.previous_state, State::Stopped);

    assert!(f.orch.run_once());
    assert!(f.queue.get(item.id).unwrap().is_done());
    assert_eq!(
        f.cloud.calls(),
        vec![
            SimCall::AdvanceStop { vm: VmId(1), force: true },
            SimCall::AdvanceStart { vm: VmId(1), planner: None },
            SimCall::AdvanceStart {
                vm: VmId(1),
                planner: Some("HAPlanner".to_string()),
            },
        ]
    );
    assert_eq!(f.cloud.vm(VmId(1)).unwrap().state, State::Running);
}

#[test]
fn destroy_is_retried_after_a_timeout() {
    let f = fixture();
    f.cloud
        .add_vm(VmId(1), "gone", VmType::User, false, None)
        .unwrap();
    f.cloud.report(VmId(1), Event::DestroyRequested).unwrap();
    f.cloud.fail_next_destroys(1);

    f.orch.schedule_destroy(VmId(1), HostId(1)).unwrap();
    assert!(f.orch.run_once());
    assert!(f.orch.run_once());
    assert!(!f.orch.run_once());

    assert!(f.queue.snapshot()[0].is_done());
    assert_eq!(
        f.cloud
            .calls()
            .iter()
            .filter(|c| matches!(c, SimCall::Destroy { .. }))
            .count(),
        2
    );
}

#[test]
fn departed_server_work_is_taken_over() {
    let cloud = cloud();
    let queue = Arc::new(InMemoryWorkQueue::new());
    let a = orchestrator(&cloud, &queue, ServerId(1), config());
    let b = orchestrator(&cloud, &queue, ServerId(2), config());
    add_user_vm(&cloud, 1, 1);

    a.schedule_stop(VmId(1), HostId(1), WorkType::Stop).unwrap();
    // Server 1 leases the item, then dies without finishing it.
    let orphan = queue.take(ServerId(1)).unwrap().unwrap();
    assert!(!b.run_once());

    b.on_server_joined(&[ServerId(3)]);
    b.on_server_left(&[ServerId(1)]);
    assert!(b.run_once());
    assert!(queue.get(orphan.id).unwrap().is_done());
    assert_eq!(cloud.vm(VmId(1)).unwrap().state, State::Stopped);

    // The dead server's stale copy can no longer be written back.
    assert!(matches!(
        queue.update(ServerId(1), &orphan),
        Err(QueueError::LeaseLost { .. })
    ));
}

#[test]
fn queue_outage_is_survivable() {
    let f = fixture();
    add_user_vm(&f.cloud, 1, 1);
    f.orch.schedule_stop(VmId(1), HostId(1), WorkType::Stop).unwrap();

    f.queue.set_available(false);
    assert!(!f.orch.run_once());
    assert!(matches!(
        f.orch.schedule_migration(VmId(1)),
        Err(HaError::Queue(QueueError::Unavailable))
    ));

    f.queue.set_available(true);
    assert!(f.orch.run_once());
}

#[test]
fn worker_threads_recover_a_failed_host() {
    let cloud = cloud();
    let queue = Arc::new(InMemoryWorkQueue::new());
    let orch = orchestrator(
        &cloud,
        &queue,
        ServerId(1),
        HaConfig { workers: 2, ..config() },
    );
    cloud
        .add_vm(
            VmId(1),
            "router",
            VmType::DomainRouter,
            true,
            Some(HostId(1)),
        )
        .unwrap();
    for id in 2..=4 {
        add_user_vm(&cloud, id, 1);
    }
    cloud.set_host_status(HostId(1), HostStatus::Disconnected);
    cloud.set_fence_result(Some(true));

    orch.start().unwrap();
    let scheduled =
        orch.schedule_restart_for_vms_on_host(HostId(1), true).unwrap();
    assert_eq!(scheduled, 4);

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let vms = cloud.vms();
        if vms.iter().all(|vm| {
            vm.state == State::Running && vm.host_id == Some(HostId(2))
        }) {
            break;
        }
        assert!(Instant::now() < deadline, "VMs not recovered: {vms:?}");
        std::thread::sleep(Duration::from_millis(5));
    }
    orch.stop();

    for id in 1..=4 {
        assert!(!orch.has_pending_ha_work(VmId(id)).unwrap());
    }
}
