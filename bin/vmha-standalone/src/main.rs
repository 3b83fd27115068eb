// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use slog::{info, o, warn, Drain};

use vmha::investigate::HostStatus;
use vmha::lifecycle::Host;
use vmha::queue::InMemoryWorkQueue;
use vmha::sim::SimCloud;
use vmha::work::{HostId, PodId, ServerId, VmId, ZoneId};
use vmha::{Collaborators, Orchestrator};

mod config;

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow::anyhow!("Invalid log level"))
}

#[derive(Parser)]
#[clap(about, version)]
/// Replays a host failure against a simulated cloud and reports how the HA
/// orchestrator recovered from it.
struct Args {
    #[clap(value_name = "SCENARIO", action)]
    scenario: PathBuf,

    #[clap(long, default_value = "info", value_parser = parse_log_level)]
    log_level: slog::Level,

    /// Process work on the main thread, one item at a time, stopping after
    /// N items or once nothing is ready to run.
    #[clap(long, value_name = "N", action)]
    max_steps: Option<usize>,
}

fn build_logger(
    level: slog::Level,
) -> (slog::Logger, slog_async::AsyncGuard) {
    let (main_drain, guard) = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_with_guard()
    } else {
        let drain =
            slog_bunyan::with_name("vmha-standalone", std::io::stdout())
                .build()
                .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_with_guard()
    };

    let filtered = slog::LevelFilter::new(main_drain, level);
    (slog::Logger::root(filtered.fuse(), o!()), guard)
}

fn populate(cloud: &SimCloud, config: &config::Config) -> anyhow::Result<()> {
    for host in &config.hosts {
        cloud.add_host(Host {
            id: HostId(host.id),
            name: host.name.clone(),
            kind: host.kind.into(),
            status: HostStatus::Up,
            zone_id: ZoneId(host.zone),
            pod_id: PodId(host.pod),
        });
    }
    for vm in &config.vms {
        cloud
            .add_vm(
                VmId(vm.id),
                &vm.name,
                vm.vm_type.into(),
                vm.ha_enabled,
                vm.host.map(HostId),
            )
            .with_context(|| format!("creating vm {}", vm.id))?;
    }
    Ok(())
}

fn inject_failures(cloud: &SimCloud, scenario: &config::Scenario) {
    cloud.set_fence_result(scenario.fence.result());
    cloud.fail_next_starts(scenario.start_shortages);
    cloud.set_default_planner_full(scenario.default_planner_full);
    for vm in &scenario.alive_vms {
        cloud.set_vm_alive(VmId(*vm), Some(true));
    }
    for vm in &scenario.dead_vms {
        cloud.set_vm_alive(VmId(*vm), Some(false));
    }
    for host in &scenario.fail_hosts {
        cloud.set_host_status(HostId(*host), scenario.failure.into());
    }
}

fn main() -> anyhow::Result<()> {
    let Args { scenario, log_level, max_steps } = Args::parse();
    let config = config::parse(&scenario)?;
    let (log, _log_async_guard) = build_logger(log_level);

    let cloud = SimCloud::new(log.new(o!("component" => "sim")));
    populate(&cloud, &config)?;

    let queue = Arc::new(InMemoryWorkQueue::new());
    let orch = Orchestrator::new(
        log.clone(),
        ServerId(config.orchestrator.server.id),
        config.orchestrator.ha.clone(),
        Collaborators {
            queue: queue.clone(),
            lifecycle: cloud.clone(),
            resources: cloud.clone(),
            alerts: cloud.clone(),
            investigators: vec![cloud.investigator()],
            fence_builders: vec![cloud.fencer()],
        },
    );

    inject_failures(&cloud, &config.scenario);
    for host in &config.scenario.fail_hosts {
        let scheduled = orch
            .schedule_restart_for_vms_on_host(
                HostId(*host),
                config.scenario.investigate,
            )
            .with_context(|| format!("scheduling restarts for host {host}"))?;
        info!(log, "host failed"; "host" => host, "restarts" => scheduled);
    }

    match max_steps {
        Some(limit) => {
            let mut steps = 0;
            while steps < limit && orch.run_once() {
                steps += 1;
            }
            info!(log, "stepped through work"; "steps" => steps);
        }
        None => {
            orch.start().context("starting HA workers")?;
            let timeout = Duration::from_secs(config.scenario.timeout);
            let deadline = Instant::now() + timeout;
            while queue.snapshot().iter().any(|work| !work.is_done()) {
                if Instant::now() >= deadline {
                    warn!(log, "timed out waiting for work to finish");
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            orch.stop();
        }
    }

    for vm in cloud.vms() {
        info!(log, "final VM state";
              "vm" => %vm.id,
              "name" => %vm.name,
              "state" => %vm.state,
              "host" => ?vm.host_id.map(|h| h.0));
    }
    for alert in cloud.alerts() {
        warn!(log, "alert raised";
              "type" => %alert.alert_type,
              "subject" => %alert.subject);
    }

    let unfinished: Vec<_> = queue
        .snapshot()
        .into_iter()
        .filter(|work| !work.is_done())
        .collect();
    for work in &unfinished {
        warn!(log, "work left unfinished";
              "work" => %work,
              "tried" => work.times_tried);
    }
    if !unfinished.is_empty() {
        bail!("{} work items did not finish", unfinished.len());
    }
    Ok(())
}
