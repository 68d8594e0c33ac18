// Copyright (c) copart.
//
// The interval-driven supervisor: pre-sleep snapshots, the PI-adjusted
// sleep, post-sleep sampling into the counter stores, lifecycle
// transitions, policy application.
use anyhow::{anyhow, bail, Result};
use copart_agent_intf::PerfMode;
use copart_util::prog_exiting;
use log::{debug, info, warn};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::counters::{self, Counter, CounterStore, CounterVec};
use super::cpustat::{self, NUM_CPU_STATES};
use super::ovs;
use super::perf::{self, Perf};
use super::policy::Policy;
use super::rdt::{Rdt, RdtValues};
use super::report::{self, Reports};
use super::vm;
use super::workload::{Payload, Status, Workload};

const KP: f64 = 0.5;
const KI: f64 = 0.25;

/// PI controller for the inter-interval sleep. Feedback converges the k-th
/// interval boundary to k times the target period. A negative outcome is
/// clamped to zero unless a task completed this interval, in which case
/// the negative carry survives to the next round.
pub fn adjust_delay(
    adj_delay_us: i64,
    target_us: i64,
    elapsed_us: i64,
    total_elapsed_us: i64,
    interval: u64,
    new_task_completion: bool,
) -> i64 {
    let proportional = target_us - elapsed_us;
    let integral = target_us * (interval as i64 + 1) - total_elapsed_us;

    let mut adj = adj_delay_us;
    adj += (KP * proportional as f64) as i64;
    adj += (KI * integral as f64) as i64;

    if adj < 0 && !new_task_completion {
        debug!(
            "run: Interval {} was way too long, the next one will not sleep",
            interval
        );
        adj = 0;
    }
    adj
}

/// Disk and network readings that only VM workloads carry.
#[derive(Debug, Clone, Copy, Default)]
struct VmExtras {
    read_bytes: f64,
    write_bytes: f64,
    read_iops: f64,
    write_iops: f64,
    io_time_ns: f64,
    net_tx_kbps: f64,
    net_rx_kbps: f64,
    ovs_tx_kbps: f64,
    ovs_rx_kbps: f64,
}

/// Values appended to the first PMU group of every stream.
#[derive(Debug, Clone, Copy, Default)]
struct Extras {
    energy_pkg: f64,
    energy_ram: f64,
    rdt: RdtValues,
    vm: Option<VmExtras>,
    time_ms: f64,
}

/// Counter names of one stream: the first PMU group followed by the
/// appended measurements, in the order compose_counters() emits them.
fn stat_names(mut names: Vec<String>, is_vm: bool) -> Vec<String> {
    names.push(counters::ENERGY_PKG.into());
    names.push(counters::ENERGY_RAM.into());
    names.push(counters::LLC_OCCUP.into());
    names.push(counters::MEM_BW_LOCAL.into());
    names.push(counters::MEM_BW_TOTAL.into());
    names.push(counters::MEM_BW_REMOTE.into());
    if is_vm {
        names.push(counters::READ_BYTES.into());
        names.push(counters::WRITE_BYTES.into());
        names.push(counters::READ_IOPS.into());
        names.push(counters::WRITE_IOPS.into());
        names.push(counters::TIME_IO_DISK.into());
        names.push(counters::NET_TX.into());
        names.push(counters::NET_RX.into());
        names.push(counters::OVS_NET_TX.into());
        names.push(counters::OVS_NET_RX.into());
    }
    names.push(counters::TIME_INT.into());
    names
}

fn compose_counters(mut group: CounterVec, extras: &Extras) -> CounterVec {
    let mut id = group.len();
    let mut push = |group: &mut CounterVec, name: &str, value: f64, snapshot: bool| {
        group.push(Counter::new(id, name, value, snapshot));
        id += 1;
    };

    push(&mut group, counters::ENERGY_PKG, extras.energy_pkg, false);
    push(&mut group, counters::ENERGY_RAM, extras.energy_ram, false);
    push(&mut group, counters::LLC_OCCUP, extras.rdt.llc_mb, true);
    push(&mut group, counters::MEM_BW_LOCAL, extras.rdt.lmem_mb, false);
    push(&mut group, counters::MEM_BW_TOTAL, extras.rdt.tmem_mb, false);
    push(&mut group, counters::MEM_BW_REMOTE, extras.rdt.rmem_mb, false);
    if let Some(vm) = &extras.vm {
        push(&mut group, counters::READ_BYTES, vm.read_bytes, false);
        push(&mut group, counters::WRITE_BYTES, vm.write_bytes, false);
        push(&mut group, counters::READ_IOPS, vm.read_iops, false);
        push(&mut group, counters::WRITE_IOPS, vm.write_iops, false);
        push(&mut group, counters::TIME_IO_DISK, vm.io_time_ns, false);
        push(&mut group, counters::NET_TX, vm.net_tx_kbps, true);
        push(&mut group, counters::NET_RX, vm.net_rx_kbps, true);
        push(&mut group, counters::OVS_NET_TX, vm.ovs_tx_kbps, true);
        push(&mut group, counters::OVS_NET_RX, vm.ovs_rx_kbps, true);
    }
    push(&mut group, counters::TIME_INT, extras.time_ms, true);
    group
}

/// Wall-clock millisecond marker recorded as the Time column.
fn current_time_ms() -> f64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    ((now.as_nanos() / 1_000_000) % 1_000_000) as f64
}

fn collect_extras(w: &Workload, time_ms: f64) -> Result<Extras> {
    let vm = match &w.payload {
        Payload::Vm(vm_task) => Some(VmExtras {
            read_bytes: vm_task.disk.read_bytes() as f64,
            write_bytes: vm_task.disk.write_bytes() as f64,
            read_iops: vm_task.disk.read_iops() as f64,
            write_iops: vm_task.disk.write_iops() as f64,
            io_time_ns: vm_task.disk.io_time_quantum() as f64,
            net_tx_kbps: vm_task.net_tx_kbps,
            net_rx_kbps: vm_task.net_rx_kbps,
            ovs_tx_kbps: vm_task.ovs_tx_kbps,
            ovs_rx_kbps: vm_task.ovs_rx_kbps,
        }),
        Payload::Process(_) => None,
    };

    Ok(Extras {
        energy_pkg: perf::read_energy_pkg()?,
        energy_ram: perf::read_energy_ram()?,
        rdt: w.core.rdt_values,
        vm,
        time_ms,
    })
}

fn read_and_accumulate(
    w: &mut Workload,
    idx: usize,
    cpu: u32,
    pid: i32,
    perf: &Perf,
    ti_secs: f64,
    time_ms: f64,
) -> Result<()> {
    let target = Workload::target(perf.mode(), cpu, pid);
    let group0 = perf
        .read(target)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No event groups for target {}", target))?;
    let extras = collect_extras(w, time_ms)?;
    let composed = compose_counters(group0, &extras);
    w.core.stats[idx].accumulate(composed, ti_secs)
}

/// Instantiate the counter stores of every stream with the names the
/// composed sample vectors will carry.
pub fn init_stats(tasklist: &mut [Workload], perf: &Perf, ti_secs: f64) -> Result<()> {
    for w in tasklist.iter_mut() {
        let is_vm = w.is_vm();
        for (idx, cpu, pid) in w.pairs() {
            let target = Workload::target(perf.mode(), cpu, pid);
            info!("run: Stream {}:{} pid {} cpu {}", w.core.id, w.core.name, pid, cpu);

            let groups = perf.names(target);
            if groups.is_empty() {
                bail!("No events set up for target {}", target);
            }
            let names = stat_names(groups[0].clone(), is_vm);
            w.core.stats[idx] = CounterStore::new();
            w.core.stats[idx].init(&names, ti_secs)?;
        }
    }
    Ok(())
}

/// Seed the previous-sample state of every stream with one reading.
pub fn first_reading(tasklist: &mut [Workload], perf: &mut Perf, ti_secs: f64) -> Result<()> {
    for w in tasklist.iter_mut() {
        if let Payload::Vm(vm_task) = &mut w.payload {
            let domain = vm_task.spec.domain_name.clone();
            if let Err(e) = vm_task.disk.refresh(&domain) {
                warn!("run: Can't read block stats of {} ({})", domain, &e);
            }
        }
        for (idx, cpu, pid) in w.pairs() {
            perf.enable(Workload::target(perf.mode(), cpu, pid));
            read_and_accumulate(w, idx, cpu, pid, perf, ti_secs, 0.0)?;
        }
    }
    Ok(())
}

pub fn run_loop(
    tasklist: &mut [Workload],
    policy: &mut dyn Policy,
    perf: &mut Perf,
    rdt: &mut Rdt,
    events: &[String],
    time_int_us: u64,
    max_int: u32,
    reports: &mut Reports,
    monitor_only: bool,
) -> Result<()> {
    if time_int_us == 0 {
        bail!("Interval time must be positive and greater than 0");
    }
    if max_int == 0 {
        bail!("Max intervals must be positive and greater than 0");
    }

    let ti_secs = time_int_us as f64 / 1e6;
    let mode = perf.mode();

    init_stats(tasklist, perf, ti_secs)?;
    reports.write_headers(&tasklist[0])?;
    first_reading(tasklist, perf, ti_secs)?;

    // Initial network throttles for the VMs that configure them.
    if !monitor_only {
        for w in tasklist.iter() {
            if let Payload::Vm(vm_task) = &w.payload {
                let spec = &vm_task.spec;
                if spec.has_net_throttle() {
                    ovs::apply_net_policing(
                        &spec.domain_name,
                        spec.netbw_in_avg,
                        spec.netbw_in_peak,
                        spec.netbw_in_burst,
                        spec.netbw_out_avg,
                        spec.netbw_out_peak,
                        spec.netbw_out_burst,
                    )?;
                }
            }
        }
    }

    let mut adj_delay_us: i64 = time_int_us as i64;
    let start_glob = Instant::now();
    let mut overhead_mark = Instant::now();
    let mut total_overhead_us: u64 = 0;
    let mut runlist: Vec<usize> = (0..tasklist.len()).collect();
    let mut last_interval: u64 = 0;

    for k in 0..max_int as u64 {
        last_interval = k;
        if prog_exiting() {
            bail!("Termination requested");
        }

        let start_int = Instant::now();
        let mut all_completed = true;
        info!(
            "run: **** Starting interval {} - {} us ****",
            k,
            start_glob.elapsed().as_micros()
        );

        if k > 0 {
            let overhead_us = overhead_mark.elapsed().as_micros() as u64;
            info!("run: Interval {} processing overhead {} us", k, overhead_us);
            total_overhead_us += overhead_us;
        }

        // 1. Pre-sleep snapshots.
        let entries1 = cpustat::read_cpu_stats()?;
        for &wi in &runlist {
            if let Payload::Vm(vm_task) = &mut tasklist[wi].payload {
                let domain = vm_task.spec.domain_name.clone();
                match vm::vcpu_times(&domain) {
                    Ok(times) => vm_task.vcpu_times_then = times,
                    Err(e) => warn!("run: Can't get CPU stats of {} ({})", domain, &e),
                }
                match ovs::poll_flow_counters(&domain) {
                    Ok((rx, tx)) => {
                        vm_task.ovs_rx_bytes = rx;
                        vm_task.ovs_tx_bytes = tx;
                    }
                    Err(e) => warn!("run: Can't poll OVS stats of {} ({})", domain, &e),
                }
            }
        }

        // 2. The only long wait of the interval.
        let then_wall = Instant::now();
        if adj_delay_us > 0 {
            sleep(Duration::from_micros(adj_delay_us as u64));
        }
        let wall_secs = then_wall.elapsed().as_secs_f64();
        info!("run: Slept for {} us", adj_delay_us);
        overhead_mark = Instant::now();

        let interval_ti = adj_delay_us as f64 / 1e6;
        let mut new_task_completion = false;

        // 3. Post-sleep snapshots and accumulation.
        let entries2 = cpustat::read_cpu_stats()?;
        let mut all_started = true;

        for &wi in &runlist {
            let w = &mut tasklist[wi];
            let time_ms = current_time_ms();
            let is_vm = w.is_vm();

            if let Payload::Vm(vm_task) = &mut w.payload {
                let domain = vm_task.spec.domain_name.clone();
                let has_client = vm_task.spec.has_client();

                match vm::vcpu_times(&domain) {
                    Ok(times) => vm_task.vcpu_times_now = times,
                    Err(e) => warn!("run: Can't get CPU stats of {} ({})", domain, &e),
                }

                match ovs::poll_flow_counters(&domain) {
                    Ok((rx, tx)) => {
                        vm_task.ovs_rx_kbps =
                            ((rx - vm_task.ovs_rx_bytes) / interval_ti / 1024.0).max(0.0);
                        vm_task.ovs_tx_kbps =
                            ((tx - vm_task.ovs_tx_bytes) / interval_ti / 1024.0).max(0.0);
                    }
                    Err(e) => warn!("run: Can't poll OVS stats of {} ({})", domain, &e),
                }
                // Direct interface counters are too expensive to poll.
                vm_task.net_rx_kbps = 0.0;
                vm_task.net_tx_kbps = 0.0;

                if !vm::server_completed(&domain) {
                    if let Err(e) = vm_task.disk.refresh(&domain) {
                        warn!("run: Can't read block stats of {} ({})", domain, &e);
                    }
                }

                if !monitor_only && has_client {
                    let started = vm::client_started(&domain);
                    all_started &= started;
                    if started && !w.core.client_started {
                        w.core.client_started = true;
                        w.core.interval_start = k as i64;
                        info!(
                            "run: Interval start for {}:{} is {}",
                            w.core.id, w.core.name, k
                        );
                    }
                } else {
                    w.core.interval_start = 0;
                }
            }

            let mut total_inst: u64 = 0;
            for (idx, cpu, pid) in w.pairs() {
                let values = match mode {
                    PerfMode::Pid => rdt.read_pid(pid),
                    PerfMode::Cpu => rdt.read_core(cpu),
                };
                match values {
                    Ok(v) => w.core.rdt_values = v,
                    Err(e) => warn!(
                        "run: Can't read RDT values of {}:{} ({})",
                        w.core.name, pid, &e
                    ),
                }

                w.core.total_cpu_util.insert(
                    cpu,
                    cpustat::cpu_utilization(&entries1, &entries2, cpu as usize),
                );
                for cat in 0..NUM_CPU_STATES {
                    w.core.total_time_util.insert(
                        (cat, cpu),
                        cpustat::time_utilization(&entries1, &entries2, cpu as usize, cat),
                    );
                }

                if is_vm {
                    let usage = match &w.payload {
                        Payload::Vm(vm_task) => vm::vm_cpu_usage(
                            &vm_task.vcpu_times_then,
                            &vm_task.vcpu_times_now,
                            idx,
                            wall_secs,
                        ),
                        _ => 0.0,
                    };
                    if let Payload::Vm(vm_task) = &mut w.payload {
                        vm_task.vm_cpu_util.insert(cpu, usage);
                    }
                }

                read_and_accumulate(w, idx, cpu, pid, perf, ti_secs, time_ms)?;

                if !is_vm {
                    let inst = w.core.stats[idx]
                        .current(counters::INSTRUCTIONS)
                        .or_else(|_| w.core.stats[idx].current("instructions"))
                        .unwrap_or(0.0);
                    total_inst += inst as u64;
                }
            }

            // 4. Rows and transitions.
            if is_vm {
                if all_started {
                    for row in report::interval_rows(w, k, monitor_only) {
                        reports.interval.write_line(&row)?;
                    }
                    for row in report::times_rows(w, k, monitor_only) {
                        reports.times.write_line(&row)?;
                    }
                }
                if w.exited(monitor_only)? {
                    info!("run: Task {} exited", w.core.name);
                    w.clear_exited();
                    w.core.status = Status::Exited;
                    w.core.completed += 1;
                    w.core.run_id += 1;
                    new_task_completion = true;
                }
            } else {
                for row in report::interval_rows(w, k, monitor_only) {
                    reports.interval.write_line(&row)?;
                }
                for row in report::times_rows(w, k, monitor_only) {
                    reports.times.write_line(&row)?;
                }

                if w.exited(monitor_only)? {
                    info!(
                        "run: Task {} ({}) has finished",
                        w.core.name, w.core.pids[0]
                    );
                    w.core.status = Status::Exited;
                    w.core.completed += 1;
                    w.core.run_id += 1;
                    new_task_completion = true;
                } else if let Some(max_instr) = w.max_instr() {
                    if max_instr > 0 && total_inst >= max_instr {
                        w.core.status = Status::LimitReached;
                        w.core.completed += 1;
                        w.core.run_id += 1;
                    }
                }
            }

            if w.core.completed == 0 && !w.core.batch {
                all_completed = false;
            }

            // First completion of this workload: the until-completion
            // stream gets its cumulative row.
            if matches!(w.core.status, Status::Exited | Status::LimitReached)
                && w.core.completed == 1
            {
                for row in report::total_rows(w, k) {
                    reports.fin.write_line(&row)?;
                }
            }
        }

        if all_completed {
            info!("run: Total processing overhead {} us", total_overhead_us);
            info!("run: --------------- ALL COMPLETED ---------------");
            break;
        }

        // 5. Resolve finished workloads: restart or retire.
        for &wi in &runlist {
            let w = &mut tasklist[wi];
            if matches!(w.core.status, Status::Exited | Status::LimitReached) {
                info!(
                    "run: Task {} has status {}",
                    w.core.name,
                    w.core.status.as_str()
                );
                w.restart_or_set_done(rdt, perf, events)?;

                if w.core.status == Status::Done {
                    for row in report::total_rows(w, k) {
                        reports.total.write_line(&row)?;
                    }
                }
            }
        }

        runlist.retain(|&wi| tasklist[wi].core.status != Status::Done);
        if runlist.is_empty() {
            bail!("Run list is empty, nothing left to drive");
        }

        // 6. Give the policy its view of the interval.
        {
            let run_refs: Vec<&Workload> = runlist.iter().map(|&wi| &tasklist[wi]).collect();
            policy.apply(k, ti_secs, interval_ti, &run_refs, rdt, mode)?;
        }

        // 7. Converge the next sleep.
        adj_delay_us = adjust_delay(
            adj_delay_us,
            time_int_us as i64,
            start_int.elapsed().as_micros() as i64,
            start_glob.elapsed().as_micros() as i64,
            k,
            new_task_completion,
        );
    }

    // Final totals: cumulative rows for everything that never completed
    // and for everything still participating.
    for w in tasklist.iter() {
        if w.core.completed == 0 {
            for row in report::total_rows(w, last_interval) {
                reports.fin.write_line(&row)?;
            }
            for row in report::total_rows(w, last_interval) {
                reports.total.write_line(&row)?;
            }
        }
        if w.core.status != Status::Done {
            for row in report::total_rows(w, last_interval) {
                reports.total.write_line(&row)?;
            }
            if let Payload::Vm(vm_task) = &w.payload {
                vm_task
                    .disk
                    .log_totals(&vm_task.spec.domain_name, ti_secs, last_interval);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pi_convergence() {
        // A sleep that undershoots by 100 ms per interval; the controller
        // must keep the average cadence on target.
        let target_us: i64 = 1_000_000;
        let mut adj: i64 = target_us;
        let mut total_us: i64 = 0;

        for k in 0..10u64 {
            let elapsed = (adj - 100_000).max(0);
            total_us += elapsed;
            adj = adjust_delay(adj, target_us, elapsed, total_us, k, false);
        }

        let mean_us = total_us / 10;
        assert!(
            (mean_us - target_us).abs() < 5_000,
            "mean interval {} us is off target",
            mean_us
        );
    }

    #[test]
    fn test_pi_negative_clamps_without_completion() {
        // A wildly long interval drives the correction negative; the next
        // sleep is skipped rather than made negative.
        let adj = adjust_delay(1_000_000, 1_000_000, 5_000_000, 5_000_000, 0, false);
        assert_eq!(adj, 0);
    }

    #[test]
    fn test_pi_negative_survives_completion() {
        let adj = adjust_delay(1_000_000, 1_000_000, 5_000_000, 5_000_000, 0, true);
        assert!(adj < 0);
    }

    #[test]
    fn test_stat_names_order() {
        let names = stat_names(vec!["instructions".into()], false);
        assert_eq!(
            names,
            vec![
                "instructions",
                counters::ENERGY_PKG,
                counters::ENERGY_RAM,
                counters::LLC_OCCUP,
                counters::MEM_BW_LOCAL,
                counters::MEM_BW_TOTAL,
                counters::MEM_BW_REMOTE,
                counters::TIME_INT,
            ]
        );

        let names = stat_names(vec!["instructions".into()], true);
        assert_eq!(names.len(), 1 + 6 + 9 + 1);
        assert!(names.contains(&counters::OVS_NET_RX.to_string()));
    }

    #[test]
    fn test_compose_counters_matches_names() {
        let group = vec![Counter::new(0, "instructions", 100.0, false)];
        let extras = Extras {
            energy_pkg: 10.0,
            energy_ram: 5.0,
            rdt: RdtValues {
                llc_mb: 2.0,
                lmem_mb: 1.0,
                tmem_mb: 3.0,
                rmem_mb: 2.0,
            },
            vm: Some(VmExtras::default()),
            time_ms: 123.0,
        };
        let composed = compose_counters(group, &extras);
        let names = stat_names(vec!["instructions".into()], true);

        assert_eq!(composed.len(), names.len());
        for (i, c) in composed.iter().enumerate() {
            assert_eq!(c.id, i);
            assert_eq!(c.name, names[i]);
        }

        // Snapshot flags: occupancy, network rates and the time marker.
        let snapshot_names: Vec<&str> = composed
            .iter()
            .filter(|c| c.snapshot)
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(
            snapshot_names,
            vec![
                counters::LLC_OCCUP,
                counters::NET_TX,
                counters::NET_RX,
                counters::OVS_NET_TX,
                counters::OVS_NET_RX,
                counters::TIME_INT,
            ]
        );
    }

    #[test]
    fn test_current_time_ms_bounded() {
        let ms = current_time_ms();
        assert!(ms >= 0.0 && ms < 1_000_000.0);
    }
}
