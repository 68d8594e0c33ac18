// Copyright (c) copart.
use anyhow::Result;
use copart_agent_intf::{Args, CmdOptions, Config, PerfMode, TaskSpec};
use copart_util::*;
use log::{error, info, warn};
use std::process::exit;

mod counters;
mod cpustat;
mod ovs;
mod perf;
mod policy;
mod rdt;
mod report;
mod run;
mod vm;
mod workload;

use perf::Perf;
use rdt::{CdpScope, Rdt};
use report::Reports;
use workload::{Payload, Workload};

/// Program the CLOS layout the run starts with. Cache masks land on socket
/// 0 where the workloads run, bandwidth caps on every socket.
fn clos_setup(rdt: &mut Rdt, config: &Config) -> Result<()> {
    info!("cfg: Using Intel RDT through the resctrl interface");
    rdt.init()?;

    for clos in &config.clos {
        rdt.set_cbm(clos.num, 0, clos.schemata, CdpScope::Both)?;
        info!(
            "cfg: CLOS {} has initial mask 0x{:x}",
            clos.num,
            rdt.get_cbm(clos.num, 0, CdpScope::Both)?
        );

        if let Some(mbps) = clos.mbps {
            for socket in rdt.sockets().to_vec() {
                rdt.set_mba(clos.num, socket, mbps, true)?;
            }
        }

        for cpu in &clos.cpus {
            rdt.assign_cpu(clos.num, *cpu)?;
        }
    }

    if config.clos.is_empty() {
        info!(
            "cfg: CLOS 0 has initial mask 0x{:x}",
            rdt.get_cbm(0, 0, CdpScope::Both)?
        );
        if let Ok(mb) = rdt.get_mba(0, 0) {
            info!("cfg: CLOS 0 memory BW limit is {} MBps", mb);
        }
    }
    Ok(())
}

fn build_workloads(config: &Config, args: &Args) -> Result<Vec<Workload>> {
    let rundir_base = format!("{}/{}", args.rundir, args.id);
    let nr_cpus = num_cpus::get() as u32;
    let mut tasklist = vec![];

    for task in &config.tasks {
        if let Some(cpu) = task.common().cpus.iter().find(|c| **c >= nr_cpus) {
            anyhow::bail!(
                "Task {:?} is pinned to CPU {} but the host only has {}",
                task.name(),
                cpu,
                nr_cpus
            );
        }
        let w = match task {
            TaskSpec::App(app) => Workload::new_process(app, task.name(), &rundir_base)?,
            TaskSpec::Vm(vm_spec) => Workload::new_vm(vm_spec),
        };
        tasklist.push(w);
    }
    Ok(tasklist)
}

/// Bring every workload to the starting line: launched (paused), pinned,
/// assigned to its CLOS, with perf events and RDT monitoring attached, and
/// finally released together.
fn launch_all(
    tasklist: &mut [Workload],
    perf: &mut Perf,
    rdt: &mut Rdt,
    events: &[String],
    monitor_only: bool,
) -> Result<()> {
    info!("cfg: Leaving tasks ready to execute");
    for w in tasklist.iter_mut() {
        w.launch(monitor_only)?;
        w.core.client_started = false;
        w.discover_cpus()?;

        if w.core.initial_clos > 0 {
            for (_idx, cpu, pid) in w.pairs() {
                match perf.mode() {
                    PerfMode::Pid => {
                        rdt.assign_pid(w.core.initial_clos, pid)?;
                        info!("cfg: Pid {} mapped to CLOS {}", pid, w.core.initial_clos);
                    }
                    PerfMode::Cpu => {
                        rdt.assign_cpu(w.core.initial_clos, cpu)?;
                        info!("cfg: Cpu {} mapped to CLOS {}", cpu, w.core.initial_clos);
                    }
                }
            }
        }
    }

    info!("cfg: ***** TASKS READY TO START *****");
    for w in tasklist.iter() {
        for (_idx, cpu, pid) in w.pairs() {
            match perf.mode() {
                PerfMode::Pid => {
                    perf.setup_events(pid, events)?;
                    rdt.monitor_start_pid(pid)?;
                }
                PerfMode::Cpu => {
                    perf.setup_events(cpu as i32, events)?;
                    rdt.monitor_start_core(cpu)?;
                }
            }
        }
    }

    if !monitor_only {
        info!("cfg: Starting to execute tasks");
        for w in tasklist.iter_mut() {
            w.start()?;
        }
    }
    Ok(())
}

/// Leave the machine in a consistent state after a successful run.
fn clean(tasklist: &mut [Workload], rdt: &mut Rdt, perf: &mut Perf) {
    info!("run: Resetting RDT and performance counters...");
    if let Err(e) = rdt.reset() {
        warn!("run: Failed to reset RDT state ({:#})", &e);
    }
    rdt.fini();
    perf.clean();

    info!("run: Dropping privileges...");
    if let Err(e) = drop_privileges() {
        warn!("run: Failed to drop privileges ({:#})", &e);
    }

    info!("run: Deleting run dirs if any...");
    for w in tasklist.iter() {
        w.remove_rundir();
    }

    info!("run: Killing children...");
    kill_descendants();
}

/// The single unwind path for anything unrecoverable: release what can be
/// released, stop the client peers, kill the descendant tree and exit
/// non-zero.
fn clean_and_die(tasklist: &mut [Workload], rdt: &mut Rdt, perf: &mut Perf, monitor_only: bool) -> ! {
    error!("--- PANIC, TRYING TO CLEAN ---");

    if rdt.is_initialized() {
        if let Err(e) = rdt.reset() {
            error!("Could not reset RDT state ({:#})", &e);
        }
    }
    rdt.fini();
    perf.clean();

    if !monitor_only {
        for w in tasklist.iter() {
            if let Payload::Vm(vm_task) = &w.payload {
                if vm_task.spec.has_client() {
                    vm::shutdown_client(&vm_task.spec);
                }
            }
        }
    }

    kill_descendants();
    error!("Exit with error");
    exit(1);
}

fn merge_cmdline(config: &Config, args: &Args) -> CmdOptions {
    let mut cmd = config.cmd.clone();
    if let Some(ti) = args.ti {
        cmd.ti = ti;
    }
    if let Some(mi) = args.mi {
        cmd.mi = mi;
    }
    if !args.events.is_empty() {
        cmd.event = args.events.clone();
    }
    if !args.cpu_affinity.is_empty() {
        cmd.cpu_affinity = args.cpu_affinity.clone();
    }
    cmd
}

fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging(&args.clog_min, &args.flog_min, &args.log_file) {
        eprintln!("Failed to initialize logging ({:#})", &e);
        exit(1);
    }
    setup_prog_state();

    let cmdline: Vec<String> = std::env::args().collect();
    info!("cfg: Program cmdline: {}", cmdline.join(" "));

    let config = match Config::load(&args.config, &args.config_override) {
        Ok(v) => v,
        Err(e) => {
            error!("Error reading config file {:?} ({:#})", &args.config, &e);
            exit(1);
        }
    };

    // Priority order: command line > config file > defaults.
    let cmd = merge_cmdline(&config, &args);

    // Keep the controller itself off the workload CPUs.
    if let Err(e) = set_cpu_affinity(&cmd.cpu_affinity, 0) {
        error!("{:#}", &e);
        exit(1);
    }

    let mut reports = match Reports::open(
        &args.output,
        &args.fin_output,
        &args.total_output,
        &args.times_output,
    ) {
        Ok(v) => v,
        Err(e) => {
            error!("{:#}", &e);
            exit(1);
        }
    };

    let mut perf = Perf::new(cmd.perf);
    let mut rdt = Rdt::new();
    let mut policy = policy::policy_from_spec(&config.policy);
    info!("cfg: Selected policy {:?}", policy.name());

    let mut tasklist = match build_workloads(&config, &args) {
        Ok(v) => v,
        Err(e) => {
            error!("{:#}", &e);
            exit(1);
        }
    };

    // Initial CAT/MBA configuration; the policy may reshape it later.
    if let Err(e) = clos_setup(&mut rdt, &config) {
        error!("{:#}", &e);
        exit(1);
    }

    let time_int_us = (cmd.ti * 1e6) as u64;
    let result = launch_all(
        &mut tasklist,
        &mut perf,
        &mut rdt,
        &cmd.event,
        args.monitor_only,
    )
    .and_then(|_| {
        info!("run: Start main loop");
        run::run_loop(
            &mut tasklist,
            &mut *policy,
            &mut perf,
            &mut rdt,
            &cmd.event,
            time_int_us,
            cmd.mi,
            &mut reports,
            args.monitor_only,
        )
    });

    match result {
        Ok(()) => {
            info!("run: ^^^^^ LOOP FINISHED ^^^^^");
            clean(&mut tasklist, &mut rdt, &mut perf);
            // Buffered streams go to stdout only now so they don't mix
            // with the per-interval output.
            reports.flush_buffered();
        }
        Err(e) => {
            error!("{:#}", &e);
            clean_and_die(&mut tasklist, &mut rdt, &mut perf, args.monitor_only);
        }
    }
}
