// Copyright (c) copart.
//
// The workload abstraction: one shared core plus a Process or
// VirtualMachine payload behind a single lifecycle. Processes are forked
// children driven with signals, VMs are libvirt domains driven through the
// vm module.
use anyhow::{anyhow, bail, Result};
use copart_agent_intf::{AppSpec, PerfMode, VmSpec};
use copart_util::{drop_privileges, set_cpu_affinity, set_sched_rr};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::sleep;
use std::time::Duration;

use super::counters::CounterStore;
use super::cpustat::CoreTempMap;
use super::perf::Perf;
use super::rdt::{Rdt, RdtValues};
use super::vm;
use super::vm::{BlockStats, DiskLimits};

static WORKLOAD_SEQ: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Runnable,
    LimitReached,
    Exited,
    Done,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Runnable => "runnable",
            Self::LimitReached => "limit_reached",
            Self::Exited => "exited",
            Self::Done => "done",
        }
    }
}

/// State shared by both workload variants.
#[derive(Debug)]
pub struct WorkloadCore {
    pub id: u32,
    pub name: String,
    pub cpus: Vec<u32>,
    /// One entry per cpu; 0 marks a cleared slot.
    pub pids: Vec<i32>,
    pub initial_clos: u32,
    pub max_restarts: u32,
    pub batch: bool,

    pub status: Status,
    pub restarts: u32,
    pub completed: u32,
    pub run_id: u32,

    pub stats: Vec<CounterStore>,
    pub rdt_values: RdtValues,
    pub total_cpu_util: BTreeMap<u32, f64>,
    pub total_time_util: BTreeMap<(usize, u32), f64>,
    pub client_started: bool,
    pub interval_start: i64,
}

impl WorkloadCore {
    fn new(name: String, cpus: Vec<u32>, initial_clos: u32, max_restarts: u32, batch: bool) -> Self {
        // A task configured without CPUs still gets one stream slot; its
        // CPU is discovered after launch.
        let nr_slots = cpus.len().max(1);
        Self {
            id: WORKLOAD_SEQ.fetch_add(1, Ordering::Relaxed),
            name,
            cpus,
            pids: vec![0; nr_slots],
            initial_clos,
            max_restarts,
            batch,
            status: Status::Runnable,
            restarts: 0,
            completed: 0,
            run_id: 0,
            stats: (0..nr_slots).map(|_| CounterStore::new()).collect(),
            rdt_values: Default::default(),
            total_cpu_util: BTreeMap::new(),
            total_time_util: BTreeMap::new(),
            client_started: false,
            interval_start: -1,
        }
    }
}

#[derive(Debug)]
pub struct ProcessTask {
    pub cmd: String,
    pub rundir: String,
    pub skel: Vec<String>,
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub max_instr: Option<u64>,
}

#[derive(Debug)]
pub struct VmTask {
    pub spec: VmSpec,
    pub disk: BlockStats,
    pub temp_map: CoreTempMap,

    pub vm_cpu_util: BTreeMap<u32, f64>,
    pub vcpu_times_then: Vec<f64>,
    pub vcpu_times_now: Vec<f64>,

    /// Per-interval network rates in KBps. The direct interface counters
    /// are too expensive to poll and stay at zero; OVS flow counters carry
    /// the real numbers.
    pub net_rx_kbps: f64,
    pub net_tx_kbps: f64,
    pub ovs_rx_kbps: f64,
    pub ovs_tx_kbps: f64,
    /// Cumulative flow-counter snapshot from pre-sleep.
    pub ovs_rx_bytes: f64,
    pub ovs_tx_bytes: f64,

    domain_found: bool,
}

#[derive(Debug)]
pub enum Payload {
    Process(ProcessTask),
    Vm(Box<VmTask>),
}

#[derive(Debug)]
pub struct Workload {
    pub core: WorkloadCore,
    pub payload: Payload,
}

/// Field 39 of a /proc/<pid>/stat line: the CPU the task last ran on. The
/// comm field may itself contain spaces, so counting starts after the
/// closing parenthesis.
fn stat_processor(body: &str) -> Option<u32> {
    let rest = &body[body.rfind(')')? + 1..];
    rest.split_whitespace().nth(36)?.parse().ok()
}

/// Split a command line into argv honoring single and double quotes.
pub fn shell_split(cmd: &str) -> Result<Vec<String>> {
    let mut argv = vec![];
    let mut arg = String::new();
    let mut in_arg = false;
    let mut quote: Option<char> = None;

    for c in cmd.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    arg.push(c);
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_arg = true;
                }
                c if c.is_whitespace() => {
                    if in_arg {
                        argv.push(std::mem::take(&mut arg));
                        in_arg = false;
                    }
                }
                c => {
                    arg.push(c);
                    in_arg = true;
                }
            },
        }
    }
    if quote.is_some() {
        bail!("Unbalanced quote in command line {:?}", cmd);
    }
    if in_arg {
        argv.push(arg);
    }
    if argv.is_empty() {
        bail!("Empty command line");
    }
    Ok(argv)
}

fn dir_copy_contents(src: &str, dst: &str) -> Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = Path::new(dst).join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&target)?;
            dir_copy_contents(
                entry.path().to_str().unwrap_or(""),
                target.to_str().unwrap_or(""),
            )?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn redirect_stdio(path: &str, fd: libc::c_int, write: bool) -> Result<()> {
    let cpath = CString::new(path)?;
    let flags = if write {
        libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC
    } else {
        libc::O_RDONLY
    };
    let newfd = unsafe { libc::open(cpath.as_ptr(), flags, 0o644) };
    if newfd < 0 {
        bail!("Could not open {:?}", path);
    }
    if unsafe { libc::dup2(newfd, fd) } < 0 {
        bail!("Could not redirect fd {}", fd);
    }
    unsafe { libc::close(newfd) };
    Ok(())
}

impl Workload {
    pub fn new_process(app: &AppSpec, name: String, rundir_base: &str) -> Result<Workload> {
        let core = WorkloadCore::new(
            name.clone(),
            app.common.cpus.clone(),
            app.common.initial_clos,
            app.common.max_restarts(),
            app.common.batch,
        );
        let rundir = format!("{}/{}-{}", rundir_base, core.id, name);
        if Path::new(&rundir).exists() {
            bail!("The rundir {:?} already exists", rundir);
        }

        Ok(Workload {
            core,
            payload: Payload::Process(ProcessTask {
                cmd: app.app.cmd.clone(),
                rundir,
                skel: app.app.skel.clone(),
                stdin: app.app.stdin.clone(),
                stdout: app.app.stdout.clone(),
                stderr: app.app.stderr.clone(),
                max_instr: app.max_instr,
            }),
        })
    }

    pub fn new_vm(spec: &VmSpec) -> Workload {
        let core = WorkloadCore::new(
            spec.domain_name.clone(),
            spec.common.cpus.clone(),
            spec.common.initial_clos,
            spec.common.max_restarts(),
            spec.common.batch,
        );
        Workload {
            core,
            payload: Payload::Vm(Box::new(VmTask {
                disk: BlockStats::default(),
                temp_map: CoreTempMap::default(),
                spec: spec.clone(),
                vm_cpu_util: BTreeMap::new(),
                vcpu_times_then: vec![],
                vcpu_times_now: vec![],
                net_rx_kbps: 0.0,
                net_tx_kbps: 0.0,
                ovs_rx_kbps: 0.0,
                ovs_tx_kbps: 0.0,
                ovs_rx_bytes: 0.0,
                ovs_tx_bytes: 0.0,
                domain_found: false,
            })),
        }
    }

    pub fn is_vm(&self) -> bool {
        matches!(self.payload, Payload::Vm(_))
    }

    pub fn has_client(&self) -> bool {
        match &self.payload {
            Payload::Vm(vm_task) => vm_task.spec.has_client(),
            Payload::Process(_) => false,
        }
    }

    pub fn max_instr(&self) -> Option<u64> {
        match &self.payload {
            Payload::Process(p) => p.max_instr,
            Payload::Vm(_) => None,
        }
    }

    /// Fill in the CPU of a task configured without one, from where its
    /// first pid is actually running.
    pub fn discover_cpus(&mut self) -> Result<()> {
        if !self.core.cpus.is_empty() {
            return Ok(());
        }
        let pid = self.core.pids.first().copied().unwrap_or(0);
        if pid <= 0 {
            bail!("Task {} has no pid to discover a CPU from", self.core.name);
        }
        let body = fs::read_to_string(format!("/proc/{}/stat", pid))?;
        let cpu = stat_processor(&body)
            .ok_or_else(|| anyhow!("Malformed /proc/{}/stat", pid))?;
        info!(
            "workload: Task {} is on CPU {}, updating its cpu set",
            self.core.id, cpu
        );
        self.core.cpus.push(cpu);
        Ok(())
    }

    /// (index, cpu, pid) triples for the streams that are actually live.
    pub fn pairs(&self) -> Vec<(usize, u32, i32)> {
        self.core
            .cpus
            .iter()
            .enumerate()
            .map(|(i, cpu)| (i, *cpu, self.core.pids[i]))
            .filter(|(_, _, pid)| *pid > 0)
            .collect()
    }

    /// The perf/RDT target of one stream under the configured mode.
    pub fn target(mode: PerfMode, cpu: u32, pid: i32) -> i32 {
        match mode {
            PerfMode::Pid => pid,
            PerfMode::Cpu => cpu as i32,
        }
    }

    /// The CPU a stream currently runs on, for row labeling. VM vCPU
    /// threads can migrate; processes stay where they were pinned.
    pub fn current_cpu(&self, idx: usize) -> u32 {
        let pid = self.core.pids[idx];
        if self.is_vm() && pid > 0 {
            if let Ok(body) = fs::read_to_string(format!("/proc/{}/stat", pid)) {
                if let Some(cpu) = stat_processor(&body) {
                    return cpu;
                }
            }
        }
        self.core.cpus[idx]
    }

    pub fn launch(&mut self, monitor_only: bool) -> Result<()> {
        if self.is_vm() {
            self.launch_vm(monitor_only)
        } else {
            self.launch_process()
        }
    }

    fn launch_process(&mut self) -> Result<()> {
        let process = match &self.payload {
            Payload::Process(p) => p,
            _ => unreachable!(),
        };

        let argv = shell_split(&process.cmd)?;
        let cargv: Vec<CString> = argv
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<std::result::Result<_, _>>()?;
        let mut argv_ptrs: Vec<*const libc::c_char> =
            cargv.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());

        debug!(
            "workload: Task {}:{} cpu affinity {:?}",
            self.core.id, self.core.name, self.core.cpus
        );

        let pid = unsafe { libc::fork() };
        match pid {
            0 => {
                // Child: new session, pinned, deprivileged, in its rundir,
                // stdio redirected, then exec.
                unsafe { libc::setsid() };

                if let Err(e) = set_cpu_affinity(&self.core.cpus, 0) {
                    eprintln!("Could not set cpu affinity: {}", e);
                    unsafe { libc::_exit(1) };
                }
                if let Err(e) = drop_privileges() {
                    eprintln!("Failed to drop privileges: {}", e);
                }
                if let Err(e) = self.create_rundir() {
                    eprintln!("Could not create rundir: {}", e);
                    unsafe { libc::_exit(1) };
                }
                if let Err(e) = std::env::set_current_dir(&process.rundir) {
                    eprintln!("Could not enter rundir: {}", e);
                    unsafe { libc::_exit(1) };
                }

                let redirects = [
                    (&process.stdin, libc::STDIN_FILENO, false),
                    (&process.stdout, libc::STDOUT_FILENO, true),
                    (&process.stderr, libc::STDERR_FILENO, true),
                ];
                for (path, fd, write) in &redirects {
                    if !path.is_empty() {
                        if let Err(e) = redirect_stdio(path, *fd, *write) {
                            eprintln!("Failed to start {:?}: {}", process.cmd, e);
                            unsafe { libc::_exit(1) };
                        }
                    }
                }

                unsafe { libc::execvp(argv_ptrs[0], argv_ptrs.as_ptr()) };
                eprintln!("Failed to start program {:?}", process.cmd);
                unsafe { libc::_exit(1) };
            }
            -1 => bail!("Failed to fork for {:?}", process.cmd),
            child => {
                sleep(Duration::from_micros(100));
                self.core.pids[0] = child;
                info!(
                    "workload: Task {}:{} started with pid {}",
                    self.core.id, self.core.name, child
                );
                // Everything starts paused; the supervisor resumes the
                // whole set together.
                self.pause()?;
            }
        }
        Ok(())
    }

    fn create_rundir(&self) -> Result<()> {
        let process = match &self.payload {
            Payload::Process(p) => p,
            _ => unreachable!(),
        };
        fs::create_dir_all(&process.rundir)
            .map_err(|e| anyhow!("Could not create rundir {:?} ({})", &process.rundir, &e))?;
        for skel in &process.skel {
            if !skel.is_empty() {
                dir_copy_contents(skel, &process.rundir)?;
            }
        }
        Ok(())
    }

    fn launch_vm(&mut self, monitor_only: bool) -> Result<()> {
        let core_id = self.core.id;
        let cpus = self.core.cpus.clone();
        let run_id = self.core.run_id;
        let vm_task = match &mut self.payload {
            Payload::Vm(vm_task) => vm_task,
            _ => unreachable!(),
        };
        let spec = vm_task.spec.clone();

        if !vm_task.domain_found {
            if !vm::domain_exists(&spec.domain_name) {
                bail!("Domain {:?} not found", spec.domain_name);
            }
            vm_task.domain_found = true;
        }

        if !monitor_only {
            if spec.ceph_vm {
                vm::ceph_snapshot_revert(&spec.domain_name, &spec.snapshot_name, &spec.ip)?;
            } else {
                if !vm::snapshot_exists(&spec.domain_name, &spec.snapshot_name) {
                    bail!(
                        "Snapshot {:?} of domain {:?} not found",
                        spec.snapshot_name,
                        spec.domain_name
                    );
                }
                vm::snapshot_revert(&spec.domain_name, &spec.snapshot_name)?;
            }

            for (vcpu, cpu) in cpus.iter().enumerate() {
                vm::pin_vcpu(&spec.domain_name, vcpu, *cpu)?;
            }
            vm::set_vcpus(&spec.domain_name, cpus.len())?;
            vm::online_guest_cpus(&spec.ip, cpus.len())?;
        }

        let pids = vm::vcpu_thread_pids(&spec.domain_name)?;
        for (i, _cpu) in cpus.iter().enumerate() {
            self.core.pids[i] = pids.get(i).copied().unwrap_or(0);
        }

        if !monitor_only {
            for (i, cpu) in cpus.iter().enumerate() {
                let pid = self.core.pids[i];
                if pid > 0 {
                    set_sched_rr(pid, 99)?;
                    set_cpu_affinity(&[*cpu], pid)?;
                }
            }

            if spec.has_client() {
                vm::launch_server(&spec, run_id)?;
                vm::prepare_client(&spec)?;
            }

            vm::apply_block_iotune(&spec.domain_name, &DiskLimits::from_spec(&spec))?;
        }

        info!(
            "workload: VM task {}:{} ready, vcpu threads {:?}",
            core_id, spec.domain_name, self.core.pids
        );
        Ok(())
    }

    /// Launch-after-restart: the domain is already discovered and pinned,
    /// only the benchmark plumbing is redone.
    fn launch_vm_light(&mut self) -> Result<()> {
        let run_id = self.core.run_id;
        let spec = match &self.payload {
            Payload::Vm(vm_task) => vm_task.spec.clone(),
            _ => unreachable!(),
        };
        if spec.has_client() {
            vm::launch_server(&spec, run_id)?;
            sleep(Duration::from_secs(4));
            vm::prepare_client(&spec)?;
        }
        Ok(())
    }

    /// Kick off the actual benchmark run.
    pub fn start(&mut self) -> Result<()> {
        match &self.payload {
            Payload::Process(_) => self.resume(),
            Payload::Vm(vm_task) => {
                let spec = vm_task.spec.clone();
                if spec.has_client() {
                    vm::launch_client(&spec, self.core.run_id)
                } else {
                    vm::launch_server(&spec, self.core.run_id)
                }
            }
        }
    }

    fn signal_and_wait(&self, sig: libc::c_int, wait_flags: libc::c_int) -> Result<()> {
        let process = match &self.payload {
            Payload::Process(p) => p,
            _ => bail!("Signals are only sent to process workloads"),
        };

        for pid in self.core.pids.iter().filter(|p| **p != 0) {
            let pid = *pid;
            if pid <= 1 {
                bail!(
                    "Task {}:{}: tried to signal pid {}, check for bugs",
                    self.core.id,
                    self.core.name,
                    pid
                );
            }

            if unsafe { libc::kill(pid, sig) } < 0 {
                bail!(
                    "Could not signal command {:?} with pid {} ({})",
                    process.cmd,
                    pid,
                    std::io::Error::last_os_error()
                );
            }

            let mut status: libc::c_int = 0;
            if unsafe { libc::waitpid(pid, &mut status, wait_flags) } != pid {
                bail!(
                    "Error in waitpid for command {:?} with pid {}",
                    process.cmd,
                    pid
                );
            }
            if libc::WIFEXITED(status) {
                bail!(
                    "Command {:?} with pid {} exited unexpectedly with status {}",
                    process.cmd,
                    pid,
                    libc::WEXITSTATUS(status)
                );
            }
        }
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        self.signal_and_wait(libc::SIGSTOP, libc::WUNTRACED)
    }

    pub fn resume(&self) -> Result<()> {
        self.signal_and_wait(libc::SIGCONT, libc::WCONTINUED)
    }

    pub fn kill(&mut self) -> Result<()> {
        match &self.payload {
            Payload::Process(process) => {
                for i in 0..self.core.pids.len() {
                    let pid = self.core.pids[i];
                    if pid == 0 {
                        continue;
                    }
                    if pid <= 1 {
                        bail!("Tried to kill pid {}, check for bugs", pid);
                    }

                    info!("workload: Killing task {}:{}", pid, self.core.name);
                    if self.core.status == Status::Exited {
                        debug!(
                            "workload: Task {}:{} with pid {} was already dead",
                            self.core.id, self.core.name, pid
                        );
                    } else if unsafe { libc::kill(-pid, libc::SIGKILL) } < 0 {
                        bail!(
                            "Could not SIGKILL command {:?} with pid {} ({})",
                            process.cmd,
                            pid,
                            std::io::Error::last_os_error()
                        );
                    }
                    self.core.pids[i] = 0;
                }
                Ok(())
            }
            Payload::Vm(vm_task) => vm::domain_shutdown(&vm_task.spec.domain_name),
        }
    }

    /// Whether the workload finished its run. Monitor-only mode observes
    /// but never tears down: processes report false, VMs only honor the
    /// completion sentinel.
    pub fn exited(&self, monitor_only: bool) -> Result<bool> {
        match &self.payload {
            Payload::Process(process) => {
                if monitor_only {
                    return Ok(false);
                }
                let pid = self.core.pids[0];
                let mut status: libc::c_int = 0;
                let ret = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
                match ret {
                    0 => Ok(false),
                    -1 => bail!(
                        "Task {} ({}) with pid {}: error in waitpid",
                        self.core.id,
                        self.core.name,
                        pid
                    ),
                    ret if ret == pid => {
                        if libc::WIFEXITED(status) {
                            let code = libc::WEXITSTATUS(status);
                            if code != 0 {
                                bail!(
                                    "Task {} ({}) with pid {} exited unexpectedly with status {}",
                                    self.core.id,
                                    self.core.name,
                                    pid,
                                    code
                                );
                            }
                            return Ok(true);
                        }
                        Ok(false)
                    }
                    _ => bail!(
                        "Task {} ({}) with pid {}: strange error in waitpid",
                        self.core.id,
                        self.core.name,
                        pid
                    ),
                }
            }
            Payload::Vm(vm_task) => Ok(vm::server_completed(&vm_task.spec.domain_name)),
        }
    }

    /// Acknowledge a VM completion so the next run can signal again.
    pub fn clear_exited(&self) {
        if let Payload::Vm(vm_task) = &self.payload {
            vm::clear_server_completed(&vm_task.spec.domain_name);
        }
    }

    pub fn remove_rundir(&self) {
        if let Payload::Process(process) = &self.payload {
            if let Err(e) = fs::remove_dir_all(&process.rundir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        "workload: Failed to remove rundir {:?} ({})",
                        &process.rundir, &e
                    );
                }
            }
        }
    }

    /// Reset counter state for a fresh run; accumulated history survives.
    pub fn reset(&mut self) {
        for stats in self.core.stats.iter_mut() {
            stats.reset();
        }
        self.core.status = Status::Runnable;
    }

    pub fn restart(&mut self) -> Result<()> {
        let limit = if self.core.max_restarts == std::u32::MAX {
            "inf".to_string()
        } else {
            self.core.max_restarts.to_string()
        };
        info!(
            "workload: Restarting task {}:{} {}/{}",
            self.core.id,
            self.core.name,
            self.core.restarts + 1,
            limit
        );
        if self.core.status != Status::LimitReached && self.core.status != Status::Exited {
            bail!(
                "Task {}:{} restarted from status {:?}",
                self.core.id,
                self.core.name,
                self.core.status
            );
        }

        self.reset();
        if matches!(self.payload, Payload::Process(_)) {
            self.remove_rundir();
            self.launch(false)?;
        } else {
            self.launch_vm_light()?;
        }
        self.start()?;
        self.core.restarts += 1;
        Ok(())
    }

    /// Resolve an Exited/LimitReached workload: stop its monitoring, kill
    /// what needs killing, then either relaunch it or mark it Done.
    pub fn restart_or_set_done(
        &mut self,
        rdt: &mut Rdt,
        perf: &mut Perf,
        events: &[String],
    ) -> Result<()> {
        let status = self.core.status;
        if status != Status::LimitReached && status != Status::Exited {
            return Ok(());
        }

        let mode = perf.mode();
        for (_i, cpu, pid) in self.pairs() {
            match mode {
                PerfMode::Pid => {
                    perf.clean_target(pid);
                    rdt.monitor_stop_pid(pid);
                }
                PerfMode::Cpu => {
                    perf.clean_target(cpu as i32);
                    rdt.monitor_stop_core(cpu);
                }
            }
        }

        if status == Status::LimitReached {
            info!(
                "workload: Task {}:{} limit reached, killing",
                self.core.id, self.core.name
            );
            self.kill()?;
        }

        if self.core.restarts < self.core.max_restarts {
            if self.core.initial_clos >= rdt.max_closids() {
                bail!(
                    "Initial CLOS {} of task {} out of range",
                    self.core.initial_clos,
                    self.core.name
                );
            }
            self.restart()?;

            for (_i, cpu, pid) in self.pairs() {
                match mode {
                    PerfMode::Pid => {
                        if self.core.initial_clos > 0 {
                            rdt.assign_pid(self.core.initial_clos, pid)?;
                        }
                        rdt.monitor_start_pid(pid)?;
                        perf.setup_events(pid, events)?;
                    }
                    PerfMode::Cpu => {
                        if self.core.initial_clos > 0 {
                            rdt.assign_cpu(self.core.initial_clos, cpu)?;
                        }
                        rdt.monitor_start_core(cpu)?;
                        perf.setup_events(cpu as i32, events)?;
                    }
                }
            }
        } else {
            self.core.status = Status::Done;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_split() {
        assert_eq!(
            shell_split("/bin/sleep 5").unwrap(),
            vec!["/bin/sleep", "5"]
        );
        assert_eq!(
            shell_split("stress-ng --cpu 4 --vm-keep").unwrap(),
            vec!["stress-ng", "--cpu", "4", "--vm-keep"]
        );
        assert_eq!(
            shell_split("sh -c 'echo  hi there'").unwrap(),
            vec!["sh", "-c", "echo  hi there"]
        );
        assert_eq!(
            shell_split("prog \"a b\"c").unwrap(),
            vec!["prog", "a bc"]
        );
        assert!(shell_split("prog 'unterminated").is_err());
        assert!(shell_split("   ").is_err());
    }

    fn process_workload(max_restarts: u32, batch: bool) -> Workload {
        let app: AppSpec = serde_yaml::from_str(&format!(
            "{{app: {{cmd: /bin/true}}, cpus: [0], max_restarts: {}, batch: {}}}",
            max_restarts, batch
        ))
        .unwrap();
        Workload::new_process(&app, "true".into(), "/tmp/copart-test-none").unwrap()
    }

    #[test]
    fn test_core_shapes_match() {
        let w = process_workload(2, false);
        assert_eq!(w.core.pids.len(), w.core.cpus.len());
        assert_eq!(w.core.stats.len(), w.core.cpus.len());
        assert_eq!(w.core.status, Status::Runnable);
        assert_eq!(w.max_instr(), None);
    }

    #[test]
    fn test_pairs_skip_cleared_slots() {
        let mut w = process_workload(0, false);
        assert!(w.pairs().is_empty());
        w.core.pids[0] = 4242;
        assert_eq!(w.pairs(), vec![(0, 0, 4242)]);
    }

    #[test]
    fn test_target_mode() {
        assert_eq!(Workload::target(PerfMode::Pid, 3, 100), 100);
        assert_eq!(Workload::target(PerfMode::Cpu, 3, 100), 3);
    }

    #[test]
    fn test_restart_requires_terminal_status() {
        let mut w = process_workload(5, false);
        assert!(w.restart().is_err());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(Status::Runnable.as_str(), "runnable");
        assert_eq!(Status::Done.as_str(), "done");
    }
}
