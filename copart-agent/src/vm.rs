// Copyright (c) copart.
//
// Libvirt and peer-host plumbing for VM workloads. Every libvirt operation
// is a one-shot virsh invocation; SSH launches the server command inside
// the VM and drives the client peer. Success or failure comes from the
// exit code alone.
use anyhow::{anyhow, bail, Result};
use copart_util::{run_command, run_command_output};
use lazy_static::lazy_static;
use log::{info, warn};
use scan_fmt::scan_fmt;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::thread::sleep;
use std::time::Duration;

use copart_agent_intf::VmSpec;

// Host-specific conventions of the experiment testbed.
const VM_USER: &str = "tbench";
const PEER_USER: &str = "tbench";
const PEER_HOST: &str = "peer";
const PEER_PORT: &str = "3322";
const CEPH_POOL: &str = "libvirt-pool";
const VM_DISK: &str = "vda";
const SENTINEL_BASE: &str = "/homenvm";
const MAX_PING_TRIES: u32 = 10;

const N_BLOCK_FIELDS: usize = 9;
const F_RD_REQ: usize = 0;
const F_RD_BYTES: usize = 1;
const F_WR_REQ: usize = 2;
const F_WR_BYTES: usize = 3;
const F_RD_TIMES: usize = 6;
const F_WR_TIMES: usize = 7;

fn virsh(args: &[&str], emsg: &str) -> Result<()> {
    run_command(Command::new("virsh").args(args), emsg)
}

fn virsh_output(args: &[&str], emsg: &str) -> Result<String> {
    run_command_output(Command::new("virsh").args(args), emsg)
}

fn ssh_vm(ip: &str, script: &str, emsg: &str) -> Result<()> {
    run_command(
        Command::new("ssh")
            .arg("-T")
            .arg(format!("{}@{}", VM_USER, ip))
            .arg(script),
        emsg,
    )
}

fn ssh_peer(script: &str, emsg: &str) -> Result<()> {
    run_command(
        Command::new("ssh")
            .arg("-p")
            .arg(PEER_PORT)
            .arg(format!("{}@{}", PEER_USER, PEER_HOST))
            .arg(script),
        emsg,
    )
}

/// Substitute the connection placeholders a configured argument string may
/// carry before it goes to the server or client script.
fn expand_arguments(template: &str, spec: &VmSpec) -> String {
    template
        .replace("{server}", &spec.ip)
        .replace("{server_port}", &spec.port)
        .replace("{args}", &spec.arguments)
        .replace("{client_args}", &spec.client_arguments)
}

pub fn domain_exists(domain: &str) -> bool {
    virsh_output(&["dominfo", domain], "domain lookup failed").is_ok()
}

pub fn snapshot_exists(domain: &str, snapshot: &str) -> bool {
    virsh_output(
        &["snapshot-info", "--domain", domain, "--snapshotname", snapshot],
        "snapshot lookup failed",
    )
    .is_ok()
}

/// Revert to a libvirt-managed snapshot, leaving the domain running.
pub fn snapshot_revert(domain: &str, snapshot: &str) -> Result<()> {
    info!("vm: Reverting {} to snapshot {}", domain, snapshot);
    virsh(
        &[
            "snapshot-revert",
            "--domain",
            domain,
            "--snapshotname",
            snapshot,
            "--running",
            "--force",
        ],
        "snapshot revert failed",
    )
}

/// Roll a Ceph-backed disk back and boot the domain, then wait for the
/// guest to answer pings.
pub fn ceph_snapshot_revert(domain: &str, snapshot: &str, ip: &str) -> Result<()> {
    info!("vm: Rolling back {}/{}@{}", CEPH_POOL, domain, snapshot);
    run_command(
        Command::new("rbd")
            .arg("snap")
            .arg("rollback")
            .arg(format!("{}/{}@{}", CEPH_POOL, domain, snapshot)),
        "rbd snapshot rollback failed",
    )?;
    virsh(&["start", domain], "domain start failed")?;
    ping_wait(ip)
}

fn ping_wait(ip: &str) -> Result<()> {
    for _ in 0..MAX_PING_TRIES {
        if run_command(
            Command::new("ping").args(&["-c", "1", "-W", "1", ip]),
            "ping failed",
        )
        .is_ok()
        {
            return Ok(());
        }
        sleep(Duration::from_secs(1));
    }
    bail!("Guest {} did not answer after {} pings", ip, MAX_PING_TRIES)
}

pub fn domain_shutdown(domain: &str) -> Result<()> {
    info!("vm: Shutting down {}", domain);
    virsh(&["shutdown", domain], "domain shutdown failed")
}

pub fn set_vcpus(domain: &str, count: usize) -> Result<()> {
    virsh(
        &["setvcpus", domain, &count.to_string(), "--live"],
        "setvcpus failed",
    )
}

/// Bring hot-added guest CPUs online. CPU 0 is always online.
pub fn online_guest_cpus(ip: &str, count: usize) -> Result<()> {
    for n in 1..count {
        ssh_vm(
            ip,
            &format!(
                "sudo bash -c \"echo 1 > /sys/devices/system/cpu/cpu{}/online\"",
                n
            ),
            "onlining guest cpu failed",
        )?;
    }
    Ok(())
}

pub fn pin_vcpu(domain: &str, vcpu: usize, cpu: u32) -> Result<()> {
    virsh(
        &["vcpupin", domain, &vcpu.to_string(), &cpu.to_string()],
        "vcpupin failed",
    )
}

lazy_static! {
    static ref VCPU_PID_RE: regex::Regex =
        regex::Regex::new(r"<vcpu\s+id='\d+'\s+pid='(\d+)'").unwrap();
    static ref CPU_TIME_RE: regex::Regex =
        regex::Regex::new(r"CPU time:\s+([0-9.]+)s").unwrap();
}

/// QEMU vCPU thread ids from the libvirt runtime state file, in vCPU order.
pub fn vcpu_thread_pids(domain: &str) -> Result<Vec<i32>> {
    let path = format!("/var/run/libvirt/qemu/{}.xml", domain);
    let body = fs::read_to_string(&path)
        .map_err(|e| anyhow!("Failed to read qemu state {:?} ({})", &path, &e))?;

    let pids: Vec<i32> = VCPU_PID_RE
        .captures_iter(&body)
        .filter_map(|c| c[1].parse().ok())
        .collect();
    if pids.is_empty() {
        bail!("No vcpu threads found in {:?}", path);
    }
    Ok(pids)
}

/// Cumulative per-vCPU execution time in seconds.
pub fn vcpu_times(domain: &str) -> Result<Vec<f64>> {
    let output = virsh_output(&["vcpuinfo", domain], "vcpuinfo failed")?;
    Ok(CPU_TIME_RE
        .captures_iter(&output)
        .filter_map(|c| c[1].parse().ok())
        .collect())
}

/// Per-vCPU utilization percent between two vcpu_times() snapshots.
pub fn vm_cpu_usage(then: &[f64], now: &[f64], vcpu: usize, wallclock_secs: f64) -> f64 {
    if vcpu >= then.len() || vcpu >= now.len() || wallclock_secs <= 0.0 {
        return 0.0;
    }
    100.0 * (now[vcpu] - then[vcpu]) / wallclock_secs
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiskLimits {
    pub total_bytes_sec: u64,
    pub read_bytes_sec: u64,
    pub write_bytes_sec: u64,
    pub total_iops_sec: u64,
    pub read_iops_sec: u64,
    pub write_iops_sec: u64,
}

impl DiskLimits {
    pub fn from_spec(spec: &VmSpec) -> Self {
        Self {
            total_bytes_sec: spec.disk_total_bytes_sec,
            read_bytes_sec: spec.disk_read_bytes_sec,
            write_bytes_sec: spec.disk_write_bytes_sec,
            total_iops_sec: spec.disk_total_iops_sec,
            read_iops_sec: spec.disk_read_iops_sec,
            write_iops_sec: spec.disk_write_iops_sec,
        }
    }

    fn any(&self) -> bool {
        self.total_bytes_sec > 0
            || self.read_bytes_sec > 0
            || self.write_bytes_sec > 0
            || self.total_iops_sec > 0
            || self.read_iops_sec > 0
            || self.write_iops_sec > 0
    }
}

/// Apply the configured block-IO throttles to the live domain.
pub fn apply_block_iotune(domain: &str, limits: &DiskLimits) -> Result<()> {
    if !limits.any() {
        return Ok(());
    }

    let mut args: Vec<String> = vec![
        "blkdeviotune".into(),
        domain.into(),
        VM_DISK.into(),
        "--live".into(),
    ];
    for (flag, value) in &[
        ("--total-bytes-sec", limits.total_bytes_sec),
        ("--read-bytes-sec", limits.read_bytes_sec),
        ("--write-bytes-sec", limits.write_bytes_sec),
        ("--total-iops-sec", limits.total_iops_sec),
        ("--read-iops-sec", limits.read_iops_sec),
        ("--write-iops-sec", limits.write_iops_sec),
    ] {
        if *value > 0 {
            args.push(flag.to_string());
            args.push(value.to_string());
        }
    }

    info!("vm: Applying disk throttles to {}: {:?}", domain, limits);
    run_command(
        Command::new("virsh").args(&args),
        "block iotune failed",
    )
}

fn parse_domblkstat(output: &str) -> [u64; N_BLOCK_FIELDS] {
    let mut fields = [0u64; N_BLOCK_FIELDS];
    for line in output.lines() {
        let (_dev, key, value) = match scan_fmt!(line, "{} {} {d}", String, String, u64) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let idx = match key.as_str() {
            "rd_req" | "rd_operations" => F_RD_REQ,
            "rd_bytes" => F_RD_BYTES,
            "wr_req" | "wr_operations" => F_WR_REQ,
            "wr_bytes" => F_WR_BYTES,
            "errs" => 4,
            "flush_operations" => 5,
            "rd_total_times" => F_RD_TIMES,
            "wr_total_times" => F_WR_TIMES,
            "flush_total_times" => 8,
            _ => continue,
        };
        fields[idx] = value;
    }
    fields
}

/// Cumulative block-device statistics with one interval of history, enough
/// to expose both the raw counters and per-quantum deltas.
#[derive(Debug, Clone, Default)]
pub struct BlockStats {
    current: [u64; N_BLOCK_FIELDS],
    last: [u64; N_BLOCK_FIELDS],
    overall: [u64; N_BLOCK_FIELDS],
}

impl BlockStats {
    pub fn refresh(&mut self, domain: &str) -> Result<()> {
        let output = virsh_output(&["domblkstat", domain], "domblkstat failed")?;
        self.update(parse_domblkstat(&output));
        Ok(())
    }

    fn update(&mut self, fields: [u64; N_BLOCK_FIELDS]) {
        self.last = self.current;
        self.current = fields;
        for i in 0..N_BLOCK_FIELDS {
            if self.last[i] > 0 {
                self.overall[i] += self.current[i].saturating_sub(self.last[i]);
            }
        }
    }

    pub fn read_bytes(&self) -> u64 {
        self.current[F_RD_BYTES]
    }

    pub fn write_bytes(&self) -> u64 {
        self.current[F_WR_BYTES]
    }

    pub fn read_iops(&self) -> u64 {
        self.current[F_RD_REQ]
    }

    pub fn write_iops(&self) -> u64 {
        self.current[F_WR_REQ]
    }

    /// Nanoseconds the device spent on reads and writes in the last
    /// quantum.
    pub fn io_time_quantum(&self) -> u64 {
        let rd = self.current[F_RD_TIMES].saturating_sub(self.last[F_RD_TIMES]);
        let wr = self.current[F_WR_TIMES].saturating_sub(self.last[F_WR_TIMES]);
        rd + wr
    }

    pub fn log_totals(&self, domain: &str, interval_secs: f64, intervals: u64) {
        let time = interval_secs * intervals as f64;
        if time <= 0.0 {
            return;
        }
        let rd_mb = self.overall[F_RD_BYTES] as f64 / (1 << 20) as f64;
        let wr_mb = self.overall[F_WR_BYTES] as f64 / (1 << 20) as f64;
        info!(
            "vm: {} disk totals: read {:.2} MBps, write {:.2} MBps",
            domain,
            rd_mb / time,
            wr_mb / time
        );
    }
}

fn sentinel_dir(domain: &str) -> PathBuf {
    PathBuf::from(format!("{}/dsf_{}", SENTINEL_BASE, domain))
}

/// The client peer signals it has begun.
pub fn client_started(domain: &str) -> bool {
    sentinel_dir(domain).join("STARTED").exists()
}

/// The server signals completion.
pub fn server_completed(domain: &str) -> bool {
    sentinel_dir(domain).join("SERVER_COMPLETED").exists()
}

/// Acknowledge a completion so a later restart starts fresh.
pub fn clear_server_completed(domain: &str) {
    let path = sentinel_dir(domain).join("SERVER_COMPLETED");
    if let Err(e) = fs::remove_file(&path) {
        warn!("vm: Failed to remove {:?} ({})", &path, &e);
    }
}

/// Launch the server-side command inside the VM, detached, with its log
/// named after the run.
pub fn launch_server(spec: &VmSpec, run_id: u32) -> Result<()> {
    let args = expand_arguments(&spec.arguments, spec);
    let script = format!(
        "./run.sh \"/home/{user}/server_scripts/run_server.sh {args} \
         < /dev/null 2&> /home/{user}/out/server_log_{run}.txt &\"",
        user = VM_USER,
        args = args,
        run = run_id,
    );
    info!("vm: Launching server on {}: {}", spec.domain_name, &script);
    ssh_vm(&spec.ip, &script, "server launch failed")
}

/// Bring the client peer up: revert-and-run its VM, or nothing for a
/// native client (which is launched by launch_client).
pub fn prepare_client(spec: &VmSpec) -> Result<()> {
    if spec.client_native {
        return Ok(());
    }
    let domain = spec
        .client_domain_name
        .as_ref()
        .ok_or_else(|| anyhow!("Client VM of {} has no domain name", spec.domain_name))?;
    let snapshot = spec
        .client_snapshot_name
        .as_ref()
        .ok_or_else(|| anyhow!("Client VM {} has no snapshot name", domain))?;

    let script = format!(
        "LIBVIRT_DEFAULT_URI=qemu:///system virsh snapshot-revert --domain {} \
         --snapshotname {} --running --force",
        domain, snapshot
    );
    info!("vm: Reverting client VM {}", domain);
    ssh_peer(&script, "client VM revert failed")?;

    let script = format!(
        "LIBVIRT_DEFAULT_URI=qemu:///system virsh setvcpus {} {} --live",
        domain,
        spec.client_cpus.len().max(1)
    );
    ssh_peer(&script, "client VM setvcpus failed")?;

    if let Some(client_ip) = &spec.client_domain_ip {
        online_guest_cpus(client_ip, spec.client_cpus.len())?;
    }
    Ok(())
}

/// Kick off the client run against the server.
pub fn launch_client(spec: &VmSpec, run_id: u32) -> Result<()> {
    let args = expand_arguments(&spec.client_arguments, spec);

    if spec.client_native {
        let script = format!(
            "/home/client_scripts/run_client_native.sh {user} {domain} {run} {args} \
             < /dev/null 2&> /home/dsf_{domain}/client_log_{run}.txt &",
            user = PEER_USER,
            domain = spec.domain_name,
            run = run_id,
            args = args,
        );
        info!("vm: Launching native client for {}", spec.domain_name);
        return ssh_peer(&script, "native client launch failed");
    }

    let client_ip = spec
        .client_domain_ip
        .as_ref()
        .ok_or_else(|| anyhow!("Client VM of {} has no ip", spec.domain_name))?;
    let script = format!(
        "./run.sh \"/home/{user}/client_scripts/run_client.sh {peer} {domain} {args} \
         < /dev/null 2&> /home/{user}/dsf_{domain}/client_log.txt &\"",
        user = VM_USER,
        peer = PEER_USER,
        domain = spec.domain_name,
        args = args,
    );
    info!("vm: Launching client VM for {}", spec.domain_name);
    ssh_vm(client_ip, &script, "client launch failed")
}

/// Best-effort shutdown of the client peer VM, used from the cleanup path.
pub fn shutdown_client(spec: &VmSpec) {
    let domain = match &spec.client_domain_name {
        Some(v) => v,
        None => return,
    };
    let script = format!(
        "LIBVIRT_DEFAULT_URI=qemu:///system virsh shutdown {}",
        domain
    );
    if let Err(e) = ssh_peer(&script, "client VM shutdown failed") {
        warn!("vm: Could not shut down client VM {} ({})", domain, &e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_domblkstat() {
        let output = "\
vda rd_req 5851
vda rd_bytes 221694976
vda wr_req 2109
vda wr_bytes 54398976
vda flush_operations 937
vda rd_total_times 1784486978
vda wr_total_times 2186116959
vda flush_total_times 302456300
";
        let fields = parse_domblkstat(output);
        assert_eq!(fields[F_RD_REQ], 5851);
        assert_eq!(fields[F_RD_BYTES], 221694976);
        assert_eq!(fields[F_WR_BYTES], 54398976);
        assert_eq!(fields[F_RD_TIMES], 1784486978);
        assert_eq!(fields[8], 302456300);
    }

    #[test]
    fn test_block_stats_quantum() {
        let mut stats = BlockStats::default();
        let mut a = [0u64; N_BLOCK_FIELDS];
        a[F_RD_TIMES] = 1000;
        a[F_WR_TIMES] = 500;
        a[F_RD_BYTES] = 4096;
        stats.update(a);

        let mut b = a;
        b[F_RD_TIMES] = 1500;
        b[F_WR_TIMES] = 900;
        b[F_RD_BYTES] = 8192;
        stats.update(b);

        assert_eq!(stats.io_time_quantum(), 900);
        assert_eq!(stats.read_bytes(), 8192);
        assert_eq!(stats.overall[F_RD_BYTES], 4096);
    }

    #[test]
    fn test_vm_cpu_usage() {
        let then = vec![10.0, 20.0];
        let now = vec![10.5, 21.0];
        assert_eq!(vm_cpu_usage(&then, &now, 0, 1.0), 50.0);
        assert_eq!(vm_cpu_usage(&then, &now, 1, 1.0), 100.0);
        assert_eq!(vm_cpu_usage(&then, &now, 5, 1.0), 0.0);
    }

    #[test]
    fn test_expand_arguments() {
        let mut spec = test_spec();
        spec.arguments = "-p {server_port} -h {server}".into();
        assert_eq!(
            expand_arguments(&spec.arguments.clone(), &spec),
            "-p 22 -h 10.0.0.2"
        );
    }

    fn test_spec() -> VmSpec {
        serde_yaml::from_str(
            "{kind: VM, domain_name: xpl_web_1, snapshot_name: base, ip: 10.0.0.2}",
        )
        .map(|t| match t {
            copart_agent_intf::TaskSpec::Vm(vm) => vm,
            _ => panic!(),
        })
        .unwrap()
    }
}
