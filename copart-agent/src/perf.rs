// Copyright (c) copart.
//
// PMU adapter: one perf_event_open group per configured event list, bound
// to a PID or a CPU. Groups are read with PERF_FORMAT_GROUP so that every
// member shares the leader's enabled/running times.
use anyhow::{anyhow, bail, Result};
use copart_agent_intf::PerfMode;
use copart_util::read_one_line;
use log::{debug, info};
use std::collections::BTreeMap;
use std::mem;
use std::os::unix::io::RawFd;

use super::counters::{Counter, CounterVec};

pub const MAX_NUM_EVENTS: usize = 32;

const PERF_TYPE_HARDWARE: u32 = 0;
const PERF_TYPE_RAW: u32 = 4;

const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;
const PERF_COUNT_HW_BUS_CYCLES: u64 = 6;
const PERF_COUNT_HW_STALLED_CYCLES_FRONTEND: u64 = 7;
const PERF_COUNT_HW_STALLED_CYCLES_BACKEND: u64 = 8;
const PERF_COUNT_HW_REF_CPU_CYCLES: u64 = 9;

const PERF_FORMAT_TOTAL_TIME_ENABLED: u64 = 1 << 0;
const PERF_FORMAT_TOTAL_TIME_RUNNING: u64 = 1 << 1;
const PERF_FORMAT_GROUP: u64 = 1 << 3;

const FLAG_DISABLED: u64 = 1 << 0;

const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
const PERF_IOC_FLAG_GROUP: libc::c_ulong = 1;

/// perf_event_attr structure (subset needed for counting mode).
#[repr(C)]
#[derive(Debug, Default)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    __reserved_2: u16,
    aux_sample_size: u32,
    __reserved_3: u32,
    sig_data: u64,
    config3: u64,
}

/// Map an event name to (type, config). Symbolic micro-architectural names
/// used in the configs resolve through the alias table; anything else must
/// be a generalized event or a raw `rNNNN` spec.
fn resolve_event(name: &str) -> Result<(u32, u64)> {
    let resolved = match name {
        "cycles" | "cpu-cycles" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
        "instructions" | "inst_retired.any" => {
            (PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS)
        }
        "cache-references" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_REFERENCES),
        "cache-misses" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_MISSES),
        "branches" | "branch-instructions" => {
            (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_INSTRUCTIONS)
        }
        "branch-misses" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_MISSES),
        "bus-cycles" => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BUS_CYCLES),
        "stalled-cycles-frontend" => {
            (PERF_TYPE_HARDWARE, PERF_COUNT_HW_STALLED_CYCLES_FRONTEND)
        }
        "stalled-cycles-backend" => {
            (PERF_TYPE_HARDWARE, PERF_COUNT_HW_STALLED_CYCLES_BACKEND)
        }
        "ref-cycles" | "cpu_clk_unhalted.ref_tsc" => {
            (PERF_TYPE_HARDWARE, PERF_COUNT_HW_REF_CPU_CYCLES)
        }
        // mem_load_retired.* (event 0xd1) with the miss-level umasks.
        "mem_load_retired.l1_miss" => (PERF_TYPE_RAW, 0x08d1),
        "mem_load_retired.l2_miss" => (PERF_TYPE_RAW, 0x10d1),
        "mem_load_retired.l3_miss" => (PERF_TYPE_RAW, 0x20d1),
        name if name.starts_with('r') && name.len() > 1 => {
            let config = u64::from_str_radix(&name[1..], 16)
                .map_err(|_| anyhow!("Invalid raw event spec {:?}", name))?;
            (PERF_TYPE_RAW, config)
        }
        name => bail!("Unknown perf event {:?}", name),
    };
    Ok(resolved)
}

#[derive(Debug)]
struct EventGroup {
    names: Vec<String>,
    fds: Vec<RawFd>,
}

impl EventGroup {
    fn leader(&self) -> RawFd {
        self.fds[0]
    }

    fn open(target: i32, mode: PerfMode, spec: &str) -> Result<EventGroup> {
        let names: Vec<String> = spec
            .split(',')
            .map(|x| x.trim().to_string())
            .filter(|x| !x.is_empty())
            .collect();
        if names.is_empty() {
            bail!("Empty event group spec {:?}", spec);
        }
        if names.len() >= MAX_NUM_EVENTS {
            bail!("Too many events in group {:?}", spec);
        }

        let (pid, cpu) = match mode {
            PerfMode::Pid => (target, -1),
            PerfMode::Cpu => (-1, target),
        };

        let mut fds: Vec<RawFd> = vec![];
        for name in &names {
            let (type_, config) = resolve_event(name)?;
            let leader = fds.first().copied().unwrap_or(-1);

            let mut attr = PerfEventAttr::default();
            attr.type_ = type_;
            attr.size = mem::size_of::<PerfEventAttr>() as u32;
            attr.config = config;
            attr.read_format = PERF_FORMAT_TOTAL_TIME_ENABLED
                | PERF_FORMAT_TOTAL_TIME_RUNNING
                | PERF_FORMAT_GROUP;
            if leader < 0 {
                attr.flags = FLAG_DISABLED;
            }

            let fd = unsafe {
                libc::syscall(
                    libc::SYS_perf_event_open,
                    &attr as *const PerfEventAttr,
                    pid,
                    cpu,
                    leader,
                    0u64,
                )
            } as RawFd;

            if fd < 0 {
                let err = std::io::Error::last_os_error();
                for fd in fds {
                    unsafe { libc::close(fd) };
                }
                bail!("Could not open event {:?} for target {} ({})", name, target, err);
            }
            fds.push(fd);
        }

        Ok(EventGroup { names, fds })
    }

    fn enable(&self) {
        unsafe { libc::ioctl(self.leader(), PERF_EVENT_IOC_ENABLE, PERF_IOC_FLAG_GROUP) };
    }

    fn disable(&self) {
        unsafe { libc::ioctl(self.leader(), PERF_EVENT_IOC_DISABLE, PERF_IOC_FLAG_GROUP) };
    }

    fn read(&self) -> Result<CounterVec> {
        let mut buf: Vec<u64> = vec![0; 3 + self.names.len()];
        let want = buf.len() * mem::size_of::<u64>();
        let got = unsafe {
            libc::read(
                self.leader(),
                buf.as_mut_ptr() as *mut libc::c_void,
                want,
            )
        };
        if got < 0 {
            bail!(
                "Failed to read event group {:?} ({})",
                self.names,
                std::io::Error::last_os_error()
            );
        }
        parse_group_read(&buf, &self.names)
    }
}

impl Drop for EventGroup {
    fn drop(&mut self) {
        for fd in &self.fds {
            unsafe { libc::close(*fd) };
        }
    }
}

fn parse_group_read(buf: &[u64], names: &[String]) -> Result<CounterVec> {
    let nr = buf[0] as usize;
    if nr != names.len() {
        bail!(
            "Event group read returned {} values, expected {}",
            nr,
            names.len()
        );
    }
    let (enabled, running) = (buf[1], buf[2]);
    if running > enabled {
        bail!(
            "Event group {:?} ran longer than it was enabled ({} > {})",
            names,
            running,
            enabled
        );
    }

    Ok(names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let mut c = Counter::new(i, name, buf[3 + i] as f64, false);
            c.enabled = enabled;
            c.running = running;
            c
        })
        .collect())
}

/// All event groups of a run, keyed by target (PID or CPU depending on the
/// configured mode).
#[derive(Debug)]
pub struct Perf {
    mode: PerfMode,
    groups: BTreeMap<i32, Vec<EventGroup>>,
}

impl Perf {
    pub fn new(mode: PerfMode) -> Self {
        Self {
            mode,
            groups: BTreeMap::new(),
        }
    }

    pub fn mode(&self) -> PerfMode {
        self.mode
    }

    pub fn setup_events(&mut self, target: i32, group_specs: &[String]) -> Result<()> {
        for spec in group_specs {
            info!("perf: Opening events {:?} for target {}", spec, target);
            let group = EventGroup::open(target, self.mode, spec)?;
            group.enable();
            self.groups.entry(target).or_default().push(group);
        }
        Ok(())
    }

    pub fn enable(&self, target: i32) {
        if let Some(groups) = self.groups.get(&target) {
            for group in groups {
                group.enable();
            }
        }
    }

    pub fn disable(&self, target: i32) {
        if let Some(groups) = self.groups.get(&target) {
            for group in groups {
                group.disable();
            }
        }
    }

    /// One counter vector per group, in setup order.
    pub fn read(&self, target: i32) -> Result<Vec<CounterVec>> {
        let groups = self
            .groups
            .get(&target)
            .ok_or_else(|| anyhow!("No events set up for target {}", target))?;
        groups.iter().map(|g| g.read()).collect()
    }

    /// Event names per group, in setup order.
    pub fn names(&self, target: i32) -> Vec<Vec<String>> {
        match self.groups.get(&target) {
            Some(groups) => groups.iter().map(|g| g.names.clone()).collect(),
            None => vec![],
        }
    }

    pub fn clean_target(&mut self, target: i32) {
        debug!("perf: Releasing events of target {}", target);
        self.groups.remove(&target);
    }

    pub fn clean(&mut self) {
        debug!("perf: Releasing all events");
        self.groups.clear();
    }
}

const RAPL_PKG: &str = "/sys/class/powercap/intel-rapl:0";
const RAPL_RAM: &str = "/sys/class/powercap/intel-rapl:0/intel-rapl:0:0";

fn read_rapl(dir: &str, file: &str, expected_name: &str) -> Result<u64> {
    let name = read_one_line(format!("{}/name", dir))?;
    if name != expected_name {
        bail!(
            "RAPL domain under {:?} is {:?}, expected {:?}",
            dir,
            name,
            expected_name
        );
    }
    Ok(read_one_line(format!("{}/{}", dir, file))?.parse()?)
}

pub fn read_max_ujoules_pkg() -> Result<u64> {
    read_rapl(RAPL_PKG, "max_energy_range_uj", "package-0")
}

pub fn read_max_ujoules_ram() -> Result<u64> {
    read_rapl(RAPL_RAM, "max_energy_range_uj", "dram")
}

/// Package energy in joules, cumulative and wrapping at the max range.
pub fn read_energy_pkg() -> Result<f64> {
    Ok(read_rapl(RAPL_PKG, "energy_uj", "package-0")? as f64 / 1e6)
}

/// DRAM energy in joules, cumulative and wrapping at the max range.
pub fn read_energy_ram() -> Result<f64> {
    Ok(read_rapl(RAPL_RAM, "energy_uj", "dram")? as f64 / 1e6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_event() {
        for pair in &[
            ("instructions", (PERF_TYPE_HARDWARE, 1)),
            ("inst_retired.any", (PERF_TYPE_HARDWARE, 1)),
            ("cycles", (PERF_TYPE_HARDWARE, 0)),
            ("ref-cycles", (PERF_TYPE_HARDWARE, 9)),
            ("cpu_clk_unhalted.ref_tsc", (PERF_TYPE_HARDWARE, 9)),
            ("mem_load_retired.l2_miss", (PERF_TYPE_RAW, 0x10d1)),
            ("mem_load_retired.l3_miss", (PERF_TYPE_RAW, 0x20d1)),
            ("r01c2", (PERF_TYPE_RAW, 0x01c2)),
        ] {
            assert_eq!(resolve_event(pair.0).unwrap(), pair.1);
        }
        assert!(resolve_event("not-an-event").is_err());
        assert!(resolve_event("rZZZZ").is_err());
    }

    #[test]
    fn test_parse_group_read() {
        let names = vec!["instructions".to_string(), "cycles".to_string()];
        let counters =
            parse_group_read(&[2, 1000, 500, 1234, 5678], &names).unwrap();
        assert_eq!(counters.len(), 2);
        assert_eq!(counters[0].name, "instructions");
        assert_eq!(counters[0].value, 1234.0);
        assert_eq!(counters[0].enabled, 1000);
        assert_eq!(counters[0].running, 500);
        assert_eq!(counters[1].id, 1);
        assert_eq!(counters[1].value, 5678.0);

        // Truncated reads and running > enabled are rejected.
        assert!(parse_group_read(&[1, 1000, 500, 1234, 5678], &names).is_err());
        assert!(parse_group_read(&[2, 500, 1000, 1234, 5678], &names).is_err());
    }
}
