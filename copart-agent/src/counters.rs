// Copyright (c) copart.
//
// Counter store: turns raw per-interval sample vectors into rolling-window
// statistics and derived metrics. One store per (workload, CPU) stream.
use anyhow::{bail, Result};
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::perf::{read_max_ujoules_pkg, read_max_ujoules_ram};

pub const WIN_SIZE: usize = 7;

pub const ENERGY_PKG: &str = "power/energy-pkg/";
pub const ENERGY_RAM: &str = "power/energy-ram/";
pub const LLC_OCCUP: &str = "LLC_occup[MB]";
pub const MEM_BW_LOCAL: &str = "MBL[MBps]";
pub const MEM_BW_TOTAL: &str = "MBT[MBps]";
pub const MEM_BW_REMOTE: &str = "MBR[MBps]";
pub const READ_BYTES: &str = "Read_bytes_sec";
pub const WRITE_BYTES: &str = "Write_bytes_sec";
pub const READ_IOPS: &str = "Read_iops_sec";
pub const WRITE_IOPS: &str = "Write_iops_sec";
pub const TIME_IO_DISK: &str = "Time_io_disk_ns";
pub const NET_TX: &str = "Tx_netBW[KBps]";
pub const NET_RX: &str = "Rx_netBW[KBps]";
pub const OVS_NET_TX: &str = "OVS_Tx_netBW[KBps]";
pub const OVS_NET_RX: &str = "OVS_Rx_netBW[KBps]";
pub const TIME_INT: &str = "Time[ns]";

pub const INSTRUCTIONS: &str = "inst_retired.any";
pub const CYCLES: &str = "cycles";
pub const REF_CYCLES: &str = "cpu_clk_unhalted.ref_tsc";
pub const L2_MISSES: &str = "mem_load_retired.l2_miss";
pub const L3_MISSES: &str = "mem_load_retired.l3_miss";

/// Cycle period assumed by the iostat derived metric (2.1 GHz).
const T_CYCLE: f64 = 0.000000000476190476190476;

fn is_mem_bw(name: &str) -> bool {
    name == MEM_BW_LOCAL || name == MEM_BW_TOTAL || name == MEM_BW_REMOTE
}

/// Counters which may legitimately go backwards between intervals and are
/// clamped to zero when they do.
fn is_negative_clamped(name: &str) -> bool {
    is_mem_bw(name)
        || name == NET_RX
        || name == NET_TX
        || name == OVS_NET_RX
        || name == OVS_NET_TX
        || name == TIME_IO_DISK
}

fn is_energy(name: &str) -> bool {
    name == ENERGY_PKG || name == ENERGY_RAM
}

/// One raw reading of one named counter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Counter {
    pub id: usize,
    pub name: String,
    pub value: f64,
    pub unit: String,
    /// The reading already represents the interval or current state rather
    /// than a cumulative count.
    pub snapshot: bool,
    pub enabled: u64,
    pub running: u64,
}

impl Counter {
    pub fn new(id: usize, name: &str, value: f64, snapshot: bool) -> Self {
        Self {
            id,
            name: name.into(),
            value,
            unit: String::new(),
            snapshot,
            enabled: 1,
            running: 1,
        }
    }
}

pub type CounterVec = Vec<Counter>;

/// Accumulator with total and rolling-window statistics.
#[derive(Debug, Clone, Default)]
pub struct Accum {
    window: VecDeque<f64>,
    last: f64,
    sum: f64,
    count: u64,
}

impl Accum {
    pub fn push(&mut self, v: f64) {
        if self.window.len() == WIN_SIZE {
            self.window.pop_front();
        }
        self.window.push_back(v);
        self.last = v;
        self.sum += v;
        self.count += 1;
    }

    pub fn last(&self) -> f64 {
        self.last
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn rolling_mean(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.window.iter().sum::<f64>() / self.window.len() as f64
        }
    }
}

/// Metrics computed from the raw accumulators. The interval form evaluates
/// over the latest pushed values, the total form over sums (or means where
/// the counter is a snapshot).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Derived {
    Iostat,
    DiskBw,
    Ipc,
    RefIpc,
    MpkiL2,
    MpkiL3,
}

impl Derived {
    fn name(&self) -> &'static str {
        match self {
            Self::Iostat => "iostat",
            Self::DiskBw => "Disk_BW[MBps]",
            Self::Ipc => "ipc",
            Self::RefIpc => "ref-ipc",
            Self::MpkiL2 => "mpki-l2",
            Self::MpkiL3 => "mpki-l3",
        }
    }

    fn eval_interval(&self, store: &CounterStore) -> f64 {
        match self {
            Self::Iostat => (store.last(TIME_IO_DISK) / 1e10) / T_CYCLE,
            Self::DiskBw => {
                (store.last(READ_BYTES) + store.last(WRITE_BYTES))
                    / store.interval_secs
                    / (1 << 20) as f64
            }
            Self::Ipc => store.last(INSTRUCTIONS) / store.last(CYCLES),
            Self::RefIpc => store.last(INSTRUCTIONS) / store.last(REF_CYCLES),
            Self::MpkiL2 => 1000.0 * store.last(L2_MISSES) / store.last(INSTRUCTIONS),
            Self::MpkiL3 => 1000.0 * store.last(L3_MISSES) / store.last(INSTRUCTIONS),
        }
    }

    fn eval_total(&self, store: &CounterStore) -> f64 {
        match self {
            Self::Iostat => (store.sum(TIME_IO_DISK) / 1e10) / T_CYCLE,
            // The total table has always reported zero disk bandwidth while
            // the interval table computes it. Kept for output compatibility.
            Self::DiskBw => 0.0,
            Self::Ipc => store.sum(INSTRUCTIONS) / store.sum(CYCLES),
            Self::RefIpc => store.sum(INSTRUCTIONS) / store.sum(REF_CYCLES),
            Self::MpkiL2 => 1000.0 * store.sum(L2_MISSES) / store.sum(INSTRUCTIONS),
            Self::MpkiL3 => 1000.0 * store.sum(L3_MISSES) / store.sum(INSTRUCTIONS),
        }
    }
}

fn derived_for(names: &[String]) -> Vec<Derived> {
    let has = |name: &str| names.iter().any(|n| n == name);
    let mut derived = vec![];

    if has(TIME_IO_DISK) {
        derived.push(Derived::Iostat);
    }
    if has(READ_BYTES) && has(WRITE_BYTES) {
        derived.push(Derived::DiskBw);
    }
    if has(INSTRUCTIONS) && has(CYCLES) {
        derived.push(Derived::Ipc);
    }
    if has(INSTRUCTIONS) && has(REF_CYCLES) {
        derived.push(Derived::RefIpc);
    }
    if has(INSTRUCTIONS) && has(L2_MISSES) {
        derived.push(Derived::MpkiL2);
    }
    if has(INSTRUCTIONS) && has(L3_MISSES) {
        derived.push(Derived::MpkiL3);
    }
    derived
}

#[derive(Debug, Default)]
pub struct CounterStore {
    initialized: bool,
    interval_secs: f64,

    /// Counter names in id order plus the name-keyed accumulators: lookups
    /// happen both ways.
    names: Vec<String>,
    events: BTreeMap<String, Accum>,
    derived: Vec<Derived>,

    /// Names and flags of the first sample vector, used to iterate the
    /// total table after the raw state has been reset.
    template: CounterVec,
    last: CounterVec,
    curr: CounterVec,

    warned_disabled: BTreeSet<String>,

    /// Energy wrap-around constants in microjoules, lazily read from
    /// powercap and overridable for tests.
    max_ujoules_pkg: Option<u64>,
    max_ujoules_ram: Option<u64>,
}

impl CounterStore {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn init(&mut self, names: &[String], interval_secs: f64) -> Result<()> {
        if self.initialized {
            bail!("Counter store initialized twice");
        }

        for name in names {
            self.events.insert(name.clone(), Default::default());
        }
        self.derived = derived_for(names);
        for der in &self.derived {
            self.events.insert(der.name().into(), Default::default());
        }
        self.names = names.to_vec();
        self.interval_secs = interval_secs;
        self.initialized = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Clear the raw previous/current state. Names, derived metrics and
    /// accumulated history survive; the next accumulate() seeds afresh.
    pub fn reset(&mut self) {
        self.last = CounterVec::new();
        self.curr = CounterVec::new();
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn derived_names(&self) -> Vec<&'static str> {
        self.derived.iter().map(|d| d.name()).collect()
    }

    pub fn last(&self, name: &str) -> f64 {
        self.events.get(name).map(|a| a.last()).unwrap_or(0.0)
    }

    pub fn sum(&self, name: &str) -> f64 {
        self.events.get(name).map(|a| a.sum()).unwrap_or(0.0)
    }

    pub fn mean(&self, name: &str) -> f64 {
        self.events.get(name).map(|a| a.mean()).unwrap_or(0.0)
    }

    pub fn rolling_mean(&self, name: &str) -> f64 {
        self.events
            .get(name)
            .map(|a| a.rolling_mean())
            .unwrap_or(0.0)
    }

    /// The latest raw reading scaled up for multiplexing over the whole run.
    pub fn current(&self, name: &str) -> Result<f64> {
        let c = match self.curr.iter().find(|c| c.name == name) {
            Some(c) => c,
            None => bail!("Event {:?} is not monitored", name),
        };
        if c.value == 0.0 || c.running == 0 {
            return Ok(0.0);
        }
        Ok(c.value / (c.running as f64 / c.enabled as f64))
    }

    #[cfg(test)]
    pub fn set_energy_wrap(&mut self, pkg_ujoules: u64, ram_ujoules: u64) {
        self.max_ujoules_pkg = Some(pkg_ujoules);
        self.max_ujoules_ram = Some(ram_ujoules);
    }

    fn max_ujoules(&mut self, name: &str) -> Result<u64> {
        if name == ENERGY_PKG {
            if self.max_ujoules_pkg.is_none() {
                self.max_ujoules_pkg = Some(read_max_ujoules_pkg()?);
            }
            Ok(self.max_ujoules_pkg.unwrap())
        } else {
            if self.max_ujoules_ram.is_none() {
                self.max_ujoules_ram = Some(read_max_ujoules_ram()?);
            }
            Ok(self.max_ujoules_ram.unwrap())
        }
    }

    fn push(&mut self, name: &str, value: f64) {
        let value = if value.is_finite() { value } else { 0.0 };
        if let Some(accum) = self.events.get_mut(name) {
            accum.push(value);
        }
    }

    /// Accumulate one sample vector. Pairs each counter with its
    /// predecessor by id, differences cumulative counters, compensates for
    /// PMU multiplexing and recovers energy wrap-arounds.
    pub fn accumulate(&mut self, counters: CounterVec, interval_secs: f64) -> Result<()> {
        if !self.initialized {
            bail!("Counter store used before init");
        }
        if counters.is_empty() {
            bail!("Empty sample vector");
        }

        self.last = std::mem::replace(&mut self.curr, counters);

        if self.last.is_empty() {
            // First vector after init or reset: seed the accumulators.
            for i in 0..self.curr.len() {
                let c = self.curr[i].clone();
                let mut value = if is_energy(&c.name) { 0.0 } else { c.value };
                if c.running > c.enabled {
                    bail!(
                        "Counter {:?} ran longer than it was enabled ({} > {})",
                        c.name,
                        c.running,
                        c.enabled
                    );
                }
                if c.running > 0 {
                    value /= c.running as f64 / c.enabled as f64;
                }
                if !value.is_finite() {
                    value = 0.0;
                }
                self.push(&c.name, value);
            }
            if self.template.is_empty() {
                self.template = self.curr.clone();
            }
        } else {
            if self.curr.len() != self.last.len() {
                bail!(
                    "Sample vector length changed between intervals ({} != {})",
                    self.curr.len(),
                    self.last.len()
                );
            }

            for i in 0..self.curr.len() {
                let c = self.curr[i].clone();
                let l = self.last[i].clone();
                if c.id != l.id || c.name != l.name {
                    bail!("Sample vector order changed ({:?} != {:?})", c.name, l.name);
                }

                let mut value = if c.snapshot { c.value } else { c.value - l.value };

                // Memory-BW counters accumulate bytes-equivalent readings,
                // report the interval difference as MBps.
                if is_mem_bw(&c.name) {
                    value /= interval_secs;
                }

                if value < 0.0 {
                    value = if is_negative_clamped(&c.name) {
                        0.0
                    } else if is_energy(&c.name) {
                        let max_uj = self.max_ujoules(&c.name)? as f64;
                        let newvalue = (c.value * 1e6 + (max_uj - l.value * 1e6)) / 1e6;
                        debug!(
                            "counters: Energy counter {:?} wrapped, interval value {}",
                            c.name, newvalue
                        );
                        newvalue
                    } else {
                        bail!(
                            "Negative interval value ({}) for the counter {:?}",
                            value,
                            c.name
                        );
                    };
                }

                if c.running > c.enabled {
                    bail!(
                        "Counter {:?} ran longer than it was enabled ({} > {})",
                        c.name,
                        c.running,
                        c.enabled
                    );
                }

                if c.enabled == 0 {
                    if self.warned_disabled.insert(c.name.clone()) {
                        warn!(
                            "counters: Counter {:?} was not enabled during this interval",
                            c.name
                        );
                    }
                } else {
                    let enabled_fraction = c.running as f64 / c.enabled as f64;
                    if enabled_fraction < 1.0 {
                        value /= enabled_fraction;
                        debug!(
                            "counters: Counter {:?} scaled by 1/{}",
                            c.name, enabled_fraction
                        );
                    }
                }

                self.push(&c.name, value);

                // Values are cumulative since launch while enabled/running
                // cover one interval; accumulate them so current() scales
                // over the whole run.
                self.curr[i].enabled = c.enabled + l.enabled;
                self.curr[i].running = c.running + l.running;
            }
        }

        for der in self.derived.clone() {
            let value = der.eval_interval(self);
            self.push(der.name(), value);
        }
        Ok(())
    }

    /// Values for one interval row: raw counters in id order followed by
    /// the derived metrics.
    pub fn interval_values(&self) -> Vec<f64> {
        let mut values: Vec<f64> = self.names.iter().map(|n| self.last(n)).collect();
        for der in &self.derived {
            let v = der.eval_interval(self);
            values.push(if v.is_finite() { v } else { 0.0 });
        }
        values
    }

    /// Values for one total row: snapshot counters report their mean,
    /// cumulative ones their sum, memory-BW always the mean.
    pub fn total_values(&self) -> Vec<f64> {
        let mut values: Vec<f64> = self
            .template
            .iter()
            .map(|c| {
                if c.snapshot || is_mem_bw(&c.name) {
                    self.mean(&c.name)
                } else {
                    self.sum(&c.name)
                }
            })
            .collect();
        for der in &self.derived {
            let v = der.eval_total(self);
            values.push(if v.is_finite() { v } else { 0.0 });
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn store(list: &[&str], ti: f64) -> CounterStore {
        let mut store = CounterStore::new();
        store.init(&names(list), ti).unwrap();
        store
    }

    fn sample(id: usize, name: &str, value: f64, snapshot: bool) -> Counter {
        Counter::new(id, name, value, snapshot)
    }

    #[test]
    fn test_rolling_window() {
        let mut accum = Accum::default();
        for v in 0..10 {
            accum.push(v as f64);
        }
        // Window of the last WIN_SIZE values: 3..=9.
        assert_eq!(accum.rolling_mean(), 6.0);
        assert_eq!(accum.mean(), 4.5);
        assert_eq!(accum.last(), 9.0);
        assert_eq!(accum.sum(), 45.0);
    }

    #[test]
    fn test_init_twice_fails() {
        let mut store = store(&[CYCLES], 1.0);
        assert!(store.init(&names(&[CYCLES]), 1.0).is_err());
    }

    #[test]
    fn test_first_sample_seeds_zero_energy() {
        let mut store = store(&[INSTRUCTIONS, ENERGY_PKG], 1.0);
        store
            .accumulate(
                vec![
                    sample(0, INSTRUCTIONS, 1000.0, false),
                    sample(1, ENERGY_PKG, 55.5, false),
                ],
                1.0,
            )
            .unwrap();
        assert_eq!(store.last(INSTRUCTIONS), 1000.0);
        assert_eq!(store.last(ENERGY_PKG), 0.0);
    }

    #[test]
    fn test_cumulative_differencing() {
        let mut store = store(&[INSTRUCTIONS, CYCLES], 1.0);
        for (inst, cycles) in &[(0.0, 0.0), (1000.0, 2000.0), (4000.0, 5000.0)] {
            store
                .accumulate(
                    vec![
                        sample(0, INSTRUCTIONS, *inst, false),
                        sample(1, CYCLES, *cycles, false),
                    ],
                    1.0,
                )
                .unwrap();
        }
        assert_eq!(store.last(INSTRUCTIONS), 3000.0);
        assert_eq!(store.sum(INSTRUCTIONS), 4000.0);
        assert_eq!(store.last("ipc"), 1.0);
        assert_eq!(store.sum(CYCLES), 5000.0);
    }

    #[test]
    fn test_snapshot_passthrough() {
        let mut store = store(&[LLC_OCCUP], 1.0);
        for v in &[10.0, 8.0, 12.0] {
            store
                .accumulate(vec![sample(0, LLC_OCCUP, *v, true)], 1.0)
                .unwrap();
        }
        assert_eq!(store.last(LLC_OCCUP), 12.0);
        // Snapshots report their mean in the total table.
        assert_eq!(store.total_values()[0], 10.0);
    }

    #[test]
    fn test_mem_bw_per_second_and_clamp() {
        let mut store = store(&[MEM_BW_LOCAL], 0.5);
        store
            .accumulate(vec![sample(0, MEM_BW_LOCAL, 100.0, false)], 0.5)
            .unwrap();
        store
            .accumulate(vec![sample(0, MEM_BW_LOCAL, 200.0, false)], 0.5)
            .unwrap();
        assert_eq!(store.last(MEM_BW_LOCAL), 200.0);

        // A monitoring-group restart may rewind the cumulative count.
        store
            .accumulate(vec![sample(0, MEM_BW_LOCAL, 50.0, false)], 0.5)
            .unwrap();
        assert_eq!(store.last(MEM_BW_LOCAL), 0.0);
    }

    #[test]
    fn test_non_monotonic_cumulative_is_fatal() {
        let mut store = store(&[INSTRUCTIONS], 1.0);
        store
            .accumulate(vec![sample(0, INSTRUCTIONS, 1000.0, false)], 1.0)
            .unwrap();
        assert!(store
            .accumulate(vec![sample(0, INSTRUCTIONS, 500.0, false)], 1.0)
            .is_err());
    }

    #[test]
    fn test_energy_wrap() {
        const MAX_UJ: u64 = 262143328000;
        let max_j = MAX_UJ as f64 / 1e6;

        let mut store = store(&[ENERGY_PKG], 1.0);
        store.set_energy_wrap(MAX_UJ, MAX_UJ);

        let readings = [0.1, 0.2, max_j - 0.05, 0.05];
        let expected = [0.0, 0.1, max_j - 0.25, 0.1];
        for (reading, want) in readings.iter().zip(expected.iter()) {
            store
                .accumulate(vec![sample(0, ENERGY_PKG, *reading, false)], 1.0)
                .unwrap();
            assert!(
                (store.last(ENERGY_PKG) - want).abs() < 1e-4,
                "recorded {} expected {}",
                store.last(ENERGY_PKG),
                want
            );
            assert!(store.last(ENERGY_PKG) >= 0.0);
        }
    }

    #[test]
    fn test_multiplex_scaling() {
        let mut store = store(&[INSTRUCTIONS], 1.0);
        store
            .accumulate(vec![sample(0, INSTRUCTIONS, 0.0, false)], 1.0)
            .unwrap();
        let mut c = sample(0, INSTRUCTIONS, 500.0, false);
        c.enabled = 1000;
        c.running = 500;
        store.accumulate(vec![c], 1.0).unwrap();
        assert_eq!(store.last(INSTRUCTIONS), 1000.0);
    }

    #[test]
    fn test_running_above_enabled_is_fatal() {
        let mut store = store(&[INSTRUCTIONS], 1.0);
        let mut c = sample(0, INSTRUCTIONS, 500.0, false);
        c.enabled = 100;
        c.running = 200;
        assert!(store.accumulate(vec![c], 1.0).is_err());
    }

    #[test]
    fn test_disabled_counter_contributes_value() {
        let mut store = store(&[INSTRUCTIONS], 1.0);
        store
            .accumulate(vec![sample(0, INSTRUCTIONS, 100.0, false)], 1.0)
            .unwrap();
        let mut c = sample(0, INSTRUCTIONS, 100.0, false);
        c.enabled = 0;
        c.running = 0;
        store.accumulate(vec![c], 1.0).unwrap();
        assert_eq!(store.last(INSTRUCTIONS), 0.0);
    }

    #[test]
    fn test_reset_then_accumulate_matches_fresh() {
        let mut fresh = store(&[INSTRUCTIONS, CYCLES], 1.0);
        let mut reused = store(&[INSTRUCTIONS, CYCLES], 1.0);

        for (inst, cycles) in &[(100.0, 300.0), (900.0, 1000.0)] {
            reused
                .accumulate(
                    vec![
                        sample(0, INSTRUCTIONS, *inst, false),
                        sample(1, CYCLES, *cycles, false),
                    ],
                    1.0,
                )
                .unwrap();
        }
        reused.reset();

        let vector = || {
            vec![
                sample(0, INSTRUCTIONS, 400.0, false),
                sample(1, CYCLES, 800.0, false),
            ]
        };
        fresh.accumulate(vector(), 1.0).unwrap();
        reused.accumulate(vector(), 1.0).unwrap();
        assert_eq!(fresh.last(INSTRUCTIONS), reused.last(INSTRUCTIONS));
        assert_eq!(fresh.last(CYCLES), reused.last(CYCLES));
    }

    #[test]
    fn test_first_interval_derived_is_finite() {
        let mut store = store(&[INSTRUCTIONS, CYCLES], 1.0);
        store
            .accumulate(
                vec![
                    sample(0, INSTRUCTIONS, 0.0, false),
                    sample(1, CYCLES, 0.0, false),
                ],
                1.0,
            )
            .unwrap();
        // 0/0 maps to 0 rather than NaN.
        assert_eq!(store.last("ipc"), 0.0);
        assert!(store.interval_values().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_disk_bw_total_asymmetry() {
        let mut store = store(&[READ_BYTES, WRITE_BYTES], 2.0);
        for v in &[(0.0, 0.0), ((4 << 20) as f64, (4 << 20) as f64)] {
            store
                .accumulate(
                    vec![
                        sample(0, READ_BYTES, v.0, false),
                        sample(1, WRITE_BYTES, v.1, false),
                    ],
                    2.0,
                )
                .unwrap();
        }
        let derived_at = store.names().len();
        // Interval form: (4M + 4M) / 2s / 1M = 4 MBps.
        assert_eq!(store.interval_values()[derived_at], 4.0);
        // Total form always reports 0.
        assert_eq!(store.total_values()[derived_at], 0.0);
    }

    #[test]
    fn test_current_scales_accumulated_multiplexing() {
        let mut store = store(&[INSTRUCTIONS], 1.0);
        let mut c = sample(0, INSTRUCTIONS, 1000.0, false);
        c.enabled = 1000;
        c.running = 500;
        store.accumulate(vec![c], 1.0).unwrap();
        assert_eq!(store.current(INSTRUCTIONS).unwrap(), 2000.0);
        assert!(store.current("nonexistent").is_err());
    }
}
