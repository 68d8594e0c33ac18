// Copyright (c) copart.
//
// Per-CPU utilization from /proc/stat and core temperatures from hwmon.
use anyhow::{anyhow, Result};
use std::path::PathBuf;

pub const NUM_CPU_STATES: usize = 10;

pub const TIME_CATEGORIES: [&str; NUM_CPU_STATES] = [
    "user",
    "nice",
    "system",
    "idle",
    "iowait",
    "irq",
    "softirq",
    "steal",
    "guest",
    "guest_nice",
];

const S_IDLE: usize = 3;
const S_IOWAIT: usize = 4;

/// One /proc/stat cpu line, all ten jiffy slots.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuData {
    pub times: [u64; NUM_CPU_STATES],
}

impl CpuData {
    fn total(&self) -> u64 {
        self.times.iter().sum()
    }

    fn idle(&self) -> u64 {
        self.times[S_IDLE] + self.times[S_IOWAIT]
    }

    fn active(&self) -> u64 {
        self.total() - self.idle()
    }
}

/// Snapshot of every logical CPU, indexed by CPU number.
pub fn read_cpu_stats() -> Result<Vec<CpuData>> {
    let kstat = procfs::KernelStats::new()
        .map_err(|e| anyhow!("Failed to read /proc/stat ({})", &e))?;

    Ok(kstat
        .cpu_time
        .iter()
        .map(|cpu| CpuData {
            times: [
                cpu.user,
                cpu.nice,
                cpu.system,
                cpu.idle,
                cpu.iowait.unwrap_or(0),
                cpu.irq.unwrap_or(0),
                cpu.softirq.unwrap_or(0),
                cpu.steal.unwrap_or(0),
                cpu.guest.unwrap_or(0),
                cpu.guest_nice.unwrap_or(0),
            ],
        })
        .collect())
}

/// Percent of non-idle time on one CPU between two snapshots. Returns -1
/// when the CPU is not present in either snapshot.
pub fn cpu_utilization(then: &[CpuData], now: &[CpuData], cpu: usize) -> f64 {
    if cpu >= then.len() || cpu >= now.len() {
        return -1.0;
    }
    let active = (now[cpu].active() - then[cpu].active()) as f64;
    let idle = (now[cpu].idle() - then[cpu].idle()) as f64;
    let total = active + idle;
    if total == 0.0 {
        return 0.0;
    }
    100.0 * active / total
}

/// Jiffies spent in one time category on one CPU between two snapshots.
pub fn time_utilization(then: &[CpuData], now: &[CpuData], cpu: usize, category: usize) -> f64 {
    if cpu >= then.len() || cpu >= now.len() || category >= NUM_CPU_STATES {
        return -1.0;
    }
    (now[cpu].times[category] - then[cpu].times[category]) as f64
}

/// Logical-core to hwmon-sensor mapping. The default table matches the
/// dual-socket 48-CPU host this controller was built for; other SKUs inject
/// their own table.
#[derive(Debug, Clone)]
pub struct CoreTempMap {
    hwmon_base: PathBuf,
    /// temp<N>_input index per core-within-socket.
    sensor_ids: Vec<u32>,
}

impl Default for CoreTempMap {
    fn default() -> Self {
        Self {
            hwmon_base: "/sys/class/hwmon".into(),
            sensor_ids: vec![2, 3, 4, 5, 6, 7, 10, 11, 12, 13, 14, 15],
        }
    }
}

impl CoreTempMap {
    pub fn with_table(hwmon_base: PathBuf, sensor_ids: Vec<u32>) -> Self {
        Self {
            hwmon_base,
            sensor_ids,
        }
    }

    fn node_of(core: u32) -> u32 {
        if (core <= 11) || (24..=35).contains(&core) {
            0
        } else {
            1
        }
    }

    fn sensor_of(&self, core: u32) -> u32 {
        match self.sensor_ids.get(core as usize % self.sensor_ids.len()) {
            Some(id) if (core as usize) < 4 * self.sensor_ids.len() => *id,
            _ => 1,
        }
    }

    /// Core temperature in degrees Celsius.
    pub fn read(&self, core: u32) -> Result<f64> {
        let path = self.hwmon_base.join(format!(
            "hwmon{}/temp{}_input",
            Self::node_of(core),
            self.sensor_of(core)
        ));
        let milli: f64 = copart_util::read_one_line(&path)?.trim().parse()?;
        Ok(milli / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn cpu(times: [u64; NUM_CPU_STATES]) -> CpuData {
        CpuData { times }
    }

    #[test]
    fn test_cpu_utilization() {
        let then = vec![cpu([100, 0, 50, 800, 50, 0, 0, 0, 0, 0])];
        let now = vec![cpu([160, 0, 70, 860, 60, 0, 0, 0, 10, 0])];

        // 90 active vs 70 idle jiffies.
        let util = cpu_utilization(&then, &now, 0);
        assert!((util - 100.0 * 90.0 / 160.0).abs() < 1e-9);
        assert_eq!(cpu_utilization(&then, &now, 5), -1.0);
    }

    #[test]
    fn test_active_idle_deltas_cover_wallclock() {
        let then = vec![cpu([100, 0, 50, 800, 50, 0, 0, 0, 0, 0])];
        let now = vec![cpu([160, 0, 70, 860, 60, 0, 0, 0, 10, 0])];

        let active = now[0].active() - then[0].active();
        let idle = now[0].idle() - then[0].idle();
        assert_eq!(active + idle, now[0].total() - then[0].total());
    }

    #[test]
    fn test_time_utilization_returns_raw_delta() {
        let then = vec![cpu([100, 0, 0, 0, 0, 0, 0, 0, 0, 0])];
        let now = vec![cpu([130, 0, 0, 0, 0, 0, 0, 0, 0, 0])];
        assert_eq!(time_utilization(&then, &now, 0, 0), 30.0);
        assert_eq!(time_utilization(&then, &now, 0, 99), -1.0);
    }

    #[test]
    fn test_core_temp_mapping() {
        let map = CoreTempMap::default();
        // Cores 0-11 and their SMT siblings 24-35 live on node 0.
        assert_eq!(CoreTempMap::node_of(0), 0);
        assert_eq!(CoreTempMap::node_of(30), 0);
        assert_eq!(CoreTempMap::node_of(12), 1);
        assert_eq!(CoreTempMap::node_of(47), 1);
        // coretemp skips sensor ids 8 and 9.
        assert_eq!(map.sensor_of(5), 7);
        assert_eq!(map.sensor_of(6), 10);
        assert_eq!(map.sensor_of(11), 15);
        assert_eq!(map.sensor_of(24), 2);
        // Out-of-table cores fall back to the package sensor.
        assert_eq!(map.sensor_of(48), 1);
    }

    #[test]
    fn test_read_temperature() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("hwmon0")).unwrap();
        fs::write(tmp.path().join("hwmon0/temp2_input"), "45000\n").unwrap();

        let map = CoreTempMap::with_table(
            tmp.path().into(),
            vec![2, 3, 4, 5, 6, 7, 10, 11, 12, 13, 14, 15],
        );
        assert_eq!(map.read(0).unwrap(), 45.0);
    }
}
