use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;

/// Whether perf events and RDT monitoring attach to the workload PIDs or to
/// the CPUs they are pinned on. One mode per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PerfMode {
    #[serde(rename = "PID")]
    Pid,
    #[serde(rename = "CPU")]
    Cpu,
}

impl Default for PerfMode {
    fn default() -> Self {
        Self::Pid
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CmdOptions {
    /// Sampling interval in seconds.
    pub ti: f64,
    /// Maximum number of intervals.
    pub mi: u32,
    /// Perf event groups, one comma-separated list per entry.
    pub event: Vec<String>,
    pub perf: PerfMode,
    #[serde(rename = "cpu-affinity")]
    pub cpu_affinity: Vec<u32>,
}

impl Default for CmdOptions {
    fn default() -> Self {
        Self {
            ti: 1.0,
            mi: std::u32::MAX,
            event: vec!["ref-cycles".into(), "instructions".into()],
            perf: PerfMode::default(),
            cpu_affinity: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosSpec {
    pub num: u32,
    /// Cache-way bitmask the CLOS starts with.
    pub schemata: u64,
    /// Memory bandwidth cap in MBps, unlimited when absent.
    #[serde(default)]
    pub mbps: Option<u64>,
    #[serde(default)]
    pub cpus: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PolicySpec {
    None,
    Test { every: u64 },
}

impl Default for PolicySpec {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskCommon {
    pub cpus: Vec<u32>,
    pub initial_clos: u32,
    pub max_restarts: Option<u32>,
    pub batch: bool,
    /// Literal `{key}` substitutions applied to the command strings.
    pub define: BTreeMap<String, String>,
}

impl TaskCommon {
    pub fn max_restarts(&self) -> u32 {
        self.max_restarts.unwrap_or(std::u32::MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppCmd {
    pub cmd: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Skeleton directories whose contents are copied into the rundir.
    #[serde(default)]
    pub skel: Vec<String>,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSpec {
    #[serde(flatten)]
    pub common: TaskCommon,
    pub app: AppCmd,
    #[serde(default)]
    pub max_instr: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    #[serde(flatten)]
    pub common: TaskCommon,
    pub domain_name: String,
    pub snapshot_name: String,
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: String,
    /// The snapshot lives in a Ceph RBD pool instead of libvirt.
    #[serde(default)]
    pub ceph_vm: bool,

    /// Server-side command arguments, launched on the VM over SSH.
    #[serde(default)]
    pub arguments: String,

    /// Client peer, either a VM on the remote host or a native script there.
    #[serde(default)]
    pub client_native: bool,
    #[serde(default)]
    pub client_domain_name: Option<String>,
    #[serde(default)]
    pub client_domain_ip: Option<String>,
    #[serde(default)]
    pub client_snapshot_name: Option<String>,
    #[serde(default)]
    pub client_cpus: Vec<u32>,
    #[serde(default)]
    pub client_arguments: String,

    #[serde(default)]
    pub netbw_in_avg: u64,
    #[serde(default)]
    pub netbw_in_peak: u64,
    #[serde(default)]
    pub netbw_in_burst: u64,
    #[serde(default)]
    pub netbw_out_avg: u64,
    #[serde(default)]
    pub netbw_out_peak: u64,
    #[serde(default)]
    pub netbw_out_burst: u64,

    #[serde(default)]
    pub disk_total_bytes_sec: u64,
    #[serde(default)]
    pub disk_read_bytes_sec: u64,
    #[serde(default)]
    pub disk_write_bytes_sec: u64,
    #[serde(default)]
    pub disk_total_iops_sec: u64,
    #[serde(default)]
    pub disk_read_iops_sec: u64,
    #[serde(default)]
    pub disk_write_iops_sec: u64,
}

fn default_port() -> String {
    "22".into()
}

impl VmSpec {
    pub fn has_client(&self) -> bool {
        self.client_native || self.client_domain_name.is_some()
    }

    pub fn has_net_throttle(&self) -> bool {
        self.netbw_in_avg > 0 || self.netbw_out_avg > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum TaskSpec {
    #[serde(rename = "app")]
    App(AppSpec),
    #[serde(rename = "VM")]
    Vm(VmSpec),
}

impl TaskSpec {
    pub fn common(&self) -> &TaskCommon {
        match self {
            Self::App(app) => &app.common,
            Self::Vm(vm) => &vm.common,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::App(app) => match &app.app.name {
                Some(name) => name.clone(),
                None => executable_name(&app.app.cmd),
            },
            Self::Vm(vm) => vm.domain_name.clone(),
        }
    }

    fn apply_defines(&mut self) {
        let defines = self.common().define.clone();
        for (key, value) in &defines {
            let pat = format!("{{{}}}", key);
            match self {
                Self::App(app) => app.app.cmd = app.app.cmd.replace(&pat, value),
                Self::Vm(vm) => {
                    vm.arguments = vm.arguments.replace(&pat, value);
                    vm.client_arguments = vm.client_arguments.replace(&pat, value);
                }
            }
        }
    }
}

fn executable_name(cmd: &str) -> String {
    cmd.split_whitespace()
        .next()
        .unwrap_or("")
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cmd: CmdOptions,
    pub clos: Vec<ClosSpec>,
    pub policy: PolicySpec,
    pub tasks: Vec<TaskSpec>,
}

fn merge_values(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                if base_map.contains_key(&key) {
                    merge_values(base_map.get_mut(&key).unwrap(), value);
                } else {
                    base_map.insert(key, value);
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

impl Config {
    pub fn load(path: &str, overlay: &str) -> Result<Config> {
        let body = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config file {:?} ({})", path, &e))?;
        Self::parse(&body, overlay).with_context(|| format!("config file {:?}", path))
    }

    pub fn parse(body: &str, overlay: &str) -> Result<Config> {
        let mut value: serde_yaml::Value = serde_yaml::from_str(body)?;
        if !overlay.is_empty() {
            let overlay_value: serde_yaml::Value = serde_yaml::from_str(overlay)?;
            merge_values(&mut value, overlay_value);
        }

        let mut config: Config = serde_yaml::from_value(value)?;
        for task in config.tasks.iter_mut() {
            task.apply_defines();
        }
        config.verify()?;
        Ok(config)
    }

    fn verify(&self) -> Result<()> {
        if self.tasks.is_empty() {
            bail!("No tasks configured");
        }
        if self.cmd.ti <= 0.0 {
            bail!("Interval time must be positive and greater than 0");
        }
        for clos in &self.clos {
            if clos.cpus.is_empty() {
                bail!("CLOS {} has no assigned CPUs", clos.num);
            }
        }
        for (i, task) in self.tasks.iter().enumerate() {
            if let TaskSpec::App(app) = task {
                if app.app.cmd.trim().is_empty() {
                    bail!("Task {} has an empty command", i);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
cmd:
  ti: 0.5
  mi: 20
  event: ["inst_retired.any,cycles"]
  perf: CPU
clos:
  - num: 1
    schemata: 0xf0
    mbps: 2000
    cpus: [2, 3]
policy:
  kind: test
  every: 2
tasks:
  - kind: app
    app:
      cmd: "/usr/bin/stress-ng --cpu {n}"
    cpus: [2]
    initial_clos: 1
    max_restarts: 3
    define:
      n: "4"
  - kind: VM
    domain_name: xpl_web_1
    snapshot_name: base
    ip: 10.0.0.2
    cpus: [4, 5]
    disk_read_bytes_sec: 1048576
"#;

    #[test]
    fn test_parse() {
        let config = Config::parse(CONFIG, "").unwrap();
        assert_eq!(config.cmd.ti, 0.5);
        assert_eq!(config.cmd.mi, 20);
        assert_eq!(config.cmd.perf, PerfMode::Cpu);
        assert_eq!(config.clos[0].schemata, 0xf0);
        assert_eq!(config.tasks.len(), 2);

        match &config.tasks[0] {
            TaskSpec::App(app) => {
                assert_eq!(app.app.cmd, "/usr/bin/stress-ng --cpu 4");
                assert_eq!(app.common.max_restarts(), 3);
                assert_eq!(config.tasks[0].name(), "stress-ng");
            }
            _ => panic!("expected an app task"),
        }
        match &config.tasks[1] {
            TaskSpec::Vm(vm) => {
                assert_eq!(vm.port, "22");
                assert_eq!(vm.disk_read_bytes_sec, 1 << 20);
                assert!(!vm.has_client());
                assert_eq!(vm.common.max_restarts(), std::u32::MAX);
            }
            _ => panic!("expected a VM task"),
        }
    }

    #[test]
    fn test_override() {
        let config = Config::parse(CONFIG, "cmd: {ti: 2.0, perf: PID}").unwrap();
        assert_eq!(config.cmd.ti, 2.0);
        assert_eq!(config.cmd.perf, PerfMode::Pid);
        // Untouched sections survive the merge.
        assert_eq!(config.cmd.mi, 20);
        assert_eq!(config.tasks.len(), 2);
    }

    #[test]
    fn test_verify() {
        assert!(Config::parse("tasks: []", "").is_err());
        let no_cpus = "
clos: [{num: 1, schemata: 0xf}]
tasks: [{kind: app, app: {cmd: /bin/true}}]";
        assert!(Config::parse(no_cpus, "").is_err());
    }
}
