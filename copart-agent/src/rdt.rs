// Copyright (c) copart.
//
// Intel RDT allocation and monitoring through the resctrl filesystem. CLOS
// n maps to the control group COS<n> under the resctrl root (CLOS 0 is the
// root group itself); monitoring streams get their own mon_groups entries
// whose slot indices are pooled and reused.
use anyhow::{anyhow, bail, Result};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const RESCTRL_ROOT: &str = "/sys/fs/resctrl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdpScope {
    Both,
    Code,
    Data,
}

/// One monitoring read: LLC occupancy plus cumulative local/total memory
/// traffic, all in MB. rmem is derived at read time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RdtValues {
    pub llc_mb: f64,
    pub lmem_mb: f64,
    pub tmem_mb: f64,
    pub rmem_mb: f64,
}

fn parse_cpu_list(body: &str) -> Vec<u32> {
    let mut cpus = vec![];
    for tok in body.trim().split(',').filter(|t| !t.is_empty()) {
        match tok.find('-') {
            Some(_) => {
                let mut bounds = tok.splitn(2, '-');
                let lo: u32 = bounds.next().unwrap_or("").parse().unwrap_or(0);
                let hi: u32 = bounds.next().unwrap_or("").parse().unwrap_or(0);
                for cpu in lo..=hi {
                    cpus.push(cpu);
                }
            }
            None => {
                if let Ok(cpu) = tok.parse() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}

fn format_cpu_list(cpus: &[u32]) -> String {
    cpus.iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// `schemata` content as resource -> socket -> value.
type Schemata = BTreeMap<String, BTreeMap<u32, u64>>;

fn parse_schemata(body: &str) -> Schemata {
    let mut schemata = Schemata::new();
    for line in body.lines() {
        let line = line.trim();
        let mut split = line.splitn(2, ':');
        let resource = match split.next() {
            Some(v) if !v.is_empty() => v.trim().to_string(),
            _ => continue,
        };
        let rest = match split.next() {
            Some(v) => v,
            None => continue,
        };

        // MB values are decimal, cache masks hexadecimal.
        let decimal = resource.starts_with("MB");
        let entry = schemata.entry(resource).or_default();
        for tok in rest.split(';') {
            let mut kv = tok.splitn(2, '=');
            let socket = kv.next().and_then(|v| v.trim().parse().ok());
            let value = kv.next().and_then(|v| {
                let v = v.trim();
                if decimal {
                    v.parse().ok()
                } else {
                    u64::from_str_radix(v, 16).ok()
                }
            });
            if let (Some(socket), Some(value)) = (socket, value) {
                entry.insert(socket, value);
            }
        }
    }
    schemata
}

#[derive(Debug, Default)]
struct MonSlots {
    next: u32,
    free: Vec<u32>,
}

impl MonSlots {
    fn take(&mut self) -> u32 {
        match self.free.pop() {
            Some(slot) => slot,
            None => {
                let slot = self.next;
                self.next += 1;
                slot
            }
        }
    }

    fn put(&mut self, slot: u32) {
        self.free.push(slot);
    }
}

#[derive(Debug)]
pub struct Rdt {
    root: PathBuf,
    initialized: bool,
    cdp: bool,
    mba: bool,
    num_closids: u32,
    cbm_mask: u64,
    sockets: Vec<u32>,
    /// MB values of the root group at init time, restored on reset.
    mb_defaults: BTreeMap<u32, u64>,

    slots: MonSlots,
    pid_groups: BTreeMap<i32, u32>,
    core_groups: BTreeMap<u32, u32>,
}

impl Rdt {
    pub fn new() -> Rdt {
        Self::new_at(RESCTRL_ROOT)
    }

    pub fn new_at<P: AsRef<Path>>(root: P) -> Rdt {
        Rdt {
            root: root.as_ref().into(),
            initialized: false,
            cdp: false,
            mba: false,
            num_closids: 0,
            cbm_mask: 0,
            sockets: vec![],
            mb_defaults: BTreeMap::new(),
            slots: MonSlots::default(),
            pid_groups: BTreeMap::new(),
            core_groups: BTreeMap::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn max_closids(&self) -> u32 {
        self.num_closids
    }

    pub fn sockets(&self) -> &[u32] {
        &self.sockets
    }

    fn alloc_resources(&self, scope: CdpScope) -> Vec<&'static str> {
        if !self.cdp {
            return vec!["L3"];
        }
        match scope {
            CdpScope::Both => vec!["L3CODE", "L3DATA"],
            CdpScope::Code => vec!["L3CODE"],
            CdpScope::Data => vec!["L3DATA"],
        }
    }

    fn clos_dir(&self, clos: u32) -> PathBuf {
        if clos == 0 {
            self.root.clone()
        } else {
            self.root.join(format!("COS{}", clos))
        }
    }

    fn ensure_clos_dir(&self, clos: u32) -> Result<PathBuf> {
        if clos >= self.num_closids {
            bail!("CLOS {} out of range (max {})", clos, self.num_closids);
        }
        let dir = self.clos_dir(clos);
        if !dir.exists() {
            fs::create_dir(&dir)
                .map_err(|e| anyhow!("Failed to create CLOS dir {:?} ({})", &dir, &e))?;
        }
        Ok(dir)
    }

    pub fn init(&mut self) -> Result<()> {
        let info = self.root.join("info");
        if !info.exists() {
            bail!(
                "resctrl filesystem not mounted at {:?}, mount it with \
                 \"mount -t resctrl resctrl {:?}\"",
                &self.root,
                &self.root
            );
        }

        self.cdp = info.join("L3CODE").exists();
        self.mba = info.join("MB").exists();
        let l3_info = if self.cdp {
            info.join("L3CODE")
        } else {
            info.join("L3")
        };
        self.cbm_mask =
            u64::from_str_radix(copart_util::read_one_line(l3_info.join("cbm_mask"))?.trim(), 16)?;
        self.num_closids = copart_util::read_one_line(l3_info.join("num_closids"))?
            .trim()
            .parse()?;

        let schemata = parse_schemata(&fs::read_to_string(self.root.join("schemata"))?);
        let l3_key = if self.cdp { "L3CODE" } else { "L3" };
        self.sockets = schemata
            .get(l3_key)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();
        if self.sockets.is_empty() {
            bail!("No L3 domains found in {:?}", self.root.join("schemata"));
        }
        if let Some(mb) = schemata.get("MB") {
            self.mb_defaults = mb.clone();
        }

        self.initialized = true;
        info!(
            "rdt: Initialized with {} CLOSids, cbm 0x{:x}, sockets {:?}, cdp {}, mba {}",
            self.num_closids, self.cbm_mask, self.sockets, self.cdp, self.mba
        );
        self.reset()
    }

    /// Restore default allocation and drop every control and monitoring
    /// group this controller may have left behind.
    pub fn reset(&mut self) -> Result<()> {
        let full_mask = self.cbm_mask;
        let sockets = self.sockets.clone();
        let mb_defaults = self.mb_defaults.clone();

        for entry in fs::read_dir(&self.root)?.filter_map(|x| x.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("COS") && entry.path().is_dir() {
                if let Err(e) = fs::remove_dir(entry.path()) {
                    warn!("rdt: Failed to remove group {:?} ({})", name, &e);
                }
            }
        }

        let mon_groups = self.root.join("mon_groups");
        if mon_groups.exists() {
            for entry in fs::read_dir(&mon_groups)?.filter_map(|x| x.ok()) {
                if entry.path().is_dir() {
                    if let Err(e) = fs::remove_dir(entry.path()) {
                        warn!(
                            "rdt: Failed to remove monitoring group {:?} ({})",
                            entry.path(),
                            &e
                        );
                    }
                }
            }
        }

        for socket in &sockets {
            for resource in self.alloc_resources(CdpScope::Both) {
                self.write_schemata_line(0, resource, *socket, full_mask)?;
            }
            if self.mba {
                if let Some(mb) = mb_defaults.get(socket) {
                    self.write_schemata_line(0, "MB", *socket, *mb)?;
                }
            }
        }

        self.slots = MonSlots::default();
        self.pid_groups.clear();
        self.core_groups.clear();
        Ok(())
    }

    pub fn fini(&mut self) {
        self.initialized = false;
    }

    fn write_schemata_line(
        &self,
        clos: u32,
        resource: &str,
        socket: u32,
        value: u64,
    ) -> Result<()> {
        let path = self.clos_dir(clos).join("schemata");

        // Read-modify-write so sibling resource lines survive on plain
        // filesystems as well as on resctrl itself.
        let mut schemata = parse_schemata(&fs::read_to_string(&path).unwrap_or_default());
        schemata
            .entry(resource.to_string())
            .or_default()
            .insert(socket, value);

        let mut body = String::new();
        for (resource, per_socket) in &schemata {
            let line = per_socket
                .iter()
                .map(|(s, v)| {
                    if resource == "MB" {
                        format!("{}={}", s, v)
                    } else {
                        format!("{}={:x}", s, v)
                    }
                })
                .collect::<Vec<_>>()
                .join(";");
            body.push_str(&format!("{}:{}\n", resource, line));
        }

        fs::write(&path, body)
            .map_err(|e| anyhow!("Failed to write schemata {:?} ({})", &path, &e))?;
        Ok(())
    }

    fn read_schemata(&self, clos: u32) -> Result<Schemata> {
        let path = self.clos_dir(clos).join("schemata");
        Ok(parse_schemata(&fs::read_to_string(&path)?))
    }

    pub fn set_cbm(&mut self, clos: u32, socket: u32, mask: u64, scope: CdpScope) -> Result<()> {
        if mask == 0 || mask & !self.cbm_mask != 0 {
            bail!(
                "Invalid cache mask 0x{:x} for CLOS {} (valid bits 0x{:x})",
                mask,
                clos,
                self.cbm_mask
            );
        }
        let shifted = mask >> mask.trailing_zeros();
        if shifted & (shifted + 1) != 0 {
            bail!("Cache mask 0x{:x} is not contiguous", mask);
        }

        self.ensure_clos_dir(clos)?;
        for resource in self.alloc_resources(scope) {
            self.write_schemata_line(clos, resource, socket, mask)?;
        }
        debug!(
            "rdt: CLOS {} socket {} cbm set to 0x{:x} ({:?})",
            clos, socket, mask, scope
        );
        Ok(())
    }

    pub fn get_cbm(&self, clos: u32, socket: u32, scope: CdpScope) -> Result<u64> {
        let resource = match scope {
            _ if !self.cdp => "L3",
            CdpScope::Both | CdpScope::Code => "L3CODE",
            CdpScope::Data => "L3DATA",
        };
        self.read_schemata(clos)?
            .get(resource)
            .and_then(|m| m.get(&socket).copied())
            .ok_or_else(|| anyhow!("No {} entry for CLOS {} socket {}", resource, clos, socket))
    }

    /// Cap memory bandwidth for one CLOS on one socket. With the
    /// software controller (mba_MBps mount option) the value is MBps,
    /// otherwise it is the hardware percentage.
    pub fn set_mba(&mut self, clos: u32, socket: u32, mb: u64, _ctrl: bool) -> Result<()> {
        if !self.mba {
            bail!("MBA is not available on this host");
        }
        self.ensure_clos_dir(clos)?;
        self.write_schemata_line(clos, "MB", socket, mb)?;
        debug!("rdt: CLOS {} socket {} MB cap set to {}", clos, socket, mb);
        Ok(())
    }

    pub fn get_mba(&self, clos: u32, socket: u32) -> Result<u64> {
        self.read_schemata(clos)?
            .get("MB")
            .and_then(|m| m.get(&socket).copied())
            .ok_or_else(|| anyhow!("No MB entry for CLOS {} socket {}", clos, socket))
    }

    fn write_tasks_file(path: &Path, pid: i32) -> Result<()> {
        let mut f = fs::OpenOptions::new().write(true).create(true).open(path)?;
        f.write_all(format!("{}\n", pid).as_bytes())
            .map_err(|e| anyhow!("Failed to add pid {} to {:?} ({})", pid, path, &e))?;
        Ok(())
    }

    pub fn assign_pid(&mut self, clos: u32, pid: i32) -> Result<()> {
        let dir = self.ensure_clos_dir(clos)?;
        Self::write_tasks_file(&dir.join("tasks"), pid)?;
        info!("rdt: Pid {} assigned to CLOS {}", pid, clos);
        Ok(())
    }

    pub fn assign_cpu(&mut self, clos: u32, cpu: u32) -> Result<()> {
        let dir = self.ensure_clos_dir(clos)?;
        let path = dir.join("cpus_list");
        let mut cpus = parse_cpu_list(&fs::read_to_string(&path).unwrap_or_default());
        if !cpus.contains(&cpu) {
            cpus.push(cpu);
            cpus.sort_unstable();
        }
        fs::write(&path, format!("{}\n", format_cpu_list(&cpus)))
            .map_err(|e| anyhow!("Failed to write {:?} ({})", &path, &e))?;
        info!("rdt: Cpu {} assigned to CLOS {}", cpu, clos);
        Ok(())
    }

    pub fn clos_of_pid(&self, pid: i32) -> Result<u32> {
        for clos in 1..self.num_closids {
            let path = self.clos_dir(clos).join("tasks");
            if let Ok(body) = fs::read_to_string(&path) {
                if body
                    .lines()
                    .any(|l| l.trim().parse::<i32>() == Ok(pid))
                {
                    return Ok(clos);
                }
            }
        }
        Ok(0)
    }

    pub fn clos_of_cpu(&self, cpu: u32) -> Result<u32> {
        for clos in 1..self.num_closids {
            let path = self.clos_dir(clos).join("cpus_list");
            if let Ok(body) = fs::read_to_string(&path) {
                if parse_cpu_list(&body).contains(&cpu) {
                    return Ok(clos);
                }
            }
        }
        Ok(0)
    }

    fn mon_dir(&self, slot: u32) -> PathBuf {
        self.root.join("mon_groups").join(format!("mon{}", slot))
    }

    fn mon_create(&mut self) -> Result<(u32, PathBuf)> {
        let slot = self.slots.take();
        let dir = self.mon_dir(slot);
        if let Err(e) = fs::create_dir_all(&dir) {
            self.slots.put(slot);
            bail!("Failed to create monitoring group {:?} ({})", &dir, &e);
        }
        Ok((slot, dir))
    }

    pub fn monitor_start_pid(&mut self, pid: i32) -> Result<()> {
        if self.pid_groups.contains_key(&pid) {
            bail!("Pid {} is already monitored", pid);
        }
        let (slot, dir) = self.mon_create()?;
        if let Err(e) = Self::write_tasks_file(&dir.join("tasks"), pid) {
            self.slots.put(slot);
            return Err(e);
        }
        self.pid_groups.insert(pid, slot);
        debug!("rdt: Monitoring pid {} in slot {}", pid, slot);
        Ok(())
    }

    pub fn monitor_start_core(&mut self, cpu: u32) -> Result<()> {
        if self.core_groups.contains_key(&cpu) {
            bail!("Core {} is already monitored", cpu);
        }
        let (slot, dir) = self.mon_create()?;
        let path = dir.join("cpus_list");
        if let Err(e) = fs::write(&path, format!("{}\n", cpu)) {
            self.slots.put(slot);
            bail!("Failed to write {:?} ({})", &path, &e);
        }
        self.core_groups.insert(cpu, slot);
        debug!("rdt: Monitoring core {} in slot {}", cpu, slot);
        Ok(())
    }

    fn monitor_stop_slot(&mut self, slot: u32) {
        let dir = self.mon_dir(slot);
        if let Err(e) = fs::remove_dir(&dir) {
            warn!("rdt: Failed to remove monitoring group {:?} ({})", &dir, &e);
        }
        self.slots.put(slot);
    }

    /// Stop errors are logged, not raised: the group may already be gone
    /// along with its workload.
    pub fn monitor_stop_pid(&mut self, pid: i32) {
        match self.pid_groups.remove(&pid) {
            Some(slot) => self.monitor_stop_slot(slot),
            None => warn!("rdt: Pid {} was not monitored", pid),
        }
    }

    pub fn monitor_stop_core(&mut self, cpu: u32) {
        match self.core_groups.remove(&cpu) {
            Some(slot) => self.monitor_stop_slot(slot),
            None => warn!("rdt: Core {} was not monitored", cpu),
        }
    }

    fn read_mon_file(path: &Path) -> u64 {
        // Counters read "Unavailable" while the RMID is in limbo; that
        // contributes nothing.
        match fs::read_to_string(path) {
            Ok(body) => body.trim().parse().unwrap_or(0),
            Err(_) => 0,
        }
    }

    fn read_slot(&self, slot: u32) -> Result<RdtValues> {
        let mon_data = self.mon_dir(slot).join("mon_data");
        let mut llc = 0u64;
        let mut lmem = 0u64;
        let mut tmem = 0u64;

        for entry in fs::read_dir(&mon_data)
            .map_err(|e| anyhow!("Failed to read {:?} ({})", &mon_data, &e))?
            .filter_map(|x| x.ok())
        {
            if !entry
                .file_name()
                .to_string_lossy()
                .starts_with("mon_L3_")
            {
                continue;
            }
            llc += Self::read_mon_file(&entry.path().join("llc_occupancy"));
            lmem += Self::read_mon_file(&entry.path().join("mbm_local_bytes"));
            tmem += Self::read_mon_file(&entry.path().join("mbm_total_bytes"));
        }

        let to_mb = |v: u64| v as f64 / (1 << 20) as f64;
        let values = RdtValues {
            llc_mb: to_mb(llc),
            lmem_mb: to_mb(lmem),
            tmem_mb: to_mb(tmem),
            rmem_mb: (to_mb(tmem) - to_mb(lmem)).max(0.0),
        };
        Ok(values)
    }

    pub fn read_pid(&self, pid: i32) -> Result<RdtValues> {
        let slot = self
            .pid_groups
            .get(&pid)
            .ok_or_else(|| anyhow!("Pid {} is not monitored", pid))?;
        self.read_slot(*slot)
    }

    pub fn read_core(&self, cpu: u32) -> Result<RdtValues> {
        let slot = self
            .core_groups
            .get(&cpu)
            .ok_or_else(|| anyhow!("Core {} is not monitored", cpu))?;
        self.read_slot(*slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_resctrl() -> (tempfile::TempDir, Rdt) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("info/L3")).unwrap();
        fs::create_dir_all(root.join("info/MB")).unwrap();
        fs::create_dir_all(root.join("mon_groups")).unwrap();
        fs::write(root.join("info/L3/cbm_mask"), "fffff\n").unwrap();
        fs::write(root.join("info/L3/num_closids"), "16\n").unwrap();
        fs::write(root.join("schemata"), "L3:0=fffff;1=fffff\nMB:0=2048;1=2048\n").unwrap();
        fs::write(root.join("cpus_list"), "0-47\n").unwrap();

        let mut rdt = Rdt::new_at(root);
        rdt.init().unwrap();
        (tmp, rdt)
    }

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3,5"), vec![0, 1, 2, 3, 5]);
        assert_eq!(parse_cpu_list("7"), vec![7]);
        assert_eq!(parse_cpu_list(""), Vec::<u32>::new());
        assert_eq!(format_cpu_list(&[0, 1, 5]), "0,1,5");
    }

    #[test]
    fn test_parse_schemata() {
        let schemata = parse_schemata("L3:0=fffff;1=00fff\nMB:0=2048\n");
        assert_eq!(schemata["L3"][&0], 0xfffff);
        assert_eq!(schemata["L3"][&1], 0xfff);
        assert_eq!(schemata["MB"][&0], 2048);
    }

    #[test]
    fn test_init_discovers_topology() {
        let (_tmp, rdt) = fake_resctrl();
        assert_eq!(rdt.max_closids(), 16);
        assert_eq!(rdt.sockets(), &[0, 1]);
        assert!(rdt.is_initialized());
    }

    #[test]
    fn test_cbm_round_trip() {
        let (_tmp, mut rdt) = fake_resctrl();
        rdt.set_cbm(1, 0, 0x3, CdpScope::Both).unwrap();
        assert_eq!(rdt.get_cbm(1, 0, CdpScope::Both).unwrap(), 0x3);

        // Sibling socket and the MB line survive a cbm update.
        rdt.set_mba(1, 0, 2000, true).unwrap();
        rdt.set_cbm(1, 0, 0xf, CdpScope::Both).unwrap();
        assert_eq!(rdt.get_mba(1, 0).unwrap(), 2000);
        assert_eq!(rdt.get_cbm(1, 0, CdpScope::Both).unwrap(), 0xf);
    }

    #[test]
    fn test_invalid_masks_rejected() {
        let (_tmp, mut rdt) = fake_resctrl();
        assert!(rdt.set_cbm(1, 0, 0, CdpScope::Both).is_err());
        assert!(rdt.set_cbm(1, 0, 0x5, CdpScope::Both).is_err());
        assert!(rdt.set_cbm(1, 0, 0x100000, CdpScope::Both).is_err());
        assert!(rdt.set_cbm(99, 0, 0x3, CdpScope::Both).is_err());
    }

    #[test]
    fn test_assignment() {
        let (_tmp, mut rdt) = fake_resctrl();
        rdt.set_cbm(2, 0, 0xf, CdpScope::Both).unwrap();
        rdt.assign_pid(2, 1234).unwrap();
        rdt.assign_cpu(2, 7).unwrap();
        assert_eq!(rdt.clos_of_pid(1234).unwrap(), 2);
        assert_eq!(rdt.clos_of_cpu(7).unwrap(), 2);
        assert_eq!(rdt.clos_of_pid(999).unwrap(), 0);
    }

    #[test]
    fn test_monitor_slot_reuse() {
        let (_tmp, mut rdt) = fake_resctrl();
        rdt.monitor_start_pid(100).unwrap();
        rdt.monitor_start_pid(200).unwrap();
        assert_eq!(rdt.pid_groups[&100], 0);
        assert_eq!(rdt.pid_groups[&200], 1);

        // A freed slot is the next one handed out.
        rdt.monitor_stop_pid(100);
        rdt.monitor_start_pid(300).unwrap();
        assert_eq!(rdt.pid_groups[&300], 0);

        // One group per pid at a time.
        assert!(rdt.monitor_start_pid(200).is_err());
    }

    #[test]
    fn test_monitor_read() {
        let (tmp, mut rdt) = fake_resctrl();
        rdt.monitor_start_pid(100).unwrap();

        let mon = tmp.path().join("mon_groups/mon0/mon_data/mon_L3_00");
        fs::create_dir_all(&mon).unwrap();
        fs::write(mon.join("llc_occupancy"), format!("{}\n", 4 << 20)).unwrap();
        fs::write(mon.join("mbm_local_bytes"), format!("{}\n", 1 << 20)).unwrap();
        fs::write(mon.join("mbm_total_bytes"), format!("{}\n", 3 << 20)).unwrap();

        let values = rdt.read_pid(100).unwrap();
        assert_eq!(values.llc_mb, 4.0);
        assert_eq!(values.lmem_mb, 1.0);
        assert_eq!(values.tmem_mb, 3.0);
        assert_eq!(values.rmem_mb, 2.0);

        // Unavailable counters contribute zero.
        fs::write(mon.join("mbm_total_bytes"), "Unavailable\n").unwrap();
        let values = rdt.read_pid(100).unwrap();
        assert_eq!(values.tmem_mb, 0.0);
        assert_eq!(values.rmem_mb, 0.0);
    }
}
