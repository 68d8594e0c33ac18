// Copyright (c) copart.
//
// Partitioning policies. The supervisor hands every policy the run list
// and the resource controller once per interval; policies read counter
// stores but never reset them.
use anyhow::Result;
use copart_agent_intf::{PerfMode, PolicySpec};
use log::info;

use super::rdt::{CdpScope, Rdt};
use super::workload::Workload;

pub trait Policy {
    fn name(&self) -> &'static str;

    fn apply(
        &mut self,
        interval: u64,
        target_interval_secs: f64,
        actual_interval_secs: f64,
        run_list: &[&Workload],
        rdt: &mut Rdt,
        mode: PerfMode,
    ) -> Result<()>;
}

pub fn policy_from_spec(spec: &PolicySpec) -> Box<dyn Policy> {
    match spec {
        PolicySpec::None => Box::new(NonePolicy),
        PolicySpec::Test { every } => Box::new(TestPolicy { every: (*every).max(1) }),
    }
}

/// Monitoring without reshaping anything.
pub struct NonePolicy;

impl Policy for NonePolicy {
    fn name(&self) -> &'static str {
        "none"
    }

    fn apply(
        &mut self,
        _interval: u64,
        _target_interval_secs: f64,
        _actual_interval_secs: f64,
        _run_list: &[&Workload],
        _rdt: &mut Rdt,
        _mode: PerfMode,
    ) -> Result<()> {
        Ok(())
    }
}

/// Exercises the whole allocation contract: on intervals 2..=6 it moves
/// every workload into the CLOS numbered like the interval, prints the
/// masks and caps it finds, and mutates them.
pub struct TestPolicy {
    pub every: u64,
}

impl Policy for TestPolicy {
    fn name(&self) -> &'static str {
        "test"
    }

    fn apply(
        &mut self,
        interval: u64,
        _target_interval_secs: f64,
        _actual_interval_secs: f64,
        run_list: &[&Workload],
        rdt: &mut Rdt,
        mode: PerfMode,
    ) -> Result<()> {
        if interval % self.every != 0 {
            return Ok(());
        }
        info!("policy: Applying test policy at interval {}", interval);

        for workload in run_list {
            for (_i, cpu, pid) in workload.pairs() {
                info!(
                    "policy: Task {}: id {}, pid {}",
                    workload.core.name, workload.core.id, pid
                );

                if interval > 1 && interval < 7 {
                    let clos = interval as u32;

                    match mode {
                        PerfMode::Pid => rdt.assign_pid(clos, pid)?,
                        PerfMode::Cpu => rdt.assign_cpu(clos, cpu)?,
                    }
                    let assigned = match mode {
                        PerfMode::Pid => rdt.clos_of_pid(pid)?,
                        PerfMode::Cpu => rdt.clos_of_cpu(cpu)?,
                    };
                    info!("policy: Pid {} now in CLOS {}", pid, assigned);

                    let mask = rdt.get_cbm(assigned, 0, CdpScope::Data)?;
                    info!("policy: CLOS {} has data mask 0x{:x}", assigned, mask);
                    let mask = rdt.get_cbm(assigned, 0, CdpScope::Code)?;
                    info!("policy: CLOS {} has code mask 0x{:x}", assigned, mask);

                    rdt.set_cbm(assigned, 0, 0x3, CdpScope::Code)?;
                    rdt.set_cbm(assigned, 0, 0xf, CdpScope::Data)?;
                    info!(
                        "policy: CLOS {} now has code mask 0x{:x} and data mask 0x{:x}",
                        assigned,
                        rdt.get_cbm(assigned, 0, CdpScope::Code)?,
                        rdt.get_cbm(assigned, 0, CdpScope::Data)?
                    );

                    let mb = rdt.get_mba(assigned, 0).unwrap_or(0);
                    info!("policy: Current MB cap is {} MBps", mb);
                    rdt.set_mba(assigned, 0, 2000 * assigned as u64, true)?;
                    info!(
                        "policy: New MB cap is {} MBps",
                        rdt.get_mba(assigned, 0)?
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory() {
        assert_eq!(policy_from_spec(&PolicySpec::None).name(), "none");
        assert_eq!(
            policy_from_spec(&PolicySpec::Test { every: 2 }).name(),
            "test"
        );
    }
}
