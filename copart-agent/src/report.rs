// Copyright (c) copart.
//
// The four CSV output streams. Interval and times rows go straight to
// their sink; until-completion and total rows are buffered in memory when
// no path is given so they do not interleave with the per-interval output
// on stdout.
use anyhow::{anyhow, Result};
use log::debug;
use std::fs;
use std::io::Write;

use super::cpustat::TIME_CATEGORIES;
use super::workload::{Payload, Workload, WorkloadCore};

#[derive(Debug)]
enum Sink {
    Stdout,
    Memory(String),
    File(fs::File),
}

#[derive(Debug)]
pub struct OutStream {
    sink: Sink,
}

impl OutStream {
    /// Stream that falls back to stdout when no path is configured.
    pub fn direct(path: &str) -> Result<OutStream> {
        let sink = if path.is_empty() {
            Sink::Stdout
        } else {
            Sink::File(
                fs::File::create(path)
                    .map_err(|e| anyhow!("Failed to create output {:?} ({})", path, &e))?,
            )
        };
        Ok(OutStream { sink })
    }

    /// Stream that buffers in memory when no path is configured; the
    /// buffer is printed after the run.
    pub fn buffered(path: &str) -> Result<OutStream> {
        let sink = if path.is_empty() {
            Sink::Memory(String::new())
        } else {
            Sink::File(
                fs::File::create(path)
                    .map_err(|e| anyhow!("Failed to create output {:?} ({})", path, &e))?,
            )
        };
        Ok(OutStream { sink })
    }

    pub fn write_line(&mut self, line: &str) -> Result<()> {
        match &mut self.sink {
            Sink::Stdout => {
                println!("{}", line);
                Ok(())
            }
            Sink::Memory(buffer) => {
                buffer.push_str(line);
                buffer.push('\n');
                Ok(())
            }
            Sink::File(file) => Ok(writeln!(file, "{}", line)?),
        }
    }

    /// Dump a memory-buffered stream to stdout.
    pub fn flush_to_stdout(&mut self) {
        if let Sink::Memory(buffer) = &mut self.sink {
            print!("{}", buffer);
            buffer.clear();
        }
    }

    #[cfg(test)]
    fn memory_contents(&self) -> &str {
        match &self.sink {
            Sink::Memory(buffer) => buffer,
            _ => "",
        }
    }
}

fn app_label(core: &WorkloadCore) -> String {
    format!("{:02}_{}", core.id, core.name)
}

fn values_to_csv(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn stat_columns(w: &Workload) -> Vec<String> {
    let stats = &w.core.stats[0];
    let mut cols: Vec<String> = stats.names().to_vec();
    cols.extend(stats.derived_names().iter().map(|s| s.to_string()));
    cols
}

/// Header of the interval/until-completion/total streams. The layout
/// follows the workload variant: VMs carry temperature and VM-utilization
/// prefix columns, processes a completion ratio.
pub fn stats_header(w: &Workload) -> String {
    let mut cols: Vec<String> = match &w.payload {
        Payload::Process(_) => ["interval", "app", "CPU", "total_CPU%", "compl"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        Payload::Vm(_) => [
            "interval",
            "app",
            "CPU",
            "Temperature",
            "VM_CPU%",
            "total_CPU%",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    };
    cols.extend(stat_columns(w));
    cols.join(",")
}

/// Header of the times stream.
pub fn times_header(w: &Workload) -> String {
    let mut cols: Vec<String> = match &w.payload {
        Payload::Process(_) => vec![
            "interval".into(),
            "app".into(),
            "CPU".into(),
            "total_CPU%".into(),
        ],
        Payload::Vm(_) => vec![
            "interval".into(),
            "app".into(),
            "CPU".into(),
            "VM_CPU%".into(),
            "total_CPU%".into(),
        ],
    };
    match &w.payload {
        Payload::Process(_) => {
            cols.extend(TIME_CATEGORIES.iter().map(|c| format!("{}%", c)));
        }
        Payload::Vm(_) => {
            cols.extend(TIME_CATEGORIES.iter().map(|c| c.to_string()));
        }
    }
    cols.join(",")
}

fn completion_ratio(w: &Workload, idx: usize) -> f64 {
    match w.max_instr() {
        Some(max_instr) if max_instr > 0 => {
            w.core.stats[idx].sum(super::counters::INSTRUCTIONS) / max_instr as f64
        }
        _ => f64::NAN,
    }
}

fn row_prefix(w: &Workload, interval: u64, idx: usize, monitor_only: bool) -> String {
    let core = &w.core;
    let configured_cpu = core.cpus[idx];
    match &w.payload {
        Payload::Process(_) => {
            let util = core
                .total_cpu_util
                .get(&configured_cpu)
                .copied()
                .unwrap_or(0.0);
            format!(
                "{},{},{},{},{}",
                interval,
                app_label(core),
                configured_cpu,
                util,
                completion_ratio(w, idx)
            )
        }
        Payload::Vm(vm_task) => {
            let cpu = if monitor_only {
                configured_cpu
            } else {
                w.current_cpu(idx)
            };
            let temperature = vm_task.temp_map.read(cpu).unwrap_or_else(|e| {
                debug!("report: No temperature for cpu {} ({})", cpu, &e);
                0.0
            });
            let vm_util = vm_task.vm_cpu_util.get(&cpu).copied().unwrap_or(0.0);
            let util = core.total_cpu_util.get(&cpu).copied().unwrap_or(0.0);
            format!(
                "{},{},{},{},{},{}",
                interval,
                app_label(core),
                cpu,
                temperature,
                vm_util,
                util
            )
        }
    }
}

/// One interval row per stream of the workload.
pub fn interval_rows(w: &Workload, interval: u64, monitor_only: bool) -> Vec<String> {
    (0..w.core.cpus.len())
        .filter(|idx| w.core.stats[*idx].is_initialized())
        .map(|idx| {
            format!(
                "{},{}",
                row_prefix(w, interval, idx, monitor_only),
                values_to_csv(&w.core.stats[idx].interval_values())
            )
        })
        .collect()
}

/// One cumulative row per stream, for the until-completion and total
/// streams.
pub fn total_rows(w: &Workload, interval: u64) -> Vec<String> {
    (0..w.core.cpus.len())
        .filter(|idx| w.core.stats[*idx].is_initialized())
        .map(|idx| {
            format!(
                "{},{}",
                row_prefix(w, interval, idx, true),
                values_to_csv(&w.core.stats[idx].total_values())
            )
        })
        .collect()
}

/// One times row per CPU with the raw per-category deltas.
pub fn times_rows(w: &Workload, interval: u64, monitor_only: bool) -> Vec<String> {
    let core = &w.core;
    (0..core.cpus.len())
        .map(|idx| {
            let configured_cpu = core.cpus[idx];
            let cpu = match &w.payload {
                Payload::Vm(_) if !monitor_only => w.current_cpu(idx),
                _ => configured_cpu,
            };

            let mut cols = match &w.payload {
                Payload::Process(_) => format!(
                    "{},{},{},{}",
                    interval,
                    app_label(core),
                    cpu,
                    core.total_cpu_util.get(&cpu).copied().unwrap_or(0.0)
                ),
                Payload::Vm(vm_task) => format!(
                    "{},{},{},{},{}",
                    interval,
                    app_label(core),
                    cpu,
                    vm_task.vm_cpu_util.get(&cpu).copied().unwrap_or(0.0),
                    core.total_cpu_util.get(&cpu).copied().unwrap_or(0.0)
                ),
            };
            for cat in 0..TIME_CATEGORIES.len() {
                cols.push_str(&format!(
                    ",{}",
                    core.total_time_util.get(&(cat, cpu)).copied().unwrap_or(0.0)
                ));
            }
            cols
        })
        .collect()
}

/// The four output streams of a run.
#[derive(Debug)]
pub struct Reports {
    pub interval: OutStream,
    pub fin: OutStream,
    pub total: OutStream,
    pub times: OutStream,
}

impl Reports {
    pub fn open(
        interval_path: &str,
        fin_path: &str,
        total_path: &str,
        times_path: &str,
    ) -> Result<Reports> {
        Ok(Reports {
            interval: OutStream::direct(interval_path)?,
            fin: OutStream::buffered(fin_path)?,
            total: OutStream::buffered(total_path)?,
            times: OutStream::direct(times_path)?,
        })
    }

    /// Headers match the first configured workload's layout.
    pub fn write_headers(&mut self, w: &Workload) -> Result<()> {
        let header = stats_header(w);
        self.interval.write_line(&header)?;
        self.fin.write_line(&header)?;
        self.total.write_line(&header)?;
        self.times.write_line(&times_header(w))?;
        Ok(())
    }

    /// Print the buffered streams once the per-interval output is done.
    pub fn flush_buffered(&mut self) {
        self.fin.flush_to_stdout();
        self.total.flush_to_stdout();
    }
}

#[cfg(test)]
mod tests {
    use super::super::counters::{Counter, CYCLES, INSTRUCTIONS};
    use super::*;
    use copart_agent_intf::AppSpec;

    fn app_workload() -> Workload {
        let app: AppSpec = serde_yaml::from_str(
            "{app: {cmd: /bin/true}, cpus: [3], max_instr: 1000}",
        )
        .unwrap();
        let mut w =
            Workload::new_process(&app, "true".into(), "/tmp/copart-report-test").unwrap();
        w.core.stats[0]
            .init(&[INSTRUCTIONS.to_string(), CYCLES.to_string()], 1.0)
            .unwrap();
        w
    }

    fn accumulate(w: &mut Workload, inst: f64, cycles: f64) {
        w.core.stats[0]
            .accumulate(
                vec![
                    Counter::new(0, INSTRUCTIONS, inst, false),
                    Counter::new(1, CYCLES, cycles, false),
                ],
                1.0,
            )
            .unwrap();
    }

    #[test]
    fn test_app_headers() {
        let w = app_workload();
        assert_eq!(
            stats_header(&w),
            format!(
                "interval,app,CPU,total_CPU%,compl,{},{},ipc",
                INSTRUCTIONS, CYCLES
            )
        );
        assert!(times_header(&w).starts_with("interval,app,CPU,total_CPU%,user%,"));
        assert!(times_header(&w).ends_with("guest_nice%"));
    }

    #[test]
    fn test_interval_row() {
        let mut w = app_workload();
        accumulate(&mut w, 0.0, 0.0);
        accumulate(&mut w, 500.0, 1000.0);
        w.core.total_cpu_util.insert(3, 42.5);

        let rows = interval_rows(&w, 7, false);
        assert_eq!(rows.len(), 1);
        let label = format!("{:02}_true", w.core.id);
        assert_eq!(rows[0], format!("7,{},3,42.5,0.5,500,1000,0.5", label));
    }

    #[test]
    fn test_total_row_uses_sums() {
        let mut w = app_workload();
        accumulate(&mut w, 0.0, 0.0);
        accumulate(&mut w, 500.0, 1000.0);
        accumulate(&mut w, 800.0, 2000.0);

        let rows = total_rows(&w, 9);
        // Sums: 800 instructions over 2000 cycles.
        assert!(rows[0].ends_with(",800,2000,0.4"));
    }

    #[test]
    fn test_buffered_stream() {
        let mut stream = OutStream::buffered("").unwrap();
        stream.write_line("a,b,c").unwrap();
        stream.write_line("1,2,3").unwrap();
        assert_eq!(stream.memory_contents(), "a,b,c\n1,2,3\n");
    }
}
