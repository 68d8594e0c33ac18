use anyhow::{anyhow, bail, Result};
use log::{debug, info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use simplelog as sl;
use std::env;
use std::fs;
use std::io::prelude::*;
use std::io::BufReader;
use std::mem;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

pub const TO_PCT: f64 = 100.0;

/// Log severity names accepted on the command line. Abbreviated forms
/// ("inf", "war", "err") are accepted for compatibility with hand-written
/// invocations.
pub fn parse_severity(name: &str) -> Result<log::LevelFilter> {
    Ok(match name {
        "trace" | "tra" => log::LevelFilter::Trace,
        "debug" | "deb" => log::LevelFilter::Debug,
        "info" | "inf" => log::LevelFilter::Info,
        "warning" | "war" => log::LevelFilter::Warn,
        "error" | "err" | "fatal" | "fat" => log::LevelFilter::Error,
        v => bail!("Unknown log severity {:?}", v),
    })
}

pub fn init_logging(clog_min: &str, flog_min: &str, log_file: &str) -> Result<()> {
    if env::var("RUST_LOG").is_ok() {
        env_logger::init();
        return Ok(());
    }

    let clog = parse_severity(clog_min)?;
    let flog = parse_severity(flog_min)?;

    let mut lcfg = sl::ConfigBuilder::new();
    lcfg.set_time_level(sl::LevelFilter::Error)
        .set_location_level(sl::LevelFilter::Off)
        .set_target_level(sl::LevelFilter::Off)
        .set_thread_level(sl::LevelFilter::Off);
    let cfg = lcfg.build();

    let mut loggers: Vec<Box<dyn sl::SharedLogger>> =
        vec![sl::TermLogger::new(clog, cfg.clone(), sl::TerminalMode::Stderr)];
    if !log_file.is_empty() {
        loggers.push(sl::WriteLogger::new(
            flog,
            cfg.clone(),
            fs::File::create(log_file)
                .map_err(|e| anyhow!("Failed to create log file {:?} ({})", log_file, &e))?,
        ));
    }

    if sl::CombinedLogger::init(loggers).is_err() {
        sl::SimpleLogger::init(clog, cfg).unwrap();
    }
    Ok(())
}

static PROG_EXITING: AtomicBool = AtomicBool::new(false);

pub fn setup_prog_state() {
    ctrlc::set_handler(move || {
        info!("SIGINT/TERM received, exiting...");
        set_prog_exiting();
    })
    .expect("Error setting term handler");
}

pub fn set_prog_exiting() {
    PROG_EXITING.store(true, Ordering::Relaxed);
}

pub fn prog_exiting() -> bool {
    PROG_EXITING.load(Ordering::Relaxed)
}

pub fn read_one_line<P: AsRef<Path>>(path: P) -> Result<String> {
    let f = fs::OpenOptions::new().read(true).open(path)?;
    let r = BufReader::new(f);
    Ok(r.lines().next().ok_or_else(|| anyhow!("File empty"))??)
}

pub fn write_one_line<P: AsRef<Path>>(path: P, line: &str) -> Result<()> {
    let mut f = fs::OpenOptions::new().write(true).open(path)?;
    Ok(f.write_all(line.as_ref())?)
}

pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn run_command(cmd: &mut Command, emsg: &str) -> Result<()> {
    let cmd_str = format!("{:?}", &cmd);
    debug!("Running {}", &cmd_str);

    match cmd.status() {
        Ok(rc) if rc.success() => Ok(()),
        Ok(rc) => bail!("{} ({:?}): {}", &cmd_str, &rc, emsg),
        Err(e) => bail!("{} ({:?}): {}", &cmd_str, &e, emsg),
    }
}

pub fn run_command_output(cmd: &mut Command, emsg: &str) -> Result<String> {
    let cmd_str = format!("{:?}", &cmd);
    debug!("Running {}", &cmd_str);

    match cmd.output() {
        Ok(output) if output.status.success() => Ok(String::from_utf8_lossy(&output.stdout).into()),
        Ok(output) => bail!("{} ({:?}): {}", &cmd_str, &output.status, emsg),
        Err(e) => bail!("{} ({:?}): {}", &cmd_str, &e, emsg),
    }
}

/// Drop root privileges to the invoking sudo user. No-op when not running
/// under sudo or when the real uid is already unprivileged.
pub fn drop_privileges() -> Result<()> {
    let uid: libc::uid_t = match env::var("SUDO_UID") {
        Ok(v) => v.parse()?,
        Err(_) => return Ok(()),
    };
    let gid: libc::gid_t = match env::var("SUDO_GID") {
        Ok(v) => v.parse()?,
        Err(_) => return Ok(()),
    };

    if unsafe { libc::getuid() } != 0 {
        return Ok(());
    }

    if unsafe { libc::setgid(gid) } != 0 {
        bail!("Failed to setgid({}) ({})", gid, std::io::Error::last_os_error());
    }
    if unsafe { libc::setuid(uid) } != 0 {
        bail!("Failed to setuid({}) ({})", uid, std::io::Error::last_os_error());
    }
    Ok(())
}

/// Pin a process to a CPU set. `pid` 0 means the calling process.
pub fn set_cpu_affinity(cpus: &[u32], pid: libc::pid_t) -> Result<()> {
    if cpus.is_empty() {
        return Ok(());
    }

    let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
    unsafe { libc::CPU_ZERO(&mut set) };
    for cpu in cpus {
        unsafe { libc::CPU_SET(*cpu as usize, &mut set) };
    }

    if unsafe { libc::sched_setaffinity(pid, mem::size_of::<libc::cpu_set_t>(), &set) } != 0 {
        bail!(
            "Failed to set cpu affinity of pid {} to {:?} ({})",
            pid,
            cpus,
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

/// Raise a thread to the SCHED_RR class with the given priority.
pub fn set_sched_rr(pid: libc::pid_t, prio: i32) -> Result<()> {
    let param = libc::sched_param { sched_priority: prio };
    if unsafe { libc::sched_setscheduler(pid, libc::SCHED_RR, &param) } != 0 {
        bail!(
            "Failed to set SCHED_RR prio {} on pid {} ({})",
            prio,
            pid,
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

fn read_task_children(pid: libc::pid_t, tid: libc::pid_t) -> Vec<libc::pid_t> {
    let path = format!("/proc/{}/task/{}/children", pid, tid);
    match fs::read_to_string(&path) {
        Ok(body) => body
            .split_whitespace()
            .filter_map(|tok| tok.parse().ok())
            .collect(),
        Err(_) => vec![],
    }
}

/// Collect all descendants of `pid`, depth-first, by walking
/// /proc/<pid>/task/<tid>/children.
pub fn pid_descendants(pid: libc::pid_t) -> Vec<libc::pid_t> {
    let mut descendants = vec![];
    let tids: Vec<libc::pid_t> = match fs::read_dir(format!("/proc/{}/task", pid)) {
        Ok(rd) => rd
            .filter_map(|x| x.ok())
            .filter_map(|x| x.file_name().to_str().and_then(|v| v.parse().ok()))
            .collect(),
        Err(_) => return descendants,
    };

    for tid in tids {
        for child in read_task_children(pid, tid) {
            descendants.push(child);
            descendants.extend(pid_descendants(child));
        }
    }
    descendants
}

/// SIGKILL every descendant of the calling process.
pub fn kill_descendants() {
    let children = pid_descendants(unsafe { libc::getpid() });
    if children.is_empty() {
        return;
    }

    debug!("Killing descendants {:?}", &children);
    for pid in children {
        if unsafe { libc::kill(pid, libc::SIGKILL) } < 0 {
            warn!(
                "Could not SIGKILL pid {} ({})",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_parse_severity() {
        for pair in &[
            ("inf", log::LevelFilter::Info),
            ("info", log::LevelFilter::Info),
            ("deb", log::LevelFilter::Debug),
            ("war", log::LevelFilter::Warn),
            ("err", log::LevelFilter::Error),
            ("tra", log::LevelFilter::Trace),
        ] {
            assert_eq!(super::parse_severity(pair.0).unwrap(), pair.1);
        }
        assert!(super::parse_severity("loud").is_err());
    }

    #[test]
    fn test_random_string() {
        let id = super::random_string(10);
        assert_eq!(id.len(), 10);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
