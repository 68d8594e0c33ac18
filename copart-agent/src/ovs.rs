// Copyright (c) copart.
//
// Open vSwitch plumbing: per-VM flow byte counters polled from
// `ovs-ofctl dump-ports` and ingress-policing throttles set with
// `ovs-vsctl`. Inbound limits go on the bonded uplinks, outbound on the
// VM's vhost port.
use anyhow::Result;
use copart_util::{run_command, run_command_output};
use log::info;
use std::process::Command;

const OVS_BRIDGE: &str = "ovs_br0";
const UPLINK_PORTS: [&str; 2] = ["dpdk0", "dpdk1"];

/// The vhost port of a domain is named after the last two `_`-separated
/// components of the domain name.
pub fn vhost_port(domain: &str) -> String {
    let parts: Vec<&str> = domain.split('_').collect();
    match parts.len() {
        0 | 1 => format!("vhost-{}", domain),
        n => format!("vhost-{}-{}", parts[n - 2], parts[n - 1]),
    }
}

fn parse_bytes_field(line: &str) -> Option<f64> {
    let at = line.find("bytes=")?;
    let rest = &line[at + "bytes=".len()..];
    let end = rest.find(',').unwrap_or(rest.len());
    let value: f64 = rest[..end].trim().parse().ok()?;
    if value.is_finite() && value >= 0.0 {
        Some(value)
    } else {
        Some(0.0)
    }
}

/// Parse one dump-ports reply into cumulative (rx_bytes, tx_bytes).
/// Malformed or negative numbers degrade to 0 rather than failing the
/// interval.
fn parse_dump_ports(output: &str) -> (f64, f64) {
    let mut rx = 0.0;
    let mut tx = 0.0;
    for line in output.lines() {
        if line.contains("rx") {
            if let Some(v) = parse_bytes_field(line) {
                rx = v;
            }
        } else if line.contains("tx") {
            if let Some(v) = parse_bytes_field(line) {
                tx = v;
            }
        }
    }
    (rx, tx)
}

/// Cumulative flow byte counters of one domain's vhost port.
pub fn poll_flow_counters(domain: &str) -> Result<(f64, f64)> {
    let port = vhost_port(domain);
    let output = run_command_output(
        Command::new("ovs-ofctl")
            .arg("dump-ports")
            .arg(OVS_BRIDGE)
            .arg(&port),
        "failed to poll OVS port stats",
    )?;
    Ok(parse_dump_ports(&output))
}

fn set_ingress_policing(iface: &str, rate: u64, burst: u64) -> Result<()> {
    run_command(
        Command::new("ovs-vsctl")
            .arg("set")
            .arg("interface")
            .arg(iface)
            .arg(format!("ingress_policing_rate={}", rate)),
        "failed to set ingress policing rate",
    )?;
    run_command(
        Command::new("ovs-vsctl")
            .arg("set")
            .arg("interface")
            .arg(iface)
            .arg(format!("ingress_policing_burst={}", burst)),
        "failed to set ingress policing burst",
    )
}

/// Apply network throttles for one VM. Policing knows only rate and burst;
/// the peak values are accepted for config compatibility and unused.
pub fn apply_net_policing(
    domain: &str,
    in_avg: u64,
    _in_peak: u64,
    in_burst: u64,
    out_avg: u64,
    _out_peak: u64,
    out_burst: u64,
) -> Result<()> {
    info!(
        "ovs: Policing {} in {}/{} out {}/{}",
        domain, in_avg, in_burst, out_avg, out_burst
    );

    for port in &UPLINK_PORTS {
        set_ingress_policing(port, in_avg, in_burst)?;
    }
    set_ingress_policing(&vhost_port(domain), out_avg, out_burst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vhost_port() {
        assert_eq!(vhost_port("xpl_web_1"), "vhost-web-1");
        assert_eq!(vhost_port("a_b"), "vhost-a-b");
        assert_eq!(vhost_port("solo"), "vhost-solo");
    }

    #[test]
    fn test_parse_dump_ports() {
        let output = "\
OFPST_PORT reply (xid=0x2): 1 ports
  port \"vhost-web-1\": rx pkts=100, bytes=123456, drop=0, errs=0, frame=?, over=?, crc=?
           tx pkts=50, bytes=65536, drop=0, errs=?, coll=?
";
        assert_eq!(parse_dump_ports(output), (123456.0, 65536.0));
    }

    #[test]
    fn test_parse_dump_ports_degrades_to_zero() {
        assert_eq!(parse_dump_ports("no counters here"), (0.0, 0.0));
        let negative = "  port x: rx pkts=1, bytes=-5, drop=0\n   tx pkts=1, bytes=nan, coll=?\n";
        assert_eq!(parse_dump_ports(negative), (0.0, 0.0));
    }
}
