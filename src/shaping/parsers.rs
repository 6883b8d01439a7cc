//! Parsers for `tc`, `ip` and `ss` output read back from the shaping endpoint

use regex::Regex;
use serde::{Deserialize, Serialize};

/// One class from `tc [-s] class show`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcClass {
    pub kind: String,
    pub class_id: String,
    pub parent: Option<String>,
    pub rate: String,
    pub ceil: String,
    pub bytes: u64,
    pub packets: u64,
    pub drops: u64,
    pub overlimits: u64,
}

/// Parse `tc -s class show dev X`.
///
/// ```text
/// class htb 1:30 parent 1:1 leaf 30: prio 3 rate 1Gbit ceil 1Gbit burst 1375b cburst 1375b
///  Sent 123456 bytes 1234 pkt (dropped 0, overlimits 0 requeues 0)
/// ```
///
/// Without `-s` the counters stay at zero. A class without a ceil reports
/// its rate as ceil.
pub fn parse_tc_classes(output: &str) -> Vec<TcClass> {
    let header = Regex::new(r"^class (\S+) ([0-9a-fA-F]+:[0-9a-fA-F]+)\b").unwrap();
    let parent_re = Regex::new(r"\bparent (\S+)").unwrap();
    let rate_re = Regex::new(r"\brate (\S+)").unwrap();
    let ceil_re = Regex::new(r"\bceil (\S+)").unwrap();
    let sent_re =
        Regex::new(r"Sent (\d+) bytes (\d+) pkt \(dropped (\d+), overlimits (\d+)").unwrap();

    let mut classes: Vec<TcClass> = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(caps) = header.captures(trimmed) {
            let rate = rate_re
                .captures(trimmed)
                .map(|c| c[1].to_string())
                .unwrap_or_default();
            let ceil = ceil_re
                .captures(trimmed)
                .map(|c| c[1].to_string())
                .unwrap_or_else(|| rate.clone());
            classes.push(TcClass {
                kind: caps[1].to_string(),
                class_id: caps[2].to_string(),
                parent: parent_re.captures(trimmed).map(|c| c[1].to_string()),
                rate,
                ceil,
                ..Default::default()
            });
        } else if let (Some(current), Some(caps)) = (classes.last_mut(), sent_re.captures(trimmed)) {
            current.bytes = caps[1].parse().unwrap_or(0);
            current.packets = caps[2].parse().unwrap_or(0);
            current.drops = caps[3].parse().unwrap_or(0);
            current.overlimits = caps[4].parse().unwrap_or(0);
        }
    }
    classes
}

/// Interface holding `ip` in `ip -4 -o addr show` output
///
/// ```text
/// 7: eth1    inet 10.10.3.254/24 brd 10.10.3.255 scope global eth1\       valid_lft forever
/// ```
pub fn parse_interface_for_ip(output: &str, ip: &str) -> Option<String> {
    let re = Regex::new(r"^\d+:\s+(\S+)\s+inet\s+([\d.]+)/").unwrap();
    output.lines().find_map(|line| {
        let caps = re.captures(line.trim())?;
        if &caps[2] != ip {
            return None;
        }
        // veth names come back as "eth1@if23"
        let name = caps[1].split('@').next().unwrap_or(&caps[1]);
        Some(name.to_string())
    })
}

/// One established TCP connection from `ss -tn`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsConnection {
    pub local: String,
    pub remote: String,
}

impl SsConnection {
    /// Address part of `remote`, without the port
    pub fn remote_ip(&self) -> &str {
        self.remote
            .rsplit_once(':')
            .map(|(ip, _)| ip)
            .unwrap_or(&self.remote)
    }
}

fn strip_mapped(addr: &str) -> String {
    addr.replace("[::ffff:", "").replace(']', "")
}

/// Parse `ss -tn state established`. Accepts output with or without the
/// header and with or without a leading state column.
pub fn parse_connections(output: &str) -> Vec<SsConnection> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts: Vec<&str> = line.split_whitespace().collect();
            if parts.first().is_some_and(|p| p.chars().all(|c| c.is_ascii_alphabetic())) {
                // Header ("Recv-Q") never parses as a number, a state column does not either
                if parts.first().is_some_and(|p| p.starts_with("Recv")) {
                    return None;
                }
                parts.remove(0);
            }
            if parts.len() < 4 || parts[0].parse::<u64>().is_err() {
                return None;
            }
            Some(SsConnection {
                local: strip_mapped(parts[2]),
                remote: strip_mapped(parts[3]),
            })
        })
        .collect()
}
