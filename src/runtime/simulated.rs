//! In-memory host
//!
//! Interprets the exact command lines the service issues (container runtime
//! CLI, and `ip`/`tc`/`ss`/`iperf3` inside containers) against an in-memory
//! model of containers, networks and the shaping endpoint's links. Backs the
//! `--simulate` mode and the test suite. Failures and stalls can be injected
//! by substring of the rendered command line.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::executor::{render_command, CommandExecutor, CommandOutput, ExecError};
use crate::config::Settings;
use crate::shaping::units::parse_rate;

const ROUTER_UPLINK: &str = "eth0";
const ROUTER_UPLINK_IP: &str = "172.18.0.2";

#[derive(Debug, Clone)]
struct SimContainer {
    running: bool,
    network: Option<String>,
    ip: Option<String>,
}

#[derive(Debug, Clone)]
struct SimNetwork {
    /// Router interface and address when the router is attached
    router: Option<(String, String)>,
}

#[derive(Debug, Clone, Default)]
struct SimClass {
    parent: String,
    rate: String,
    ceil: String,
    prio: Option<String>,
    bytes: u64,
    packets: u64,
}

#[derive(Debug, Clone, Default)]
struct SimLink {
    up: bool,
    root: Option<String>,
    ingress: bool,
    redirect: Option<String>,
    classes: BTreeMap<String, SimClass>,
}

#[derive(Debug, Clone)]
struct IperfSession {
    server_ip: String,
    port: String,
    client_ip: String,
    bandwidth: Option<u64>,
}

#[derive(Debug, Default)]
struct SimState {
    containers: BTreeMap<String, SimContainer>,
    networks: BTreeMap<String, SimNetwork>,
    links: BTreeMap<String, SimLink>,
    next_iface: u32,
    failures: Vec<String>,
    stalls: Vec<String>,
    history: Vec<String>,
    iperf: BTreeMap<String, IperfSession>,
    /// Ports with an `iperf3 -s` daemon on the shaping endpoint
    listeners: BTreeSet<String>,
}

type Reply = (i32, String, String);

fn ok(stdout: impl Into<String>) -> Reply {
    (0, stdout.into(), String::new())
}

fn err(status: i32, stderr: impl Into<String>) -> Reply {
    (status, String::new(), stderr.into())
}

/// Port named by a `pgrep -f`/`pkill -f` server pattern
fn pattern_port(pattern: &str) -> Option<&str> {
    pattern
        .trim_start_matches('^')
        .trim_end_matches('$')
        .strip_prefix("iperf3 -s -D -p ")
}

fn flag_value<'a>(args: &[&'a str], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| *a == flag)
        .and_then(|i| args.get(i + 1).copied())
}

/// Kernel-style rate display: `20mbit` becomes `20Mbit`
fn display_rate(rate: &str) -> String {
    match parse_rate(rate) {
        Some(bits) if bits >= 1_000_000_000 && bits % 1_000_000_000 == 0 => {
            format!("{}Gbit", bits / 1_000_000_000)
        }
        Some(bits) if bits >= 1_000_000 && bits % 1_000_000 == 0 => format!("{}Mbit", bits / 1_000_000),
        Some(bits) if bits >= 1_000 && bits % 1_000 == 0 => format!("{}Kbit", bits / 1_000),
        Some(bits) => format!("{}bit", bits),
        None => rate.to_string(),
    }
}

impl SimState {
    fn docker(&mut self, router: &str, args: &[&str]) -> Reply {
        match args {
            ["ps", rest @ ..] => self.ps(rest),
            ["inspect", "-f", _, name] => match self.containers.get(*name) {
                Some(c) => ok(format!("{}\n", c.running)),
                None => err(1, format!("Error: No such object: {}", name)),
            },
            ["start", name] => match self.containers.get_mut(*name) {
                Some(c) => {
                    c.running = true;
                    ok(format!("{}\n", name))
                }
                None => err(1, format!("Error response from daemon: No such container: {}", name)),
            },
            ["run", rest @ ..] => self.run(rest),
            ["rm", "-f", name] => match self.containers.remove(*name) {
                Some(_) => {
                    self.iperf.remove(*name);
                    ok(format!("{}\n", name))
                }
                None => err(1, format!("Error: No such container: {}", name)),
            },
            ["network", "inspect", name] => {
                if self.networks.contains_key(*name) {
                    ok(format!("[{{\"Name\": \"{}\"}}]\n", name))
                } else {
                    err(1, format!("Error: No such network: {}", name))
                }
            }
            ["network", "create", rest @ ..] => {
                let Some(name) = rest.last() else {
                    return err(1, "network name required");
                };
                if self.networks.contains_key(*name) {
                    return err(1, format!("Error response from daemon: network with name {} already exists", name));
                }
                self.networks
                    .insert(name.to_string(), SimNetwork { router: None });
                ok("0123456789ab\n")
            }
            ["network", "connect", "--ip", ip, network, container] => {
                self.connect(router, network, container, ip)
            }
            ["network", "disconnect", "-f", network, container] => {
                self.disconnect(router, network, container)
            }
            ["network", "rm", network] => {
                let Some(net) = self.networks.get(*network) else {
                    return err(1, format!("Error: No such network: {}", network));
                };
                let in_use = net.router.is_some()
                    || self
                        .containers
                        .values()
                        .any(|c| c.network.as_deref() == Some(*network));
                if in_use {
                    return err(
                        1,
                        format!("Error response from daemon: error while removing network: network {} has active endpoints", network),
                    );
                }
                self.networks.remove(*network);
                ok(format!("{}\n", network))
            }
            ["exec", rest @ ..] => {
                let (detached, rest) = match rest {
                    ["-d", tail @ ..] => (true, tail),
                    _ => (false, rest),
                };
                let Some((container, command)) = rest.split_first() else {
                    return err(1, "exec requires a container");
                };
                match self.containers.get(*container) {
                    None => return err(1, format!("Error: No such container: {}", container)),
                    Some(c) if !c.running => {
                        return err(1, format!("Error response from daemon: Container {} is not running", container))
                    }
                    Some(_) => {}
                }
                if *container == router {
                    self.router_cmd(command)
                } else {
                    self.device_cmd(container, command, detached)
                }
            }
            _ => err(125, format!("unknown command: {}", args.join(" "))),
        }
    }

    fn ps(&self, rest: &[&str]) -> Reply {
        let all = rest.contains(&"-a");
        let format = flag_value(rest, "--format").unwrap_or("{{.Names}}");
        let prefix = flag_value(rest, "--filter").and_then(|f| f.strip_prefix("name=^"));

        let mut out = String::new();
        for (name, c) in &self.containers {
            if let Some(prefix) = prefix {
                if !name.starts_with(prefix) {
                    continue;
                }
            }
            if !all && !c.running {
                continue;
            }
            if format.contains("{{.State}}") {
                let state = if c.running { "running" } else { "exited" };
                out.push_str(&format!("{} {}\n", name, state));
            } else {
                out.push_str(&format!("{}\n", name));
            }
        }
        ok(out)
    }

    fn run(&mut self, rest: &[&str]) -> Reply {
        let Some(name) = flag_value(rest, "--name") else {
            return err(125, "container name required");
        };
        if self.containers.contains_key(name) {
            return err(
                125,
                format!("docker: Error response from daemon: Conflict. The container name \"/{}\" is already in use.", name),
            );
        }
        let network = flag_value(rest, "--network");
        if let Some(network) = network {
            if !self.networks.contains_key(network) {
                return err(125, format!("docker: Error response from daemon: network {} not found.", network));
            }
        }
        self.containers.insert(
            name.to_string(),
            SimContainer {
                running: true,
                network: network.map(str::to_string),
                ip: flag_value(rest, "--ip").map(str::to_string),
            },
        );
        ok(format!("{:0>64}\n", self.containers.len()))
    }

    fn connect(&mut self, router: &str, network: &str, container: &str, ip: &str) -> Reply {
        if !self.containers.contains_key(container) {
            return err(1, format!("Error response from daemon: No such container: {}", container));
        }
        let next_iface = self.next_iface + 1;
        let Some(net) = self.networks.get_mut(network) else {
            return err(1, format!("Error response from daemon: network {} not found", network));
        };
        if container != router {
            return ok("");
        }
        if net.router.is_some() {
            return err(
                1,
                format!("Error response from daemon: endpoint with name {} already exists in network {}", container, network),
            );
        }
        let iface = format!("eth{}", next_iface);
        net.router = Some((iface.clone(), ip.to_string()));
        self.next_iface = next_iface;
        self.links.insert(
            iface,
            SimLink {
                up: true,
                ..Default::default()
            },
        );
        ok("")
    }

    fn disconnect(&mut self, router: &str, network: &str, container: &str) -> Reply {
        let Some(net) = self.networks.get_mut(network) else {
            return err(1, format!("Error response from daemon: network {} not found", network));
        };
        if container != router {
            return ok("");
        }
        match net.router.take() {
            Some((iface, _)) => {
                // The veth goes away with everything attached to it
                self.links.remove(&iface);
                ok("")
            }
            None => err(
                1,
                format!("Error response from daemon: container {} is not connected to network {}", container, network),
            ),
        }
    }

    fn router_cmd(&mut self, cmd: &[&str]) -> Reply {
        match cmd {
            ["ip", "-4", "-o", "addr", "show"] => {
                let mut out = String::from(
                    "1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever\n",
                );
                out.push_str(&format!(
                    "2: {}    inet {}/16 brd 172.18.255.255 scope global {}\\       valid_lft forever preferred_lft forever\n",
                    ROUTER_UPLINK, ROUTER_UPLINK_IP, ROUTER_UPLINK
                ));
                let mut attached: Vec<&(String, String)> =
                    self.networks.values().filter_map(|n| n.router.as_ref()).collect();
                attached.sort();
                for (iface, ip) in attached {
                    let idx: u32 = iface.trim_start_matches("eth").parse().unwrap_or(0) + 10;
                    out.push_str(&format!(
                        "{}: {}@if{}    inet {}/24 scope global {}\\       valid_lft forever preferred_lft forever\n",
                        idx,
                        iface,
                        idx + 1,
                        ip,
                        iface
                    ));
                }
                ok(out)
            }
            ["ip", "link", "add", name, "type", "ifb"] => {
                if self.links.contains_key(*name) {
                    return err(2, "RTNETLINK answers: File exists");
                }
                self.links.insert(name.to_string(), SimLink::default());
                ok("")
            }
            ["ip", "link", "set", name, "up"] => match self.links.get_mut(*name) {
                Some(link) => {
                    link.up = true;
                    ok("")
                }
                None => err(1, format!("Cannot find device \"{}\"", name)),
            },
            ["ip", "link", "del", name] => match self.links.remove(*name) {
                Some(_) => ok(""),
                None => err(1, format!("Cannot find device \"{}\"", name)),
            },
            ["tc", "qdisc", "add", "dev", dev, "root", "handle", handle, "htb", ..] => {
                let Some(link) = self.links.get_mut(*dev) else {
                    return err(1, format!("Cannot find device \"{}\"", dev));
                };
                if link.root.is_some() {
                    return err(2, "RTNETLINK answers: File exists");
                }
                link.root = Some(handle.trim_end_matches(':').to_string());
                ok("")
            }
            ["tc", "qdisc", "add", "dev", dev, "ingress"] => {
                let Some(link) = self.links.get_mut(*dev) else {
                    return err(1, format!("Cannot find device \"{}\"", dev));
                };
                if link.ingress {
                    return err(2, "RTNETLINK answers: File exists");
                }
                link.ingress = true;
                ok("")
            }
            ["tc", "qdisc", "del", "dev", dev, kind] => {
                let Some(link) = self.links.get_mut(*dev) else {
                    return err(1, format!("Cannot find device \"{}\"", dev));
                };
                let present = match *kind {
                    "root" => link.root.take().is_some(),
                    "ingress" => {
                        link.redirect = None;
                        std::mem::replace(&mut link.ingress, false)
                    }
                    _ => false,
                };
                if *kind == "root" {
                    link.classes.clear();
                }
                if present {
                    ok("")
                } else {
                    err(2, "RTNETLINK answers: No such file or directory")
                }
            }
            ["tc", "class", verb @ ("add" | "change"), "dev", dev, "parent", parent, "classid", classid, "htb", params @ ..] => {
                let Some(link) = self.links.get_mut(*dev) else {
                    return err(1, format!("Cannot find device \"{}\"", dev));
                };
                if link.root.is_none() {
                    return err(2, "RTNETLINK answers: No such file or directory");
                }
                let rate = flag_value(params, "rate").unwrap_or("");
                let ceil = flag_value(params, "ceil").unwrap_or(rate);
                if parse_rate(rate).is_none() || parse_rate(ceil).is_none() {
                    return err(1, format!("Illegal \"rate\": {}", rate));
                }
                match (*verb, link.classes.get_mut(*classid)) {
                    ("add", Some(_)) => err(2, "RTNETLINK answers: File exists"),
                    ("add", None) => {
                        link.classes.insert(
                            classid.to_string(),
                            SimClass {
                                parent: parent.to_string(),
                                rate: rate.to_string(),
                                ceil: ceil.to_string(),
                                prio: flag_value(params, "prio").map(str::to_string),
                                ..Default::default()
                            },
                        );
                        ok("")
                    }
                    (_, Some(class)) => {
                        class.rate = rate.to_string();
                        class.ceil = ceil.to_string();
                        ok("")
                    }
                    (_, None) => err(2, "RTNETLINK answers: No such file or directory"),
                }
            }
            ["tc", "filter", "add", "dev", dev, "parent", "ffff:", .., "dev", target] => {
                if !self.links.contains_key(*target) {
                    return err(1, format!("Cannot find device \"{}\"", target));
                }
                let Some(link) = self.links.get_mut(*dev) else {
                    return err(1, format!("Cannot find device \"{}\"", dev));
                };
                if !link.ingress {
                    return err(2, "RTNETLINK answers: Invalid argument");
                }
                link.redirect = Some(target.to_string());
                ok("")
            }
            ["iperf3", "-s", "-D", "-p", port] => {
                if self.listeners.insert(port.to_string()) {
                    ok("")
                } else {
                    err(1, "iperf3: error - unable to start listener for connections: Address already in use")
                }
            }
            ["pgrep", "-f", pattern] => match pattern_port(pattern) {
                Some(port) if self.listeners.contains(port) => ok("4243\n"),
                _ => err(1, ""),
            },
            ["pkill", "-f", pattern] => match pattern_port(pattern) {
                Some(port) if self.listeners.remove(port) => ok(""),
                _ => err(1, ""),
            },
            ["tc", "-s", "class", "show", "dev", dev] => {
                self.drive_traffic(dev);
                self.show_classes(dev, true)
            }
            ["tc", "class", "show", "dev", dev] => self.show_classes(dev, false),
            ["ss", "-tn", "state", "established"] => {
                let mut out = String::from("Recv-Q Send-Q Local Address:Port  Peer Address:Port Process\n");
                for (i, session) in self.iperf.values().enumerate() {
                    out.push_str(&format!(
                        "0      0      {}:{}     {}:{}\n",
                        session.server_ip,
                        session.port,
                        session.client_ip,
                        40000 + i
                    ));
                }
                ok(out)
            }
            _ => err(127, format!("sh: {}: not found", cmd.first().unwrap_or(&""))),
        }
    }

    /// One sample's worth of bytes for every session shaped on `dev`
    fn drive_traffic(&mut self, dev: &str) {
        let sessions: Vec<IperfSession> = self
            .iperf
            .values()
            .filter(|s| {
                self.networks
                    .values()
                    .filter_map(|n| n.router.as_ref())
                    .any(|(iface, ip)| iface == dev && *ip == s.server_ip)
            })
            .cloned()
            .collect();
        let Some(link) = self.links.get_mut(dev) else {
            return;
        };
        for session in sessions {
            if let Some(class) = link.classes.get_mut("1:30") {
                let ceil = parse_rate(&class.ceil).unwrap_or(0);
                let bits = session.bandwidth.map_or(ceil, |bw| bw.min(ceil));
                class.bytes += bits / 8;
                class.packets += bits / 8 / 1500;
            }
        }
    }

    fn show_classes(&self, dev: &str, stats: bool) -> Reply {
        let Some(link) = self.links.get(dev) else {
            return err(1, format!("Cannot find device \"{}\"", dev));
        };
        let mut out = String::new();
        for (id, class) in &link.classes {
            let is_root = class.parent.ends_with(':');
            if is_root {
                out.push_str(&format!("class htb {} root ", id));
            } else {
                out.push_str(&format!("class htb {} parent {} ", id, class.parent));
            }
            if let Some(prio) = &class.prio {
                out.push_str(&format!("prio {} ", prio));
            }
            out.push_str(&format!(
                "rate {} ceil {} burst 1600b cburst 1600b\n",
                display_rate(&class.rate),
                display_rate(&class.ceil)
            ));
            if stats {
                out.push_str(&format!(
                    " Sent {} bytes {} pkt (dropped 0, overlimits 0 requeues 0)\n backlog 0b 0p requeues 0\n",
                    class.bytes, class.packets
                ));
            }
        }
        ok(out)
    }

    fn device_cmd(&mut self, container: &str, cmd: &[&str], _detached: bool) -> Reply {
        match cmd {
            ["iperf3", "-c", server, "-p", port, rest @ ..] => {
                if !self.listeners.contains(*port) {
                    return err(1, "iperf3: error - unable to connect to server: Connection refused");
                }
                let client_ip = self
                    .containers
                    .get(container)
                    .and_then(|c| c.ip.clone())
                    .unwrap_or_default();
                self.iperf.insert(
                    container.to_string(),
                    IperfSession {
                        server_ip: server.to_string(),
                        port: port.to_string(),
                        client_ip,
                        bandwidth: flag_value(rest, "-b").and_then(parse_rate),
                    },
                );
                ok("")
            }
            ["pkill", "iperf3"] => match self.iperf.remove(container) {
                Some(_) => ok(""),
                None => err(1, ""),
            },
            ["pgrep", "iperf3"] => match self.iperf.get(container) {
                Some(_) => ok("4242\n"),
                None => err(1, ""),
            },
            _ => err(127, format!("sh: {}: not found", cmd.first().unwrap_or(&""))),
        }
    }
}

/// In-memory stand-in for the container runtime and the shaping endpoint
pub struct SimulatedHost {
    state: Mutex<SimState>,
    router: String,
}

impl SimulatedHost {
    /// A host with the shaping endpoint and the supporting containers running
    pub fn new(settings: &Settings) -> Self {
        let mut state = SimState::default();
        let always_on = std::iter::once(&settings.router_container).chain(&settings.status_containers);
        for name in always_on {
            state.containers.insert(
                name.clone(),
                SimContainer {
                    running: true,
                    network: None,
                    ip: None,
                },
            );
        }
        state.links.insert(
            ROUTER_UPLINK.to_string(),
            SimLink {
                up: true,
                ..Default::default()
            },
        );

        Self {
            state: Mutex::new(state),
            router: settings.router_container.clone(),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail every command whose rendered line contains `pattern`
    pub fn fail_matching(&self, pattern: &str) {
        self.state().failures.push(pattern.to_string());
    }

    /// Make matching commands hang until their timeout
    pub fn stall_matching(&self, pattern: &str) {
        self.state().stalls.push(pattern.to_string());
    }

    pub fn clear_faults(&self) {
        let mut state = self.state();
        state.failures.clear();
        state.stalls.clear();
    }

    /// Every command line run so far
    pub fn history(&self) -> Vec<String> {
        self.state().history.clone()
    }

    pub fn commands_matching(&self, pattern: &str) -> Vec<String> {
        self.state()
            .history
            .iter()
            .filter(|line| line.contains(pattern))
            .cloned()
            .collect()
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.state().containers.contains_key(name)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state().containers.get(name).is_some_and(|c| c.running)
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.state().networks.contains_key(name)
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.state().links.contains_key(name)
    }

    /// An `iperf3` server is listening on `port` on the shaping endpoint
    pub fn is_listening(&self, port: u16) -> bool {
        self.state().listeners.contains(&port.to_string())
    }

    /// Start a managed-looking container out of band
    pub fn add_container(&self, name: &str, running: bool) {
        self.state().containers.insert(
            name.to_string(),
            SimContainer {
                running,
                network: None,
                ip: None,
            },
        );
    }

    /// Remove a container out of band
    pub fn remove_container(&self, name: &str) {
        self.state().containers.remove(name);
    }

    /// Configured rate and ceil of a class, as given on the command line
    pub fn class_rates(&self, dev: &str, class_id: &str) -> Option<(String, String)> {
        self.state()
            .links
            .get(dev)
            .and_then(|l| l.classes.get(class_id))
            .map(|c| (c.rate.clone(), c.ceil.clone()))
    }

    /// Add to a class's byte counter
    pub fn add_class_bytes(&self, dev: &str, class_id: &str, bytes: u64) {
        if let Some(class) = self
            .state()
            .links
            .get_mut(dev)
            .and_then(|l| l.classes.get_mut(class_id))
        {
            class.bytes += bytes;
            class.packets += bytes / 1500 + 1;
        }
    }

    /// Zero a class's counters, like a qdisc re-creation would
    pub fn reset_class_counters(&self, dev: &str, class_id: &str) {
        if let Some(class) = self
            .state()
            .links
            .get_mut(dev)
            .and_then(|l| l.classes.get_mut(class_id))
        {
            class.bytes = 0;
            class.packets = 0;
        }
    }

    /// Lose all shaping state and endpoint daemons, as after a restart of
    /// the endpoint
    pub fn reset_shaping(&self) {
        let mut state = self.state();
        state.links.retain(|name, _| !name.starts_with("ifb"));
        state.listeners.clear();
        for link in state.links.values_mut() {
            link.root = None;
            link.ingress = false;
            link.redirect = None;
            link.classes.clear();
        }
    }
}

#[async_trait]
impl CommandExecutor for SimulatedHost {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        let line = render_command(program, args);
        let (stalled, failed) = {
            let mut state = self.state();
            state.history.push(line.clone());
            (
                state.stalls.iter().any(|p| line.contains(p.as_str())),
                state.failures.iter().any(|p| line.contains(p.as_str())),
            )
        };

        if stalled {
            tokio::time::sleep(timeout).await;
            return Err(ExecError::Timeout {
                command: line,
                timeout,
            });
        }
        if failed {
            return Ok(CommandOutput::failed(1, format!("simulated failure: {}", line)));
        }

        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        let (status, stdout, stderr) = self.state().docker(&self.router, &argv);
        Ok(CommandOutput {
            status,
            stdout,
            stderr,
        })
    }
}
