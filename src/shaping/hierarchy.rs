//! Default class hierarchy and ingress redirection on the shaping endpoint
//!
//! Per physical interface:
//!
//! ```text
//! root htb 1: default 30
//! └── 1:1  rate 10gbit
//!     ├── 1:10  50mbit / 100mbit  prio 1
//!     ├── 1:20  30mbit /  80mbit  prio 2
//!     └── 1:30  unlimited         prio 3   <- per-device target
//! ingress ffff: u32 match all -> mirred egress redirect dev ifbN
//! ```
//!
//! `ifbN` carries the same layout under handle `2:`.

use tracing::{debug, info, warn};

use super::rule::UNLIMITED_RATE;
use super::ShapingError;
use crate::runtime::docker::{is_already_exists, Endpoint};
use crate::runtime::executor::CommandOutput;

/// Handle major of the downstream hierarchy
pub const DOWNSTREAM_MAJOR: &str = "1";

/// Handle major of the upstream hierarchy on the IFB device
pub const UPSTREAM_MAJOR: &str = "2";

/// Nominal ceiling of the parent class
pub const PARENT_RATE: &str = "10gbit";

/// Minor id of the class unclassified traffic lands in
pub const DEFAULT_MINOR: &str = "30";

struct LeafClass {
    minor: &'static str,
    rate: &'static str,
    ceil: &'static str,
    prio: &'static str,
}

const LEAVES: [LeafClass; 3] = [
    LeafClass {
        minor: "10",
        rate: "50mbit",
        ceil: "100mbit",
        prio: "1",
    },
    LeafClass {
        minor: "20",
        rate: "30mbit",
        ceil: "80mbit",
        prio: "2",
    },
    LeafClass {
        minor: DEFAULT_MINOR,
        rate: UNLIMITED_RATE,
        ceil: UNLIMITED_RATE,
        prio: "3",
    },
];

/// Leaf class ids under `major`, e.g. `1:10`, `1:20`, `1:30`
pub fn leaf_class_ids(major: &str) -> Vec<String> {
    LEAVES
        .iter()
        .map(|leaf| format!("{}:{}", major, leaf.minor))
        .collect()
}

fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Root qdisc, parent class and the three leaves on `device`
pub fn htb_commands(device: &str, major: &str) -> Vec<Vec<String>> {
    let handle = format!("{}:", major);
    let parent = format!("{}:1", major);

    let mut cmds = vec![
        cmd(&[
            "tc", "qdisc", "add", "dev", device, "root", "handle", &handle, "htb", "default",
            DEFAULT_MINOR,
        ]),
        cmd(&[
            "tc", "class", "add", "dev", device, "parent", &handle, "classid", &parent, "htb",
            "rate", PARENT_RATE,
        ]),
    ];

    for leaf in &LEAVES {
        let classid = format!("{}:{}", major, leaf.minor);
        cmds.push(cmd(&[
            "tc", "class", "add", "dev", device, "parent", &parent, "classid", &classid, "htb",
            "rate", leaf.rate, "ceil", leaf.ceil, "prio", leaf.prio,
        ]));
    }
    cmds
}

/// IFB link plus the ingress filter mirroring everything onto it
pub fn ingress_redirect_commands(interface: &str, ifb: &str) -> Vec<Vec<String>> {
    vec![
        cmd(&["ip", "link", "add", ifb, "type", "ifb"]),
        cmd(&["ip", "link", "set", ifb, "up"]),
        cmd(&["tc", "qdisc", "add", "dev", interface, "ingress"]),
        cmd(&[
            "tc", "filter", "add", "dev", interface, "parent", "ffff:", "protocol", "ip", "u32",
            "match", "u32", "0", "0", "flowid", "1:1", "action", "mirred", "egress", "redirect",
            "dev", ifb,
        ]),
    ]
}

pub fn teardown_commands(interface: &str, ifb: Option<&str>) -> Vec<Vec<String>> {
    let mut cmds = vec![
        cmd(&["tc", "qdisc", "del", "dev", interface, "root"]),
        cmd(&["tc", "qdisc", "del", "dev", interface, "ingress"]),
    ];
    if let Some(ifb) = ifb {
        cmds.push(cmd(&["ip", "link", "del", ifb]));
    }
    cmds
}

/// A failed `add` for something that is already there
pub fn is_benign_failure(output: &CommandOutput) -> bool {
    is_already_exists(&output.combined())
}

/// What initialization achieved on one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOutcome {
    /// Upstream shaping is available through the IFB device
    pub upstream: bool,
    pub warnings: Vec<String>,
}

async fn run_tolerant(endpoint: &Endpoint, device: &str, command: &[String]) -> Result<(), ShapingError> {
    let out = endpoint
        .run(command)
        .await
        .map_err(|e| ShapingError::CommandFailure {
            device: device.to_string(),
            message: e.to_string(),
        })?;
    if out.success() || is_benign_failure(&out) {
        Ok(())
    } else {
        Err(ShapingError::CommandFailure {
            device: device.to_string(),
            message: format!("{}: {}", command.join(" "), out.combined()),
        })
    }
}

/// Create the default hierarchy on `interface` and, best effort, the
/// ingress redirect through `ifb` with its own hierarchy.
///
/// Idempotent: re-running on an initialized interface succeeds. Downstream
/// failures are errors; upstream failures only clear `upstream`.
pub async fn initialize(endpoint: &Endpoint, interface: &str, ifb: &str) -> Result<InitOutcome, ShapingError> {
    for command in htb_commands(interface, DOWNSTREAM_MAJOR) {
        run_tolerant(endpoint, interface, &command).await?;
    }

    let mut warnings = Vec::new();
    let upstream_cmds = ingress_redirect_commands(interface, ifb)
        .into_iter()
        .chain(htb_commands(ifb, UPSTREAM_MAJOR));
    for command in upstream_cmds {
        if let Err(e) = run_tolerant(endpoint, ifb, &command).await {
            warn!("Upstream shaping unavailable on {}: {}", interface, e);
            warnings.push(e.to_string());
            break;
        }
    }

    let upstream = warnings.is_empty();
    info!(
        "Initialized shaping on {} (upstream via {}: {})",
        interface, ifb, upstream
    );
    Ok(InitOutcome { upstream, warnings })
}

/// A failed `del` for something that is already gone
pub fn is_absent(output: &CommandOutput) -> bool {
    let lower = output.combined().to_lowercase();
    lower.contains("cannot find device")
        || lower.contains("no such file")
        || lower.contains("handle of zero")
        || lower.contains("invalid handle")
}

async fn run_removal(endpoint: &Endpoint, device: &str, command: &[String]) -> Result<(), ShapingError> {
    let failure = |message: String| ShapingError::CommandFailure {
        device: device.to_string(),
        message: format!("{}: {}", command.join(" "), message),
    };
    match endpoint.run(command).await {
        Ok(out) if out.success() => Ok(()),
        Ok(out) if is_absent(&out) => {
            debug!("already gone: {}", command.join(" "));
            Ok(())
        }
        Ok(out) => Err(failure(out.combined())),
        Err(e) => Err(failure(e.to_string())),
    }
}

/// Remove everything `initialize` created. Every command is attempted;
/// anything already gone counts as removed and the rest is returned.
pub async fn teardown(endpoint: &Endpoint, interface: &str, ifb: Option<&str>) -> Vec<ShapingError> {
    let mut errors = Vec::new();
    for command in teardown_commands(interface, ifb) {
        let device = match (command.first().map(String::as_str), ifb) {
            (Some("ip"), Some(ifb)) => ifb,
            _ => interface,
        };
        if let Err(e) = run_removal(endpoint, device, &command).await {
            errors.push(e);
        }
    }
    errors
}

/// Delete the IFB device alone, for a device whose interface is unknown
pub async fn remove_ifb(endpoint: &Endpoint, ifb: &str) -> Result<(), ShapingError> {
    run_removal(endpoint, ifb, &cmd(&["ip", "link", "del", ifb])).await
}

/// Tear down and initialize again, dropping every applied limit
pub async fn reinitialize(endpoint: &Endpoint, interface: &str, ifb: &str) -> Result<InitOutcome, ShapingError> {
    for e in teardown(endpoint, interface, Some(ifb)).await {
        warn!("Teardown before reinitializing {}: {}", interface, e);
    }
    initialize(endpoint, interface, ifb).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(cmds: &[Vec<String>]) -> Vec<String> {
        cmds.iter().map(|c| c.join(" ")).collect()
    }

    #[test]
    fn test_downstream_hierarchy() {
        assert_eq!(
            lines(&htb_commands("eth1", DOWNSTREAM_MAJOR)),
            vec![
                "tc qdisc add dev eth1 root handle 1: htb default 30",
                "tc class add dev eth1 parent 1: classid 1:1 htb rate 10gbit",
                "tc class add dev eth1 parent 1:1 classid 1:10 htb rate 50mbit ceil 100mbit prio 1",
                "tc class add dev eth1 parent 1:1 classid 1:20 htb rate 30mbit ceil 80mbit prio 2",
                "tc class add dev eth1 parent 1:1 classid 1:30 htb rate 1gbit ceil 1gbit prio 3",
            ]
        );
    }

    #[test]
    fn test_upstream_hierarchy_uses_major_two() {
        let cmds = lines(&htb_commands("ifb1", UPSTREAM_MAJOR));
        assert_eq!(cmds[0], "tc qdisc add dev ifb1 root handle 2: htb default 30");
        assert!(cmds[4].contains("parent 2:1 classid 2:30"));
    }

    #[test]
    fn test_ingress_redirect() {
        let cmds = lines(&ingress_redirect_commands("eth1", "ifb1"));
        assert_eq!(cmds[0], "ip link add ifb1 type ifb");
        assert_eq!(cmds[1], "ip link set ifb1 up");
        assert_eq!(cmds[2], "tc qdisc add dev eth1 ingress");
        assert_eq!(
            cmds[3],
            "tc filter add dev eth1 parent ffff: protocol ip u32 match u32 0 0 flowid 1:1 \
             action mirred egress redirect dev ifb1"
        );
    }

    #[test]
    fn test_teardown_commands() {
        assert_eq!(teardown_commands("eth2", None).len(), 2);
        assert_eq!(
            lines(&teardown_commands("eth2", Some("ifb2")))[2],
            "ip link del ifb2"
        );
    }

    #[test]
    fn test_benign_failure() {
        assert!(is_benign_failure(&CommandOutput::failed(2, "RTNETLINK answers: File exists")));
        assert!(!is_benign_failure(&CommandOutput::failed(1, "Cannot find device \"eth9\"")));
    }

    #[test]
    fn test_absent_outcomes() {
        assert!(is_absent(&CommandOutput::failed(1, "Cannot find device \"ifb3\"")));
        assert!(is_absent(&CommandOutput::failed(2, "RTNETLINK answers: No such file or directory")));
        assert!(is_absent(&CommandOutput::failed(2, "Error: Cannot delete qdisc with handle of zero.")));
        assert!(!is_absent(&CommandOutput::failed(2, "RTNETLINK answers: Operation not permitted")));
    }

    #[test]
    fn test_leaf_class_ids() {
        assert_eq!(leaf_class_ids("2"), vec!["2:10", "2:20", "2:30"]);
    }
}
