//! Rule to `tc` command translation

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::hierarchy::{DOWNSTREAM_MAJOR, UPSTREAM_MAJOR};
use super::rule::{validate_class_id, BandwidthRule, RatePair};
use super::ShapingError;
use crate::runtime::docker::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Endpoint to device, shaped on the physical interface
    Downstream,
    /// Device to endpoint, shaped on the IFB device
    Upstream,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Downstream => write!(f, "downstream"),
            Direction::Upstream => write!(f, "upstream"),
        }
    }
}

/// Resolved interfaces of one device on the shaping endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapingTarget {
    pub interface: String,
    /// Absent when ingress redirection could not be set up
    pub ifb_device: Option<String>,
}

/// One `tc class change` invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapingOp {
    pub direction: Direction,
    pub device: String,
    pub parent: String,
    pub class_id: String,
    pub rate: String,
    pub ceil: String,
}

impl ShapingOp {
    fn change(direction: Direction, device: &str, major: &str, minor: &str, pair: RatePair) -> Self {
        Self {
            direction,
            device: device.to_string(),
            parent: format!("{}:1", major),
            class_id: format!("{}:{}", major, minor),
            rate: pair.rate,
            ceil: pair.ceil,
        }
    }

    /// Command line run inside the shaping endpoint
    pub fn to_args(&self) -> Vec<String> {
        [
            "tc", "class", "change", "dev", &self.device, "parent", &self.parent, "classid",
            &self.class_id, "htb", "rate", &self.rate, "ceil", &self.ceil,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

fn minor_of(class_id: &str) -> &str {
    class_id.split_once(':').map(|(_, minor)| minor).unwrap_or(class_id)
}

/// The same leaf class on the IFB hierarchy: `1:30` becomes `2:30`
pub fn upstream_class_id(class_id: &str) -> String {
    format!("{}:{}", UPSTREAM_MAJOR, minor_of(class_id))
}

/// Build the ordered ops realizing `rule` on `target`.
///
/// Always one downstream op. One upstream op follows only when the device has
/// an IFB device and the rule sets an upstream field. Values are not parsed.
pub fn translate(rule: &BandwidthRule, target: &ShapingTarget) -> Result<Vec<ShapingOp>, ShapingError> {
    validate_class_id(&rule.class_id)?;
    if target.interface.trim().is_empty() {
        return Err(ShapingError::Validation(format!(
            "no interface known for {}",
            rule.client
        )));
    }

    let minor = minor_of(&rule.class_id);
    let mut ops = vec![ShapingOp::change(
        Direction::Downstream,
        &target.interface,
        DOWNSTREAM_MAJOR,
        minor,
        rule.downstream()?,
    )];

    match (rule.upstream()?, &target.ifb_device) {
        (Some(pair), Some(ifb)) => {
            ops.push(ShapingOp::change(Direction::Upstream, ifb, UPSTREAM_MAJOR, minor, pair));
        }
        (Some(_), None) => {
            debug!(
                "{} has no ingress device, upstream limits not applied",
                rule.client
            );
        }
        (None, _) => {}
    }

    Ok(ops)
}

/// Result of running one op
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpOutcome {
    pub op: ShapingOp,
    pub result: Result<(), ShapingError>,
}

impl OpOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Execute ops in order. A failing op does not stop the ones after it.
pub async fn apply_ops(endpoint: &Endpoint, ops: &[ShapingOp]) -> Vec<OpOutcome> {
    let mut outcomes = Vec::with_capacity(ops.len());
    for op in ops {
        let result = match endpoint.run(&op.to_args()).await {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(ShapingError::CommandFailure {
                device: op.device.clone(),
                message: out.combined(),
            }),
            Err(e) => Err(ShapingError::CommandFailure {
                device: op.device.clone(),
                message: e.to_string(),
            }),
        };
        if let Err(e) = &result {
            warn!("{} shaping failed: {}", op.direction, e);
        }
        outcomes.push(OpOutcome {
            op: op.clone(),
            result,
        });
    }
    outcomes
}
