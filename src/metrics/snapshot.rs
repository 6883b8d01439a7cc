//! Snapshot types broadcast to metrics subscribers

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rules::ActiveRule;

/// One leaf class in one direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassStats {
    pub class_id: String,
    pub rate: String,
    pub ceil: String,
    pub bytes: u64,
    pub packets: u64,
    pub drops: u64,
    pub overlimits: u64,
    pub bandwidth_mbps: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectionalStats {
    pub bandwidth_mbps: f64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
    /// Bandwidth against the low class ceiling, 0 to 100
    pub utilization_percent: f64,
    pub classes: Vec<ClassStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceStats {
    /// Physical interface on the shaping endpoint
    pub name: String,
    /// Device name
    pub client: String,
    pub container: String,
    pub ifb_device: Option<String>,
    pub downstream: DirectionalStats,
    /// Absent when the device has no IFB device or it could not be read
    pub upstream: Option<DirectionalStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Device owning the remote address, when known
    pub client: Option<String>,
    pub protocol: String,
    pub local_addr: String,
    pub remote_addr: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Keyed by physical interface
    pub interfaces: BTreeMap<String, InterfaceStats>,
    pub connections: Vec<Connection>,
    pub rules: Vec<ActiveRule>,
}

impl MetricsSnapshot {
    pub fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            interfaces: BTreeMap::new(),
            connections: Vec::new(),
            rules: Vec::new(),
        }
    }
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}
