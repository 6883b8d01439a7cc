//! Desired-state rows: clusters and their devices

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::shaping::ShapingTarget;
use crate::topology::Topology;

/// Device lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl DeviceStatus {
    /// Legal edges of the lifecycle state machine
    pub fn can_transition_to(self, next: DeviceStatus) -> bool {
        use DeviceStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Error, Stopping)
                | (Stopped, Stopping)
                | (_, Error)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Stopped => "stopped",
            DeviceStatus::Starting => "starting",
            DeviceStatus::Running => "running",
            DeviceStatus::Stopping => "stopping",
            DeviceStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status change together with the data that travels with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    Starting,
    /// Provisioned; interfaces are now known
    Running {
        interface: String,
        ifb_device: Option<String>,
    },
    Stopping,
    /// Torn down; interfaces are cleared
    Stopped,
    /// Failed; keeps any interface discovered so a later destroy can clean it
    Error {
        message: String,
        interface: Option<String>,
    },
}

impl StatusChange {
    pub fn target(&self) -> DeviceStatus {
        match self {
            StatusChange::Starting => DeviceStatus::Starting,
            StatusChange::Running { .. } => DeviceStatus::Running,
            StatusChange::Stopping => DeviceStatus::Stopping,
            StatusChange::Stopped => DeviceStatus::Stopped,
            StatusChange::Error { .. } => DeviceStatus::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: u64,
    pub cluster_id: u64,
    pub name: String,
    /// Display category only
    pub device_type: String,
    pub slot: u16,
    pub subnet: String,
    pub network_name: String,
    pub container_name: String,
    pub ip_address: String,
    pub router_ip: String,
    /// Physical interface on the shaping endpoint
    pub interface_name: Option<String>,
    /// Paired ingress-redirect device
    pub ifb_device: Option<String>,
    pub status: DeviceStatus,
    pub error_message: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    pub fn from_topology(
        id: u64,
        cluster_id: u64,
        name: &str,
        device_type: &str,
        topo: Topology,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            cluster_id,
            name: name.to_string(),
            device_type: device_type.to_string(),
            slot: topo.slot,
            subnet: topo.subnet,
            network_name: topo.network_name,
            container_name: topo.container_name,
            ip_address: topo.device_ip,
            router_ip: topo.router_ip,
            interface_name: None,
            ifb_device: None,
            status: DeviceStatus::Stopped,
            error_message: None,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Where shaping commands for this device go, once an interface is known
    pub fn shaping_target(&self) -> Option<ShapingTarget> {
        self.interface_name.as_ref().map(|interface| ShapingTarget {
            interface: interface.clone(),
            ifb_device: self.ifb_device.clone(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.status == DeviceStatus::Running
    }

    /// Apply a validated change in place
    pub(crate) fn apply_change(&mut self, change: StatusChange) {
        let now = Utc::now();
        self.status = change.target();
        self.updated_at = now;
        match change {
            StatusChange::Starting | StatusChange::Stopping => {}
            StatusChange::Running {
                interface,
                ifb_device,
            } => {
                self.interface_name = Some(interface);
                self.ifb_device = ifb_device;
                self.error_message = None;
                self.last_synced_at = Some(now);
            }
            StatusChange::Stopped => {
                self.interface_name = None;
                self.ifb_device = None;
                self.error_message = None;
                self.last_synced_at = Some(now);
            }
            StatusChange::Error { message, interface } => {
                if interface.is_some() {
                    self.interface_name = interface;
                }
                self.error_message = Some(message);
            }
        }
    }
}

/// Request body for creating a cluster
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewCluster {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
}

/// Request body for updating a cluster
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClusterUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Request body for creating a device
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewDevice {
    pub name: String,
    #[serde(default)]
    pub device_type: Option<String>,
}

/// Everything the store persists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub next_cluster_id: u64,
    #[serde(default)]
    pub next_device_id: u64,
    #[serde(default)]
    pub clusters: Vec<Cluster>,
    #[serde(default)]
    pub devices: Vec<Device>,
}

impl StoreState {
    pub fn cluster(&self, id: u64) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.id == id)
    }

    pub fn device(&self, id: u64) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn device_by_container(&self, container: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.container_name == container)
    }

    pub fn devices_in(&self, cluster_id: u64) -> impl Iterator<Item = &Device> {
        self.devices.iter().filter(move |d| d.cluster_id == cluster_id)
    }

    pub fn used_slots(&self) -> impl Iterator<Item = u16> + '_ {
        self.devices.iter().map(|d| d.slot)
    }

    pub fn active_cluster_ids(&self) -> Vec<u64> {
        self.clusters
            .iter()
            .filter(|c| c.active)
            .map(|c| c.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeviceStatus::*;

    #[test]
    fn test_legal_transitions() {
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Error.can_transition_to(Stopping));
        assert!(Stopped.can_transition_to(Stopping));
        for status in [Stopped, Starting, Running, Stopping, Error] {
            assert!(status.can_transition_to(Error));
        }
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Running.can_transition_to(Stopped));
        assert!(!Error.can_transition_to(Running));
        assert!(!Error.can_transition_to(Starting));
        assert!(!Starting.can_transition_to(Stopped));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Running).unwrap(), "\"running\"");
        let parsed: DeviceStatus = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(parsed, Error);
    }

    fn device() -> Device {
        let naming = crate::config::NamingConfig::default();
        let topo = Topology::for_slot(&naming, "edge", "cam1", 1);
        Device::from_topology(1, 1, "cam1", "camera", topo)
    }

    #[test]
    fn test_running_sets_and_stopped_clears_interfaces() {
        let mut d = device();
        assert_eq!(d.status, Stopped);
        assert!(d.shaping_target().is_none());

        d.apply_change(StatusChange::Starting);
        d.apply_change(StatusChange::Running {
            interface: "eth1".to_string(),
            ifb_device: Some("ifb1".to_string()),
        });
        let target = d.shaping_target().unwrap();
        assert_eq!(target.interface, "eth1");
        assert_eq!(target.ifb_device.as_deref(), Some("ifb1"));
        assert!(d.last_synced_at.is_some());

        d.apply_change(StatusChange::Stopping);
        d.apply_change(StatusChange::Stopped);
        assert_eq!(d.interface_name, None);
        assert_eq!(d.ifb_device, None);
    }

    #[test]
    fn test_error_keeps_discovered_interface() {
        let mut d = device();
        d.apply_change(StatusChange::Starting);
        d.apply_change(StatusChange::Error {
            message: "container failed".to_string(),
            interface: Some("eth3".to_string()),
        });
        assert_eq!(d.status, Error);
        assert_eq!(d.interface_name.as_deref(), Some("eth3"));
        assert_eq!(d.error_message.as_deref(), Some("container failed"));
    }
}
