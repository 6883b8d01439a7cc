//! Resource naming and slot allocation
//!
//! Every device owns one slot. The slot determines its subnet, its static
//! addresses and the ingress-redirect device paired with it on the shaping
//! endpoint. Allocation never relies on an in-memory counter: the set of used
//! slots is recomputed from the persisted device rows on every call.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::NamingConfig;

/// Host octet of the device container inside its subnet
pub const DEVICE_HOST_OCTET: u8 = 10;

/// Host octet of the shaping endpoint inside every device subnet
pub const ROUTER_HOST_OCTET: u8 = 254;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("No free topology slot in range {min}..={max}")]
    ResourceExhausted { min: u16, max: u16 },
}

/// Everything derived from a device's identity and slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub slot: u16,
    /// e.g. "10.10.3.0/24"
    pub subnet: String,
    /// e.g. "10.10.3.10"
    pub device_ip: String,
    /// e.g. "10.10.3.254"
    pub router_ip: String,
    pub network_name: String,
    pub container_name: String,
    /// Ingress-redirect device paired with this slot, e.g. "ifb3"
    pub ifb_device: String,
}

impl Topology {
    /// Derive the full topology for a device. Pure function of its inputs.
    pub fn for_slot(naming: &NamingConfig, cluster: &str, device: &str, slot: u16) -> Self {
        let base = &naming.subnet_base;
        Self {
            slot,
            subnet: format!("{}.{}.0/24", base, slot),
            device_ip: format!("{}.{}.{}", base, slot, DEVICE_HOST_OCTET),
            router_ip: format!("{}.{}.{}", base, slot, ROUTER_HOST_OCTET),
            network_name: network_name(&naming.prefix, cluster, device),
            container_name: container_name(&naming.prefix, cluster, device),
            ifb_device: ifb_device_name(slot),
        }
    }
}

/// Lower-case a name and replace anything outside `[a-z0-9-]` with `-`
pub fn sanitize(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

pub fn container_name(prefix: &str, cluster: &str, device: &str) -> String {
    format!("{}_{}_{}", prefix, sanitize(cluster), sanitize(device))
}

pub fn network_name(prefix: &str, cluster: &str, device: &str) -> String {
    format!("{}_net_{}_{}", prefix, sanitize(cluster), sanitize(device))
}

/// Network that belongs to a managed container name, used for orphan cleanup
pub fn network_for_container(prefix: &str, container: &str) -> Option<String> {
    container
        .strip_prefix(&format!("{}_", prefix))
        .map(|rest| format!("{}_net_{}", prefix, rest))
}

pub fn ifb_device_name(slot: u16) -> String {
    format!("ifb{}", slot)
}

/// Slot allocator over a bounded, inclusive range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAllocator {
    min: u16,
    max: u16,
}

impl SlotAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn from_naming(naming: &NamingConfig) -> Self {
        Self::new(naming.slot_min, naming.slot_max)
    }

    /// First slot in range that is not in `used`.
    ///
    /// Callers must hold the lock that guards the rows `used` was computed
    /// from until the returned slot is recorded.
    pub fn allocate<I>(&self, used: I) -> Result<u16, AllocError>
    where
        I: IntoIterator<Item = u16>,
    {
        let used: BTreeSet<u16> = used.into_iter().collect();
        (self.min..=self.max)
            .find(|slot| !used.contains(slot))
            .ok_or(AllocError::ResourceExhausted {
                min: self.min,
                max: self.max,
            })
    }

    pub fn capacity(&self) -> usize {
        (self.max - self.min + 1) as usize
    }
}
