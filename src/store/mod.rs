//! Desired-state store
//!
//! A single `RwLock` guards the whole state so every read is a consistent
//! snapshot. Mutations are applied to a copy, written to disk, then
//! committed, so memory never runs ahead of the file.

pub mod models;

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::NamingConfig;
use crate::topology::{container_name, sanitize, AllocError, SlotAllocator, Topology};

pub use models::{
    Cluster, ClusterUpdate, Device, DeviceStatus, NewCluster, NewDevice, StatusChange, StoreState,
};

/// Errors that can occur in the desired-state store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Cluster {0} not found")]
    ClusterNotFound(u64),

    #[error("Device '{0}' not found")]
    DeviceNotFound(String),

    #[error("Device '{device}' cannot go from {from} to {to}")]
    InvalidTransition {
        device: String,
        from: DeviceStatus,
        to: DeviceStatus,
    },

    #[error(transparent)]
    Exhausted(#[from] AllocError),

    #[error("State file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("State file is corrupt: {0}")]
    Parse(String),
}

/// Serialize `value` as pretty JSON and replace `path` atomically
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let content = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp_path = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(&content).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&temp_path, path).await
}

fn require_name(kind: &str, name: &str) -> Result<String, StoreError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || sanitize(trimmed).chars().all(|c| c == '-') {
        return Err(StoreError::Validation(format!(
            "{} name must contain a letter or digit",
            kind
        )));
    }
    Ok(trimmed.to_string())
}

/// Clusters and devices, optionally backed by a JSON file
pub struct Store {
    inner: RwLock<StoreState>,
    path: Option<PathBuf>,
    naming: NamingConfig,
}

impl Store {
    /// Store that lives only in memory
    pub fn in_memory(naming: NamingConfig) -> Self {
        Self {
            inner: RwLock::new(StoreState::default()),
            path: None,
            naming,
        }
    }

    /// Load the state file, starting empty when it does not exist yet
    pub async fn open(path: impl Into<PathBuf>, naming: NamingConfig) -> Result<Self, StoreError> {
        let path = path.into();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => StoreState::default(),
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| StoreError::Parse(e.to_string()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(e.into()),
        };

        info!(
            "Loaded {} clusters and {} devices from {}",
            state.clusters.len(),
            state.devices.len(),
            path.display()
        );

        Ok(Self {
            inner: RwLock::new(state),
            path: Some(path),
            naming,
        })
    }

    pub fn naming(&self) -> &NamingConfig {
        &self.naming
    }

    /// Point-in-time copy of the whole state
    pub async fn snapshot(&self) -> StoreState {
        self.inner.read().await.clone()
    }

    /// Apply `f` to a copy of the state, persist it, then commit
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.inner.write().await;
        let mut next = guard.clone();
        let value = f(&mut next)?;
        if let Some(path) = &self.path {
            write_json_atomic(path, &next).await?;
            debug!("State persisted to {}", path.display());
        }
        *guard = next;
        Ok(value)
    }

    // =========================================================================
    // Clusters
    // =========================================================================

    pub async fn list_clusters(&self) -> Vec<Cluster> {
        self.inner.read().await.clusters.clone()
    }

    pub async fn get_cluster(&self, id: u64) -> Result<Cluster, StoreError> {
        self.inner
            .read()
            .await
            .cluster(id)
            .cloned()
            .ok_or(StoreError::ClusterNotFound(id))
    }

    pub async fn create_cluster(&self, req: NewCluster) -> Result<Cluster, StoreError> {
        let name = require_name("Cluster", &req.name)?;
        self.mutate(|state| {
            if state.clusters.iter().any(|c| c.name == name) {
                return Err(StoreError::Conflict(format!(
                    "cluster '{}' already exists",
                    name
                )));
            }
            state.next_cluster_id += 1;
            let now = Utc::now();
            let cluster = Cluster {
                id: state.next_cluster_id,
                name,
                description: req.description,
                active: req.active.unwrap_or(true),
                created_at: now,
                updated_at: now,
            };
            state.clusters.push(cluster.clone());
            Ok(cluster)
        })
        .await
    }

    /// Rename or re-describe a cluster. Existing device resources keep the
    /// names they were created with.
    pub async fn update_cluster(&self, id: u64, req: ClusterUpdate) -> Result<Cluster, StoreError> {
        let name = req.name.as_deref().map(|n| require_name("Cluster", n)).transpose()?;
        self.mutate(|state| {
            if let Some(name) = &name {
                if state.clusters.iter().any(|c| c.id != id && &c.name == name) {
                    return Err(StoreError::Conflict(format!(
                        "cluster '{}' already exists",
                        name
                    )));
                }
            }
            let cluster = state
                .clusters
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or(StoreError::ClusterNotFound(id))?;
            if let Some(name) = name {
                cluster.name = name;
            }
            if req.description.is_some() {
                cluster.description = req.description;
            }
            cluster.updated_at = Utc::now();
            Ok(cluster.clone())
        })
        .await
    }

    pub async fn set_cluster_active(&self, id: u64, active: bool) -> Result<Cluster, StoreError> {
        self.mutate(|state| {
            let cluster = state
                .clusters
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or(StoreError::ClusterNotFound(id))?;
            cluster.active = active;
            cluster.updated_at = Utc::now();
            Ok(cluster.clone())
        })
        .await
    }

    /// Delete a cluster and its device rows. Returns the removed devices so
    /// the caller can tear their infrastructure down.
    pub async fn delete_cluster(&self, id: u64) -> Result<(Cluster, Vec<Device>), StoreError> {
        self.mutate(|state| {
            let pos = state
                .clusters
                .iter()
                .position(|c| c.id == id)
                .ok_or(StoreError::ClusterNotFound(id))?;
            let cluster = state.clusters.remove(pos);
            let (removed, kept): (Vec<Device>, Vec<Device>) = std::mem::take(&mut state.devices)
                .into_iter()
                .partition(|d| d.cluster_id == id);
            state.devices = kept;
            Ok((cluster, removed))
        })
        .await
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// All devices, or those of one cluster
    pub async fn list_devices(&self, cluster_id: Option<u64>) -> Result<Vec<Device>, StoreError> {
        let state = self.inner.read().await;
        match cluster_id {
            Some(id) => {
                if state.cluster(id).is_none() {
                    return Err(StoreError::ClusterNotFound(id));
                }
                Ok(state.devices_in(id).cloned().collect())
            }
            None => Ok(state.devices.clone()),
        }
    }

    pub async fn get_device(&self, id: u64) -> Result<Device, StoreError> {
        self.inner
            .read()
            .await
            .device(id)
            .cloned()
            .ok_or_else(|| StoreError::DeviceNotFound(id.to_string()))
    }

    pub async fn find_by_container(&self, container: &str) -> Option<Device> {
        self.inner
            .read()
            .await
            .device_by_container(container)
            .cloned()
    }

    /// Create a device row, allocating its slot and names eagerly.
    ///
    /// The slot is chosen under the write lock from the slots of the rows
    /// present at that moment, so two concurrent creates never share one.
    pub async fn create_device(&self, cluster_id: u64, req: NewDevice) -> Result<Device, StoreError> {
        let name = require_name("Device", &req.name)?;
        let device_type = req
            .device_type
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "generic".to_string());
        let naming = self.naming.clone();

        self.mutate(|state| {
            let cluster = state
                .cluster(cluster_id)
                .ok_or(StoreError::ClusterNotFound(cluster_id))?
                .clone();

            if state.devices_in(cluster_id).any(|d| d.name == name) {
                return Err(StoreError::Conflict(format!(
                    "device '{}' already exists in cluster '{}'",
                    name, cluster.name
                )));
            }
            let container = container_name(&naming.prefix, &cluster.name, &name);
            if state.device_by_container(&container).is_some() {
                return Err(StoreError::Conflict(format!(
                    "container name '{}' is already taken",
                    container
                )));
            }

            let slot = SlotAllocator::from_naming(&naming).allocate(state.used_slots())?;
            let topo = Topology::for_slot(&naming, &cluster.name, &name, slot);

            state.next_device_id += 1;
            let device = Device::from_topology(state.next_device_id, cluster_id, &name, &device_type, topo);
            state.devices.push(device.clone());
            Ok(device)
        })
        .await
    }

    /// Remove a device row, releasing its slot
    pub async fn delete_device(&self, id: u64) -> Result<Device, StoreError> {
        self.mutate(|state| {
            let pos = state
                .devices
                .iter()
                .position(|d| d.id == id)
                .ok_or_else(|| StoreError::DeviceNotFound(id.to_string()))?;
            Ok(state.devices.remove(pos))
        })
        .await
    }

    /// The only way device status changes
    pub async fn transition_device(&self, id: u64, change: StatusChange) -> Result<Device, StoreError> {
        self.mutate(|state| {
            let device = state
                .devices
                .iter_mut()
                .find(|d| d.id == id)
                .ok_or_else(|| StoreError::DeviceNotFound(id.to_string()))?;
            let to = change.target();
            if !device.status.can_transition_to(to) {
                return Err(StoreError::InvalidTransition {
                    device: device.name.clone(),
                    from: device.status,
                    to,
                });
            }
            debug!("{}: {} -> {}", device.container_name, device.status, to);
            device.apply_change(change);
            Ok(device.clone())
        })
        .await
    }

    /// Resolve a rule client: a container name, or a device name that is
    /// unique across clusters
    pub async fn resolve_client(&self, client: &str) -> Result<Device, StoreError> {
        let state = self.inner.read().await;
        if let Some(device) = state.device_by_container(client) {
            return Ok(device.clone());
        }
        let mut matches = state.devices.iter().filter(|d| d.name == client);
        match (matches.next(), matches.next()) {
            (Some(device), None) => Ok(device.clone()),
            (Some(_), Some(_)) => Err(StoreError::Validation(format!(
                "client '{}' is ambiguous, use the container name",
                client
            ))),
            (None, _) => Err(StoreError::DeviceNotFound(client.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn naming(max: u16) -> NamingConfig {
        NamingConfig {
            slot_max: max,
            ..Default::default()
        }
    }

    fn new_cluster(name: &str) -> NewCluster {
        NewCluster {
            name: name.to_string(),
            description: None,
            active: None,
        }
    }

    fn new_device(name: &str) -> NewDevice {
        NewDevice {
            name: name.to_string(),
            device_type: Some("camera".to_string()),
        }
    }

    #[tokio::test]
    async fn test_cluster_crud() {
        let store = Store::in_memory(naming(10));
        let edge = store.create_cluster(new_cluster("edge")).await.unwrap();
        assert_eq!(edge.id, 1);
        assert!(edge.active);

        let dup = store.create_cluster(new_cluster("edge")).await;
        assert!(matches!(dup, Err(StoreError::Conflict(_))));

        let updated = store
            .update_cluster(
                edge.id,
                ClusterUpdate {
                    name: None,
                    description: Some("rooftop".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.description.as_deref(), Some("rooftop"));

        let inactive = store.set_cluster_active(edge.id, false).await.unwrap();
        assert!(!inactive.active);

        assert!(matches!(
            store.get_cluster(99).await,
            Err(StoreError::ClusterNotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_blank_names_rejected() {
        let store = Store::in_memory(naming(10));
        assert!(matches!(
            store.create_cluster(new_cluster("  ")).await,
            Err(StoreError::Validation(_))
        ));
        let c = store.create_cluster(new_cluster("edge")).await.unwrap();
        assert!(matches!(
            store.create_device(c.id, new_device("__")).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_create_device_allocates_topology() {
        let store = Store::in_memory(naming(10));
        let c = store.create_cluster(new_cluster("edge")).await.unwrap();
        let cam1 = store.create_device(c.id, new_device("cam1")).await.unwrap();

        assert_eq!(cam1.slot, 1);
        assert_eq!(cam1.container_name, "qc_edge_cam1");
        assert_eq!(cam1.network_name, "qc_net_edge_cam1");
        assert_eq!(cam1.ip_address, "10.10.1.10");
        assert_eq!(cam1.router_ip, "10.10.1.254");
        assert_eq!(cam1.status, DeviceStatus::Stopped);
        assert_eq!(cam1.interface_name, None);

        let dup = store.create_device(c.id, new_device("cam1")).await;
        assert!(matches!(dup, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_slot_exhaustion_and_reuse() {
        let store = Store::in_memory(naming(2));
        let c = store.create_cluster(new_cluster("edge")).await.unwrap();
        let a = store.create_device(c.id, new_device("a")).await.unwrap();
        store.create_device(c.id, new_device("b")).await.unwrap();

        let full = store.create_device(c.id, new_device("c")).await;
        assert!(matches!(full, Err(StoreError::Exhausted(_))));

        store.delete_device(a.id).await.unwrap();
        let c_dev = store.create_device(c.id, new_device("c")).await.unwrap();
        assert_eq!(c_dev.slot, a.slot);
    }

    #[tokio::test]
    async fn test_concurrent_creates_get_distinct_slots() {
        let store = std::sync::Arc::new(Store::in_memory(naming(50)));
        let cluster_id = store.create_cluster(new_cluster("edge")).await.unwrap().id;

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .create_device(cluster_id, new_device(&format!("dev{}", i)))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut slots = Vec::new();
        for h in handles {
            slots.push(h.await.unwrap().slot);
        }
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), 20);
    }

    #[tokio::test]
    async fn test_delete_cluster_cascades() {
        let store = Store::in_memory(naming(10));
        let edge = store.create_cluster(new_cluster("edge")).await.unwrap();
        let core = store.create_cluster(new_cluster("core")).await.unwrap();
        store.create_device(edge.id, new_device("cam1")).await.unwrap();
        store.create_device(edge.id, new_device("cam2")).await.unwrap();
        store.create_device(core.id, new_device("sw1")).await.unwrap();

        let (_, removed) = store.delete_cluster(edge.id).await.unwrap();
        assert_eq!(removed.len(), 2);

        let remaining = store.list_devices(None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "sw1");
        assert!(store.list_devices(Some(edge.id)).await.is_err());
    }

    #[tokio::test]
    async fn test_transition_validation() {
        let store = Store::in_memory(naming(10));
        let c = store.create_cluster(new_cluster("edge")).await.unwrap();
        let d = store.create_device(c.id, new_device("cam1")).await.unwrap();

        let err = store
            .transition_device(
                d.id,
                StatusChange::Running {
                    interface: "eth1".to_string(),
                    ifb_device: None,
                },
            )
            .await;
        assert!(matches!(err, Err(StoreError::InvalidTransition { .. })));

        store.transition_device(d.id, StatusChange::Starting).await.unwrap();
        let running = store
            .transition_device(
                d.id,
                StatusChange::Running {
                    interface: "eth1".to_string(),
                    ifb_device: Some("ifb1".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(running.status, DeviceStatus::Running);
        assert_eq!(running.interface_name.as_deref(), Some("eth1"));
    }

    #[tokio::test]
    async fn test_resolve_client() {
        let store = Store::in_memory(naming(10));
        let edge = store.create_cluster(new_cluster("edge")).await.unwrap();
        let core = store.create_cluster(new_cluster("core")).await.unwrap();
        store.create_device(edge.id, new_device("cam1")).await.unwrap();
        store.create_device(edge.id, new_device("gw")).await.unwrap();
        store.create_device(core.id, new_device("gw")).await.unwrap();

        assert_eq!(store.resolve_client("cam1").await.unwrap().container_name, "qc_edge_cam1");
        assert_eq!(store.resolve_client("qc_core_gw").await.unwrap().cluster_id, core.id);
        assert!(matches!(
            store.resolve_client("gw").await,
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            store.resolve_client("nope").await,
            Err(StoreError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = Store::open(&path, naming(10)).await.unwrap();
            let c = store.create_cluster(new_cluster("edge")).await.unwrap();
            store.create_device(c.id, new_device("cam1")).await.unwrap();
        }

        let store = Store::open(&path, naming(10)).await.unwrap();
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.clusters.len(), 1);
        assert_eq!(snapshot.devices[0].container_name, "qc_edge_cam1");

        // Ids keep counting from the persisted value
        let c2 = store.create_cluster(new_cluster("core")).await.unwrap();
        assert_eq!(c2.id, 2);
    }

    #[tokio::test]
    async fn test_corrupt_state_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            Store::open(&path, naming(10)).await,
            Err(StoreError::Parse(_))
        ));
    }
}
