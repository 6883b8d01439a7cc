//! Sync engine
//!
//! Desired state is the device rows in scope; observed state is the set of
//! running managed containers. A pass diffs the two from one store snapshot
//! and drives every difference through the lifecycle manager, a bounded
//! number at a time. One device failing never stops the others.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use super::report::{KillSummary, SyncAction, SyncPreview, SyncResult, SyncScope, TeardownReport};
use super::SyncError;
use crate::locks::KeyedLocks;
use crate::rules::RuleManager;
use crate::runtime::LifecycleManager;
use crate::store::{Device, DeviceStatus, StatusChange, Store, StoreError, StoreState};

const GLOBAL_SYNC_KEY: &str = "sync:global";

fn cluster_key(id: u64) -> String {
    format!("sync:cluster:{}", id)
}

/// The diff a pass acts on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub create: Vec<Device>,
    /// Provisioned devices that are no longer desired
    pub destroy: Vec<Device>,
    /// Managed containers without a device row
    pub orphans: Vec<String>,
    pub keep: Vec<Device>,
}

impl SyncPlan {
    /// Diff `state` against the running containers in `observed`.
    ///
    /// A cluster-scoped plan only sees containers of that cluster and
    /// containers with no device row, so it never touches another cluster.
    pub fn compute(state: &StoreState, scope: SyncScope, observed: &[String]) -> Result<Self, SyncError> {
        let desired: Vec<&Device> = match scope {
            SyncScope::Cluster(id) => {
                if state.cluster(id).is_none() {
                    return Err(SyncError::ClusterNotFound(id));
                }
                state.devices_in(id).collect()
            }
            SyncScope::Global => {
                let active: HashSet<u64> = state.active_cluster_ids().into_iter().collect();
                state
                    .devices
                    .iter()
                    .filter(|d| active.contains(&d.cluster_id))
                    .collect()
            }
        };
        let desired_names: HashSet<&str> = desired.iter().map(|d| d.container_name.as_str()).collect();

        let observed: BTreeSet<&str> = observed
            .iter()
            .map(String::as_str)
            .filter(|name| match scope {
                SyncScope::Cluster(id) => state
                    .device_by_container(name)
                    .map_or(true, |d| d.cluster_id == id),
                SyncScope::Global => true,
            })
            .collect();

        let mut plan = SyncPlan::default();
        for device in desired {
            if observed.contains(device.container_name.as_str()) {
                plan.keep.push(device.clone());
            } else {
                plan.create.push(device.clone());
            }
        }
        for name in observed {
            if desired_names.contains(name) {
                continue;
            }
            match state.device_by_container(name) {
                Some(device) => plan.destroy.push(device.clone()),
                None => plan.orphans.push(name.to_string()),
            }
        }

        plan.create.sort_by(|a, b| a.name.cmp(&b.name));
        plan.destroy.sort_by(|a, b| a.name.cmp(&b.name));
        plan.keep.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(plan)
    }

    pub fn preview(&self) -> SyncPreview {
        let names = |devices: &[Device]| devices.iter().map(|d| d.name.clone()).collect::<Vec<_>>();
        let to_create = names(&self.create);
        let mut to_destroy = names(&self.destroy);
        to_destroy.extend(self.orphans.iter().cloned());
        to_destroy.sort();

        SyncPreview {
            total_changes: to_create.len() + to_destroy.len(),
            to_create,
            to_destroy,
            to_keep: names(&self.keep),
        }
    }

    /// A kept device whose row does not say `running` with a known interface
    fn needs_refresh(device: &Device) -> bool {
        !device.is_running() || device.interface_name.is_none()
    }
}

enum Job {
    Create(Device),
    Refresh(Device),
    Destroy(Device),
    Orphan(String),
}

type JobOutcome = (String, SyncAction, Result<(), String>);

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<Store>,
    lifecycle: LifecycleManager,
    rules: RuleManager,
    sync_locks: KeyedLocks,
    device_locks: KeyedLocks,
    max_parallel: usize,
}

impl Reconciler {
    pub fn new(
        store: Arc<Store>,
        lifecycle: LifecycleManager,
        rules: RuleManager,
        device_locks: KeyedLocks,
        max_parallel: usize,
    ) -> Self {
        Self {
            store,
            lifecycle,
            rules,
            sync_locks: KeyedLocks::new(),
            device_locks,
            max_parallel: max_parallel.max(1),
        }
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    async fn ensure_cluster(&self, scope: SyncScope) -> Result<(), SyncError> {
        if let SyncScope::Cluster(id) = scope {
            if let Err(StoreError::ClusterNotFound(_)) = self.store.get_cluster(id).await {
                return Err(SyncError::ClusterNotFound(id));
            }
        }
        Ok(())
    }

    async fn plan(&self, scope: SyncScope) -> Result<SyncPlan, SyncError> {
        let state = self.store.snapshot().await;
        let observed = self.lifecycle.list_provisioned().await?;
        SyncPlan::compute(&state, scope, &observed)
    }

    /// Read-only diff for `scope`
    pub async fn preview(&self, scope: SyncScope) -> Result<SyncPreview, SyncError> {
        self.ensure_cluster(scope).await?;
        Ok(self.plan(scope).await?.preview())
    }

    /// Take the sync locks `scope` needs, or fail if a pass already holds one
    async fn lock_scope(&self, scope: SyncScope) -> Result<Vec<OwnedMutexGuard<()>>, SyncError> {
        let keys: Vec<String> = match scope {
            SyncScope::Cluster(id) => vec![cluster_key(id)],
            SyncScope::Global => self
                .store
                .list_clusters()
                .await
                .iter()
                .map(|c| cluster_key(c.id))
                .chain(std::iter::once(GLOBAL_SYNC_KEY.to_string()))
                .collect(),
        };
        self.sync_locks
            .try_lock_all(keys.iter().map(String::as_str))
            .ok_or_else(|| SyncError::InProgress(scope.to_string()))
    }

    /// Converge `scope`. Only an unknown cluster or a concurrent pass on the
    /// same scope fails the call; everything else is reported per item.
    pub async fn execute(&self, scope: SyncScope) -> Result<SyncResult, SyncError> {
        self.ensure_cluster(scope).await?;
        let _guards = self.lock_scope(scope).await?;
        let plan = self.plan(scope).await?;

        info!(
            "Sync of {}: {} to create, {} to destroy, {} to keep",
            scope,
            plan.create.len(),
            plan.destroy.len() + plan.orphans.len(),
            plan.keep.len()
        );

        let mut result = SyncResult {
            kept: plan.keep.iter().map(|d| d.name.clone()).collect(),
            ..Default::default()
        };

        let mut jobs: Vec<Job> = Vec::new();
        jobs.extend(plan.destroy.into_iter().map(Job::Destroy));
        jobs.extend(plan.orphans.into_iter().map(Job::Orphan));
        jobs.extend(plan.create.into_iter().map(Job::Create));
        jobs.extend(
            plan.keep
                .into_iter()
                .filter(|d| SyncPlan::needs_refresh(d))
                .map(Job::Refresh),
        );

        let outcomes: Vec<JobOutcome> = stream::iter(jobs)
            .map(|job| self.run_job(job))
            .buffer_unordered(self.max_parallel)
            .collect()
            .await;

        for (name, action, outcome) in outcomes {
            result.record(name, action, outcome);
        }
        let result = result.finish();

        info!(
            "Sync of {} done: {} ok, {} failed",
            scope, result.success_count, result.error_count
        );
        self.sync_locks.prune();
        self.device_locks.prune();
        Ok(result)
    }

    async fn run_job(&self, job: Job) -> JobOutcome {
        match job {
            Job::Create(device) => {
                let outcome = self.provision(&device).await.map(|_| ());
                (device.name, SyncAction::Create, outcome.map_err(|e| e.to_string()))
            }
            Job::Refresh(device) => {
                let outcome = self.provision(&device).await.map(|_| ());
                (device.name, SyncAction::Update, outcome.map_err(|e| e.to_string()))
            }
            Job::Destroy(device) => {
                let outcome = self.decommission(&device).await.map(|_| ());
                (device.name, SyncAction::Destroy, outcome.map_err(|e| e.to_string()))
            }
            Job::Orphan(container) => {
                let _guard = self.device_locks.lock(&container).await;
                let outcome = self.lifecycle.destroy_orphan(&container).await;
                (container, SyncAction::Destroy, outcome.map_err(|e| e.to_string()))
            }
        }
    }

    // =========================================================================
    // Per-device paths
    // =========================================================================

    /// Walk the row to `stopped` along legal edges
    async fn settle_stopped(&self, device: &Device) -> Result<Device, StoreError> {
        let steps = match device.status {
            DeviceStatus::Stopped => vec![],
            DeviceStatus::Stopping => vec![StatusChange::Stopped],
            DeviceStatus::Running | DeviceStatus::Error => {
                vec![StatusChange::Stopping, StatusChange::Stopped]
            }
            DeviceStatus::Starting => vec![
                StatusChange::Error {
                    message: "interrupted while starting".to_string(),
                    interface: None,
                },
                StatusChange::Stopping,
                StatusChange::Stopped,
            ],
        };
        let mut current = device.clone();
        for step in steps {
            current = self.store.transition_device(device.id, step).await?;
        }
        Ok(current)
    }

    /// Walk the row to `stopping` along legal edges
    async fn begin_stop(&self, device: &Device) -> Result<Device, StoreError> {
        let steps = match device.status {
            DeviceStatus::Stopping => vec![],
            DeviceStatus::Starting => vec![
                StatusChange::Error {
                    message: "interrupted while starting".to_string(),
                    interface: None,
                },
                StatusChange::Stopping,
            ],
            _ => vec![StatusChange::Stopping],
        };
        let mut current = device.clone();
        for step in steps {
            current = self.store.transition_device(device.id, step).await?;
        }
        Ok(current)
    }

    /// Create path for one device under its lock. A device in `error` is
    /// not retried.
    async fn provision(&self, device: &Device) -> Result<Device, SyncError> {
        let _guard = self.device_locks.lock(&device.container_name).await;
        let device = self.store.get_device(device.id).await?;

        if device.status == DeviceStatus::Error {
            return Err(SyncError::InvalidState(format!(
                "{} is in error state ({}), destroy it first",
                device.name,
                device.error_message.as_deref().unwrap_or("unknown error")
            )));
        }

        let device = self.settle_stopped(&device).await?;
        self.store
            .transition_device(device.id, StatusChange::Starting)
            .await?;

        match self.lifecycle.create_device(&device).await {
            Ok(provisioned) => {
                let running = self
                    .store
                    .transition_device(
                        device.id,
                        StatusChange::Running {
                            interface: provisioned.interface,
                            ifb_device: provisioned.ifb_device,
                        },
                    )
                    .await?;
                match self.rules.replay_record(&running).await {
                    Ok(true) => debug!("Restored rule for {}", running.container_name),
                    Ok(false) => {}
                    Err(e) => warn!("Rule replay for {} failed: {}", running.container_name, e),
                }
                Ok(running)
            }
            Err(e) => {
                warn!("Provisioning {} failed: {}", device.container_name, e);
                self.store
                    .transition_device(
                        device.id,
                        StatusChange::Error {
                            message: e.to_string(),
                            interface: e.interface().map(str::to_string),
                        },
                    )
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Destroy path for one device under its lock
    async fn decommission(&self, device: &Device) -> Result<Device, SyncError> {
        let _guard = self.device_locks.lock(&device.container_name).await;
        let device = match self.store.get_device(device.id).await {
            Ok(device) => device,
            Err(StoreError::DeviceNotFound(_)) => {
                // Row deleted meanwhile, the container is an orphan now
                self.lifecycle.destroy_orphan(&device.container_name).await?;
                return Ok(device.clone());
            }
            Err(e) => return Err(e.into()),
        };

        let device = self.begin_stop(&device).await?;
        match self.lifecycle.destroy_device(&device).await {
            Ok(()) => Ok(self
                .store
                .transition_device(device.id, StatusChange::Stopped)
                .await?),
            Err(e) => {
                self.store
                    .transition_device(
                        device.id,
                        StatusChange::Error {
                            message: e.to_string(),
                            interface: None,
                        },
                    )
                    .await?;
                Err(e.into())
            }
        }
    }

    // =========================================================================
    // Explicit single-device and bulk operations
    // =========================================================================

    /// Create path for one device; a no-op for a device already running
    pub async fn start_device(&self, id: u64) -> Result<Device, SyncError> {
        let device = self.store.get_device(id).await?;
        if device.is_running() && device.interface_name.is_some() {
            let status = self
                .lifecycle
                .container_status(std::slice::from_ref(&device.container_name))
                .await?;
            if status.get(&device.container_name).copied().unwrap_or(false) {
                return Ok(device);
            }
        }
        self.provision(&device).await
    }

    /// Destroy path for one device; the row and its slot stay
    pub async fn stop_device(&self, id: u64) -> Result<Device, SyncError> {
        let device = self.store.get_device(id).await?;
        self.decommission(&device).await
    }

    /// Delete the row, then tear its infrastructure down best effort
    pub async fn delete_device(&self, id: u64) -> Result<TeardownReport, SyncError> {
        let device = self.store.get_device(id).await?;
        let guard = self.device_locks.lock(&device.container_name).await;
        let device = self.store.delete_device(id).await?;
        info!("Deleted device {} (slot {} released)", device.container_name, device.slot);

        let mut report = TeardownReport {
            removed: vec![device.name.clone()],
            ..Default::default()
        };
        if let Err(e) = self.lifecycle.destroy_device(&device).await {
            report.teardown_errors.push(e.to_string());
        }
        drop(guard);
        self.device_locks.prune();
        Ok(report)
    }

    /// Delete a cluster with its rows, then tear their infrastructure down
    pub async fn delete_cluster(&self, id: u64) -> Result<TeardownReport, SyncError> {
        self.ensure_cluster(SyncScope::Cluster(id)).await?;
        let _guard = self.lock_scope(SyncScope::Cluster(id)).await?;
        let (cluster, devices) = self.store.delete_cluster(id).await?;
        info!("Deleted cluster {} with {} devices", cluster.name, devices.len());

        let outcomes: Vec<(String, Option<String>)> = stream::iter(devices)
            .map(|device| async move {
                let _guard = self.device_locks.lock(&device.container_name).await;
                let error = self.lifecycle.destroy_device(&device).await.err();
                (device.name, error.map(|e| e.to_string()))
            })
            .buffer_unordered(self.max_parallel)
            .collect()
            .await;

        self.device_locks.prune();

        let mut report = TeardownReport::default();
        for (name, error) in outcomes {
            report.removed.push(name);
            report.teardown_errors.extend(error);
        }
        report.removed.sort();
        Ok(report)
    }

    /// Force-remove every managed container and mark the affected rows
    /// `stopped`. Networks stay for the next sync.
    pub async fn kill_all(&self) -> Result<KillSummary, SyncError> {
        let report = self.lifecycle.kill_all().await?;

        let mut summary = KillSummary {
            count: report.removed.len(),
            errors: report.errors,
            ..Default::default()
        };
        for container in &report.removed {
            let Some(device) = self.store.find_by_container(container).await else {
                continue;
            };
            let _guard = self.device_locks.lock(container).await;
            let device = self.store.get_device(device.id).await?;
            if device.status != DeviceStatus::Stopped {
                self.settle_stopped(&device).await?;
                summary.devices_stopped.push(device.name);
            }
        }
        summary.containers = report.removed;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::rules::{RuleError, RuleStore};
    use crate::runtime::{DockerCli, SimulatedHost};
    use crate::shaping::BandwidthRule;
    use crate::store::{NewCluster, NewDevice};
    use std::time::Duration;

    struct Harness {
        host: Arc<SimulatedHost>,
        store: Arc<Store>,
        rules: RuleManager,
        sync: Reconciler,
    }

    fn harness() -> Harness {
        let settings = Settings::default();
        let host = Arc::new(SimulatedHost::new(&settings));
        let docker = DockerCli::new(host.clone(), "docker", Duration::from_millis(200));
        let lifecycle = LifecycleManager::new(docker, &settings).with_detect_retry(2, Duration::ZERO);
        let store = Arc::new(Store::in_memory(settings.naming.clone()));
        let device_locks = KeyedLocks::new();
        let rules = RuleManager::new(
            store.clone(),
            Arc::new(RuleStore::in_memory()),
            lifecycle.router().clone(),
            device_locks.clone(),
        );
        let sync = Reconciler::new(store.clone(), lifecycle, rules.clone(), device_locks, 5);
        Harness {
            host,
            store,
            rules,
            sync,
        }
    }

    async fn cluster(h: &Harness, name: &str) -> u64 {
        h.store
            .create_cluster(NewCluster {
                name: name.to_string(),
                description: None,
                active: None,
            })
            .await
            .unwrap()
            .id
    }

    async fn device(h: &Harness, cluster_id: u64, name: &str) -> Device {
        h.store
            .create_device(
                cluster_id,
                NewDevice {
                    name: name.to_string(),
                    device_type: Some("camera".to_string()),
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_cluster_and_sync() {
        let h = harness();
        let edge = cluster(&h, "edge").await;
        let cam1 = device(&h, edge, "cam1").await;

        let preview = h.sync.preview(SyncScope::Cluster(edge)).await.unwrap();
        assert_eq!(preview.to_create, vec!["cam1"]);
        assert_eq!(preview.total_changes, 1);

        let result = h.sync.execute(SyncScope::Cluster(edge)).await.unwrap();
        assert_eq!(result.created, vec!["cam1"]);
        assert_eq!(result.error_count, 0);

        let cam1 = h.store.get_device(cam1.id).await.unwrap();
        assert_eq!(cam1.status, DeviceStatus::Running);
        assert!(!cam1.interface_name.clone().unwrap().is_empty());
        assert_eq!(cam1.ifb_device.as_deref(), Some("ifb1"));

        let preview = h.sync.preview(SyncScope::Cluster(edge)).await.unwrap();
        assert!(preview.to_create.is_empty());
        assert_eq!(preview.to_keep, vec!["cam1"]);
    }

    #[tokio::test]
    async fn test_one_failure_in_five() {
        let h = harness();
        let edge = cluster(&h, "edge").await;
        for i in 1..=5 {
            device(&h, edge, &format!("d{}", i)).await;
        }
        h.host.fail_matching("run -d --name qc_edge_d3");

        let preview = h.sync.preview(SyncScope::Cluster(edge)).await.unwrap();
        let result = h.sync.execute(SyncScope::Cluster(edge)).await.unwrap();

        assert_eq!(result.success_count, 4);
        assert_eq!(result.error_count, 1);
        assert_eq!(result.errors[0].name, "d3");
        assert_eq!(result.errors[0].action, SyncAction::Create);

        // Every item the preview named was attempted
        let mut attempted = result.created.clone();
        attempted.extend(result.errors.iter().map(|e| e.name.clone()));
        attempted.sort();
        assert_eq!(attempted, preview.to_create);

        let d3 = h.store.resolve_client("d3").await.unwrap();
        assert_eq!(d3.status, DeviceStatus::Error);
        assert!(d3.error_message.is_some());
        assert!(!h.host.has_container("qc_edge_d3"));

        // Converged for everything that did not fail
        let provisioned = h.sync.lifecycle().list_provisioned().await.unwrap();
        assert_eq!(provisioned.len(), 4);
        assert!(!provisioned.contains(&"qc_edge_d3".to_string()));
    }

    #[tokio::test]
    async fn test_error_device_not_retried_until_destroyed() {
        let h = harness();
        let edge = cluster(&h, "edge").await;
        let cam1 = device(&h, edge, "cam1").await;
        h.host.fail_matching("run -d --name qc_edge_cam1");
        h.sync.execute(SyncScope::Cluster(edge)).await.unwrap();

        h.host.clear_faults();
        let again = h.sync.execute(SyncScope::Cluster(edge)).await.unwrap();
        assert_eq!(again.error_count, 1);
        assert!(again.errors[0].message.contains("destroy it first"));
        assert_eq!(h.host.commands_matching("run -d --name qc_edge_cam1").len(), 1);

        let stopped = h.sync.stop_device(cam1.id).await.unwrap();
        assert_eq!(stopped.status, DeviceStatus::Stopped);
        let third = h.sync.execute(SyncScope::Cluster(edge)).await.unwrap();
        assert_eq!(third.created, vec!["cam1"]);
    }

    #[tokio::test]
    async fn test_timeout_marks_device_error() {
        let h = harness();
        let edge = cluster(&h, "edge").await;
        device(&h, edge, "cam1").await;
        h.host.stall_matching("run -d --name qc_edge_cam1");

        let result = h.sync.execute(SyncScope::Cluster(edge)).await.unwrap();
        assert_eq!(result.error_count, 1);
        assert!(result.errors[0].message.contains("timed out"));
        let cam1 = h.store.resolve_client("cam1").await.unwrap();
        assert_eq!(cam1.status, DeviceStatus::Error);
    }

    #[tokio::test]
    async fn test_cluster_scope_leaves_other_clusters_alone() {
        let h = harness();
        let edge = cluster(&h, "edge").await;
        let core = cluster(&h, "core").await;
        device(&h, edge, "cam1").await;
        device(&h, core, "sw1").await;
        h.sync.execute(SyncScope::Cluster(core)).await.unwrap();
        h.host.add_container("qc_legacy_box", true);

        let preview = h.sync.preview(SyncScope::Cluster(edge)).await.unwrap();
        assert_eq!(preview.to_create, vec!["cam1"]);
        assert_eq!(preview.to_destroy, vec!["qc_legacy_box"]);
        assert!(preview.to_keep.is_empty());

        let result = h.sync.execute(SyncScope::Cluster(edge)).await.unwrap();
        assert_eq!(result.destroyed, vec!["qc_legacy_box"]);
        assert!(h.host.is_running("qc_core_sw1"));
        assert!(!h.host.has_container("qc_legacy_box"));
    }

    #[tokio::test]
    async fn test_global_sync_stops_inactive_clusters() {
        let h = harness();
        let edge = cluster(&h, "edge").await;
        let core = cluster(&h, "core").await;
        device(&h, edge, "cam1").await;
        let sw1 = device(&h, core, "sw1").await;

        let first = h.sync.execute(SyncScope::Global).await.unwrap();
        assert_eq!(first.created, vec!["cam1", "sw1"]);

        h.store.set_cluster_active(core, false).await.unwrap();
        let preview = h.sync.preview(SyncScope::Global).await.unwrap();
        assert_eq!(preview.to_destroy, vec!["sw1"]);

        let second = h.sync.execute(SyncScope::Global).await.unwrap();
        assert_eq!(second.destroyed, vec!["sw1"]);
        assert_eq!(second.kept, vec!["cam1"]);

        let sw1 = h.store.get_device(sw1.id).await.unwrap();
        assert_eq!(sw1.status, DeviceStatus::Stopped);
        assert_eq!(sw1.interface_name, None);
        assert!(!h.host.has_network("qc_net_core_sw1"));
    }

    #[tokio::test]
    async fn test_concurrent_execute_is_rejected() {
        let h = harness();
        let edge = cluster(&h, "edge").await;
        let core = cluster(&h, "core").await;

        let held = h.sync.sync_locks.try_lock(&cluster_key(edge)).unwrap();
        assert!(matches!(
            h.sync.execute(SyncScope::Cluster(edge)).await,
            Err(SyncError::InProgress(_))
        ));
        assert!(matches!(
            h.sync.execute(SyncScope::Global).await,
            Err(SyncError::InProgress(_))
        ));
        // Other clusters are independent
        assert!(h.sync.execute(SyncScope::Cluster(core)).await.is_ok());
        drop(held);
        assert!(h.sync.execute(SyncScope::Cluster(edge)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_cluster() {
        let h = harness();
        assert!(matches!(
            h.sync.preview(SyncScope::Cluster(42)).await,
            Err(SyncError::ClusterNotFound(42))
        ));
        assert!(matches!(
            h.sync.execute(SyncScope::Cluster(42)).await,
            Err(SyncError::ClusterNotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_delete_device_releases_slot() {
        let h = harness();
        let edge = cluster(&h, "edge").await;
        let cam1 = device(&h, edge, "cam1").await;
        h.sync.execute(SyncScope::Cluster(edge)).await.unwrap();

        let report = h.sync.delete_device(cam1.id).await.unwrap();
        assert!(report.teardown_errors.is_empty());
        assert!(!h.host.has_container("qc_edge_cam1"));
        assert!(!h.host.has_network("qc_net_edge_cam1"));

        let cam9 = device(&h, edge, "cam9").await;
        assert_eq!(cam9.slot, cam1.slot);
    }

    #[tokio::test]
    async fn test_delete_cluster_tears_down_devices() {
        let h = harness();
        let edge = cluster(&h, "edge").await;
        device(&h, edge, "cam1").await;
        device(&h, edge, "cam2").await;
        h.sync.execute(SyncScope::Cluster(edge)).await.unwrap();

        let report = h.sync.delete_cluster(edge).await.unwrap();
        assert_eq!(report.removed, vec!["cam1", "cam2"]);
        assert!(report.teardown_errors.is_empty());
        assert!(h.sync.lifecycle().list_provisioned().await.unwrap().is_empty());
        assert!(h.store.list_devices(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_kill_all_then_sync_restores_rules() {
        let h = harness();
        let edge = cluster(&h, "edge").await;
        let cam1 = device(&h, edge, "cam1").await;
        h.sync.execute(SyncScope::Cluster(edge)).await.unwrap();

        let mut rule = BandwidthRule::unlimited("cam1");
        rule.downstream_rate = Some("20mbit".to_string());
        rule.downstream_ceil = Some("50mbit".to_string());
        h.rules.apply(rule).await.unwrap();

        let summary = h.sync.kill_all().await.unwrap();
        assert_eq!(summary.count, 1);
        assert_eq!(summary.devices_stopped, vec!["cam1"]);
        assert!(h.host.has_network("qc_net_edge_cam1"));
        let stopped = h.store.get_device(cam1.id).await.unwrap();
        assert_eq!(stopped.status, DeviceStatus::Stopped);

        let result = h.sync.execute(SyncScope::Cluster(edge)).await.unwrap();
        assert_eq!(result.created, vec!["cam1"]);
        let cam1 = h.store.get_device(cam1.id).await.unwrap();
        assert_eq!(
            h.host.class_rates(cam1.interface_name.as_deref().unwrap(), "1:30"),
            Some(("20mbit".to_string(), "50mbit".to_string()))
        );
    }

    #[tokio::test]
    async fn test_start_and_stop_device() {
        let h = harness();
        let edge = cluster(&h, "edge").await;
        let cam1 = device(&h, edge, "cam1").await;

        let running = h.sync.start_device(cam1.id).await.unwrap();
        assert!(running.is_running());
        let again = h.sync.start_device(cam1.id).await.unwrap();
        assert_eq!(again.interface_name, running.interface_name);

        let stopped = h.sync.stop_device(cam1.id).await.unwrap();
        assert_eq!(stopped.status, DeviceStatus::Stopped);
        assert!(!h.host.has_container("qc_edge_cam1"));
    }

    #[tokio::test]
    async fn test_device_locks_are_dropped_with_the_device() {
        let h = harness();
        let edge = cluster(&h, "edge").await;
        let cam1 = device(&h, edge, "cam1").await;
        device(&h, edge, "cam2").await;
        h.sync.execute(SyncScope::Cluster(edge)).await.unwrap();
        h.rules.apply(BandwidthRule::unlimited("cam1")).await.unwrap();

        h.sync.delete_device(cam1.id).await.unwrap();
        assert_eq!(h.sync.device_locks.len(), 0);

        h.sync.execute(SyncScope::Cluster(edge)).await.unwrap();
        h.sync.delete_cluster(edge).await.unwrap();
        assert!(h.sync.device_locks.is_empty());
    }

    /// Queue `first` then `second` behind a held device lock, release it and
    /// return both results with the command history recorded after release
    async fn race_behind_lock<A, B>(h: &Harness, first: A, second: B) -> (A::Output, B::Output, Vec<String>)
    where
        A: std::future::Future + Send + 'static,
        A::Output: Send + 'static,
        B: std::future::Future + Send + 'static,
        B::Output: Send + 'static,
    {
        let guard = h.sync.device_locks.lock("qc_edge_cam1").await;
        let before = h.host.history().len();

        let first = tokio::spawn(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = tokio::spawn(second);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Both are parked on the lock and nothing reached the host
        assert!(!first.is_finished());
        assert!(!second.is_finished());
        assert_eq!(h.host.history().len(), before);

        drop(guard);
        let (a, b) = (first.await.unwrap(), second.await.unwrap());
        (a, b, h.host.history()[before..].to_vec())
    }

    fn position(history: &[String], pattern: &str) -> Option<usize> {
        history.iter().position(|line| line.contains(pattern))
    }

    #[tokio::test]
    async fn test_apply_and_stop_do_not_interleave() {
        let h = harness();
        let edge = cluster(&h, "edge").await;
        let cam1 = device(&h, edge, "cam1").await;
        h.sync.execute(SyncScope::Cluster(edge)).await.unwrap();

        let mut rule = BandwidthRule::unlimited("cam1");
        rule.downstream_rate = Some("20mbit".to_string());
        rule.downstream_ceil = Some("50mbit".to_string());
        rule.upstream_rate = Some("5mbit".to_string());
        rule.upstream_ceil = Some("10mbit".to_string());

        let rules = h.rules.clone();
        let sync = h.sync.clone();
        let (applied, stopped, history) = race_behind_lock(
            &h,
            async move { rules.apply(rule).await },
            async move { sync.stop_device(cam1.id).await },
        )
        .await;

        applied.unwrap();
        assert_eq!(stopped.unwrap().status, DeviceStatus::Stopped);

        // Both tc changes land before the teardown starts
        let last_change = history
            .iter()
            .rposition(|line| line.contains("tc class change"))
            .unwrap();
        let teardown = position(&history, "tc qdisc del").unwrap();
        assert!(last_change < teardown);
        assert!(position(&history, "ip link del ifb1").unwrap() > last_change);
    }

    #[tokio::test]
    async fn test_apply_queued_behind_stop_sees_the_stopped_device() {
        let h = harness();
        let edge = cluster(&h, "edge").await;
        let cam1 = device(&h, edge, "cam1").await;
        h.sync.execute(SyncScope::Cluster(edge)).await.unwrap();

        let rules = h.rules.clone();
        let sync = h.sync.clone();
        let (stopped, applied, history) = race_behind_lock(
            &h,
            async move { sync.stop_device(cam1.id).await },
            async move { rules.apply(BandwidthRule::unlimited("cam1")).await },
        )
        .await;

        stopped.unwrap();
        assert!(matches!(applied, Err(RuleError::NotRunning(_))));
        assert!(position(&history, "ip link del ifb1").is_some());
        assert!(position(&history, "tc class change").is_none());
        assert!(h.rules.records().is_empty().await);
    }

    #[tokio::test]
    async fn test_kept_device_with_stale_row_is_updated() {
        let h = harness();
        let edge = cluster(&h, "edge").await;
        let cam1 = device(&h, edge, "cam1").await;
        h.sync.execute(SyncScope::Cluster(edge)).await.unwrap();

        // Row lost its running state while the container kept running
        h.store.transition_device(cam1.id, StatusChange::Stopping).await.unwrap();
        h.store.transition_device(cam1.id, StatusChange::Stopped).await.unwrap();

        let result = h.sync.execute(SyncScope::Cluster(edge)).await.unwrap();
        assert_eq!(result.kept, vec!["cam1"]);
        assert_eq!(result.updated, vec!["cam1"]);
        assert!(h.store.get_device(cam1.id).await.unwrap().is_running());
    }

    #[test]
    fn test_plan_is_pure() {
        let naming = crate::config::NamingConfig::default();
        let mut state = StoreState::default();
        state.clusters.push(crate::store::Cluster {
            id: 1,
            name: "edge".to_string(),
            description: None,
            active: true,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        });
        for (slot, name) in [(1, "cam1"), (2, "cam2")] {
            let topo = crate::topology::Topology::for_slot(&naming, "edge", name, slot);
            state.devices.push(Device::from_topology(slot as u64, 1, name, "camera", topo));
        }

        let observed = vec!["qc_edge_cam2".to_string(), "qc_edge_gone".to_string()];
        let plan = SyncPlan::compute(&state, SyncScope::Cluster(1), &observed).unwrap();
        let preview = plan.preview();
        assert_eq!(preview.to_create, vec!["cam1"]);
        assert_eq!(preview.to_keep, vec!["cam2"]);
        assert_eq!(preview.to_destroy, vec!["qc_edge_gone"]);
        assert_eq!(preview.total_changes, 2);
    }
}
