//! Applying rules to running devices

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::store::{RuleRecord, RuleStore};
use super::{ActiveRule, Failure, RuleError};
use crate::locks::KeyedLocks;
use crate::runtime::docker::Endpoint;
use crate::shaping::parsers::parse_tc_classes;
use crate::shaping::{apply_ops, hierarchy, translate, BandwidthRule, Direction, OpOutcome, ShapingTarget};
use crate::store::{Device, Store, StoreError};
use crate::topology::ifb_device_name;

/// Outcome of one `tc class change`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpReport {
    pub direction: Direction,
    pub device: String,
    pub class_id: String,
    pub rate: String,
    pub ceil: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&OpOutcome> for OpReport {
    fn from(outcome: &OpOutcome) -> Self {
        Self {
            direction: outcome.op.direction,
            device: outcome.op.device.clone(),
            class_id: outcome.op.class_id.clone(),
            rate: outcome.op.rate.clone(),
            ceil: outcome.op.ceil.clone(),
            success: outcome.is_ok(),
            error: outcome.result.as_ref().err().map(|e| e.to_string()),
        }
    }
}

/// A rule applied to one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub client: String,
    pub container: String,
    pub interface: String,
    pub ifb_device: Option<String>,
    pub ops: Vec<OpReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub client: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ApplyReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub results: Vec<BatchItem>,
    pub success_count: usize,
    pub error_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetOutcome {
    pub client: String,
    pub record_removed: bool,
    /// Unlimited was written to the kernel; false for devices not running
    pub shaped: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResetAllReport {
    pub reinitialized: Vec<String>,
    pub records_cleared: usize,
    pub failures: Vec<Failure>,
}

/// Applies rules under per-device locks and keeps the record store in step
#[derive(Clone)]
pub struct RuleManager {
    pub(super) store: Arc<Store>,
    pub(super) records: Arc<RuleStore>,
    pub(super) router: Endpoint,
    pub(super) device_locks: KeyedLocks,
}

impl RuleManager {
    pub fn new(store: Arc<Store>, records: Arc<RuleStore>, router: Endpoint, device_locks: KeyedLocks) -> Self {
        Self {
            store,
            records,
            router,
            device_locks,
        }
    }

    pub fn records(&self) -> &Arc<RuleStore> {
        &self.records
    }

    fn running_target(device: &Device) -> Result<ShapingTarget, RuleError> {
        if !device.is_running() {
            return Err(RuleError::NotRunning(device.name.clone()));
        }
        device
            .shaping_target()
            .ok_or_else(|| RuleError::NotRunning(device.name.clone()))
    }

    /// Translate and execute `rule` on `device`. Caller holds the device lock.
    async fn execute(&self, device: &Device, target: &ShapingTarget, rule: &BandwidthRule) -> Result<ApplyReport, RuleError> {
        let ops = translate(rule, target)?;
        let outcomes = apply_ops(&self.router, &ops).await;
        Ok(ApplyReport {
            client: device.name.clone(),
            container: device.container_name.clone(),
            interface: target.interface.clone(),
            ifb_device: target.ifb_device.clone(),
            ops: outcomes.iter().map(OpReport::from).collect(),
        })
    }

    fn first_failure(outcomes: &[OpReport]) -> Option<RuleError> {
        outcomes.iter().find(|op| !op.success).map(|op| {
            RuleError::Shaping(crate::shaping::ShapingError::CommandFailure {
                device: op.device.clone(),
                message: op.error.clone().unwrap_or_default(),
            })
        })
    }

    /// Apply one rule. The record is written once the downstream change
    /// succeeded; the first failed op is returned as the error.
    pub async fn apply(&self, rule: BandwidthRule) -> Result<ApplyReport, RuleError> {
        rule.validate()?;
        rule.validate_ceilings()?;

        let device = self.store.resolve_client(&rule.client).await?;
        let _guard = self.device_locks.lock(&device.container_name).await;

        // The device may have been destroyed while waiting for the lock
        let device = self.store.get_device(device.id).await?;
        let target = Self::running_target(&device)?;
        if let Some(requested) = rule.interface.as_deref() {
            if requested != target.interface {
                warn!(
                    "Rule for {} names {}, applying on {}",
                    device.name, requested, target.interface
                );
            }
        }

        let report = self.execute(&device, &target, &rule).await?;
        let downstream_ok = report
            .ops
            .iter()
            .any(|op| op.direction == Direction::Downstream && op.success);
        if downstream_ok {
            let mut record = RuleRecord::from_rule(&device.container_name, &rule)?;
            // Without upstream values no upstream op ran and the kernel kept the old class
            if let Some(previous) = self.records.get(&device.container_name).await {
                record.inherit_upstream(&previous);
            }
            self.records.upsert(record).await?;
            info!("Applied rule to {} on {}", device.container_name, target.interface);
        }

        match Self::first_failure(&report.ops) {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Apply several rules concurrently; each item succeeds or fails alone
    pub async fn apply_batch(&self, rules: Vec<BandwidthRule>) -> BatchReport {
        let results: Vec<BatchItem> = join_all(rules.into_iter().map(|rule| async move {
            let client = rule.client.clone();
            match self.apply(rule).await {
                Ok(report) => BatchItem {
                    client,
                    success: true,
                    error: None,
                    report: Some(report),
                },
                Err(e) => BatchItem {
                    client,
                    success: false,
                    error: Some(e.to_string()),
                    report: None,
                },
            }
        }))
        .await;

        let success_count = results.iter().filter(|r| r.success).count();
        BatchReport {
            error_count: results.len() - success_count,
            success_count,
            results,
        }
    }

    /// Lift every limit on `client` and forget its record
    pub async fn reset_client(&self, client: &str) -> Result<ResetOutcome, RuleError> {
        let device = match self.store.resolve_client(client).await {
            Ok(device) => device,
            Err(StoreError::DeviceNotFound(_)) => {
                // A record for a device that no longer exists
                if self.records.remove(client).await? {
                    return Ok(ResetOutcome {
                        client: client.to_string(),
                        record_removed: true,
                        shaped: false,
                    });
                }
                return Err(RuleError::StaleReference(format!("no device or rule named '{}'", client)));
            }
            Err(e) => return Err(e.into()),
        };

        let _guard = self.device_locks.lock(&device.container_name).await;
        let device = self.store.get_device(device.id).await?;

        let mut shaped = false;
        if let Ok(target) = Self::running_target(&device) {
            let rule = BandwidthRule::unlimited(device.container_name.clone());
            let report = self.execute(&device, &target, &rule).await?;
            if let Some(err) = Self::first_failure(&report.ops) {
                return Err(err);
            }
            shaped = true;
        }

        let record_removed = self.records.remove(&device.container_name).await?;
        info!("Reset {} to unlimited", device.container_name);
        Ok(ResetOutcome {
            client: device.name,
            record_removed,
            shaped,
        })
    }

    /// Rebuild the default hierarchy on every running device and drop all records
    pub async fn reset_all(&self) -> Result<ResetAllReport, RuleError> {
        let devices: Vec<Device> = self
            .store
            .snapshot()
            .await
            .devices
            .into_iter()
            .filter(|d| d.is_running())
            .collect();

        let mut report = ResetAllReport::default();
        let results = join_all(devices.iter().map(|device| async move {
            let _guard = self.device_locks.lock(&device.container_name).await;
            let target = Self::running_target(device)?;
            let ifb = target
                .ifb_device
                .clone()
                .unwrap_or_else(|| ifb_device_name(device.slot));
            hierarchy::reinitialize(&self.router, &target.interface, &ifb).await?;
            Ok::<String, RuleError>(target.interface)
        }))
        .await;

        for (device, result) in devices.iter().zip(results) {
            match result {
                Ok(interface) => report.reinitialized.push(interface),
                Err(e) => {
                    warn!("Reset of {} failed: {}", device.container_name, e);
                    report.failures.push(Failure::new(&device.name, e));
                }
            }
        }

        report.records_cleared = self.records.clear().await?;
        info!(
            "Reset {} interfaces, cleared {} rules",
            report.reinitialized.len(),
            report.records_cleared
        );
        Ok(report)
    }

    /// Replay the persisted record of `device`, if any. Caller holds the
    /// device lock. Returns whether a record was replayed.
    pub async fn replay_record(&self, device: &Device) -> Result<bool, RuleError> {
        let Some(record) = self.records.get(&device.container_name).await else {
            return Ok(false);
        };
        let target = Self::running_target(device)?;
        let report = self.execute(device, &target, &record.to_rule()).await?;
        if let Some(err) = Self::first_failure(&report.ops) {
            return Err(err);
        }
        debug!("Replayed rule for {}", device.container_name);
        Ok(true)
    }

    /// Effective class parameters of every running device, from the kernel
    pub async fn current_rules(&self) -> Vec<ActiveRule> {
        let devices: Vec<Device> = self
            .store
            .snapshot()
            .await
            .devices
            .into_iter()
            .filter(|d| d.is_running())
            .collect();

        let reads = devices.iter().filter_map(|device| {
            let target = device.shaping_target()?;
            Some(async move {
                let down = self.read_classes(&target.interface).await;
                let up = match &target.ifb_device {
                    Some(ifb) => self.read_classes(ifb).await,
                    None => Vec::new(),
                };
                ActiveRule::from_classes(device, &target.interface, &down, &up)
            })
        });

        join_all(reads).await.into_iter().flatten().collect()
    }

    async fn read_classes(&self, dev: &str) -> Vec<crate::shaping::parsers::TcClass> {
        let command: Vec<String> = ["tc", "class", "show", "dev", dev]
            .iter()
            .map(|s| s.to_string())
            .collect();
        match self.router.run(&command).await {
            Ok(out) if out.success() => parse_tc_classes(&out.stdout),
            Ok(out) => {
                debug!("tc class show {} failed: {}", dev, out.combined());
                Vec::new()
            }
            Err(e) => {
                debug!("tc class show {} failed: {}", dev, e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::runtime::{DockerCli, LifecycleManager, SimulatedHost};
    use crate::store::{NewCluster, NewDevice, StatusChange};
    use std::time::Duration;

    pub(crate) struct Fixture {
        pub host: Arc<SimulatedHost>,
        pub store: Arc<Store>,
        pub manager: RuleManager,
    }

    /// A store with `names` provisioned and running in cluster "edge"
    pub(crate) async fn fixture(names: &[&str]) -> Fixture {
        let settings = Settings::default();
        let host = Arc::new(SimulatedHost::new(&settings));
        let docker = DockerCli::new(host.clone(), "docker", Duration::from_secs(1));
        let lifecycle = LifecycleManager::new(docker.clone(), &settings).with_detect_retry(1, Duration::ZERO);
        let store = Arc::new(Store::in_memory(settings.naming.clone()));

        let cluster = store
            .create_cluster(NewCluster {
                name: "edge".to_string(),
                description: None,
                active: None,
            })
            .await
            .unwrap();
        for name in names {
            let device = store
                .create_device(
                    cluster.id,
                    NewDevice {
                        name: name.to_string(),
                        device_type: None,
                    },
                )
                .await
                .unwrap();
            let provisioned = lifecycle.create_device(&device).await.unwrap();
            store.transition_device(device.id, StatusChange::Starting).await.unwrap();
            store
                .transition_device(
                    device.id,
                    StatusChange::Running {
                        interface: provisioned.interface,
                        ifb_device: provisioned.ifb_device,
                    },
                )
                .await
                .unwrap();
        }

        let manager = RuleManager::new(
            store.clone(),
            Arc::new(RuleStore::in_memory()),
            lifecycle.router().clone(),
            KeyedLocks::new(),
        );
        Fixture { host, store, manager }
    }

    pub(crate) fn limited(client: &str) -> BandwidthRule {
        BandwidthRule {
            interface: None,
            client: client.to_string(),
            class_id: "1:30".to_string(),
            downstream_rate: Some("20mbit".to_string()),
            downstream_ceil: Some("50mbit".to_string()),
            upstream_rate: Some("5mbit".to_string()),
            upstream_ceil: Some("10mbit".to_string()),
            rate: None,
            ceil: None,
            description: None,
        }
    }

    #[tokio::test]
    async fn test_apply_shapes_both_directions_and_persists() {
        let f = fixture(&["cam1"]).await;
        let report = f.manager.apply(limited("cam1")).await.unwrap();

        assert_eq!(report.ops.len(), 2);
        assert_eq!(report.ops[0].direction, Direction::Downstream);
        assert_eq!(report.ops[0].device, report.interface);
        assert_eq!(report.ops[1].direction, Direction::Upstream);
        assert_eq!(report.ops[1].device, "ifb1");
        assert_eq!(report.ops[1].class_id, "2:30");

        assert_eq!(
            f.host.class_rates(&report.interface, "1:30"),
            Some(("20mbit".to_string(), "50mbit".to_string()))
        );
        assert_eq!(
            f.host.class_rates("ifb1", "2:30"),
            Some(("5mbit".to_string(), "10mbit".to_string()))
        );

        let record = f.manager.records().get("qc_edge_cam1").await.unwrap();
        assert_eq!(record.upstream_ceil.as_deref(), Some("10mbit"));
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let f = fixture(&["cam1"]).await;
        let first = f.manager.apply(limited("cam1")).await.unwrap();
        let after_first = f.manager.current_rules().await;
        let second = f.manager.apply(limited("cam1")).await.unwrap();
        let after_second = f.manager.current_rules().await;

        assert_eq!(first.ops, second.ops);
        assert_eq!(after_first, after_second);
        assert_eq!(f.manager.records().len().await, 1);
    }

    #[tokio::test]
    async fn test_apply_rejects_bad_input() {
        let f = fixture(&["cam1"]).await;

        let mut inverted = limited("cam1");
        inverted.downstream_ceil = Some("10mbit".to_string());
        assert!(matches!(f.manager.apply(inverted).await, Err(RuleError::Shaping(_))));

        assert!(matches!(
            f.manager.apply(limited("ghost")).await,
            Err(RuleError::Store(StoreError::DeviceNotFound(_)))
        ));
        // Nothing was sent to the endpoint
        assert!(f.host.commands_matching("tc class change").is_empty());
    }

    #[tokio::test]
    async fn test_apply_requires_running_device() {
        let f = fixture(&[]).await;
        let cluster = f.store.list_clusters().await[0].id;
        f.store
            .create_device(
                cluster,
                NewDevice {
                    name: "idle".to_string(),
                    device_type: None,
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            f.manager.apply(limited("idle")).await,
            Err(RuleError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_upstream_failure_still_persists_downstream() {
        let f = fixture(&["cam1"]).await;
        f.host.fail_matching("dev ifb1 parent 2:1");
        let err = f.manager.apply(limited("cam1")).await.unwrap_err();
        assert!(matches!(err, RuleError::Shaping(_)));
        assert!(f.manager.records().get("qc_edge_cam1").await.is_some());
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let f = fixture(&["cam1", "cam2"]).await;
        let report = f
            .manager
            .apply_batch(vec![limited("cam1"), limited("ghost"), limited("cam2")])
            .await;
        assert_eq!(report.success_count, 2);
        assert_eq!(report.error_count, 1);
        assert!(!report.results[1].success);
    }

    #[tokio::test]
    async fn test_reset_matches_never_limited_device() {
        let f = fixture(&["cam1", "cam2"]).await;
        f.manager.apply(limited("cam1")).await.unwrap();

        let outcome = f.manager.reset_client("cam1").await.unwrap();
        assert!(outcome.record_removed);
        assert!(outcome.shaped);
        assert!(f.manager.records().is_empty().await);

        let rules = f.manager.current_rules().await;
        let cam1 = rules.iter().find(|r| r.client == "cam1").unwrap();
        let cam2 = rules.iter().find(|r| r.client == "cam2").unwrap();
        assert_eq!(
            (&cam1.downstream_rate, &cam1.downstream_ceil, &cam1.upstream_rate, &cam1.upstream_ceil, cam1.active),
            (&cam2.downstream_rate, &cam2.downstream_ceil, &cam2.upstream_rate, &cam2.upstream_ceil, cam2.active)
        );
    }

    #[tokio::test]
    async fn test_reset_unknown_client() {
        let f = fixture(&[]).await;
        assert!(matches!(
            f.manager.reset_client("ghost").await,
            Err(RuleError::StaleReference(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_all() {
        let f = fixture(&["cam1", "cam2"]).await;
        f.manager.apply(limited("cam1")).await.unwrap();
        f.manager.apply(limited("cam2")).await.unwrap();

        let report = f.manager.reset_all().await.unwrap();
        assert_eq!(report.reinitialized.len(), 2);
        assert_eq!(report.records_cleared, 2);
        assert!(f.manager.current_rules().await.iter().all(|r| !r.active));
    }
}
