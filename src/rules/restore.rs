//! Bringing the shaping endpoint back to the persisted rule set

use std::collections::HashMap;

use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use super::manager::RuleManager;
use super::Failure;
use crate::shaping::{apply_ops, hierarchy, translate};
use crate::topology::ifb_device_name;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    /// Interfaces whose default hierarchy is in place
    pub initialized: Vec<String>,
    /// Clients whose record was applied
    pub replayed: Vec<String>,
    /// Records whose device or interface no longer exists
    pub stale: Vec<String>,
    pub failures: Vec<Failure>,
}

impl RuleManager {
    /// Initialize every running device's hierarchy, then replay every record.
    ///
    /// Never fails: stale records are warnings and failures are collected.
    pub async fn restore(&self) -> RestoreReport {
        let snapshot = self.store.snapshot().await;
        let running: Vec<_> = snapshot
            .devices
            .iter()
            .filter(|d| d.is_running())
            .filter_map(|d| d.shaping_target().map(|t| (d, t)))
            .collect();

        let mut report = RestoreReport::default();

        let inits = join_all(running.iter().map(|(device, target)| async move {
            let _guard = self.device_locks.lock(&device.container_name).await;
            let ifb = target
                .ifb_device
                .clone()
                .unwrap_or_else(|| ifb_device_name(device.slot));
            hierarchy::initialize(&self.router, &target.interface, &ifb).await
        }))
        .await;

        let mut ready: HashMap<&str, bool> = HashMap::new();
        for ((device, target), result) in running.iter().zip(inits) {
            match result {
                Ok(_) => {
                    report.initialized.push(target.interface.clone());
                    ready.insert(device.container_name.as_str(), true);
                }
                Err(e) => {
                    warn!("Could not initialize {}: {}", target.interface, e);
                    report.failures.push(Failure::new(&device.name, e));
                    ready.insert(device.container_name.as_str(), false);
                }
            }
        }

        let records = self.records.list().await;
        let replays = records.iter().map(|record| {
            let client = record.client.clone();
            let device = snapshot.device_by_container(&record.client);
            let ready = &ready;
            async move {
                let Some(device) = device else {
                    return (client, Err(None));
                };
                let Some(target) = device.shaping_target().filter(|_| device.is_running()) else {
                    return (client, Err(None));
                };
                if ready.get(device.container_name.as_str()) == Some(&false) {
                    return (client, Err(Some("interface did not initialize".to_string())));
                }

                let _guard = self.device_locks.lock(&device.container_name).await;
                let ops = match translate(&record.to_rule(), &target) {
                    Ok(ops) => ops,
                    Err(e) => return (client, Err(Some(e.to_string()))),
                };
                let failed: Vec<String> = apply_ops(&self.router, &ops)
                    .await
                    .into_iter()
                    .filter_map(|o| o.result.err().map(|e| e.to_string()))
                    .collect();
                if failed.is_empty() {
                    (client, Ok(()))
                } else {
                    (client, Err(Some(failed.join("; "))))
                }
            }
        });

        for (client, result) in join_all(replays).await {
            match result {
                Ok(()) => report.replayed.push(client),
                Err(None) => {
                    warn!("Skipping stale rule for {}: device or interface is gone", client);
                    report.stale.push(client);
                }
                Err(Some(message)) => {
                    warn!("Replay of {} failed: {}", client, message);
                    report.failures.push(Failure::new(client, message));
                }
            }
        }

        info!(
            "Restore: {} interfaces initialized, {} rules replayed, {} stale, {} failed",
            report.initialized.len(),
            report.replayed.len(),
            report.stale.len(),
            report.failures.len()
        );
        report
    }
}
