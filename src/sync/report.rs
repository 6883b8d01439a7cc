//! Sync value objects

use serde::{Deserialize, Serialize};

/// What a sync pass looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncScope {
    /// All devices of one cluster, active or not
    Cluster(u64),
    /// Devices of active clusters
    Global,
}

impl SyncScope {
    pub fn from_cluster_id(cluster_id: Option<u64>) -> Self {
        match cluster_id {
            Some(id) => SyncScope::Cluster(id),
            None => SyncScope::Global,
        }
    }
}

impl std::fmt::Display for SyncScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncScope::Cluster(id) => write!(f, "cluster {}", id),
            SyncScope::Global => write!(f, "all clusters"),
        }
    }
}

/// Read-only diff between desired and provisioned devices
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPreview {
    pub to_create: Vec<String>,
    pub to_destroy: Vec<String>,
    pub to_keep: Vec<String>,
    pub total_changes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Create,
    Destroy,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncItemError {
    pub name: String,
    pub action: SyncAction,
    pub message: String,
}

/// Per-item outcome of an execute pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub created: Vec<String>,
    pub destroyed: Vec<String>,
    pub kept: Vec<String>,
    /// Kept devices whose row had to be brought back to `running`
    pub updated: Vec<String>,
    pub errors: Vec<SyncItemError>,
    pub total_operations: usize,
    pub success_count: usize,
    pub error_count: usize,
}

impl SyncResult {
    pub(crate) fn record(&mut self, name: String, action: SyncAction, outcome: Result<(), String>) {
        self.total_operations += 1;
        match outcome {
            Ok(()) => {
                self.success_count += 1;
                match action {
                    SyncAction::Create => self.created.push(name),
                    SyncAction::Destroy => self.destroyed.push(name),
                    SyncAction::Update => self.updated.push(name),
                }
            }
            Err(message) => {
                self.error_count += 1;
                self.errors.push(SyncItemError {
                    name,
                    action,
                    message,
                });
            }
        }
    }

    /// Sort every list so results are stable regardless of completion order
    pub(crate) fn finish(mut self) -> Self {
        self.created.sort();
        self.destroyed.sort();
        self.kept.sort();
        self.updated.sort();
        self.errors.sort_by(|a, b| a.name.cmp(&b.name));
        self
    }
}

/// Outcome of removing rows together with their infrastructure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub removed: Vec<String>,
    /// Infrastructure errors; the rows are gone regardless
    pub teardown_errors: Vec<String>,
}

/// Outcome of a bulk kill
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KillSummary {
    pub count: usize,
    pub containers: Vec<String>,
    pub devices_stopped: Vec<String>,
    pub errors: Vec<String>,
}
