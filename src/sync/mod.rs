//! Desired/observed reconciliation

pub mod reconciler;
pub mod report;

use thiserror::Error;

use crate::runtime::LifecycleError;
use crate::store::StoreError;

pub use reconciler::{Reconciler, SyncPlan};
pub use report::{
    KillSummary, SyncAction, SyncItemError, SyncPreview, SyncResult, SyncScope, TeardownReport,
};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Cluster {0} not found")]
    ClusterNotFound(u64),

    #[error("A sync of {0} is already in progress")]
    InProgress(String),

    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}
