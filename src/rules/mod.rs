//! Rule application, persistence and restore

pub mod manager;
pub mod restore;
pub mod store;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::shaping::hierarchy::{DEFAULT_MINOR, UPSTREAM_MAJOR};
use crate::shaping::parsers::TcClass;
use crate::shaping::units::parse_rate;
use crate::shaping::{ShapingError, UNLIMITED_RATE};
use crate::store::{Device, StoreError};

pub use manager::{ApplyReport, BatchItem, BatchReport, OpReport, ResetAllReport, ResetOutcome, RuleManager};
pub use restore::RestoreReport;
pub use store::{RuleRecord, RuleStore};

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Invalid rule: {0}")]
    Validation(String),

    #[error("Stale reference: {0}")]
    StaleReference(String),

    #[error("Device '{0}' is not running")]
    NotRunning(String),

    #[error(transparent)]
    Shaping(#[from] ShapingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Rule file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Rule file is corrupt: {0}")]
    Parse(String),
}

/// Per-item failure in a batch report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub name: String,
    pub message: String,
}

impl Failure {
    pub fn new(name: impl Into<String>, message: impl ToString) -> Self {
        Self {
            name: name.into(),
            message: message.to_string(),
        }
    }
}

/// Effective limits of one device as read back from the kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRule {
    pub interface: String,
    pub client: String,
    pub container: String,
    pub class_id: String,
    pub downstream_rate: String,
    pub downstream_ceil: String,
    pub upstream_rate: Option<String>,
    pub upstream_ceil: Option<String>,
    /// Downstream pair under its older names
    pub rate: String,
    pub ceil: String,
    /// Some limit differs from unlimited
    pub active: bool,
}

fn is_unlimited(value: &str) -> bool {
    parse_rate(value).is_some() && parse_rate(value) == parse_rate(UNLIMITED_RATE)
}

impl ActiveRule {
    /// Build from sampled classes of the device's interface and IFB device.
    /// `None` when the interface has no low class.
    pub fn from_classes(device: &Device, interface: &str, downstream: &[TcClass], upstream: &[TcClass]) -> Option<Self> {
        let class_id = format!("1:{}", DEFAULT_MINOR);
        let down = downstream.iter().find(|c| c.class_id == class_id)?;
        let up_id = format!("{}:{}", UPSTREAM_MAJOR, DEFAULT_MINOR);
        let up = upstream.iter().find(|c| c.class_id == up_id);

        let active = !is_unlimited(&down.rate)
            || !is_unlimited(&down.ceil)
            || up.is_some_and(|u| !is_unlimited(&u.rate) || !is_unlimited(&u.ceil));

        Some(Self {
            interface: interface.to_string(),
            client: device.name.clone(),
            container: device.container_name.clone(),
            class_id,
            downstream_rate: down.rate.clone(),
            downstream_ceil: down.ceil.clone(),
            upstream_rate: up.map(|u| u.rate.clone()),
            upstream_ceil: up.map(|u| u.ceil.clone()),
            rate: down.rate.clone(),
            ceil: down.ceil.clone(),
            active,
        })
    }
}
