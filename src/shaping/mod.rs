//! Bidirectional HTB traffic shaping
//!
//! Downstream traffic (endpoint to device) is shaped on the endpoint's
//! physical interface under handle `1:`. Upstream traffic is redirected from
//! the interface's ingress onto a paired IFB device and shaped there under
//! handle `2:` with the same class layout.

pub mod hierarchy;
pub mod parsers;
pub mod rule;
pub mod translator;
pub mod units;

use thiserror::Error;

pub use rule::{BandwidthRule, RatePair, DEFAULT_CLASS_ID, UNLIMITED_RATE};
pub use translator::{apply_ops, translate, Direction, OpOutcome, ShapingOp, ShapingTarget};

/// Errors that can occur while building or applying shaping commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapingError {
    #[error("Invalid rule: {0}")]
    Validation(String),

    #[error("Shaping command failed on {device}: {message}")]
    CommandFailure { device: String, message: String },
}
