use serde::{Deserialize, Serialize};

use super::units::parse_rate;
use super::ShapingError;

/// Rate used for "no limit". The low class is created with this value, so a
/// device without a rule and one reset to unlimited are indistinguishable.
pub const UNLIMITED_RATE: &str = "1gbit";

/// Per-device configurable class: the low-priority leaf
pub const DEFAULT_CLASS_ID: &str = "1:30";

fn default_class_id() -> String {
    DEFAULT_CLASS_ID.to_string()
}

/// Declarative bandwidth rule for one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthRule {
    /// Physical interface; resolved from the device row when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,

    /// Device container name, or a device name unique across clusters
    pub client: String,

    #[serde(default = "default_class_id")]
    pub class_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downstream_rate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downstream_ceil: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_rate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_ceil: Option<String>,

    /// Older single-direction form, used for downstream when the
    /// downstream fields are absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ceil: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Guaranteed rate and ceiling for one direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePair {
    pub rate: String,
    pub ceil: String,
}

impl RatePair {
    pub fn new(rate: impl Into<String>, ceil: impl Into<String>) -> Self {
        Self {
            rate: rate.into(),
            ceil: ceil.into(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(UNLIMITED_RATE, UNLIMITED_RATE)
    }

    /// Resolve a pair where either half may be missing. `None` when both are.
    fn resolve(rate: Option<&String>, ceil: Option<&String>) -> Option<Self> {
        match (rate, ceil) {
            (Some(r), Some(c)) => Some(Self::new(r.clone(), c.clone())),
            (Some(r), None) => Some(Self::new(r.clone(), r.clone())),
            (None, Some(c)) => Some(Self::new(c.clone(), c.clone())),
            (None, None) => None,
        }
    }

    fn validate(&self, direction: &str) -> Result<(), ShapingError> {
        if self.rate.trim().is_empty() || self.ceil.trim().is_empty() {
            return Err(ShapingError::Validation(format!(
                "{} rate and ceil must not be empty",
                direction
            )));
        }
        Ok(())
    }

    /// `Some(true)` when both values parse and ceil is below rate
    pub fn ceil_below_rate(&self) -> Option<bool> {
        let rate = parse_rate(&self.rate)?;
        let ceil = parse_rate(&self.ceil)?;
        Some(ceil < rate)
    }
}

impl BandwidthRule {
    /// Rule that lifts every limit for `client`
    pub fn unlimited(client: impl Into<String>) -> Self {
        let client = client.into();
        Self {
            interface: None,
            description: Some(format!("Unlimited bandwidth for {}", client)),
            client,
            class_id: default_class_id(),
            downstream_rate: Some(UNLIMITED_RATE.to_string()),
            downstream_ceil: Some(UNLIMITED_RATE.to_string()),
            upstream_rate: Some(UNLIMITED_RATE.to_string()),
            upstream_ceil: Some(UNLIMITED_RATE.to_string()),
            rate: None,
            ceil: None,
        }
    }

    /// Effective downstream pair, falling back to the legacy fields
    pub fn downstream(&self) -> Result<RatePair, ShapingError> {
        let rate = self.downstream_rate.as_ref().or(self.rate.as_ref());
        let ceil = self.downstream_ceil.as_ref().or(self.ceil.as_ref());
        let pair = RatePair::resolve(rate, ceil).ok_or_else(|| {
            ShapingError::Validation("downstream rate or ceil is required".to_string())
        })?;
        pair.validate("downstream")?;
        Ok(pair)
    }

    /// Effective upstream pair, `None` when no upstream field is set
    pub fn upstream(&self) -> Result<Option<RatePair>, ShapingError> {
        match RatePair::resolve(self.upstream_rate.as_ref(), self.upstream_ceil.as_ref()) {
            Some(pair) => {
                pair.validate("upstream")?;
                Ok(Some(pair))
            }
            None => Ok(None),
        }
    }

    /// Structural checks shared by every entry point
    pub fn validate(&self) -> Result<(), ShapingError> {
        if self.client.trim().is_empty() {
            return Err(ShapingError::Validation("client is required".to_string()));
        }
        validate_class_id(&self.class_id)?;
        self.downstream()?;
        self.upstream()?;
        Ok(())
    }

    /// Reject a ceiling below its rate when both values are understood
    pub fn validate_ceilings(&self) -> Result<(), ShapingError> {
        let down = self.downstream()?;
        if down.ceil_below_rate() == Some(true) {
            return Err(ShapingError::Validation(format!(
                "downstream ceil {} is below rate {}",
                down.ceil, down.rate
            )));
        }
        if let Some(up) = self.upstream()? {
            if up.ceil_below_rate() == Some(true) {
                return Err(ShapingError::Validation(format!(
                    "upstream ceil {} is below rate {}",
                    up.ceil, up.rate
                )));
            }
        }
        Ok(())
    }
}

/// Class ids look like `1:30`
pub fn validate_class_id(class_id: &str) -> Result<(), ShapingError> {
    let valid = class_id
        .split_once(':')
        .map(|(major, minor)| {
            !major.is_empty()
                && !minor.is_empty()
                && major.chars().all(|c| c.is_ascii_hexdigit())
                && minor.chars().all(|c| c.is_ascii_hexdigit())
        })
        .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(ShapingError::Validation(format!(
            "invalid class id '{}'",
            class_id
        )))
    }
}
