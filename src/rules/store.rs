//! Persisted rule records
//!
//! One record per device, keyed by container name. Re-applying supersedes
//! the record; resetting a device to unlimited deletes it, so "no record"
//! always means unlimited.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::RuleError;
use crate::shaping::{BandwidthRule, ShapingError, DEFAULT_CLASS_ID};
use crate::store::write_json_atomic;

fn default_class_id() -> String {
    DEFAULT_CLASS_ID.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRecord {
    /// Container name of the device
    pub client: String,
    #[serde(default = "default_class_id")]
    pub class_id: String,
    pub downstream_rate: String,
    pub downstream_ceil: String,
    #[serde(default)]
    pub upstream_rate: Option<String>,
    #[serde(default)]
    pub upstream_ceil: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RuleRecord {
    /// Normalized record of `rule` as applied to `container`
    pub fn from_rule(container: &str, rule: &BandwidthRule) -> Result<Self, ShapingError> {
        let down = rule.downstream()?;
        let up = rule.upstream()?;
        Ok(Self {
            client: container.to_string(),
            class_id: rule.class_id.clone(),
            downstream_rate: down.rate,
            downstream_ceil: down.ceil,
            upstream_rate: up.as_ref().map(|p| p.rate.clone()),
            upstream_ceil: up.map(|p| p.ceil),
            description: rule.description.clone(),
            updated_at: Utc::now(),
        })
    }

    /// Keep `previous`'s upstream pair when this record has none
    pub fn inherit_upstream(&mut self, previous: &RuleRecord) {
        if self.upstream_rate.is_none() && self.upstream_ceil.is_none() {
            self.upstream_rate = previous.upstream_rate.clone();
            self.upstream_ceil = previous.upstream_ceil.clone();
        }
    }

    pub fn to_rule(&self) -> BandwidthRule {
        BandwidthRule {
            interface: None,
            client: self.client.clone(),
            class_id: self.class_id.clone(),
            downstream_rate: Some(self.downstream_rate.clone()),
            downstream_ceil: Some(self.downstream_ceil.clone()),
            upstream_rate: self.upstream_rate.clone(),
            upstream_ceil: self.upstream_ceil.clone(),
            rate: None,
            ceil: None,
            description: self.description.clone(),
        }
    }
}

pub struct RuleStore {
    records: RwLock<BTreeMap<String, RuleRecord>>,
    path: Option<PathBuf>,
}

impl RuleStore {
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            path: None,
        }
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RuleError> {
        let path = path.into();
        let records: BTreeMap<String, RuleRecord> = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|e| RuleError::Parse(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        info!("Loaded {} rule records from {}", records.len(), path.display());

        Ok(Self {
            records: RwLock::new(records),
            path: Some(path),
        })
    }

    async fn mutate<T>(&self, f: impl FnOnce(&mut BTreeMap<String, RuleRecord>) -> T) -> Result<T, RuleError> {
        let mut guard = self.records.write().await;
        let mut next = guard.clone();
        let value = f(&mut next);
        if let Some(path) = &self.path {
            write_json_atomic(path, &next).await?;
            debug!("Rules persisted to {}", path.display());
        }
        *guard = next;
        Ok(value)
    }

    pub async fn get(&self, client: &str) -> Option<RuleRecord> {
        self.records.read().await.get(client).cloned()
    }

    pub async fn list(&self) -> Vec<RuleRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Insert or supersede the record for `record.client`
    pub async fn upsert(&self, record: RuleRecord) -> Result<(), RuleError> {
        self.mutate(|records| {
            records.insert(record.client.clone(), record);
        })
        .await
    }

    /// Returns whether a record existed
    pub async fn remove(&self, client: &str) -> Result<bool, RuleError> {
        self.mutate(|records| records.remove(client).is_some()).await
    }

    pub async fn clear(&self) -> Result<usize, RuleError> {
        self.mutate(|records| {
            let count = records.len();
            records.clear();
            count
        })
        .await
    }
}
