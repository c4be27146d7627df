//! The scanner capability seam.
//!
//! Scanners are pluggable probes registered by name. The engine never knows
//! how a scan is performed; it only asks a scanner to examine a url and
//! return findings, and lets discovery-capable scanners create endpoints.

use crate::models::{Activity, Rating, Url};
use crate::store::Store;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One finding produced by a scanner. `endpoint_id` is set for
/// endpoint-level scan types and absent for url-level ones.
#[derive(Debug, Clone)]
pub struct Finding {
    pub endpoint_id: Option<u64>,
    pub scan_type: String,
    pub rating: Rating,
    pub explanation: String,
    pub is_explained: bool,
}

#[async_trait]
pub trait Scanner: Send + Sync {
    fn name(&self) -> &str;

    /// Which planning stages this scanner participates in. Discovery-only
    /// probes return `[Discover]`, plain scanners `[Scan]`, verifiers may
    /// combine stages.
    fn activities(&self) -> &[Activity];

    /// Whether findings attach to endpoints or to the url itself.
    fn endpoint_level(&self) -> bool;

    /// Discovery pass: resolve and persist endpoints (or other subjects)
    /// for the url. Default is a no-op for scanners without a discovery
    /// stage.
    async fn discover(&self, _store: &Store, _url: &Url) -> Result<()> {
        Ok(())
    }

    /// Scan pass: examine the url (or its endpoints) and return findings.
    /// Transient failures should be returned as errors; the executor records
    /// them as a not_testable outcome instead of aborting the batch.
    async fn scan(&self, store: &Store, url: &Url) -> Result<Vec<Finding>>;
}

/// Named registry of scanner capabilities.
#[derive(Default, Clone)]
pub struct ScannerRegistry {
    scanners: BTreeMap<String, Arc<dyn Scanner>>,
}

impl ScannerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scanner: Arc<dyn Scanner>) {
        self.scanners.insert(scanner.name().to_string(), scanner);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Scanner>> {
        self.scanners.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.scanners.keys().cloned().collect()
    }

    /// Scanners participating in the given planning stage, in name order.
    pub fn with_activity(&self, activity: Activity) -> Vec<Arc<dyn Scanner>> {
        self.scanners
            .values()
            .filter(|s| s.activities().contains(&activity))
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.scanners.is_empty()
    }
}

impl std::fmt::Debug for ScannerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScannerRegistry")
            .field("scanners", &self.names())
            .finish()
    }
}
