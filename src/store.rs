//! In-memory storage engine behind the relational-store contract.
//!
//! Every mutating operation takes the single table lock once, so multi-row
//! invariants (one `is_latest` per key, the planned-scan claim) hold without
//! row-level compare-and-set. Readers get cloned snapshots; long-running
//! aggregation never holds the lock across its own work.
//!
//! The whole store round-trips through a JSON snapshot file so CLI
//! invocations compose: load, operate, save.

use crate::models::{
    Activity, Endpoint, HighLevelStatistic, HighLevelSummary, Lifespan, MapConfiguration,
    MapDataCache, Organization, OrganizationCalculation, OrganizationReport, PlanState,
    PlannedScan, Rating, ReportCounters, ScanResult, Url, UrlCalculation, UrlReport,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use time::OffsetDateTime;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    next_id: u64,
    organizations: Vec<Organization>,
    urls: Vec<Url>,
    endpoints: Vec<Endpoint>,
    scan_results: Vec<ScanResult>,
    planned_scans: Vec<PlannedScan>,
    url_reports: Vec<UrlReport>,
    organization_reports: Vec<OrganizationReport>,
    map_configurations: Vec<MapConfiguration>,
    vulnerability_statistics: Vec<crate::models::VulnerabilityStatistic>,
    high_level_statistics: Vec<HighLevelStatistic>,
    map_data_caches: Vec<MapDataCache>,
}

impl Tables {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Filter for organization queries. An empty filter matches everything and
/// counts as a full-database (non-narrowing) run.
#[derive(Debug, Clone, Default)]
pub struct OrganizationFilter {
    pub name: Option<String>,
    pub country: Option<String>,
    pub organization_type: Option<String>,
}

impl OrganizationFilter {
    pub fn is_narrowing(&self) -> bool {
        self.name.is_some() || self.country.is_some() || self.organization_type.is_some()
    }

    fn matches(&self, org: &Organization) -> bool {
        self.name.as_deref().is_none_or(|n| n == org.name)
            && self.country.as_deref().is_none_or(|c| c == org.country)
            && self
                .organization_type
                .as_deref()
                .is_none_or(|t| t == org.organization_type)
    }
}

#[derive(Debug, Clone, Default)]
pub struct UrlFilter {
    pub url: Option<String>,
    pub organization_id: Option<u64>,
}

impl UrlFilter {
    pub fn is_narrowing(&self) -> bool {
        self.url.is_some() || self.organization_id.is_some()
    }

    fn matches(&self, url: &Url) -> bool {
        self.url.as_deref().is_none_or(|u| u == url.url)
            && self
                .organization_id
                .is_none_or(|id| url.organization_ids.contains(&id))
    }
}

#[derive(Debug, Default)]
pub struct Store {
    inner: Mutex<Tables>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading dataset: {}", path.display()))?;
        let tables: Tables = serde_json::from_str(&raw).with_context(|| "parsing dataset JSON")?;
        Ok(Self {
            inner: Mutex::new(tables),
        })
    }

    /// Missing dataset file means an empty store; commands that need data
    /// report that through their own empty-result handling.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tables = self.inner.lock().expect("store lock poisoned");
        let raw = serde_json::to_string_pretty(&*tables)?;
        std::fs::write(path, raw)
            .with_context(|| format!("writing dataset: {}", path.display()))?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.inner.lock().expect("store lock poisoned")
    }

    // --- organizations / urls / endpoints ---

    pub fn add_organization(
        &self,
        name: &str,
        country: &str,
        organization_type: &str,
        lifespan: Lifespan,
    ) -> u64 {
        let mut t = self.lock();
        let id = t.next_id();
        t.organizations.push(Organization {
            id,
            name: name.to_string(),
            country: country.to_string(),
            organization_type: organization_type.to_string(),
            lifespan,
        });
        id
    }

    pub fn add_url(&self, url: &str, organization_ids: &[u64], lifespan: Lifespan) -> u64 {
        let mut t = self.lock();
        let id = t.next_id();
        t.urls.push(Url {
            id,
            url: url.to_string(),
            organization_ids: organization_ids.to_vec(),
            lifespan,
            onboarded: false,
            onboarded_on: None,
        });
        id
    }

    pub fn add_endpoint(
        &self,
        url_id: u64,
        protocol: &str,
        port: u16,
        ip_version: u8,
        lifespan: Lifespan,
    ) -> u64 {
        let mut t = self.lock();
        let id = t.next_id();
        t.endpoints.push(Endpoint {
            id,
            url_id,
            protocol: protocol.to_string(),
            port,
            ip_version,
            lifespan,
        });
        id
    }

    pub fn organizations(&self, filter: &OrganizationFilter) -> Vec<Organization> {
        self.lock()
            .organizations
            .iter()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect()
    }

    pub fn organization_by_id(&self, id: u64) -> Option<Organization> {
        self.lock().organizations.iter().find(|o| o.id == id).cloned()
    }

    pub fn organization_by_name(&self, name: &str) -> Option<Organization> {
        self.lock()
            .organizations
            .iter()
            .find(|o| o.name == name)
            .cloned()
    }

    pub fn urls(&self, filter: &UrlFilter) -> Vec<Url> {
        self.lock()
            .urls
            .iter()
            .filter(|u| filter.matches(u))
            .cloned()
            .collect()
    }

    pub fn url_by_name(&self, name: &str) -> Option<Url> {
        self.lock().urls.iter().find(|u| u.url == name).cloned()
    }

    pub fn url_by_id(&self, id: u64) -> Option<Url> {
        self.lock().urls.iter().find(|u| u.id == id).cloned()
    }

    pub fn endpoints_of_url(&self, url_id: u64) -> Vec<Endpoint> {
        self.lock()
            .endpoints
            .iter()
            .filter(|e| e.url_id == url_id)
            .cloned()
            .collect()
    }

    /// Marks the url onboarded exactly once. Returns false when the url was
    /// already onboarded (or unknown), so repeated finalization steps are
    /// no-ops.
    pub fn finish_onboarding(&self, url_name: &str, now: OffsetDateTime) -> bool {
        let mut t = self.lock();
        match t.urls.iter_mut().find(|u| u.url == url_name) {
            Some(url) if !url.onboarded => {
                url.onboarded = true;
                url.onboarded_on = Some(now);
                true
            }
            _ => false,
        }
    }

    // --- scan results ---

    /// Inserts a result and supersedes the previous latest for the same
    /// (url, endpoint, scan_type) in one critical section, so no two rows
    /// can both end up with `is_latest = true`.
    #[allow(clippy::too_many_arguments)]
    pub fn save_scan_result(
        &self,
        url_id: u64,
        endpoint_id: Option<u64>,
        scan_type: &str,
        rating: Rating,
        explanation: &str,
        is_explained: bool,
        discovered_at: OffsetDateTime,
    ) -> u64 {
        let mut t = self.lock();
        for existing in t.scan_results.iter_mut() {
            if existing.url_id == url_id
                && existing.endpoint_id == endpoint_id
                && existing.scan_type == scan_type
            {
                existing.is_latest = false;
            }
        }
        let id = t.next_id();
        t.scan_results.push(ScanResult {
            id,
            url_id,
            endpoint_id,
            scan_type: scan_type.to_string(),
            rating,
            explanation: explanation.to_string(),
            is_explained,
            discovered_at,
            is_latest: true,
        });
        id
    }

    pub fn scan_results_for_url(&self, url_id: u64) -> Vec<ScanResult> {
        self.lock()
            .scan_results
            .iter()
            .filter(|r| r.url_id == url_id)
            .cloned()
            .collect()
    }

    // --- planned scans ---

    /// Idempotent request: a triple with an existing non-finished row is
    /// skipped silently. Returns how many rows were newly created.
    pub fn plan_request(
        &self,
        activity: Activity,
        scanner: &str,
        subjects: &[String],
        now: OffsetDateTime,
    ) -> usize {
        let mut t = self.lock();
        let mut created = 0;
        for subject in subjects {
            let open = t.planned_scans.iter().any(|p| {
                p.activity == activity
                    && p.scanner == scanner
                    && p.subject == *subject
                    && p.state != PlanState::Finished
            });
            if open {
                continue;
            }
            let id = t.next_id();
            t.planned_scans.push(PlannedScan {
                id,
                activity,
                scanner: scanner.to_string(),
                subject: subject.clone(),
                state: PlanState::Requested,
                requested_at: now,
                last_state_change: now,
            });
            created += 1;
        }
        created
    }

    /// Atomic claim: selects up to `amount` requested rows for the
    /// (activity, scanner) pair, oldest request first (ties by insertion id),
    /// and transitions them to picked_up before releasing the lock. Two
    /// concurrent claims can never return overlapping subjects.
    pub fn plan_pickup(
        &self,
        activity: Activity,
        scanner: &str,
        amount: usize,
        now: OffsetDateTime,
    ) -> Vec<String> {
        let mut t = self.lock();
        let mut candidates: Vec<(OffsetDateTime, u64)> = t
            .planned_scans
            .iter()
            .filter(|p| {
                p.activity == activity && p.scanner == scanner && p.state == PlanState::Requested
            })
            .map(|p| (p.requested_at, p.id))
            .collect();
        candidates.sort();
        candidates.truncate(amount);

        let mut subjects = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(p) = t.planned_scans.iter_mut().find(|p| p.id == id) {
                p.state = PlanState::PickedUp;
                p.last_state_change = now;
                subjects.push(p.subject.clone());
            }
        }
        subjects
    }

    /// Transitions matching non-finished rows to finished. Unknown items are
    /// a no-op: finishes may race with manual cleanup.
    pub fn plan_finish(
        &self,
        activity: Activity,
        scanner: &str,
        subject: &str,
        now: OffsetDateTime,
    ) -> bool {
        let mut t = self.lock();
        let mut any = false;
        for p in t.planned_scans.iter_mut() {
            if p.activity == activity
                && p.scanner == scanner
                && p.subject == subject
                && p.state != PlanState::Finished
            {
                p.state = PlanState::Finished;
                p.last_state_change = now;
                any = true;
            }
        }
        any
    }

    /// Timeout edge picked_up -> requested for items whose last state change
    /// is older than `stuck_before`. Returns how many were re-queued.
    pub fn plan_reclaim(&self, stuck_before: OffsetDateTime, now: OffsetDateTime) -> usize {
        let mut t = self.lock();
        let mut reclaimed = 0;
        for p in t.planned_scans.iter_mut() {
            if p.state == PlanState::PickedUp && p.last_state_change < stuck_before {
                p.state = PlanState::Requested;
                p.last_state_change = now;
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Retention purge of finished rows older than `finished_before`.
    pub fn plan_purge(&self, finished_before: OffsetDateTime) -> usize {
        let mut t = self.lock();
        let before = t.planned_scans.len();
        t.planned_scans
            .retain(|p| p.state != PlanState::Finished || p.last_state_change >= finished_before);
        before - t.planned_scans.len()
    }

    pub fn planned_scans(&self) -> Vec<PlannedScan> {
        self.lock().planned_scans.clone()
    }

    // --- reports ---

    /// Delete-then-insert per (url, when): rebuilding the same moment twice
    /// never leaves two reports behind.
    pub fn put_url_report(
        &self,
        url_id: u64,
        when: OffsetDateTime,
        counters: ReportCounters,
        calculation: UrlCalculation,
    ) -> u64 {
        let mut t = self.lock();
        t.url_reports
            .retain(|r| !(r.url_id == url_id && r.when == when));
        let id = t.next_id();
        t.url_reports.push(UrlReport {
            id,
            url_id,
            when,
            counters,
            calculation,
        });
        id
    }

    pub fn put_organization_report(
        &self,
        organization_id: u64,
        when: OffsetDateTime,
        counters: ReportCounters,
        calculation: OrganizationCalculation,
    ) -> u64 {
        let mut t = self.lock();
        t.organization_reports
            .retain(|r| !(r.organization_id == organization_id && r.when == when));
        let id = t.next_id();
        t.organization_reports.push(OrganizationReport {
            id,
            organization_id,
            when,
            counters,
            calculation,
        });
        id
    }

    /// The report that was current as of `when`: latest `when <= t`, ties by
    /// insertion id.
    pub fn latest_url_report(&self, url_id: u64, when: OffsetDateTime) -> Option<UrlReport> {
        self.lock()
            .url_reports
            .iter()
            .filter(|r| r.url_id == url_id && r.when <= when)
            .max_by_key(|r| (r.when, r.id))
            .cloned()
    }

    pub fn latest_organization_report(
        &self,
        organization_id: u64,
        when: OffsetDateTime,
    ) -> Option<OrganizationReport> {
        self.lock()
            .organization_reports
            .iter()
            .filter(|r| r.organization_id == organization_id && r.when <= when)
            .max_by_key(|r| (r.when, r.id))
            .cloned()
    }

    pub fn url_reports_for(&self, url_id: u64) -> Vec<UrlReport> {
        self.lock()
            .url_reports
            .iter()
            .filter(|r| r.url_id == url_id)
            .cloned()
            .collect()
    }

    pub fn clear_url_reports_for(&self, url_id: u64) -> usize {
        let mut t = self.lock();
        let before = t.url_reports.len();
        t.url_reports.retain(|r| r.url_id != url_id);
        before - t.url_reports.len()
    }

    /// Administrative full clear; everything can be rebuilt from scan data.
    pub fn clear_all_reports(&self) -> usize {
        let mut t = self.lock();
        let removed = t.url_reports.len() + t.organization_reports.len();
        t.url_reports.clear();
        t.organization_reports.clear();
        removed
    }

    // --- map configurations and derived caches ---

    pub fn add_map_configuration(&self, config: MapConfiguration) {
        let mut t = self.lock();
        t.map_configurations
            .retain(|c| !(c.country == config.country && c.organization_type == config.organization_type));
        t.map_configurations.push(config);
    }

    pub fn map_configurations(&self) -> Vec<MapConfiguration> {
        let mut configs = self.lock().map_configurations.clone();
        configs.sort_by_key(|c| c.display_order);
        configs
    }

    /// Replaces all vulnerability rows for the exact (country, type, day)
    /// key. Interruption between keys leaves each key internally consistent.
    pub fn replace_vulnerability_statistics(
        &self,
        country: &str,
        organization_type: &str,
        day: time::Date,
        rows: Vec<crate::models::VulnerabilityStatistic>,
    ) {
        let mut t = self.lock();
        t.vulnerability_statistics.retain(|s| {
            !(s.country == country && s.organization_type == organization_type && s.day == day)
        });
        t.vulnerability_statistics.extend(rows);
    }

    pub fn replace_high_level_statistic(
        &self,
        country: &str,
        organization_type: &str,
        day: time::Date,
        report: HighLevelSummary,
    ) {
        let mut t = self.lock();
        t.high_level_statistics.retain(|s| {
            !(s.country == country && s.organization_type == organization_type && s.day == day)
        });
        t.high_level_statistics.push(HighLevelStatistic {
            country: country.to_string(),
            organization_type: organization_type.to_string(),
            day,
            report,
        });
    }

    pub fn replace_map_data(
        &self,
        country: &str,
        organization_type: &str,
        day: time::Date,
        filter: &str,
        dataset: serde_json::Value,
    ) {
        let mut t = self.lock();
        t.map_data_caches.retain(|c| {
            !(c.country == country
                && c.organization_type == organization_type
                && c.day == day
                && c.filter == filter)
        });
        t.map_data_caches.push(MapDataCache {
            country: country.to_string(),
            organization_type: organization_type.to_string(),
            day,
            filter: filter.to_string(),
            dataset,
        });
    }

    pub fn vulnerability_statistics(&self) -> Vec<crate::models::VulnerabilityStatistic> {
        self.lock().vulnerability_statistics.clone()
    }

    pub fn high_level_statistics(&self) -> Vec<HighLevelStatistic> {
        self.lock().high_level_statistics.clone()
    }

    pub fn map_data_caches(&self) -> Vec<MapDataCache> {
        self.lock().map_data_caches.clone()
    }
}
