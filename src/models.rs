use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strum::{Display, EnumString};
use time::OffsetDateTime;

/// Ordinal severity of a single scan finding.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Rating {
    High,
    Medium,
    Low,
    Ok,
    NotApplicable,
    NotTestable,
}

impl Rating {
    /// High, medium and low count towards issue totals; ok, not_applicable and
    /// not_testable do not.
    pub fn is_issue(self) -> bool {
        matches!(self, Rating::High | Rating::Medium | Rating::Low)
    }
}

/// The three planning stages a scanner can participate in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Activity {
    Discover,
    Verify,
    Scan,
}

/// Lifecycle of a planned work item. The only valid transitions are
/// requested -> picked_up -> finished, plus the timeout edge
/// picked_up -> requested handled by the reclaim sweep.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlanState {
    Requested,
    PickedUp,
    Finished,
}

/// Temporal window shared by organizations, urls and endpoints. An entity
/// "exists as of T" per the stacking rule in [`crate::stacking::alive_at`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lifespan {
    #[serde(with = "time::serde::rfc3339")]
    pub created_on: OffsetDateTime,
    pub is_dead: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub is_dead_since: Option<OffsetDateTime>,
}

impl Lifespan {
    pub fn alive_since(created_on: OffsetDateTime) -> Self {
        Self {
            created_on,
            is_dead: false,
            is_dead_since: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: u64,
    pub name: String,
    pub country: String,
    pub organization_type: String,
    pub lifespan: Lifespan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Url {
    pub id: u64,
    pub url: String,
    /// Many-to-many: the same url can belong to several organizations.
    pub organization_ids: Vec<u64>,
    pub lifespan: Lifespan,
    pub onboarded: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub onboarded_on: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: u64,
    pub url_id: u64,
    pub protocol: String,
    pub port: u16,
    pub ip_version: u8,
    pub lifespan: Lifespan,
}

/// Human key used in endpoint breakdowns, e.g. "https/443 (IPv4)".
fn endpoint_kind(protocol: &str, port: u16, ip_version: u8) -> String {
    let family = if ip_version == 4 { "IPv4" } else { "IPv6" };
    format!("{protocol}/{port} ({family})")
}

impl Endpoint {
    pub fn kind(&self) -> String {
        endpoint_kind(&self.protocol, self.port, self.ip_version)
    }
}

/// One scan finding. Append-only: superseding a result flips `is_latest` on
/// the previous row and inserts a new one under the same store lock.
/// `id` is the insertion sequence and the documented tie-break for results
/// sharing a `discovered_at` timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub id: u64,
    pub url_id: u64,
    /// Present for endpoint-level scan types, absent for url-level ones.
    pub endpoint_id: Option<u64>,
    pub scan_type: String,
    pub rating: Rating,
    pub explanation: String,
    pub is_explained: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub discovered_at: OffsetDateTime,
    pub is_latest: bool,
}

/// A tracked unit of pending work. At most one non-finished row exists per
/// (activity, scanner, subject) triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedScan {
    pub id: u64,
    pub activity: Activity,
    pub scanner: String,
    pub subject: String,
    pub state: PlanState,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_state_change: OffsetDateTime,
}

/// Severity tallies for one granularity (url-level or endpoint-level).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub ok: u32,
}

impl SeverityCounts {
    pub fn add(&mut self, rating: Rating) {
        match rating {
            Rating::High => self.high += 1,
            Rating::Medium => self.medium += 1,
            Rating::Low => self.low += 1,
            Rating::Ok => self.ok += 1,
            Rating::NotApplicable | Rating::NotTestable => {}
        }
    }

    pub fn merge(&mut self, other: SeverityCounts) {
        self.high += other.high;
        self.medium += other.medium;
        self.low += other.low;
        self.ok += other.ok;
    }

    pub fn issues(&self) -> u32 {
        self.high + self.medium + self.low
    }
}

/// Scalar counters of a report snapshot. Always derived from the calculation
/// document by [`crate::report::counters_from_url_calculation`] /
/// [`crate::report::counters_from_organization_calculation`], never edited
/// by hand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportCounters {
    pub total_issues: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub ok: u32,

    pub url_issues: SeverityCounts,
    pub endpoint_issues: SeverityCounts,

    /// Comply-or-explain findings count here and never into the blocks above.
    pub explained_total_issues: u32,
    pub explained_url_issues: SeverityCounts,
    pub explained_endpoint_issues: SeverityCounts,

    pub total_urls: u32,
    pub high_urls: u32,
    pub medium_urls: u32,
    pub low_urls: u32,
    pub ok_urls: u32,

    pub total_endpoints: u32,
    pub high_endpoints: u32,
    pub medium_endpoints: u32,
    pub low_endpoints: u32,
    pub ok_endpoints: u32,
}

/// One rating inside a calculation document: the active finding for a
/// (subject, scan_type) pair as of the report moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingEntry {
    pub scan_type: String,
    pub rating: Rating,
    pub explanation: String,
    pub is_explained: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub since: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointCalculation {
    pub endpoint_id: u64,
    pub protocol: String,
    pub port: u16,
    pub ip_version: u8,
    pub ratings: Vec<RatingEntry>,
}

impl EndpointCalculation {
    pub fn kind(&self) -> String {
        endpoint_kind(&self.protocol, self.port, self.ip_version)
    }
}

/// Full audit trail for one url: every active rating at url level plus every
/// endpoint with its active ratings. The single source of truth the report
/// counters are derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlCalculation {
    pub url: String,
    pub ratings: Vec<RatingEntry>,
    pub endpoints: Vec<EndpointCalculation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationCalculation {
    pub organization: String,
    pub urls: Vec<UrlCalculation>,
}

/// Immutable point-in-time snapshot for a url. A rebuild for the same
/// (url, when) replaces the previous row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlReport {
    pub id: u64,
    pub url_id: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub when: OffsetDateTime,
    pub counters: ReportCounters,
    pub calculation: UrlCalculation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationReport {
    pub id: u64,
    pub organization_id: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub when: OffsetDateTime,
    pub counters: ReportCounters,
    pub calculation: OrganizationCalculation,
}

/// A (country, organization_type) pair shown on the map. Only configurations
/// flagged `is_reported` get reports, only `is_displayed` ones get statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapConfiguration {
    pub country: String,
    pub organization_type: String,
    pub is_displayed: bool,
    pub is_scanned: bool,
    pub is_reported: bool,
    pub display_order: u32,
}

/// Per-day vulnerability tallies for one scan type (or the "total" pseudo
/// type), fully re-derivable from report history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulnerabilityStatistic {
    pub country: String,
    pub organization_type: String,
    pub day: time::Date,
    pub scan_type: String,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub ok_urls: u32,
    pub ok_endpoints: u32,
    pub urls: u32,
    pub endpoints: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointBreakdown {
    pub kind: String,
    pub protocol: String,
    pub port: u16,
    pub ip_version: u8,
    pub amount: u32,
}

/// The pass/fail summary stored per (configuration, day).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HighLevelSummary {
    pub total_organizations: u32,
    pub high: u32,
    pub medium: u32,
    pub good: u32,
    pub high_percentage: u32,
    pub medium_percentage: u32,
    pub good_percentage: u32,
    pub total_urls: u32,
    pub high_urls: u32,
    pub medium_urls: u32,
    pub good_urls: u32,
    pub high_url_percentage: u32,
    pub medium_url_percentage: u32,
    pub good_url_percentage: u32,
    pub endpoints: u32,
    pub endpoint_breakdown: Vec<EndpointBreakdown>,
    /// scan_type -> explanation -> occurrences, "Repeated finding." skipped.
    pub explained: std::collections::BTreeMap<String, std::collections::BTreeMap<String, u32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighLevelStatistic {
    pub country: String,
    pub organization_type: String,
    pub day: time::Date,
    pub report: HighLevelSummary,
}

/// Pre-rendered map payload per scan-type filter ("all" plus each type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapDataCache {
    pub country: String,
    pub organization_type: String,
    pub day: time::Date,
    pub filter: String,
    pub dataset: serde_json::Value,
}

/// Which scan types live at endpoint granularity and which at url
/// granularity. Drives counter classification and the map-data filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanTypePolicy {
    pub endpoint_level: BTreeSet<String>,
    pub url_level: BTreeSet<String>,
}

impl Default for ScanTypePolicy {
    fn default() -> Self {
        let endpoint_level = ["tls", "security_headers", "plain_https", "ftp"]
            .into_iter()
            .map(String::from)
            .collect();
        let url_level = ["dnssec", "internet_nl_web", "internet_nl_mail"]
            .into_iter()
            .map(String::from)
            .collect();
        Self {
            endpoint_level,
            url_level,
        }
    }
}

impl ScanTypePolicy {
    pub fn from_lists(endpoint_level: &[String], url_level: &[String]) -> Self {
        Self {
            endpoint_level: endpoint_level.iter().cloned().collect(),
            url_level: url_level.iter().cloned().collect(),
        }
    }

    pub fn is_endpoint_level(&self, scan_type: &str) -> bool {
        self.endpoint_level.contains(scan_type)
    }

    pub fn is_url_level(&self, scan_type: &str) -> bool {
        self.url_level.contains(scan_type)
    }

    pub fn is_known(&self, scan_type: &str) -> bool {
        self.is_endpoint_level(scan_type) || self.is_url_level(scan_type)
    }

    pub fn all_types(&self) -> Vec<String> {
        self.endpoint_level
            .iter()
            .chain(self.url_level.iter())
            .cloned()
            .collect()
    }
}
