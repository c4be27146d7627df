//! Aggregation Engine: turns the append-only scan-result history into
//! point-in-time report snapshots.
//!
//! A report for moment T embeds the full contributing detail (the
//! calculation document) and scalar counters derived purely from that
//! document. "Most recent as of T" picks the highest (discovered_at, id)
//! pair per (subject, scan_type), so identical timestamps resolve by
//! insertion sequence.

use crate::models::{
    Organization, OrganizationCalculation, RatingEntry, ReportCounters, ScanResult, ScanTypePolicy,
    SeverityCounts, Url, UrlCalculation,
};
use crate::stacking::{alive_at, more_recent};
use crate::store::{Store, UrlFilter};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use time::macros::time;
use tracing::{debug, warn};

/// Outcome summary of a batch rebuild.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RebuildOutcome {
    pub organizations: usize,
    pub url_reports: usize,
    pub organization_reports: usize,
    pub failures: usize,
}

/// The moments that matter in a url's history: the end of every day on
/// which a scan result arrived. Reporting at end-of-day makes a moment
/// include everything discovered during that day.
pub fn timeline(store: &Store, url: &Url) -> Vec<OffsetDateTime> {
    let mut days: Vec<time::Date> = store
        .scan_results_for_url(url.id)
        .iter()
        .map(|r| r.discovered_at.date())
        .collect();
    days.sort();
    days.dedup();
    days.into_iter()
        .map(|d| d.with_time(time!(23:59:59)).assume_utc())
        .collect()
}

/// Human-readable timeline dump for the `timeline` command.
pub fn inspect_timeline(store: &Store, url: &Url, policy: &ScanTypePolicy) -> String {
    let mut out = format!("timeline of {}\n", url.url);
    for moment in timeline(store, url) {
        let calculation = build_url_calculation(store, url, moment, policy);
        let counters = counters_from_url_calculation(&calculation);
        out.push_str(&format!(
            "  {} high:{} medium:{} low:{} ok:{}\n",
            moment.date(),
            counters.high,
            counters.medium,
            counters.low,
            counters.ok,
        ));
    }
    out
}

/// The active result per (endpoint, scan_type) key as of `when`: most recent
/// `discovered_at <= when`, ties broken by highest insertion id.
fn latest_per_key(results: &[ScanResult], when: OffsetDateTime) -> Vec<ScanResult> {
    let mut latest: BTreeMap<(Option<u64>, String), &ScanResult> = BTreeMap::new();
    for result in results.iter().filter(|r| r.discovered_at <= when) {
        let key = (result.endpoint_id, result.scan_type.clone());
        match latest.get(&key) {
            Some(current)
                if !more_recent(
                    (result.discovered_at, result.id),
                    (current.discovered_at, current.id),
                ) => {}
            _ => {
                latest.insert(key, result);
            }
        }
    }
    latest.into_values().cloned().collect()
}

fn rating_entry(result: &ScanResult) -> RatingEntry {
    RatingEntry {
        scan_type: result.scan_type.clone(),
        rating: result.rating,
        explanation: result.explanation.clone(),
        is_explained: result.is_explained,
        since: result.discovered_at,
    }
}

/// Assembles the audit-trail document for one url as of `when`. Endpoints
/// are stacked with the shared as-of rule; results pointing at endpoints
/// outside that set are data inconsistencies and are skipped with a log
/// line, never an error.
pub fn build_url_calculation(
    store: &Store,
    url: &Url,
    when: OffsetDateTime,
    policy: &ScanTypePolicy,
) -> UrlCalculation {
    let results = store.scan_results_for_url(url.id);
    let active = latest_per_key(&results, when);

    let endpoints: Vec<_> = store
        .endpoints_of_url(url.id)
        .into_iter()
        .filter(|e| alive_at(&e.lifespan, when))
        .collect();

    let mut url_ratings = Vec::new();
    let mut per_endpoint: BTreeMap<u64, Vec<RatingEntry>> = BTreeMap::new();

    for result in &active {
        match result.endpoint_id {
            None => {
                if policy.is_endpoint_level(&result.scan_type) {
                    warn!(
                        "skipping endpoint-level result without endpoint: url={} scan_type={}",
                        url.url, result.scan_type
                    );
                    continue;
                }
                url_ratings.push(rating_entry(result));
            }
            Some(endpoint_id) => {
                if endpoints.iter().any(|e| e.id == endpoint_id) {
                    per_endpoint
                        .entry(endpoint_id)
                        .or_default()
                        .push(rating_entry(result));
                } else {
                    debug!(
                        "result {} targets endpoint {endpoint_id} outside the as-of window",
                        result.id
                    );
                }
            }
        }
    }

    let endpoint_calculations = endpoints
        .into_iter()
        .map(|e| crate::models::EndpointCalculation {
            endpoint_id: e.id,
            protocol: e.protocol.clone(),
            port: e.port,
            ip_version: e.ip_version,
            ratings: per_endpoint.remove(&e.id).unwrap_or_default(),
        })
        .collect();

    UrlCalculation {
        url: url.url.clone(),
        ratings: url_ratings,
        endpoints: endpoint_calculations,
    }
}

/// Pure replay of a url calculation document into counters. This is the
/// only place url-level counters come from; a report's counters must equal
/// re-running this on its embedded document.
pub fn counters_from_url_calculation(calculation: &UrlCalculation) -> ReportCounters {
    let mut counters = ReportCounters::default();

    for rating in &calculation.ratings {
        if rating.is_explained {
            counters.explained_url_issues.add(rating.rating);
        } else {
            counters.url_issues.add(rating.rating);
        }
    }

    for endpoint in &calculation.endpoints {
        counters.total_endpoints += 1;
        let mut severity = SeverityCounts::default();
        for rating in &endpoint.ratings {
            if rating.is_explained {
                counters.explained_endpoint_issues.add(rating.rating);
            } else {
                counters.endpoint_issues.add(rating.rating);
                severity.add(rating.rating);
            }
        }
        if severity.high > 0 {
            counters.high_endpoints += 1;
        } else if severity.medium > 0 {
            counters.medium_endpoints += 1;
        } else if severity.low > 0 {
            counters.low_endpoints += 1;
        } else if !endpoint.ratings.is_empty() {
            counters.ok_endpoints += 1;
        }
    }

    finalize_totals(&mut counters);
    counters
}

/// Rolls organization counters up from the embedded url documents.
pub fn counters_from_organization_calculation(
    calculation: &OrganizationCalculation,
) -> ReportCounters {
    let mut counters = ReportCounters::default();

    for url_calculation in &calculation.urls {
        let child = counters_from_url_calculation(url_calculation);

        counters.url_issues.merge(child.url_issues);
        counters.endpoint_issues.merge(child.endpoint_issues);
        counters.explained_url_issues.merge(child.explained_url_issues);
        counters
            .explained_endpoint_issues
            .merge(child.explained_endpoint_issues);

        counters.total_endpoints += child.total_endpoints;
        counters.high_endpoints += child.high_endpoints;
        counters.medium_endpoints += child.medium_endpoints;
        counters.low_endpoints += child.low_endpoints;
        counters.ok_endpoints += child.ok_endpoints;

        counters.total_urls += 1;
        if child.high > 0 {
            counters.high_urls += 1;
        } else if child.medium > 0 {
            counters.medium_urls += 1;
        } else if child.low > 0 {
            counters.low_urls += 1;
        } else {
            counters.ok_urls += 1;
        }
    }

    finalize_totals(&mut counters);
    counters
}

fn finalize_totals(counters: &mut ReportCounters) {
    counters.high = counters.url_issues.high + counters.endpoint_issues.high;
    counters.medium = counters.url_issues.medium + counters.endpoint_issues.medium;
    counters.low = counters.url_issues.low + counters.endpoint_issues.low;
    counters.ok = counters.url_issues.ok + counters.endpoint_issues.ok;
    counters.total_issues = counters.url_issues.issues() + counters.endpoint_issues.issues();
    counters.explained_total_issues =
        counters.explained_url_issues.issues() + counters.explained_endpoint_issues.issues();
}

/// Builds and persists one url report snapshot. Idempotent per (url, when).
pub fn rebuild_url_report(
    store: &Store,
    url: &Url,
    when: OffsetDateTime,
    policy: &ScanTypePolicy,
) -> ReportCounters {
    let calculation = build_url_calculation(store, url, when, policy);
    let counters = counters_from_url_calculation(&calculation);
    store.put_url_report(url.id, when, counters.clone(), calculation);
    counters
}

/// Clears a url's report history and rebuilds one snapshot per timeline
/// moment. A url without any scan results still gets a single zero-counter
/// report at `now` so parents always find a child report.
pub fn rebuild_url_report_history(
    store: &Store,
    url: &Url,
    now: OffsetDateTime,
    policy: &ScanTypePolicy,
) -> usize {
    store.clear_url_reports_for(url.id);
    let moments = timeline(store, url);
    if moments.is_empty() {
        rebuild_url_report(store, url, now, policy);
        return 1;
    }
    let count = moments.len();
    for moment in moments {
        rebuild_url_report(store, url, moment, policy);
    }
    count
}

/// Assembles the organization document as of `when`: stacked urls, each
/// contributing its current report's calculation (or a freshly built one if
/// no report exists yet).
pub fn build_organization_calculation(
    store: &Store,
    organization: &Organization,
    when: OffsetDateTime,
    policy: &ScanTypePolicy,
) -> OrganizationCalculation {
    let urls: Vec<_> = store
        .urls(&UrlFilter {
            organization_id: Some(organization.id),
            ..UrlFilter::default()
        })
        .into_iter()
        .filter(|u| alive_at(&u.lifespan, when))
        .collect();

    let url_calculations = urls
        .iter()
        .map(|url| match store.latest_url_report(url.id, when) {
            Some(report) => report.calculation,
            None => build_url_calculation(store, url, when, policy),
        })
        .collect();

    OrganizationCalculation {
        organization: organization.name.clone(),
        urls: url_calculations,
    }
}

/// Builds and persists one organization report snapshot.
pub fn rebuild_organization_report(
    store: &Store,
    organization: &Organization,
    when: OffsetDateTime,
    policy: &ScanTypePolicy,
) -> ReportCounters {
    let calculation = build_organization_calculation(store, organization, when, policy);
    let counters = counters_from_organization_calculation(&calculation);
    store.put_organization_report(organization.id, when, counters.clone(), calculation);
    counters
}

/// Rebuilds an organization's report history: one snapshot per distinct
/// moment its urls have reports for, or a single empty one at `now`.
pub fn rebuild_organization_report_history(
    store: &Store,
    organization: &Organization,
    now: OffsetDateTime,
    policy: &ScanTypePolicy,
) -> usize {
    let mut moments: Vec<OffsetDateTime> = store
        .urls(&UrlFilter {
            organization_id: Some(organization.id),
            ..UrlFilter::default()
        })
        .iter()
        .flat_map(|u| store.url_reports_for(u.id))
        .map(|r| r.when)
        .collect();
    moments.sort();
    moments.dedup();

    if moments.is_empty() {
        rebuild_organization_report(store, organization, now, policy);
        return 1;
    }
    let count = moments.len();
    for moment in moments {
        rebuild_organization_report(store, organization, moment, policy);
    }
    count
}

/// Looks up a url by name for single-subject (interactive) paths, where an
/// unknown subject is a hard error rather than a logged skip.
pub fn url_by_name(store: &Store, name: &str) -> Result<Url> {
    store
        .url_by_name(name)
        .with_context(|| format!("unknown url: {name}"))
}

pub fn organization_by_name(store: &Store, name: &str) -> Result<Organization> {
    store
        .organization_by_name(name)
        .with_context(|| format!("unknown organization: {name}"))
}

/// Administrative full rebuild: drops every report, then rebuilds url and
/// organization histories from scratch.
pub fn rebuild_all_reports(
    store: &Store,
    now: OffsetDateTime,
    policy: &ScanTypePolicy,
) -> RebuildOutcome {
    store.clear_all_reports();

    let mut outcome = RebuildOutcome::default();
    let organizations = store.organizations(&Default::default());

    for organization in &organizations {
        outcome.organizations += 1;
        let urls = store.urls(&UrlFilter {
            organization_id: Some(organization.id),
            ..UrlFilter::default()
        });
        for url in &urls {
            outcome.url_reports += rebuild_url_report_history(store, url, now, policy);
        }
        outcome.organization_reports +=
            rebuild_organization_report_history(store, organization, now, policy);
    }

    // Urls not owned by any organization still get report history.
    let orphans: Vec<_> = store
        .urls(&UrlFilter::default())
        .into_iter()
        .filter(|u| u.organization_ids.is_empty())
        .collect();
    for url in &orphans {
        outcome.url_reports += rebuild_url_report_history(store, url, now, policy);
    }

    outcome
}
