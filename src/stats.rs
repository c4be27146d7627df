//! Statistics Roll-up: cross-organization tallies and map caches derived
//! from report snapshots.
//!
//! Everything here is a fully re-derivable cache. Each recompute replaces
//! the rows for its exact (configuration, day[, filter]) key with a
//! delete-then-insert, so an interrupted run can never mix stale and fresh
//! data inside one key; interruption between keys is fine because each key
//! is independently consistent.

use crate::models::{
    EndpointBreakdown, HighLevelSummary, MapConfiguration, Organization, OrganizationReport,
    ScanTypePolicy, VulnerabilityStatistic,
};
use crate::report::counters_from_url_calculation;
use crate::stacking::alive_at;
use crate::store::{OrganizationFilter, Store};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

/// Explanations opening with this prefix are bookkeeping noise, not worth a
/// line in the explanation tallies.
const REPEATED_FINDING_PREFIX: &str = "Repeated finding.";

/// Displayed map configurations, optionally narrowed by country and
/// organization type, in display order.
pub fn filter_map_configs(
    store: &Store,
    countries: &[String],
    organization_types: &[String],
) -> Vec<MapConfiguration> {
    store
        .map_configurations()
        .into_iter()
        .filter(|c| c.is_displayed)
        .filter(|c| countries.is_empty() || countries.contains(&c.country))
        .filter(|c| {
            organization_types.is_empty() || organization_types.contains(&c.organization_type)
        })
        .collect()
}

#[derive(Debug, Default, Clone)]
struct TypeTally {
    high: u32,
    medium: u32,
    low: u32,
    ok_urls: u32,
    ok_endpoints: u32,
    applicable_urls: u32,
    applicable_endpoints: u32,
}

/// Recomputes vulnerability statistics, the high-level summary and the map
/// caches for each displayed configuration over the last `days` calendar
/// days, oldest day first. Returns the number of (configuration, day) keys
/// recomputed.
pub fn recompute(
    store: &Store,
    policy: &ScanTypePolicy,
    countries: &[String],
    organization_types: &[String],
    days: u32,
    now: OffsetDateTime,
) -> usize {
    let configs = filter_map_configs(store, countries, organization_types);
    info!(
        "recomputing statistics for {} configurations over {days} days",
        configs.len()
    );

    let mut keys = 0;
    for config in &configs {
        for days_back in (0..days).rev() {
            let when = now - Duration::days(days_back as i64);
            debug!(
                "statistics for {}/{} at {}",
                config.country,
                config.organization_type,
                when.date()
            );
            let scope = organization_scope(store, config, when);
            recompute_vulnerability_statistics(store, config, when, &scope);
            recompute_high_level_statistic(store, config, when, &scope);
            recompute_map_data(store, policy, config, when, &scope);
            keys += 1;
        }
    }
    keys
}

/// The organizations in scope for a configuration as of `when`, paired with
/// the report that was current at that moment. Organizations without a
/// report yet contribute nothing.
fn organization_scope(
    store: &Store,
    config: &MapConfiguration,
    when: OffsetDateTime,
) -> Vec<(Organization, OrganizationReport)> {
    store
        .organizations(&OrganizationFilter {
            country: Some(config.country.clone()),
            organization_type: Some(config.organization_type.clone()),
            ..OrganizationFilter::default()
        })
        .into_iter()
        .filter(|o| alive_at(&o.lifespan, when))
        .filter_map(|o| {
            let report = store.latest_organization_report(o.id, when)?;
            Some((o, report))
        })
        .collect()
}

/// Per-scan-type tallies plus a "total" pseudo type. Urls shared by several
/// organizations are counted once per day, no matter how many organizations
/// reference them. Explained findings stay out of these tallies; they have
/// their own bookkeeping in the high-level summary.
fn recompute_vulnerability_statistics(
    store: &Store,
    config: &MapConfiguration,
    when: OffsetDateTime,
    scope: &[(Organization, OrganizationReport)],
) {
    let mut measurement: BTreeMap<String, TypeTally> = BTreeMap::new();
    let mut processed_urls: BTreeSet<String> = BTreeSet::new();
    let mut number_of_urls = 0u32;
    let mut number_of_endpoints = 0u32;

    for (_, report) in scope {
        for url in &report.calculation.urls {
            if !processed_urls.insert(url.url.clone()) {
                continue;
            }
            number_of_urls += 1;
            number_of_endpoints += url.endpoints.len() as u32;

            for rating in url.ratings.iter().filter(|r| !r.is_explained) {
                let tally = measurement.entry(rating.scan_type.clone()).or_default();
                tally.applicable_urls += 1;
                match rating.rating {
                    crate::models::Rating::High => tally.high += 1,
                    crate::models::Rating::Medium => tally.medium += 1,
                    crate::models::Rating::Low => tally.low += 1,
                    crate::models::Rating::Ok => tally.ok_urls += 1,
                    _ => {}
                }
            }

            for endpoint in &url.endpoints {
                for rating in endpoint.ratings.iter().filter(|r| !r.is_explained) {
                    let tally = measurement.entry(rating.scan_type.clone()).or_default();
                    tally.applicable_endpoints += 1;
                    match rating.rating {
                        crate::models::Rating::High => tally.high += 1,
                        crate::models::Rating::Medium => tally.medium += 1,
                        crate::models::Rating::Low => tally.low += 1,
                        crate::models::Rating::Ok => tally.ok_endpoints += 1,
                        _ => {}
                    }
                }
            }
        }
    }

    let mut total = TypeTally::default();
    for tally in measurement.values() {
        total.high += tally.high;
        total.medium += tally.medium;
        total.low += tally.low;
        total.ok_urls += tally.ok_urls;
        total.ok_endpoints += tally.ok_endpoints;
    }
    total.applicable_urls = number_of_urls;
    total.applicable_endpoints = number_of_endpoints;
    measurement.insert("total".to_string(), total);

    let rows = measurement
        .into_iter()
        .map(|(scan_type, tally)| VulnerabilityStatistic {
            country: config.country.clone(),
            organization_type: config.organization_type.clone(),
            day: when.date(),
            scan_type,
            high: tally.high,
            medium: tally.medium,
            low: tally.low,
            ok_urls: tally.ok_urls,
            ok_endpoints: tally.ok_endpoints,
            urls: tally.applicable_urls,
            endpoints: tally.applicable_endpoints,
        })
        .collect();

    store.replace_vulnerability_statistics(
        &config.country,
        &config.organization_type,
        when.date(),
        rows,
    );
}

fn percentage(part: u32, whole: u32) -> u32 {
    if whole == 0 {
        0
    } else {
        ((part as f64 / whole as f64) * 100.0).round() as u32
    }
}

fn recompute_high_level_statistic(
    store: &Store,
    config: &MapConfiguration,
    when: OffsetDateTime,
    scope: &[(Organization, OrganizationReport)],
) {
    let mut summary = HighLevelSummary::default();
    let mut seen_urls: BTreeSet<String> = BTreeSet::new();
    let mut breakdown: BTreeMap<String, EndpointBreakdown> = BTreeMap::new();

    for (_, report) in scope {
        summary.total_organizations += 1;
        if report.counters.high > 0 {
            summary.high += 1;
        } else if report.counters.medium > 0 {
            summary.medium += 1;
        } else {
            summary.good += 1;
        }

        for url in &report.calculation.urls {
            let child = counters_from_url_calculation(url);
            summary.total_urls += 1;
            if child.high > 0 {
                summary.high_urls += 1;
            } else if child.medium > 0 {
                summary.medium_urls += 1;
            } else {
                summary.good_urls += 1;
            }

            // Endpoint and explanation stats are skewed by urls shared
            // between organizations, so those are deduplicated.
            if !seen_urls.insert(url.url.clone()) {
                continue;
            }

            for rating in url.ratings.iter().chain(
                url.endpoints.iter().flat_map(|e| e.ratings.iter()),
            ) {
                if !rating.is_explained
                    || rating.explanation.starts_with(REPEATED_FINDING_PREFIX)
                {
                    continue;
                }
                let per_type = summary.explained.entry(rating.scan_type.clone()).or_default();
                *per_type.entry(rating.explanation.clone()).or_insert(0) += 1;
                *per_type.entry("total".to_string()).or_insert(0) += 1;
            }

            for endpoint in &url.endpoints {
                let kind = endpoint.kind();
                let entry = breakdown.entry(kind.clone()).or_insert(EndpointBreakdown {
                    kind,
                    protocol: endpoint.protocol.clone(),
                    port: endpoint.port,
                    ip_version: endpoint.ip_version,
                    amount: 0,
                });
                entry.amount += 1;
                summary.endpoints += 1;
            }
        }
    }

    summary.high_percentage = percentage(summary.high, summary.total_organizations);
    summary.medium_percentage = percentage(summary.medium, summary.total_organizations);
    summary.good_percentage = percentage(summary.good, summary.total_organizations);
    summary.high_url_percentage = percentage(summary.high_urls, summary.total_urls);
    summary.medium_url_percentage = percentage(summary.medium_urls, summary.total_urls);
    summary.good_url_percentage = percentage(summary.good_urls, summary.total_urls);
    summary.endpoint_breakdown = breakdown.into_values().collect();

    store.replace_high_level_statistic(
        &config.country,
        &config.organization_type,
        when.date(),
        summary,
    );
}

/// One cache row per scan-type filter ("all" plus every configured type):
/// a feature list with per-organization severity, ready for map rendering.
fn recompute_map_data(
    store: &Store,
    policy: &ScanTypePolicy,
    config: &MapConfiguration,
    when: OffsetDateTime,
    scope: &[(Organization, OrganizationReport)],
) {
    let mut filters = policy.all_types();
    filters.push("all".to_string());

    for filter in &filters {
        let features: Vec<serde_json::Value> = scope
            .iter()
            .map(|(organization, report)| {
                let (high, medium, low, ok) = severity_for_filter(report, filter);
                let severity = if high > 0 {
                    "high"
                } else if medium > 0 {
                    "medium"
                } else if low > 0 {
                    "low"
                } else {
                    "good"
                };
                json!({
                    "organization": organization.name,
                    "high": high,
                    "medium": medium,
                    "low": low,
                    "ok": ok,
                    "severity": severity,
                })
            })
            .collect();

        let dataset = json!({
            "country": config.country,
            "organization_type": config.organization_type,
            "filter": filter,
            "features": features,
        });

        store.replace_map_data(
            &config.country,
            &config.organization_type,
            when.date(),
            filter,
            dataset,
        );
    }
}

fn severity_for_filter(report: &OrganizationReport, filter: &str) -> (u32, u32, u32, u32) {
    if filter == "all" {
        let c = &report.counters;
        return (c.high, c.medium, c.low, c.ok);
    }

    let (mut high, mut medium, mut low, mut ok) = (0, 0, 0, 0);
    for url in &report.calculation.urls {
        for rating in url
            .ratings
            .iter()
            .chain(url.endpoints.iter().flat_map(|e| e.ratings.iter()))
            .filter(|r| r.scan_type == filter && !r.is_explained)
        {
            match rating.rating {
                crate::models::Rating::High => high += 1,
                crate::models::Rating::Medium => medium += 1,
                crate::models::Rating::Low => low += 1,
                crate::models::Rating::Ok => ok += 1,
                _ => {}
            }
        }
    }
    (high, medium, low, ok)
}
