use secmap::models::{Lifespan, MapConfiguration, Rating, ScanTypePolicy};
use secmap::report::rebuild_all_reports;
use secmap::stats::recompute;
use secmap::store::Store;
use time::macros::datetime;

const T1: time::OffsetDateTime = datetime!(2026-01-01 10:00 UTC);
const NOW: time::OffsetDateTime = datetime!(2026-01-03 12:00 UTC);

/// Two organizations sharing one url with a high tls finding, reports built.
fn fixture() -> Store {
    let store = Store::new();
    store.add_map_configuration(MapConfiguration {
        country: "NL".to_string(),
        organization_type: "municipality".to_string(),
        is_displayed: true,
        is_scanned: true,
        is_reported: true,
        display_order: 0,
    });

    let a = store.add_organization("Amsterdam", "NL", "municipality", Lifespan::alive_since(T1));
    let b = store.add_organization("Rotterdam", "NL", "municipality", Lifespan::alive_since(T1));
    let url_id = store.add_url("shared.example.nl", &[a, b], Lifespan::alive_since(T1));
    let endpoint_id = store.add_endpoint(url_id, "https", 443, 4, Lifespan::alive_since(T1));
    store.save_scan_result(
        url_id,
        Some(endpoint_id),
        "tls",
        Rating::High,
        "Insecure cipher suites.",
        false,
        T1,
    );

    rebuild_all_reports(&store, NOW, &ScanTypePolicy::default());
    store
}

#[test]
fn recompute_overwrites_instead_of_duplicating() {
    let store = fixture();
    let policy = ScanTypePolicy::default();

    recompute(&store, &policy, &[], &[], 1, NOW);
    let first = store.vulnerability_statistics().len();
    assert!(first > 0);

    recompute(&store, &policy, &[], &[], 1, NOW);
    assert_eq!(store.vulnerability_statistics().len(), first);
    assert_eq!(store.high_level_statistics().len(), 1);

    // One row per (config, day, scan_type) key, never two.
    let rows = store.vulnerability_statistics();
    for row in &rows {
        let same = rows
            .iter()
            .filter(|r| {
                r.country == row.country
                    && r.organization_type == row.organization_type
                    && r.day == row.day
                    && r.scan_type == row.scan_type
            })
            .count();
        assert_eq!(same, 1, "duplicate rows for {}", row.scan_type);
    }
}

#[test]
fn shared_urls_count_once_in_the_tallies() {
    let store = fixture();
    recompute(&store, &ScanTypePolicy::default(), &[], &[], 1, NOW);

    let rows = store.vulnerability_statistics();
    let total = rows
        .iter()
        .find(|r| r.scan_type == "total")
        .expect("total row");
    assert_eq!(total.urls, 1);
    assert_eq!(total.endpoints, 1);
    assert_eq!(total.high, 1);

    let tls = rows.iter().find(|r| r.scan_type == "tls").expect("tls row");
    assert_eq!(tls.high, 1);
    assert_eq!(tls.endpoints, 1);
}

#[test]
fn high_level_summary_counts_both_organizations() {
    let store = fixture();
    recompute(&store, &ScanTypePolicy::default(), &[], &[], 1, NOW);

    let stats = store.high_level_statistics();
    assert_eq!(stats.len(), 1);
    let summary = &stats[0].report;

    assert_eq!(summary.total_organizations, 2);
    assert_eq!(summary.high, 2);
    assert_eq!(summary.good, 0);
    assert_eq!(summary.high_percentage, 100);
    // Urls count once per owning organization at the pass-fail level.
    assert_eq!(summary.total_urls, 2);
    assert_eq!(summary.high_urls, 2);
    // Endpoint breakdown deduplicates the shared url.
    assert_eq!(summary.endpoints, 1);
    assert_eq!(summary.endpoint_breakdown.len(), 1);
    assert_eq!(summary.endpoint_breakdown[0].kind, "https/443 (IPv4)");
}

#[test]
fn map_caches_exist_per_filter() {
    let store = fixture();
    let policy = ScanTypePolicy::default();
    recompute(&store, &policy, &[], &[], 1, NOW);

    let caches = store.map_data_caches();
    assert_eq!(caches.len(), policy.all_types().len() + 1);

    let all = caches.iter().find(|c| c.filter == "all").expect("all filter");
    let features = all.dataset["features"].as_array().expect("features");
    assert_eq!(features.len(), 2);
    assert_eq!(features[0]["severity"], "high");

    // A filter the finding does not match renders the organization green.
    let dnssec = caches.iter().find(|c| c.filter == "dnssec").expect("dnssec");
    let features = dnssec.dataset["features"].as_array().expect("features");
    assert_eq!(features[0]["severity"], "good");
}

#[test]
fn undisplayed_or_filtered_out_configurations_are_skipped() {
    let store = fixture();
    store.add_map_configuration(MapConfiguration {
        country: "DE".to_string(),
        organization_type: "municipality".to_string(),
        is_displayed: false,
        is_scanned: false,
        is_reported: false,
        display_order: 1,
    });
    let policy = ScanTypePolicy::default();

    let keys = recompute(&store, &policy, &[], &[], 1, NOW);
    assert_eq!(keys, 1);

    let keys = recompute(&store, &policy, &["BE".to_string()], &[], 1, NOW);
    assert_eq!(keys, 0);
}

#[test]
fn explained_findings_are_tallied_by_explanation() {
    let store = Store::new();
    store.add_map_configuration(MapConfiguration {
        country: "NL".to_string(),
        organization_type: "municipality".to_string(),
        is_displayed: true,
        is_scanned: true,
        is_reported: true,
        display_order: 0,
    });
    let org = store.add_organization("Utrecht", "NL", "municipality", Lifespan::alive_since(T1));
    let url_id = store.add_url("utrecht.nl", &[org], Lifespan::alive_since(T1));
    let endpoint_id = store.add_endpoint(url_id, "https", 443, 4, Lifespan::alive_since(T1));
    store.save_scan_result(
        url_id,
        Some(endpoint_id),
        "tls",
        Rating::High,
        "Accepted risk, migration planned.",
        true,
        T1,
    );
    store.save_scan_result(
        url_id,
        Some(endpoint_id),
        "security_headers",
        Rating::Medium,
        "Repeated finding. See previous report.",
        true,
        T1,
    );

    rebuild_all_reports(&store, NOW, &ScanTypePolicy::default());
    recompute(&store, &ScanTypePolicy::default(), &[], &[], 1, NOW);

    let stats = store.high_level_statistics();
    let explained = &stats[0].report.explained;

    let tls = explained.get("tls").expect("tls entries");
    assert_eq!(tls.get("Accepted risk, migration planned."), Some(&1));
    assert_eq!(tls.get("total"), Some(&1));
    // "Repeated finding." entries never make the tally.
    assert!(explained.get("security_headers").is_none());
}
