use secmap::models::{Lifespan, Rating, ScanTypePolicy};
use secmap::report::{
    build_url_calculation, counters_from_url_calculation, rebuild_all_reports,
    rebuild_organization_report, rebuild_url_report, rebuild_url_report_history, timeline,
};
use secmap::store::Store;
use time::macros::datetime;

const T1: time::OffsetDateTime = datetime!(2026-01-01 10:00 UTC);
const T2: time::OffsetDateTime = datetime!(2026-01-02 10:00 UTC);
const T3: time::OffsetDateTime = datetime!(2026-01-03 23:59:59 UTC);

struct Fixture {
    store: Store,
    org_id: u64,
    url_id: u64,
}

/// One organization, one url, one https endpoint with: tls high on day one,
/// superseded by tls medium on day two, plus headers ok on day one.
fn fixture() -> Fixture {
    let store = Store::new();
    let org_id = store.add_organization("Amsterdam", "NL", "municipality", Lifespan::alive_since(T1));
    let url_id = store.add_url("amsterdam.nl", &[org_id], Lifespan::alive_since(T1));
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
    store.save_scan_result(
        url_id,
        Some(endpoint_id),
        "security_headers",
        Rating::Ok,
        "All headers present.",
        false,
        T1,
    );
    store.save_scan_result(
        url_id,
        Some(endpoint_id),
        "tls",
        Rating::Medium,
        "Weak key exchange.",
        false,
        T2,
    );

    Fixture {
        store,
        org_id,
        url_id,
    }
}

#[test]
fn latest_result_per_scan_type_wins() {
    let fx = fixture();
    let url = fx.store.url_by_id(fx.url_id).expect("url exists");
    let policy = ScanTypePolicy::default();

    let calculation = build_url_calculation(&fx.store, &url, T3, &policy);
    let counters = counters_from_url_calculation(&calculation);

    assert_eq!(counters.high, 0);
    assert_eq!(counters.medium, 1);
    assert_eq!(counters.ok, 1);
    assert_eq!(counters.medium_endpoints, 1);
    assert_eq!(counters.total_endpoints, 1);
}

#[test]
fn earlier_moments_see_the_result_active_back_then() {
    let fx = fixture();
    let url = fx.store.url_by_id(fx.url_id).expect("url exists");
    let policy = ScanTypePolicy::default();

    let end_of_day_one = datetime!(2026-01-01 23:59:59 UTC);
    let counters =
        counters_from_url_calculation(&build_url_calculation(&fx.store, &url, end_of_day_one, &policy));
    assert_eq!(counters.high, 1);
    assert_eq!(counters.medium, 0);
    assert_eq!(counters.ok, 1);
}

#[test]
fn timeline_has_one_end_of_day_moment_per_result_day() {
    let fx = fixture();
    let url = fx.store.url_by_id(fx.url_id).expect("url exists");

    let moments = timeline(&fx.store, &url);
    assert_eq!(
        moments,
        vec![
            datetime!(2026-01-01 23:59:59 UTC),
            datetime!(2026-01-02 23:59:59 UTC),
        ]
    );
}

#[test]
fn identical_timestamps_resolve_by_insertion_order() {
    let store = Store::new();
    let url_id = store.add_url("example.nl", &[], Lifespan::alive_since(T1));
    let endpoint_id = store.add_endpoint(url_id, "https", 443, 4, Lifespan::alive_since(T1));
    store.save_scan_result(url_id, Some(endpoint_id), "tls", Rating::High, "first", false, T1);
    store.save_scan_result(url_id, Some(endpoint_id), "tls", Rating::Ok, "second", false, T1);

    let url = store.url_by_id(url_id).expect("url exists");
    let calculation = build_url_calculation(&store, &url, T3, &ScanTypePolicy::default());
    let ratings = &calculation.endpoints[0].ratings;
    assert_eq!(ratings.len(), 1);
    assert_eq!(ratings[0].rating, Rating::Ok);
    assert_eq!(ratings[0].explanation, "second");
}

#[test]
fn counters_equal_a_replay_of_the_embedded_calculation() {
    let fx = fixture();
    let url = fx.store.url_by_id(fx.url_id).expect("url exists");
    let policy = ScanTypePolicy::default();

    rebuild_url_report(&fx.store, &url, T3, &policy);
    let report = fx.store.latest_url_report(fx.url_id, T3).expect("report exists");
    assert_eq!(report.counters, counters_from_url_calculation(&report.calculation));
}

#[test]
fn building_twice_yields_identical_documents() {
    let fx = fixture();
    let url = fx.store.url_by_id(fx.url_id).expect("url exists");
    let policy = ScanTypePolicy::default();

    let first = build_url_calculation(&fx.store, &url, T3, &policy);
    let second = build_url_calculation(&fx.store, &url, T3, &policy);
    assert_eq!(first, second);
}

#[test]
fn counters_are_stable_across_a_result_free_gap() {
    let fx = fixture();
    let url = fx.store.url_by_id(fx.url_id).expect("url exists");
    let policy = ScanTypePolicy::default();

    // No results arrive after day two; any two later moments must agree.
    let earlier = datetime!(2026-01-05 00:00 UTC);
    let later = datetime!(2026-03-01 00:00 UTC);
    let at_earlier =
        counters_from_url_calculation(&build_url_calculation(&fx.store, &url, earlier, &policy));
    let at_later =
        counters_from_url_calculation(&build_url_calculation(&fx.store, &url, later, &policy));
    assert_eq!(at_earlier, at_later);

    let org = fx.store.organization_by_id(fx.org_id).expect("org exists");
    assert_eq!(
        rebuild_organization_report(&fx.store, &org, earlier, &policy),
        rebuild_organization_report(&fx.store, &org, later, &policy),
    );
}

#[test]
fn history_rebuild_is_stable_without_new_scans() {
    let fx = fixture();
    let url = fx.store.url_by_id(fx.url_id).expect("url exists");
    let policy = ScanTypePolicy::default();

    let first = rebuild_url_report_history(&fx.store, &url, T3, &policy);
    let snapshot: Vec<_> = fx
        .store
        .url_reports_for(fx.url_id)
        .into_iter()
        .map(|r| (r.when, r.counters))
        .collect();

    let second = rebuild_url_report_history(&fx.store, &url, T3, &policy);
    let replay: Vec<_> = fx
        .store
        .url_reports_for(fx.url_id)
        .into_iter()
        .map(|r| (r.when, r.counters))
        .collect();

    assert_eq!(first, second);
    assert_eq!(snapshot, replay);
}

#[test]
fn full_rebuild_reproduces_counters_bit_for_bit() {
    let fx = fixture();
    let policy = ScanTypePolicy::default();

    rebuild_all_reports(&fx.store, T3, &policy);
    let snapshot = serde_json::to_string(
        &fx.store
            .latest_organization_report(fx.org_id, T3)
            .expect("org report")
            .counters,
    )
    .expect("serialize");

    rebuild_all_reports(&fx.store, T3, &policy);
    let replay = serde_json::to_string(
        &fx.store
            .latest_organization_report(fx.org_id, T3)
            .expect("org report")
            .counters,
    )
    .expect("serialize");

    assert_eq!(snapshot, replay);
}

#[test]
fn organization_report_rolls_up_its_urls() {
    let fx = fixture();
    let org = fx.store.organization_by_id(fx.org_id).expect("org exists");
    let policy = ScanTypePolicy::default();

    let counters = rebuild_organization_report(&fx.store, &org, T3, &policy);
    assert_eq!(counters.total_urls, 1);
    assert_eq!(counters.medium_urls, 1);
    assert_eq!(counters.medium, 1);
    assert_eq!(counters.ok, 1);
}

#[test]
fn organization_without_urls_gets_an_empty_report() {
    let store = Store::new();
    let org_id = store.add_organization("Empty", "NL", "municipality", Lifespan::alive_since(T1));
    let org = store.organization_by_id(org_id).expect("org exists");

    let counters = rebuild_organization_report(&store, &org, T3, &ScanTypePolicy::default());
    assert_eq!(counters.total_urls, 0);
    assert_eq!(counters.total_issues, 0);
    assert!(store.latest_organization_report(org_id, T3).is_some());
}

#[test]
fn dead_endpoints_drop_out_of_later_moments() {
    let store = Store::new();
    let url_id = store.add_url("example.nl", &[], Lifespan::alive_since(T1));
    let endpoint_id = store.add_endpoint(
        url_id,
        "https",
        443,
        4,
        Lifespan {
            created_on: T1,
            is_dead: true,
            is_dead_since: Some(T2),
        },
    );
    store.save_scan_result(url_id, Some(endpoint_id), "tls", Rating::High, "x", false, T1);

    let url = store.url_by_id(url_id).expect("url exists");
    let policy = ScanTypePolicy::default();

    let within = build_url_calculation(&store, &url, datetime!(2026-01-01 23:59:59 UTC), &policy);
    assert_eq!(within.endpoints.len(), 1);

    let after = build_url_calculation(&store, &url, T3, &policy);
    assert!(after.endpoints.is_empty());
    assert_eq!(counters_from_url_calculation(&after).high, 0);
}

#[test]
fn endpoint_level_results_without_an_endpoint_are_skipped() {
    let store = Store::new();
    let url_id = store.add_url("example.nl", &[], Lifespan::alive_since(T1));
    // tls is endpoint-level; a result without endpoint_id is inconsistent.
    store.save_scan_result(url_id, None, "tls", Rating::High, "broken", false, T1);
    store.save_scan_result(url_id, None, "dnssec", Rating::Ok, "signed", false, T1);

    let url = store.url_by_id(url_id).expect("url exists");
    let calculation = build_url_calculation(&store, &url, T3, &ScanTypePolicy::default());

    assert_eq!(calculation.ratings.len(), 1);
    assert_eq!(calculation.ratings[0].scan_type, "dnssec");
}

#[test]
fn explained_findings_count_separately() {
    let store = Store::new();
    let url_id = store.add_url("example.nl", &[], Lifespan::alive_since(T1));
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

    let url = store.url_by_id(url_id).expect("url exists");
    let counters = counters_from_url_calculation(&build_url_calculation(
        &store,
        &url,
        T3,
        &ScanTypePolicy::default(),
    ));

    assert_eq!(counters.high, 0);
    assert_eq!(counters.total_issues, 0);
    assert_eq!(counters.explained_total_issues, 1);
    assert_eq!(counters.explained_endpoint_issues.high, 1);
}
