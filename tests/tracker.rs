use secmap::config::TrackerSettings;
use secmap::models::{Activity, PlanState};
use secmap::store::Store;
use secmap::tracker::Tracker;
use std::collections::HashSet;
use std::sync::Arc;
use time::macros::datetime;

fn setup() -> (Arc<Store>, Tracker) {
    let store = Arc::new(Store::new());
    let tracker = Tracker::new(store.clone(), TrackerSettings::default());
    (store, tracker)
}

#[test]
fn requesting_twice_plans_once() {
    let (store, tracker) = setup();
    let subjects = vec!["a.example.nl".to_string(), "b.example.nl".to_string()];

    assert_eq!(tracker.request(Activity::Scan, "tls", &subjects), 2);
    assert_eq!(tracker.request(Activity::Scan, "tls", &subjects), 0);
    assert_eq!(store.planned_scans().len(), 2);

    // A different scanner or activity is a different triple.
    assert_eq!(tracker.request(Activity::Scan, "dnssec", &subjects), 2);
    assert_eq!(tracker.request(Activity::Discover, "tls", &subjects), 2);
}

#[test]
fn request_after_finish_plans_again() {
    let (store, tracker) = setup();
    let subjects = vec!["a.example.nl".to_string()];

    tracker.request(Activity::Scan, "tls", &subjects);
    tracker.finish(Activity::Scan, "tls", "a.example.nl");
    assert_eq!(tracker.request(Activity::Scan, "tls", &subjects), 1);
    assert_eq!(store.planned_scans().len(), 2);
}

#[test]
fn pickup_claims_oldest_first_up_to_amount() {
    let store = Store::new();
    let t1 = datetime!(2026-01-01 10:00 UTC);
    let t2 = datetime!(2026-01-02 10:00 UTC);
    store.plan_request(Activity::Scan, "tls", &["old.example.nl".to_string()], t1);
    store.plan_request(Activity::Scan, "tls", &["new.example.nl".to_string()], t2);

    let picked = store.plan_pickup(Activity::Scan, "tls", 1, t2);
    assert_eq!(picked, vec!["old.example.nl".to_string()]);

    let picked = store.plan_pickup(Activity::Scan, "tls", 10, t2);
    assert_eq!(picked, vec!["new.example.nl".to_string()]);
    assert!(store.plan_pickup(Activity::Scan, "tls", 10, t2).is_empty());
}

#[test]
fn equal_request_times_resolve_by_insertion_order() {
    let store = Store::new();
    let t = datetime!(2026-01-01 10:00 UTC);
    store.plan_request(
        Activity::Scan,
        "tls",
        &["first.example.nl".to_string(), "second.example.nl".to_string()],
        t,
    );
    let picked = store.plan_pickup(Activity::Scan, "tls", 1, t);
    assert_eq!(picked, vec!["first.example.nl".to_string()]);
}

#[test]
fn concurrent_pickups_are_disjoint() {
    let (store, tracker) = setup();
    let subjects: Vec<String> = (0..100).map(|i| format!("url{i}.example.nl")).collect();
    tracker.request(Activity::Scan, "tls", &subjects);

    let tracker = Arc::new(tracker);
    let mut handles = Vec::new();
    for _ in 0..10 {
        let tracker = tracker.clone();
        handles.push(std::thread::spawn(move || {
            tracker.pickup(Activity::Scan, "tls", 10)
        }));
    }

    let mut all: Vec<String> = Vec::new();
    for handle in handles {
        all.extend(handle.join().expect("thread panicked"));
    }
    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(all.len(), 100);
    assert_eq!(unique.len(), 100);

    assert!(store
        .planned_scans()
        .iter()
        .all(|p| p.state == PlanState::PickedUp));
}

#[test]
fn reconciliation_finishes_only_the_non_candidates() {
    let (store, tracker) = setup();
    let requested = vec![
        "a.example.nl".to_string(),
        "b.example.nl".to_string(),
        "c.example.nl".to_string(),
    ];
    tracker.request(Activity::Scan, "tls", &requested);
    let picked = tracker.pickup(Activity::Scan, "tls", 3);
    assert_eq!(picked.len(), 3);

    let candidates = vec!["a.example.nl".to_string()];
    let finished =
        tracker.finish_those_that_wont_be_scanned(Activity::Scan, "tls", &candidates, &picked);
    assert_eq!(finished, 2);

    for plan in store.planned_scans() {
        if plan.subject == "a.example.nl" {
            assert_eq!(plan.state, PlanState::PickedUp);
        } else {
            assert_eq!(plan.state, PlanState::Finished);
        }
    }
}

#[test]
fn reclaim_requeues_stuck_pickups() {
    let store = Store::new();
    let t0 = datetime!(2026-01-01 10:00 UTC);
    store.plan_request(Activity::Scan, "tls", &["a.example.nl".to_string()], t0);
    store.plan_pickup(Activity::Scan, "tls", 1, t0);

    // Not yet past the threshold.
    assert_eq!(store.plan_reclaim(t0 - time::Duration::hours(1), t0), 0);

    let later = t0 + time::Duration::hours(25);
    assert_eq!(store.plan_reclaim(later - time::Duration::hours(24), later), 1);
    assert_eq!(store.planned_scans()[0].state, PlanState::Requested);

    // Re-queued items can be picked up again.
    assert_eq!(store.plan_pickup(Activity::Scan, "tls", 1, later).len(), 1);
}

#[test]
fn purge_drops_only_old_finished_items() {
    let store = Store::new();
    let t0 = datetime!(2026-01-01 10:00 UTC);
    store.plan_request(
        Activity::Scan,
        "tls",
        &["done.example.nl".to_string(), "open.example.nl".to_string()],
        t0,
    );
    store.plan_finish(Activity::Scan, "tls", "done.example.nl", t0);

    let cutoff = t0 + time::Duration::days(8);
    assert_eq!(store.plan_purge(cutoff), 1);

    let remaining = store.planned_scans();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].subject, "open.example.nl");
}
