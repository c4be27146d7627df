//! Planned-Scan Tracker: the durable queue of (activity, scanner, subject)
//! work items that keeps planning idempotent and execution accountable.

use crate::config::TrackerSettings;
use crate::models::Activity;
use crate::store::Store;
use std::collections::HashSet;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

pub struct Tracker {
    store: Arc<Store>,
    settings: TrackerSettings,
}

impl Tracker {
    pub fn new(store: Arc<Store>, settings: TrackerSettings) -> Self {
        Self { store, settings }
    }

    /// Requests a scan for each subject. Triples that already have a
    /// non-finished item are skipped silently; an empty subject list is fine.
    pub fn request(&self, activity: Activity, scanner: &str, subjects: &[String]) -> usize {
        let created = self
            .store
            .plan_request(activity, scanner, subjects, OffsetDateTime::now_utc());
        info!(
            "planned {created} of {} subjects for {activity}/{scanner}",
            subjects.len()
        );
        created
    }

    /// Claims up to `amount` requested subjects, oldest first. Safe under
    /// concurrent callers: the claim is one store transaction, so racing
    /// pickups receive disjoint (possibly empty) sets.
    pub fn pickup(&self, activity: Activity, scanner: &str, amount: usize) -> Vec<String> {
        let subjects = self
            .store
            .plan_pickup(activity, scanner, amount, OffsetDateTime::now_utc());
        debug!("picked up {} subjects for {activity}/{scanner}", subjects.len());
        subjects
    }

    /// Marks a picked-up (or still requested) item finished. Finishing an
    /// unknown item is a no-op, not an error.
    pub fn finish(&self, activity: Activity, scanner: &str, subject: &str) {
        self.store
            .plan_finish(activity, scanner, subject, OffsetDateTime::now_utc());
    }

    /// Reconciliation after pickup: the per-task candidate query can be a
    /// stricter subset of the planning query. Whatever was requested but is
    /// not a candidate is finished immediately so it does not stay picked up
    /// forever.
    pub fn finish_those_that_wont_be_scanned(
        &self,
        activity: Activity,
        scanner: &str,
        candidates: &[String],
        requested_subjects: &[String],
    ) -> usize {
        let candidate_set: HashSet<&str> = candidates.iter().map(String::as_str).collect();
        let mut finished = 0;
        for subject in requested_subjects {
            if !candidate_set.contains(subject.as_str()) {
                self.finish(activity, scanner, subject);
                finished += 1;
            }
        }
        if finished > 0 {
            info!("finished {finished} subjects for {activity}/{scanner} that won't be scanned");
        }
        finished
    }

    /// The sweep for workers that crashed between pickup and finish: items
    /// stuck in picked_up past the configured timeout go back to requested.
    pub fn reclaim_stuck(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let threshold = now - Duration::minutes(self.settings.pickup_timeout_minutes as i64);
        let reclaimed = self.store.plan_reclaim(threshold, now);
        if reclaimed > 0 {
            info!("re-queued {reclaimed} stuck planned scans");
        }
        reclaimed
    }

    /// Retention purge of finished items older than the configured window.
    pub fn purge_finished(&self) -> usize {
        let threshold = OffsetDateTime::now_utc()
            - Duration::days(self.settings.finished_retention_days as i64);
        let purged = self.store.plan_purge(threshold);
        if purged > 0 {
            info!("purged {purged} finished planned scans");
        }
        purged
    }
}
