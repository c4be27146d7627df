//! Task-graph interpreter.
//!
//! Sequences run strictly in order and abort their own remaining steps on
//! failure; parallel groups run concurrently on a [`JoinSet`] and never
//! abort siblings; best-effort wrappers absorb failure so surrounding
//! sequences keep going. Scanner trouble becomes a recorded `not_testable`
//! outcome instead of sinking the batch.

use crate::compose::{Step, TaskGraph, compose_onboarding};
use crate::models::{Activity, Rating, ScanTypePolicy};
use crate::report::{
    rebuild_organization_report_history, rebuild_url_report_history,
};
use crate::scanners::ScannerRegistry;
use crate::stacking::alive_at;
use crate::stats;
use crate::store::{Store, UrlFilter};
use crate::tracker::Tracker;
use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Tally of leaf steps over one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunSummary {
    fn merge(&mut self, other: RunSummary) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// A node's summary plus whether its parent sequence should continue.
struct NodeOutcome {
    summary: RunSummary,
    ok: bool,
}

/// Cheap to clone: the store is shared, the registry holds `Arc`ed
/// scanners. Every spawned subtree gets its own handle.
#[derive(Clone)]
pub struct Executor {
    store: Arc<Store>,
    registry: ScannerRegistry,
    policy: ScanTypePolicy,
}

impl Executor {
    pub fn new(store: Arc<Store>, registry: ScannerRegistry, policy: ScanTypePolicy) -> Self {
        Self {
            store,
            registry,
            policy,
        }
    }

    /// Runs a graph to completion and reports the step tally. `now` is the
    /// moment recorded on everything the run persists, so a run is
    /// reproducible under a fixed clock.
    pub async fn run(&self, graph: TaskGraph, now: OffsetDateTime) -> RunSummary {
        let outcome = self.clone().run_node(graph, now).await;
        info!(
            "run complete: {} processed, {} failed, {} skipped",
            outcome.summary.processed, outcome.summary.failed, outcome.summary.skipped
        );
        outcome.summary
    }

    fn run_node(
        self,
        graph: TaskGraph,
        now: OffsetDateTime,
    ) -> Pin<Box<dyn Future<Output = NodeOutcome> + Send>> {
        Box::pin(async move {
            match graph {
                TaskGraph::Task(step) => self.run_step(step, now).await,
                TaskGraph::Sequence(members) => {
                    let mut summary = RunSummary::default();
                    let mut remaining = members.into_iter();
                    while let Some(member) = remaining.next() {
                        let outcome = self.clone().run_node(member, now).await;
                        summary.merge(outcome.summary);
                        if !outcome.ok {
                            // The rest of this sequence cannot run; siblings
                            // of the sequence are unaffected.
                            summary.skipped += remaining.map(|m| m.step_count()).sum::<usize>();
                            return NodeOutcome { summary, ok: false };
                        }
                    }
                    NodeOutcome { summary, ok: true }
                }
                TaskGraph::Parallel(members) => {
                    let mut set = JoinSet::new();
                    for member in members {
                        set.spawn(self.clone().run_node(member, now));
                    }
                    let mut summary = RunSummary::default();
                    let mut ok = true;
                    while let Some(joined) = set.join_next().await {
                        match joined {
                            Ok(outcome) => {
                                summary.merge(outcome.summary);
                                ok &= outcome.ok;
                            }
                            Err(err) => {
                                error!("task panicked: {err}");
                                summary.failed += 1;
                                ok = false;
                            }
                        }
                    }
                    NodeOutcome { summary, ok }
                }
                TaskGraph::BestEffort(inner) => {
                    let mut outcome = self.run_node(*inner, now).await;
                    if !outcome.ok {
                        debug!("best-effort group absorbed a failure");
                        outcome.ok = true;
                    }
                    outcome
                }
            }
        })
    }

    async fn run_step(&self, step: Step, now: OffsetDateTime) -> NodeOutcome {
        let mut summary = RunSummary::default();
        let mut ok = true;

        match step {
            Step::NoOp => {}
            Step::Discover { scanner, url } => match self.subject(&scanner, &url) {
                Some((scanner, url)) => {
                    if let Err(err) = scanner.discover(&self.store, &url).await {
                        warn!("discovery of {} via {} failed: {err:#}", url.url, scanner.name());
                        summary.failed += 1;
                        ok = false;
                    } else {
                        summary.processed += 1;
                    }
                }
                None => {
                    summary.failed += 1;
                    ok = false;
                }
            },
            Step::Scan { scanner, url } => match self.subject(&scanner, &url) {
                Some((scanner, url)) => {
                    match scanner.scan(&self.store, &url).await {
                        Ok(findings) => {
                            for finding in findings {
                                self.store.save_scan_result(
                                    url.id,
                                    finding.endpoint_id,
                                    &finding.scan_type,
                                    finding.rating,
                                    &finding.explanation,
                                    finding.is_explained,
                                    now,
                                );
                            }
                            summary.processed += 1;
                        }
                        Err(err) => {
                            // The subject could not be examined; that is an
                            // answer too, and it supersedes the previous one.
                            // Endpoint-level scanners record it per stacked
                            // endpoint so it shows up in the calculation
                            // document like any other finding.
                            warn!("scan of {} via {} failed: {err:#}", url.url, scanner.name());
                            let explanation = format!("{err:#}");
                            let endpoint_ids: Vec<u64> = if scanner.endpoint_level() {
                                self.store
                                    .endpoints_of_url(url.id)
                                    .into_iter()
                                    .filter(|e| alive_at(&e.lifespan, now))
                                    .map(|e| e.id)
                                    .collect()
                            } else {
                                Vec::new()
                            };
                            if endpoint_ids.is_empty() {
                                self.store.save_scan_result(
                                    url.id,
                                    None,
                                    scanner.name(),
                                    Rating::NotTestable,
                                    &explanation,
                                    false,
                                    now,
                                );
                            } else {
                                for endpoint_id in endpoint_ids {
                                    self.store.save_scan_result(
                                        url.id,
                                        Some(endpoint_id),
                                        scanner.name(),
                                        Rating::NotTestable,
                                        &explanation,
                                        false,
                                        now,
                                    );
                                }
                            }
                            summary.processed += 1;
                        }
                    }
                }
                None => {
                    summary.failed += 1;
                    ok = false;
                }
            },
            Step::FinishOnboarding { url } => {
                if self.store.finish_onboarding(&url, now) {
                    info!("finished onboarding of {url}");
                } else {
                    debug!("{url} was already onboarded");
                }
                summary.processed += 1;
            }
            Step::RebuildUrlReports { urls } => {
                // Urls rebuild independently; one unknown or broken url must
                // not keep the others from getting fresh reports.
                for name in &urls {
                    match self.store.url_by_name(name) {
                        Some(url) => {
                            rebuild_url_report_history(&self.store, &url, now, &self.policy);
                            summary.processed += 1;
                        }
                        None => {
                            warn!("cannot rebuild reports for unknown url {name}");
                            summary.failed += 1;
                        }
                    }
                }
            }
            Step::RebuildOrganizationReport { organization } => {
                match self.store.organization_by_name(&organization) {
                    Some(org) => {
                        rebuild_organization_report_history(&self.store, &org, now, &self.policy);
                        summary.processed += 1;
                    }
                    None => {
                        warn!("cannot rebuild report for unknown organization {organization}");
                        summary.failed += 1;
                        ok = false;
                    }
                }
            }
            Step::RecomputeStatistics {
                countries,
                organization_types,
                days,
            } => {
                let keys = stats::recompute(
                    &self.store,
                    &self.policy,
                    &countries,
                    &organization_types,
                    days,
                    now,
                );
                summary.processed += keys;
            }
        }

        NodeOutcome { summary, ok }
    }

    fn subject(
        &self,
        scanner: &str,
        url: &str,
    ) -> Option<(Arc<dyn crate::scanners::Scanner>, crate::models::Url)> {
        let Some(scanner) = self.registry.get(scanner) else {
            error!("no scanner registered under the name {scanner}");
            return None;
        };
        let Some(url) = self.store.url_by_name(url) else {
            error!("scan step references unknown url {url}");
            return None;
        };
        Some((scanner, url))
    }

    /// The worker loop body: claim planned subjects, reconcile against the
    /// current candidate set, run the resulting graph, and mark everything
    /// that ran as finished. Accountability is per subject: finishes happen
    /// whether or not the subject's own steps succeeded, the results tell
    /// the rest.
    pub async fn work(
        &self,
        tracker: &Tracker,
        activity: Activity,
        scanner_name: &str,
        amount: usize,
        now: OffsetDateTime,
    ) -> Result<RunSummary> {
        let picked_up = tracker.pickup(activity, scanner_name, amount);
        if picked_up.is_empty() {
            debug!("nothing planned for {activity}/{scanner_name}");
            return Ok(RunSummary::default());
        }

        // The candidate query can be stricter than the one used at planning
        // time; whatever fell out in between is finished administratively.
        let candidates: Vec<String> = picked_up
            .iter()
            .filter(|subject| {
                self.store
                    .url_by_name(subject)
                    .is_some_and(|u| alive_at(&u.lifespan, now))
            })
            .cloned()
            .collect();
        tracker.finish_those_that_wont_be_scanned(activity, scanner_name, &candidates, &picked_up);

        let graph = TaskGraph::Parallel(
            candidates
                .iter()
                .map(|url| {
                    let step = match activity {
                        Activity::Discover => Step::Discover {
                            scanner: scanner_name.to_string(),
                            url: url.clone(),
                        },
                        Activity::Verify | Activity::Scan => Step::Scan {
                            scanner: scanner_name.to_string(),
                            url: url.clone(),
                        },
                    };
                    TaskGraph::Task(step)
                })
                .collect(),
        );

        let summary = self.run(graph, now).await;
        for subject in &candidates {
            tracker.finish(activity, scanner_name, subject);
        }
        Ok(summary)
    }

    /// Composes and runs the onboarding pipeline for urls matching the
    /// filter. The graph shape comes from [`compose_onboarding`]; this only
    /// interprets it.
    pub async fn onboard(
        &self,
        filter: &UrlFilter,
        now: OffsetDateTime,
    ) -> Result<RunSummary> {
        let graph = compose_onboarding(&self.store, &self.registry, filter, now)?;
        if graph.is_empty() {
            return Ok(RunSummary::default());
        }
        debug!("onboarding graph:\n{}", graph.render());
        Ok(self.run(graph, now).await)
    }

    /// Composes and runs the report-rebuild pipeline.
    pub async fn rebuild_reports(
        &self,
        organizations_filter: &crate::store::OrganizationFilter,
        urls_filter: &UrlFilter,
        statistics_days: u32,
        now: OffsetDateTime,
    ) -> Result<RunSummary> {
        let graph = crate::compose::compose_report_task(
            &self.store,
            organizations_filter,
            urls_filter,
            statistics_days,
            now,
        )?;
        if graph.is_empty() {
            return Ok(RunSummary::default());
        }
        debug!("report graph:\n{}", graph.render());
        Ok(self.run(graph, now).await)
    }
}
