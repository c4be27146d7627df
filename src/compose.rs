//! Task Composer: builds typed task-graph values for the executor.
//!
//! Graph construction is pure — no queue, no side effects — so composition
//! logic is testable on its own. Chains express strict ordering, parallel
//! groups carry no ordering guarantee, and each subject's chain is isolated
//! from its siblings.

use crate::models::Activity;
use crate::scanners::ScannerRegistry;
use crate::stacking::alive_at;
use crate::store::{OrganizationFilter, Store, UrlFilter};
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

/// A leaf work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "step")]
pub enum Step {
    Discover {
        scanner: String,
        url: String,
    },
    Scan {
        scanner: String,
        url: String,
    },
    FinishOnboarding {
        url: String,
    },
    RebuildUrlReports {
        urls: Vec<String>,
    },
    RebuildOrganizationReport {
        organization: String,
    },
    RecomputeStatistics {
        countries: Vec<String>,
        organization_types: Vec<String>,
        days: u32,
    },
    /// Placeholder keeping chain shapes uniform when a stage does not apply.
    NoOp,
}

/// A typed task graph. `Sequence` members run strictly in order, `Parallel`
/// members concurrently without ordering. A failed step aborts only the
/// remaining steps of its own sequence unless wrapped in `BestEffort`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskGraph {
    Task(Step),
    Sequence(Vec<TaskGraph>),
    Parallel(Vec<TaskGraph>),
    BestEffort(Box<TaskGraph>),
}

impl TaskGraph {
    pub fn empty() -> Self {
        TaskGraph::Parallel(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            TaskGraph::Task(_) => false,
            TaskGraph::Sequence(members) | TaskGraph::Parallel(members) => {
                members.iter().all(TaskGraph::is_empty)
            }
            TaskGraph::BestEffort(inner) => inner.is_empty(),
        }
    }

    /// Number of leaf steps, NoOps included.
    pub fn step_count(&self) -> usize {
        match self {
            TaskGraph::Task(_) => 1,
            TaskGraph::Sequence(members) | TaskGraph::Parallel(members) => {
                members.iter().map(TaskGraph::step_count).sum()
            }
            TaskGraph::BestEffort(inner) => inner.step_count(),
        }
    }

    /// Indented human-readable dump, for logs and troubleshooting.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let pad = "  ".repeat(depth);
        match self {
            TaskGraph::Task(step) => {
                out.push_str(&format!("{pad}{step:?}\n"));
            }
            TaskGraph::Sequence(members) => {
                out.push_str(&format!("{pad}sequence:\n"));
                for m in members {
                    m.render_into(out, depth + 1);
                }
            }
            TaskGraph::Parallel(members) => {
                out.push_str(&format!("{pad}parallel:\n"));
                for m in members {
                    m.render_into(out, depth + 1);
                }
            }
            TaskGraph::BestEffort(inner) => {
                out.push_str(&format!("{pad}best-effort:\n"));
                inner.render_into(out, depth + 1);
            }
        }
    }
}

/// Builds the onboarding graph for every alive, not-yet-onboarded url
/// matching the filter. Per url:
///
/// 1. a parallel group of discovery probes,
/// 2. a verify/crawl group, or a no-op placeholder so the chain shape stays
///    uniform (best-effort: crawl trouble must not sink the pipeline),
/// 3. a best-effort parallel group of scanners (they need the endpoints
///    discovery created),
/// 4. the finalization step marking the url onboarded exactly once.
///
/// Chains are composed into one outer parallel group; a failure in one url's
/// chain never aborts a sibling's.
///
/// An empty candidate set is an error for explicitly narrowed (interactive)
/// filters and an empty unit of work for full scheduled runs.
pub fn compose_onboarding(
    store: &Store,
    registry: &ScannerRegistry,
    filter: &UrlFilter,
    when: OffsetDateTime,
) -> Result<TaskGraph> {
    // Without discovery there are no endpoints to scan and finalization
    // would mark urls onboarded with nothing examined.
    if registry.with_activity(Activity::Discover).is_empty() {
        bail!("no discovery-capable scanners registered, refusing to onboard");
    }

    let candidates: Vec<_> = store
        .urls(filter)
        .into_iter()
        .filter(|u| alive_at(&u.lifespan, when) && !u.onboarded)
        .collect();

    if candidates.is_empty() {
        if filter.is_narrowing() {
            bail!("onboarding filter matched no urls awaiting onboarding");
        }
        debug!("no urls awaiting onboarding, composing empty unit of work");
        return Ok(TaskGraph::empty());
    }

    info!("composing onboarding for {} urls", candidates.len());

    let mut chains = Vec::with_capacity(candidates.len());
    for url in &candidates {
        let discover: Vec<TaskGraph> = registry
            .with_activity(Activity::Discover)
            .iter()
            .map(|s| {
                TaskGraph::Task(Step::Discover {
                    scanner: s.name().to_string(),
                    url: url.url.clone(),
                })
            })
            .collect();

        let verify: Vec<TaskGraph> = registry
            .with_activity(Activity::Verify)
            .iter()
            .map(|s| {
                TaskGraph::Task(Step::Scan {
                    scanner: s.name().to_string(),
                    url: url.url.clone(),
                })
            })
            .collect();

        let crawl_stage = if verify.is_empty() {
            TaskGraph::Task(Step::NoOp)
        } else {
            TaskGraph::BestEffort(Box::new(TaskGraph::Parallel(verify)))
        };

        let scans: Vec<TaskGraph> = registry
            .with_activity(Activity::Scan)
            .iter()
            .map(|s| {
                TaskGraph::Task(Step::Scan {
                    scanner: s.name().to_string(),
                    url: url.url.clone(),
                })
            })
            .collect();

        chains.push(TaskGraph::Sequence(vec![
            TaskGraph::Parallel(discover),
            crawl_stage,
            TaskGraph::BestEffort(Box::new(TaskGraph::Parallel(scans))),
            TaskGraph::Task(Step::FinishOnboarding {
                url: url.url.clone(),
            }),
        ]));
    }

    Ok(TaskGraph::Parallel(chains))
}

/// Builds the report-rebuild graph: per organization, url reports strictly
/// before the organization report (the engine does not infer that dependency
/// from data, so it is sequenced here), all organizations in parallel, and
/// the statistics recompute appended best-effort.
///
/// Only organizations under a configuration flagged `is_reported` are
/// considered. An organization whose url filter leaves no urls still gets a
/// report (an empty gray region on the map).
pub fn compose_report_task(
    store: &Store,
    organizations_filter: &OrganizationFilter,
    urls_filter: &UrlFilter,
    statistics_days: u32,
    when: OffsetDateTime,
) -> Result<TaskGraph> {
    let reported: Vec<_> = store
        .map_configurations()
        .into_iter()
        .filter(|c| c.is_reported)
        .collect();

    let organizations: Vec<_> = store
        .organizations(organizations_filter)
        .into_iter()
        .filter(|o| alive_at(&o.lifespan, when))
        .filter(|o| {
            reported
                .iter()
                .any(|c| c.country == o.country && c.organization_type == o.organization_type)
        })
        .collect();

    debug!("organizations to report on: {}", organizations.len());

    let mut tasks = Vec::new();
    for organization in &organizations {
        let urls: Vec<String> = store
            .urls(&UrlFilter {
                organization_id: Some(organization.id),
                ..urls_filter.clone()
            })
            .into_iter()
            .filter(|u| alive_at(&u.lifespan, when))
            .map(|u| u.url)
            .collect();

        let rebuild_org = TaskGraph::Task(Step::RebuildOrganizationReport {
            organization: organization.name.clone(),
        });

        if urls.is_empty() {
            // Still worth an (empty) organization report.
            tasks.push(rebuild_org);
        } else {
            tasks.push(TaskGraph::Sequence(vec![
                TaskGraph::Task(Step::RebuildUrlReports { urls }),
                rebuild_org,
            ]));
        }
    }

    if tasks.is_empty() {
        if organizations_filter.is_narrowing() || urls_filter.is_narrowing() {
            bail!("report filters matched no organizations to rebuild");
        }
        debug!("nothing to report on, composing empty unit of work");
        return Ok(TaskGraph::empty());
    }

    // Narrow the cache rebuild to the filtered countries/types when given;
    // the full refresh happens on the scheduled unfiltered run.
    let countries = organizations_filter
        .country
        .clone()
        .map(|c| vec![c])
        .unwrap_or_default();
    let organization_types = organizations_filter
        .organization_type
        .clone()
        .map(|t| vec![t])
        .unwrap_or_default();

    tasks.push(TaskGraph::BestEffort(Box::new(TaskGraph::Task(
        Step::RecomputeStatistics {
            countries,
            organization_types,
            days: statistics_days,
        },
    ))));

    Ok(TaskGraph::Parallel(tasks))
}
