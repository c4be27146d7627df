use crate::{
    config::Config,
    executor::Executor,
    models::{Activity, ScanTypePolicy},
    report,
    scanners::ScannerRegistry,
    stacking::alive_at,
    stats,
    store::{OrganizationFilter, Store, UrlFilter},
    tracker::Tracker,
};
use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "secmap")]
#[command(about = "Security-scan orchestration and report aggregation engine")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./secmap.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Request planned scans for every scannable url.
    Plan {
        #[arg(long)]
        activity: String,
        #[arg(long)]
        scanner: String,
    },
    /// Claim up to `amount` planned subjects for external processing.
    Pickup {
        #[arg(long)]
        activity: String,
        #[arg(long)]
        scanner: String,
        #[arg(long, default_value_t = 25)]
        amount: usize,
    },
    /// Mark one planned subject finished.
    Finish {
        #[arg(long)]
        activity: String,
        #[arg(long)]
        scanner: String,
        #[arg(long)]
        subject: String,
    },
    /// Re-queue stuck pickups and purge old finished items.
    Reclaim {},
    /// Compose and run the onboarding pipeline.
    Onboard {
        /// Restrict to a single url; otherwise everything awaiting onboarding.
        #[arg(long)]
        url: Option<String>,
    },
    /// Rebuild report history, narrowed by filters or everything at once.
    RebuildReports {
        #[arg(long)]
        organization: Option<String>,
        #[arg(long)]
        url: Option<String>,
        /// Drop and rebuild every report, filters ignored.
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// Recompute statistics caches for the trailing days.
    RecomputeStats {
        #[arg(long)]
        days: Option<u32>,
        #[arg(long)]
        country: Vec<String>,
        #[arg(long)]
        organization_type: Vec<String>,
    },
    /// Show a url's report moments with severity counts.
    Timeline {
        #[arg(long)]
        url: String,
    },
}

pub fn dispatch(args: Args) -> Result<()> {
    let cfg_path = resolve_config_path(args.config.as_deref())?;
    let cfg = if cfg_path.exists() {
        Config::load(&cfg_path)?
    } else {
        Config::default()
    };
    let _guard = init_logging(&args, &cfg)?;

    let dataset = PathBuf::from(&cfg.paths.dataset);
    let store = Arc::new(Store::load_or_default(&dataset)?);
    let policy = ScanTypePolicy::from_lists(&cfg.scan_types.endpoint_level, &cfg.scan_types.url_level);
    let tracker = Tracker::new(store.clone(), cfg.tracker.clone());
    let now = OffsetDateTime::now_utc();

    match &args.cmd {
        Command::Plan { activity, scanner } => {
            let activity = parse_activity(activity)?;
            let subjects = scannable_urls(&store, now);
            let planned = tracker.request(activity, scanner, &subjects);
            store.save(&dataset)?;
            print_summary(serde_json::json!({
                "candidates": subjects.len(),
                "planned": planned,
            }))
        }
        Command::Pickup {
            activity,
            scanner,
            amount,
        } => {
            let activity = parse_activity(activity)?;
            let subjects = tracker.pickup(activity, scanner, *amount);
            store.save(&dataset)?;
            print_summary(serde_json::json!({ "picked_up": subjects }))
        }
        Command::Finish {
            activity,
            scanner,
            subject,
        } => {
            let activity = parse_activity(activity)?;
            tracker.finish(activity, scanner, subject);
            store.save(&dataset)?;
            print_summary(serde_json::json!({ "finished": subject }))
        }
        Command::Reclaim {} => {
            let reclaimed = tracker.reclaim_stuck();
            let purged = tracker.purge_finished();
            store.save(&dataset)?;
            print_summary(serde_json::json!({
                "reclaimed": reclaimed,
                "purged": purged,
            }))
        }
        Command::Onboard { url } => {
            let filter = UrlFilter {
                url: url.clone(),
                ..UrlFilter::default()
            };
            let executor = Executor::new(store.clone(), ScannerRegistry::new(), policy);
            let summary = runtime()?.block_on(executor.onboard(&filter, now))?;
            store.save(&dataset)?;
            print_run_summary(summary)
        }
        Command::RebuildReports {
            organization,
            url,
            all,
        } => {
            if *all {
                let outcome = report::rebuild_all_reports(&store, now, &policy);
                store.save(&dataset)?;
                return print_summary(serde_json::json!({
                    "organizations": outcome.organizations,
                    "url_reports": outcome.url_reports,
                    "organization_reports": outcome.organization_reports,
                }));
            }
            let organizations_filter = OrganizationFilter {
                name: organization.clone(),
                ..OrganizationFilter::default()
            };
            let urls_filter = UrlFilter {
                url: url.clone(),
                ..UrlFilter::default()
            };
            let executor = Executor::new(store.clone(), ScannerRegistry::new(), policy);
            let summary = runtime()?.block_on(executor.rebuild_reports(
                &organizations_filter,
                &urls_filter,
                cfg.statistics.days,
                now,
            ))?;
            store.save(&dataset)?;
            print_run_summary(summary)
        }
        Command::RecomputeStats {
            days,
            country,
            organization_type,
        } => {
            let days = days.unwrap_or(cfg.statistics.days);
            let keys = stats::recompute(&store, &policy, country, organization_type, days, now);
            store.save(&dataset)?;
            print_summary(serde_json::json!({ "keys": keys }))
        }
        Command::Timeline { url } => {
            let url = report::url_by_name(&store, url)?;
            print!("{}", report::inspect_timeline(&store, &url, &policy));
            Ok(())
        }
    }
}

/// Urls worth planning work for: alive, onboarded, owned by an alive
/// organization under a configuration flagged `is_scanned`.
fn scannable_urls(store: &Store, now: OffsetDateTime) -> Vec<String> {
    let scanned: Vec<_> = store
        .map_configurations()
        .into_iter()
        .filter(|c| c.is_scanned)
        .collect();

    let organization_ids: Vec<u64> = store
        .organizations(&OrganizationFilter::default())
        .into_iter()
        .filter(|o| alive_at(&o.lifespan, now))
        .filter(|o| {
            scanned
                .iter()
                .any(|c| c.country == o.country && c.organization_type == o.organization_type)
        })
        .map(|o| o.id)
        .collect();

    let mut subjects: Vec<String> = store
        .urls(&UrlFilter::default())
        .into_iter()
        .filter(|u| alive_at(&u.lifespan, now) && u.onboarded)
        .filter(|u| u.organization_ids.iter().any(|id| organization_ids.contains(id)))
        .map(|u| u.url)
        .collect();
    subjects.sort();
    subjects.dedup();
    subjects
}

fn parse_activity(raw: &str) -> Result<Activity> {
    raw.parse()
        .map_err(|_| anyhow!("unknown activity: {raw} (discover, verify or scan)"))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("starting async runtime")
}

fn print_summary(summary: serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn print_run_summary(summary: crate::executor::RunSummary) -> Result<()> {
    print_summary(serde_json::json!({
        "processed": summary.processed,
        "failed": summary.failed,
        "skipped": summary.skipped,
    }))
}

fn resolve_config_path(user: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = user {
        return Ok(p.to_path_buf());
    }
    let default = PathBuf::from("secmap.toml");
    if default.exists() {
        Ok(default)
    } else {
        Ok(PathBuf::from("secmap.example.toml"))
    }
}

fn init_logging(args: &Args, cfg: &Config) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    let (file_layer, guard) = if cfg.logging.write_to_file {
        let path = if cfg.logging.file_path.is_empty() {
            PathBuf::from("secmap.log")
        } else {
            PathBuf::from(&cfg.logging.file_path)
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating log dir: {}", parent.display()))?;
        }
        let file = std::fs::File::create(&path)
            .with_context(|| format!("create log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    info!("using config {}", resolve_config_path(args.config.as_deref())?.display());
    Ok(guard)
}
