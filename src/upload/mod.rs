use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::output::types::Meta;
use crate::telemetry::{self};
use crate::telemetry::ops::upload::Phase as UploadPhase;

mod coordinator;
mod input;
mod process;
mod render;
mod submit;
mod types;
#[cfg(test)]
mod test_support;

use coordinator::{Coordinator, CoordinatorConfig, RunReport};
use process::FileProcessor;
use submit::{OmnipubClient, OmnipubClientConfig, Publisher, DEFAULT_API_BASE, DEFAULT_KEY_ENV, DEFAULT_MAX_CONNS};
use types::{CollectionId, UploadPlan, UploadResult};

#[derive(Args, Debug, Clone)]
pub struct UploadCmd {
    /// Directory with .json files
    #[arg(long, default_value = ".")] pub dir: PathBuf,
    /// File with list of failed files to retry (replaces the directory scan)
    #[arg(long)] pub retry: Option<PathBuf>,
    /// Omnipub API base; falls back to OMNIPUB_API_BASE
    #[arg(long)] pub api: Option<String>,
    /// Optional collection_id (0 = unset)
    #[arg(long, default_value_t = 0)] pub collection: i64,
    /// Concurrent workers (≈ open TCP conns)
    #[arg(long, default_value_t = 10)] pub workers: usize,
    /// Milliseconds each worker sleeps before every submission (0 = none)
    #[arg(long, default_value_t = 0)] pub backoff: u64,
    /// Max in-flight connections to the API host
    #[arg(long, default_value_t = DEFAULT_MAX_CONNS)] pub max_conns: usize,
    /// Env var holding the API key
    #[arg(long, default_value = DEFAULT_KEY_ENV)] pub key_env: String,
    /// Save paths of failed files to this file
    #[arg(long)] pub save_failures: Option<PathBuf>,
    /// Collect and print the plan without uploading
    #[arg(long, default_value_t = false)] pub dry_run: bool,
    #[arg(long, default_value_t = 10)] pub plan_limit: usize,
}

pub async fn run(args: UploadCmd, ct: CancellationToken) -> Result<()> {
    let log = telemetry::upload();
    let span = log.root_span_kv([
        ("dir", args.dir.display().to_string()),
        ("retry", format!("{:?}", args.retry)),
        ("collection", args.collection.to_string()),
        ("workers", args.workers.to_string()),
        ("backoff_ms", args.backoff.to_string()),
        ("max_conns", args.max_conns.to_string()),
        ("key_env", args.key_env.clone()),
        ("save_failures", format!("{:?}", args.save_failures)),
        ("dry_run", args.dry_run.to_string()),
    ]);

    async move {
        let t0 = Instant::now();

        // Credential first: nothing is read or sent without it.
        let api = resolve_api_base(args.api.as_deref());
        let cfg = OmnipubClientConfig::from_env(&args.key_env, &api, args.max_conns)
            .context("configuring omnipub client")?;
        let client = Arc::new(OmnipubClient::new(cfg).context("configuring omnipub client")?);

        let items = collect_items(&args)?;

        if args.dry_run {
            return emit_plan(&args, &items);
        }

        if items.is_empty() {
            log.info("No files to process – nothing to upload.");
        } else {
            log.info(format!("🚀 Uploading {} files with {} workers → {}", items.len(), args.workers.max(1), client.endpoint()));
        }

        let (report, result) = upload_items(&args, items, client.clone(), ct).await;
        log.debug(format!("peak in-flight requests: {}", client.peak_in_flight()));
        log.totals(report.succeeded, report.failed);

        let _s = log.span(&UploadPhase::Report).entered();
        let meta = Meta { duration_ms: Some(t0.elapsed().as_millis()), run_id: Some(Uuid::new_v4().to_string()) };
        let headline = format!("Done. Success: {}  Failure: {}", report.succeeded, report.failed);
        log.result(&result, Some(meta), headline)
    }
    .instrument(span)
    .await
}

fn resolve_api_base(flag: Option<&str>) -> String {
    flag.map(str::to_string)
        .or_else(|| std::env::var("OMNIPUB_API_BASE").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
}

fn collect_items(args: &UploadCmd) -> Result<Vec<PathBuf>> {
    let log = telemetry::upload();
    let _s = log.span(&UploadPhase::Collect).entered();
    match &args.retry {
        Some(path) => input::read_retry_list(path).context("Error reading retry file"),
        None => input::discover_items(&args.dir),
    }
}

fn emit_plan(args: &UploadCmd, items: &[PathBuf]) -> Result<()> {
    let log = telemetry::upload();
    let source = match &args.retry {
        Some(p) => format!("retry:{}", p.display()),
        None => format!("dir:{}", args.dir.display()),
    };
    if telemetry::config::json_mode() {
        let plan = UploadPlan {
            items: items.len(),
            source,
            workers: args.workers.max(1),
            backoff_ms: args.backoff,
            max_conns: args.max_conns.max(1),
            collection: CollectionId::from_flag(args.collection),
            sample_items: items.iter().take(args.plan_limit).map(|p| p.display().to_string()).collect(),
        };
        log.plan(&plan, None)?;
    } else {
        log.info(format!(
            "📝 Upload plan — items={} source={} workers={} backoff_ms={} max_conns={}",
            items.len(), source, args.workers.max(1), args.backoff, args.max_conns.max(1)
        ));
        for item in items.iter().take(args.plan_limit) { log.info(format!("  {}", item.display())); }
        if items.len() > args.plan_limit { log.info(format!("  ... ({} more)", items.len() - args.plan_limit)); }
        log.info("   Drop --dry-run to upload.");
    }
    Ok(())
}

/// Runs the worker pool and persists failures. Never fails: a failures file that
/// cannot be written is logged and leaves the counts untouched.
async fn upload_items(
    args: &UploadCmd,
    items: Vec<PathBuf>,
    publisher: Arc<dyn Publisher>,
    ct: CancellationToken,
) -> (RunReport, UploadResult) {
    let log = telemetry::upload();
    let coordinator = Coordinator::new(CoordinatorConfig {
        workers: args.workers,
        pacing: Duration::from_millis(args.backoff),
        collect_failures: args.save_failures.is_some(),
    });
    let processor = Arc::new(FileProcessor::new(publisher));

    let report = coordinator
        .run(items, CollectionId::from_flag(args.collection), processor, ct)
        .instrument(log.span(&UploadPhase::Work))
        .await;

    let mut failures_saved = 0;
    if let Some(path) = &args.save_failures {
        if !report.failures.is_empty() {
            let _s = log.span(&UploadPhase::Persist).entered();
            match input::write_failure_list(path, &report.failures) {
                Ok(()) => {
                    failures_saved = report.failures.len();
                    log.info(format!("💾 Saved {} failed paths to {}", failures_saved, path.display()));
                }
                Err(err) => log.error(format!("Error saving failures file: {err:#}")),
            }
        }
    }

    let result = UploadResult {
        succeeded: report.succeeded,
        failed: report.failed,
        failures_file: args.save_failures.as_ref().map(|p| p.display().to_string()),
        failures_saved,
    };
    (report, result)
}
