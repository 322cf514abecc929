use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::process::ItemProcessor;
use super::types::{CollectionId, UploadJob, UploadOutcome};
use crate::telemetry::{self};
use crate::telemetry::ops::upload::{item_span, worker_span, Phase as UploadPhase};

type JobQueue = Arc<AsyncMutex<mpsc::Receiver<UploadJob>>>;

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub workers: usize,
    /// Slept by each worker before every item. Workers do not coordinate, so the
    /// aggregate request rate still scales with the worker count.
    pub pacing: Duration,
    pub collect_failures: bool,
}

/// Run-scoped tallies shared by all workers.
///
/// Counters are lock-free; the failure list takes a short mutex only on append.
pub struct RunSummary {
    succeeded: AtomicU64,
    failed: AtomicU64,
    failures: Option<Mutex<Vec<PathBuf>>>,
}

impl RunSummary {
    pub fn new(collect_failures: bool) -> Self {
        Self {
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            failures: collect_failures.then(|| Mutex::new(Vec::new())),
        }
    }

    pub fn record(&self, item: &Path, outcome: &UploadOutcome) {
        if outcome.is_success() {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.failed.fetch_add(1, Ordering::Relaxed);
        if let Some(list) = &self.failures {
            // a poisoned list still holds every append made before the panic
            let mut guard = list.lock().unwrap_or_else(|e| e.into_inner());
            guard.push(item.to_path_buf());
        }
    }

    pub fn report(&self) -> RunReport {
        let failures = match &self.failures {
            Some(list) => list.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            None => Vec::new(),
        };
        RunReport {
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            failures,
        }
    }
}

/// Terminal state of a run. `failures` is in recording order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub succeeded: u64,
    pub failed: u64,
    pub failures: Vec<PathBuf>,
}

pub struct Coordinator {
    cfg: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(cfg: CoordinatorConfig) -> Self {
        Self { cfg: CoordinatorConfig { workers: cfg.workers.max(1), ..cfg } }
    }

    /// Drains `items` through a fixed pool of workers. Each item is pulled exactly once.
    pub async fn run(
        &self,
        items: Vec<PathBuf>,
        collection: Option<CollectionId>,
        processor: Arc<dyn ItemProcessor>,
        ct: CancellationToken,
    ) -> RunReport {
        let log = telemetry::upload();
        if items.is_empty() {
            return RunReport::default();
        }

        let queue = {
            let _s = log.span_kv(&UploadPhase::Dispatch, [("items", items.len().to_string())]).entered();
            let (tx, rx) = mpsc::channel::<UploadJob>(items.len());
            for item in items {
                // capacity covers every item, so this never waits
                if tx.try_send(UploadJob { item, collection }).is_err() {
                    log.error("job queue rejected an item");
                }
            }
            // dropping the only sender closes the queue once it drains
            drop(tx);
            Arc::new(AsyncMutex::new(rx))
        };

        let summary = Arc::new(RunSummary::new(self.cfg.collect_failures));
        let handles: Vec<_> = (0..self.cfg.workers)
            .map(|w| {
                let fut = worker(queue.clone(), processor.clone(), summary.clone(), self.cfg.pacing, ct.clone());
                tokio::spawn(fut.instrument(worker_span(w)))
            })
            .collect();

        for res in futures::future::join_all(handles).await {
            if let Err(err) = res {
                log.error(format!("worker task aborted: {err}"));
            }
        }

        summary.report()
    }
}

async fn worker(
    queue: JobQueue,
    processor: Arc<dyn ItemProcessor>,
    summary: Arc<RunSummary>,
    pacing: Duration,
    ct: CancellationToken,
) {
    let log = telemetry::upload();
    loop {
        let next = queue.lock().await.recv().await;
        let Some(job) = next else { break };

        let outcome = if ct.is_cancelled() {
            UploadOutcome::cancelled()
        } else {
            attempt(&job, processor.as_ref(), pacing, &ct)
                .instrument(item_span(&job.item))
                .await
        };

        match &outcome {
            UploadOutcome::Success => log.item_uploaded(&job.item),
            UploadOutcome::Failure { reason, retryable } => log.item_failed(&job.item, reason, *retryable),
        }
        summary.record(&job.item, &outcome);
    }
}

async fn attempt(
    job: &UploadJob,
    processor: &dyn ItemProcessor,
    pacing: Duration,
    ct: &CancellationToken,
) -> UploadOutcome {
    if !pacing.is_zero() {
        tokio::select! {
            _ = ct.cancelled() => return UploadOutcome::cancelled(),
            _ = tokio::time::sleep(pacing) => {}
        }
    }
    // a panic still yields an outcome; every pulled item is counted
    match AssertUnwindSafe(processor.process(job, ct)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => UploadOutcome::Failure { reason: "processor panicked".to_string(), retryable: false },
    }
}
