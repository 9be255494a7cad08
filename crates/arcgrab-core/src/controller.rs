//! Job controller: the engine's public contract.
//!
//! Sequences resolution and fetching for one job, owns the lifecycle
//! (start / resume / stop / status), and publishes metrics. The state file
//! is the single source of truth: everything the controller holds in memory
//! is rebuildable from it, which is what makes desktop, CLI, and headless
//! invocations interchangeable.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::auth::Credentials;
use crate::backoff::BackoffGate;
use crate::config::{job_id_for_root, EngineConfig, Overrides};
use crate::control::CancelToken;
use crate::fetcher::{Checkpoint, FetchContext};
use crate::governor::RateGovernor;
use crate::input;
use crate::manifest::{self, FileFilter};
use crate::metrics::{self, EngineMetrics, Phase, Snapshot};
use crate::pool;
use crate::store::{FileId, ItemStatus, NewFile, StateStore};

/// Name of the durable store, one file at the output root.
pub const STATE_FILE: &str = "arcgrab.db";

/// Entry points for engine collaborators (CLI, UI, headless drivers).
pub struct Engine;

/// A running job. Dropping the handle does not stop the job; call `stop`
/// and then `wait` for a clean shutdown.
pub struct JobHandle {
    cancel: CancelToken,
    snapshot_rx: watch::Receiver<Snapshot>,
    task: tokio::task::JoinHandle<Result<JobReport>>,
}

impl JobHandle {
    /// Metrics sink: one snapshot per second while the job runs.
    pub fn metrics(&self) -> watch::Receiver<Snapshot> {
        self.snapshot_rx.clone()
    }

    /// Trigger the job-wide cancel signal. Workers abandon their current
    /// read, release their files, and exit; partials stay on disk.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Detached stop trigger, e.g. for a signal handler that outlives the
    /// borrow of the handle.
    pub fn stop_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Wait for the job to drain and return the final aggregate.
    pub async fn wait(self) -> Result<JobReport> {
        self.task.await.context("job task join")?
    }
}

/// Final aggregate for one run of a job.
#[derive(Debug, Clone, Default)]
pub struct JobReport {
    pub done: u64,
    pub failed: u64,
    pub skipped: u64,
    pub pending: u64,
    pub bytes_done: u64,
    /// True when the run ended on the cancel signal.
    pub interrupted: bool,
}

impl JobReport {
    /// Everything fetched (or verified on disk) and nothing left behind.
    pub fn is_complete(&self) -> bool {
        !self.interrupted && self.failed == 0 && self.pending == 0
    }
}

impl Engine {
    /// Validate the config, persist the job and its item list, and launch.
    pub async fn start(mut cfg: EngineConfig) -> Result<JobHandle> {
        cfg.validate()?;
        let identifiers = input::read_items(&cfg.items_path)?;
        for id in &identifiers {
            if id.contains('/') || id.contains('\\') {
                bail!("invalid identifier {id:?}: path separators are not allowed");
            }
        }

        let store = StateStore::open(&cfg.output_root.join(STATE_FILE)).await?;
        let job_id = job_id_for_root(&cfg.output_root);
        let config_json = serde_json::to_string(&cfg)?;
        store
            .upsert_job(&job_id, &cfg.output_root.to_string_lossy(), &config_json)
            .await?;
        for identifier in &identifiers {
            store.add_item(&job_id, identifier).await?;
        }
        tracing::info!(%job_id, items = identifiers.len(), "job started");
        Ok(launch(store, job_id, cfg))
    }

    /// Reload a persisted job, merge operator overrides, and launch. Items
    /// and files come from the state file, not the original items list.
    pub async fn resume(output_root: &Path, overrides: Overrides) -> Result<JobHandle> {
        let state_path = output_root.join(STATE_FILE);
        if !state_path.is_file() {
            bail!("no job state at {}", state_path.display());
        }
        let store = StateStore::open(&state_path).await?;
        let job_id = job_id_for_root(output_root);
        let job = store
            .load_job(&job_id)
            .await?
            .with_context(|| format!("state file has no job for {}", output_root.display()))?;

        let mut cfg: EngineConfig =
            serde_json::from_str(&job.config_json).context("parse persisted job config")?;
        overrides.apply(&mut cfg);
        let config_json = serde_json::to_string(&cfg)?;
        store
            .upsert_job(&job_id, &job.output_root, &config_json)
            .await?;
        tracing::info!(%job_id, "job resumed");
        Ok(launch(store, job_id, cfg))
    }

    /// Read-only snapshot of a persisted job; no network, no mutation.
    pub async fn status(output_root: &Path) -> Result<Snapshot> {
        let state_path = output_root.join(STATE_FILE);
        if !state_path.is_file() {
            bail!("no job state at {}", state_path.display());
        }
        let store = StateStore::open(&state_path).await?;
        let job_id = job_id_for_root(output_root);
        let counts = store.progress_snapshot(&job_id).await?;
        Ok(Snapshot::from_counts(Phase::Idle, &counts).with_rate(0))
    }
}

fn launch(store: StateStore, job_id: String, cfg: EngineConfig) -> JobHandle {
    let cancel = CancelToken::new();
    let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());
    let task = tokio::spawn(run_job(
        store,
        job_id,
        cfg,
        cancel.clone(),
        snapshot_tx,
    ));
    JobHandle {
        cancel,
        snapshot_rx,
        task,
    }
}

async fn run_job(
    store: StateStore,
    job_id: String,
    cfg: EngineConfig,
    cancel: CancelToken,
    snapshot_tx: watch::Sender<Snapshot>,
) -> Result<JobReport> {
    let auth = match &cfg.auth_path {
        Some(path) => Some(Credentials::load(path)?.authorization()),
        None => None,
    };
    let governor = Arc::new(RateGovernor::new(cfg.bandwidth_ceiling_bps));
    let gate = Arc::new(BackoffGate::new());
    let metrics = Arc::new(EngineMetrics::default());

    // Only a live claim is authoritative: rows a dead process left
    // in-progress go back to pending before the queue is rebuilt.
    let reclaimed = store.reclaim_in_progress(&job_id).await?;
    if reclaimed > 0 {
        tracing::info!(reclaimed, "reclaimed stranded in-progress files");
    }

    let (queue_tx, queue_rx) = mpsc::unbounded_channel::<FileId>();
    let (checkpoint_tx, mut checkpoint_rx) = mpsc::channel::<Checkpoint>(64);

    let checkpoint_store = store.clone();
    let checkpoint_task = tokio::spawn(async move {
        while let Some(cp) = checkpoint_rx.recv().await {
            if let Err(e) = checkpoint_store.checkpoint_file(cp.file_id, cp.bytes_done).await {
                tracing::warn!(error = %e, "durable progress update failed");
            }
        }
    });

    let publisher = tokio::spawn(metrics::run_publisher(
        store.clone(),
        job_id.clone(),
        Arc::clone(&metrics),
        Arc::clone(&gate),
        cancel.clone(),
        snapshot_tx.clone(),
    ));

    metrics.set_phase(Phase::Resolving);
    let resolver = tokio::spawn(run_resolver(
        store.clone(),
        job_id.clone(),
        cfg.clone(),
        auth.clone(),
        Arc::clone(&gate),
        cancel.clone(),
        Arc::clone(&metrics),
        queue_tx,
    ));

    let ctx = Arc::new(FetchContext {
        endpoint: cfg.endpoint.clone(),
        auth,
        sync: cfg.sync,
        policy: cfg.retry,
        governor,
        gate: Arc::clone(&gate),
        cancel: cancel.clone(),
        checkpoint_tx,
        bytes_counter: Arc::clone(&metrics.bytes_counter),
    });
    let pool_result = pool::run_pool(
        store.clone(),
        ctx,
        queue_rx,
        cfg.worker_ceiling,
        cfg.dynamic,
        Arc::clone(&metrics.gauges),
    )
    .await;

    metrics.set_phase(Phase::Finalizing);
    resolver.await.context("resolver task join")??;
    checkpoint_task.await.context("checkpoint task join")?;
    pool_result?;

    let counts = store.progress_snapshot(&job_id).await?;
    store.touch_job(&job_id).await?;
    metrics.set_phase(Phase::Stopped);
    let _ = snapshot_tx.send(Snapshot::from_counts(Phase::Stopped, &counts).with_rate(0));
    publisher.abort();

    let report = JobReport {
        done: counts.done,
        failed: counts.failed,
        skipped: counts.skipped,
        pending: counts.pending + counts.in_progress,
        bytes_done: counts.bytes_done,
        interrupted: cancel.is_cancelled(),
    };
    tracing::info!(
        done = report.done,
        failed = report.failed,
        skipped = report.skipped,
        pending = report.pending,
        interrupted = report.interrupted,
        "job finished"
    );
    Ok(report)
}

/// Resolver producer: enqueue already-known pending files, then resolve
/// every unresolved item and enqueue its filtered files as they persist.
/// Closing the queue sender tells the pool no more work is coming.
#[allow(clippy::too_many_arguments)]
async fn run_resolver(
    store: StateStore,
    job_id: String,
    cfg: EngineConfig,
    auth: Option<String>,
    gate: Arc<BackoffGate>,
    cancel: CancelToken,
    metrics: Arc<EngineMetrics>,
    queue_tx: mpsc::UnboundedSender<FileId>,
) -> Result<()> {
    let filter = FileFilter::from_config(&cfg)?;

    // Resume path: files persisted by an earlier session go first, in
    // (item, manifest) order.
    for file_id in store.pending_file_ids(&job_id).await? {
        let _ = queue_tx.send(file_id);
    }

    for item in store.list_items(&job_id).await? {
        if cancel.is_cancelled() {
            break;
        }
        if item.status == ItemStatus::Resolved {
            continue;
        }
        store
            .set_item_status(item.id, ItemStatus::Resolving, None)
            .await?;

        let url = manifest::metadata_url(&cfg.endpoint, &item.identifier)?;
        let identifier = item.identifier.clone();
        let fetch_auth = auth.clone();
        let fetch_gate = Arc::clone(&gate);
        let fetch_cancel = cancel.clone();
        let policy = cfg.retry;
        let fetched = tokio::task::spawn_blocking(move || {
            manifest::fetch_manifest(
                &url,
                &identifier,
                fetch_auth.as_deref(),
                &fetch_gate,
                &fetch_cancel,
                &policy,
            )
        })
        .await
        .context("manifest fetch join")?;

        match fetched {
            Ok(files) => {
                let item_dir = cfg.output_root.join(&item.identifier);
                let selected: Vec<NewFile> = files
                    .iter()
                    .filter(|f| filter.matches(&f.name))
                    .map(|f| NewFile {
                        name: f.name.clone(),
                        size: f.size.min(i64::MAX as u64) as i64,
                        checksum: f.md5.clone(),
                        dest_path: item_dir
                            .join(manifest::local_name(&f.name))
                            .to_string_lossy()
                            .into_owned(),
                    })
                    .collect();
                tracing::info!(
                    identifier = %item.identifier,
                    manifest = files.len(),
                    selected = selected.len(),
                    "item resolved"
                );
                let pending = store.insert_files(item.id, &selected).await?;
                store
                    .set_item_status(item.id, ItemStatus::Resolved, None)
                    .await?;
                for file_id in pending {
                    let _ = queue_tx.send(file_id);
                }
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    break;
                }
                tracing::warn!(identifier = %item.identifier, error = %format!("{e:#}"), "item resolution failed");
                store
                    .set_item_status(item.id, ItemStatus::Failed, Some(&format!("{e:#}")))
                    .await?;
            }
        }
    }

    metrics.set_phase(Phase::Downloading);
    Ok(())
}
