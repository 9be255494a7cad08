//! Integration tests: full engine runs against a local fake archive.
//!
//! Covers the end-to-end scenarios the engine must survive: happy path,
//! resume from a partial, servers that ignore ranges, stale partials (416),
//! integrity mismatches, filters, bandwidth caps, sync preflight, and
//! premature EOF mid-body.

mod common;

use common::archive_server::{self, ArchiveServer, ServedFile, ServerOptions};

use arcgrab_core::backoff::BackoffGate;
use arcgrab_core::config::{job_id_for_root, EngineConfig};
use arcgrab_core::control::CancelToken;
use arcgrab_core::controller::{Engine, JobReport, STATE_FILE};
use arcgrab_core::fetcher::{fetch_file, FetchContext, FetchOutcome};
use arcgrab_core::governor::RateGovernor;
use arcgrab_core::retry::RetryPolicy;
use arcgrab_core::store::{FileRecord, FileStatus, ItemStatus, NewFile, StateStore};
use arcgrab_core::Overrides;

use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn patterned_body(len: usize) -> Vec<u8> {
    (0u8..251).cycle().take(len).collect()
}

fn md5_hex(body: &[u8]) -> String {
    hex::encode(Md5::digest(body))
}

fn write_items_file(dir: &Path, identifiers: &[&str]) -> PathBuf {
    let path = dir.join("items.txt");
    std::fs::write(&path, identifiers.join("\n")).unwrap();
    path
}

fn config_for(server: &ArchiveServer, items: PathBuf, out: &Path) -> EngineConfig {
    let mut cfg = EngineConfig::new(items, out);
    cfg.endpoint = server.url().to_string();
    // Keep retries snappy; individual tests raise this when they need it.
    cfg.retry.base_delay_secs = 0;
    cfg
}

async fn run_to_report(cfg: EngineConfig) -> JobReport {
    let handle = Engine::start(cfg).await.expect("start");
    handle.wait().await.expect("wait")
}

/// Persist a job whose single item is already resolved, bypassing the
/// resolver. Returns the store, job id, and file row ids in insertion order.
async fn seed_resolved_job(
    out: &Path,
    cfg: &EngineConfig,
    files: &[NewFile],
) -> (StateStore, String, Vec<i64>) {
    let store = StateStore::open(&out.join(STATE_FILE)).await.unwrap();
    let job_id = job_id_for_root(out);
    store
        .upsert_job(
            &job_id,
            &out.to_string_lossy(),
            &serde_json::to_string(cfg).unwrap(),
        )
        .await
        .unwrap();
    store.add_item(&job_id, "item-a").await.unwrap();
    let item_id = store.list_items(&job_id).await.unwrap()[0].id;
    let ids = store.insert_files(item_id, files).await.unwrap();
    store
        .set_item_status(item_id, ItemStatus::Resolved, None)
        .await
        .unwrap();
    (store, job_id, ids)
}

fn new_file(out: &Path, name: &str, size: i64, checksum: Option<String>) -> NewFile {
    NewFile {
        name: name.to_string(),
        size,
        checksum,
        dest_path: out.join("item-a").join(name).to_string_lossy().into_owned(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_downloads_every_file() {
    let bodies: Vec<Vec<u8>> = (0..6).map(|i| patterned_body(8 * 1024 + i * 512)).collect();
    let server = archive_server::start(
        vec![
            (
                "item-a",
                vec![
                    ServedFile::new("one.bin", bodies[0].clone()),
                    ServedFile::new("two.bin", bodies[1].clone()),
                    ServedFile::new("three.bin", bodies[2].clone()),
                ],
            ),
            (
                "item-b",
                vec![
                    ServedFile::new("one.bin", bodies[3].clone()),
                    ServedFile::new("two.bin", bodies[4].clone()),
                    ServedFile::new("three.bin", bodies[5].clone()),
                ],
            ),
        ],
        ServerOptions::default(),
    );

    let out = tempdir().unwrap();
    let items = write_items_file(out.path(), &["item-a", "item-b"]);
    let cfg = config_for(&server, items, out.path());
    let report = run_to_report(cfg).await;

    assert_eq!(report.done, 6);
    assert_eq!(report.failed, 0);
    assert_eq!(report.pending, 0);
    assert!(report.is_complete());

    for (item, offset) in [("item-a", 0), ("item-b", 3)] {
        for (i, name) in ["one.bin", "two.bin", "three.bin"].iter().enumerate() {
            let dest = out.path().join(item).join(name);
            assert_eq!(std::fs::read(&dest).unwrap(), bodies[offset + i]);
            assert!(!dest.with_extension("bin.part").exists());
        }
    }

    let snapshot = Engine::status(out.path()).await.unwrap();
    assert_eq!(snapshot.done, 6);
    assert_eq!(snapshot.pending, 0);
    assert_eq!(snapshot.in_progress, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_start_performs_no_new_downloads() {
    let body = patterned_body(16 * 1024);
    let server = archive_server::start(
        vec![("item-a", vec![ServedFile::new("file.bin", body.clone())])],
        ServerOptions::default(),
    );

    let out = tempdir().unwrap();
    let items = write_items_file(out.path(), &["item-a"]);
    let report = run_to_report(config_for(&server, items.clone(), out.path())).await;
    assert_eq!(report.done, 1);
    let hits_after_first = server.download_hits();

    // Items are already resolved and every file row is done: the second run
    // has nothing to enqueue and touches neither the manifest nor the files.
    let mut cfg = config_for(&server, items, out.path());
    cfg.sync = true;
    let report = run_to_report(cfg).await;
    assert_eq!(report.done, 1);
    assert_eq!(server.download_hits(), hits_after_first);
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_continues_from_partial_with_a_range_request() {
    let body = patterned_body(100 * 1024);
    let half = body.len() / 2;
    let server = archive_server::start(
        vec![("item-a", vec![ServedFile::new("big.bin", body.clone())])],
        ServerOptions::default(),
    );

    let out = tempdir().unwrap();
    let cfg = {
        let mut cfg = EngineConfig::new(out.path().join("items.txt"), out.path());
        cfg.endpoint = server.url().to_string();
        cfg
    };
    let files = [new_file(
        out.path(),
        "big.bin",
        body.len() as i64,
        Some(md5_hex(&body)),
    )];
    let (store, _job_id, ids) = seed_resolved_job(out.path(), &cfg, &files).await;

    // A previous session got half the file before dying.
    let item_dir = out.path().join("item-a");
    std::fs::create_dir_all(&item_dir).unwrap();
    std::fs::write(item_dir.join("big.bin.part"), &body[..half]).unwrap();
    store.checkpoint_file(ids[0], half as i64).await.unwrap();

    let handle = Engine::resume(out.path(), Overrides::default())
        .await
        .expect("resume");
    let report = handle.wait().await.expect("wait");

    assert_eq!(report.done, 1);
    assert_eq!(std::fs::read(item_dir.join("big.bin")).unwrap(), body);
    assert!(!item_dir.join("big.bin.part").exists());
    // Exactly one ranged request from the partial's offset; only the
    // remaining bytes crossed the wire.
    assert_eq!(server.ranges(), vec![Some(half as u64)]);
    assert_eq!(server.bytes_served(), (body.len() - half) as u64);
}

#[tokio::test(flavor = "multi_thread")]
async fn server_ignoring_range_forces_clean_restart() {
    let body = patterned_body(32 * 1024);
    let half = body.len() / 2;
    let server = archive_server::start(
        vec![("item-a", vec![ServedFile::new("file.bin", body.clone())])],
        ServerOptions {
            ignore_range: true,
            ..ServerOptions::default()
        },
    );

    let out = tempdir().unwrap();
    let cfg = {
        let mut cfg = EngineConfig::new(out.path().join("items.txt"), out.path());
        cfg.endpoint = server.url().to_string();
        cfg.retry.base_delay_secs = 0;
        cfg
    };
    let files = [new_file(
        out.path(),
        "file.bin",
        body.len() as i64,
        Some(md5_hex(&body)),
    )];
    let (_store, _job_id, _ids) = seed_resolved_job(out.path(), &cfg, &files).await;
    let item_dir = out.path().join("item-a");
    std::fs::create_dir_all(&item_dir).unwrap();
    std::fs::write(item_dir.join("file.bin.part"), &body[..half]).unwrap();

    let handle = Engine::resume(out.path(), Overrides::default())
        .await
        .expect("resume");
    let report = handle.wait().await.expect("wait");

    // First attempt aborts as soon as the 200 lands, the partial is
    // discarded, and the retry starts from zero.
    assert_eq!(report.done, 1);
    assert_eq!(std::fs::read(item_dir.join("file.bin")).unwrap(), body);
    assert_eq!(server.download_hits(), 2);
    assert_eq!(server.ranges()[0], Some(half as u64));
    assert_eq!(server.ranges()[1], None);
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_partial_past_the_end_hits_416_and_restarts() {
    let body = patterned_body(16 * 1024);
    let server = archive_server::start(
        vec![("item-a", vec![ServedFile::new("file.bin", body.clone())])],
        ServerOptions::default(),
    );

    let out = tempdir().unwrap();
    let cfg = {
        let mut cfg = EngineConfig::new(out.path().join("items.txt"), out.path());
        cfg.endpoint = server.url().to_string();
        cfg.retry.base_delay_secs = 0;
        cfg
    };
    // Size unknown to the engine, so only the server can notice the stale
    // partial runs past the end.
    let files = [new_file(out.path(), "file.bin", 0, Some(md5_hex(&body)))];
    seed_resolved_job(out.path(), &cfg, &files).await;
    let item_dir = out.path().join("item-a");
    std::fs::create_dir_all(&item_dir).unwrap();
    let mut stale = body.clone();
    stale.extend_from_slice(b"tail from some other version");
    std::fs::write(item_dir.join("file.bin.part"), &stale).unwrap();

    let handle = Engine::resume(out.path(), Overrides::default())
        .await
        .expect("resume");
    let report = handle.wait().await.expect("wait");

    assert_eq!(report.done, 1);
    assert_eq!(std::fs::read(item_dir.join("file.bin")).unwrap(), body);
    assert_eq!(server.ranges()[0], Some(stale.len() as u64));
    assert_eq!(server.ranges()[1], None);
}

#[tokio::test(flavor = "multi_thread")]
async fn integrity_mismatch_retries_then_fails() {
    let body = patterned_body(8 * 1024);
    let mut file = ServedFile::new("file.bin", body);
    file.md5_override = Some("00000000000000000000000000000000".to_string());
    let server = archive_server::start(vec![("item-a", vec![file])], ServerOptions::default());

    let out = tempdir().unwrap();
    let items = write_items_file(out.path(), &["item-a"]);
    let mut cfg = config_for(&server, items, out.path());
    cfg.retry.max_attempts = 2;
    let report = run_to_report(cfg).await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.done, 0);
    assert_eq!(server.download_hits(), 2, "one retry after the first mismatch");

    let store = StateStore::open(&out.path().join(STATE_FILE)).await.unwrap();
    let job_id = job_id_for_root(out.path());
    let item_id = store.list_items(&job_id).await.unwrap()[0].id;
    let file = &store.list_files(item_id).await.unwrap()[0];
    assert_eq!(file.status, FileStatus::Failed);
    assert_eq!(file.last_error.as_deref(), Some("integrity"));
    assert_eq!(file.attempts, 2);

    // Neither the partial nor a bogus final object survives.
    let item_dir = out.path().join("item-a");
    assert!(!item_dir.join("file.bin").exists());
    assert!(!item_dir.join("file.bin.part").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn extension_whitelist_keeps_only_matching_rows() {
    let server = archive_server::start(
        vec![(
            "item-a",
            vec![
                ServedFile::new("a.mp3", patterned_body(2048)),
                ServedFile::new("b.flac", patterned_body(2048)),
                ServedFile::new("cover.jpg", patterned_body(512)),
            ],
        )],
        ServerOptions::default(),
    );

    let out = tempdir().unwrap();
    let items = write_items_file(out.path(), &["item-a"]);
    let mut cfg = config_for(&server, items, out.path());
    cfg.extension_whitelist = vec!["MP3".to_string()];
    let report = run_to_report(cfg).await;

    assert_eq!(report.done, 1);

    // The filtered-out files never became rows at all.
    let store = StateStore::open(&out.path().join(STATE_FILE)).await.unwrap();
    let job_id = job_id_for_root(out.path());
    let item_id = store.list_items(&job_id).await.unwrap()[0].id;
    let files = store.list_files(item_id).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "a.mp3");

    let item_dir = out.path().join("item-a");
    assert!(item_dir.join("a.mp3").exists());
    assert!(!item_dir.join("b.flac").exists());
    assert!(!item_dir.join("cover.jpg").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn bandwidth_cap_paces_the_transfer() {
    let body = patterned_body(400 * 1024);
    let server = archive_server::start(
        vec![("item-a", vec![ServedFile::new("file.bin", body.clone())])],
        ServerOptions::default(),
    );

    let out = tempdir().unwrap();
    let items = write_items_file(out.path(), &["item-a"]);
    let mut cfg = config_for(&server, items, out.path());
    // 200 KiB/s: the burst covers half the 400 KiB body, the rest refills.
    cfg.bandwidth_ceiling_bps = 200 * 1024;

    let started = Instant::now();
    let report = run_to_report(cfg).await;
    let elapsed = started.elapsed();

    assert_eq!(report.done, 1);
    assert_eq!(
        std::fs::read(out.path().join("item-a").join("file.bin")).unwrap(),
        body
    );
    assert!(
        elapsed >= Duration::from_millis(800),
        "400 KiB at 200 KiB/s finished in {:?}",
        elapsed
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_preflight_skips_verified_files_without_traffic() {
    let body = patterned_body(8 * 1024);
    let server = archive_server::start(
        vec![("item-a", vec![ServedFile::new("file.bin", body.clone())])],
        ServerOptions::default(),
    );

    let out = tempdir().unwrap();
    let mut cfg = EngineConfig::new(out.path().join("items.txt"), out.path());
    cfg.endpoint = server.url().to_string();
    cfg.sync = true;
    let files = [new_file(
        out.path(),
        "file.bin",
        body.len() as i64,
        Some(md5_hex(&body)),
    )];
    seed_resolved_job(out.path(), &cfg, &files).await;

    // The final object is already in place (for example rsynced in).
    let item_dir = out.path().join("item-a");
    std::fs::create_dir_all(&item_dir).unwrap();
    std::fs::write(item_dir.join("file.bin"), &body).unwrap();

    let handle = Engine::resume(out.path(), Overrides::default())
        .await
        .expect("resume");
    let report = handle.wait().await.expect("wait");

    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 0);
    assert!(report.is_complete());
    assert_eq!(server.download_hits(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn throttling_trips_the_gate_and_delays_the_retry() {
    let body = patterned_body(8 * 1024);
    let server = archive_server::start(
        vec![("item-a", vec![ServedFile::new("file.bin", body.clone())])],
        ServerOptions {
            throttle_first: 1,
            ..ServerOptions::default()
        },
    );

    let out = tempdir().unwrap();
    // Short quiet range so the test can wait the pause out; production uses
    // the gate's 30-60 s default.
    let gate = Arc::new(BackoffGate::with_range(
        Duration::from_millis(300),
        Duration::from_millis(301),
    ));
    let (checkpoint_tx, _checkpoint_rx) = tokio::sync::mpsc::channel(8);
    let ctx = Arc::new(FetchContext {
        endpoint: server.url().to_string(),
        auth: None,
        sync: false,
        policy: RetryPolicy {
            base_delay_secs: 0,
            ..RetryPolicy::default()
        },
        governor: Arc::new(RateGovernor::unlimited()),
        gate: Arc::clone(&gate),
        cancel: CancelToken::new(),
        checkpoint_tx,
        bytes_counter: Arc::new(AtomicU64::new(0)),
    });
    let file = FileRecord {
        id: 1,
        item_id: 1,
        name: "file.bin".to_string(),
        size: body.len() as i64,
        checksum: Some(md5_hex(&body)),
        dest_path: out.path().join("file.bin").to_string_lossy().into_owned(),
        bytes_done: 0,
        status: FileStatus::InProgress,
        attempts: 0,
        last_error: None,
        http_status: None,
    };

    let started = Instant::now();
    let blocking_ctx = Arc::clone(&ctx);
    let report =
        tokio::task::spawn_blocking(move || fetch_file(&blocking_ctx, &file, "item-a"))
            .await
            .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.outcome, FetchOutcome::Done);
    assert_eq!(report.trips, 1);
    assert_eq!(gate.trip_count(), 1);
    assert!(
        elapsed >= Duration::from_millis(300),
        "retry ran before the quiet period passed: {:?}",
        elapsed
    );
    assert_eq!(std::fs::read(out.path().join("file.bin")).unwrap(), body);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_releases_files_and_keeps_the_partial() {
    let body = patterned_body(512 * 1024);
    let server = archive_server::start(
        vec![("item-a", vec![ServedFile::new("big.bin", body.clone())])],
        ServerOptions::default(),
    );

    let out = tempdir().unwrap();
    let items = write_items_file(out.path(), &["item-a"]);
    let mut cfg = config_for(&server, items, out.path());
    // Slow the transfer down so the stop lands mid-body.
    cfg.bandwidth_ceiling_bps = 64 * 1024;

    let handle = Engine::start(cfg).await.expect("start");
    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.stop();
    let report = handle.wait().await.expect("wait");

    assert!(report.interrupted);
    assert_eq!(report.done, 0);
    assert_eq!(report.pending, 1);

    // The row went back to pending and the partial survived for resumption.
    let store = StateStore::open(&out.path().join(STATE_FILE)).await.unwrap();
    let job_id = job_id_for_root(out.path());
    let item_id = store.list_items(&job_id).await.unwrap()[0].id;
    let file = &store.list_files(item_id).await.unwrap()[0];
    assert_eq!(file.status, FileStatus::Pending);
    assert!(!out.path().join("item-a").join("big.bin").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn premature_eof_resumes_from_the_received_prefix() {
    let body = patterned_body(64 * 1024);
    let server = archive_server::start(
        vec![("item-a", vec![ServedFile::new("file.bin", body.clone())])],
        ServerOptions {
            truncate_first: 1,
            ..ServerOptions::default()
        },
    );

    let out = tempdir().unwrap();
    let items = write_items_file(out.path(), &["item-a"]);
    let cfg = config_for(&server, items, out.path());
    let report = run_to_report(cfg).await;

    assert_eq!(report.done, 1);
    assert_eq!(
        std::fs::read(out.path().join("item-a").join("file.bin")).unwrap(),
        body
    );
    let ranges = server.ranges();
    assert_eq!(ranges.len(), 2, "one plain request, one resume");
    assert_eq!(ranges[0], None);
    let resumed_from = ranges[1].expect("second request must be ranged");
    assert!(resumed_from > 0 && resumed_from < body.len() as u64);
}
