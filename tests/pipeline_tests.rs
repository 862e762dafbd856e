use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use file_control::{
    Condition, EngineConfig, EngineEvent, MemoryVcs, RestoreRequest, Snapshot, SnapshotEngine,
    SnapshotKind, Vcs,
};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.debounce.quiet_ms = 200;
    config.debounce.max_window_secs = 2;
    config.commit.backoff_base_ms = 10;
    config.commit.backoff_max_ms = 50;
    config.watcher.suppression_grace_ms = 300;
    config
}

struct Fixture {
    dir: TempDir,
    root: PathBuf,
    vcs: Arc<MemoryVcs>,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let root = dir.path().canonicalize().unwrap();
        let vcs = Arc::new(MemoryVcs::new(&root));
        Self { dir, root, vcs }
    }

    async fn start(&self) -> SnapshotEngine {
        SnapshotEngine::start_with_vcs(&self.root, fast_config(), self.vcs.clone())
            .await
            .expect("Failed to start engine")
    }

    fn write(&self, name: &str, content: &str) {
        fs::write(self.dir.path().join(name), content).expect("Failed to write test file");
    }

    fn read(&self, name: &str) -> String {
        fs::read_to_string(self.dir.path().join(name)).expect("Failed to read test file")
    }
}

/// Wait for the next event matching `pick`.
async fn wait_for<T>(
    events: &mut broadcast::Receiver<EngineEvent>,
    within: Duration,
    mut pick: impl FnMut(EngineEvent) -> Option<T>,
) -> Option<T> {
    let deadline = Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Ok(event)) => {
                if let Some(found) = pick(event) {
                    return Some(found);
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            _ => return None,
        }
    }
}

fn auto_snapshot(event: EngineEvent) -> Option<Snapshot> {
    match event {
        EngineEvent::SnapshotCreated(snapshot) if snapshot.kind == SnapshotKind::Auto => {
            Some(snapshot)
        }
        _ => None,
    }
}

#[tokio::test]
async fn test_burst_of_writes_becomes_one_snapshot() {
    let fx = Fixture::new();
    let engine = fx.start().await;
    let handle = engine.handle();
    let mut events = handle.subscribe();

    for i in 0..20 {
        fx.write("notes.txt", &format!("draft {}", i));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let snapshot = wait_for(&mut events, Duration::from_secs(5), auto_snapshot)
        .await
        .expect("Should have received a snapshot");
    assert_eq!(snapshot.paths(), vec![PathBuf::from("notes.txt")]);
    assert_eq!(snapshot.message, "Add notes.txt");

    // Nothing else follows once the burst has settled
    assert!(wait_for(&mut events, Duration::from_millis(800), auto_snapshot)
        .await
        .is_none());

    let history = handle.history("notes.txt").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].commit, snapshot.commit);
    assert_eq!(fx.vcs.commit_count(), 2);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_file_created_and_deleted_within_window_is_not_committed() {
    let fx = Fixture::new();
    let engine = fx.start().await;
    let mut events = engine.handle().subscribe();

    fx.write("scratch.tmp", "short-lived");
    tokio::time::sleep(Duration::from_millis(30)).await;
    fs::remove_file(fx.dir.path().join("scratch.tmp")).unwrap();

    assert!(wait_for(&mut events, Duration::from_millis(1200), auto_snapshot)
        .await
        .is_none());
    assert_eq!(fx.vcs.commit_count(), 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restore_round_trip_without_feedback() {
    let fx = Fixture::new();
    let engine = fx.start().await;
    let handle = engine.handle();
    let mut events = handle.subscribe();

    fx.write("essay.txt", "first draft");
    let first = wait_for(&mut events, Duration::from_secs(5), auto_snapshot)
        .await
        .expect("first snapshot");
    fx.write("essay.txt", "second draft");
    wait_for(&mut events, Duration::from_secs(5), auto_snapshot)
        .await
        .expect("second snapshot");

    let outcome = handle
        .submit_restore(RestoreRequest::paths(
            vec![PathBuf::from("essay.txt")],
            first.commit.clone(),
        ))
        .outcome()
        .await
        .expect("restore should succeed");
    assert_eq!(fx.read("essay.txt"), "first draft");
    assert!(outcome.restore_snapshot.is_some());

    // The restore's own writes never come back as an automatic snapshot
    assert!(wait_for(&mut events, Duration::from_millis(1500), auto_snapshot)
        .await
        .is_none());

    handle
        .submit_restore(RestoreRequest::paths(
            vec![PathBuf::from("essay.txt")],
            outcome.pre_restore,
        ))
        .outcome()
        .await
        .expect("undo should succeed");
    assert_eq!(fx.read("essay.txt"), "second draft");
    wait_for(&mut events, Duration::from_secs(5), |event| match event {
        EngineEvent::SnapshotCreated(s) if s.kind == SnapshotKind::Restore => Some(()),
        _ => None,
    })
    .await
    .expect("restore snapshot indexed");

    let kinds: Vec<SnapshotKind> = handle
        .history("essay.txt")
        .await
        .unwrap()
        .iter()
        .map(|s| s.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            SnapshotKind::Auto,
            SnapshotKind::Auto,
            SnapshotKind::Restore,
            SnapshotKind::Restore
        ]
    );

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_commits_stay_pending_until_covered() {
    let fx = Fixture::new();
    fx.vcs.ensure_initialized().unwrap();
    let engine = fx.start().await;
    let handle = engine.handle();
    let mut events = handle.subscribe();

    fx.vcs.fail_next(3);
    fx.write("report.docx", "quarterly numbers");

    let failed = wait_for(&mut events, Duration::from_secs(5), |event| match event {
        EngineEvent::Condition(Condition::SnapshotFailed { paths, attempts, .. }) => {
            Some((paths, attempts))
        }
        _ => None,
    })
    .await
    .expect("Should have reported SnapshotFailed");
    assert_eq!(failed, (vec![PathBuf::from("report.docx")], 3));

    let pending = handle.pending_paths();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].path, Path::new("report.docx"));

    fx.write("other.txt", "unrelated edit");
    let snapshot = wait_for(&mut events, Duration::from_secs(5), auto_snapshot)
        .await
        .expect("Next change set should carry the failed one");
    assert_eq!(
        snapshot.paths(),
        vec![PathBuf::from("other.txt"), PathBuf::from("report.docx")]
    );
    assert!(handle.pending_paths().is_empty());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_acknowledged_paths_are_dropped() {
    let fx = Fixture::new();
    fx.vcs.ensure_initialized().unwrap();
    let engine = fx.start().await;
    let handle = engine.handle();
    let mut events = handle.subscribe();

    fx.vcs.fail_next(3);
    fx.write("lost.txt", "gone");
    wait_for(&mut events, Duration::from_secs(5), |event| match event {
        EngineEvent::Condition(Condition::SnapshotFailed { .. }) => Some(()),
        _ => None,
    })
    .await
    .expect("SnapshotFailed");

    let dropped = handle.acknowledge_pending(&[PathBuf::from("lost.txt")]);
    assert_eq!(dropped, vec![PathBuf::from("lost.txt")]);
    assert!(handle.pending_paths().is_empty());
    assert_eq!(handle.retry_pending().await.unwrap(), None);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pause_holds_snapshots_until_resume() {
    let fx = Fixture::new();
    let engine = fx.start().await;
    let handle = engine.handle();
    let mut events = handle.subscribe();

    handle.pause();
    assert!(handle.is_paused());
    fx.write("held.txt", "written while paused");

    assert!(wait_for(&mut events, Duration::from_millis(1000), auto_snapshot)
        .await
        .is_none());

    handle.resume();
    let snapshot = wait_for(&mut events, Duration::from_secs(5), auto_snapshot)
        .await
        .expect("Held change set should commit on resume");
    assert_eq!(snapshot.paths(), vec![PathBuf::from("held.txt")]);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_inactive_config_starts_paused() {
    let fx = Fixture::new();
    let mut config = fast_config();
    config.commit.active = false;
    let engine = SnapshotEngine::start_with_vcs(&fx.root, config, fx.vcs.clone())
        .await
        .unwrap();
    let handle = engine.handle();
    let mut events = handle.subscribe();
    assert!(handle.is_paused());

    fx.write("quiet.txt", "written before resuming");
    assert!(wait_for(&mut events, Duration::from_millis(1000), auto_snapshot)
        .await
        .is_none());

    handle.resume();
    let snapshot = wait_for(&mut events, Duration::from_secs(5), auto_snapshot)
        .await
        .expect("Held change set should commit on resume");
    assert_eq!(snapshot.paths(), vec![PathBuf::from("quiet.txt")]);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_changes_made_while_stopped_are_picked_up() {
    let fx = Fixture::new();
    let engine = fx.start().await;
    engine.shutdown().await.unwrap();

    fx.write("offline.txt", "edited with the watcher off");

    let engine = fx.start().await;
    let mut events = engine.handle().subscribe();
    let snapshot = wait_for(&mut events, Duration::from_secs(5), auto_snapshot)
        .await
        .expect("Startup should replay dirty paths");
    assert_eq!(snapshot.paths(), vec![PathBuf::from("offline.txt")]);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_flushes_open_window() {
    let fx = Fixture::new();
    let mut config = fast_config();
    config.debounce.quiet_ms = 10_000;
    config.debounce.max_window_secs = 60;
    let engine = SnapshotEngine::start_with_vcs(&fx.root, config, fx.vcs.clone())
        .await
        .unwrap();

    fx.write("unsaved.txt", "typed just before quitting");
    tokio::time::sleep(Duration::from_millis(500)).await;
    engine.shutdown().await.unwrap();

    assert_eq!(fx.vcs.commit_count(), 2);
}

#[tokio::test]
async fn test_rebuilt_index_matches_live_index() {
    let fx = Fixture::new();
    let engine = fx.start().await;
    let handle = engine.handle();
    let mut events = handle.subscribe();

    fx.write("a.txt", "a");
    wait_for(&mut events, Duration::from_secs(5), auto_snapshot)
        .await
        .expect("snapshot");
    fx.write("b.txt", "b");
    wait_for(&mut events, Duration::from_secs(5), auto_snapshot)
        .await
        .expect("snapshot");

    let live: Vec<_> = handle
        .snapshots()
        .await
        .unwrap()
        .into_iter()
        .map(|s| (s.commit, s.kind, s.message, s.changes))
        .collect();
    let count = handle.rebuild_history().await.unwrap().unwrap();
    let rebuilt: Vec<_> = handle
        .snapshots()
        .await
        .unwrap()
        .into_iter()
        .map(|s| (s.commit, s.kind, s.message, s.changes))
        .collect();

    assert_eq!(count, 3);
    assert_eq!(live, rebuilt);

    let status = handle.status().await.unwrap();
    assert_eq!(status.snapshots, 3);
    assert_eq!(status.backend, "memory");
    assert_eq!(status.queues.len(), 3);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_root_is_rejected() {
    let fx = Fixture::new();
    let missing = fx.root.join("does-not-exist");
    let result = SnapshotEngine::start_with_vcs(&missing, fast_config(), fx.vcs.clone()).await;
    assert!(matches!(result, Err(file_control::EngineError::MissingRoot(_))));
}
