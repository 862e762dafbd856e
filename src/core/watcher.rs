//! File Event Source: turns platform notifications into [`RawEvent`]s.
//!
//! Notifications are checked against the last known [`TreeState`], so the
//! source only reports real changes. A periodic reconciliation scan (and one
//! after every overflow or backend error) recovers anything the platform
//! dropped. When the root disappears emission stops until it comes back, at
//! which point the tree is fully rescanned.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::events::{Condition, EngineEvent, EventBus, RawEvent, RawEventKind};
use super::filter::FileFilter;
use super::lock;
use super::queue::MonitoredSender;
use super::scan::TreeState;
use super::suppress::Suppressions;
use crate::config::WatcherConfig;

/// Lets the restore engine keep its own writes out of the event stream.
#[derive(Debug, Clone)]
pub struct WatchControl {
    filter: FileFilter,
    state: Arc<Mutex<TreeState>>,
    suppressions: Suppressions,
    grace: Duration,
}

impl WatchControl {
    /// Stop reporting the given paths until [`WatchControl::resume`] is called.
    pub fn suppress(&self, paths: &[PathBuf]) {
        self.suppressions.hold(paths);
    }

    /// Adopt the current on-disk state of `paths` silently, then report them
    /// again once the grace period has passed.
    pub fn resume(&self, paths: &[PathBuf]) {
        lock(&self.state).refresh(&self.filter, paths);
        self.suppressions.release(paths, self.grace);
    }

    pub fn filter(&self) -> &FileFilter {
        &self.filter
    }
}

pub struct FileEventSource {
    control: WatchControl,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl FileEventSource {
    /// Scan the tree, register the platform watcher and start emitting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        filter: FileFilter,
        config: &WatcherConfig,
        output: MonitoredSender<RawEvent>,
        bus: EventBus,
    ) -> Result<Self> {
        let root = filter.root().to_path_buf();
        let initial = TreeState::scan(&filter)
            .with_context(|| format!("Failed to scan {}", root.display()))?;
        debug!(files = initial.len(), root = %root.display(), "Initial scan complete");

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let watcher = create_watcher(&root, notify_tx.clone())?;

        let state = Arc::new(Mutex::new(initial));
        let control = WatchControl {
            filter: filter.clone(),
            state: state.clone(),
            suppressions: Suppressions::new(),
            grace: config.suppression_grace(),
        };
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = SourceTask {
            filter,
            state,
            suppressions: control.suppressions.clone(),
            output,
            bus,
            watcher: Some(watcher),
            notify_tx,
            available: true,
        };
        let handle = tokio::spawn(task.run(
            notify_rx,
            shutdown_rx,
            config.reconcile_interval(),
            config.root_check_interval(),
        ));

        info!("Watching {}", root.display());
        Ok(Self {
            control,
            shutdown,
            task: Some(handle),
        })
    }

    pub fn control(&self) -> WatchControl {
        self.control.clone()
    }

    /// Stop watching. Returns once the background task has exited and the
    /// output queue has been released.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!("File event source task ended abnormally: {}", err);
            }
        }
    }
}

impl Drop for FileEventSource {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn create_watcher(
    root: &Path,
    notify_tx: mpsc::UnboundedSender<notify::Result<Event>>,
) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = notify_tx.send(res);
    })
    .context("Failed to create file system watcher")?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .context("Failed to start watching directory")?;

    Ok(watcher)
}

struct SourceTask {
    filter: FileFilter,
    state: Arc<Mutex<TreeState>>,
    suppressions: Suppressions,
    output: MonitoredSender<RawEvent>,
    bus: EventBus,
    watcher: Option<RecommendedWatcher>,
    notify_tx: mpsc::UnboundedSender<notify::Result<Event>>,
    available: bool,
}

impl SourceTask {
    async fn run(
        mut self,
        mut notifications: mpsc::UnboundedReceiver<notify::Result<Event>>,
        mut shutdown: watch::Receiver<bool>,
        reconcile_every: Duration,
        root_check_every: Duration,
    ) {
        let mut reconcile = interval_at(Instant::now() + reconcile_every, reconcile_every);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut root_check = interval_at(Instant::now() + root_check_every, root_check_every);
        root_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let open = tokio::select! {
                _ = shutdown.changed() => break,
                Some(result) = notifications.recv() => self.handle_notification(result),
                _ = reconcile.tick() => self.reconcile(),
                _ = root_check.tick() => self.check_root(),
            };
            if !open {
                debug!("Raw event queue closed, stopping file event source");
                break;
            }
        }

        self.watcher = None;
        debug!("File event source stopped");
    }

    fn handle_notification(&mut self, result: notify::Result<Event>) -> bool {
        let event = match result {
            Ok(event) => event,
            Err(err) => {
                warn!("File watcher error, reconciling: {}", err);
                return self.reconcile();
            }
        };

        if event.need_rescan() {
            debug!("Watcher requested a rescan");
            return self.reconcile();
        }
        if !self.available {
            return true;
        }

        trace!(kind = ?event.kind, paths = event.paths.len(), "Notification");
        let events = match event.kind {
            EventKind::Access(_) => Vec::new(),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
                self.observe_rename(&event.paths[0], &event.paths[1])
            }
            EventKind::Modify(ModifyKind::Data(_)) => self.observe_write(&event.paths),
            _ => self.observe_paths(&event.paths),
        };
        self.emit(events)
    }

    fn relevant(&self, abs: &Path) -> Option<PathBuf> {
        let rel = self.filter.relative(abs)?;
        if self.filter.is_ignored_relative(&rel, abs.is_dir()) {
            return None;
        }
        if self.suppressions.is_suppressed(&rel) {
            trace!(path = %rel.display(), "Suppressed");
            return None;
        }
        Some(rel)
    }

    fn observe_paths(&self, paths: &[PathBuf]) -> Vec<RawEvent> {
        let mut state = lock(&self.state);
        paths
            .iter()
            .filter_map(|abs| self.relevant(abs))
            .flat_map(|rel| state.observe(&self.filter, &rel))
            .collect()
    }

    /// Content writes are reported even when size and mtime look unchanged.
    fn observe_write(&self, paths: &[PathBuf]) -> Vec<RawEvent> {
        let mut state = lock(&self.state);
        let mut events = Vec::new();
        for rel in paths.iter().filter_map(|abs| self.relevant(abs)) {
            let observed = state.observe(&self.filter, &rel);
            if observed.is_empty() && state.contains(&rel) {
                events.push(RawEvent::new(rel, RawEventKind::Modified));
            } else {
                events.extend(observed);
            }
        }
        events
    }

    fn observe_rename(&self, from_abs: &Path, to_abs: &Path) -> Vec<RawEvent> {
        let from = self.relevant(from_abs);
        let to = self.relevant(to_abs);
        let mut state = lock(&self.state);
        match (from, to) {
            (Some(from), Some(to)) => {
                let events = state.rename(&self.filter, &from, &to);
                if events.is_empty() && state.contains(&to) && !state.contains(&from) {
                    // Both halves were already seen as separate notifications;
                    // pass the pairing on so the debouncer can record a rename.
                    vec![RawEvent::new(to, RawEventKind::Renamed { from })]
                } else {
                    events
                }
            }
            (Some(only), None) | (None, Some(only)) => state.observe(&self.filter, &only),
            (None, None) => Vec::new(),
        }
    }

    /// Diff a fresh walk against the known state. Suppressed paths keep their
    /// old state so a later pass still reports them.
    fn reconcile(&mut self) -> bool {
        if !self.available {
            return true;
        }
        let fresh = match TreeState::scan(&self.filter) {
            Ok(fresh) => fresh,
            Err(err) => {
                debug!("Reconciliation scan failed: {}", err);
                return self.check_root();
            }
        };

        let events = {
            let mut state = lock(&self.state);
            let mut next = fresh;
            let mut events = Vec::new();
            for event in state.diff(&next) {
                if self.suppressions.is_suppressed(&event.path) {
                    next.set(event.path.clone(), state.get(&event.path));
                } else {
                    events.push(event);
                }
            }
            *state = next;
            events
        };

        if !events.is_empty() {
            info!("Reconciliation found {} missed change(s)", events.len());
        }
        self.emit(events)
    }

    fn check_root(&mut self) -> bool {
        let root = self.filter.root().to_path_buf();
        let present = root.is_dir();

        if self.available && !present {
            self.available = false;
            self.watcher = None;
            self.bus.condition(Condition::WatchUnavailable {
                root,
                reason: "watched directory no longer exists".to_string(),
            });
            return true;
        }

        if !self.available && present {
            match create_watcher(&root, self.notify_tx.clone()) {
                Ok(watcher) => {
                    self.watcher = Some(watcher);
                    self.available = true;
                    let open = self.reconcile();
                    self.bus.emit(EngineEvent::Condition(Condition::WatchRecovered {
                        root: root.clone(),
                    }));
                    info!("Watch recovered for {}", root.display());
                    return open;
                }
                Err(err) => debug!("Root is back but cannot be watched yet: {:#}", err),
            }
        }
        true
    }

    fn emit(&self, events: Vec<RawEvent>) -> bool {
        for event in events {
            trace!(path = %event.path.display(), kind = ?event.kind, "Raw event");
            if self.output.send(event).is_err() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::queue::{monitored, MonitoredReceiver};
    use std::fs;
    use tempfile::TempDir;

    fn fast_config() -> WatcherConfig {
        WatcherConfig {
            reconcile_interval_secs: 1,
            root_check_interval_ms: 100,
            suppression_grace_ms: 200,
            ..WatcherConfig::default()
        }
    }

    async fn next_for(rx: &mut MonitoredReceiver<RawEvent>, path: &str) -> Option<RawEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(event)) if event.path == Path::new(path) => return Some(event),
                Ok(Some(_)) => continue,
                _ => return None,
            }
        }
    }

    #[tokio::test]
    async fn test_reports_new_file() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new();
        let (tx, mut rx) = monitored("raw", 1024, bus.clone());
        let filter = FileFilter::new(dir.path()).unwrap();
        let source = FileEventSource::start(filter, &fast_config(), tx, bus).unwrap();

        fs::write(dir.path().join("hello.txt"), "hello").unwrap();

        let event = next_for(&mut rx, "hello.txt").await.expect("event for hello.txt");
        assert!(matches!(
            event.kind,
            RawEventKind::Created | RawEventKind::Modified
        ));

        source.stop().await;
    }

    #[tokio::test]
    async fn test_suppressed_paths_are_not_reported() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new();
        let (tx, mut rx) = monitored("raw", 1024, bus.clone());
        let filter = FileFilter::new(dir.path()).unwrap();
        let source = FileEventSource::start(filter, &fast_config(), tx, bus).unwrap();
        let control = source.control();

        let restored = vec![PathBuf::from("restored.txt")];
        control.suppress(&restored);
        fs::write(dir.path().join("restored.txt"), "old version").unwrap();
        control.resume(&restored);

        fs::write(dir.path().join("user.txt"), "typed by hand").unwrap();
        next_for(&mut rx, "user.txt").await.expect("event for user.txt");

        // Let a reconciliation pass run as well
        tokio::time::sleep(Duration::from_millis(1500)).await;
        while let Ok(event) = rx.try_recv() {
            assert_ne!(event.path, Path::new("restored.txt"));
        }

        source.stop().await;
    }

    /// A source with no platform watcher: only reconciliation can see changes,
    /// and the test feeds notifications itself.
    struct Unwatched {
        notify_tx: mpsc::UnboundedSender<notify::Result<Event>>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
    }

    fn start_unwatched(root: &Path, output: MonitoredSender<RawEvent>, reconcile_every: Duration) -> Unwatched {
        let filter = FileFilter::new(root).unwrap();
        let state = Arc::new(Mutex::new(TreeState::scan(&filter).unwrap()));
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let source = SourceTask {
            filter,
            state,
            suppressions: Suppressions::new(),
            output,
            bus: EventBus::new(),
            watcher: None,
            notify_tx: notify_tx.clone(),
            available: true,
        };
        let task = tokio::spawn(source.run(
            notify_rx,
            shutdown_rx,
            reconcile_every,
            Duration::from_secs(3600),
        ));
        Unwatched {
            notify_tx,
            shutdown,
            task,
        }
    }

    impl Unwatched {
        async fn stop(self) {
            let _ = self.shutdown.send(true);
            self.task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_reconciliation_reports_unnotified_changes() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::write(root.join("known.txt"), "before").unwrap();

        let (tx, mut rx) = monitored("raw", 1024, EventBus::new());
        let source = start_unwatched(&root, tx, Duration::from_millis(300));

        fs::write(root.join("missed.txt"), "never announced").unwrap();
        fs::remove_file(root.join("known.txt")).unwrap();

        let mut seen = std::collections::BTreeMap::new();
        while seen.len() < 2 {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(event)) => {
                    seen.insert(event.path, event.kind);
                }
                _ => break,
            }
        }
        assert_eq!(seen.get(Path::new("missed.txt")), Some(&RawEventKind::Created));
        assert_eq!(seen.get(Path::new("known.txt")), Some(&RawEventKind::Deleted));

        source.stop().await;
    }

    #[tokio::test]
    async fn test_overflow_triggers_rescan() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();

        let (tx, mut rx) = monitored("raw", 1024, EventBus::new());
        let source = start_unwatched(&root, tx, Duration::from_secs(3600));

        fs::write(root.join("dropped.txt"), "lost in an overflow").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());

        let overflow = Event::new(EventKind::Other).set_flag(notify::event::Flag::Rescan);
        source.notify_tx.send(Ok(overflow)).unwrap();
        let event = next_for(&mut rx, "dropped.txt").await.expect("event after rescan");
        assert_eq!(event.kind, RawEventKind::Created);

        // A backend error is handled the same way
        fs::write(root.join("errored.txt"), "lost to a backend error").unwrap();
        source
            .notify_tx
            .send(Err(notify::Error::generic("event queue overflow")))
            .unwrap();
        next_for(&mut rx, "errored.txt").await.expect("event after watcher error");

        source.stop().await;
    }

    #[tokio::test]
    async fn test_root_removal_and_recovery() {
        let parent = TempDir::new().unwrap();
        let root = parent.path().join("watched");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();

        let bus = EventBus::new();
        let mut conditions = bus.subscribe();
        let (tx, _rx) = monitored("raw", 1024, bus.clone());
        let filter = FileFilter::new(&root).unwrap();
        let source = FileEventSource::start(filter, &fast_config(), tx, bus).unwrap();

        fs::remove_dir_all(&root).unwrap();
        let unavailable = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(EngineEvent::Condition(Condition::WatchUnavailable { .. })) =
                    conditions.recv().await
                {
                    return;
                }
            }
        })
        .await;
        assert!(unavailable.is_ok());

        fs::create_dir_all(&root).unwrap();
        let recovered = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(EngineEvent::Condition(Condition::WatchRecovered { .. })) =
                    conditions.recv().await
                {
                    return;
                }
            }
        })
        .await;
        assert!(recovered.is_ok());

        source.stop().await;
    }
}
