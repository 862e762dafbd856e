//! The snapshot engine: one watched tree and its whole pipeline.
//!
//! ```text
//! FileEventSource -> raw -> debounce -> changes -> commit -> snapshots -> index
//!                                                   ^
//!                              RestoreEngine -------+ (same tree lock)
//! ```
//!
//! [`SnapshotEngine`] owns the pipeline tasks and tears them down in order.
//! [`EngineHandle`] is the cheap, cloneable side used for queries and
//! restores; none of its methods block the calling thread.

pub mod committer;
pub mod history;
pub mod pending;
pub mod restore;

use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::core::debounce::{run_debounce_loop, Coalescer};
use crate::core::events::{
    ChangeSet, CommitRef, EngineEvent, EventBus, RawEvent, RawEventKind, Snapshot,
};
use crate::core::filter::FileFilter;
use crate::core::lock;
use crate::core::queue::{monitored, MonitoredReceiver, MonitoredSender, QueueMonitor};
use crate::core::watcher::FileEventSource;
use crate::diff::{diff_versions, DiffAlgorithmType, VersionDiff};
use crate::error::{EngineError, EngineResult};
use crate::vcs::{self, GitCli, Vcs};

pub use committer::{CommitOutcome, SnapshotCommitter, TreeGuard};
pub use history::{FileVersion, HistoryIndex};
pub use pending::{PendingPath, PendingTracker};
pub use restore::{RestoreEngine, RestoreOutcome, RestoreRequest, RestoreTarget, RestoreTicket};

/// Answer to a query, delivered once the engine has computed it.
pub type Reply<T> = oneshot::Receiver<T>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub name: &'static str,
    pub depth: usize,
    pub high_water_mark: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub root: PathBuf,
    pub backend: &'static str,
    pub paused: bool,
    pub head: Option<CommitRef>,
    pub snapshots: usize,
    pub pending: Vec<PendingPath>,
    pub queues: Vec<QueueStatus>,
}

/// A file as it was in some snapshot, next to what is on disk now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionPreview {
    pub path: PathBuf,
    pub commit: CommitRef,
    /// `None` when the file did not exist in that snapshot.
    pub content: Option<Vec<u8>>,
    /// From the snapshot's version to the current file.
    pub diff: VersionDiff,
}

struct Shared {
    runtime: Handle,
    filter: FileFilter,
    bus: EventBus,
    index: Arc<RwLock<HistoryIndex>>,
    committer: Arc<SnapshotCommitter>,
    restorer: Arc<RestoreEngine>,
    paused: watch::Sender<bool>,
    queues: Vec<QueueMonitor>,
}

/// Cloneable access to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

struct PipelineTasks {
    debounce: JoinHandle<()>,
    commit: JoinHandle<()>,
    index: JoinHandle<()>,
    stop_index: oneshot::Sender<()>,
}

/// A watched tree with its running pipeline.
pub struct SnapshotEngine {
    handle: EngineHandle,
    source: FileEventSource,
    tasks: PipelineTasks,
    cache_file: Option<PathBuf>,
}

impl SnapshotEngine {
    /// Start watching `root` with the git backend.
    pub async fn start(root: impl AsRef<Path>, config: EngineConfig) -> EngineResult<Self> {
        let root = canonical_root(root.as_ref())?;
        let vcs: Arc<dyn Vcs> = Arc::new(GitCli::new(&root, &config.commit));
        Self::start_with_vcs(&root, config, vcs).await
    }

    /// Start watching `root` with the given backend, whose root must be the same directory.
    pub async fn start_with_vcs(
        root: impl AsRef<Path>,
        config: EngineConfig,
        vcs: Arc<dyn Vcs>,
    ) -> EngineResult<Self> {
        config.validate().map_err(EngineError::Config)?;
        let root = canonical_root(root.as_ref())?;
        let filter = FileFilter::with_patterns(
            &root,
            &config.watcher.ignore,
            config.watcher.respect_gitignore,
        )
        .map_err(|e| EngineError::Config(format!("{:#}", e)))?;

        let head = vcs::blocking(&vcs, |vcs| vcs.ensure_initialized()).await?;
        info!(backend = vcs.name(), head = %head.short(), "Opened {}", root.display());

        let cache_file = if config.history.cache_enabled {
            vcs.metadata_dir().map(|dir| dir.join(&config.history.cache_file))
        } else {
            None
        };
        let index = load_index(&vcs, cache_file.as_deref(), &head).await?;
        info!(snapshots = index.len(), "History index ready");

        let bus = EventBus::new();
        let hwm = config.queues.high_water_mark;
        let (raw_tx, raw_rx) = monitored::<RawEvent>("raw", hwm, bus.clone());
        let (changes_tx, changes_rx) = monitored::<ChangeSet>("changes", hwm, bus.clone());
        let (snapshots_tx, snapshots_rx) = monitored::<Snapshot>("snapshots", hwm, bus.clone());
        let queues = vec![raw_tx.monitor(), changes_tx.monitor(), snapshots_tx.monitor()];

        let committer = Arc::new(SnapshotCommitter::new(
            vcs.clone(),
            config.commit.clone(),
            bus.clone(),
            snapshots_tx,
        ));

        let startup_tx = raw_tx.clone();
        let source = FileEventSource::start(filter.clone(), &config.watcher, raw_tx, bus.clone())
            .map_err(|e| EngineError::Watch(format!("{:#}", e)))?;
        let restorer = Arc::new(RestoreEngine::new(
            committer.clone(),
            source.control(),
            bus.clone(),
        ));

        let pending = replay_dirty_paths(&vcs, &head, &startup_tx).await?;
        drop(startup_tx);
        if pending > 0 {
            info!(paths = pending, "Found changes made while not watching");
        }

        let index = Arc::new(RwLock::new(index));
        if !config.commit.active {
            info!("Starting with automatic snapshots paused");
        }
        let (paused, paused_rx) = watch::channel(!config.commit.active);
        let (stop_index, stop_index_rx) = oneshot::channel();

        let coalescer = Coalescer::new(
            config.debounce.quiet_duration(),
            config.debounce.max_window_duration(),
        )
        .with_renames(vcs.supports_renames());

        let tasks = PipelineTasks {
            debounce: tokio::spawn(run_debounce_loop(coalescer, raw_rx, changes_tx)),
            commit: tokio::spawn(run_commit_loop(committer.clone(), changes_rx, paused_rx)),
            index: tokio::spawn(run_index_loop(
                index.clone(),
                snapshots_rx,
                bus.clone(),
                stop_index_rx,
            )),
            stop_index,
        };

        let handle = EngineHandle {
            shared: Arc::new(Shared {
                runtime: Handle::current(),
                filter,
                bus,
                index,
                committer,
                restorer,
                paused,
                queues,
            }),
        };

        Ok(Self {
            handle,
            source,
            tasks,
            cache_file,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn root(&self) -> &Path {
        self.handle.root()
    }

    /// Stop watching, commit what was already observed and persist the
    /// history cache. Restores still running finish first.
    pub async fn shutdown(self) -> EngineResult<()> {
        info!("Shutting down");
        self.source.stop().await;

        // The debounce loop flushes its open window once the raw queue closes,
        // and the commit loop drains once the debounce loop is gone.
        if let Err(err) = self.tasks.debounce.await {
            warn!("Debounce task ended abnormally: {}", err);
        }
        if let Err(err) = self.tasks.commit.await {
            warn!("Commit task ended abnormally: {}", err);
        }

        let committer = self.handle.shared.committer.clone();
        drop(committer.lock_tree().await);

        let _ = self.tasks.stop_index.send(());
        if let Err(err) = self.tasks.index.await {
            warn!("Index task ended abnormally: {}", err);
        }

        let pending = lock(committer.pending()).len();
        if pending > 0 {
            warn!(paths = pending, "Shutting down with uncommitted changes");
        }

        if let Some(file) = &self.cache_file {
            let head = vcs::blocking(committer.vcs(), |vcs| vcs.head()).await?;
            self.handle
                .shared
                .index
                .read()
                .await
                .save(file, head.as_ref())?;
        }
        info!("Stopped");
        Ok(())
    }
}

impl EngineHandle {
    pub fn root(&self) -> &Path {
        self.shared.filter.root()
    }

    /// Snapshot-created and condition events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.bus.subscribe()
    }

    fn query<T, F>(&self, future: F) -> Reply<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.shared.runtime.spawn(async move {
            let _ = tx.send(future.await);
        });
        rx
    }

    fn with_index<T, F>(&self, f: F) -> Reply<T>
    where
        T: Send + 'static,
        F: FnOnce(&HistoryIndex) -> T + Send + 'static,
    {
        let index = self.shared.index.clone();
        self.query(async move { f(&*index.read().await) })
    }

    fn normalize(&self, path: &Path) -> Option<PathBuf> {
        self.shared.filter.relative(path)
    }

    /// Every snapshot, oldest first.
    pub fn snapshots(&self) -> Reply<Vec<Snapshot>> {
        self.with_index(|index| index.snapshots().to_vec())
    }

    /// Snapshots touching `path`, oldest first. Absolute paths must be under the root.
    pub fn history(&self, path: impl AsRef<Path>) -> Reply<Vec<Snapshot>> {
        let path = self.normalize(path.as_ref());
        self.with_index(move |index| match path {
            Some(path) => index.history(&path).into_iter().cloned().collect(),
            None => Vec::new(),
        })
    }

    pub fn versions(&self, path: impl AsRef<Path>) -> Reply<Vec<FileVersion>> {
        let path = self.normalize(path.as_ref());
        self.with_index(move |index| match path {
            Some(path) => index.versions(&path),
            None => Vec::new(),
        })
    }

    pub fn in_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Reply<Vec<Snapshot>> {
        self.with_index(move |index| index.in_range(from, to).into_iter().cloned().collect())
    }

    pub fn as_of(&self, at: DateTime<Utc>) -> Reply<Option<Snapshot>> {
        self.with_index(move |index| index.as_of(at).cloned())
    }

    pub fn path_as_of(&self, path: impl AsRef<Path>, at: DateTime<Utc>) -> Reply<Option<Snapshot>> {
        let path = self.normalize(path.as_ref());
        self.with_index(move |index| path.and_then(|p| index.path_as_of(&p, at).cloned()))
    }

    /// Queue a restore. Nothing happens to the tree until the restore gets
    /// the tree lock, and it can be cancelled until then.
    pub fn submit_restore(&self, request: RestoreRequest) -> RestoreTicket {
        let _runtime = self.shared.runtime.enter();
        self.shared.restorer.submit(request)
    }

    /// Show a file as of a snapshot, with a diff against the current file.
    pub fn preview(
        &self,
        path: impl AsRef<Path>,
        commit: CommitRef,
        algorithm: DiffAlgorithmType,
    ) -> Reply<EngineResult<VersionPreview>> {
        let requested = path.as_ref().to_path_buf();
        let rel = self.normalize(&requested);
        let vcs = self.shared.committer.vcs().clone();
        let root = self.root().to_path_buf();
        self.query(async move {
            let rel = rel.ok_or(EngineError::OutsideTree(requested))?;
            preview_version(vcs, root, rel, commit, algorithm).await
        })
    }

    /// Hold closed change sets instead of committing them.
    pub fn pause(&self) {
        if !self.shared.paused.send_replace(true) {
            info!("Automatic snapshots paused");
        }
    }

    /// Commit anything held while paused and carry on.
    pub fn resume(&self) {
        if self.shared.paused.send_replace(false) {
            info!("Automatic snapshots resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    /// Paths whose latest changes are not in any snapshot yet.
    pub fn pending_paths(&self) -> Vec<PendingPath> {
        lock(self.shared.committer.pending()).paths()
    }

    /// Give up on saving the given paths' pending changes.
    pub fn acknowledge_pending(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        let paths: Vec<PathBuf> = paths.iter().filter_map(|p| self.normalize(p)).collect();
        let dropped = lock(self.shared.committer.pending()).acknowledge(&paths);
        if !dropped.is_empty() {
            warn!(paths = dropped.len(), "Pending changes acknowledged as lost");
        }
        dropped
    }

    /// Commit failed changes now rather than with the next change set.
    pub fn retry_pending(&self) -> Reply<Option<CommitOutcome>> {
        let committer = self.shared.committer.clone();
        self.query(async move { committer.retry_pending().await })
    }

    pub fn status(&self) -> Reply<EngineStatus> {
        let shared = self.shared.clone();
        self.query(async move {
            let vcs = shared.committer.vcs().clone();
            let head = vcs::blocking(&vcs, |vcs| vcs.head()).await.unwrap_or_else(|err| {
                warn!("Could not read HEAD: {}", err);
                None
            });
            let snapshots = shared.index.read().await.len();
            let pending = lock(shared.committer.pending()).paths();
            EngineStatus {
                root: shared.filter.root().to_path_buf(),
                backend: vcs.name(),
                paused: *shared.paused.borrow(),
                head,
                snapshots,
                pending,
                queues: shared
                    .queues
                    .iter()
                    .map(|q| QueueStatus {
                        name: q.name(),
                        depth: q.depth(),
                        high_water_mark: q.high_water_mark(),
                    })
                    .collect(),
            }
        })
    }

    /// Throw the index away and replay the backend's log.
    pub fn rebuild_history(&self) -> Reply<EngineResult<usize>> {
        let shared = self.shared.clone();
        self.query(rebuild_index(shared))
    }
}

async fn preview_version(
    vcs: Arc<dyn Vcs>,
    root: PathBuf,
    rel: PathBuf,
    commit: CommitRef,
    algorithm: DiffAlgorithmType,
) -> EngineResult<VersionPreview> {
    let requested_commit = commit.to_string();
    let commit = vcs::blocking(&vcs, move |vcs| vcs.resolve(&commit))
        .await?
        .ok_or(vcs::VcsError::UnknownRevision(requested_commit))?;
    let (read_commit, read_path) = (commit.clone(), rel.clone());
    let content = vcs::blocking(&vcs, move |vcs| vcs.read(&read_commit, &read_path)).await?;
    let current = match tokio::fs::read(root.join(&rel)).await {
        Ok(bytes) => Some(bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => return Err(err.into()),
    };
    let label = rel.display().to_string();
    let diff = diff_versions(
        content.as_deref(),
        current.as_deref(),
        &format!("{}@{}", label, commit.short()),
        &label,
        algorithm,
    );
    Ok(VersionPreview {
        path: rel,
        commit,
        content,
        diff,
    })
}

async fn rebuild_index(shared: Arc<Shared>) -> EngineResult<usize> {
    let _guard = shared.committer.lock_tree().await;
    let entries = vcs::blocking(shared.committer.vcs(), |vcs| vcs.log()).await?;
    let rebuilt = HistoryIndex::from_log(entries);
    let count = rebuilt.len();
    *shared.index.write().await = rebuilt;
    info!(snapshots = count, "Rebuilt history index");
    Ok(count)
}

fn canonical_root(root: &Path) -> EngineResult<PathBuf> {
    match root.canonicalize() {
        Ok(path) if path.is_dir() => Ok(path),
        _ => Err(EngineError::MissingRoot(root.to_path_buf())),
    }
}

async fn load_index(
    vcs: &Arc<dyn Vcs>,
    cache_file: Option<&Path>,
    head: &CommitRef,
) -> EngineResult<HistoryIndex> {
    if let Some(file) = cache_file {
        if let Some(index) = HistoryIndex::load(file, Some(head)) {
            debug!("Loaded history from cache");
            return Ok(index);
        }
    }
    let entries = vcs::blocking(vcs, |vcs| vcs.log()).await?;
    Ok(HistoryIndex::from_log(entries))
}

/// Feed paths that changed while nobody was watching into the pipeline.
async fn replay_dirty_paths(
    vcs: &Arc<dyn Vcs>,
    head: &CommitRef,
    output: &MonitoredSender<RawEvent>,
) -> EngineResult<usize> {
    let head = head.clone();
    let (dirty, tracked) = vcs::blocking(vcs, move |vcs| {
        let dirty = vcs.dirty_paths()?;
        let tracked: BTreeSet<PathBuf> = vcs.list_files(&head)?.into_iter().collect();
        Ok((dirty, tracked))
    })
    .await?;

    let root = vcs.root().to_path_buf();
    for path in &dirty {
        let kind = match (tracked.contains(path), root.join(path).exists()) {
            (_, false) => RawEventKind::Deleted,
            (true, true) => RawEventKind::Modified,
            (false, true) => RawEventKind::Created,
        };
        if output.send(RawEvent::new(path.clone(), kind)).is_err() {
            return Err(EngineError::Stopped);
        }
    }
    Ok(dirty.len())
}

async fn run_commit_loop(
    committer: Arc<SnapshotCommitter>,
    mut input: MonitoredReceiver<ChangeSet>,
    mut paused: watch::Receiver<bool>,
) {
    let mut held: Option<ChangeSet> = None;

    loop {
        tokio::select! {
            change_set = input.recv() => {
                let Some(change_set) = change_set else { break };
                if *paused.borrow() {
                    debug!(paths = change_set.touched.len(), "Paused, holding change set");
                    held = Some(match held.take() {
                        Some(earlier) => earlier.absorb(change_set),
                        None => change_set,
                    });
                    continue;
                }
                committer.commit_change_set(change_set).await;
            }

            Ok(()) = paused.changed() => {
                let is_paused = *paused.borrow_and_update();
                if !is_paused {
                    if let Some(change_set) = held.take() {
                        committer.commit_change_set(change_set).await;
                    }
                }
            }
        }
    }

    if let Some(change_set) = held {
        if *paused.borrow() {
            info!(
                paths = change_set.touched.len(),
                "Leaving held changes for the next start"
            );
        } else {
            committer.commit_change_set(change_set).await;
        }
    }
    debug!("Commit loop terminated");
}

async fn run_index_loop(
    index: Arc<RwLock<HistoryIndex>>,
    mut input: MonitoredReceiver<Snapshot>,
    bus: EventBus,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            snapshot = input.recv() => match snapshot {
                Some(snapshot) => record(&index, &bus, snapshot).await,
                None => break,
            },

            _ = &mut stop => {
                while let Ok(snapshot) = input.try_recv() {
                    record(&index, &bus, snapshot).await;
                }
                break;
            }
        }
    }
    debug!("Index loop terminated");
}

async fn record(index: &RwLock<HistoryIndex>, bus: &EventBus, snapshot: Snapshot) {
    if index.write().await.record(snapshot.clone()) {
        bus.snapshot_created(snapshot);
    }
}
