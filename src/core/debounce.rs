//! Coalescing of raw file events into change sets.
//!
//! A window opens on the first event and closes once no event has arrived for
//! the quiet interval, or once it has been open for the maximum window
//! duration, whichever comes first. The maximum keeps continuous writers from
//! starving the committer.
//!
//! Within a window each path is reduced to whether it existed before the window
//! and whether it exists now. A path created and deleted inside one window
//! therefore cancels out.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::events::{changes_from_presence, ChangeSet, RawEvent, RawEventKind};
use super::queue::{MonitoredReceiver, MonitoredSender};

#[derive(Debug, Clone, Copy)]
struct PathState {
    existed_before: bool,
    exists_now: bool,
}

#[derive(Debug)]
struct Window {
    opened: Instant,
    last_event: Instant,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    paths: BTreeMap<PathBuf, PathState>,
    renames: Vec<(PathBuf, PathBuf)>,
    events: usize,
}

impl Window {
    fn open(now: Instant, timestamp: DateTime<Utc>) -> Self {
        Self {
            opened: now,
            last_event: now,
            start: timestamp,
            end: timestamp,
            paths: BTreeMap::new(),
            renames: Vec::new(),
            events: 0,
        }
    }

    fn record(&mut self, event: RawEvent, now: Instant) {
        self.last_event = now;
        self.start = self.start.min(event.timestamp);
        self.end = self.end.max(event.timestamp);
        self.events += 1;

        match event.kind {
            RawEventKind::Created => self.mark(event.path, false, true),
            RawEventKind::Modified => self.mark(event.path, true, true),
            RawEventKind::Deleted => self.mark(event.path, true, false),
            RawEventKind::Renamed { from } => {
                self.mark(from.clone(), true, false);
                self.mark(event.path.clone(), false, true);
                self.note_rename(from, event.path);
            }
        }
    }

    /// `existed_before` only applies the first time the path is seen in this window.
    fn mark(&mut self, path: PathBuf, existed_before: bool, exists_now: bool) {
        self.paths
            .entry(path)
            .and_modify(|state| state.exists_now = exists_now)
            .or_insert(PathState {
                existed_before,
                exists_now,
            });
    }

    fn note_rename(&mut self, from: PathBuf, to: PathBuf) {
        // a -> b followed by b -> c collapses into a -> c
        match self.renames.iter_mut().find(|(_, dest)| *dest == from) {
            Some(pair) => pair.1 = to,
            None => self.renames.push((from, to)),
        }
        self.renames.retain(|(from, to)| from != to);
    }

    fn into_change_set(self, renames_supported: bool) -> ChangeSet {
        let touched = self.paths.keys().cloned().collect();
        let presence = self
            .paths
            .into_iter()
            .map(|(path, state)| (path, (state.existed_before, state.exists_now)))
            .collect();
        let renames = if renames_supported {
            self.renames
        } else {
            Vec::new()
        };
        ChangeSet::new(
            touched,
            changes_from_presence(presence, renames),
            self.start,
            self.end,
        )
    }
}

/// Pure coalescing state machine; time is passed in by the caller.
#[derive(Debug)]
pub struct Coalescer {
    quiet: Duration,
    max_window: Duration,
    renames_supported: bool,
    window: Option<Window>,
}

impl Coalescer {
    pub fn new(quiet: Duration, max_window: Duration) -> Self {
        Self {
            quiet,
            max_window: max_window.max(quiet),
            renames_supported: false,
            window: None,
        }
    }

    /// Keep rename pairs as rename records instead of delete + create.
    pub fn with_renames(mut self, supported: bool) -> Self {
        self.renames_supported = supported;
        self
    }

    pub fn is_open(&self) -> bool {
        self.window.is_some()
    }

    pub fn pending_events(&self) -> usize {
        self.window.as_ref().map_or(0, |w| w.events)
    }

    /// When the open window has to close, if one is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.window.as_ref().map(|w| {
            let quiet_deadline = w.last_event + self.quiet;
            let max_deadline = w.opened + self.max_window;
            quiet_deadline.min(max_deadline)
        })
    }

    /// Add an event. If the open window had already expired it is closed first
    /// and returned; the event then opens a new window.
    pub fn push(&mut self, event: RawEvent, now: Instant) -> Option<ChangeSet> {
        let closed = self.poll(now);
        let timestamp = event.timestamp;
        self.window
            .get_or_insert_with(|| Window::open(now, timestamp))
            .record(event, now);
        closed
    }

    /// Close the window if its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<ChangeSet> {
        match self.deadline() {
            Some(deadline) if deadline <= now => self.flush(),
            _ => None,
        }
    }

    /// Close the open window immediately.
    pub fn flush(&mut self) -> Option<ChangeSet> {
        let window = self.window.take()?;
        trace!(events = window.events, paths = window.paths.len(), "Closing debounce window");
        Some(window.into_change_set(self.renames_supported))
    }
}

/// Drive a [`Coalescer`] from a queue of raw events until the input closes.
///
/// The open window is flushed when the input closes, so shutdown never drops
/// observed changes.
pub async fn run_debounce_loop(
    mut coalescer: Coalescer,
    mut input: MonitoredReceiver<RawEvent>,
    output: MonitoredSender<ChangeSet>,
) {
    debug!(
        quiet_ms = coalescer.quiet.as_millis() as u64,
        max_window_ms = coalescer.max_window.as_millis() as u64,
        "Starting debounce loop"
    );

    loop {
        let deadline = coalescer.deadline();

        tokio::select! {
            event = input.recv() => {
                match event {
                    Some(event) => {
                        trace!(path = %event.path.display(), "Received raw event");
                        if let Some(change_set) = coalescer.push(event, Instant::now()) {
                            if emit(&output, change_set).is_err() {
                                break;
                            }
                        }
                    }
                    None => {
                        debug!("Raw event queue closed, flushing open window");
                        if let Some(change_set) = coalescer.flush() {
                            let _ = emit(&output, change_set);
                        }
                        break;
                    }
                }
            }

            _ = sleep_until_deadline(deadline) => {
                if let Some(change_set) = coalescer.poll(Instant::now()) {
                    if emit(&output, change_set).is_err() {
                        break;
                    }
                }
            }
        }
    }

    debug!("Debounce loop terminated");
}

fn emit(output: &MonitoredSender<ChangeSet>, change_set: ChangeSet) -> Result<(), ()> {
    debug!(
        touched = change_set.touched.len(),
        changes = change_set.changes.len(),
        "Change set closed"
    );
    output.send(change_set).map_err(|_| {
        tracing::warn!("Change set queue closed; change set left for the next startup scan");
    })
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
