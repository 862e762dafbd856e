//! Ordered, unbounded queues between pipeline stages.
//!
//! Every queue tracks its depth. Crossing the high-water mark raises a single
//! `Backpressure` condition; the warning re-arms once the queue drains below
//! half the mark.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::SendError, error::TryRecvError};

use super::events::{Condition, EventBus};

#[derive(Debug)]
struct Gauge {
    name: &'static str,
    depth: AtomicUsize,
    high_water_mark: usize,
    warned: AtomicBool,
    bus: EventBus,
}

impl Gauge {
    fn pushed(&self) {
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if depth >= self.high_water_mark && !self.warned.swap(true, Ordering::SeqCst) {
            self.bus.condition(Condition::Backpressure {
                queue: self.name.to_string(),
                depth,
                high_water_mark: self.high_water_mark,
            });
        }
    }

    fn taken(&self) {
        let previous = self
            .depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| Some(d.saturating_sub(1)))
            .unwrap_or(0);
        if previous.saturating_sub(1) <= self.high_water_mark / 2 {
            self.warned.store(false, Ordering::SeqCst);
        }
    }

    fn unpushed(&self) {
        let _ = self
            .depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| Some(d.saturating_sub(1)));
    }
}

/// Create a monitored queue that reports backpressure on `bus`.
pub fn monitored<T>(
    name: &'static str,
    high_water_mark: usize,
    bus: EventBus,
) -> (MonitoredSender<T>, MonitoredReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let gauge = Arc::new(Gauge {
        name,
        depth: AtomicUsize::new(0),
        high_water_mark: high_water_mark.max(1),
        warned: AtomicBool::new(false),
        bus,
    });
    (
        MonitoredSender {
            tx,
            gauge: gauge.clone(),
        },
        MonitoredReceiver { rx, gauge },
    )
}

#[derive(Debug)]
pub struct MonitoredSender<T> {
    tx: mpsc::UnboundedSender<T>,
    gauge: Arc<Gauge>,
}

impl<T> Clone for MonitoredSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            gauge: self.gauge.clone(),
        }
    }
}

impl<T> MonitoredSender<T> {
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.gauge.pushed();
        self.tx.send(value).map_err(|err| {
            self.gauge.unpushed();
            err
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn monitor(&self) -> QueueMonitor {
        QueueMonitor {
            gauge: self.gauge.clone(),
        }
    }
}

#[derive(Debug)]
pub struct MonitoredReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
    gauge: Arc<Gauge>,
}

impl<T> MonitoredReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        let value = self.rx.recv().await;
        if value.is_some() {
            self.gauge.taken();
        }
        value
    }

    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        let value = self.rx.try_recv()?;
        self.gauge.taken();
        Ok(value)
    }

    pub fn monitor(&self) -> QueueMonitor {
        QueueMonitor {
            gauge: self.gauge.clone(),
        }
    }
}

/// Read-only view of a queue's depth, for status reporting.
#[derive(Debug, Clone)]
pub struct QueueMonitor {
    gauge: Arc<Gauge>,
}

impl QueueMonitor {
    pub fn name(&self) -> &'static str {
        self.gauge.name
    }

    pub fn depth(&self) -> usize {
        self.gauge.depth.load(Ordering::SeqCst)
    }

    pub fn high_water_mark(&self) -> usize {
        self.gauge.high_water_mark
    }
}
