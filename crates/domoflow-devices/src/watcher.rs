/*!
 * Background update channel between vendor transports and devices.
 *
 * A [`Watcher`] runs a transport-specific [`WatcherDriver`] on its own task
 * and fans the driver's events out to registered report handlers, so a
 * device keeps reflecting vendor pushes while the application does other
 * work. Devices without a push channel use the snapshot-diffing
 * [`PollingDriver`].
 */
use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use domoflow_core::types::{Sid, ValueMap};
use domoflow_core::utils::spawn_and_log;

use crate::device::{DeviceError, Result};
use crate::status::DeviceStatus;

/// Queue depth between a watcher driver and the dispatch worker.
const REPORT_CHANNEL_CAPACITY: usize = 128;

/// Kind of event a watcher delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    /// A state change report
    Report,
    /// A keep-alive from a gateway or device
    Heartbeat,
}

/// One event delivered by a watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Kind of event
    #[serde(rename = "cmd")]
    pub kind: ReportKind,
    /// The reporting device
    pub sid: Sid,
    /// Vendor model, when the transport knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// When the event was received
    #[serde(default = "Utc::now")]
    pub ts: DateTime<Utc>,
    /// The reported attribute values
    pub data: ValueMap,
}

impl Report {
    /// Create a state change report stamped with the current time.
    pub fn new<S: Into<Sid>>(sid: S, data: ValueMap) -> Self {
        Self {
            kind: ReportKind::Report,
            sid: sid.into(),
            model: None,
            ts: Utc::now(),
            data,
        }
    }

    /// Create a heartbeat event.
    pub fn heartbeat<S: Into<Sid>>(sid: S, data: ValueMap) -> Self {
        Self {
            kind: ReportKind::Heartbeat,
            ..Self::new(sid, data)
        }
    }

    /// Attach the vendor model.
    pub fn with_model<M: Into<String>>(mut self, model: M) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Whether this event is a keep-alive rather than a state change.
    pub fn is_heartbeat(&self) -> bool {
        self.kind == ReportKind::Heartbeat
    }
}

/// Transport-specific receive loop feeding a [`Watcher`].
#[async_trait]
pub trait WatcherDriver: Send + Sync + Debug {
    /// Receive vendor events and push them into `tx` until stopped.
    ///
    /// Per-datagram failures are the driver's to log and ride out; the
    /// loop only returns when [`WatcherDriver::stop`] is called, `tx`
    /// closes, or the transport is gone for good.
    async fn watch(&self, tx: mpsc::Sender<Report>) -> Result<()>;

    /// Signal the receive loop to exit and release its transport
    /// resources. Must be idempotent and observed within one in-flight
    /// timeout.
    async fn stop(&self);
}

/// A registered report callback.
pub type ReportHandler = Arc<dyn Fn(Report) + Send + Sync>;

/// Fans vendor events out to registered report handlers.
///
/// The driver runs on its own task and hands events to a dispatch worker
/// over a bounded channel; every event is delivered to the current
/// handlers on a fresh task, so a slow handler cannot stall the driver's
/// receive loop.
pub struct Watcher {
    driver: Arc<dyn WatcherDriver>,
    handlers: Arc<RwLock<HashMap<Uuid, ReportHandler>>>,
    driver_task: JoinHandle<()>,
    stopped: AtomicBool,
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("driver", &self.driver)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Spawn `driver` and the dispatch worker.
    pub fn start(driver: Arc<dyn WatcherDriver>) -> Self {
        let (tx, mut rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);
        let handlers: Arc<RwLock<HashMap<Uuid, ReportHandler>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let driver_task = spawn_and_log("watcher driver", {
            let driver = Arc::clone(&driver);
            async move { driver.watch(tx).await }
        });

        let dispatch = Arc::clone(&handlers);
        tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                let current: Vec<ReportHandler> = dispatch
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .cloned()
                    .collect();
                if current.is_empty() {
                    continue;
                }
                tokio::spawn(async move {
                    for handler in &current {
                        handler(report.clone());
                    }
                });
            }
            debug!("watcher dispatch worker finished");
        });

        Self {
            driver,
            handlers,
            driver_task,
            stopped: AtomicBool::new(false),
        }
    }

    /// Register a report handler; every event delivered from now on
    /// reaches it. Returns a token for
    /// [`Watcher::remove_report_handler`].
    pub fn add_report_handler<F>(&self, handler: F) -> Uuid
    where
        F: Fn(Report) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(handler));
        id
    }

    /// Drop a handler. Returns whether it was registered.
    pub fn remove_report_handler(&self, id: Uuid) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Whether [`Watcher::stop`] has run.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the driver; queued events still drain to the handlers.
    ///
    /// Idempotent. The driver releases its transport resources within one
    /// in-flight timeout.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.driver.stop().await;
        self.driver_task.abort();
    }
}

/// Wakes a polling driver out of its interval sleep after a local write.
///
/// A poke is never lost: one issued while the driver is mid-cycle starts
/// another cycle as soon as the current one finishes.
#[derive(Debug, Clone, Default)]
pub struct PollSignal {
    notify: Arc<Notify>,
}

impl PollSignal {
    /// Create an unsignaled poll signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an immediate poll cycle.
    pub fn poke(&self) {
        self.notify.notify_one();
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// A device a [`PollingDriver`] can periodically refresh and diff.
#[async_trait]
pub trait Pollable: Send + Sync + Debug {
    /// The sid stamped on emitted reports.
    fn sid(&self) -> &Sid;

    /// The registry whose snapshot is diffed between cycles.
    fn status(&self) -> &DeviceStatus;

    /// Fetch fresh values from the vendor into the registry.
    async fn refresh(&self) -> Result<()>;
}

/// Snapshot-diff watcher driver for devices without a push channel.
///
/// Each cycle refreshes the target, re-snapshots its registry and emits a
/// report only when the snapshot changed. A cycle starts when the poll
/// interval elapses or the [`PollSignal`] is poked, so a local write never
/// waits out a full interval before it shows up in a report. A timeout or
/// offline error during refresh skips the cycle instead of ending the
/// loop.
#[derive(Debug)]
pub struct PollingDriver<P> {
    target: Arc<P>,
    interval: Duration,
    signal: PollSignal,
    stopped: AtomicBool,
    stop_notify: Notify,
}

impl<P: Pollable> PollingDriver<P> {
    /// Create a driver polling `target` every `interval`.
    pub fn new(target: Arc<P>, interval: Duration) -> Self {
        Self::with_signal(target, interval, PollSignal::new())
    }

    /// Create a driver woken by an externally owned signal.
    pub fn with_signal(target: Arc<P>, interval: Duration, signal: PollSignal) -> Self {
        Self {
            target,
            interval,
            signal,
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
        }
    }

    /// The signal a device pokes after a local write.
    pub fn signal(&self) -> PollSignal {
        self.signal.clone()
    }
}

#[async_trait]
impl<P: Pollable + 'static> WatcherDriver for PollingDriver<P> {
    async fn watch(&self, tx: mpsc::Sender<Report>) -> Result<()> {
        let mut previous = self.target.status().snapshot();
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.signal.wait() => {}
                _ = self.stop_notify.notified() => break,
            }
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            match self.target.refresh().await {
                Ok(()) => {}
                Err(DeviceError::Timeout(e)) | Err(DeviceError::Offline(e)) => {
                    debug!(sid = %self.target.sid(), "poll refresh failed: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            }
            let current = self.target.status().snapshot();
            if current != previous {
                let data: ValueMap = current
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let mut report = Report::new(self.target.sid().clone(), data);
                let model = self.target.status().get_str("model");
                if !model.is_empty() {
                    report = report.with_model(model);
                }
                if tx.send(report).await.is_err() {
                    break;
                }
                previous = current;
            }
        }
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_one();
    }
}
