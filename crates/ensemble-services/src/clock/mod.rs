//! Distributed clock synchronization.
//!
//! Every node broadcasts a [`SyncProbe`] once per probe interval and answers
//! every other node's probe with a [`SyncEcho`]. Echoes addressed to this
//! node become [`SyncSample`]s for the [`OffsetEstimator`]. Scheduled
//! actions run on the [`Scheduler`] task against corrected time.
//!
//! Synchronization is advisory: losing all probe traffic lowers stability
//! but never produces an error.

pub mod estimator;
pub mod scheduler;

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use ensemble_core::config::ClockConfig;
use ensemble_core::message::Message;
use ensemble_core::wire::{Datagram, SyncEcho, SyncProbe};

use crate::broadcast::{BroadcastChannel, BroadcastError, DatagramSink, Inbound};
use crate::events::ListenerId;

pub use estimator::{OffsetEstimator, SampleOutcome, SyncSample, SyncState};
pub use scheduler::{Action, ScheduleHandle, Scheduler};

struct ClockInner {
    node_id: u64,
    /// Local monotonic time is `base_ms + epoch.elapsed()`.
    epoch: Instant,
    base_ms: i64,
    #[cfg(test)]
    skew_ms: i64,
    estimator: Mutex<OffsetEstimator>,
    scheduler: Scheduler,
    sink: Arc<dyn DatagramSink>,
    probe_interval: Duration,
    subscription: Mutex<Option<(Arc<BroadcastChannel>, ListenerId)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: broadcast::Sender<()>,
}

/// Cheap to clone; all clones share one clock.
#[derive(Clone)]
pub struct ClockSynchronizer {
    inner: Arc<ClockInner>,
}

impl std::fmt::Debug for ClockSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockSynchronizer")
            .field("node_id", &format_args!("{:016x}", self.inner.node_id))
            .field("state", &self.state())
            .field("stability", &self.stability())
            .finish()
    }
}

impl ClockSynchronizer {
    /// Build a synchronizer that sends through `sink`. No tasks are started
    /// and nothing is received until [`attach`](Self::attach) or
    /// [`handle_datagram`](Self::handle_datagram) is used.
    pub fn new(config: &ClockConfig, sink: Arc<dyn DatagramSink>) -> Self {
        let base_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let (shutdown, _) = broadcast::channel(1);

        Self {
            inner: Arc::new(ClockInner {
                node_id: rand::random(),
                epoch: Instant::now(),
                base_ms,
                #[cfg(test)]
                skew_ms: 0,
                estimator: Mutex::new(OffsetEstimator::new(config.clone())),
                scheduler: Scheduler::new(),
                sink,
                probe_interval: Duration::from_millis(config.probe_interval_ms),
                subscription: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                shutdown,
            }),
        }
    }

    /// Build, subscribe to `channel`, and start the probe and scheduler
    /// tasks. Must be called from within a tokio runtime.
    pub fn start(config: &ClockConfig, channel: Arc<BroadcastChannel>) -> Self {
        let clock = Self::new(config, channel.clone());
        clock.attach(channel);
        clock.spawn_tasks();
        tracing::info!(
            node_id = format_args!("{:016x}", clock.node_id()),
            interval_ms = config.probe_interval_ms,
            "clock synchronizer started"
        );
        clock
    }

    /// Receive probes and echoes from `channel`. Replaces any earlier
    /// attachment.
    pub fn attach(&self, channel: Arc<BroadcastChannel>) {
        let weak = Arc::downgrade(&self.inner);
        let id = channel.subscribe(move |inbound: &Inbound| {
            if let Some(inner) = weak.upgrade() {
                ClockSynchronizer { inner }.handle_datagram(&inbound.datagram);
            }
        });

        let previous = self.inner.subscription.lock().replace((channel, id));
        if let Some((old, old_id)) = previous {
            old.unsubscribe(old_id);
        }
    }

    /// Start the periodic probe task and the scheduler task.
    pub fn spawn_tasks(&self) {
        let probe_task = {
            let clock = self.clone();
            let mut shutdown = self.inner.shutdown.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(clock.inner.probe_interval);
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => return,
                        _ = interval.tick() => {
                            clock.probe();
                            clock.tick();
                        }
                    }
                }
            })
        };

        let scheduler_task = {
            let clock = self.clone();
            tokio::spawn(
                self.inner
                    .scheduler
                    .clone()
                    .run(move || clock.corrected_time_now(), self.inner.shutdown.subscribe()),
            )
        };

        let mut tasks = self.inner.tasks.lock();
        tasks.push(probe_task);
        tasks.push(scheduler_task);
    }

    /// Random per-process id carried in probes.
    pub fn node_id(&self) -> u64 {
        self.inner.node_id
    }

    /// Local monotonic milliseconds, anchored to wall time at startup.
    pub fn local_time_now(&self) -> i64 {
        let t = self.inner.base_ms + self.inner.epoch.elapsed().as_millis() as i64;
        #[cfg(test)]
        let t = t + self.inner.skew_ms;
        t
    }

    /// Local time adjusted by the current offset. Always available; equal to
    /// local time before any sample arrives.
    pub fn corrected_time_now(&self) -> i64 {
        let offset = self.inner.estimator.lock().offset();
        self.local_time_now() + offset.round() as i64
    }

    /// Like [`corrected_time_now`](Self::corrected_time_now) but using the
    /// offset from the last moment stability was usable. Check
    /// [`stability`](Self::stability) before relying on it.
    pub fn stable_time_now(&self) -> i64 {
        let offset = self.inner.estimator.lock().usable_offset();
        self.local_time_now() + offset.round() as i64
    }

    pub fn stability(&self) -> f64 {
        self.inner.estimator.lock().stability()
    }

    pub fn state(&self) -> SyncState {
        self.inner.estimator.lock().state()
    }

    pub fn offset_ms(&self) -> f64 {
        self.inner.estimator.lock().offset()
    }

    /// Run `action` when corrected time reaches `target_ms`. A target in the
    /// past runs the action immediately, before this returns.
    pub fn do_at_time<F>(&self, target_ms: i64, action: F) -> ScheduleHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .scheduler
            .schedule(self.corrected_time_now(), target_ms, Box::new(action))
    }

    /// Actions waiting in the scheduler.
    pub fn pending_actions(&self) -> usize {
        self.inner.scheduler.pending()
    }

    /// Send a diagnostic message on the sync group.
    pub fn broadcast(&self, message: Message) -> Result<(), BroadcastError> {
        self.inner.sink.send_datagram(&Datagram::Message(message))
    }

    /// Send one probe stamped with the current corrected time.
    pub fn probe(&self) {
        let probe = SyncProbe::new(self.inner.node_id, self.corrected_time_now());
        if let Err(e) = self.inner.sink.send_datagram(&Datagram::Probe(probe)) {
            tracing::debug!(error = %e, "probe send failed");
        }
    }

    /// Periodic estimator housekeeping.
    pub fn tick(&self) {
        let now = self.local_time_now();
        self.inner.estimator.lock().on_tick(now);
    }

    /// Answer probes from other nodes and feed echoes addressed to us into
    /// the estimator. Everything else is ignored.
    pub fn handle_datagram(&self, datagram: &Datagram) {
        match datagram {
            Datagram::Probe(probe) => {
                let origin = probe.origin;
                if origin == self.inner.node_id {
                    return;
                }
                let t2 = self.corrected_time_now();
                let echo = SyncEcho::answer(probe, self.inner.node_id, t2, self.corrected_time_now());
                if let Err(e) = self.inner.sink.send_datagram(&Datagram::Echo(echo)) {
                    tracing::debug!(error = %e, "echo send failed");
                }
            }
            Datagram::Echo(echo) => {
                let (origin, responder) = (echo.origin, echo.responder);
                if origin != self.inner.node_id || responder == self.inner.node_id {
                    return;
                }
                let t4 = self.corrected_time_now();
                let sample = SyncSample {
                    t1: echo.t1,
                    t2: echo.t2,
                    t3: echo.t3,
                    t4,
                };
                let now = self.local_time_now();
                let outcome = self.inner.estimator.lock().on_sample(sample, now);
                match outcome {
                    SampleOutcome::Accepted { residual, rtt } => tracing::trace!(
                        responder = format_args!("{:016x}", responder),
                        residual,
                        rtt,
                        "sync sample accepted"
                    ),
                    rejected => tracing::debug!(
                        responder = format_args!("{:016x}", responder),
                        ?rejected,
                        "sync sample rejected"
                    ),
                }
            }
            Datagram::Message(_) => {}
        }
    }

    /// Stop the probe and scheduler tasks and detach from the channel.
    /// Pending actions are dropped without running.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(());
        if let Some((channel, id)) = self.inner.subscription.lock().take() {
            channel.unsubscribe(id);
        }
        for handle in self.inner.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn with_skew(config: &ClockConfig, sink: Arc<dyn DatagramSink>, skew_ms: i64) -> Self {
        let clock = Self::new(config, sink);
        let mut inner = Arc::try_unwrap(clock.inner).unwrap_or_else(|_| unreachable!());
        inner.skew_ms = skew_ms;
        Self {
            inner: Arc::new(inner),
        }
    }
}

/// Sink that drops everything. For clocks that only schedule.
pub struct NullSink;

impl DatagramSink for NullSink {
    fn send_datagram(&self, _: &Datagram) -> Result<(), BroadcastError> {
        Ok(())
    }
}
