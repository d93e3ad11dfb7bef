//! A minimal cooperative task runner for session schedulers.
//!
//! One worker thread owns every [`DeliveryScheduler`] handed to it and runs
//! each one when its timer expires or its session has a pending event. It
//! never blocks on a session: schedulers return instead of waiting, so many
//! sessions share the thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::error::{DeliveryError, Result};
use crate::scheduler::{DeliveryScheduler, Schedule};

/// Longest the worker sleeps between polls.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5;

struct Task {
    scheduler: DeliveryScheduler,
    /// `None` waits for an event only.
    wake_at: Option<i64>,
}

/// Scheduler set driven by one thread.
#[derive(Default)]
pub struct Worker {
    tasks: Vec<Task>,
}

impl Worker {
    pub fn new() -> Self {
        Self::default()
    }

    /// New schedulers run on the next poll.
    pub fn add(&mut self, scheduler: DeliveryScheduler, now: i64) {
        self.tasks.push(Task {
            scheduler,
            wake_at: Some(now),
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every due scheduler once and drop the disposed ones. Returns the
    /// earliest timer still armed.
    pub fn poll(&mut self, now: i64) -> Option<i64> {
        self.tasks.retain_mut(|task| {
            let due = task.wake_at.is_some_and(|at| at <= now)
                || task.scheduler.session().has_pending_events();
            if !due {
                return true;
            }
            match task.scheduler.run() {
                Schedule::Idle => {
                    task.wake_at = None;
                    true
                }
                Schedule::After(ms) => {
                    task.wake_at = Some(now + ms);
                    true
                }
                Schedule::Dispose => {
                    tracing::debug!(session_id = %task.scheduler.session().id(), "session disposed");
                    false
                }
            }
        });
        self.tasks.iter().filter_map(|t| t.wake_at).min()
    }
}

/// Background thread running a [`Worker`].
pub struct TaskRunner {
    clock: Arc<dyn Clock>,
    incoming: Arc<Mutex<Vec<DeliveryScheduler>>>,
    running: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    poll_interval_ms: u64,
    handle: Option<JoinHandle<()>>,
}

impl TaskRunner {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_poll_interval(clock, DEFAULT_POLL_INTERVAL_MS)
    }

    pub fn with_poll_interval(clock: Arc<dyn Clock>, poll_interval_ms: u64) -> Self {
        Self {
            clock,
            incoming: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
            poll_interval_ms: poll_interval_ms.max(1),
            handle: None,
        }
    }

    /// Hand a scheduler to the worker.
    pub fn spawn(&self, scheduler: DeliveryScheduler) {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.incoming.lock().push(scheduler);
    }

    /// Schedulers not yet disposed.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(DeliveryError::InvalidArgument("task runner already running"));
        }
        let clock = self.clock.clone();
        let incoming = self.incoming.clone();
        let running = self.running.clone();
        let active = self.active.clone();
        let poll_interval = self.poll_interval_ms as i64;

        tracing::info!(poll_interval_ms = poll_interval, "task runner started");
        self.handle = Some(thread::spawn(move || {
            let mut worker = Worker::new();
            while running.load(Ordering::SeqCst) {
                let now = clock.now_ms();
                for scheduler in incoming.lock().drain(..) {
                    worker.add(scheduler, now);
                }
                let before = worker.len();
                let next = worker.poll(now);
                active.fetch_sub(before - worker.len(), Ordering::SeqCst);

                let sleep = next
                    .map_or(poll_interval, |at| (at - clock.now_ms()).clamp(0, poll_interval));
                if sleep > 0 {
                    thread::sleep(Duration::from_millis(sleep as u64));
                }
            }
        }));
        Ok(())
    }

    /// Stop the worker and wait for it to exit. Undisposed schedulers are dropped.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("task runner thread panicked");
            }
        }
        self.incoming.lock().clear();
        let abandoned = self.active.swap(0, Ordering::SeqCst);
        tracing::info!(abandoned, "task runner stopped");
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}
