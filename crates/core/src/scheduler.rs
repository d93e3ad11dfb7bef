//! Session run loop.
//!
//! The host's task runner calls [`DeliveryScheduler::run`] whenever the
//! session's timer expires or an event was signalled. Each call does a
//! bounded amount of work and says when it wants to run again:
//!
//! ```text
//! Kill / Timeout / Closing ──> unregister ──leased──> After(10), retry
//!                                  │
//!                            SR + BYE per stream ──busy──> After(10), retry
//!                                  │
//!                            cleanup ──continue──> After(idle), call again
//!                                  │ done
//!                            stats, release ports ──busy──> After(10), retry
//!                                  │
//!                               Dispose
//!
//! Each closing step runs once; a retry resumes at the step that was busy.
//!
//! Paused / no producer ──> Idle
//!
//! Playing ──> next send not due: sweep retransmits, After(remaining)
//!         ──> due: producer writes packets, After(next)
//! ```

use std::sync::Arc;

use crate::clock::Clock;
use crate::session::{
    Event, Events, PacketWriter, Pipeline, Session, SessionRegistry, SessionState,
};

/// Back-off while the session is leased or its mutex is held elsewhere.
pub const CANT_GET_MUTEX_IDLE_MS: i64 = 10;

/// Minimum spacing between two bandwidth statistics samples.
const STATS_UPDATE_INTERVAL_MS: i64 = 1000;

/// Emits a session's media, one scheduler tick at a time.
pub trait PacketProducer: Send {
    /// Write whatever packets are due through `writer` and return the delay
    /// (ms) until the next call. Values below zero are treated as zero.
    fn send_packets(&mut self, writer: &mut PacketWriter<'_>) -> i64;
}

/// Why a session is going away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientTeardown,
    Timeout,
    Killed,
}

/// Result of one cleanup step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStatus {
    Done,
    /// Cleanup is still in progress; call again after `idle_ms`.
    Continue { idle_ms: i64 },
}

/// Host hook run once the session is unregistered and before disposal.
pub trait SessionCleanup: Send {
    fn on_session_closing(&mut self, session: &Session, reason: CloseReason) -> CleanupStatus;
}

/// Cleanup that has nothing to do.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCleanup;

impl SessionCleanup for NoCleanup {
    fn on_session_closing(&mut self, _session: &Session, _reason: CloseReason) -> CleanupStatus {
        CleanupStatus::Done
    }
}

/// When the scheduler wants to run next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Only when an event is signalled.
    Idle,
    /// After this many milliseconds (or earlier on a signal).
    After(i64),
    /// The session is finished and may be dropped.
    Dispose,
}

impl Schedule {
    fn from_delay(ms: i64) -> Self {
        if ms <= 0 { Schedule::Idle } else { Schedule::After(ms) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Unregistering(CloseReason),
    SayingGoodbye(CloseReason),
    CleaningUp(CloseReason),
    Releasing,
    Disposed,
}

/// Drives one session from Play to disposal.
pub struct DeliveryScheduler {
    session: Arc<Session>,
    registry: SessionRegistry,
    cleanup: Box<dyn SessionCleanup>,
    phase: Phase,
}

impl DeliveryScheduler {
    pub fn new(
        session: Arc<Session>,
        registry: SessionRegistry,
        cleanup: Box<dyn SessionCleanup>,
    ) -> Self {
        Self {
            session,
            registry,
            cleanup,
            phase: Phase::Running,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn is_disposed(&self) -> bool {
        self.phase == Phase::Disposed
    }

    pub fn run(&mut self) -> Schedule {
        let now = self.session.clock().now_ms();
        let events = self.session.take_events();

        if self.phase == Phase::Running {
            if let Some(reason) = self.close_reason(events, now) {
                tracing::debug!(session_id = %self.session.id(), ?reason, "closing");
                self.session.enter_closing();
                self.phase = Phase::Unregistering(reason);
            }
        }

        match self.phase {
            Phase::Running => self.deliver(now),
            _ => self.wind_down(now),
        }
    }

    fn close_reason(&self, events: Events, now: i64) -> Option<CloseReason> {
        if events.contains(Event::Timeout) || self.session.timed_out(now) {
            Some(CloseReason::Timeout)
        } else if self.session.state() == SessionState::Closing {
            Some(CloseReason::ClientTeardown)
        } else if events.contains(Event::Kill) {
            Some(CloseReason::Killed)
        } else {
            None
        }
    }

    /// Advance the closing steps as far as the session allows.
    fn wind_down(&mut self, now: i64) -> Schedule {
        loop {
            self.phase = match self.phase {
                Phase::Running => return self.deliver(now),
                Phase::Unregistering(reason) => {
                    if !self.registry.try_unregister(self.session.id()) {
                        return Schedule::After(CANT_GET_MUTEX_IDLE_MS);
                    }
                    Phase::SayingGoodbye(reason)
                }
                Phase::SayingGoodbye(reason) => {
                    if self.session.prefs().send_rtcp_reports
                        && !self.session.try_send_goodbyes(now)
                    {
                        return Schedule::After(CANT_GET_MUTEX_IDLE_MS);
                    }
                    Phase::CleaningUp(reason)
                }
                Phase::CleaningUp(reason) => {
                    match self.cleanup.on_session_closing(&self.session, reason) {
                        CleanupStatus::Continue { idle_ms } => {
                            return Schedule::After(idle_ms.max(1));
                        }
                        CleanupStatus::Done => Phase::Releasing,
                    }
                }
                Phase::Releasing => {
                    let Some(ports) = self.session.try_close_out() else {
                        return Schedule::After(CANT_GET_MUTEX_IDLE_MS);
                    };
                    for pair in ports {
                        self.registry.release_server_ports(pair);
                    }
                    Phase::Disposed
                }
                Phase::Disposed => return Schedule::Dispose,
            };
        }
    }

    fn deliver(&mut self, now: i64) -> Schedule {
        if self.session.state() != SessionState::Playing {
            return Schedule::Idle;
        }
        let Some(mut pipeline) = self.session.pipeline().try_lock() else {
            return Schedule::After(CANT_GET_MUTEX_IDLE_MS);
        };
        let Pipeline { streams, shared, producer } = &mut *pipeline;
        let Some(producer) = producer.as_mut() else {
            return Schedule::Idle;
        };

        let mut next = if shared.next_send_time > now {
            for stream in streams.iter_mut() {
                stream.send_retransmits(shared, now);
            }
            shared.next_send_time - now
        } else {
            if now - shared.last_stats_update > STATS_UPDATE_INTERVAL_MS {
                shared.tracker.update_stats();
                shared.last_stats_update = now;
            }
            let env = self.session.write_env(now);
            let mut writer = PacketWriter::new(streams, shared, env);
            let next = producer.send_packets(&mut writer).max(0);
            shared.next_send_time = now + next;
            next
        };

        let prefs = self.session.prefs();
        let max_retransmit_delay = prefs.max_retransmit_delay_ms as i64;
        if next > max_retransmit_delay + prefs.send_interval().0 {
            next = max_retransmit_delay;
        }
        tracing::trace!(session_id = %self.session.id(), next, "tick");
        Schedule::from_delay(next)
    }
}
