use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::Session;
use crate::clock::Clock;
use crate::config::DeliveryPrefs;
use crate::error::{DeliveryError, Result};
use crate::stats::DeliveryCounters;

/// Server-side RTP/RTCP port pair. RTP is even, RTCP = RTP + 1 (RFC 3550 §11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortPair {
    pub rtp: u16,
    pub rtcp: u16,
}

struct Entry {
    session: Arc<Session>,
    leases: Arc<AtomicUsize>,
}

/// A session borrowed from the registry.
///
/// While any lease is alive the session cannot be unregistered, so the
/// holder may keep using it without racing the scheduler's teardown.
pub struct SessionLease {
    session: Arc<Session>,
    leases: Arc<AtomicUsize>,
}

impl Deref for SessionLease {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.leases.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Thread-safe id → session map plus server port allocation.
///
/// Cloning is cheap; clones share the same tables.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Entry>>>,
    ports_in_use: Arc<Mutex<BTreeSet<u16>>>,
    prefs: Arc<DeliveryPrefs>,
    clock: Arc<dyn Clock>,
    counters: Arc<dyn DeliveryCounters>,
}

impl SessionRegistry {
    pub fn new(
        prefs: Arc<DeliveryPrefs>,
        clock: Arc<dyn Clock>,
        counters: Arc<dyn DeliveryCounters>,
    ) -> Self {
        SessionRegistry {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ports_in_use: Arc::new(Mutex::new(BTreeSet::new())),
            prefs,
            clock,
            counters,
        }
    }

    pub fn prefs(&self) -> &Arc<DeliveryPrefs> {
        &self.prefs
    }

    /// Create a new session and register it.
    pub fn create_session(&self) -> Arc<Session> {
        let session = Arc::new(Session::new(
            self.prefs.clone(),
            self.clock.clone(),
            self.counters.clone(),
        ));
        let id = session.id().to_string();
        let mut sessions = self.sessions.write();
        sessions.insert(
            id.clone(),
            Entry {
                session: session.clone(),
                leases: Arc::new(AtomicUsize::new(0)),
            },
        );
        tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session created");
        session
    }

    /// Borrow a session by id.
    pub fn lease(&self, id: &str) -> Option<SessionLease> {
        let sessions = self.sessions.read();
        let entry = sessions.get(id)?;
        entry.leases.fetch_add(1, Ordering::AcqRel);
        Some(SessionLease {
            session: entry.session.clone(),
            leases: entry.leases.clone(),
        })
    }

    /// Look up a session by id, as an error when absent.
    pub fn require(&self, id: &str) -> Result<SessionLease> {
        self.lease(id)
            .ok_or_else(|| DeliveryError::SessionNotFound(id.to_string()))
    }

    /// Remove a session unless someone still holds a lease on it.
    ///
    /// Returns `false` when leased; the caller retries later instead of
    /// blocking. An id that is not registered counts as removed.
    pub fn try_unregister(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(id) {
            None => true,
            Some(entry) if entry.leases.load(Ordering::Acquire) > 0 => {
                tracing::trace!(session_id = %id, "session leased, unregister deferred");
                false
            }
            Some(_) => {
                sessions.remove(id);
                tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session removed");
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Reserve the lowest free even/odd port pair within the configured range.
    pub fn allocate_server_ports(&self) -> Result<PortPair> {
        let (min, max) = (self.prefs.server_port_min, self.prefs.server_port_max);
        let mut in_use = self.ports_in_use.lock();
        let first = min.saturating_add(min % 2);
        let rtp = (first..max)
            .step_by(2)
            .find(|port| !in_use.contains(port))
            .ok_or(DeliveryError::PortRangeExhausted { min, max })?;
        in_use.insert(rtp);
        tracing::trace!(rtp_port = rtp, rtcp_port = rtp + 1, "allocated server ports");
        Ok(PortPair { rtp, rtcp: rtp + 1 })
    }

    pub fn release_server_ports(&self, ports: PortPair) {
        self.ports_in_use.lock().remove(&ports.rtp);
    }
}
