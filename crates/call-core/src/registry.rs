//! Session registry
//!
//! Maps call ids to live [`CallSession`]s. The map itself is a sharded
//! concurrent map. Each session has two locks: an async order lock that a
//! transition holds until its events are delivered, so transitions on one
//! call are serialized and observed in order, and a short synchronous lock
//! around the state itself, so reads never wait on an in-flight dispatch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex as StateLock;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::call::{CallFailure, CallId, CallOperation, CallSession, CallState, Transition};
use crate::error::{CallCoreError, CallCoreResult};

/// Shared access to one call session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    call_id: CallId,
    order: Arc<Mutex<()>>,
    state: Arc<StateLock<CallSession>>,
}

impl SessionHandle {
    fn new(call_id: CallId) -> Self {
        Self {
            order: Arc::new(Mutex::new(())),
            state: Arc::new(StateLock::new(CallSession::new(call_id.clone()))),
            call_id,
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Serialize transitions on this call. Hold the guard until the
    /// transition's events have been delivered.
    pub async fn order(&self) -> MutexGuard<'_, ()> {
        self.order.lock().await
    }

    /// Apply one operation. Callers hold [`order`](Self::order).
    pub fn apply(&self, op: CallOperation) -> Transition {
        self.state.lock().apply(op)
    }

    /// Force the call to `Released`. Callers hold [`order`](Self::order).
    pub fn force_release(&self, failure: Option<CallFailure>) -> Transition {
        self.state.lock().force_release(failure)
    }

    pub fn snapshot(&self) -> CallSession {
        self.state.lock().clone()
    }

    pub fn state(&self) -> CallState {
        self.state.lock().state()
    }
}

#[derive(Debug, Default)]
struct RegistryStats {
    created: AtomicU64,
    removed: AtomicU64,
}

/// Counters since the registry was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStatsSnapshot {
    pub live: usize,
    pub total_created: u64,
    pub total_removed: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<CallId, SessionHandle>>,
    stats: Arc<RegistryStats>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new session in `Idle`. Fails if the id is already live.
    pub fn create(&self, call_id: CallId) -> CallCoreResult<SessionHandle> {
        match self.sessions.entry(call_id.clone()) {
            Entry::Occupied(_) => Err(CallCoreError::duplicate_session(call_id)),
            Entry::Vacant(slot) => {
                let handle = SessionHandle::new(call_id.clone());
                slot.insert(handle.clone());
                self.stats.created.fetch_add(1, Ordering::Relaxed);
                debug!(call_id = %call_id, "Session created");
                Ok(handle)
            }
        }
    }

    pub fn get(&self, call_id: &CallId) -> CallCoreResult<SessionHandle> {
        self.sessions
            .get(call_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CallCoreError::not_found(call_id.clone()))
    }

    /// Remove a session. Removing an id that is not present is a no-op.
    pub fn remove(&self, call_id: &CallId) -> bool {
        let removed = self.sessions.remove(call_id).is_some();
        if removed {
            self.stats.removed.fetch_add(1, Ordering::Relaxed);
            debug!(call_id = %call_id, "Session removed");
        }
        removed
    }

    pub fn contains(&self, call_id: &CallId) -> bool {
        self.sessions.contains_key(call_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether any session other than `call_id` is present
    pub fn has_other_than(&self, call_id: &CallId) -> bool {
        self.sessions.iter().any(|entry| entry.key() != call_id)
    }

    pub fn call_ids(&self) -> Vec<CallId> {
        let mut ids: Vec<_> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Copies of every live session, sorted by call id
    pub fn snapshots(&self) -> Vec<CallSession> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|e| e.value().snapshot()).collect();
        sessions.sort_by(|a, b| a.call_id.cmp(&b.call_id));
        sessions
    }

    pub fn stats(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            live: self.sessions.len(),
            total_created: self.stats.created.load(Ordering::Relaxed),
            total_removed: self.stats.removed.load(Ordering::Relaxed),
        }
    }
}
