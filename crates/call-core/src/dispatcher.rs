//! Ordered fan-out of events to observers
//!
//! The dispatcher keeps a copy-on-write list of weakly-held observers.
//! Dispatching takes a snapshot of the list and then delivers outside the
//! lock, so observers may register or unregister (themselves or others) from
//! inside a callback; the change only affects later dispatches.
//!
//! Delivery is sequential and in registration order. A failing or panicking
//! observer is logged and reported in the [`DispatchReport`]; the remaining
//! observers still receive the event.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::CallCoreError;
use crate::events::Observe;

/// Handle returned by [`EventDispatcher::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObserverId(pub u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

/// What happened during one dispatch pass
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// Observers that handled the event successfully
    pub delivered: usize,
    /// One `ObserverFailure` per observer that returned an error or panicked
    pub failures: Vec<CallCoreError>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

struct Entry<O: ?Sized> {
    id: ObserverId,
    observer: Weak<O>,
}

impl<O: ?Sized> Clone for Entry<O> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            observer: self.observer.clone(),
        }
    }
}

/// Delivers events to registered observers of type `O`
pub struct EventDispatcher<O: ?Sized> {
    name: &'static str,
    entries: RwLock<Arc<Vec<Entry<O>>>>,
    next_id: AtomicU64,
}

impl<O: ?Sized> fmt::Debug for EventDispatcher<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("name", &self.name)
            .field("observers", &self.entries.read().len())
            .finish()
    }
}

impl<O: ?Sized + Send + Sync> EventDispatcher<O> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an observer. Only a weak reference is kept: the observer
    /// stops receiving events once every strong reference is dropped.
    pub fn register(&self, observer: &Arc<O>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entries = self.entries.write();
        let mut next = Vec::with_capacity(entries.len() + 1);
        next.extend(entries.iter().cloned());
        next.push(Entry {
            id,
            observer: Arc::downgrade(observer),
        });
        *entries = Arc::new(next);
        trace!(dispatcher = self.name, observer = %id, "Observer registered");
        id
    }

    /// Remove an observer. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut entries = self.entries.write();
        if !entries.iter().any(|e| e.id == id) {
            return false;
        }
        let next: Vec<_> = entries.iter().filter(|e| e.id != id).cloned().collect();
        *entries = Arc::new(next);
        trace!(dispatcher = self.name, observer = %id, "Observer unregistered");
        true
    }

    /// Number of registered observers that are still alive
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|e| e.observer.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every registered observer, in registration order
    pub async fn dispatch<E>(&self, event: &E) -> DispatchReport
    where
        E: Send + Sync,
        O: Observe<E>,
    {
        let snapshot = Arc::clone(&*self.entries.read());
        let mut report = DispatchReport::default();
        let mut saw_dead = false;

        for entry in snapshot.iter() {
            let Some(observer) = entry.observer.upgrade() else {
                saw_dead = true;
                continue;
            };

            let outcome = AssertUnwindSafe(observer.observe(event)).catch_unwind().await;
            let reason = match outcome {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    continue;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic) => panic_message(panic.as_ref()),
            };

            warn!(
                dispatcher = self.name,
                observer = %entry.id,
                error = %reason,
                "Observer failed to handle event"
            );
            report.failures.push(CallCoreError::ObserverFailure {
                observer: entry.id.0,
                reason,
            });
        }

        if saw_dead {
            self.prune();
        }
        report
    }

    fn prune(&self) {
        let mut entries = self.entries.write();
        if entries.iter().all(|e| e.observer.strong_count() > 0) {
            return;
        }
        let next: Vec<_> = entries
            .iter()
            .filter(|e| e.observer.strong_count() > 0)
            .cloned()
            .collect();
        trace!(dispatcher = self.name, removed = entries.len() - next.len(), "Pruned dropped observers");
        *entries = Arc::new(next);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
