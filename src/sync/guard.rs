use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Caller-side "sync in progress" flag. Workflows never lock the stores
/// themselves, so whoever triggers them holds one of these.
#[derive(Clone, Default)]
pub struct SyncGuard {
    active: Arc<AtomicBool>,
}

/// Held while a workflow runs; releases the guard on drop, including when
/// the workflow future is abandoned mid-flight.
pub struct SyncTicket {
    active: Arc<AtomicBool>,
}

impl SyncGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(&self) -> Option<SyncTicket> {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SyncTicket {
                active: self.active.clone(),
            })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for SyncTicket {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}
