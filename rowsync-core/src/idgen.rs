use std::cell::RefCell;
use std::sync::{Arc, Mutex, PoisonError};

use crate::errors::SyncError;
use crate::models::{RowId, ID_EPOCH_MS, MAX_NODE_ID, MAX_SEQUENCE};
use crate::SyncResult;

/// Mints [`RowId`]s for one node.
///
/// Safe to share across threads; the `(last_ms, sequence)` pair is the
/// only shared state. When the 12-bit sequence overflows within one
/// millisecond the caller spins until the clock advances, and a clock
/// that runs backwards is clamped to the last-used millisecond so ids
/// never regress.
#[derive(Debug)]
pub struct IdAllocator {
    node_id: u16,
    state: Mutex<AllocatorState>,
}

#[derive(Debug, Default)]
struct AllocatorState {
    last_ms: u64,
    sequence: u16,
}

impl IdAllocator {
    pub fn new(node_id: u16) -> SyncResult<Self> {
        if node_id > MAX_NODE_ID {
            return Err(SyncError::BadNodeId(node_id));
        }
        Ok(Self {
            node_id,
            state: Mutex::new(AllocatorState::default()),
        })
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    pub fn next_id(&self) -> RowId {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut now = clock_ms();
        if now < state.last_ms {
            now = state.last_ms;
        }

        if now == state.last_ms {
            if state.sequence == MAX_SEQUENCE {
                now = spin_past(state.last_ms);
                state.sequence = 0;
            } else {
                state.sequence += 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        RowId::from_parts(now, self.node_id, state.sequence)
    }
}

fn clock_ms() -> u64 {
    (chrono::Utc::now().timestamp_millis() as u64).saturating_sub(ID_EPOCH_MS)
}

fn spin_past(last_ms: u64) -> u64 {
    loop {
        let now = clock_ms();
        if now > last_ms {
            return now;
        }
        std::hint::spin_loop();
    }
}

thread_local! {
    static CURRENT_ALLOCATOR: RefCell<Vec<Arc<IdAllocator>>> = RefCell::new(Vec::new());
}

/// Scoped binding of the current allocator for this thread.
///
/// Bindings nest; dropping the guard restores whatever was bound before,
/// on every exit path. Multi-tenant hosts rebind per request.
pub fn bind_allocator(allocator: Arc<IdAllocator>) -> AllocatorGuard {
    CURRENT_ALLOCATOR.with(|stack| stack.borrow_mut().push(allocator));
    AllocatorGuard { _priv: () }
}

/// The allocator bound to this thread, innermost binding first.
pub fn current_allocator() -> SyncResult<Arc<IdAllocator>> {
    CURRENT_ALLOCATOR
        .with(|stack| stack.borrow().last().cloned())
        .ok_or(SyncError::NoAllocatorBound)
}

#[must_use = "the allocator stays bound only while this guard is alive"]
pub struct AllocatorGuard {
    _priv: (),
}

impl Drop for AllocatorGuard {
    fn drop(&mut self) {
        CURRENT_ALLOCATOR.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}
