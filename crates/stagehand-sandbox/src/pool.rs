//! Warm pool of idle, ready sandbox workers shared across sessions.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

struct PoolState<T> {
    idle: VecDeque<T>,
    /// Replacements being started that have a slot set aside.
    pending: usize,
}

/// Lock-guarded set of warm items. An item handed out by [`WarmPool::claim`]
/// is removed from the pool, so no two sessions can ever hold the same one.
pub struct WarmPool<T> {
    capacity: usize,
    state: Mutex<PoolState<T>>,
}

impl<T> std::fmt::Debug for WarmPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WarmPool")
            .field("capacity", &self.capacity)
            .field("idle", &state.idle.len())
            .field("pending", &state.pending)
            .finish()
    }
}

impl<T: Send + 'static> WarmPool<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                pending: 0,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn idle(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn claim(&self) -> Option<T> {
        self.state.lock().idle.pop_front()
    }

    /// Return an item to the pool, or hand it back when the pool is full.
    pub fn offer(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.idle.len() + state.pending >= self.capacity {
            return Err(item);
        }
        state.idle.push_back(item);
        Ok(())
    }

    /// Set a slot aside for an item that is still being started.
    pub fn reserve(self: &Arc<Self>) -> Option<PoolReservation<T>> {
        let mut state = self.state.lock();
        if state.idle.len() + state.pending >= self.capacity {
            return None;
        }
        state.pending += 1;
        Some(PoolReservation {
            pool: Arc::clone(self),
            filled: false,
        })
    }

    /// Start items until the pool is full or `count` were attempted.
    /// Returns how many were added.
    pub async fn prewarm<F, Fut, E>(self: &Arc<Self>, count: usize, mut start: F) -> usize
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut added = 0;
        for _ in 0..count {
            let Some(reservation) = self.reserve() else {
                break;
            };
            match start().await {
                Ok(item) => {
                    reservation.fill(item);
                    added += 1;
                }
                Err(error) => warn!(error = %error, "failed to prewarm pool item"),
            }
        }
        debug!(added, idle = self.idle(), "pool prewarmed");
        added
    }
}

/// A reserved pool slot. Dropping it unfilled releases the slot.
pub struct PoolReservation<T: Send + 'static> {
    pool: Arc<WarmPool<T>>,
    filled: bool,
}

impl<T: Send + 'static> PoolReservation<T> {
    pub fn fill(mut self, item: T) {
        let mut state = self.pool.state.lock();
        state.pending -= 1;
        state.idle.push_back(item);
        self.filled = true;
    }
}

impl<T: Send + 'static> Drop for PoolReservation<T> {
    fn drop(&mut self) {
        if !self.filled {
            self.pool.state.lock().pending -= 1;
        }
    }
}
