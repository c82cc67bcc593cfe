//! src/pipeline/pool.rs
//!
//! Bounded mailbox of [`BufferTuple`]s connecting pipeline stages.
//!
//! One mutex, two condition variables (`non_empty`, `non_full`), circular
//! read/write cursors, and a closed flag. Capacity is fixed at two slots:
//! one being produced, one being consumed, matching the device's dual-slot
//! transfer scheme.
//!
//! Producers and consumers run their work *inside* the pool lock
//! ([`BufferPool::produce`] / [`BufferPool::consume`] take closures): filling
//! a slot can involve a reader call or a whole decode round, and the slot is
//! committed only when the closure succeeds. The facade's `next()` instead
//! needs to hold a slot across calls, so the consume side is also exposed
//! split: [`BufferPool::wait_non_empty`] leaves the cursor alone and
//! [`BufferPool::release_read`] advances it later.
//!
//! Every wait re-checks the closed flag after waking. [`BufferPool::close`]
//! notifies both condition variables, so no waiter outlives a shutdown.

use crate::buffer::BufferTuple;
use anyhow::Result;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Slots per pool. Fixed: the decode manager's device toggle assumes the
/// consumer can hold one slot while the producer fills the other.
pub(crate) const POOL_SLOTS: usize = 2;

struct PoolState {
    slots: Vec<BufferTuple>,
    read_pos: usize,
    write_pos: usize,
    count: usize,
    closed: bool,
}

pub(crate) struct BufferPool {
    state: Mutex<PoolState>,
    non_empty: Condvar,
    non_full: Condvar,
}

impl BufferPool {
    /// Creates a pool whose slots start with the given buffer capacities.
    /// Slots grow on demand and never shrink.
    pub(crate) fn new(data_len: usize, target_len: usize, meta_len: usize, pinned: bool) -> Self {
        let slots = (0..POOL_SLOTS)
            .map(|_| {
                if pinned {
                    BufferTuple::pinned(data_len, target_len, meta_len)
                } else {
                    BufferTuple::with_capacity(data_len, target_len, meta_len)
                }
            })
            .collect();
        Self {
            state: Mutex::new(PoolState {
                slots,
                read_pos: 0,
                write_pos: 0,
                count: 0,
                closed: false,
            }),
            non_empty: Condvar::new(),
            non_full: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // A poisoned pool mutex means a stage panicked mid-slot; nothing
        // coherent can continue.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Waits for a free slot, fills it under the lock, and commits it.
    ///
    /// Returns `Ok(None)` if the pool closed before a slot was free. If
    /// `fill` fails the cursor is not advanced: the slot is only published
    /// once the work in it is complete.
    pub(crate) fn produce<R>(
        &self,
        fill: impl FnOnce(&mut BufferTuple) -> Result<R>,
    ) -> Result<Option<R>> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Ok(None);
            }
            if state.count < state.slots.len() {
                break;
            }
            state = self.non_full.wait(state).unwrap_or_else(|e| e.into_inner());
        }

        let pos = state.write_pos;
        let value = fill(&mut state.slots[pos])?;
        state.write_pos = (state.write_pos + 1) % state.slots.len();
        state.count += 1;
        drop(state);
        self.non_empty.notify_one();
        Ok(Some(value))
    }

    /// Waits for a filled slot, drains it under the lock, and releases it.
    ///
    /// A closed pool still hands out remaining slots; `Ok(None)` means
    /// closed *and* empty.
    pub(crate) fn consume<R>(
        &self,
        drain: impl FnOnce(&mut BufferTuple) -> Result<R>,
    ) -> Result<Option<R>> {
        let mut state = self.lock();
        loop {
            if state.count > 0 {
                break;
            }
            if state.closed {
                return Ok(None);
            }
            state = self
                .non_empty
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }

        let pos = state.read_pos;
        let value = drain(&mut state.slots[pos])?;
        state.read_pos = (state.read_pos + 1) % state.slots.len();
        state.count -= 1;
        drop(state);
        self.non_full.notify_one();
        Ok(Some(value))
    }

    /// Blocks until a slot is readable and peeks at it without releasing.
    /// The caller owns the slot until [`BufferPool::release_read`]. Returns
    /// `None` once the pool is closed and drained.
    pub(crate) fn wait_non_empty<R>(&self, peek: impl FnOnce(&BufferTuple) -> R) -> Option<R> {
        let mut state = self.lock();
        loop {
            if state.count > 0 {
                break;
            }
            if state.closed {
                return None;
            }
            state = self
                .non_empty
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        Some(peek(&state.slots[state.read_pos]))
    }

    /// Releases the slot acquired by [`BufferPool::wait_non_empty`].
    /// No-op when nothing is held.
    pub(crate) fn release_read(&self) {
        self.try_release_read();
    }

    /// Non-blocking release of one readable slot. Returns whether a slot was
    /// released. Used to drain the pipeline during shutdown.
    pub(crate) fn try_release_read(&self) -> bool {
        let mut state = self.lock();
        if state.count == 0 {
            return false;
        }
        state.read_pos = (state.read_pos + 1) % state.slots.len();
        state.count -= 1;
        drop(state);
        self.non_full.notify_one();
        true
    }

    /// Closes the pool: waiters wake, producers stop, consumers drain what
    /// remains. Idempotent.
    pub(crate) fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
        }
        self.non_empty.notify_all();
        self.non_full.notify_all();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().count == 0
    }
}
