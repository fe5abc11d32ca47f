//! Synchronization primitives
//!
//! A `Fence` is a binary signal with a monotonically increasing signal count.
//! Resources released against a fence remember the count at release time
//! ([`FenceWatch`]), so they stay reclaimable even if the fence is reset and
//! reused before anyone polled it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::{next_object_id, ObjectId};

/// Result of polling or waiting on fences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Success,
    NotReady,
    Timeout,
}

#[derive(Debug, Default)]
struct FenceState {
    signaled: bool,
    signal_count: u64,
}

/// CPU-visible GPU completion signal
#[derive(Debug)]
pub struct Fence {
    id: ObjectId,
    state: Mutex<FenceState>,
    cond: Condvar,
}

impl Fence {
    pub fn new(signaled: bool) -> Self {
        Self {
            id: next_object_id(),
            state: Mutex::new(FenceState {
                signaled,
                signal_count: u64::from(signaled),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    pub fn status(&self) -> FenceStatus {
        if self.is_signaled() {
            FenceStatus::Success
        } else {
            FenceStatus::NotReady
        }
    }

    /// Number of times this fence has been signaled
    pub fn signal_count(&self) -> u64 {
        self.state.lock().signal_count
    }

    /// Signal the fence and wake every waiter
    pub fn signal(&self) {
        let mut state = self.state.lock();
        if !state.signaled {
            state.signaled = true;
            state.signal_count += 1;
        }
        self.cond.notify_all();
    }

    /// Return the fence to the unsignaled state
    pub fn reset(&self) {
        self.state.lock().signaled = false;
    }

    /// Block until the fence is signaled or `deadline` passes
    pub fn wait_until(&self, deadline: Instant) -> FenceStatus {
        let mut state = self.state.lock();
        while !state.signaled {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return if state.signaled {
                    FenceStatus::Success
                } else {
                    FenceStatus::Timeout
                };
            }
        }
        FenceStatus::Success
    }

    pub fn wait(&self, timeout: Duration) -> FenceStatus {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until(deadline),
            None => {
                let mut state = self.state.lock();
                while !state.signaled {
                    self.cond.wait(&mut state);
                }
                FenceStatus::Success
            }
        }
    }

    /// Block until the signal count exceeds `epoch` or `deadline` passes
    pub fn wait_for_epoch(&self, epoch: u64, deadline: Instant) -> FenceStatus {
        let mut state = self.state.lock();
        while state.signal_count <= epoch {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return if state.signal_count > epoch {
                    FenceStatus::Success
                } else {
                    FenceStatus::Timeout
                };
            }
        }
        FenceStatus::Success
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new(false)
    }
}

/// A fence paired with the signal count observed when a resource was released
#[derive(Debug, Clone)]
pub struct FenceWatch {
    fence: Arc<Fence>,
    epoch: u64,
}

impl FenceWatch {
    /// Watch for the next signal of `fence`
    ///
    /// A fence that is already signaled counts as complete.
    pub fn new(fence: Arc<Fence>) -> Self {
        let state = fence.state.lock();
        let epoch = if state.signaled {
            state.signal_count.saturating_sub(1)
        } else {
            state.signal_count
        };
        drop(state);
        Self { fence, epoch }
    }

    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    pub fn is_complete(&self) -> bool {
        self.fence.signal_count() > self.epoch
    }

    pub fn wait_until(&self, deadline: Instant) -> FenceStatus {
        self.fence.wait_for_epoch(self.epoch, deadline)
    }
}

/// GPU-GPU ordering primitive between queue submissions
#[derive(Debug)]
pub struct Semaphore {
    id: ObjectId,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            id: next_object_id(),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}
