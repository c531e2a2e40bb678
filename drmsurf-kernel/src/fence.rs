// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Batch completion timeline.
//!
//! Every submitted batch gets the next sequence number. The GPU (or the soft
//! model of it) signals the timeline as batches retire, and the CPU can block
//! until a given sequence number has completed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub type Seqno = u32;

/// Monotonic submitted/completed counters with blocking waits.
pub struct FenceTimeline {
    submitted: AtomicU32,
    completed: AtomicU32,
    lock: Mutex<()>,
    cond: Condvar,
}

impl FenceTimeline {
    pub fn new() -> Self {
        Self {
            submitted: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Allocate the sequence number of a new submission.
    pub fn next(&self) -> Seqno {
        self.submitted.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    pub fn submitted(&self) -> Seqno {
        self.submitted.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> Seqno {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_complete(&self, seqno: Seqno) -> bool {
        fence_reached(self.completed(), seqno)
    }

    /// Mark everything up to and including `seqno` complete and wake waiters.
    /// Never moves the timeline backwards.
    pub fn signal(&self, seqno: Seqno) {
        let _guard = self.lock.lock();
        let current = self.completed.load(Ordering::Acquire);
        if fence_reached(current, seqno) {
            return;
        }
        self.completed.store(seqno, Ordering::Release);
        log::trace!("fence: completed {}", seqno);
        self.cond.notify_all();
    }

    /// Complete everything submitted so far.
    pub fn signal_all(&self) {
        self.signal(self.submitted());
    }

    /// Block until `seqno` completes or `timeout` expires.
    /// Returns `true` if it completed. `None` waits forever.
    pub fn wait(&self, seqno: Seqno, timeout: Option<Duration>) -> bool {
        if self.is_complete(seqno) {
            return true;
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.lock.lock();
        while !self.is_complete(seqno) {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut guard, deadline).timed_out() {
                        return self.is_complete(seqno);
                    }
                }
                None => self.cond.wait(&mut guard),
            }
        }
        true
    }
}

impl Default for FenceTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `value` has reached `threshold`, tolerating wrap-around.
#[inline]
pub fn fence_reached(value: Seqno, threshold: Seqno) -> bool {
    (value.wrapping_sub(threshold) as i32) >= 0
}
