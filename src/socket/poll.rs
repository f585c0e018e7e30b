use std::{
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

use bitflags::bitflags;

bitflags! {
    /// Level-triggered readiness of a [`Socket`](super::Socket): readable
    /// while the RX ring is non-empty, writable while the TX ring has
    /// free space.
    pub struct Readiness: u32 {
        const READABLE = 0x1;
        const WRITABLE = 0x4;
    }
}

/// Wakes poll waiters when ingress publishes descriptors or egress frees
/// TX space. A generation counter ties the wait to the readiness check so
/// a wake between the two is never lost.
pub(super) struct Waiter {
    gen: Mutex<u64>,
    cond: Condvar,
}

impl Waiter {
    pub(super) fn new() -> Self {
        Self {
            gen: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub(super) fn notify(&self) {
        let mut gen = self.gen.lock().unwrap();
        *gen = gen.wrapping_add(1);
        self.cond.notify_all();
    }

    pub(super) fn generation(&self) -> u64 {
        *self.gen.lock().unwrap()
    }

    /// Block until the generation moves past `snapshot` or `deadline`
    /// passes. Returns `true` on timeout.
    pub(super) fn wait_change(&self, snapshot: u64, deadline: Option<Instant>) -> bool {
        let mut gen = self.gen.lock().unwrap();

        while *gen == snapshot {
            match deadline {
                None => gen = self.cond.wait(gen).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();

                    if now >= deadline {
                        return true;
                    }

                    let (guard, result) = self
                        .cond
                        .wait_timeout(gen, deadline.duration_since(now))
                        .unwrap();

                    gen = guard;

                    if result.timed_out() && *gen == snapshot {
                        return true;
                    }
                }
            }
        }

        false
    }
}

/// Turn a poll timeout in milliseconds into a deadline. Negative values
/// mean wait indefinitely.
pub(super) fn deadline_from_ms(timeout_ms: i32) -> Option<Instant> {
    if timeout_ms < 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
    }
}
