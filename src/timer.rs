//! One-shot timers for the reactor thread.
//!
//! The wheel is thread-local: sessions arm and re-arm their idle timeout
//! through a [`TimeoutContainer`] without threading a handle through every
//! call, and the event loop asks the same wheel for its poll timeout and
//! for the tokens whose deadline passed. Cancellation is cheap: the heap
//! keeps stale entries and skips them on expiry using a generation counter.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use mio::Token;
use slab::Slab;

thread_local! {
    static TIMER: RefCell<Timer> = RefCell::new(Timer::new());
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerHandle {
    key: usize,
    generation: u64,
}

struct Entry {
    deadline: Instant,
    token: Token,
    generation: u64,
}

struct Timer {
    entries: Slab<Entry>,
    heap: BinaryHeap<Reverse<(Instant, usize, u64)>>,
    generation: u64,
}

impl Timer {
    fn new() -> Timer {
        Timer {
            entries: Slab::new(),
            heap: BinaryHeap::new(),
            generation: 0,
        }
    }

    fn set(&mut self, duration: Duration, token: Token) -> TimerHandle {
        self.generation += 1;
        let generation = self.generation;
        let deadline = Instant::now() + duration;
        let key = self.entries.insert(Entry {
            deadline,
            token,
            generation,
        });
        self.heap.push(Reverse((deadline, key, generation)));
        TimerHandle { key, generation }
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if let Some(entry) = self.entries.get(handle.key) {
            if entry.generation == handle.generation {
                self.entries.remove(handle.key);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        // stale heap entries only make the loop wake early, never late
        self.heap.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    fn expired(&mut self, now: Instant) -> Vec<Token> {
        let mut fired = Vec::new();
        while let Some(Reverse((deadline, key, generation))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            let live = self
                .entries
                .get(key)
                .map(|entry| entry.generation == generation)
                .unwrap_or(false);
            if live {
                fired.push(self.entries.remove(key).token);
            }
        }
        fired
    }
}

pub fn set_timeout(duration: Duration, token: Token) -> TimerHandle {
    TIMER.with(|timer| timer.borrow_mut().set(duration, token))
}

pub fn cancel_timeout(handle: TimerHandle) {
    TIMER.with(|timer| timer.borrow_mut().cancel(handle));
}

/// Duration until the next live deadline, for the poll call.
pub fn poll_timeout() -> Option<Duration> {
    TIMER.with(|timer| {
        timer
            .borrow()
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    })
}

/// Pop every deadline at or before `now` and return the owning tokens.
pub fn expired_tokens(now: Instant) -> Vec<Token> {
    TIMER.with(|timer| timer.borrow_mut().expired(now))
}

/// A session's hold on one timer slot, re-armed on activity.
///
/// Dropping the container cancels the pending timeout.
#[derive(Debug)]
pub struct TimeoutContainer {
    duration: Duration,
    timeout: Option<TimerHandle>,
    token: Token,
}

impl TimeoutContainer {
    /// Arm a fresh timeout for `token`.
    pub fn new(duration: Duration, token: Token) -> TimeoutContainer {
        let timeout = Some(set_timeout(duration, token));
        TimeoutContainer {
            duration,
            timeout,
            token,
        }
    }

    pub fn set_duration(&mut self, duration: Duration) {
        self.cancel();
        self.duration = duration;
        self.timeout = Some(set_timeout(duration, self.token));
    }

    /// Restart the countdown from now.
    pub fn reset(&mut self) {
        self.cancel();
        self.timeout = Some(set_timeout(self.duration, self.token));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.timeout.take() {
            cancel_timeout(handle);
        }
    }

    /// The wheel already popped the entry, forget the handle.
    pub fn triggered(&mut self) {
        self.timeout = None;
    }
}

impl Drop for TimeoutContainer {
    fn drop(&mut self) {
        self.cancel();
    }
}
