// Copyright Timewarp Contributors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::ClockState;

/// Two-slot arena publishing `ClockState` snapshots to concurrent readers.
///
/// The pair is read on every intercepted time call, from arbitrary threads
/// of the host process, so the mechanism is lock-free: there is no semaphore
/// or mutex a reader could ever wait on. Consistency relies on a publication
/// cursor instead.
///
/// The slot at `cursor % 2` holds the current state; the other slot is
/// scratch. A writer composes the next state into the scratch slot and then
/// bumps the cursor, which is the single commit point. Readers load the
/// cursor, copy the slot it selects, and re-load the cursor: a change means
/// a publication landed during the copy and the read must be retried. The
/// cursor only ever grows, so a reader that straddles two publications
/// cycling back into the slot it was copying still observes a different
/// cursor value and retries.
///
/// Writers are serialised by a boolean latch that is never waited on. A
/// writer that finds the latch held abandons its update. This is essential:
/// the shim runs inside threads it does not own and must never deadlock a
/// caller that merely asked the time.
pub struct ClockStatePair {
    /// Publication cursor, bumped once per publish.
    cursor: AtomicU64,

    /// Non-blocking writer latch. Contested acquisitions are dropped.
    latch: AtomicBool,

    /// The two state slots. The slot selected by the cursor is read-only;
    /// the other belongs to the latch holder.
    slots: UnsafeCell<[ClockState; 2]>,
}

// SAFETY: readers only copy the slot the cursor points at and retry when the
// cursor moved during the copy; the scratch slot is written exclusively by
// the single latch holder. All cross-thread hand-off happens through the
// cursor store/load pair.
unsafe impl Sync for ClockStatePair {}

impl ClockStatePair {
    pub fn new(initial: ClockState) -> ClockStatePair {
        ClockStatePair {
            cursor: AtomicU64::new(0),
            latch: AtomicBool::new(false),
            slots: UnsafeCell::new([initial; 2]),
        }
    }

    /// Return a stable copy of the currently published state.
    pub fn current(&self) -> ClockState {
        let slots = self.slots.get().cast::<ClockState>();
        loop {
            let seen = self.cursor.load(Ordering::Acquire);
            // SAFETY: `slots` points at two in-bounds ClockState values. The
            // slot selected here is only rewritten after a further cursor
            // bump, which the re-load below detects.
            let state = unsafe { ptr::read_volatile(slots.add((seen % 2) as usize)) };
            if self.cursor.load(Ordering::Acquire) == seen {
                return state;
            }
        }
    }

    /// Try to become the writer.
    ///
    /// Returns `None` when another writer holds the latch; the caller is
    /// expected to drop its update attempt, not to wait or retry.
    pub fn try_writer(&self) -> Option<WriterGuard<'_>> {
        if self.latch.swap(true, Ordering::Acquire) {
            return None;
        }
        Some(WriterGuard { pair: self })
    }
}

/// Exclusive write capability on a `ClockStatePair`, released on drop.
pub struct WriterGuard<'a> {
    pair: &'a ClockStatePair,
}

impl WriterGuard<'_> {
    /// The currently published state, for composing its successor.
    pub fn current(&self) -> ClockState {
        self.pair.current()
    }

    /// Install `state` as the published state.
    pub fn publish(&self, state: ClockState) {
        let seen = self.pair.cursor.load(Ordering::Relaxed);
        let scratch = ((seen + 1) % 2) as usize;
        // SAFETY: the latch makes this the only writer, and the scratch slot
        // is not the one the cursor directs readers to.
        unsafe {
            ptr::write_volatile(
                self.pair.slots.get().cast::<ClockState>().add(scratch),
                state,
            )
        };
        self.pair.cursor.store(seen + 1, Ordering::Release);
    }
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.pair.latch.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod t_pair {
    use super::*;
    use crate::common::{BaseClock, ClockSource, SystemClock};
    use crate::timestamp::Timestamp;
    use crate::ShimError;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    /// ClockSource reporting the same fixed reading for every base clock.
    struct FixedClock(Timestamp);

    impl ClockSource for FixedClock {
        fn read(&self, _clock: BaseClock) -> Result<Timestamp, ShimError> {
            Ok(self.0)
        }
    }

    fn identity_at(sec: i64) -> ClockState {
        ClockState::identity(&FixedClock(Timestamp::new(sec, 0))).unwrap()
    }

    #[test]
    fn current_returns_initial_state() {
        let pair = ClockStatePair::new(identity_at(7));
        assert_eq!(pair.current(), identity_at(7));
    }

    #[test]
    fn publish_replaces_current() {
        let pair = ClockStatePair::new(identity_at(1));

        let writer = pair.try_writer().expect("latch should be free");
        writer.publish(identity_at(2));
        drop(writer);
        assert_eq!(pair.current(), identity_at(2));

        // A second publication flips back to the first slot.
        let writer = pair.try_writer().expect("latch should be free");
        writer.publish(identity_at(3));
        drop(writer);
        assert_eq!(pair.current(), identity_at(3));
    }

    #[test]
    fn contested_latch_is_dropped_not_queued() {
        let pair = ClockStatePair::new(identity_at(1));

        let held = pair.try_writer().expect("latch should be free");
        assert!(pair.try_writer().is_none());
        drop(held);
        assert!(pair.try_writer().is_some());
    }

    /// Readers hammering `current()` while a writer keeps republishing must
    /// only ever observe states that were actually published, never a mix of
    /// two.
    #[test]
    fn concurrent_readers_never_observe_torn_state() {
        let pair = Arc::new(ClockStatePair::new(identity_at(0)));
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let pair = Arc::clone(&pair);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let state = pair.current();
                        // Identity states are internally uniform; a torn copy
                        // would mix two publications and break that.
                        let origin = state.real_origin(BaseClock::Wall);
                        for clock in BaseClock::ALL {
                            assert_eq!(state.real_origin(clock), origin);
                            assert_eq!(state.fake_origin(clock), origin);
                        }
                    }
                })
            })
            .collect();

        for sec in 1..5_000 {
            let writer = pair.try_writer().expect("single writer in this test");
            writer.publish(identity_at(sec));
        }
        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().expect("reader thread panicked");
        }
    }

    /// Concurrent monotonic reads stay monotonic while the speedup cycles.
    #[test]
    fn monotonic_reads_survive_speedup_cycling() {
        let initial = ClockState::identity(&SystemClock).expect("Failed to read base clocks");
        let pair = Arc::new(ClockStatePair::new(initial));
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let pair = Arc::clone(&pair);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let mut last = Timestamp::new(0, 0);
                    while !stop.load(Ordering::Relaxed) {
                        let fake = pair
                            .current()
                            .fake_now(BaseClock::Mono, &SystemClock)
                            .expect("Failed to read monotonic clock");
                        assert!(fake >= last, "virtual monotonic time went backwards");
                        last = fake;
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            for speedup in [0.5, 1.0, 2.0, 5.0] {
                if let Some(writer) = pair.try_writer() {
                    let next = writer
                        .current()
                        .rebased(speedup, &SystemClock)
                        .expect("Failed to compose state");
                    writer.publish(next);
                }
            }
        }
        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().expect("reader thread panicked");
        }
    }
}
