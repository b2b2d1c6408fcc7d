// Copyright Timewarp Contributors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use lazy_static::lazy_static;
use timewarp_core::{
    BaseClock, ClockState, ClockStatePair, ShimError, SpeedupChannel, Timestamp,
};

use crate::real::RealFns;

lazy_static! {
    /// The per-process oracle instance behind every interposed entry point.
    pub static ref ORACLE: Oracle = Oracle::bootstrap();
}

/// Force initialisation from the dynamic loader, before the target's `main`
/// and before any interposed symbol can service a call on an application
/// thread. After this runs, touching the oracle is a single atomic check.
#[used]
#[link_section = ".init_array"]
static ORACLE_INIT: extern "C" fn() = {
    extern "C" fn oracle_init() {
        lazy_static::initialize(&ORACLE);
    }
    oracle_init
};

/// Pending in-process speed change, set by `__timewarp_set_speedup` and
/// absorbed by the next intercepted call. `bits` carries the raw `f32`.
struct SpeedupOverride {
    armed: AtomicBool,
    bits: AtomicU32,
}

impl SpeedupOverride {
    fn arm(&self, speedup: f32) {
        self.bits.store(speedup.to_bits(), Ordering::Relaxed);
        self.armed.store(true, Ordering::Release);
    }

    fn take(&self) -> Option<f32> {
        if self.armed.swap(false, Ordering::Acquire) {
            Some(f32::from_bits(self.bits.load(Ordering::Relaxed)))
        } else {
            None
        }
    }
}

/// Process-wide aggregate behind the interposed entry points: the resolved
/// genuine functions, the published clock state, and the two speed-change
/// inputs (external channel, in-process override).
pub struct Oracle {
    real: RealFns,
    pair: ClockStatePair,
    /// Only touched while holding the pair's writer latch.
    channel: UnsafeCell<SpeedupChannel>,
    pending: SpeedupOverride,
}

// SAFETY: `real` and `pending` are plain atomics / immutable data; `pair` is
// internally synchronised; `channel` is only accessed by the holder of the
// pair's writer latch, which admits one thread at a time.
unsafe impl Sync for Oracle {}

impl Oracle {
    fn bootstrap() -> Oracle {
        let real = RealFns::resolve();
        let initial = match ClockState::identity(&real) {
            Ok(state) => state,
            Err(err) => {
                eprintln!("timewarp: cannot read the platform clocks at load: {:?}", err);
                std::process::abort();
            }
        };

        Oracle {
            real,
            pair: ClockStatePair::new(initial),
            channel: UnsafeCell::new(SpeedupChannel::from_env()),
            pending: SpeedupOverride {
                armed: AtomicBool::new(false),
                bits: AtomicU32::new(0),
            },
        }
    }

    /// Queue a speed change to be absorbed by the next intercepted call.
    pub fn queue_speedup(&self, speedup: f32) {
        self.pending.arm(speedup);
    }

    /// Absorb any pending speed change, then report the virtual time of
    /// `clock_id`.
    ///
    /// This is the whole per-call procedure except for the errno handling,
    /// which the entry points own.
    pub fn fake_time(&self, clock_id: libc::clockid_t) -> Result<Timestamp, ShimError> {
        self.absorb_pending();
        let base = BaseClock::fold(clock_id)?;
        self.pair.current().fake_now(base, &self.real)
    }

    /// The resolved genuine functions, for the helpers that bypass
    /// virtualization.
    pub fn real(&self) -> &RealFns {
        &self.real
    }

    /// Non-blocking write-side update.
    ///
    /// Latch contention, channel failures and malformed values all degrade
    /// to "no change this call"; the last-published state stays in force and
    /// the next caller retries.
    fn absorb_pending(&self) {
        let writer = match self.pair.try_writer() {
            Some(writer) => writer,
            None => return,
        };

        // The in-process override takes precedence; the channel is only
        // polled when no override is armed.
        let requested = self.pending.take().or_else(|| {
            // SAFETY: the writer latch is held, no other thread touches the
            // channel handle.
            let channel = unsafe { &mut *self.channel.get() };
            channel.poll()
        });

        if let Some(requested) = requested {
            let speedup = f64::from(requested);
            // The override is test input and not pre-validated the way the
            // channel is.
            if speedup.is_finite() && speedup > 0.0 {
                if let Ok(next) = writer.current().rebased(speedup, &self.real) {
                    writer.publish(next);
                }
            }
        }
    }
}
