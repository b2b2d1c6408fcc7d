// Copyright Timewarp Contributors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::mem::MaybeUninit;

use crate::timestamp::Timestamp;
use crate::{syserror, ShimError};

/// The four clock identities virtual time is tracked against. Every clock id
/// the shim recognises folds onto one of these.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BaseClock {
    /// The settable wall clock.
    Wall,
    /// The unsettable monotonic clock.
    Mono,
    /// CPU time consumed by the whole process.
    ProcCpu,
    /// CPU time consumed by the calling thread.
    ThreadCpu,
}

impl BaseClock {
    pub const COUNT: usize = 4;

    pub const ALL: [BaseClock; BaseClock::COUNT] = [
        BaseClock::Wall,
        BaseClock::Mono,
        BaseClock::ProcCpu,
        BaseClock::ThreadCpu,
    ];

    /// Fold a clock id onto the base clock that backs it.
    ///
    /// The raw, coarse, boot-time and alarm variants all report time that
    /// advances with their base clock, so redirecting them keeps the number
    /// of genuine clocks fetched per state change small. Anything else is
    /// unsupported.
    pub fn fold(clock_id: libc::clockid_t) -> Result<BaseClock, ShimError> {
        match clock_id {
            libc::CLOCK_REALTIME | libc::CLOCK_REALTIME_COARSE | libc::CLOCK_REALTIME_ALARM => {
                Ok(BaseClock::Wall)
            }
            libc::CLOCK_MONOTONIC
            | libc::CLOCK_MONOTONIC_RAW
            | libc::CLOCK_MONOTONIC_COARSE
            | libc::CLOCK_BOOTTIME
            | libc::CLOCK_BOOTTIME_ALARM => Ok(BaseClock::Mono),
            libc::CLOCK_PROCESS_CPUTIME_ID => Ok(BaseClock::ProcCpu),
            libc::CLOCK_THREAD_CPUTIME_ID => Ok(BaseClock::ThreadCpu),
            _ => Err(ShimError::UnsupportedClock),
        }
    }

    /// The platform clock id this base clock reads from.
    pub fn as_clockid(self) -> libc::clockid_t {
        match self {
            BaseClock::Wall => libc::CLOCK_REALTIME,
            BaseClock::Mono => libc::CLOCK_MONOTONIC,
            BaseClock::ProcCpu => libc::CLOCK_PROCESS_CPUTIME_ID,
            BaseClock::ThreadCpu => libc::CLOCK_THREAD_CPUTIME_ID,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Where genuine time readings come from.
///
/// The controller and the unit tests read through the platform
/// `clock_gettime` directly. The shim substitutes a source backed by the
/// resolved real symbol, so that computing virtual time never re-enters the
/// interposed entry point.
pub trait ClockSource {
    /// Read the genuine time of a base clock.
    fn read(&self, clock: BaseClock) -> Result<Timestamp, ShimError>;
}

/// `ClockSource` reading through the platform `clock_gettime`.
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn read(&self, clock: BaseClock) -> Result<Timestamp, ShimError> {
        clock_gettime_safe(clock.as_clockid()).map(Timestamp::from)
    }
}

/// Read a specific view of time.
///
/// This function wraps the `clock_gettime()` system call to conveniently
/// return the current time tracked by a specific clock. The clock_id is one
/// of libc::CLOCK_REALTIME, libc::CLOCK_MONOTONIC, etc.
pub fn clock_gettime_safe(clock_id: libc::clockid_t) -> Result<libc::timespec, ShimError> {
    // Allocate a buffer where the current time will be written to
    let mut buf: MaybeUninit<libc::timespec> = MaybeUninit::uninit();

    // SAFETY: The pointers passed to clock_gettime are valid. Assume init if the call is successful.
    unsafe {
        let ret = libc::clock_gettime(clock_id, buf.as_mut_ptr());
        if ret < 0 {
            syserror!("clock_gettime")
        } else {
            Ok(buf.assume_init())
        }
    }
}
