// Copyright Timewarp Contributors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::ops::{Add, Neg, Sub};

/// Number of nanoseconds in one second.
pub const NSEC_PER_SEC: i64 = 1_000_000_000;

/// A clock reading (or a duration between two readings) in seconds and
/// nanoseconds, canonical form `0 <= nsec < NSEC_PER_SEC`.
///
/// This is the value type all virtual-time arithmetic is performed on.
/// Conversions to and from `libc::timespec` happen at the FFI boundary only.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    sec: i64,
    nsec: i64,
}

impl Timestamp {
    pub fn new(sec: i64, nsec: i64) -> Timestamp {
        Timestamp { sec, nsec }
    }

    pub fn sec(&self) -> i64 {
        self.sec
    }

    pub fn nsec(&self) -> i64 {
        self.nsec
    }

    /// The reading as a floating-point number of seconds. Loses precision on
    /// large values, convenient for tolerance checks.
    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + self.nsec as f64 / NSEC_PER_SEC as f64
    }

    /// Scale by a finite non-negative factor.
    ///
    /// Seconds and nanoseconds are scaled as real numbers, the fractional
    /// seconds of the product are folded into the nanosecond field, and the
    /// result is re-normalised with a floored modulo so that `nsec` lands in
    /// `[0, NSEC_PER_SEC)` even when the scaled value is negative.
    pub fn scale_by(self, factor: f64) -> Timestamp {
        let scaled_sec = self.sec as f64 * factor;
        let scaled_nsec = self.nsec as f64 * factor;

        let mut sec = scaled_sec as i64;
        let frac_sec = scaled_sec - sec as f64;
        let total_nsec = (scaled_nsec + frac_sec * NSEC_PER_SEC as f64) as i64;

        let nsec = (total_nsec % NSEC_PER_SEC + NSEC_PER_SEC) % NSEC_PER_SEC;
        sec += (total_nsec - nsec) / NSEC_PER_SEC;

        Timestamp { sec, nsec }
    }
}

impl From<libc::timespec> for Timestamp {
    fn from(ts: libc::timespec) -> Timestamp {
        Timestamp {
            sec: ts.tv_sec as i64,
            nsec: ts.tv_nsec as i64,
        }
    }
}

impl From<Timestamp> for libc::timespec {
    fn from(t: Timestamp) -> libc::timespec {
        libc::timespec {
            tv_sec: t.sec as libc::time_t,
            tv_nsec: t.nsec as libc::c_long,
        }
    }
}

impl Sub for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Timestamp) -> Timestamp {
        let mut sec = self.sec - rhs.sec;
        let mut nsec = self.nsec - rhs.nsec;
        if nsec >= NSEC_PER_SEC {
            sec += 1;
            nsec -= NSEC_PER_SEC;
        } else if nsec < 0 {
            sec -= 1;
            nsec += NSEC_PER_SEC;
        }
        Timestamp { sec, nsec }
    }
}

impl Neg for Timestamp {
    type Output = Timestamp;

    fn neg(self) -> Timestamp {
        Timestamp {
            sec: -self.sec,
            nsec: -self.nsec,
        }
    }
}

impl Add for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Timestamp) -> Timestamp {
        self - (-rhs)
    }
}
