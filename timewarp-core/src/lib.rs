// Copyright Timewarp Contributors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Timewarp core
//!
//! This crate implements the clock bookkeeping shared by the Timewarp preload
//! shim and the controller: the time arithmetic value type, the folding of
//! platform clock ids onto the four base clocks, the immutable `ClockState`
//! snapshots with their continuity math, the lock-free `ClockStatePair`
//! publication mechanism, and the file channel a controller steers the speed
//! factor through. The shim (`timewarp-shim`) wires these pieces behind the
//! interposed libc entry points; the controller (`timewarp-ctl`) uses the
//! write side of the channel, which is only compiled under the "writer"
//! feature.

pub use crate::channel::{
    channel_path_from_env, SpeedupChannel, CHANNEL_ENV_VAR, CHANNEL_PATH_PREFIX,
};
#[cfg(feature = "writer")]
pub use crate::channel::SpeedupWriter;
pub use crate::common::{clock_gettime_safe, BaseClock, ClockSource, SystemClock};
pub use crate::pair::{ClockStatePair, WriterGuard};
pub use crate::timestamp::{Timestamp, NSEC_PER_SEC};

pub mod channel;
pub mod common;
mod pair;
mod timestamp;

use errno::Errno;
use std::ffi::CStr;

/// The speed factor every process starts at: virtual time tracks real time.
pub const INITIAL_SPEEDUP: f64 = 1.0;

/// Convenience macro to build a ShimError::SyscallError with extra info from
/// errno and custom origin information.
#[macro_export]
macro_rules! syserror {
    ($origin:expr) => {
        Err($crate::ShimError::SyscallError(
            ::errno::errno(),
            ::std::ffi::CStr::from_bytes_with_nul(concat!($origin, "\0").as_bytes()).unwrap(),
        ))
    };
}

/// Error condition returned by the low-level Timewarp APIs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShimError {
    /// A system call failed.
    /// Variant includes the Errno struct with error details, and an
    /// indication on the origin of the system call that error'ed.
    SyscallError(Errno, &'static CStr),

    /// The requested clock id does not fold onto a base clock.
    UnsupportedClock,
}

/// Snapshot of the virtual clock configuration, immutable once published.
///
/// A state pins, for each base clock, the genuine reading and the virtual
/// reading taken at the instant the state was composed (the origins), plus
/// the speed factor in force since then. The virtual time of any later
/// instant follows from those three values alone:
///
/// ```text
/// fake(c) = fake_origin[c] + (real(c) - real_origin[c]) * speedup
/// ```
///
/// Successive states are tied together by [`ClockState::rebased`], which
/// seeds the new origins with the virtual readings the old state reports at
/// the hand-over instant. The virtual clocks therefore never jump when the
/// speed factor changes, only their slope does.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ClockState {
    speedup: f64,
    real_origin: [Timestamp; BaseClock::COUNT],
    fake_origin: [Timestamp; BaseClock::COUNT],
}

impl ClockState {
    /// The state every process starts in: virtual time equals real time.
    ///
    /// Origins are fresh genuine readings and the fake origins coincide with
    /// the real ones, so the virtual clocks are identical to the platform
    /// clocks until a first speed change arrives.
    pub fn identity(source: &impl ClockSource) -> Result<ClockState, ShimError> {
        let mut origins = [Timestamp::default(); BaseClock::COUNT];
        for clock in BaseClock::ALL {
            origins[clock.index()] = source.read(clock)?;
        }
        Ok(ClockState {
            speedup: INITIAL_SPEEDUP,
            real_origin: origins,
            fake_origin: origins,
        })
    }

    /// Compose the successor state for a new speed factor.
    ///
    /// The new origins are fresh genuine readings; each fake origin is the
    /// virtual time this state reports at that very instant. The virtual
    /// reading immediately after publication therefore equals the reading
    /// immediately before it.
    pub fn rebased(&self, speedup: f64, source: &impl ClockSource) -> Result<ClockState, ShimError> {
        let mut next = ClockState {
            speedup,
            real_origin: self.real_origin,
            fake_origin: self.fake_origin,
        };
        for clock in BaseClock::ALL {
            let real_now = source.read(clock)?;
            next.real_origin[clock.index()] = real_now;
            next.fake_origin[clock.index()] = self.fake_at(clock, real_now);
        }
        Ok(next)
    }

    /// The virtual reading of `clock` at the genuine reading `real_now`.
    pub fn fake_at(&self, clock: BaseClock, real_now: Timestamp) -> Timestamp {
        let i = clock.index();
        self.fake_origin[i] + (real_now - self.real_origin[i]).scale_by(self.speedup)
    }

    /// Read the genuine clock and report the virtual one.
    pub fn fake_now(
        &self,
        clock: BaseClock,
        source: &impl ClockSource,
    ) -> Result<Timestamp, ShimError> {
        Ok(self.fake_at(clock, source.read(clock)?))
    }

    pub fn speedup(&self) -> f64 {
        self.speedup
    }

    pub fn real_origin(&self, clock: BaseClock) -> Timestamp {
        self.real_origin[clock.index()]
    }

    pub fn fake_origin(&self, clock: BaseClock) -> Timestamp {
        self.fake_origin[clock.index()]
    }
}
