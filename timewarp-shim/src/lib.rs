// Copyright Timewarp Contributors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Timewarp preload shim
//!
//! This crate builds into `libtimewarp.so`, a library inserted ahead of the
//! platform C library through the dynamic linker's preload facility:
//!
//! ```sh
//! LD_PRELOAD=./libtimewarp.so TIME_CHANNEL=7 my_process
//! ```
//!
//! It overrides the standard time-reading entry points (`time`,
//! `gettimeofday`, `clock_gettime`, `clock`) and answers them from virtual
//! clocks whose rate is steered by an external controller through a small
//! file channel (see `timewarp-core` and `timewarp-ctl`). The virtual clocks
//! are continuous across rate changes: accelerating, slowing or resuming time
//! never makes a reading jump.
//!
//! The entry points run on threads the shim does not own, so nothing on the
//! read path blocks, allocates or leaves `errno` disturbed. Sleep-family
//! symbols are left alone.

use errno::{errno, set_errno, Errno};
use timewarp_core::{ShimError, Timestamp, NSEC_PER_SEC};

use crate::oracle::ORACLE;

pub mod oracle;
pub mod real;

/// Shared prologue/epilogue of the interposed entry points: snapshot the
/// caller's errno, compute the virtual reading, and restore errno on
/// success. The write-side update inside may probe the channel file and
/// scribble on errno; the target must never see that.
fn fake_time_preserving_errno(clock_id: libc::clockid_t) -> Result<Timestamp, ShimError> {
    let saved = errno();
    let result = ORACLE.fake_time(clock_id);
    if result.is_ok() {
        set_errno(saved);
    }
    result
}

/// Interposed `time(2)`: whole virtual seconds of the wall clock.
///
/// # Safety
///
/// Rely on the caller to pass a valid or null out-pointer.
#[no_mangle]
pub unsafe extern "C" fn time(tloc: *mut libc::time_t) -> libc::time_t {
    match fake_time_preserving_errno(libc::CLOCK_REALTIME) {
        Ok(fake) => {
            let secs = fake.sec() as libc::time_t;
            if !tloc.is_null() {
                tloc.write(secs);
            }
            secs
        }
        Err(_) => -1,
    }
}

/// Interposed `gettimeofday(2)`. The timezone argument is accepted and
/// ignored, as it is by the platform implementation.
///
/// # Safety
///
/// Rely on the caller to pass valid pointers.
#[no_mangle]
pub unsafe extern "C" fn gettimeofday(tv: *mut libc::timeval, _tz: *mut libc::c_void) -> libc::c_int {
    let fake = match fake_time_preserving_errno(libc::CLOCK_REALTIME) {
        Ok(fake) => fake,
        Err(_) => return -1,
    };
    if !tv.is_null() {
        tv.write(libc::timeval {
            tv_sec: fake.sec() as libc::time_t,
            tv_usec: (fake.nsec() / 1_000) as libc::suseconds_t,
        });
    }
    0
}

/// Interposed `clock_gettime(2)`.
///
/// Recognised clock ids are folded onto their base clock and answered with
/// the virtual reading; unrecognised ids fail with EINVAL. This is the only
/// entry point that ever surfaces an error to the target.
///
/// # Safety
///
/// Rely on the caller to pass valid pointers.
#[no_mangle]
pub unsafe extern "C" fn clock_gettime(
    clock_id: libc::clockid_t,
    tp: *mut libc::timespec,
) -> libc::c_int {
    match fake_time_preserving_errno(clock_id) {
        Ok(fake) => {
            if !tp.is_null() {
                tp.write(fake.into());
            }
            0
        }
        Err(ShimError::UnsupportedClock) => {
            set_errno(Errno(libc::EINVAL));
            -1
        }
        Err(ShimError::SyscallError(..)) => -1,
    }
}

/// POSIX-mandated value of `CLOCKS_PER_SEC` on Linux; not exposed by the `libc` crate.
const CLOCKS_PER_SEC: libc::clock_t = 1_000_000;

/// Interposed `clock(3)`: virtual process CPU time in clock ticks.
#[no_mangle]
pub extern "C" fn clock() -> libc::clock_t {
    match fake_time_preserving_errno(libc::CLOCK_PROCESS_CPUTIME_ID) {
        Ok(fake) => (fake.as_secs_f64() * CLOCKS_PER_SEC as f64) as libc::clock_t,
        Err(_) => -1,
    }
}

/// Queue a speed change from within the target process, absorbed by the
/// next intercepted call. Exposed for test harnesses; the controller steers
/// production processes through the channel instead.
#[no_mangle]
pub extern "C" fn __timewarp_set_speedup(speedup: f32) {
    ORACLE.queue_speedup(speedup);
}

/// Sleep for `nanos` genuine nanoseconds, bypassing virtualization. Test
/// harnesses use this to advance real time by a known amount.
#[no_mangle]
pub extern "C" fn __timewarp_sleep_for_nanos(nanos: u64) {
    let request = libc::timespec {
        tv_sec: (nanos / NSEC_PER_SEC as u64) as libc::time_t,
        tv_nsec: (nanos % NSEC_PER_SEC as u64) as libc::c_long,
    };
    match ORACLE.real().nanosleep {
        Some(nanosleep) => {
            // SAFETY: `request` outlives the call; the remaining-time
            // out-parameter is unused.
            unsafe { nanosleep(&request, std::ptr::null_mut()) };
        }
        None => {
            eprintln!("timewarp: genuine nanosleep unavailable");
            std::process::abort();
        }
    }
}

/// Genuine `clock_gettime`, bypassing virtualization.
///
/// # Safety
///
/// Rely on the caller to pass valid pointers.
#[no_mangle]
pub unsafe extern "C" fn __timewarp_real_clock_gettime(
    clock_id: libc::clockid_t,
    tp: *mut libc::timespec,
) -> libc::c_int {
    (ORACLE.real().clock_gettime)(clock_id, tp)
}

#[cfg(test)]
mod t_shim {
    use super::*;
    use std::mem;

    fn read_fake(clock_id: libc::clockid_t) -> Timestamp {
        // SAFETY: valid out-pointer.
        unsafe {
            let mut ts: libc::timespec = mem::zeroed();
            assert_eq!(clock_gettime(clock_id, &mut ts), 0);
            Timestamp::from(ts)
        }
    }

    fn read_real(clock_id: libc::clockid_t) -> Timestamp {
        // SAFETY: valid out-pointer.
        unsafe {
            let mut ts: libc::timespec = mem::zeroed();
            assert_eq!(__timewarp_real_clock_gettime(clock_id, &mut ts), 0);
            Timestamp::from(ts)
        }
    }

    /// Assert the caller's errno survives a time read untouched.
    #[test]
    fn errno_is_preserved_across_reads() {
        set_errno(Errno(61));
        // SAFETY: null out-pointers are accepted by the entry points.
        unsafe {
            time(std::ptr::null_mut());
            gettimeofday(std::ptr::null_mut(), std::ptr::null_mut());
            let mut ts: libc::timespec = mem::zeroed();
            clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        clock();
        assert_eq!(errno(), Errno(61));
        set_errno(Errno(0));
    }

    /// Assert a bogus clock id fails with EINVAL and nothing else does.
    #[test]
    fn bogus_clock_id_fails_with_einval() {
        // SAFETY: valid out-pointer.
        unsafe {
            let mut ts: libc::timespec = mem::zeroed();
            set_errno(Errno(0));
            assert_eq!(clock_gettime(4242, &mut ts), -1);
            assert_eq!(errno(), Errno(libc::EINVAL));
        }
    }

    /// Assert all three wall-clock entry points agree with each other.
    #[test]
    fn wall_entry_points_agree() {
        // SAFETY: valid out-pointers.
        unsafe {
            let mut stored: libc::time_t = 0;
            let returned = time(&mut stored);
            assert_eq!(returned, stored);

            let mut tv: libc::timeval = mem::zeroed();
            assert_eq!(gettimeofday(&mut tv, std::ptr::null_mut()), 0);
            assert!(tv.tv_usec < 1_000_000);

            let wall = read_fake(libc::CLOCK_REALTIME);
            assert!((wall.sec() - tv.tv_sec).abs() <= 2);
            assert!((wall.sec() - returned).abs() <= 2);
        }
    }

    /// Assert clock aliases report the reading of their base clock.
    #[test]
    fn aliases_follow_their_base_clock() {
        let mono = read_fake(libc::CLOCK_MONOTONIC);
        let boot = read_fake(libc::CLOCK_BOOTTIME);
        let raw = read_fake(libc::CLOCK_MONOTONIC_RAW);

        let drift = (boot - mono).as_secs_f64().abs();
        assert!(drift < 0.005, "BOOTTIME diverged from MONOTONIC: {drift}s");
        let drift = (raw - mono).as_secs_f64().abs();
        assert!(drift < 0.005, "MONOTONIC_RAW diverged from MONOTONIC: {drift}s");
    }

    /// Assert the CPU tick reader reports non-decreasing sane values.
    #[test]
    fn cpu_ticks_are_sane() {
        let first = clock();
        assert!(first >= 0);

        // Burn a little CPU so the process clock visibly advances.
        let mut acc: u64 = 0;
        for i in 0..2_000_000u64 {
            acc = acc.wrapping_add(i ^ acc);
        }
        assert!(acc != 1); // keep the loop alive

        let second = clock();
        assert!(second >= first);
    }

    /// Assert the genuine reader bypasses virtualization plumbing.
    #[test]
    fn real_reader_is_live() {
        let one = read_real(libc::CLOCK_MONOTONIC);
        let two = read_real(libc::CLOCK_MONOTONIC);
        assert!(two >= one);
    }
}
