// Copyright Timewarp Contributors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::ffi::CStr;
use std::mem::{self, MaybeUninit};

use timewarp_core::{syserror, BaseClock, ClockSource, ShimError, Timestamp};

pub type TimeFn = unsafe extern "C" fn(*mut libc::time_t) -> libc::time_t;
pub type GettimeofdayFn = unsafe extern "C" fn(*mut libc::timeval, *mut libc::c_void) -> libc::c_int;
pub type ClockGettimeFn = unsafe extern "C" fn(libc::clockid_t, *mut libc::timespec) -> libc::c_int;
pub type ClockFn = unsafe extern "C" fn() -> libc::clock_t;
pub type NanosleepFn = unsafe extern "C" fn(*const libc::timespec, *mut libc::timespec) -> libc::c_int;

/// The genuine libc time functions hidden behind the interposed names.
///
/// Each pointer is the *next* definition in the dynamic linker's search
/// order after this library, i.e. the platform implementation the target
/// believes it is calling. Resolution happens once, from the load
/// constructor; pointers are never invalidated.
pub struct RealFns {
    pub time: TimeFn,
    pub gettimeofday: GettimeofdayFn,
    pub clock_gettime: ClockGettimeFn,
    pub clock: ClockFn,
    /// Only needed by the in-process sleep helper, so its absence is not
    /// fatal at load.
    pub nanosleep: Option<NanosleepFn>,
}

impl RealFns {
    /// Resolve every genuine symbol.
    ///
    /// A missing required symbol is fatal: without the platform
    /// implementation underneath there is no real time to warp, so the shim
    /// aborts the process with a diagnostic rather than fail every clock
    /// read from here on.
    pub fn resolve() -> RealFns {
        // SAFETY: every symbol is resolved from the dynamic linker under its
        // canonical name, so the transmuted signatures match the ABI of the
        // definitions found.
        unsafe {
            RealFns {
                time: mem::transmute::<*mut libc::c_void, TimeFn>(resolve_required(cstr(
                    b"time\0",
                ))),
                gettimeofday: mem::transmute::<*mut libc::c_void, GettimeofdayFn>(
                    resolve_required(cstr(b"gettimeofday\0")),
                ),
                clock_gettime: mem::transmute::<*mut libc::c_void, ClockGettimeFn>(
                    resolve_required(cstr(b"clock_gettime\0")),
                ),
                clock: mem::transmute::<*mut libc::c_void, ClockFn>(resolve_required(cstr(
                    b"clock\0",
                ))),
                nanosleep: resolve(cstr(b"nanosleep\0"))
                    .map(|sym| mem::transmute::<*mut libc::c_void, NanosleepFn>(sym)),
            }
        }
    }
}

/// `ClockSource` backed by the resolved genuine `clock_gettime`, so that
/// computing virtual time never re-enters the interposed export.
impl ClockSource for RealFns {
    fn read(&self, clock: BaseClock) -> Result<Timestamp, ShimError> {
        let mut buf: MaybeUninit<libc::timespec> = MaybeUninit::uninit();
        // SAFETY: the out-pointer is valid and the resolved symbol is the
        // genuine implementation. Assume init if the call is successful.
        unsafe {
            let ret = (self.clock_gettime)(clock.as_clockid(), buf.as_mut_ptr());
            if ret < 0 {
                syserror!("clock_gettime")
            } else {
                Ok(Timestamp::from(buf.assume_init()))
            }
        }
    }
}

fn cstr(bytes: &'static [u8]) -> &'static CStr {
    CStr::from_bytes_with_nul(bytes).unwrap()
}

/// Look a symbol up past this library in the linker search order.
fn resolve(name: &CStr) -> Option<*mut libc::c_void> {
    // SAFETY: `name` is a valid C string and RTLD_NEXT is a reserved
    // pseudo-handle for exactly this kind of interposition lookup.
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if sym.is_null() {
        None
    } else {
        Some(sym)
    }
}

fn resolve_required(name: &CStr) -> *mut libc::c_void {
    match resolve(name) {
        Some(sym) => sym,
        None => {
            eprintln!(
                "timewarp: unable to resolve genuine `{}` via RTLD_NEXT",
                name.to_string_lossy()
            );
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod t_real {
    use super::*;

    /// Assert every genuine symbol resolves in a normally linked process.
    #[test]
    fn resolves_the_platform_symbols() {
        let real = RealFns::resolve();
        assert!(real.nanosleep.is_some());
    }

    /// Assert the resolved clock_gettime reads plausible time.
    #[test]
    fn resolved_clock_gettime_is_live() {
        let real = RealFns::resolve();

        let one = real.read(BaseClock::Mono).expect("Failed to read clock");
        let two = real.read(BaseClock::Mono).expect("Failed to read clock");
        assert!(two >= one);

        // A genuine wall reading is far from the epoch.
        let wall = real.read(BaseClock::Wall).expect("Failed to read clock");
        assert!(wall.sec() > 1_000_000_000);
    }
}
