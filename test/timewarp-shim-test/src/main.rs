// Copyright Timewarp Contributors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A test program printing the wall and monotonic clocks once a second.
//!
//! Run it under the preloaded shim and steer it with `timewarp-ctl` to watch
//! the virtual clocks race ahead of (or crawl behind) the printing cadence,
//! which stays genuine because sleeps are not intercepted:
//!
//! ```sh
//! LD_PRELOAD=target/release/libtimewarp.so TIME_CHANNEL=7 timewarp-shim-test
//! ```

use std::process;
use std::thread;
use std::time::Duration;

fn main() {
    // Run forever.
    // Type Ctrl-C to send a SIGINT and quit the program.
    loop {
        let wall = read_clock(libc::CLOCK_REALTIME);
        let mono = read_clock(libc::CLOCK_MONOTONIC);
        println!(
            "wall {}  mono {}",
            format_timespec(&wall),
            format_timespec(&mono)
        );
        thread::sleep(Duration::from_millis(1000));
    }
}

fn read_clock(clock_id: libc::clockid_t) -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: valid out-pointer.
    let ret = unsafe { libc::clock_gettime(clock_id, &mut ts) };
    if ret != 0 {
        eprintln!("clock_gettime failed");
        process::exit(1);
    }
    ts
}

fn format_timespec(ts: &libc::timespec) -> String {
    format!("{}.{:0>9}", ts.tv_sec, ts.tv_nsec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_pads_nanoseconds() {
        let ts = libc::timespec {
            tv_sec: 12,
            tv_nsec: 345,
        };
        assert_eq!(format_timespec(&ts), "12.000000345");
    }

    #[test]
    fn read_clock_is_live() {
        let one = read_clock(libc::CLOCK_MONOTONIC);
        let two = read_clock(libc::CLOCK_MONOTONIC);
        assert!(
            two.tv_sec > one.tv_sec || (two.tv_sec == one.tv_sec && two.tv_nsec >= one.tv_nsec)
        );
    }
}
