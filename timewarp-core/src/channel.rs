// Copyright Timewarp Contributors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use byteorder::{ByteOrder, NativeEndian};
use std::ffi::{CString, OsString};
use std::os::unix::ffi::OsStrExt;

/// Fixed prefix of the channel path. The contents of [`CHANNEL_ENV_VAR`] are
/// appended to it, so distinct target processes can be steered separately.
pub const CHANNEL_PATH_PREFIX: &str = "/tmp/time_control";

/// Environment variable naming the channel suffix of a target process.
pub const CHANNEL_ENV_VAR: &str = "TIME_CHANNEL";

// How much of the channel is polled per read. The controller may leave
// framing bytes ahead of the value; only the last four bytes read are
// decoded, so the buffer just needs to reach the tail of any sane write.
const POLL_BUF_LEN: usize = 64;

/// Build the channel path from the environment of the current process.
///
/// An unset suffix variable leaves the path at the bare prefix.
pub fn channel_path_from_env() -> CString {
    let mut path = OsString::from(CHANNEL_PATH_PREFIX);
    if let Some(suffix) = std::env::var_os(CHANNEL_ENV_VAR) {
        path.push(&suffix);
    }
    CString::new(path.as_os_str().as_bytes()).expect("channel path contains a NUL byte")
}

/// Read side of the speed channel.
///
/// The channel is a plain file the controller rewinds and rewrites; the
/// latest write wins. The descriptor is opened lazily in non-blocking
/// read-only mode on the first poll that finds the file, at most once per
/// process, and is never closed.
pub struct SpeedupChannel {
    /// Fixed path, or `None` to derive the path from the environment on each
    /// open attempt until one succeeds.
    path: Option<CString>,
    fd: Option<libc::c_int>,
}

impl SpeedupChannel {
    /// Channel at a fixed path.
    pub fn new(path: CString) -> SpeedupChannel {
        SpeedupChannel {
            path: Some(path),
            fd: None,
        }
    }

    /// Channel at the prefix + `TIME_CHANNEL` path.
    pub fn from_env() -> SpeedupChannel {
        SpeedupChannel {
            path: None,
            fd: None,
        }
    }

    /// Poll the channel for the most recently written speed factor.
    ///
    /// Never blocks and never reports an error: a missing channel, a failed
    /// read, a write of fewer than four bytes and a value that is not a
    /// positive finite number all degrade to "no change". Failed opens are
    /// retried on the next poll.
    pub fn poll(&mut self) -> Option<f32> {
        let fd = match self.fd {
            Some(fd) => fd,
            None => {
                let path = match &self.path {
                    Some(path) => path.clone(),
                    None => channel_path_from_env(),
                };
                // SAFETY: `path` is a valid C string.
                let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK) };
                if fd < 0 {
                    return None;
                }
                self.fd = Some(fd);
                fd
            }
        };

        let mut buf = [0u8; POLL_BUF_LEN];
        // SAFETY: `fd` is open and `buf` provides POLL_BUF_LEN writable bytes.
        let count = unsafe {
            if libc::lseek(fd, 0, libc::SEEK_SET) < 0 {
                return None;
            }
            libc::read(fd, buf.as_mut_ptr().cast(), POLL_BUF_LEN)
        };
        if count < 4 {
            return None;
        }

        // Host byte order, matching what the controller writes.
        let speedup = NativeEndian::read_f32(&buf[count as usize - 4..count as usize]);

        // The channel is untrusted external input; only positive finite
        // factors keep virtual time well defined.
        if speedup.is_finite() && speedup > 0.0 {
            Some(speedup)
        } else {
            None
        }
    }
}

/// Write side of the speed channel, used by the controller.
///
/// Every publication rewrites the file from offset zero so the reader always
/// decodes the latest value.
#[cfg(feature = "writer")]
pub struct SpeedupWriter {
    fd: libc::c_int,
}

#[cfg(feature = "writer")]
impl SpeedupWriter {
    /// Open the channel file at `path`, creating it if needed.
    pub fn create(path: &std::path::Path) -> std::io::Result<SpeedupWriter> {
        let fd = nix::fcntl::open(
            path,
            nix::fcntl::OFlag::O_WRONLY | nix::fcntl::OFlag::O_CREAT | nix::fcntl::OFlag::O_TRUNC,
            nix::sys::stat::Mode::from_bits_truncate(0o644),
        )
        .map_err(io_error)?;

        Ok(SpeedupWriter { fd })
    }

    /// Publish `speedup` to the channel.
    pub fn set_speedup(&mut self, speedup: f32) -> std::io::Result<()> {
        if !speedup.is_finite() || speedup <= 0.0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("speed factor must be positive and finite, got {speedup}"),
            ));
        }

        let mut buf = [0u8; 4];
        NativeEndian::write_f32(&mut buf, speedup);

        nix::unistd::lseek(self.fd, 0, nix::unistd::Whence::SeekSet).map_err(io_error)?;
        let written = nix::unistd::write(self.fd, &buf).map_err(io_error)?;
        if written != buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "short write to speed channel",
            ));
        }
        Ok(())
    }
}

#[cfg(feature = "writer")]
impl Drop for SpeedupWriter {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.fd);
    }
}

#[cfg(feature = "writer")]
fn io_error(errno: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno as i32)
}
