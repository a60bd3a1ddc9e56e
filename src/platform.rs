//! Platform abstraction
//!
//! Small shims over OS services: a monotonic clock with a fixed origin, a raw
//! stderr path that performs no allocation, and buffer page-locking. Anything
//! OS specific stays behind these functions.

use std::io::Write;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Origin of the monotonic clock, fixed at first use.
fn origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

/// Monotonic time since the process-wide origin.
pub fn monotonic_now() -> Duration {
    origin().elapsed()
}

/// Write raw bytes to stderr without allocating.
///
/// Used on fatal paths where the allocator may no longer be usable. Errors are
/// ignored: there is nowhere left to report them.
pub fn stderr_write_raw(bytes: &[u8]) {
    let mut err = std::io::stderr().lock();
    let _ = err.write_all(bytes);
    let _ = err.flush();
}

/// Report a prebuilt fatal message and abort the process.
pub fn fatal_error(msg: &'static str) -> ! {
    stderr_write_raw(msg.as_bytes());
    stderr_write_raw(b"\n");
    std::process::abort();
}

/// Try to lock a memory region into RAM. Best effort: failure is normal for
/// unprivileged processes with small `RLIMIT_MEMLOCK`.
#[cfg(unix)]
pub fn lock_memory(ptr: *const u8, len: usize) -> bool {
    unsafe { libc::mlock(ptr as *const libc::c_void, len) == 0 }
}

#[cfg(not(unix))]
pub fn lock_memory(_ptr: *const u8, _len: usize) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_progresses() {
        let a = monotonic_now();
        let b = monotonic_now();
        assert!(b >= a);
    }
}
