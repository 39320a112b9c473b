#![allow(dead_code)]

use spindle::coroutine::{self, Coroutine};
use spindle::reactor::set_nonblocking;
use spindle::{Control, Step, TaskError};

use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT_LOGGING: Once = Once::new();

/// Installs a test-friendly subscriber once per test binary. Honors
/// `RUST_LOG`, defaulting to warnings only.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Yields plainly `times` times, then completes with `value`.
pub fn yielding<T: 'static>(times: usize, value: T) -> impl Coroutine<Output = T> {
    let mut remaining = times;
    let mut value = Some(value);

    coroutine::from_fn(move || {
        if remaining > 0 {
            remaining -= 1;
            return Ok(Step::Suspend(Control::Yield));
        }

        value
            .take()
            .map(Step::Complete)
            .ok_or_else(|| TaskError::msg("resumed after completion"))
    })
}

/// Yields forever.
pub fn spinning() -> impl Coroutine<Output = ()> {
    coroutine::from_fn(|| -> Result<Step<()>, TaskError> { Ok(Step::Suspend(Control::Yield)) })
}

/// Returns non-blocking `(read, write)` ends of a fresh pipe.
pub fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0, "pipe() failed");
    for fd in fds {
        set_nonblocking(fd).expect("set_nonblocking failed");
    }
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

pub fn write_byte(fd: &OwnedFd, byte: u8) {
    use std::os::fd::AsRawFd;

    let written = unsafe { libc::write(fd.as_raw_fd(), &byte as *const u8 as *const libc::c_void, 1) };
    assert_eq!(written, 1, "write() failed");
}

pub fn read_byte(fd: libc::c_int) -> Option<u8> {
    let mut byte = 0u8;
    let n = unsafe { libc::read(fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
    (n == 1).then_some(byte)
}
