//! OS signal delivery through a self-pipe.
//!
//! The installed handler only writes the signal number into a non-blocking
//! pipe, which is async-signal-safe. The multiplexer polls the read end like
//! any other descriptor and dispatches listeners from the loop.
//!
//! The pipe is process-wide: signal dispositions are process-wide too.

use crate::reactor::event::{set_cloexec, set_nonblocking};

use libc::{EAGAIN, EINTR, EWOULDBLOCK, c_int, c_void};
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI32, Ordering};

static PIPE: OnceLock<SelfPipe> = OnceLock::new();
static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

struct SelfPipe {
    read: RawFd,
    write: RawFd,
}

impl SelfPipe {
    fn open() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let pipe = Self {
            read: fds[0],
            write: fds[1],
        };

        for fd in fds {
            if let Err(err) = set_nonblocking(fd).and_then(|()| set_cloexec(fd)) {
                pipe.close();
                return Err(err);
            }
        }

        Ok(pipe)
    }

    fn close(&self) {
        unsafe {
            libc::close(self.read);
            libc::close(self.write);
        }
    }
}

fn pipe() -> io::Result<&'static SelfPipe> {
    if let Some(pipe) = PIPE.get() {
        return Ok(pipe);
    }

    if let Err(raced) = PIPE.set(SelfPipe::open()?) {
        raced.close();
    }

    let pipe = PIPE
        .get()
        .ok_or_else(|| io::Error::other("signal pipe unavailable"))?;
    WRITE_FD.store(pipe.write, Ordering::SeqCst);

    Ok(pipe)
}

/// Read end of the self-pipe, once any handler has been installed.
pub(crate) fn read_fd() -> Option<RawFd> {
    PIPE.get().map(|pipe| pipe.read)
}

extern "C" fn on_signal(signum: c_int) {
    let saved = errno_location().map(|location| unsafe { *location });

    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signum as u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const c_void, 1);
        }
    }

    if let (Some(location), Some(saved)) = (errno_location(), saved) {
        unsafe { *location = saved };
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn errno_location() -> Option<*mut c_int> {
    Some(unsafe { libc::__errno_location() })
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn errno_location() -> Option<*mut c_int> {
    Some(unsafe { libc::__error() })
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
fn errno_location() -> Option<*mut c_int> {
    None
}

/// Previous disposition of a signal, restored when the last listener goes.
pub(crate) struct Disposition(libc::sigaction);

/// Routes `signum` into the self-pipe and returns the disposition it replaced.
pub(crate) fn install(signum: c_int) -> io::Result<Disposition> {
    pipe()?;

    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = on_signal as extern "C" fn(c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);

        let mut previous: libc::sigaction = mem::zeroed();
        if libc::sigaction(signum, &action, &mut previous) < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Disposition(previous))
    }
}

pub(crate) fn restore(signum: c_int, disposition: &Disposition) -> io::Result<()> {
    if unsafe { libc::sigaction(signum, &disposition.0, ptr::null_mut()) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Reads every pending signal number out of the pipe, in delivery order.
pub(crate) fn drain() -> Vec<c_int> {
    let Some(fd) = read_fd() else {
        return Vec::new();
    };

    let mut delivered = Vec::new();
    let mut buf = [0u8; 64];

    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };

        if n > 0 {
            delivered.extend(buf[..n as usize].iter().map(|&b| c_int::from(b)));
            continue;
        }

        if n < 0 {
            let err = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if err == EINTR {
                continue;
            }
            if err != EAGAIN && err != EWOULDBLOCK {
                tracing::warn!(errno = err, "reading the signal pipe failed");
            }
        }

        return delivered;
    }
}
