use libc::{
    F_GETFD, F_GETFL, F_SETFD, F_SETFL, FD_CLOEXEC, O_NONBLOCK, POLLERR, POLLHUP, POLLIN,
    POLLNVAL, POLLOUT, c_int, fcntl, pollfd,
};
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Directions a descriptor is watched for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

#[repr(transparent)]
pub(crate) struct Event(pollfd);

impl Event {
    pub(crate) fn new(fd: RawFd, interest: Interest) -> Self {
        let mut events = 0;
        if interest.read {
            events |= POLLIN;
        }
        if interest.write {
            events |= POLLOUT;
        }

        Self(pollfd {
            fd,
            events,
            revents: 0,
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.0.fd
    }

    pub(crate) fn is_readable(&self) -> bool {
        self.0.revents & (POLLIN | POLLHUP | POLLERR) != 0
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.0.revents & (POLLOUT | POLLHUP | POLLERR) != 0
    }

    pub(crate) fn is_invalid(&self) -> bool {
        self.0.revents & POLLNVAL != 0
    }
}

/// Blocks until one of `events` is ready or `timeout` elapses (`None` waits
/// forever). Returns how many descriptors reported activity.
pub(crate) fn wait(events: &mut [Event], timeout: Option<Duration>) -> io::Result<usize> {
    let n = unsafe {
        libc::poll(
            events.as_mut_ptr() as *mut pollfd,
            events.len() as libc::nfds_t,
            timeout_ms(timeout),
        )
    };

    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(n as usize)
}

// Rounds up so a sub-millisecond timeout never turns into a busy poll.
fn timeout_ms(timeout: Option<Duration>) -> c_int {
    let Some(timeout) = timeout else {
        return -1;
    };

    let mut ms = timeout.as_millis();
    if timeout.subsec_nanos() % 1_000_000 != 0 {
        ms += 1;
    }

    ms.min(c_int::MAX as u128) as c_int
}

pub fn set_nonblocking(file_descriptor: RawFd) -> io::Result<()> {
    let flags = unsafe { fcntl(file_descriptor, F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { fcntl(file_descriptor, F_SETFL, flags | O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

pub(crate) fn set_cloexec(file_descriptor: RawFd) -> io::Result<()> {
    let flags = unsafe { fcntl(file_descriptor, F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { fcntl(file_descriptor, F_SETFD, flags | FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}
