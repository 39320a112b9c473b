//! Readiness multiplexer: descriptor and signal listeners plus the one
//! blocking wait the event loop performs between batches.
//!
//! Every method takes `&self` so listeners can register, remove and spawn
//! while [`Multiplexer::wait`] is dispatching them. No internal borrow is
//! held across a listener call.

use crate::error::{ListenerResult, TaskError};
use crate::reactor::event::{self, Event, Interest};
use crate::reactor::signal::{self, Disposition};

use libc::c_int;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

pub type StreamListener = Box<dyn FnMut(RawFd) -> ListenerResult>;
pub type SignalListener = Box<dyn FnMut(c_int) -> ListenerResult>;

type SharedStream = Rc<RefCell<StreamListener>>;
type SharedSignal = Rc<RefCell<SignalListener>>;

/// Listeners whose descriptor was reported ready by one poll.
type Ready = Vec<(RawFd, SharedStream)>;

/// Which readiness a stream listener waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Identifies one signal listener for [`Multiplexer::off_signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Interests {
    read: Option<SharedStream>,
    write: Option<SharedStream>,
}

impl Interests {
    fn slot(&self, direction: Direction) -> Option<&SharedStream> {
        match direction {
            Direction::Read => self.read.as_ref(),
            Direction::Write => self.write.as_ref(),
        }
    }

    fn slot_mut(&mut self, direction: Direction) -> &mut Option<SharedStream> {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    fn interest(&self) -> Interest {
        Interest {
            read: self.read.is_some(),
            write: self.write.is_some(),
        }
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

struct SignalEntry {
    listeners: Vec<(ListenerId, SharedSignal)>,
    previous: Disposition,
}

/// Descriptor and signal listeners, dispatched from one `poll(2)` call per
/// [`wait`](Multiplexer::wait).
pub struct Multiplexer {
    streams: RefCell<BTreeMap<RawFd, Interests>>,
    signals: RefCell<BTreeMap<c_int, SignalEntry>>,
    events: RefCell<Vec<Event>>,
    next_listener: Cell<u64>,
}

impl Multiplexer {
    /// Creates a multiplexer with no registrations.
    pub fn new() -> Self {
        Self {
            streams: RefCell::new(BTreeMap::new()),
            signals: RefCell::new(BTreeMap::new()),
            events: RefCell::new(Vec::new()),
            next_listener: Cell::new(1),
        }
    }

    /// Registers `listener` for read readiness of `fd`. The first listener
    /// wins: returns `false` and drops `listener` if one is already set.
    pub fn on_readable<F>(&self, fd: RawFd, listener: F) -> bool
    where
        F: FnMut(RawFd) -> ListenerResult + 'static,
    {
        self.register(fd, Direction::Read, Box::new(listener))
    }

    /// Registers `listener` for write readiness of `fd`, with the same
    /// first-listener-wins rule as [`on_readable`](Self::on_readable).
    pub fn on_writable<F>(&self, fd: RawFd, listener: F) -> bool
    where
        F: FnMut(RawFd) -> ListenerResult + 'static,
    {
        self.register(fd, Direction::Write, Box::new(listener))
    }

    fn register(&self, fd: RawFd, direction: Direction, listener: StreamListener) -> bool {
        let rejected = {
            let mut streams = self.streams.borrow_mut();
            let slot = streams.entry(fd).or_default().slot_mut(direction);

            if slot.is_some() {
                Some(listener)
            } else {
                *slot = Some(Rc::new(RefCell::new(listener)));
                None
            }
        };

        match rejected {
            Some(listener) => {
                drop(listener);
                false
            }
            None => {
                debug!(fd, ?direction, "stream registered");
                true
            }
        }
    }

    /// Removes the listener for one direction; returns whether one existed.
    pub fn remove(&self, fd: RawFd, direction: Direction) -> bool {
        let removed = {
            let mut streams = self.streams.borrow_mut();
            let Some(interests) = streams.get_mut(&fd) else {
                return false;
            };

            let removed = interests.slot_mut(direction).take();
            if interests.is_empty() {
                streams.remove(&fd);
            }
            removed
        };

        // Dropped outside the borrow: the listener may own something that
        // deregisters itself on drop.
        let Some(listener) = removed else {
            return false;
        };
        drop(listener);

        debug!(fd, ?direction, "stream removed");
        true
    }

    /// Appends a listener for `signum`, installing the process handler on
    /// first use.
    pub fn on_signal<F>(&self, signum: c_int, listener: F) -> io::Result<ListenerId>
    where
        F: FnMut(c_int) -> ListenerResult + 'static,
    {
        let id = ListenerId(self.next_listener.get());
        self.next_listener.set(id.0 + 1);

        let listener: SharedSignal = Rc::new(RefCell::new(Box::new(listener)));
        let mut signals = self.signals.borrow_mut();

        match signals.get_mut(&signum) {
            Some(entry) => entry.listeners.push((id, listener)),
            None => {
                let previous = signal::install(signum)?;
                debug!(signum, "signal handler installed");
                signals.insert(
                    signum,
                    SignalEntry {
                        listeners: vec![(id, listener)],
                        previous,
                    },
                );
            }
        }

        Ok(id)
    }

    /// Removes one signal listener. The previous disposition is restored
    /// once no listener is left for `signum`.
    pub fn off_signal(&self, signum: c_int, id: ListenerId) -> bool {
        let (removed, retired) = {
            let mut signals = self.signals.borrow_mut();
            let Some(entry) = signals.get_mut(&signum) else {
                return false;
            };

            let removed = entry
                .listeners
                .iter()
                .position(|(listener, _)| *listener == id)
                .map(|index| entry.listeners.remove(index));

            let retired = if entry.listeners.is_empty() {
                signals.remove(&signum)
            } else {
                None
            };

            (removed, retired)
        };

        if let Some(entry) = &retired {
            restore(signum, &entry.previous);
            debug!(signum, "signal handler restored");
        }

        // Dropped outside the borrow, like stream listeners in `remove`.
        let found = removed.is_some();
        drop(removed);
        drop(retired);

        found
    }

    /// Whether any descriptor has a listener.
    pub fn has_streams(&self) -> bool {
        !self.streams.borrow().is_empty()
    }

    /// Whether any signal has a listener.
    pub fn has_signals(&self) -> bool {
        !self.signals.borrow().is_empty()
    }

    /// Number of registered listeners across all descriptors and directions.
    pub fn stream_count(&self) -> usize {
        self.streams
            .borrow()
            .values()
            .map(|interests| interests.read.is_some() as usize + interests.write.is_some() as usize)
            .sum()
    }

    /// Number of signal listeners across all signals.
    pub fn signal_count(&self) -> usize {
        self.signals
            .borrow()
            .values()
            .map(|entry| entry.listeners.len())
            .sum()
    }

    /// Waits for activity for at most `timeout` (`None` waits forever), then
    /// invokes every ready read listener, every ready write listener and
    /// every listener of each delivered signal, once each.
    ///
    /// Returns the number of listeners invoked. Listener failures are logged,
    /// never returned.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let has_signals = self.has_signals();

        if !self.has_streams() && !has_signals {
            idle(timeout);
            return Ok(0);
        }

        let (readable, writable) = self.poll(timeout, has_signals)?;
        let mut fired = 0;

        for (fd, listener) in readable {
            if self.is_registered(fd, Direction::Read, &listener) {
                invoke_stream(fd, Direction::Read, &listener);
                fired += 1;
            }
        }

        for (fd, listener) in writable {
            if self.is_registered(fd, Direction::Write, &listener) {
                invoke_stream(fd, Direction::Write, &listener);
                fired += 1;
            }
        }

        if has_signals {
            for signum in signal::drain() {
                fired += self.dispatch_signal(signum);
            }
        }

        Ok(fired)
    }

    fn poll(&self, timeout: Option<Duration>, has_signals: bool) -> io::Result<(Ready, Ready)> {
        let mut events = self.events.borrow_mut();
        events.clear();

        events.extend(
            self.streams
                .borrow()
                .iter()
                .map(|(&fd, interests)| Event::new(fd, interests.interest())),
        );

        let signal_fd = if has_signals { signal::read_fd() } else { None };
        if let Some(fd) = signal_fd {
            events.push(Event::new(fd, Interest { read: true, write: false }));
        }

        let ready = match event::wait(&mut events, timeout) {
            Ok(ready) => ready,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };

        let mut readable = Vec::new();
        let mut writable = Vec::new();

        if ready == 0 {
            return Ok((readable, writable));
        }

        // Declared first so dropped listeners outlive the map borrow.
        let mut stale = Vec::new();
        let mut streams = self.streams.borrow_mut();

        for event in events.iter() {
            let fd = event.fd();
            if Some(fd) == signal_fd {
                continue;
            }

            if event.is_invalid() {
                warn!(fd, "descriptor is not open, dropping its listeners");
                stale.extend(streams.remove(&fd));
                continue;
            }

            let Some(interests) = streams.get(&fd) else {
                continue;
            };

            if event.is_readable()
                && let Some(listener) = interests.slot(Direction::Read)
            {
                readable.push((fd, listener.clone()));
            }

            if event.is_writable()
                && let Some(listener) = interests.slot(Direction::Write)
            {
                writable.push((fd, listener.clone()));
            }
        }

        Ok((readable, writable))
    }

    // A listener removed (or replaced) earlier in the same wait is skipped.
    fn is_registered(&self, fd: RawFd, direction: Direction, listener: &SharedStream) -> bool {
        self.streams
            .borrow()
            .get(&fd)
            .and_then(|interests| interests.slot(direction))
            .is_some_and(|current| Rc::ptr_eq(current, listener))
    }

    fn dispatch_signal(&self, signum: c_int) -> usize {
        let listeners: Vec<(ListenerId, SharedSignal)> = match self.signals.borrow().get(&signum) {
            Some(entry) => entry.listeners.clone(),
            None => return 0,
        };

        let mut fired = 0;

        for (id, listener) in listeners {
            let still_registered = self
                .signals
                .borrow()
                .get(&signum)
                .is_some_and(|entry| entry.listeners.iter().any(|(current, _)| *current == id));

            if !still_registered {
                continue;
            }

            let Ok(mut callback) = listener.try_borrow_mut() else {
                continue;
            };

            match catch_unwind(AssertUnwindSafe(|| (*callback)(signum))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(signum, error = %err, "signal listener failed"),
                Err(payload) => {
                    let err = TaskError::from_panic(payload);
                    error!(signum, error = %err, "signal listener panicked");
                }
            }
            fired += 1;
        }

        fired
    }

    /// Drops every registration without invoking any listener and restores
    /// signal dispositions.
    pub fn close(&self) {
        let streams = std::mem::take(&mut *self.streams.borrow_mut());
        let signals = std::mem::take(&mut *self.signals.borrow_mut());

        for (signum, entry) in &signals {
            restore(*signum, &entry.previous);
        }

        if !streams.is_empty() || !signals.is_empty() {
            debug!(
                streams = streams.len(),
                signals = signals.len(),
                "multiplexer closed"
            );
        }

        // Listeners are dropped here, after the maps are released, since they
        // may own handles that touch this multiplexer on drop.
        drop(streams);
        drop(signals);
    }
}

fn invoke_stream(fd: RawFd, direction: Direction, listener: &SharedStream) {
    let Ok(mut callback) = listener.try_borrow_mut() else {
        return;
    };

    match catch_unwind(AssertUnwindSafe(|| (*callback)(fd))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(fd, ?direction, error = %err, "stream listener failed"),
        Err(payload) => {
            let err = TaskError::from_panic(payload);
            error!(fd, ?direction, error = %err, "stream listener panicked");
        }
    }
}

fn restore(signum: c_int, previous: &Disposition) {
    if let Err(err) = signal::restore(signum, previous) {
        warn!(signum, error = %err, "failed to restore signal disposition");
    }
}

fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) if timeout.is_zero() => {}
        Some(timeout) => thread::sleep(timeout),
        None => loop {
            thread::park();
        },
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("streams", &self.stream_count())
            .field("signals", &self.signal_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn close(fds: &[RawFd]) {
        for &fd in fds {
            unsafe { libc::close(fd) };
        }
    }

    #[test]
    fn registration_is_idempotent() {
        let multiplexer = Multiplexer::new();
        assert!(multiplexer.on_readable(10, |_| Ok(())));
        assert!(!multiplexer.on_readable(10, |_| Ok(())));
        assert!(multiplexer.on_writable(10, |_| Ok(())));
        assert_eq!(multiplexer.stream_count(), 2);

        assert!(multiplexer.remove(10, Direction::Read));
        assert!(!multiplexer.remove(10, Direction::Read));
        assert!(multiplexer.has_streams());
        assert!(multiplexer.remove(10, Direction::Write));
        assert!(!multiplexer.has_streams());
    }

    #[test]
    fn empty_wait_sleeps_for_timeout() {
        let multiplexer = Multiplexer::new();
        let start = Instant::now();
        assert_eq!(multiplexer.wait(Some(Duration::from_millis(20))).unwrap(), 0);
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(multiplexer.wait(Some(Duration::ZERO)).unwrap(), 0);
    }

    #[test]
    fn reads_fire_before_writes_and_errors_are_contained() {
        let multiplexer = Multiplexer::new();
        let (read_a, write_a) = pipe();
        let (read_b, write_b) = pipe();
        let order = Rc::new(RefCell::new(Vec::new()));

        unsafe { libc::write(write_a, b"x".as_ptr() as *const _, 1) };

        let log = order.clone();
        multiplexer.on_writable(write_b, move |_| {
            log.borrow_mut().push("write");
            Ok(())
        });
        let log = order.clone();
        multiplexer.on_readable(read_a, move |_| {
            log.borrow_mut().push("read");
            Err("listener error".into())
        });
        multiplexer.on_readable(read_b, |_| panic!("never readable"));

        let fired = multiplexer.wait(Some(Duration::from_millis(100))).unwrap();

        assert_eq!(fired, 2);
        assert_eq!(*order.borrow(), vec!["read", "write"]);
        close(&[read_a, write_a, read_b, write_b]);
    }

    #[test]
    fn listener_removed_mid_wait_is_skipped() {
        let multiplexer = Rc::new(Multiplexer::new());
        let (read_fd, write_fd) = pipe();
        let calls = Rc::new(Cell::new(0));

        unsafe { libc::write(write_fd, b"x".as_ptr() as *const _, 1) };

        let weak = Rc::downgrade(&multiplexer);
        let counter = calls.clone();
        multiplexer.on_readable(read_fd, move |fd| {
            counter.set(counter.get() + 1);
            if let Some(multiplexer) = weak.upgrade() {
                multiplexer.remove(fd, Direction::Read);
                multiplexer.remove(write_fd, Direction::Write);
            }
            Ok(())
        });
        multiplexer.on_writable(write_fd, |_| panic!("removed before dispatch"));

        assert_eq!(multiplexer.wait(Some(Duration::from_millis(100))).unwrap(), 1);
        assert_eq!(calls.get(), 1);
        assert!(!multiplexer.has_streams());
        close(&[read_fd, write_fd]);
    }

    /// Reads the multiplexer's registrations when dropped.
    struct Inspector {
        multiplexer: std::rc::Weak<Multiplexer>,
        drops: Rc<Cell<usize>>,
    }

    impl Drop for Inspector {
        fn drop(&mut self) {
            if let Some(multiplexer) = self.multiplexer.upgrade() {
                let _ = (multiplexer.stream_count(), multiplexer.signal_count());
            }
            self.drops.set(self.drops.get() + 1);
        }
    }

    #[test]
    fn rejected_stream_listener_drops_outside_borrow() {
        let multiplexer = Rc::new(Multiplexer::new());
        let drops = Rc::new(Cell::new(0));

        assert!(multiplexer.on_readable(11, |_| Ok(())));

        let inspector = Inspector {
            multiplexer: Rc::downgrade(&multiplexer),
            drops: drops.clone(),
        };
        assert!(!multiplexer.on_readable(11, move |_| {
            let _ = &inspector;
            Ok(())
        }));

        assert_eq!(drops.get(), 1);
        assert_eq!(multiplexer.stream_count(), 1);
    }

    #[test]
    fn removed_signal_listener_drops_outside_borrow() {
        // SIGUSR2 is never raised by this test binary.
        let multiplexer = Rc::new(Multiplexer::new());
        let drops = Rc::new(Cell::new(0));

        let listener = |drops: &Rc<Cell<usize>>| {
            let inspector = Inspector {
                multiplexer: Rc::downgrade(&multiplexer),
                drops: drops.clone(),
            };
            move |_: c_int| -> ListenerResult {
                let _ = &inspector;
                Ok(())
            }
        };

        let first = multiplexer.on_signal(libc::SIGUSR2, listener(&drops)).unwrap();
        let last = multiplexer.on_signal(libc::SIGUSR2, listener(&drops)).unwrap();

        assert!(multiplexer.off_signal(libc::SIGUSR2, first));
        assert_eq!(drops.get(), 1);
        assert!(multiplexer.has_signals());

        assert!(multiplexer.off_signal(libc::SIGUSR2, last));
        assert_eq!(drops.get(), 2);
        assert!(!multiplexer.has_signals());
        assert!(!multiplexer.off_signal(libc::SIGUSR2, last));
    }

    #[test]
    fn close_drops_without_invoking() {
        let multiplexer = Multiplexer::new();
        let (read_fd, write_fd) = pipe();
        unsafe { libc::write(write_fd, b"x".as_ptr() as *const _, 1) };

        multiplexer.on_readable(read_fd, |_| panic!("closed"));
        multiplexer.close();

        assert!(!multiplexer.has_streams());
        assert_eq!(multiplexer.wait(Some(Duration::ZERO)).unwrap(), 0);
        close(&[read_fd, write_fd]);
    }
}
