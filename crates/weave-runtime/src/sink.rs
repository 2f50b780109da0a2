//! Event sinks: a registered file descriptor and its readiness state
//!
//! A sink belongs to one context at a time (its owner). Readiness
//! reported by the backend is applied on the owner only; any other
//! poller forwards it. Applying readiness either wakes a fiber blocked
//! in [`EventSink::read`] / [`EventSink::write`], or queues an I/O task
//! that calls the sink's [`SinkHandler`].
//!
//! Unpinned sinks follow their I/O tasks: when the balancer moves such a
//! task to another context, ownership of the sink moves with it (only
//! while nothing is waiting on it and no event is in flight).
//!
//! Sinks are 64-byte aligned so that a forwarded event fits in one word:
//! `sink address | readiness bits`.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use weave_core::constants::CALL_ARGS;
use weave_core::{kdebug, kwarn, FiberId, Task, TaskRoutine};

use crate::backend::{bits, Interest};
use crate::context::Context;
use crate::dispatcher::Dispatcher;
use crate::tls;

/// Callbacks run from I/O tasks on the owning context
pub trait SinkHandler: Send + Sync {
    fn on_input(&self, sink: &Arc<EventSink>);

    fn on_output(&self, _sink: &Arc<EventSink>) {}

    /// The descriptor reported an error; the sink is already
    /// unregistered
    fn on_error(&self, _sink: &Arc<EventSink>, _errno: i32) {}
}

const NO_WAITER: u64 = FiberId::NONE.to_word();

const DIR_INPUT: usize = 0;
const DIR_OUTPUT: usize = 1;
const DIR_ERROR: usize = 2;
const DIR_MASK: usize = 3;

#[repr(align(64))]
pub struct EventSink {
    fd: RawFd,
    interest: Interest,
    pinned: bool,
    owner: AtomicU32,
    ready: AtomicUsize,
    input_waiter: AtomicU64,
    output_waiter: AtomicU64,
    dispatched: AtomicU64,
    completed: AtomicU64,
    closed: AtomicBool,
    /// errno of the failure that broke the sink, 0 while healthy
    broken: AtomicI32,
    retire_pending: AtomicBool,
    retired: AtomicBool,
    handler: Option<Arc<dyn SinkHandler>>,
    dispatcher: Weak<Dispatcher>,
}

impl EventSink {
    pub(crate) fn new(
        owner: u32,
        fd: RawFd,
        interest: Interest,
        pinned: bool,
        handler: Option<Arc<dyn SinkHandler>>,
        dispatcher: Weak<Dispatcher>,
    ) -> Arc<Self> {
        Arc::new(EventSink {
            fd,
            interest,
            pinned,
            owner: AtomicU32::new(owner),
            ready: AtomicUsize::new(0),
            input_waiter: AtomicU64::new(NO_WAITER),
            output_waiter: AtomicU64::new(NO_WAITER),
            dispatched: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            broken: AtomicI32::new(0),
            retire_pending: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            handler,
            dispatcher,
        })
    }

    /// Backend token: the sink's address
    #[inline]
    pub fn token(&self) -> usize {
        self as *const EventSink as usize
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn interest(&self) -> Interest {
        self.interest
    }

    #[inline]
    pub fn owner(&self) -> u32 {
        self.owner.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Readiness bits seen and not yet consumed
    #[inline]
    pub fn ready(&self) -> usize {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The errno that broke the sink, if any
    pub fn error(&self) -> Option<i32> {
        match self.broken.load(Ordering::Acquire) {
            0 => None,
            errno => Some(errno),
        }
    }

    /// True while a reported event has not been handled yet
    pub fn in_flight(&self) -> bool {
        self.dispatched.load(Ordering::Acquire) != self.completed.load(Ordering::Acquire)
    }

    /// Another strong reference to a sink known to live in an `Arc`
    fn arc(&self) -> Arc<EventSink> {
        // Safety: sinks are only ever created by `new`, inside an `Arc`,
        // and `&self` proves one strong reference is alive.
        unsafe {
            Arc::increment_strong_count(self as *const EventSink);
            Arc::from_raw(self as *const EventSink)
        }
    }

    // ---------------------------------------------------------------
    // Event path
    // ---------------------------------------------------------------

    #[inline]
    pub(crate) fn note_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::AcqRel);
    }

    /// Apply readiness on `ctx`; forwards again if ownership moved
    pub(crate) fn on_events(&self, ctx: &Context, ready: usize) {
        let owner = self.owner();
        if owner != ctx.index() {
            let word = self.token() | (ready & bits::MASK);
            ctx.dispatcher().context(owner).call(handle_forwarded, [word, 0, 0, 0, 0, 0]);
            return;
        }
        if !self.is_closed() && self.error().is_none() {
            self.apply(ctx, ready);
        }
        self.complete(ctx);
    }

    fn apply(&self, ctx: &Context, ready: usize) {
        if ready & bits::ERR != 0 {
            self.fail(ctx, socket_error(self.fd));
            return;
        }
        self.ready.fetch_or(ready, Ordering::AcqRel);
        if ready & (bits::IN | bits::IN_CLOSED) != 0 {
            self.wake_waiter(ctx, &self.input_waiter);
            if self.handler.is_some() && self.interest.readable {
                ctx.add_task(self.io_task(DIR_INPUT));
            }
        }
        if ready & (bits::OUT | bits::OUT_CLOSED) != 0 {
            self.wake_waiter(ctx, &self.output_waiter);
            if self.handler.is_some() && self.interest.writable {
                ctx.add_task(self.io_task(DIR_OUTPUT));
            }
        }
    }

    /// Mark broken, stop reporting and tell everyone waiting
    fn fail(&self, ctx: &Context, errno: i32) {
        if self.broken.swap(errno, Ordering::AcqRel) != 0 {
            return;
        }
        kdebug!("sink fd {} broken: errno {}", self.fd, errno);
        if let Err(e) = ctx.dispatcher().backend().unregister(self.fd) {
            kwarn!("unregister fd {} failed: {}", self.fd, e);
        }
        self.wake_waiter(ctx, &self.input_waiter);
        self.wake_waiter(ctx, &self.output_waiter);
        if self.handler.is_some() {
            ctx.add_task(self.io_task(DIR_ERROR));
        }
    }

    fn complete(&self, ctx: &Context) {
        self.completed.fetch_add(1, Ordering::AcqRel);
        self.try_retire(ctx);
    }

    fn wake_waiter(&self, ctx: &Context, waiter: &AtomicU64) {
        let word = waiter.swap(NO_WAITER, Ordering::AcqRel);
        if word != NO_WAITER {
            ctx.strand().run(FiberId::from_word(word));
        }
    }

    fn io_task(&self, direction: usize) -> Task {
        let ptr = Arc::into_raw(self.arc()) as usize;
        Task::new(&IO_TASK, ptr | direction)
    }

    /// Pretend the backend reported input readiness
    pub fn trigger_input(&self) {
        self.trigger(bits::IN);
    }

    /// Pretend the backend reported output readiness
    pub fn trigger_output(&self) {
        self.trigger(bits::OUT);
    }

    fn trigger(&self, ready: usize) {
        self.note_dispatched();
        match tls::context() {
            Some(ctx) if ctx.index() == self.owner() && self.same_runtime(ctx) => self.on_events(ctx, ready),
            _ => match self.dispatcher.upgrade() {
                Some(d) => {
                    let word = self.token() | ready;
                    d.context(self.owner()).call(handle_forwarded, [word, 0, 0, 0, 0, 0]);
                }
                None => {
                    self.completed.fetch_add(1, Ordering::AcqRel);
                }
            },
        }
    }

    fn same_runtime(&self, ctx: &Context) -> bool {
        core::ptr::eq(self.dispatcher.as_ptr(), ctx.dispatcher())
    }

    // ---------------------------------------------------------------
    // Closing
    // ---------------------------------------------------------------

    /// Unregister and retire the sink. Runs on the owner; from anywhere
    /// else the request is forwarded. The descriptor itself is closed
    /// when the last reference goes away.
    pub fn close(&self) {
        match tls::context() {
            Some(ctx) if ctx.index() == self.owner() && self.same_runtime(ctx) => self.close_local(ctx),
            _ => {
                if let Some(d) = self.dispatcher.upgrade() {
                    let ptr = Arc::into_raw(self.arc()) as usize;
                    d.context(self.owner()).call(close_forwarded, [ptr, 0, 0, 0, 0, 0]);
                }
            }
        }
    }

    fn close_local(&self, ctx: &Context) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.error().is_none() {
            if let Err(e) = ctx.dispatcher().backend().unregister(self.fd) {
                kwarn!("unregister fd {} failed: {}", self.fd, e);
            }
        }
        self.wake_waiter(ctx, &self.input_waiter);
        self.wake_waiter(ctx, &self.output_waiter);
        self.retire_pending.store(true, Ordering::Release);
        self.try_retire(ctx);
    }

    fn try_retire(&self, ctx: &Context) {
        if !self.retire_pending.load(Ordering::Acquire) || self.in_flight() {
            return;
        }
        if !self.retired.swap(true, Ordering::AcqRel) {
            ctx.listener().retire(ctx, self.token());
        }
    }

    // ---------------------------------------------------------------
    // Blocking I/O for fibers
    // ---------------------------------------------------------------

    /// Read without blocking; `WouldBlock` when nothing is buffered
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_usable()?;
        self.ready.fetch_and(!bits::IN, Ordering::AcqRel);
        // Safety: `buf` is valid for `buf.len()` bytes.
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Write without blocking; `WouldBlock` when the descriptor is full
    pub fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        self.check_usable()?;
        self.ready.fetch_and(!bits::OUT, Ordering::AcqRel);
        // Safety: `buf` is valid for `buf.len()` bytes.
        let n = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Read, blocking the calling fiber until data (or EOF) arrives
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.try_read(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait(DIR_INPUT)?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                other => return other,
            }
        }
    }

    /// Write, blocking the calling fiber until some bytes are accepted
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.try_write(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait(DIR_OUTPUT)?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                other => return other,
            }
        }
    }

    /// Write all of `buf`
    pub fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf)? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    fn check_usable(&self) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        match self.error() {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(()),
        }
    }

    fn wait(&self, direction: usize) -> io::Result<()> {
        let ctx = tls::context().ok_or(io::ErrorKind::Unsupported)?;
        if ctx.index() != self.owner() {
            return Err(io::Error::new(io::ErrorKind::Other, "sink is owned by another context"));
        }
        let strand = ctx.strand();
        if strand.in_master() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let (waiter, bit) = match direction {
            DIR_INPUT => (&self.input_waiter, bits::IN | bits::IN_CLOSED),
            _ => (&self.output_waiter, bits::OUT | bits::OUT_CLOSED),
        };
        if self.ready() & bit != 0 {
            return Ok(());
        }
        waiter.store(strand.current_id().to_word(), Ordering::Release);
        if self.interest.oneshot {
            if let Err(e) = ctx.dispatcher().backend().rearm(self.fd, self.token(), self.interest) {
                waiter.store(NO_WAITER, Ordering::Release);
                return Err(e);
            }
        }
        strand.block();
        waiter.store(NO_WAITER, Ordering::Release);
        strand.testcancel().map_err(|_| io::Error::from(io::ErrorKind::Interrupted))
    }
}

impl Drop for EventSink {
    fn drop(&mut self) {
        // Safety: the sink owns its descriptor.
        unsafe { libc::close(self.fd) };
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("fd", &self.fd)
            .field("owner", &self.owner())
            .field("ready", &self.ready())
            .field("closed", &self.is_closed())
            .field("error", &self.error())
            .finish()
    }
}

fn socket_error(fd: RawFd) -> i32 {
    let mut errno: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // Safety: both out-pointers are valid for their sizes.
    let rc = unsafe {
        libc::getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR, (&mut errno as *mut libc::c_int).cast(), &mut len)
    };
    if rc == 0 && errno != 0 {
        errno
    } else {
        libc::EIO
    }
}

// -------------------------------------------------------------------
// I/O tasks
// -------------------------------------------------------------------

static IO_TASK: TaskRoutine = TaskRoutine {
    execute: io_execute,
    complete: TaskRoutine::complete_noop,
    reassign: io_reassign,
    discard: io_discard,
};

/// Split a task arg back into the sink and the direction
///
/// # Safety
///
/// `arg` must come from `EventSink::io_task` and be consumed once.
unsafe fn io_decode(arg: usize) -> (Arc<EventSink>, usize) {
    (Arc::from_raw((arg & !DIR_MASK) as *const EventSink), arg & DIR_MASK)
}

fn io_execute(arg: usize) -> usize {
    // Safety: tasks are run once.
    let (sink, direction) = unsafe { io_decode(arg) };
    let Some(ctx) = tls::context() else {
        return 0;
    };
    let owner = sink.owner();
    if owner != ctx.index() {
        let arg = Arc::into_raw(sink) as usize | direction;
        ctx.dispatcher().context(owner).send_task(Task::new(&IO_TASK, arg));
        return 0;
    }
    let Some(handler) = sink.handler.clone() else {
        return 0;
    };
    match direction {
        DIR_ERROR => handler.on_error(&sink, sink.error().unwrap_or(libc::EIO)),
        _ if sink.is_closed() || sink.error().is_some() => {}
        DIR_INPUT => handler.on_input(&sink),
        _ => handler.on_output(&sink),
    }
    0
}

fn io_reassign(arg: usize, target: u32) -> bool {
    // Safety: the task still holds its reference.
    let sink = unsafe { &*((arg & !DIR_MASK) as *const EventSink) };
    let movable = !sink.pinned
        && !sink.is_closed()
        && sink.error().is_none()
        && !sink.in_flight()
        && sink.input_waiter.load(Ordering::Acquire) == NO_WAITER
        && sink.output_waiter.load(Ordering::Acquire) == NO_WAITER;
    if movable {
        sink.owner.store(target, Ordering::Release);
    }
    movable
}

fn io_discard(arg: usize) {
    // Safety: the task is dropped unexecuted, exactly once.
    drop(unsafe { io_decode(arg) });
}

// -------------------------------------------------------------------
// Call routines
// -------------------------------------------------------------------

/// Up to six forwarded events, `sink | bits` each; zero ends the batch
pub(crate) fn handle_forwarded(ctx: &Context, args: &[usize; CALL_ARGS]) {
    for &word in args.iter().take_while(|w| **w != 0) {
        // Safety: the forwarder raised `dispatched`, which keeps the sink
        // registered until this event completes.
        let sink = unsafe { &*((word & !bits::MASK) as *const EventSink) };
        sink.on_events(ctx, word & bits::MASK);
    }
}

fn close_forwarded(ctx: &Context, args: &[usize; CALL_ARGS]) {
    // Safety: produced by `EventSink::close` with one strong reference.
    let sink = unsafe { Arc::from_raw(args[0] as *const EventSink) };
    if sink.owner() != ctx.index() {
        ctx.dispatcher().context(sink.owner()).call(close_forwarded, [Arc::into_raw(sink) as usize, 0, 0, 0, 0, 0]);
        return;
    }
    sink.close_local(ctx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        // Safety: `fds` has room for two descriptors.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn dispatcher(contexts: usize) -> Arc<Dispatcher> {
        Dispatcher::new(RuntimeConfig::new().contexts(contexts).workers_min(1).stack_size(64 * 1024)).unwrap()
    }

    fn step_until(d: &Dispatcher, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            if Instant::now() > deadline {
                return false;
            }
            for ctx in d.contexts() {
                ctx.step();
            }
        }
        true
    }

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<(u32, &'static str)>>,
    }

    impl SinkHandler for Recorder {
        fn on_input(&self, sink: &Arc<EventSink>) {
            let mut buf = [0u8; 64];
            // Drain so the next edge is reported.
            while let Ok(n) = sink.try_read(&mut buf) {
                if n == 0 {
                    break;
                }
            }
            self.log.lock().unwrap().push((tls::context_index().unwrap_or(u32::MAX), "input"));
        }

        fn on_error(&self, _sink: &Arc<EventSink>, _errno: i32) {
            self.log.lock().unwrap().push((tls::context_index().unwrap_or(u32::MAX), "error"));
        }
    }

    #[test]
    fn test_input_runs_handler_on_owner() {
        let d = dispatcher(2);
        let (r, w) = pipe();
        let rec = Arc::new(Recorder::default());
        let sink = d.context(1).register_fd(r, Interest::READ, true, Some(rec.clone())).unwrap();

        // Safety: plain write to our own pipe.
        assert_eq!(unsafe { libc::write(w, b"ping".as_ptr().cast(), 4) }, 4);
        assert!(step_until(&d, || !rec.log.lock().unwrap().is_empty()));
        assert_eq!(rec.log.lock().unwrap()[0], (1, "input"));
        assert!(!sink.in_flight());

        sink.close();
        assert!(step_until(&d, || sink.is_closed()));
        // Safety: closing our own write end.
        unsafe { libc::close(w) };
    }

    #[test]
    fn test_trigger_input_from_foreign_thread() {
        let d = dispatcher(2);
        let (r, w) = pipe();
        let rec = Arc::new(Recorder::default());
        let sink = d.context(0).register_fd(r, Interest::READ, true, Some(rec.clone())).unwrap();
        sink.trigger_input();
        assert!(sink.in_flight());
        assert!(step_until(&d, || !rec.log.lock().unwrap().is_empty()));
        assert_eq!(rec.log.lock().unwrap()[0].0, 0);
        // Safety: closing our own write end.
        unsafe { libc::close(w) };
        sink.close();
    }

    /// Error readiness unregisters the sink and reaches the handler
    #[test]
    fn test_error_path() {
        let d = dispatcher(1);
        let (r, w) = pipe();
        let rec = Arc::new(Recorder::default());
        let ctx = d.context(0);
        let sink = ctx.register_fd(r, Interest::READ, true, Some(rec.clone())).unwrap();
        {
            let _a = ctx.attach();
            sink.note_dispatched();
            sink.on_events(ctx, bits::ERR);
        }
        assert_eq!(sink.error(), Some(libc::EIO));
        assert!(step_until(&d, || rec.log.lock().unwrap().iter().any(|e| e.1 == "error")));
        let mut buf = [0u8; 4];
        assert_eq!(sink.read(&mut buf).unwrap_err().raw_os_error(), Some(libc::EIO));
        // Safety: closing our own write end.
        unsafe { libc::close(w) };
    }

    /// A fiber blocked in read is woken by readiness; close wakes it with EBADF
    #[test]
    fn test_fiber_read_blocks_until_data() {
        let d = dispatcher(1);
        let (r, w) = pipe();
        let ctx = d.context(0);
        let sink = ctx.register_fd(r, Interest::READ, true, None).unwrap();
        let got = Arc::new(Mutex::new(Vec::new()));
        {
            let sink = sink.clone();
            let got = got.clone();
            ctx.spawn_fiber(move || {
                let mut buf = [0u8; 16];
                loop {
                    match sink.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => got.lock().unwrap().extend_from_slice(&buf[..n]),
                        Err(e) => {
                            got.lock().unwrap().push(e.raw_os_error().unwrap_or(0) as u8);
                            break;
                        }
                    }
                }
                Ok(0)
            });
        }
        for _ in 0..3 {
            ctx.step();
        }
        assert!(got.lock().unwrap().is_empty());

        // Safety: plain write to our own pipe.
        unsafe { libc::write(w, b"abc".as_ptr().cast(), 3) };
        assert!(step_until(&d, || got.lock().unwrap().len() == 3));
        assert_eq!(&got.lock().unwrap()[..], b"abc");

        sink.close();
        assert!(step_until(&d, || got.lock().unwrap().len() == 4));
        assert_eq!(got.lock().unwrap()[3], libc::EBADF as u8);
        // Safety: closing our own write end.
        unsafe { libc::close(w) };
    }

    /// A closed sink is freed once its epoch is safe and nothing is in flight
    #[test]
    fn test_closed_sink_is_reclaimed() {
        let d = dispatcher(2);
        let (r, w) = pipe();
        let sink = d.context(1).register_fd(r, Interest::READ, false, None).unwrap();
        let weak = Arc::downgrade(&sink);
        assert_eq!(d.sinks_registered(), 1);

        // A forwarded event is in flight when the close lands.
        sink.trigger_input();
        sink.close();
        drop(sink);
        assert!(step_until(&d, || d.sinks_registered() == 0));
        assert!(weak.upgrade().is_none());
        // Safety: closing our own write end.
        unsafe { libc::close(w) };
    }
}
