//! Linux epoll backend
//!
//! Descriptors are registered edge-triggered (optionally oneshot). The
//! wakeup channel is an eventfd registered level-triggered under token 0
//! and drained whenever it is reported, so a notify that lands outside a
//! poll still cuts the next poll short.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;

use super::{bits, BackendEvent, EventBackend, Interest};

/// Reports collected per `epoll_wait`
const EVENTS_PER_WAIT: usize = 64;

const NOTIFY_TOKEN: u64 = 0;

pub struct EpollBackend {
    epfd: RawFd,
    eventfd: RawFd,
}

impl EpollBackend {
    pub fn new() -> io::Result<Self> {
        let epfd = Errno::result(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let eventfd = match Errno::result(unsafe {
            libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC)
        }) {
            Ok(fd) => fd,
            Err(e) => {
                unsafe { libc::close(epfd) };
                return Err(e.into());
            }
        };
        let backend = EpollBackend { epfd, eventfd };
        backend.ctl(libc::EPOLL_CTL_ADD, eventfd, libc::EPOLLIN as u32, NOTIFY_TOKEN)?;
        Ok(backend)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: token };
        Errno::result(unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) })?;
        Ok(())
    }

    fn interest_flags(interest: Interest) -> u32 {
        let mut flags = (libc::EPOLLET | libc::EPOLLRDHUP) as u32;
        if interest.readable {
            flags |= libc::EPOLLIN as u32;
        }
        if interest.writable {
            flags |= libc::EPOLLOUT as u32;
        }
        if interest.oneshot {
            flags |= libc::EPOLLONESHOT as u32;
        }
        flags
    }

    fn event_bits(events: u32) -> usize {
        let mut out = 0;
        if events & libc::EPOLLIN as u32 != 0 {
            out |= bits::IN;
        }
        if events & libc::EPOLLOUT as u32 != 0 {
            out |= bits::OUT;
        }
        if events & libc::EPOLLRDHUP as u32 != 0 {
            out |= bits::IN_CLOSED;
        }
        if events & libc::EPOLLHUP as u32 != 0 {
            out |= bits::IN_CLOSED | bits::OUT_CLOSED;
        }
        if events & libc::EPOLLERR as u32 != 0 {
            out |= bits::ERR;
        }
        out
    }

    fn drain_notify(&self) {
        let mut counter: u64 = 0;
        // EAGAIN means someone else already drained it.
        unsafe {
            libc::read(
                self.eventfd,
                &mut counter as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }

    fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
        match timeout {
            None => -1,
            Some(d) => {
                // Round up so a short timer deadline is not polled early.
                let ms = d.as_micros().div_ceil(1000);
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
        }
    }
}

impl EventBackend for EpollBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        debug_assert_ne!(token as u64, NOTIFY_TOKEN);
        self.ctl(libc::EPOLL_CTL_ADD, fd, Self::interest_flags(interest), token as u64)
    }

    fn rearm(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Self::interest_flags(interest), token as u64)
    }

    fn unregister(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    fn poll(&self, events: &mut Vec<BackendEvent>, timeout: Option<Duration>) -> io::Result<usize> {
        let mut raw = [libc::epoll_event { events: 0, u64: 0 }; EVENTS_PER_WAIT];
        let ret = unsafe {
            libc::epoll_wait(
                self.epfd,
                raw.as_mut_ptr(),
                EVENTS_PER_WAIT as libc::c_int,
                Self::timeout_ms(timeout),
            )
        };
        let n = match Errno::result(ret) {
            Ok(n) => n as usize,
            Err(Errno::EINTR) => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let before = events.len();
        for ev in &raw[..n] {
            let (token, flags) = (ev.u64, ev.events);
            if token == NOTIFY_TOKEN {
                self.drain_notify();
                continue;
            }
            events.push(BackendEvent { token: token as usize, bits: Self::event_bits(flags) });
        }
        Ok(events.len() - before)
    }

    fn notify(&self) -> io::Result<()> {
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.eventfd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        match Errno::result(ret) {
            // A saturated counter already guarantees a wakeup.
            Ok(_) | Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.eventfd);
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_readable_edge() {
        let backend = EpollBackend::new().unwrap();
        let (rd, wr) = pipe();
        backend.register(rd, 0x1000, Interest::READ).unwrap();

        let mut events = Vec::new();
        assert_eq!(backend.poll(&mut events, Some(Duration::ZERO)).unwrap(), 0);

        assert_eq!(unsafe { libc::write(wr, b"x".as_ptr() as *const libc::c_void, 1) }, 1);
        assert_eq!(backend.poll(&mut events, Some(Duration::from_secs(1))).unwrap(), 1);
        assert_eq!(events[0].token, 0x1000);
        assert_ne!(events[0].bits & bits::IN, 0);

        // Edge-triggered: no new data, no new report.
        events.clear();
        assert_eq!(backend.poll(&mut events, Some(Duration::ZERO)).unwrap(), 0);

        unsafe { libc::close(wr) };
        assert_eq!(backend.poll(&mut events, Some(Duration::from_secs(1))).unwrap(), 1);
        assert_ne!(events[0].bits & bits::IN_CLOSED, 0);

        backend.unregister(rd).unwrap();
        unsafe { libc::close(rd) };
    }

    #[test]
    fn test_oneshot_needs_rearm() {
        let backend = EpollBackend::new().unwrap();
        let (rd, wr) = pipe();
        let interest = Interest::READ.oneshot();
        backend.register(rd, 0x2000, interest).unwrap();

        let mut events = Vec::new();
        unsafe { libc::write(wr, b"a".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(backend.poll(&mut events, Some(Duration::from_secs(1))).unwrap(), 1);

        events.clear();
        unsafe { libc::write(wr, b"b".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(backend.poll(&mut events, Some(Duration::ZERO)).unwrap(), 0);

        backend.rearm(rd, 0x2000, interest).unwrap();
        assert_eq!(backend.poll(&mut events, Some(Duration::from_secs(1))).unwrap(), 1);

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn test_notify_coalesces() {
        let backend = EpollBackend::new().unwrap();
        for _ in 0..3 {
            backend.notify().unwrap();
        }
        let mut events = Vec::new();
        assert_eq!(backend.poll(&mut events, Some(Duration::from_secs(1))).unwrap(), 0);
        // Drained: the next zero-timeout poll sees nothing.
        let start = std::time::Instant::now();
        backend.poll(&mut events, Some(Duration::from_millis(20))).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_timeout_rounds_up() {
        assert_eq!(EpollBackend::timeout_ms(None), -1);
        assert_eq!(EpollBackend::timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(EpollBackend::timeout_ms(Some(Duration::from_micros(1))), 1);
        assert_eq!(EpollBackend::timeout_ms(Some(Duration::from_micros(1500))), 2);
    }
}
