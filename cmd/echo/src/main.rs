//! Echo Server
//!
//! TCP echo server on the weave dispatcher. The listening socket is a
//! pinned sink on context 0 whose handler accepts connections and hands
//! each one to a context in turn, where a fiber echoes until EOF.
//!
//! Usage:
//!     echo [port] [seconds]
//!
//! Test with:
//!     echo "hello" | nc -q0 localhost 9999

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use weave::{kdebug, kerror, kinfo, Dispatcher, EventSink, Interest, Runtime, RuntimeConfig, SinkHandler};

const BUF_SIZE: usize = 4096;

#[derive(Default)]
struct Stats {
    accepts: AtomicU64,
    closes: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
}

struct Acceptor {
    dispatcher: Weak<Dispatcher>,
    next: AtomicU64,
    stats: Arc<Stats>,
}

impl SinkHandler for Acceptor {
    fn on_input(&self, sink: &Arc<EventSink>) {
        let Some(d) = self.dispatcher.upgrade() else { return };
        loop {
            // Safety: plain accept on a listening socket we own.
            let fd = unsafe {
                libc::accept4(
                    sink.fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    kerror!("accept: {}", err);
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                }
                return;
            }
            let owner = (self.next.fetch_add(1, Ordering::Relaxed) % d.len() as u64) as u32;
            let conn = match d.register(owner, fd, Interest::READ, true, None) {
                Ok(conn) => conn,
                Err(e) => {
                    kerror!("register fd {}: {}", fd, e);
                    // Safety: registration failed, so nobody else owns `fd`.
                    unsafe { libc::close(fd) };
                    continue;
                }
            };
            self.stats.accepts.fetch_add(1, Ordering::Relaxed);
            let stats = self.stats.clone();
            d.context(owner).spawn_fiber(move || {
                if let Err(e) = serve(&conn, &stats) {
                    kdebug!("connection fd {}: {}", conn.fd(), e);
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                }
                conn.close();
                stats.closes.fetch_add(1, Ordering::Relaxed);
                Ok(0)
            });
        }
    }

    fn on_error(&self, _sink: &Arc<EventSink>, errno: i32) {
        kerror!("listening socket failed: errno {}", errno);
    }
}

fn serve(conn: &EventSink, stats: &Stats) -> io::Result<()> {
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = conn.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        conn.write_all(&buf[..n])?;
        stats.bytes.fetch_add(n as u64, Ordering::Relaxed);
    }
}

fn setup_listener(port: u16) -> io::Result<i32> {
    // Safety: socket setup on a descriptor created here; every pointer
    // passed points at a live local.
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let opt: i32 = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const _,
            std::mem::size_of::<i32>() as u32,
        );

        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as u16;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = libc::INADDR_ANY;
        let rc = libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as u32,
        );
        if rc < 0 || libc::listen(fd, 1024) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        Ok(fd)
    }
}

fn main() {
    let mut args = std::env::args().skip(1);
    let port: u16 = args.next().and_then(|s| s.parse().ok()).unwrap_or(9999);
    let seconds: Option<u64> = args.next().and_then(|s| s.parse().ok());

    let mut runtime = match Runtime::new(RuntimeConfig::from_env()) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("runtime: {}", e);
            std::process::exit(1);
        }
    };

    let fd = match setup_listener(port) {
        Ok(fd) => fd,
        Err(e) => {
            eprintln!("listen on port {}: {}", port, e);
            std::process::exit(1);
        }
    };
    let stats = Arc::new(Stats::default());
    let acceptor = Arc::new(Acceptor {
        dispatcher: Arc::downgrade(runtime.dispatcher()),
        next: AtomicU64::new(0),
        stats: stats.clone(),
    });
    let listener = match runtime.dispatcher().register(0, fd, Interest::READ, true, Some(acceptor)) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("register listener: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.start() {
        eprintln!("start: {}", e);
        std::process::exit(1);
    }
    kinfo!("echo listening on port {} with {} contexts", port, runtime.dispatcher().len());

    let start = Instant::now();
    loop {
        std::thread::sleep(Duration::from_secs(1));
        eprintln!(
            "[{:.0}s] accepts={} closes={} bytes={} err={} sinks={}",
            start.elapsed().as_secs_f64(),
            stats.accepts.load(Ordering::Relaxed),
            stats.closes.load(Ordering::Relaxed),
            stats.bytes.load(Ordering::Relaxed),
            stats.errors.load(Ordering::Relaxed),
            runtime.dispatcher().sinks_registered(),
        );
        if seconds.is_some_and(|s| start.elapsed() >= Duration::from_secs(s)) {
            break;
        }
    }

    listener.close();
    runtime.stop();
    runtime.join();
}
