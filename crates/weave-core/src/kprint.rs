//! Kernel-style print macros for weave
//!
//! Leveled, lock-protected output to stderr, tagged with the index of the
//! execution context that emitted the line.
//!
//! # Environment Variables
//!
//! - `WEAVE_FLUSH_EPRINT=1` - Flush stderr after each line (handy when chasing aborts)
//! - `WEAVE_LOG_LEVEL=<level>` - off/error/warn/info/debug/trace or 0..=5
//!
//! # Usage
//!
//! ```ignore
//! use weave_core::{kdebug, kinfo, kwarn, kerror, fatal};
//!
//! kinfo!("context {} attached", index);
//! kwarn!("worker limit {} reached", max);
//! fatal!("stack mmap failed: {}", err);   // logs, then aborts
//! ```

use std::cell::Cell;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::constants::CONTEXT_NONE;

/// Log levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Parse a level name or digit; unknown strings map to `None`
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim().to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "warning" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => return None,
        })
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

thread_local! {
    static CONTEXT_TAG: Cell<u32> = const { Cell::new(CONTEXT_NONE) };
}

/// Initialize logging from environment variables.
///
/// Called lazily on first use; call explicitly for deterministic startup.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    FLUSH_ENABLED.store(crate::env::env_get_bool("WEAVE_FLUSH_EPRINT", false), Ordering::Relaxed);
    if let Some(level) = std::env::var("WEAVE_LOG_LEVEL").ok().as_deref().and_then(LogLevel::parse) {
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

#[inline]
fn ensure_init() {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
}

#[inline]
pub fn flush_enabled() -> bool {
    ensure_init();
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

#[inline]
pub fn log_level() -> LogLevel {
    ensure_init();
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level programmatically (overrides the environment)
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

/// Tag subsequent lines from this OS thread with a context index
pub fn set_context_tag(index: u32) {
    CONTEXT_TAG.with(|c| c.set(index));
}

pub fn clear_context_tag() {
    CONTEXT_TAG.with(|c| c.set(CONTEXT_NONE));
}

/// How a line is framed on stderr
enum Frame {
    Raw,
    Line,
    Leveled(&'static str),
}

fn emit(frame: Frame, args: std::fmt::Arguments<'_>, force_flush: bool) {
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    if let Frame::Leveled(prefix) = frame {
        let _ = out.write_all(prefix.as_bytes());
        let _ = out.write_all(b" ");
        let tag = CONTEXT_TAG.with(Cell::get);
        if tag != CONTEXT_NONE {
            let _ = write!(out, "[ctx {}] ", tag);
        }
    }
    let _ = out.write_fmt(args);
    if !matches!(frame, Frame::Raw) {
        let _ = out.write_all(b"\n");
    }
    if force_flush || flush_enabled() {
        let _ = out.flush();
    }
}

#[doc(hidden)]
pub fn _kprint_impl(args: std::fmt::Arguments<'_>) {
    emit(Frame::Raw, args, false);
}

#[doc(hidden)]
pub fn _kprintln_impl(args: std::fmt::Arguments<'_>) {
    emit(Frame::Line, args, false);
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if level_enabled(level) {
        emit(Frame::Leveled(level.prefix()), args, false);
    }
}

/// Log unconditionally, flush, and abort the process.
#[doc(hidden)]
pub fn _kfatal_impl(args: std::fmt::Arguments<'_>) -> ! {
    emit(Frame::Leveled("[FATAL]"), args, true);
    std::process::abort()
}

// ============================================================================
// Public Macros
// ============================================================================

#[doc(hidden)]
#[macro_export]
macro_rules! __klog {
    ($level:ident, $($arg:tt)*) => {
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::$level, format_args!($($arg)*))
    };
}

/// Print to stderr (no newline)
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::kprint::_kprint_impl(format_args!($($arg)*))
    };
}

/// Print a line to stderr
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint::_kprintln_impl(format_args!(""))
    };
    ($($arg:tt)*) => {
        $crate::kprint::_kprintln_impl(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => { $crate::__klog!(Error, $($arg)*) };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::__klog!(Warn, $($arg)*) };
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::__klog!(Info, $($arg)*) };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::__klog!(Debug, $($arg)*) };
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::__klog!(Trace, $($arg)*) };
}

/// Unrecoverable resource failure: print a diagnostic and abort.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::kprint::_kfatal_impl(format_args!($($arg)*))
    };
}
