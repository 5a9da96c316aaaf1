// Kernel logging (printk) with ring buffer
// Formats into a fixed stack buffer so logging never allocates; entries are
// kept in a ring for dmesg and mirrored to the registered console sink.

use super::ringbuf::RingBuffer;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Maximum stored message length per entry.
const MSG_LEN: usize = 192;

#[derive(Copy, Clone)]
pub struct LogEntry {
    pub timestamp_us: u64,
    pub level: LogLevel,
    pub message: [u8; MSG_LEN],
    pub len: usize,
}

struct LogBuffer {
    buffer: Mutex<RingBuffer<LogEntry, 1024>>,
}

impl LogBuffer {
    const fn new() -> Self {
        Self {
            buffer: Mutex::new(RingBuffer::new()),
        }
    }
}

static KERNEL_LOG: LogBuffer = LogBuffer::new();

/// Console sink registered by the platform at boot (SBI console on RISC-V).
/// Stored as a raw fn address; zero means no console yet.
static CONSOLE_SINK: AtomicUsize = AtomicUsize::new(0);

/// Runtime log threshold; entries above it skip the console (still ring-kept).
static CONSOLE_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_console_sink(sink: fn(&[u8])) {
    CONSOLE_SINK.store(sink as usize, Ordering::Release);
}

pub fn set_console_level(level: LogLevel) {
    CONSOLE_LEVEL.store(level as u8, Ordering::Relaxed);
}

fn console_write(bytes: &[u8]) {
    let raw = CONSOLE_SINK.load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: only ever stores fn(&[u8]) addresses via set_console_sink
        let sink: fn(&[u8]) = unsafe { core::mem::transmute(raw) };
        sink(bytes);
    }
}

/// Bounded formatter writing into a fixed byte buffer, truncating on overflow.
struct FixedWriter {
    buf: [u8; MSG_LEN],
    len: usize,
}

impl Write for FixedWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let avail = MSG_LEN - self.len;
        let take = core::cmp::min(avail, s.len());
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

pub fn log(level: LogLevel, args: fmt::Arguments) {
    let mut w = FixedWriter {
        buf: [0u8; MSG_LEN],
        len: 0,
    };
    let _ = w.write_fmt(args);

    let entry = LogEntry {
        timestamp_us: crate::time::get_timestamp_us(),
        level,
        message: w.buf,
        len: w.len,
    };
    KERNEL_LOG.buffer.lock().push(entry);

    if (level as u8) <= CONSOLE_LEVEL.load(Ordering::Relaxed) {
        let mut line = FixedWriter {
            buf: [0u8; MSG_LEN],
            len: 0,
        };
        let _ = write!(line, "[{:>5}] ", level.as_str());
        console_write(&line.buf[..line.len]);
        console_write(&w.buf[..w.len]);
        console_write(b"\n");
    }
}

/// Drain the kernel log ring (dmesg).
pub fn dmesg_drain() -> alloc::vec::Vec<LogEntry> {
    KERNEL_LOG.buffer.lock().drain_all()
}

#[macro_export]
macro_rules! printk {
    ($level:expr, $($arg:tt)*) => {
        $crate::klib::printk::log($level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::printk!($crate::klib::printk::LogLevel::Error, $($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::printk!($crate::klib::printk::LogLevel::Warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::printk!($crate::klib::printk::LogLevel::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::printk!($crate::klib::printk::LogLevel::Debug, $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_lands_in_ring() {
        crate::info!("printk test entry {}", 42);
        let entries = dmesg_drain();
        assert!(entries
            .iter()
            .any(|e| core::str::from_utf8(&e.message[..e.len])
                .unwrap()
                .contains("printk test entry 42")));
    }

    #[test]
    fn long_messages_truncate() {
        let mut w = FixedWriter {
            buf: [0u8; MSG_LEN],
            len: 0,
        };
        for _ in 0..MSG_LEN {
            let _ = w.write_str("xy");
        }
        assert_eq!(w.len, MSG_LEN);
    }
}
