//! Console and log routing.
//!
//! Structured logs go to the kernel ring buffer through /dev/kmsg with
//! `<prio>message` framing; a reader task drains /dev/vtty and fans the
//! output out to the configured screen, serial and redirect sinks. The
//! vtty mode (screen/serial/disabled/all) is selected with an ioctl.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use parking_lot::Mutex;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

use crate::instance::DEFAULT_TTY;
use crate::util::uptime;
use crate::vcfg::StdoutMode;

/// vtty output-mode selection ioctl.
const VTTY_IOCTL_OUTPUT: libc::c_ulong = 0x4004_2101;

const TTY_SCREEN: &str = "/dev/tty1";
const TTY_SERIAL: &str = "/dev/ttyS0";

/// Kernel log priorities. `Stderr` is not a kmsg priority; it marks
/// messages that go straight to the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogLevel {
    Emerg = 0,
    Alert = 1,
    Crit = 2,
    Err = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
    Stderr = 8,
}

/// Console sinks for the vtty fan-out.
#[derive(Clone)]
pub struct Console {
    inner: Arc<ConsoleInner>,
}

struct ConsoleInner {
    tty: Mutex<Option<File>>,
    serial: Mutex<Option<File>>,
    redir: Mutex<Option<File>>,
}

impl Console {
    pub fn new() -> Console {
        Console {
            inner: Arc::new(ConsoleInner {
                tty: Mutex::new(None),
                serial: Mutex::new(None),
                redir: Mutex::new(None),
            }),
        }
    }

    pub fn set_redir(&self, f: File) {
        *self.inner.redir.lock() = Some(f);
    }

    fn write_all_sinks(&self, buf: &[u8]) {
        for sink in [&self.inner.tty, &self.inner.serial, &self.inner.redir] {
            if let Some(f) = sink.lock().as_mut() {
                let _ = f.write_all(buf);
            }
        }
    }

    /// Apply the configured output mode: select it on the vtty device and
    /// open the matching sink files. Also points fds 1 and 2 at the vtty
    /// so everything this process prints lands there.
    pub fn setup_vtty(&self, mode: StdoutMode) {
        match OpenOptions::new().read(true).write(true).open(DEFAULT_TTY) {
            Ok(f) => {
                let m: u32 = mode.ioctl_value();
                let rc = unsafe { libc::ioctl(f.as_raw_fd(), VTTY_IOCTL_OUTPUT, &m) };
                if rc != 0 {
                    kernel_log(LogLevel::Err, "can not ioctl vtty");
                }
            }
            Err(e) => kernel_log(LogLevel::Err, &format!("can not open vtty: {}", e)),
        }

        let open_rw = |p: &str| OpenOptions::new().read(true).write(true).open(p).ok();

        let (tty, serial) = match mode {
            StdoutMode::Screen => (open_rw(TTY_SCREEN), None),
            StdoutMode::Serial => (None, open_rw(TTY_SERIAL)),
            StdoutMode::Disabled => (None, None),
            StdoutMode::Default | StdoutMode::All => (open_rw(TTY_SCREEN), open_rw(TTY_SERIAL)),
        };
        *self.inner.tty.lock() = tty;
        *self.inner.serial.lock() = serial;

        if let Ok(f) = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(DEFAULT_TTY)
        {
            let fd = f.as_raw_fd();
            unsafe {
                libc::dup2(fd, libc::STDOUT_FILENO);
                libc::dup2(fd, libc::STDERR_FILENO);
            }
        } else {
            kernel_log(LogLevel::Warning, "can not assign /dev/vtty to vinitd");
        }
    }

    /// Drain /dev/vtty and copy everything to the configured sinks. Runs
    /// until shutdown; reboot stops it.
    pub fn spawn_log_reader(&self) {
        let console = self.clone();
        std::thread::Builder::new()
            .name("vtty-fanout".into())
            .spawn(move || {
                if let Err(e) = console.fanout_loop() {
                    tracing::error!("vtty fan-out stopped: {}", e);
                }
            })
            .ok();
    }

    fn fanout_loop(&self) -> std::io::Result<()> {
        let file = File::open(DEFAULT_TTY)?;
        let fd = file.as_raw_fd();

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };

        let epoll = Epoll::new(EpollCreateFlags::empty()).map_err(std::io::Error::from)?;
        epoll
            .add(&file, EpollEvent::new(EpollFlags::EPOLLIN, fd as u64))
            .map_err(std::io::Error::from)?;

        let mut events = [EpollEvent::empty(); 32];
        let mut buf = vec![0u8; 65536];

        loop {
            let n = match epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            };

            for _ in 0..n {
                let r = unsafe {
                    libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if r > 0 {
                    self.write_all_sinks(&buf[..r as usize]);
                }
            }
        }
    }
}

impl Default for Console {
    fn default() -> Self {
        Console::new()
    }
}

/// Write one framed message into the kernel ring buffer.
pub fn kernel_log(level: LogLevel, msg: &str) {
    let Ok(mut f) = OpenOptions::new().write(true).open("/dev/kmsg") else {
        return;
    };
    let _ = f.write_all(format!("<{}>{}", level as u8, msg).as_bytes());
}

/// Boot banner line: uptime-stamped on stdout (routed to the vtty) and
/// mirrored into the kernel buffer.
pub fn announce(msg: &str) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "[{:09.6}] {}", uptime(), msg);
    kernel_log(LogLevel::Debug, msg);
}

fn level_to_prio(level: &Level) -> LogLevel {
    if *level == Level::ERROR {
        LogLevel::Err
    } else if *level == Level::WARN {
        LogLevel::Warning
    } else if *level == Level::INFO {
        LogLevel::Info
    } else {
        LogLevel::Debug
    }
}

/// Per-record writer that frames the formatted record for /dev/kmsg.
pub struct KmsgWriter {
    prio: LogLevel,
    buf: Vec<u8>,
}

impl Write for KmsgWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let msg = String::from_utf8_lossy(&self.buf);
        kernel_log(self.prio, msg.trim_end_matches('\n'));
        self.buf.clear();
        Ok(())
    }
}

impl Drop for KmsgWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[derive(Clone, Default)]
pub struct KmsgMakeWriter;

impl<'a> MakeWriter<'a> for KmsgMakeWriter {
    type Writer = KmsgWriter;

    fn make_writer(&'a self) -> Self::Writer {
        KmsgWriter {
            prio: LogLevel::Info,
            buf: Vec::new(),
        }
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        KmsgWriter {
            prio: level_to_prio(meta.level()),
            buf: Vec::new(),
        }
    }
}

/// Console threshold from /proc/sys/kernel/printk chooses how chatty the
/// subscriber is; levels beyond the threshold stay in the kernel buffer.
pub fn tracing_level_from_printk() -> Level {
    let Ok(b) = std::fs::read_to_string("/proc/sys/kernel/printk") else {
        return Level::ERROR;
    };
    let threshold: i32 = b
        .split_whitespace()
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1);

    if threshold > 6 {
        Level::DEBUG
    } else if threshold > 3 {
        Level::WARN
    } else {
        Level::ERROR
    }
}

/// Install the global subscriber writing framed records to /dev/kmsg.
pub fn init_tracing() {
    let level = tracing_level_from_printk();
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .with_target(false)
        .without_time()
        .with_writer(KmsgMakeWriter)
        .try_init();
}

/// Announce the kernel and image version strings at boot.
pub fn print_version() {
    let Ok(pv) = std::fs::read_to_string("/proc/version") else {
        return;
    };
    let version = pv.split('(').next().unwrap_or("").trim();
    let kv = std::fs::read_to_string("/proc/sys/kernel/version").unwrap_or_default();
    announce(&format!("{} ({})", kv.trim(), version));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_to_prio(&Level::ERROR), LogLevel::Err);
        assert_eq!(level_to_prio(&Level::WARN), LogLevel::Warning);
        assert_eq!(level_to_prio(&Level::INFO), LogLevel::Info);
        assert_eq!(level_to_prio(&Level::DEBUG), LogLevel::Debug);
        assert_eq!(level_to_prio(&Level::TRACE), LogLevel::Debug);
    }

    #[test]
    fn test_kmsg_writer_buffers_until_flush() {
        let mut w = KmsgWriter {
            prio: LogLevel::Info,
            buf: Vec::new(),
        };
        w.write_all(b"hello ").unwrap();
        w.write_all(b"world\n").unwrap();
        assert_eq!(w.buf, b"hello world\n");
        // flush on a machine without /dev/kmsg write access must not fail
        w.flush().unwrap();
        assert!(w.buf.is_empty());
    }
}
