//! Power management: signal handlers, the power-button watcher and the
//! shutdown sequence.
//!
//! Pid 1 never exits. Every path out of the VM funnels into `shutdown`,
//! which terminates the workload, syncs, flushes the boot disk and issues
//! the reboot syscall.

use std::os::fd::AsRawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::reboot::{reboot, set_cad_enabled, RebootMode};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::console::announce;
use crate::disk::flush_disk;
use crate::instance::Vinitd;
use crate::vcfg::boot_disk;

pub const SBIN_POWEROFF: &str = "/sbin/poweroff";
pub const SBIN_REBOOT: &str = "/sbin/reboot";
const INIT_BINARY: &str = "/vorteil/vinitd";

const DEFAULT_TERMINATE_WAIT_MS: u64 = 3000;
const LOG_DRAIN_SLEEP: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootAction {
    PowerOff,
    Restart,
}

/// Send every program its configured terminate signal in parallel and
/// wait up to the configured grace period for them to exit.
fn send_terminate_signals(v: &Arc<Vinitd>) {
    let programs = v.programs.read().clone();

    for p in programs.iter() {
        let Some(pid) = p.pid() else {
            continue;
        };
        if p.has_exited() {
            continue;
        }

        announce(&format!(
            "program[{}] pid[{}] - sending signal '{:?}'",
            p.index, pid, p.terminate
        ));

        if let Err(e) = kill(Pid::from_raw(pid), p.terminate) {
            tracing::error!("could not send terminate signal to {}: {}", pid, e);
        }
    }

    let wait_ms = {
        let w = v.vcfg.read().system.terminate_wait;
        if w == 0 { DEFAULT_TERMINATE_WAIT_MS } else { w }
    };

    let deadline = Instant::now() + Duration::from_millis(wait_ms);
    loop {
        let all_done = programs
            .iter()
            .all(|p| p.pid().is_none() || p.has_exited());
        if all_done {
            announce("applications terminated");
            return;
        }
        if Instant::now() >= deadline {
            tracing::warn!("could not terminate all applications before timeout");
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Interrupt then terminate everything except pid 1 and the kernel
/// threads.
fn kill_all() {
    let Ok(procs) = procfs::process::all_processes() else {
        tracing::error!("can not get processes");
        return;
    };

    for p in procs.filter_map(|p| p.ok()) {
        let Ok(stat) = p.stat() else {
            continue;
        };
        if stat.pid > 2 && stat.ppid > 2 {
            let pid = Pid::from_raw(stat.pid);
            let _ = kill(pid, Signal::SIGINT);
            let _ = kill(pid, Signal::SIGTERM);
        }
    }
}

/// Orderly power-off or reboot. Runs at most once; later calls no-op.
pub fn shutdown(v: &Arc<Vinitd>, action: RebootAction) {
    if !v.try_enter_poweroff() {
        return;
    }

    announce("shutting down applications");

    if !v.instant_shutdown.load(Ordering::SeqCst) {
        send_terminate_signals(v);
    }

    kill_all();

    announce("shutting down system");

    let firecracker = v.is_firecracker.load(Ordering::SeqCst);

    // give the console sinks a moment to drain
    if !firecracker {
        std::thread::sleep(LOG_DRAIN_SLEEP);
    }

    let _ = std::fs::write("/proc/sysrq-trigger", "s");
    let _ = std::fs::write("/proc/sysrq-trigger", "u");

    match boot_disk() {
        Ok(disk) => flush_disk(&disk),
        Err(e) => tracing::error!("could not get disk name: {}", e),
    }

    // firecracker treats restart as power-off and knows nothing else
    let mode = if firecracker {
        RebootMode::RB_AUTOBOOT
    } else {
        match action {
            RebootAction::PowerOff => RebootMode::RB_POWER_OFF,
            RebootAction::Restart => RebootMode::RB_AUTOBOOT,
        }
    };

    let _ = reboot(mode);
}

/// Log the failure and power the machine off. The boot orchestrator
/// calls this on any fatal error.
pub fn system_panic(v: &Arc<Vinitd>, msg: &str) {
    tracing::error!("{}", msg);
    announce(msg);
    shutdown(v, RebootAction::PowerOff);
}

/// SIGINT reboots, SIGPWR powers off.
pub async fn wait_for_signal(v: Arc<Vinitd>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("can not install SIGINT handler: {}", e);
            return;
        }
    };
    let mut sigpwr = match signal(SignalKind::from_raw(libc::SIGPWR)) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("can not install SIGPWR handler: {}", e);
            return;
        }
    };

    let action = tokio::select! {
        _ = sigint.recv() => RebootAction::Restart,
        _ = sigpwr.recv() => RebootAction::PowerOff,
    };

    announce("got power signal");
    tokio::task::spawn_blocking(move || shutdown(&v, action))
        .await
        .ok();
}

/// Event handler names for the power button from
/// /proc/bus/input/devices.
pub fn power_button_handlers(devices: &str) -> Vec<String> {
    let mut in_power_stanza = false;

    for line in devices.lines() {
        if line.contains("Power Button") {
            in_power_stanza = true;
        }
        if in_power_stanza && line.contains("Handlers=") {
            let Some((_, handlers)) = line.split_once("Handlers=") else {
                return Vec::new();
            };
            return handlers
                .split_whitespace()
                .filter(|s| s.starts_with("event"))
                .map(|s| s.to_string())
                .collect();
        }
    }

    Vec::new()
}

fn watch_power_event_file(v: Arc<Vinitd>, name: String) {
    let path = format!("/dev/input/{}", name);
    let file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!("can not listen to power off (dev): {}", e);
            return;
        }
    };

    let epoll = match Epoll::new(EpollCreateFlags::empty()) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!("can not listen to power off (epoll): {}", e);
            return;
        }
    };

    let event = EpollEvent::new(EpollFlags::EPOLLIN, file.as_raw_fd() as u64);
    if let Err(e) = epoll.add(&file, event) {
        tracing::warn!("can not listen to power off (epolladd): {}", e);
        return;
    }

    let mut events = [EpollEvent::empty(); 1];
    loop {
        match epoll.wait(&mut events, EpollTimeout::NONE) {
            Ok(n) if n == 1 && events[0].events().contains(EpollFlags::EPOLLIN) => {
                // any readable event on the power button means power off
                shutdown(&v, RebootAction::PowerOff);
            }
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(_) => return,
        }
    }
}

/// Find the ACPI power button device and watch it for presses.
pub fn listen_to_power_event(v: Arc<Vinitd>) {
    std::thread::Builder::new()
        .name("power-button".into())
        .spawn(move || {
            let devices = match std::fs::read_to_string("/proc/bus/input/devices") {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!("can not listen to power off (devices): {}", e);
                    return;
                }
            };

            let handlers = power_button_handlers(&devices);
            if handlers.is_empty() {
                tracing::warn!("can not listen to power off (handlers): no handler");
                return;
            }

            for name in handlers {
                let v = v.clone();
                std::thread::Builder::new()
                    .name(format!("power-{}", name))
                    .spawn(move || watch_power_event_file(v, name))
                    .ok();
            }
        })
        .ok();
}

/// Symlink /sbin/poweroff and /sbin/reboot at the init binary so the
/// usual tools trigger an orderly shutdown.
pub fn prep_sbin_power() {
    if !std::path::Path::new("/sbin").exists() {
        if let Err(e) = std::fs::create_dir("/sbin") {
            tracing::warn!("can not prepare /sbin: {}", e);
            return;
        }
    }

    for name in [SBIN_POWEROFF, SBIN_REBOOT] {
        tracing::debug!("linking {}", name);
        let _ = std::fs::remove_file(name);
        if let Err(e) = std::os::unix::fs::symlink(INIT_BINARY, name) {
            tracing::warn!("can not link {}: {}", name, e);
        }
    }
}

/// Keep Ctrl-Alt-Del from bypassing the signal handler.
pub fn disable_cad() {
    if let Err(e) = set_cad_enabled(false) {
        tracing::warn!("can not disable ctrl-alt-del: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICES: &str = "\
I: Bus=0019 Vendor=0000 Product=0001 Version=0000
N: Name=\"Power Button\"
P: Phys=PNP0C0C/button/input0
H: Handlers=kbd event0
B: PROP=0

I: Bus=0011 Vendor=0001 Product=0001 Version=ab41
N: Name=\"AT Translated Set 2 keyboard\"
H: Handlers=sysrq kbd event1 leds
";

    #[test]
    fn test_power_button_handlers() {
        assert_eq!(power_button_handlers(DEVICES), vec!["event0"]);
    }

    #[test]
    fn test_power_button_handlers_missing() {
        assert!(power_button_handlers("").is_empty());
        assert!(power_button_handlers("N: Name=\"keyboard\"\nH: Handlers=event5\n").is_empty());
    }

    #[test]
    fn test_shutdown_is_noop_after_poweroff() {
        let v = Vinitd::new();
        // enter poweroff by hand: shutdown must return without rebooting
        assert!(v.try_enter_poweroff());
        shutdown(&v, RebootAction::PowerOff);
        shutdown(&v, RebootAction::Restart);
        assert_eq!(v.status(), crate::instance::InitStatus::Poweroff);
    }
}
