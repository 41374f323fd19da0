//! Entry point.
//!
//! As pid 1 the binary takes no arguments and never returns: every exit
//! path ends in a reboot syscall. Invoked through its /sbin/poweroff or
//! /sbin/reboot symlinks it instead signals pid 1 and exits.

use std::io::Write;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use vinitd::instance::DEFAULT_TTY;
use vinitd::power::{SBIN_POWEROFF, SBIN_REBOOT};
use vinitd::{boot, console, power, Vinitd};

/// Signal pid 1 on behalf of the poweroff/reboot aliases. Exits 0 either
/// way; diagnostics go to the vtty.
fn run_alias(argv0: &str) {
    let mut tty = match std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(DEFAULT_TTY)
    {
        Ok(f) => f,
        Err(_) => return,
    };

    let signal = if argv0.ends_with(SBIN_POWEROFF) {
        Signal::SIGPWR
    } else {
        Signal::SIGINT
    };

    if let Err(e) = kill(Pid::from_raw(1), signal) {
        let _ = write!(tty, "can not send signal to process 1: {}", e);
    }
}

fn main() {
    let argv0 = std::env::args().next().unwrap_or_default();
    if argv0.ends_with(SBIN_POWEROFF) || argv0.ends_with(SBIN_REBOOT) {
        run_alias(&argv0);
        return;
    }

    console::init_tracing();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            console::kernel_log(
                console::LogLevel::Emerg,
                &format!("can not start runtime: {}", e),
            );
            // nothing else can run; power off through the raw syscall
            let _ = nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_POWER_OFF);
            return;
        }
    };

    runtime.block_on(async {
        let v = Vinitd::new();

        if let Err(e) = boot::run(v.clone()).await {
            power::system_panic(&v, &format!("system setup failed: {}", e));
        }

        // pid 1 never exits; the supervisor drives the rest of the VM's
        // lifetime from its background tasks
        futures::future::pending::<()>().await;
    });
}
