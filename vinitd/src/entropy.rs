//! Entropy feeder for /dev/random.
//!
//! Fresh VMs boot with an empty entropy pool and DHCP needs randomness
//! immediately. Whenever /dev/random reports write-readiness, eight bytes
//! of OS randomness are credited through RNDADDENTROPY.

use std::fs::File;
use std::os::fd::AsRawFd;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use rand::rngs::OsRng;
use rand::TryRngCore;

const RNDADDENTROPY: libc::c_ulong = 0x4008_5203;
const ENTROPY_CREDIT_BITS: libc::c_int = 64;

#[repr(C)]
struct RandPoolInfo {
    entropy_count: libc::c_int,
    buf_size: libc::c_int,
    buf: u64,
}

fn add_entropy(random: &File) -> std::io::Result<()> {
    let word = OsRng
        .try_next_u64()
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    let info = RandPoolInfo {
        entropy_count: ENTROPY_CREDIT_BITS,
        buf_size: 8,
        buf: word,
    };

    let rc = unsafe { libc::ioctl(random.as_raw_fd(), RNDADDENTROPY, &info) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn entropy_loop() -> std::io::Result<()> {
    let random = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/random")?;

    let epoll = Epoll::new(EpollCreateFlags::empty()).map_err(std::io::Error::from)?;
    epoll
        .add(
            &random,
            EpollEvent::new(EpollFlags::EPOLLOUT, random.as_raw_fd() as u64),
        )
        .map_err(std::io::Error::from)?;

    let mut events = [EpollEvent::empty(); 1];
    loop {
        match epoll.wait(&mut events, EpollTimeout::NONE) {
            Ok(1) if events[0].events().contains(EpollFlags::EPOLLOUT) => {
                if let Err(e) = add_entropy(&random) {
                    tracing::debug!("can not add entropy: {}", e);
                }
            }
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Run the feeder for the lifetime of the VM.
pub fn spawn_entropy_feeder() {
    std::thread::Builder::new()
        .name("entropy".into())
        .spawn(|| {
            if let Err(e) = entropy_loop() {
                tracing::error!("entropy feeder stopped: {}", e);
            }
        })
        .ok();
}
