//! Child reaping.
//!
//! Two cooperating mechanisms: the kernel's process-event connector
//! reports every exit in the system, and a waitpid loop reaps the
//! children of pid 1 (including reparented orphans). Either path funnels
//! into `handle_exit`, which powers the machine off once nothing is left
//! running.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::socket::{bind, NetlinkAddr};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::instance::Vinitd;
use crate::supervisor::handle_exit;

const CN_IDX_PROC: u32 = 1;
const CN_VAL_PROC: u32 = 1;
const PROC_CN_MCAST_LISTEN: u32 = 1;
const PROC_EVENT_EXIT: u32 = 0x8000_0000;

const NLMSG_HDRLEN: usize = 16;
const NLMSG_DONE: u16 = 3;
const CN_MSG_LEN: usize = 20;

/// Executables ignored when counting user processes; these are service
/// daemons the init itself started.
const SERVICE_EXECUTABLES: &[&str] = &["chronyd", "fluent-bit"];

/// Count processes that belong to the workload: anything except pid 1,
/// kernel threads and the bundled service daemons.
pub fn count_user_processes() -> usize {
    let Ok(procs) = procfs::process::all_processes() else {
        return 0;
    };

    procs
        .filter_map(|p| p.ok())
        .filter_map(|p| p.stat().ok())
        .filter(|stat| {
            stat.pid > 2
                && stat.ppid > 2
                && !SERVICE_EXECUTABLES.contains(&stat.comm.as_str())
        })
        .count()
}

fn netlink_subscribe_msg() -> Vec<u8> {
    let op = PROC_CN_MCAST_LISTEN;
    let payload_len = CN_MSG_LEN + std::mem::size_of_val(&op);

    let mut buf = Vec::with_capacity(NLMSG_HDRLEN + payload_len);

    // nlmsghdr
    buf.extend_from_slice(&((NLMSG_HDRLEN + payload_len) as u32).to_le_bytes());
    buf.extend_from_slice(&NLMSG_DONE.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes()); // flags
    buf.extend_from_slice(&1u32.to_le_bytes()); // seq
    buf.extend_from_slice(&(std::process::id()).to_le_bytes()); // pid

    // cn_msg
    buf.extend_from_slice(&CN_IDX_PROC.to_le_bytes());
    buf.extend_from_slice(&CN_VAL_PROC.to_le_bytes());
    buf.extend_from_slice(&1u32.to_le_bytes()); // seq
    buf.extend_from_slice(&0u32.to_le_bytes()); // ack
    buf.extend_from_slice(&(std::mem::size_of_val(&op) as u16).to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes()); // flags

    buf.extend_from_slice(&op.to_le_bytes());
    buf
}

/// Walk the netlink messages in a receive buffer and run `handle_exit`
/// for every PROC_EVENT_EXIT.
fn parse_netlink_buffer(v: &Arc<Vinitd>, buf: &[u8]) {
    let mut off = 0usize;
    while off + NLMSG_HDRLEN <= buf.len() {
        let len = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
        let msg_type = u16::from_le_bytes(buf[off + 4..off + 6].try_into().unwrap());
        if len < NLMSG_HDRLEN || off + len > buf.len() {
            break;
        }

        if msg_type == NLMSG_DONE {
            let payload = &buf[off + NLMSG_HDRLEN..off + len];
            // proc_event.what sits right behind the cn_msg header
            if payload.len() >= CN_MSG_LEN + 4 {
                let what = u32::from_le_bytes(
                    payload[CN_MSG_LEN..CN_MSG_LEN + 4].try_into().unwrap(),
                );
                if what == PROC_EVENT_EXIT {
                    handle_exit(v);
                }
            }
        }

        // messages are 4-byte aligned
        off += (len + 3) & !3;
    }
}

/// Subscribe to the process-event connector and watch for exits. Runs on
/// its own thread for the lifetime of the VM.
pub fn listen_to_processes(v: Arc<Vinitd>) {
    std::thread::Builder::new()
        .name("proc-events".into())
        .spawn(move || {
            let raw = unsafe {
                libc::socket(libc::AF_NETLINK, libc::SOCK_DGRAM, libc::NETLINK_CONNECTOR)
            };
            if raw < 0 {
                tracing::error!(
                    "socket for process listening failed: {}",
                    std::io::Error::last_os_error()
                );
                return;
            }
            let sock = unsafe { OwnedFd::from_raw_fd(raw) };

            let addr = NetlinkAddr::new(std::process::id(), CN_IDX_PROC);
            if let Err(e) = bind(sock.as_raw_fd(), &addr) {
                tracing::error!("bind for process listening failed: {}", e);
                return;
            }

            let kernel = NetlinkAddr::new(0, CN_IDX_PROC);
            let msg = netlink_subscribe_msg();
            if let Err(e) = nix::sys::socket::sendto(
                sock.as_raw_fd(),
                &msg,
                &kernel,
                nix::sys::socket::MsgFlags::empty(),
            ) {
                tracing::error!("send for process listening failed: {}", e);
                return;
            }

            let mut buf = [0u8; 1024];
            loop {
                match nix::sys::socket::recvfrom::<NetlinkAddr>(sock.as_raw_fd(), &mut buf) {
                    Ok((n, from)) => {
                        // only kernel-originated messages count
                        if let Some(addr) = from {
                            if addr.pid() != 0 {
                                continue;
                            }
                        }
                        parse_netlink_buffer(&v, &buf[..n]);
                    }
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        tracing::debug!("error receiving netlink message: {}", e);
                    }
                }
            }
        })
        .ok();
}

/// Reap any child of pid 1. A reaped pid belonging to a supervised
/// program marks it exited; every reap re-evaluates the shutdown
/// condition.
pub fn reap_children(v: Arc<Vinitd>) {
    std::thread::Builder::new()
        .name("reaper".into())
        .spawn(move || loop {
            match waitpid(Pid::from_raw(-1), None) {
                Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                    tracing::debug!("process {} finished", pid);
                    let programs = v.programs.read().clone();
                    for p in programs.iter() {
                        if p.pid() == Some(pid.as_raw()) {
                            p.mark_reaped();
                            break;
                        }
                    }
                    handle_exit(&v);
                }
                Ok(_) => {}
                Err(Errno::ECHILD) => {
                    // nothing to wait for yet
                    std::thread::sleep(std::time::Duration::from_millis(500));
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::error!("error wait pid {}", e);
                    std::thread::sleep(std::time::Duration::from_millis(500));
                }
            }
        })
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_msg_layout() {
        let msg = netlink_subscribe_msg();
        // nlmsghdr + cn_msg + u32 op
        assert_eq!(msg.len(), NLMSG_HDRLEN + CN_MSG_LEN + 4);

        let total = u32::from_le_bytes(msg[0..4].try_into().unwrap()) as usize;
        assert_eq!(total, msg.len());
        assert_eq!(u16::from_le_bytes(msg[4..6].try_into().unwrap()), NLMSG_DONE);

        // cn_msg id
        let idx = u32::from_le_bytes(msg[16..20].try_into().unwrap());
        let val = u32::from_le_bytes(msg[20..24].try_into().unwrap());
        assert_eq!((idx, val), (CN_IDX_PROC, CN_VAL_PROC));

        // the op is the last word
        let op = u32::from_le_bytes(msg[msg.len() - 4..].try_into().unwrap());
        assert_eq!(op, PROC_CN_MCAST_LISTEN);
    }

    #[test]
    fn test_parse_netlink_ignores_short_buffers() {
        let v = Vinitd::new();
        // none of these may panic
        parse_netlink_buffer(&v, &[]);
        parse_netlink_buffer(&v, &[0u8; 8]);
        parse_netlink_buffer(&v, &[0xff; 32]);
    }

    #[test]
    fn test_count_user_processes_runs() {
        // only checks the walk does not fail; the count depends on the host
        let _ = count_user_processes();
    }
}
