//! NIC tuning through the ethtool ioctl interface: offload toggles,
//! channel counts and ring sizes.

use std::io;
use std::os::fd::AsRawFd;

use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};

pub const ETHTOOL_SGSO: u32 = 0x0000_0024;
pub const ETHTOOL_SUFO: u32 = 0x0000_0022;
pub const ETHTOOL_STSO: u32 = 0x0000_001f;
pub const ETHTOOL_SRXCSUM: u32 = 0x0000_0015;
pub const ETHTOOL_STXCSUM: u32 = 0x0000_0017;
pub const ETHTOOL_SSG: u32 = 0x0000_0019;
pub const ETHTOOL_GCHANNELS: u32 = 0x0000_003c;
pub const ETHTOOL_SCHANNELS: u32 = 0x0000_003d;
pub const ETHTOOL_GRINGPARAM: u32 = 0x0000_0010;
pub const ETHTOOL_SRINGPARAM: u32 = 0x0000_0011;

const SIOCETHTOOL: libc::c_ulong = 0x8946;
const IFNAMSIZ: usize = 16;

/// Offload commands toggled together with the TSO setting.
const TSO_ATTRS: &[u32] = &[
    ETHTOOL_SSG,
    ETHTOOL_SUFO,
    ETHTOOL_STSO,
    ETHTOOL_SGSO,
    ETHTOOL_SRXCSUM,
    ETHTOOL_STXCSUM,
];

#[repr(C)]
struct IfReq {
    name: [u8; IFNAMSIZ],
    data: *mut libc::c_void,
}

#[repr(C)]
pub struct EthtoolValue {
    pub cmd: u32,
    pub data: u32,
}

#[repr(C)]
#[derive(Default, Debug, Clone, Copy)]
pub struct Channels {
    pub cmd: u32,
    pub max_rx: u32,
    pub max_tx: u32,
    pub max_other: u32,
    pub max_combined: u32,
    pub rx_count: u32,
    pub tx_count: u32,
    pub other_count: u32,
    pub combined_count: u32,
}

#[repr(C)]
#[derive(Default, Debug, Clone, Copy)]
pub struct RingParam {
    pub cmd: u32,
    pub rx_max_pending: u32,
    pub rx_mini_max_pending: u32,
    pub rx_jumbo_max_pending: u32,
    pub tx_max_pending: u32,
    pub rx_pending: u32,
    pub rx_mini_pending: u32,
    pub rx_jumbo_pending: u32,
    pub tx_pending: u32,
}

fn ethtool_ioctl(ifc: &str, data: *mut libc::c_void) -> io::Result<()> {
    let mut name = [0u8; IFNAMSIZ];
    let bytes = ifc.as_bytes();
    let n = bytes.len().min(IFNAMSIZ - 1);
    name[..n].copy_from_slice(&bytes[..n]);

    let mut ifr = IfReq { name, data };

    let fd = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::empty(),
        None,
    )
    .map_err(io::Error::from)?;

    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), SIOCETHTOOL, &mut ifr) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Set the offload group to 0 (disabled) or 1 (enabled). Not every
/// virtual NIC supports every command, so failures stay at debug level.
pub fn set_tso_values(name: &str, val: u32) {
    tracing::debug!("setting tso to {} on {}", val, name);

    for attr in TSO_ATTRS {
        let mut cmd = EthtoolValue {
            cmd: *attr,
            data: val,
        };
        if ethtool_ioctl(name, &mut cmd as *mut _ as *mut libc::c_void).is_err() {
            tracing::debug!("can not set tso attr {:#x} to {}", attr, val);
        }
    }
}

fn cpu_count() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// Raise channel counts towards min(cpus, max) per direction. Returns
/// whether a writeback is required.
pub fn bump_channels(ch: &mut Channels, cpus: u32) -> bool {
    let mut changed = false;

    let mut bump = |max: u32, count: &mut u32| {
        let target = cpus.min(max);
        if target > *count {
            *count = target;
            true
        } else {
            false
        }
    };

    changed |= bump(ch.max_combined, &mut ch.combined_count);
    changed |= bump(ch.max_tx, &mut ch.tx_count);
    changed |= bump(ch.max_rx, &mut ch.rx_count);

    changed
}

/// Raise pending ring sizes to the device maximum. Returns whether a
/// writeback is required.
pub fn bump_ring_params(rp: &mut RingParam) -> bool {
    let mut changed = false;

    if rp.rx_max_pending > rp.rx_pending {
        rp.rx_pending = rp.rx_max_pending;
        changed = true;
    }
    if rp.tx_max_pending > rp.tx_pending {
        rp.tx_pending = rp.tx_max_pending;
        changed = true;
    }

    changed
}

/// Tune queue counts and ring sizes on every configured NIC. Whenever a
/// bump was computed the set ioctl is issued; set failures can not be
/// handled and are logged.
pub fn config_queues(names: &[String]) {
    let cpus = cpu_count();

    for name in names {
        let mut channels = Channels {
            cmd: ETHTOOL_GCHANNELS,
            ..Default::default()
        };

        if ethtool_ioctl(name, &mut channels as *mut _ as *mut libc::c_void).is_ok()
            && bump_channels(&mut channels, cpus)
        {
            tracing::debug!("updating network queues on {}", name);
            channels.cmd = ETHTOOL_SCHANNELS;
            if let Err(e) = ethtool_ioctl(name, &mut channels as *mut _ as *mut libc::c_void) {
                tracing::debug!("can not update channels on {}: {}", name, e);
            }
        }

        let mut ring = RingParam {
            cmd: ETHTOOL_GRINGPARAM,
            ..Default::default()
        };

        if ethtool_ioctl(name, &mut ring as *mut _ as *mut libc::c_void).is_ok()
            && bump_ring_params(&mut ring)
        {
            tracing::debug!("updating network ringparams on {}", name);
            ring.cmd = ETHTOOL_SRINGPARAM;
            if let Err(e) = ethtool_ioctl(name, &mut ring as *mut _ as *mut libc::c_void) {
                tracing::debug!("can not update ringparams on {}: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_channels_respects_cpu_cap() {
        let mut ch = Channels {
            max_combined: 16,
            combined_count: 1,
            max_rx: 8,
            rx_count: 8,
            max_tx: 2,
            tx_count: 1,
            ..Default::default()
        };
        // 4 cpus: combined 1->4, tx 1->2, rx already at max
        assert!(bump_channels(&mut ch, 4));
        assert_eq!(ch.combined_count, 4);
        assert_eq!(ch.tx_count, 2);
        assert_eq!(ch.rx_count, 8);
    }

    #[test]
    fn test_bump_channels_noop_when_saturated() {
        let mut ch = Channels {
            max_combined: 4,
            combined_count: 4,
            ..Default::default()
        };
        assert!(!bump_channels(&mut ch, 8));
    }

    #[test]
    fn test_bump_ring_params() {
        let mut rp = RingParam {
            rx_max_pending: 4096,
            rx_pending: 256,
            tx_max_pending: 1024,
            tx_pending: 1024,
            ..Default::default()
        };
        assert!(bump_ring_params(&mut rp));
        assert_eq!(rp.rx_pending, 4096);
        assert_eq!(rp.tx_pending, 1024);

        // second pass computes nothing
        assert!(!bump_ring_params(&mut rp));
    }
}
