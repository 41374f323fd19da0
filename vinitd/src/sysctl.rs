//! System tunables: rlimits, kernel hardening sysctls and the image's own
//! sysctl overrides. Individual failures are logged and skipped.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;

use nix::sys::resource::{setrlimit, Resource};
use vinitd_shared::{VinitdError, VinitdResult};

use crate::mounts::{enable_cgroups, setup_shared_memory};

const DEFAULT_NR_PROC: u64 = 10000;
const MIN_FDS: u32 = 1024;

/// Hardening and performance defaults applied at boot.
const SYS_DEFAULTS: &[(&str, i64)] = &[
    ("vm/max_map_count", 1048575),
    ("vm/swappiness", 0),
    ("kernel/randomize_va_space", 2),
    ("net/ipv4/tcp_no_metrics_save", 1),
    ("net/core/netdev_max_backlog", 5000),
    ("vm/dirty_background_ratio", 20),
    ("vm/dirty_ratio", 25),
    ("fs/protected_hardlinks", 1),
    ("fs/protected_symlinks", 1),
    ("fs/suid_dumpable", 1),
    ("kernel/kptr_restrict", 1),
    ("kernel/dmesg_restrict", 1),
    ("kernel/unprivileged_bpf_disabled", 1),
    ("net/ipv4/conf/all/bootp_relay", 0),
    ("net/ipv4/tcp_syncookies", 1),
    ("net/ipv4/tcp_syn_retries", 2),
    ("net/ipv4/tcp_synack_retries", 2),
    ("net/ipv4/tcp_max_syn_backlog", 4096),
    ("net/ipv4/ip_forward", 0),
    ("net/ipv4/conf/all/forwarding", 0),
    ("net/ipv4/conf/default/forwarding", 0),
    ("net/ipv6/conf/all/forwarding", 0),
    ("net/ipv6/conf/default/forwarding", 0),
    ("net/ipv4/conf/all/rp_filter", 1),
    ("net/ipv4/conf/default/rp_filter", 1),
    ("net/ipv4/conf/all/accept_redirects", 0),
    ("net/ipv4/conf/default/accept_redirects", 0),
    ("net/ipv4/conf/all/secure_redirects", 0),
    ("net/ipv4/conf/default/secure_redirects", 0),
    ("net/ipv6/conf/all/accept_redirects", 0),
    ("net/ipv6/conf/default/accept_redirects", 0),
    ("net/ipv4/conf/all/accept_source_route", 0),
    ("net/ipv4/conf/default/accept_source_route", 0),
    ("net/ipv6/conf/all/accept_source_route", 0),
    ("net/ipv6/conf/default/accept_source_route", 0),
    ("net/ipv4/conf/all/proxy_arp", 0),
    ("net/ipv4/conf/all/arp_ignore", 1),
    ("net/ipv4/conf/all/arp_announce", 2),
    ("net/ipv4/conf/default/log_martians", 0),
    ("net/ipv4/conf/all/log_martians", 0),
    ("net/ipv4/icmp_ignore_bogus_error_responses", 0),
    ("net/ipv4/icmp_echo_ignore_broadcasts", 1),
];

/// Write one /proc/sys entry and verify the kernel accepted the value.
pub fn procsys(key: &str, value: &str) -> VinitdResult<()> {
    let path = format!("/proc/sys/{}", key);

    std::fs::write(&path, value)?;

    let result = std::fs::read_to_string(&path)?;
    if value != result.trim() {
        return Err(VinitdError::Config(format!(
            "values mismatch after set {} != {}",
            value,
            result.trim()
        )));
    }

    Ok(())
}

/// Keys arrive in dotted form; the proc interface wants slashes.
pub fn normalize_sysctl_key(key: &str) -> String {
    key.replace('.', "/")
}

fn set_rlimit(resource: Resource, value: u64) {
    if let Err(e) = setrlimit(resource, value, value) {
        tracing::error!("can not set rlimit {:?} to {}: {}", resource, value, e);
    }
}

/// Apply tunables in order: limits, cgroups, shared memory, the default
/// sysctl table, the hostname and finally the image's own sysctls.
pub fn system_config(
    sysctls: &HashMap<String, String>,
    hostname: &str,
    max_fds: u32,
    read_only: bool,
) -> VinitdResult<()> {
    if !read_only {
        let _ = std::fs::remove_file("/etc/ld.so.preload");
        let _ = std::fs::remove_file("/etc/ld.so.cache");
    }

    let _ = std::fs::set_permissions("/dev/sda", std::fs::Permissions::from_mode(0o755));

    enable_cgroups()?;
    setup_shared_memory()?;

    set_rlimit(Resource::RLIMIT_NPROC, DEFAULT_NR_PROC);
    tracing::debug!("setting max procs to {}", DEFAULT_NR_PROC);

    let max_fds = max_fds.max(MIN_FDS);
    tracing::debug!("setting max-fds to {}", max_fds);
    set_rlimit(Resource::RLIMIT_NOFILE, u64::from(max_fds) * 2);

    if let Err(e) = procsys("fs/file-max", &max_fds.to_string()) {
        tracing::warn!("can not set fs/file-max: {}", e);
    }

    for (key, value) in SYS_DEFAULTS {
        if let Err(e) = procsys(key, &value.to_string()) {
            tracing::warn!("can not set {}: {}", key, e);
        }
    }

    if let Err(e) = procsys("kernel/hostname", hostname) {
        tracing::warn!("can not set kernel/hostname: {}", e);
    }

    for (key, value) in sysctls {
        let key = normalize_sysctl_key(key);
        if let Err(e) = procsys(&key, value) {
            tracing::warn!("can not set sysctl {} to {}: {}", key, value, e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_sysctl_key() {
        assert_eq!(normalize_sysctl_key("net.core.somaxconn"), "net/core/somaxconn");
        assert_eq!(normalize_sysctl_key("vm/swappiness"), "vm/swappiness");
    }

    #[test]
    fn test_defaults_cover_hardening() {
        let keys: Vec<&str> = SYS_DEFAULTS.iter().map(|(k, _)| *k).collect();
        for expected in [
            "net/ipv4/tcp_syncookies",
            "net/ipv4/conf/all/rp_filter",
            "kernel/randomize_va_space",
            "kernel/dmesg_restrict",
            "kernel/unprivileged_bpf_disabled",
            "fs/protected_hardlinks",
            "net/ipv4/ip_forward",
            "net/ipv6/conf/all/forwarding",
        ] {
            assert!(keys.contains(&expected), "missing {}", expected);
        }
        // forwarding is off, syn backlog raised
        let map: HashMap<&str, i64> = SYS_DEFAULTS.iter().cloned().collect();
        assert_eq!(map["net/ipv4/ip_forward"], 0);
        assert_eq!(map["net/ipv4/tcp_max_syn_backlog"], 4096);
        assert_eq!(map["vm/dirty_ratio"], 25);
    }

    #[test]
    fn test_procsys_missing_key() {
        assert!(procsys("does/not/exist", "1").is_err());
    }
}
