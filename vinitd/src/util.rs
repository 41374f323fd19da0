//! Small helpers shared across subsystems.

use std::net::Ipv4Addr;

/// Deduplicate a list of addresses, keeping first-seen order.
pub fn unique_ips(ips: Vec<Ipv4Addr>) -> Vec<Ipv4Addr> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(ips.len());
    for ip in ips {
        if seen.insert(ip) {
            out.push(ip);
        }
    }
    out
}

/// Convert an IPv4 address to the u32 the kernel routing ioctls expect:
/// the little-endian reading of the four octets (network byte order in
/// memory).
pub fn ip_to_network_int(ip: Ipv4Addr) -> u32 {
    u32::from_le_bytes(ip.octets())
}

/// Read a fixed-size byte field up to (but not including) the first NUL.
pub fn terminated_null_string(input: &[u8]) -> String {
    let end = input.iter().position(|&c| c == 0).unwrap_or(input.len());
    String::from_utf8_lossy(&input[..end]).into_owned()
}

/// Seconds since boot, from the first column of /proc/uptime.
pub fn uptime() -> f64 {
    let Ok(up) = std::fs::read_to_string("/proc/uptime") else {
        return 0.0;
    };
    up.split_whitespace()
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0)
}

/// Truncate a string to at most `n` bytes.
pub fn trim_string(s: &str, n: usize) -> &str {
    if s.len() <= n { s } else { &s[..n] }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_ips() {
        let ips = vec![
            "192.168.1.1".parse().unwrap(),
            "192.168.1.2".parse().unwrap(),
            "192.168.1.3".parse().unwrap(),
        ];
        assert_eq!(unique_ips(ips.clone()).len(), ips.len());

        let mut with_dup = ips.clone();
        with_dup.push("192.168.1.1".parse().unwrap());
        let uniq = unique_ips(with_dup);
        assert_eq!(uniq.len(), ips.len());
        assert_eq!(uniq, ips);
    }

    #[test]
    fn test_ip_to_network_int() {
        let ip: Ipv4Addr = "192.168.1.1".parse().unwrap();
        assert_eq!(ip_to_network_int(ip), 0x0101a8c0);
    }

    #[test]
    fn test_terminated_null_string() {
        let b = [118, 111, 114, 116, 101, 105, 108, 0, 0, 0, 0, 0, 0, 0];
        let s = terminated_null_string(&b);
        assert_eq!(s, "vorteil");
        assert_ne!(s.len(), b.len());

        // no terminator reads the whole slice
        assert_eq!(terminated_null_string(b"abc"), "abc");
        assert_eq!(terminated_null_string(b""), "");
    }

    #[test]
    fn test_trim_string() {
        assert_eq!(trim_string("short", 64), "short");
        let long = "a".repeat(80);
        assert_eq!(trim_string(&long, 64).len(), 64);
    }
}
