//! Declared NFS shares.

use std::net::{Ipv4Addr, ToSocketAddrs};

use nix::mount::{mount, MsFlags};

use crate::console::announce;
use crate::vcfg::NfsCfg;

/// Split a declared server into host and export path.
pub fn split_server(server: &str) -> Option<(&str, &str)> {
    let (host, path) = server.split_once(':')?;
    if host.is_empty() || path.is_empty() {
        return None;
    }
    Some((host, path))
}

/// First IPv4 address for a server name, resolved through the local
/// resolver.
fn resolve_nfs(name: &str) -> Option<Ipv4Addr> {
    tracing::debug!("resolving nfs server: {}", name);
    let addrs = format!("{}:0", name).to_socket_addrs().ok()?;
    for addr in addrs {
        if let std::net::IpAddr::V4(ip) = addr.ip() {
            return Some(ip);
        }
    }
    None
}

/// Mount every declared share. A share that fails to parse, resolve or
/// mount is logged and skipped; the rest still mount.
pub fn setup_nfs(mounts: &[NfsCfg]) {
    for m in mounts {
        if m.mount_point.is_empty() {
            continue;
        }

        let Some((host, path)) = split_server(&m.server) else {
            tracing::error!("can not parse nfs server {}", m.server);
            continue;
        };

        let ip = match host.parse::<Ipv4Addr>() {
            Ok(ip) => ip,
            Err(_) => match resolve_nfs(host) {
                Some(ip) => ip,
                None => {
                    tracing::error!("can not resolve {}", host);
                    continue;
                }
            },
        };

        let mut options = Vec::new();
        if !m.arguments.is_empty() {
            options.push(m.arguments.clone());
        }
        options.push(format!("addr={}", ip));
        let options = options.join(",");

        announce(&format!("nfs mount {} to {} with {}", path, m.mount_point, options));

        if let Err(e) = std::fs::create_dir_all(&m.mount_point) {
            tracing::error!("can not create mount point {}: {}", m.mount_point, e);
            continue;
        }

        let source = format!(":{}", path);
        if let Err(e) = mount(
            Some(source.as_str()),
            m.mount_point.as_str(),
            Some("nfs"),
            MsFlags::empty(),
            Some(options.as_str()),
        ) {
            tracing::error!("can not mount NFS: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_server() {
        assert_eq!(
            split_server("10.0.0.5:/export/data"),
            Some(("10.0.0.5", "/export/data"))
        );
        assert_eq!(
            split_server("fileserver:/srv/nfs"),
            Some(("fileserver", "/srv/nfs"))
        );
        assert_eq!(split_server("nocolon"), None);
        assert_eq!(split_server(":/path"), None);
        assert_eq!(split_server("host:"), None);
    }
}
