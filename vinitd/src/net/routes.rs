//! Routing table population over rtnetlink.

use std::net::Ipv4Addr;

use futures::TryStreamExt;
use rtnetlink::Handle;
use vinitd_shared::{VinitdError, VinitdResult};

use crate::vcfg::RouteCfg;

/// Parse `a.b.c.d/len` into network address and prefix length.
pub fn parse_cidr(s: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, len) = s.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let len: u8 = len.parse().ok()?;
    if len > 32 {
        return None;
    }
    // normalize to the network address
    let mask = prefix_to_mask(len);
    let net = Ipv4Addr::from(u32::from(addr) & u32::from(mask));
    Some((net, len))
}

pub fn prefix_to_mask(len: u8) -> Ipv4Addr {
    if len == 0 {
        return Ipv4Addr::UNSPECIFIED;
    }
    Ipv4Addr::from(u32::MAX << (32 - u32::from(len)))
}

pub fn mask_to_prefix(mask: Ipv4Addr) -> u8 {
    u32::from(mask).count_ones() as u8
}

pub fn cidr_contains(net: Ipv4Addr, len: u8, ip: Ipv4Addr) -> bool {
    let mask = u32::from(prefix_to_mask(len));
    u32::from(net) & mask == u32::from(ip) & mask
}

async fn link_index(handle: &Handle, name: &str) -> VinitdResult<u32> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    let link = links
        .try_next()
        .await
        .map_err(|e| VinitdError::Network(format!("can not find link {}: {}", name, e)))?
        .ok_or_else(|| VinitdError::Network(format!("no such link: {}", name)))?;
    Ok(link.header.index)
}

/// Direct (on-link) host route to `dest` through the device.
pub async fn add_host_route(handle: &Handle, dest: Ipv4Addr, ifindex: u32) -> VinitdResult<()> {
    handle
        .route()
        .add()
        .v4()
        .destination_prefix(dest, 32)
        .output_interface(ifindex)
        .execute()
        .await
        .map_err(|e| VinitdError::Network(format!("could not set host route: {}", e)))
}

/// Default route through `gw`.
pub async fn add_default_gateway(handle: &Handle, gw: Ipv4Addr) -> VinitdResult<()> {
    handle
        .route()
        .add()
        .v4()
        .gateway(gw)
        .execute()
        .await
        .map_err(|e| VinitdError::Network(format!("could not set default gateway: {}", e)))
}

pub async fn add_gateway_route(
    handle: &Handle,
    dest: Ipv4Addr,
    prefix: u8,
    gw: Ipv4Addr,
    ifindex: u32,
) -> VinitdResult<()> {
    handle
        .route()
        .add()
        .v4()
        .destination_prefix(dest, prefix)
        .gateway(gw)
        .output_interface(ifindex)
        .execute()
        .await
        .map_err(|e| VinitdError::Network(format!("could not set route: {}", e)))
}

/// Apply the static routes from the image configuration. A gateway
/// outside its destination network first gets a direct host route through
/// the interface. Route errors are logged and the remaining entries still
/// apply.
pub async fn config_routes(handle: &Handle, routes: &[RouteCfg]) {
    for r in routes {
        let Some((net, prefix)) = parse_cidr(&r.destination) else {
            tracing::error!("can not set route destination: {}", r.destination);
            continue;
        };

        let gw: Ipv4Addr = match r.gateway.parse() {
            Ok(gw) => gw,
            Err(_) => {
                tracing::error!("gateway {} invalid", r.gateway);
                continue;
            }
        };

        let ifindex = match link_index(handle, &r.interface).await {
            Ok(idx) => idx,
            Err(e) => {
                tracing::error!("can not resolve route interface {}: {}", r.interface, e);
                continue;
            }
        };

        if !cidr_contains(net, prefix, gw) {
            if let Err(e) = add_host_route(handle, gw, ifindex).await {
                tracing::error!("can not set route direct link: {}", e);
                continue;
            }
        }

        if let Err(e) = add_gateway_route(handle, net, prefix, gw, ifindex).await {
            tracing::error!("can not set route: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cidr() {
        let (net, len) = parse_cidr("10.0.0.0/8").unwrap();
        assert_eq!(net, Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(len, 8);

        // host bits are masked away
        let (net, len) = parse_cidr("192.168.1.77/24").unwrap();
        assert_eq!(net, Ipv4Addr::new(192, 168, 1, 0));
        assert_eq!(len, 24);

        assert!(parse_cidr("10.0.0.0/33").is_none());
        assert!(parse_cidr("10.0.0.0").is_none());
        assert!(parse_cidr("banana/8").is_none());
    }

    #[test]
    fn test_prefix_mask_roundtrip() {
        assert_eq!(prefix_to_mask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(prefix_to_mask(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(prefix_to_mask(0), Ipv4Addr::UNSPECIFIED);

        for len in 0..=32u8 {
            assert_eq!(mask_to_prefix(prefix_to_mask(len)), len);
        }
    }

    #[test]
    fn test_cidr_contains() {
        let (net, len) = parse_cidr("192.168.1.0/24").unwrap();
        assert!(cidr_contains(net, len, "192.168.1.200".parse().unwrap()));
        assert!(!cidr_contains(net, len, "192.168.2.1".parse().unwrap()));
        // default route contains everything
        assert!(cidr_contains(Ipv4Addr::UNSPECIFIED, 0, "8.8.8.8".parse().unwrap()));
    }
}
