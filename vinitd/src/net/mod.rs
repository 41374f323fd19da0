//! Network bring-up: link configuration, addressing, routing and cloud
//! detection.
//!
//! Interfaces are classified from /sys/class/net; physical NICs get
//! synthetic `eth<n>` names in discovery order, and the index selects the
//! matching `networks[n]` settings from the image configuration. Address
//! assignment runs per NIC in parallel and fails the boot on the first
//! fatal error. A DHCP OFFER is enough to proceed; acknowledgement and
//! renewal happen in the background.

pub mod cloud;
pub mod dhcp;
pub mod ethtool;
pub mod routes;
pub mod vmtools;

use std::net::Ipv4Addr;
use std::sync::Arc;

use futures::TryStreamExt;
use netlink_packet_route::link::LinkAttribute;
use rand::Rng;
use rtnetlink::Handle;
use tokio::io::{AsyncBufReadExt, BufReader};
use vinitd_shared::{VinitdError, VinitdResult};

use crate::console::announce;
use crate::instance::{Interface, Vinitd};
use crate::util::trim_string;
use crate::vcfg::NetworkCfg;
use routes::mask_to_prefix;

pub const HOSTNAME_SALT: &str = "$SALT";
const HOSTNAME_MAX: usize = 64;

const LOOPBACK_MTU: u32 = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceType {
    Unknown,
    Net,
    Localhost,
}

/// Classify a kernel interface from its ARPHRD type: 1 is ethernet, 772
/// is loopback.
fn network_device_type(name: &str) -> DeviceType {
    let Ok(dat) = std::fs::read_to_string(format!("/sys/class/net/{}/type", name)) else {
        return DeviceType::Unknown;
    };
    match dat.trim() {
        "1" => DeviceType::Net,
        "772" => DeviceType::Localhost,
        _ => DeviceType::Unknown,
    }
}

struct LinkInfo {
    index: u32,
    name: String,
    mac: [u8; 6],
}

async fn list_links(handle: &Handle) -> VinitdResult<Vec<LinkInfo>> {
    let mut out = Vec::new();
    let mut links = handle.link().get().execute();

    while let Some(msg) = links
        .try_next()
        .await
        .map_err(|e| VinitdError::Network(format!("can not get network interfaces: {}", e)))?
    {
        let mut name = String::new();
        let mut mac = [0u8; 6];
        for attr in &msg.attributes {
            match attr {
                LinkAttribute::IfName(n) => name = n.clone(),
                LinkAttribute::Address(a) if a.len() == 6 => mac.copy_from_slice(a),
                _ => {}
            }
        }
        out.push(LinkInfo {
            index: msg.header.index,
            name,
            mac,
        });
    }

    Ok(out)
}

/// Attach the address to the NIC and program its routes. A /32 netmask
/// needs an on-link host route to the gateway first (Google Cloud hands
/// out full masks); without a route to the gateway there is no
/// connectivity, so failures here end the boot.
async fn config_interface(
    handle: &Handle,
    v: &Arc<Vinitd>,
    idx: usize,
    ip: Ipv4Addr,
    mask: Ipv4Addr,
    gw: Option<Ipv4Addr>,
) -> VinitdResult<()> {
    tracing::debug!("eth{}: {}/{}/{:?}", idx, ip, mask, gw);

    let kernel_index = {
        let mut ifcs = v.ifcs.lock();
        let ifc = ifcs
            .get_mut(idx)
            .ok_or_else(|| VinitdError::Network(format!("no interface at index {}", idx)))?;
        ifc.addr = Some(ip);
        ifc.mask = Some(mask);
        ifc.gw = gw;
        ifc.kernel_index
    };

    handle
        .address()
        .add(kernel_index, ip.into(), mask_to_prefix(mask))
        .execute()
        .await
        .map_err(|e| VinitdError::Network(format!("can not add address: {}", e)))?;

    if let Some(gw) = gw {
        if mask == Ipv4Addr::BROADCAST {
            routes::add_host_route(handle, gw, kernel_index).await?;
        }
        tracing::debug!("setting default gateway to {}", gw);
        routes::add_default_gateway(handle, gw).await?;
    }

    Ok(())
}

async fn fetch_dhcp(handle: &Handle, v: &Arc<Vinitd>, idx: usize) -> VinitdResult<()> {
    let (kernel_name, mac) = {
        let ifcs = v.ifcs.lock();
        let ifc = &ifcs[idx];
        (ifc.kernel_name.clone(), ifc.mac)
    };

    let name = kernel_name.clone();
    let lease = tokio::task::spawn_blocking(move || dhcp::discover(&name, mac))
        .await
        .map_err(|e| VinitdError::Internal(e.to_string()))?
        .map_err(|e| {
            tracing::error!("can not get IP from DHCP: {}", e);
            e
        })?;

    {
        let mut info = v.hypervisor_info.lock();
        info.cloud = if lease.azure {
            crate::instance::Cloud::Azure
        } else {
            crate::instance::Cloud::None
        };
    }

    // the offer is enough to proceed; ack and renewal run in background
    config_interface(handle, v, idx, lease.ip, lease.mask, lease.router).await?;

    v.dns.lock().extend(lease.dns.iter().copied());

    dhcp::spawn_renew(kernel_name, mac, lease);

    Ok(())
}

async fn static_ip(handle: &Handle, v: &Arc<Vinitd>, idx: usize, cfg: &NetworkCfg) -> VinitdResult<()> {
    let parse = |what: &str, s: &str| -> VinitdResult<Ipv4Addr> {
        s.parse()
            .map_err(|_| VinitdError::Network(format!("{} '{}' is not valid", what, s)))
    };

    let ip = parse("ip", &cfg.ip)?;
    let mask = parse("mask", &cfg.mask)?;
    let gw = parse("gateway", &cfg.gateway)?;

    config_interface(handle, v, idx, ip, mask, Some(gw)).await
}

/// Mirror packets on an interface with the bundled tcpdump, streaming its
/// output to the console.
async fn start_tcpdump(device: &str) -> VinitdResult<()> {
    let mut cmd = tokio::process::Command::new("/vorteil/tcpdump")
        .arg(format!("--device={}", device))
        .stdout(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| VinitdError::Network(format!("could not start tcpdump: {}", e)))?;

    if let Some(stdout) = cmd.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    announce(&line);
                }
            }
        });
    }

    tokio::spawn(async move {
        let _ = cmd.wait().await;
    });

    Ok(())
}

/// Bring up every interface: links, offload tuning, addressing, routes
/// and queue sizing.
pub async fn network_setup(v: &Arc<Vinitd>) -> VinitdResult<()> {
    let (conn, handle, _) = rtnetlink::new_connection()
        .map_err(|e| VinitdError::Network(format!("can not open rtnetlink: {}", e)))?;
    tokio::spawn(conn);

    let links = list_links(&handle).await?;
    let networks = v.vcfg.read().networks.clone();

    let mut ic = 0usize;

    for link in &links {
        let device_type = network_device_type(&link.name);
        if device_type == DeviceType::Unknown {
            continue;
        }

        tracing::debug!("configure {}", link.name);

        handle
            .link()
            .set(link.index)
            .up()
            .execute()
            .await
            .map_err(|e| {
                VinitdError::Network(format!("can not enable network device {}: {}", link.name, e))
            })?;

        if device_type == DeviceType::Localhost {
            let _ = handle
                .address()
                .add(link.index, Ipv4Addr::LOCALHOST.into(), 8)
                .execute()
                .await;
            let _ = handle
                .link()
                .set(link.index)
                .mtu(LOOPBACK_MTU)
                .execute()
                .await;
            continue;
        }

        let cfg = networks.get(ic).cloned().unwrap_or_default();

        if cfg.mtu > 0 {
            tracing::debug!("set mtu to {} for {}", cfg.mtu, link.name);
            let _ = handle.link().set(link.index).mtu(cfg.mtu).execute().await;
        }

        tracing::debug!("disable tso: {}", cfg.disable_tso);
        let val = if cfg.disable_tso { 0 } else { 1 };
        let name = link.name.clone();
        tokio::task::spawn_blocking(move || ethtool::set_tso_values(&name, val));

        v.ifcs.lock().push(Interface {
            name: format!("eth{}", ic),
            idx: ic,
            kernel_name: link.name.clone(),
            kernel_index: link.index,
            mac: link.mac,
            addr: None,
            mask: None,
            gw: None,
        });

        ic += 1;
    }

    // per-NIC address assignment, fail-fast
    let count = v.ifcs.lock().len();
    let mut tasks = Vec::with_capacity(count);
    for idx in 0..count {
        let cfg = networks.get(idx).cloned().unwrap_or_default();
        let handle = handle.clone();
        let v = v.clone();
        tasks.push(async move {
            if cfg.tcpdump {
                let device = v.ifcs.lock()[idx].kernel_name.clone();
                start_tcpdump(&device).await?;
            }
            if cfg.ip.is_empty() || cfg.ip == "dhcp" {
                fetch_dhcp(&handle, &v, idx).await
            } else {
                static_ip(&handle, &v, idx, &cfg).await
            }
        });
    }
    futures::future::try_join_all(tasks).await?;

    tracing::debug!("network configured");

    let ifcs = v.ifcs.lock().clone();
    for ifc in &ifcs {
        let fmt_ip = |ip: Option<Ipv4Addr>| ip.map_or_else(|| "none".into(), |i| i.to_string());
        announce(&format!("{} ip\t: {}", ifc.name, fmt_ip(ifc.addr)));
        announce(&format!("{} mask\t: {}", ifc.name, fmt_ip(ifc.mask)));
        announce(&format!("{} gateway\t: {}", ifc.name, fmt_ip(ifc.gw)));
    }
    if ifcs.is_empty() {
        announce("ip\t: no network devices available");
    }

    let routing = v.vcfg.read().routing.clone();
    routes::config_routes(&handle, &routing).await;

    let names: Vec<String> = ifcs.iter().map(|i| i.kernel_name.clone()).collect();
    tokio::task::spawn_blocking(move || ethtool::config_queues(&names));

    Ok(())
}

/// Expand the `$SALT` marker with eight random hostname characters and
/// validate the result.
pub fn set_hostname(template: &str) -> VinitdResult<String> {
    let mut hostname = template.to_string();

    if hostname.contains(HOSTNAME_SALT) {
        const RUNES: &[u8] = b"abcdefghijklmnopqrstuvwxyz-0123456789";
        let mut rng = rand::rng();
        let salt: String = (0..8)
            .map(|_| RUNES[rng.random_range(0..RUNES.len())] as char)
            .collect();
        hostname = hostname.replace(HOSTNAME_SALT, &salt);
    }

    validate_hostname(&hostname)
}

/// Force a string into hostname shape: lowercase, `[a-z0-9.-]` only with
/// illegal characters replaced by hyphens, no leading hyphen, at most 64
/// characters. Validating an already valid name changes nothing.
pub fn validate_hostname(hostname: &str) -> VinitdResult<String> {
    if hostname.is_empty() {
        return Err(VinitdError::Config("hostname can not be empty".into()));
    }

    let lowered = hostname.to_lowercase();
    let mapped: String = lowered
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '.' => c,
            _ => '-',
        })
        .collect();

    let trimmed = mapped.trim_start_matches('-');
    if trimmed.is_empty() {
        return Err(VinitdError::Config("hostname can not be empty".into()));
    }

    Ok(trim_string(trimmed, HOSTNAME_MAX).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_hostname_rules() {
        let cases = [
            ("ThisHostNameContainsCapitalLetters", "thishostnamecontainscapitalletters"),
            ("this.one.has.multiple.segments", "this.one.has.multiple.segments"),
            ("this_should_become_hyphenated", "this-should-become-hyphenated"),
            ("-leading-dash", "leading-dash"),
        ];
        for (input, expected) in cases {
            assert_eq!(validate_hostname(input).unwrap(), expected);
        }

        let long = "and.this.one.is.waaaaa444444aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaay.longer.than.permitted";
        assert_eq!(validate_hostname(long).unwrap().len(), 64);
    }

    #[test]
    fn test_validate_hostname_idempotent() {
        for input in [
            "Mixed_Case.Host",
            "--weird--",
            "already-valid.name",
            "UPPER",
        ] {
            let once = validate_hostname(input).unwrap();
            let twice = validate_hostname(&once).unwrap();
            assert_eq!(once, twice, "not idempotent for {}", input);
        }
    }

    #[test]
    fn test_validate_hostname_empty() {
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname("---").is_err());
    }

    #[test]
    fn test_set_hostname_salt() {
        let h = set_hostname("box-$SALT").unwrap();
        assert!(h.starts_with("box-"));
        assert_eq!(h.len(), "box-".len() + 8);
        assert!(validate_hostname(&h).unwrap() == h);

        // two salted names should differ
        let h2 = set_hostname("box-$SALT").unwrap();
        assert_ne!(h, h2);
    }

    #[test]
    fn test_set_hostname_plain() {
        assert_eq!(set_hostname("MyHost").unwrap(), "myhost");
    }
}
