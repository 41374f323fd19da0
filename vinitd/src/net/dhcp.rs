//! DHCPv4 client.
//!
//! Speaks the wire format directly over UDP sockets bound to the
//! interface. The boot only waits for the OFFER; the REQUEST/ACK exchange
//! and periodic renewal run in the background so bring-up is not blocked.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use nix::sys::socket::sockopt::{BindToDevice, Broadcast, ReceiveTimeout, SendTimeout};
use nix::sys::socket::setsockopt;
use nix::sys::time::TimeVal;
use rand::RngCore;
use vinitd_shared::{VinitdError, VinitdResult};

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const OP_REQUEST: u8 = 1;
const HTYPE_ETHERNET: u8 = 1;

const MSG_DISCOVER: u8 = 1;
const MSG_OFFER: u8 = 2;
const MSG_REQUEST: u8 = 3;
const MSG_ACK: u8 = 5;

pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_ROUTER: u8 = 3;
pub const OPT_DNS: u8 = 6;
pub const OPT_REQUESTED_IP: u8 = 50;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_MESSAGE_TYPE: u8 = 53;
pub const OPT_SERVER_ID: u8 = 54;
pub const OPT_PARAM_REQUEST: u8 = 55;
pub const OPT_RENEW_TIME: u8 = 58;
pub const OPT_CLIENT_ID: u8 = 61;
pub const OPT_NTP: u8 = 42;
/// Azure wire-server vendor option; its presence marks an Azure guest.
pub const OPT_AZURE_SERVER: u8 = 245;

const OPT_END: u8 = 255;

const DHCP_ATTEMPTS: usize = 3;
const ATTEMPT_LOOPS: usize = 10;
const DEFAULT_RENEW_SECS: u32 = 360;
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

/// Options requested from the server on every exchange.
const REQUESTED_PARAMS: &[u8] = &[
    OPT_SUBNET_MASK,
    OPT_ROUTER,
    OPT_DNS,
    OPT_LEASE_TIME,
    OPT_SERVER_ID,
    OPT_RENEW_TIME,
    OPT_NTP,
    OPT_AZURE_SERVER,
];

/// Client identifier: hardware type byte followed by the MAC.
pub fn client_id(mac: &[u8; 6]) -> Vec<u8> {
    let mut cid = Vec::with_capacity(7);
    cid.push(0x01);
    cid.extend_from_slice(mac);
    cid
}

/// A DHCPv4 message, options held in order.
#[derive(Debug, Clone)]
pub struct DhcpMessage {
    pub op: u8,
    pub xid: [u8; 4],
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub options: Vec<(u8, Vec<u8>)>,
}

impl DhcpMessage {
    fn new(mac: [u8; 6], xid: [u8; 4]) -> DhcpMessage {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac);
        DhcpMessage {
            op: OP_REQUEST,
            xid,
            flags: 0x8000, // broadcast
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            options: Vec::new(),
        }
    }

    pub fn discover(mac: [u8; 6], xid: [u8; 4], cid: &[u8]) -> DhcpMessage {
        let mut m = DhcpMessage::new(mac, xid);
        m.options.push((OPT_MESSAGE_TYPE, vec![MSG_DISCOVER]));
        m.options.push((OPT_CLIENT_ID, cid.to_vec()));
        m.options.push((OPT_PARAM_REQUEST, REQUESTED_PARAMS.to_vec()));
        m
    }

    pub fn request(mac: [u8; 6], xid: [u8; 4], cid: &[u8], lease: &DhcpLease) -> DhcpMessage {
        let mut m = DhcpMessage::new(mac, xid);
        m.options.push((OPT_MESSAGE_TYPE, vec![MSG_REQUEST]));
        m.options.push((OPT_CLIENT_ID, cid.to_vec()));
        m.options
            .push((OPT_REQUESTED_IP, lease.ip.octets().to_vec()));
        if let Some(server) = lease.server {
            m.options.push((OPT_SERVER_ID, server.octets().to_vec()));
        }
        m.options.push((OPT_PARAM_REQUEST, REQUESTED_PARAMS.to_vec()));
        m
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(300);
        b.push(self.op);
        b.push(HTYPE_ETHERNET);
        b.push(6); // hlen
        b.push(0); // hops
        b.extend_from_slice(&self.xid);
        b.extend_from_slice(&[0, 0]); // secs
        b.extend_from_slice(&self.flags.to_be_bytes());
        b.extend_from_slice(&self.ciaddr.octets());
        b.extend_from_slice(&self.yiaddr.octets());
        b.extend_from_slice(&self.siaddr.octets());
        b.extend_from_slice(&self.giaddr.octets());
        b.extend_from_slice(&self.chaddr);
        b.extend_from_slice(&[0u8; 64]); // sname
        b.extend_from_slice(&[0u8; 128]); // file
        b.extend_from_slice(&MAGIC_COOKIE);
        for (code, data) in &self.options {
            b.push(*code);
            b.push(data.len() as u8);
            b.extend_from_slice(data);
        }
        b.push(OPT_END);
        b
    }

    pub fn decode(buf: &[u8]) -> VinitdResult<DhcpMessage> {
        if buf.len() < 240 {
            return Err(VinitdError::Dhcp("message too short".into()));
        }
        if buf[236..240] != MAGIC_COOKIE {
            return Err(VinitdError::Dhcp("missing magic cookie".into()));
        }

        let ip_at = |off: usize| Ipv4Addr::new(buf[off], buf[off + 1], buf[off + 2], buf[off + 3]);

        let mut m = DhcpMessage {
            op: buf[0],
            xid: [buf[4], buf[5], buf[6], buf[7]],
            flags: u16::from_be_bytes([buf[10], buf[11]]),
            ciaddr: ip_at(12),
            yiaddr: ip_at(16),
            siaddr: ip_at(20),
            giaddr: ip_at(24),
            chaddr: buf[28..44].try_into().unwrap(),
            options: Vec::new(),
        };

        let mut i = 240;
        while i < buf.len() {
            let code = buf[i];
            if code == OPT_END {
                break;
            }
            if code == 0 {
                i += 1;
                continue;
            }
            if i + 1 >= buf.len() {
                break;
            }
            let len = buf[i + 1] as usize;
            if i + 2 + len > buf.len() {
                break;
            }
            m.options.push((code, buf[i + 2..i + 2 + len].to_vec()));
            i += 2 + len;
        }

        Ok(m)
    }

    pub fn option(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, d)| d.as_slice())
    }

    pub fn message_type(&self) -> Option<u8> {
        self.option(OPT_MESSAGE_TYPE).and_then(|d| d.first()).copied()
    }

    pub fn ip_option(&self, code: u8) -> Option<Ipv4Addr> {
        let d = self.option(code)?;
        if d.len() < 4 {
            return None;
        }
        Some(Ipv4Addr::new(d[0], d[1], d[2], d[3]))
    }

    pub fn dns_servers(&self) -> Vec<Ipv4Addr> {
        let Some(d) = self.option(OPT_DNS) else {
            return Vec::new();
        };
        d.chunks_exact(4)
            .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
            .collect()
    }
}

/// Result of a successful OFFER.
#[derive(Debug, Clone)]
pub struct DhcpLease {
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub router: Option<Ipv4Addr>,
    pub server: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    pub renew_secs: u32,
    pub azure: bool,
    pub xid: [u8; 4],
}

impl DhcpLease {
    fn from_offer(offer: &DhcpMessage) -> DhcpLease {
        let renew_secs = offer
            .option(OPT_RENEW_TIME)
            .filter(|d| d.len() >= 4)
            .map(|d| u32::from_be_bytes([d[0], d[1], d[2], d[3]]))
            .unwrap_or(DEFAULT_RENEW_SECS);

        DhcpLease {
            ip: offer.yiaddr,
            mask: offer.ip_option(OPT_SUBNET_MASK).unwrap_or(Ipv4Addr::UNSPECIFIED),
            router: offer.ip_option(OPT_ROUTER),
            server: offer.ip_option(OPT_SERVER_ID),
            dns: offer.dns_servers(),
            renew_secs,
            azure: offer.option(OPT_AZURE_SERVER).is_some_and(|d| !d.is_empty()),
            xid: offer.xid,
        }
    }
}

fn open_socket(ifname: &str) -> VinitdResult<UdpSocket> {
    let sock = UdpSocket::bind(("0.0.0.0", CLIENT_PORT))
        .map_err(|e| VinitdError::Dhcp(format!("can not bind dhcp socket: {}", e)))?;

    let dev: std::ffi::OsString = ifname.into();
    setsockopt(&sock, BindToDevice, &dev)
        .map_err(|e| VinitdError::Dhcp(format!("can not bind to {}: {}", ifname, e)))?;
    setsockopt(&sock, Broadcast, &true)
        .map_err(|e| VinitdError::Dhcp(format!("can not enable broadcast: {}", e)))?;

    let tv = TimeVal::new(SOCKET_TIMEOUT.as_secs() as _, 0);
    let _ = setsockopt(&sock, ReceiveTimeout, &tv);
    let _ = setsockopt(&sock, SendTimeout, &tv);

    Ok(sock)
}

fn send_receive(
    sock: &UdpSocket,
    dest: SocketAddrV4,
    msg: &DhcpMessage,
    expect: u8,
) -> VinitdResult<DhcpMessage> {
    sock.send_to(&msg.encode(), dest)
        .map_err(|e| VinitdError::Dhcp(format!("send failed: {}", e)))?;

    let mut buf = [0u8; 1500];
    loop {
        let n = sock
            .recv(&mut buf)
            .map_err(|e| VinitdError::Dhcp(format!("recv failed: {}", e)))?;

        let Ok(reply) = DhcpMessage::decode(&buf[..n]) else {
            continue;
        };
        if reply.xid != msg.xid {
            continue;
        }
        if reply.message_type() == Some(expect) {
            return Ok(reply);
        }
    }
}

/// Broadcast DISCOVER until a server answers with an OFFER. Up to 10
/// outer socket attempts with 3 transactions each; total failure is fatal
/// for the NIC and therefore the boot.
pub fn discover(ifname: &str, mac: [u8; 6]) -> VinitdResult<DhcpLease> {
    let cid = client_id(&mac);
    let broadcast = SocketAddrV4::new(Ipv4Addr::BROADCAST, SERVER_PORT);

    let mut last_err = VinitdError::Dhcp("no dhcp attempt made".into());

    for round in 0..ATTEMPT_LOOPS {
        tracing::debug!("discover request for {}", ifname);
        let sock = match open_socket(ifname) {
            Ok(s) => s,
            Err(e) => return Err(e),
        };

        for _ in 0..DHCP_ATTEMPTS {
            let mut xid = [0u8; 4];
            rand::rng().fill_bytes(&mut xid);

            let msg = DhcpMessage::discover(mac, xid, &cid);
            match send_receive(&sock, broadcast, &msg, MSG_OFFER) {
                Ok(offer) => {
                    tracing::debug!(
                        "offer for {}: {} (xid {})",
                        ifname,
                        offer.yiaddr,
                        hex::encode(xid)
                    );
                    return Ok(DhcpLease::from_offer(&offer));
                }
                Err(e) => last_err = e,
            }
        }

        tracing::warn!("can not get dhcp ip: {}, try {}", last_err, round);
    }

    Err(last_err)
}

/// Acknowledge the lease and renew it forever. The first ACK failure is
/// only a warning; the address from the OFFER is already configured.
pub fn spawn_renew(ifname: String, mac: [u8; 6], lease: DhcpLease) {
    std::thread::Builder::new()
        .name(format!("dhcp-{}", ifname))
        .spawn(move || {
            let cid = client_id(&mac);
            let dest = match lease.server {
                Some(server) => SocketAddrV4::new(server, SERVER_PORT),
                None => SocketAddrV4::new(Ipv4Addr::BROADCAST, SERVER_PORT),
            };

            let request_once = |what: &str| {
                let sock = match open_socket(&ifname) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!("dhcp {} socket failed on {}: {}", what, ifname, e);
                        return;
                    }
                };
                let msg = DhcpMessage::request(mac, lease.xid, &cid, &lease);
                match send_receive(&sock, dest, &msg, MSG_ACK) {
                    Ok(_) => tracing::debug!("dhcp acknowledged on {}", ifname),
                    Err(e) => tracing::warn!("can not ack IP address: {}", e),
                }
            };

            request_once("request");

            loop {
                std::thread::sleep(Duration::from_secs(u64::from(lease.renew_secs)));
                tracing::debug!("renew with {:?}", lease.server);
                request_once("renew");
            }
        })
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc];

    #[test]
    fn test_client_id_prefix() {
        let cid = client_id(&MAC);
        assert_eq!(cid.len(), 7);
        assert_eq!(cid[0], 0x01);
        assert_eq!(&cid[1..], &MAC);
    }

    #[test]
    fn test_discover_roundtrip() {
        let cid = client_id(&MAC);
        let m = DhcpMessage::discover(MAC, [1, 2, 3, 4], &cid);
        let decoded = DhcpMessage::decode(&m.encode()).unwrap();

        assert_eq!(decoded.xid, [1, 2, 3, 4]);
        assert_eq!(decoded.message_type(), Some(MSG_DISCOVER));
        assert_eq!(decoded.option(OPT_CLIENT_ID).unwrap(), cid.as_slice());
        assert_eq!(&decoded.chaddr[..6], &MAC);
        // broadcast flag set so the reply reaches the unconfigured NIC
        assert_eq!(decoded.flags & 0x8000, 0x8000);

        let params = decoded.option(OPT_PARAM_REQUEST).unwrap();
        for code in [OPT_RENEW_TIME, OPT_NTP, OPT_AZURE_SERVER] {
            assert!(params.contains(&code));
        }
    }

    fn offer_message(azure: bool) -> DhcpMessage {
        let mut m = DhcpMessage::new(MAC, [9, 9, 9, 9]);
        m.op = 2; // reply
        m.yiaddr = "192.0.2.10".parse().unwrap();
        m.options.push((OPT_MESSAGE_TYPE, vec![MSG_OFFER]));
        m.options.push((OPT_SUBNET_MASK, vec![255, 255, 255, 0]));
        m.options.push((OPT_ROUTER, vec![192, 0, 2, 1]));
        m.options.push((OPT_SERVER_ID, vec![192, 0, 2, 1]));
        m.options.push((OPT_DNS, vec![192, 0, 2, 53, 8, 8, 8, 8]));
        m.options.push((OPT_RENEW_TIME, 600u32.to_be_bytes().to_vec()));
        if azure {
            m.options.push((OPT_AZURE_SERVER, vec![168, 63, 129, 16]));
        }
        m
    }

    #[test]
    fn test_lease_from_offer() {
        let offer = DhcpMessage::decode(&offer_message(false).encode()).unwrap();
        let lease = DhcpLease::from_offer(&offer);

        assert_eq!(lease.ip, "192.0.2.10".parse::<Ipv4Addr>().unwrap());
        assert_eq!(lease.mask, "255.255.255.0".parse::<Ipv4Addr>().unwrap());
        assert_eq!(lease.router, Some("192.0.2.1".parse().unwrap()));
        assert_eq!(lease.server, Some("192.0.2.1".parse().unwrap()));
        assert_eq!(lease.renew_secs, 600);
        assert_eq!(lease.dns.len(), 2);
        assert!(!lease.azure);
    }

    #[test]
    fn test_azure_option_flags_cloud() {
        let offer = DhcpMessage::decode(&offer_message(true).encode()).unwrap();
        assert!(DhcpLease::from_offer(&offer).azure);
    }

    #[test]
    fn test_renew_defaults_without_option() {
        let mut m = offer_message(false);
        m.options.retain(|(c, _)| *c != OPT_RENEW_TIME);
        let lease = DhcpLease::from_offer(&DhcpMessage::decode(&m.encode()).unwrap());
        assert_eq!(lease.renew_secs, DEFAULT_RENEW_SECS);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(DhcpMessage::decode(&[0u8; 10]).is_err());
        assert!(DhcpMessage::decode(&[0u8; 300]).is_err());
    }

    #[test]
    fn test_request_carries_lease() {
        let offer = DhcpMessage::decode(&offer_message(false).encode()).unwrap();
        let lease = DhcpLease::from_offer(&offer);
        let cid = client_id(&MAC);
        let req = DhcpMessage::request(MAC, lease.xid, &cid, &lease);
        let decoded = DhcpMessage::decode(&req.encode()).unwrap();

        assert_eq!(decoded.message_type(), Some(MSG_REQUEST));
        assert_eq!(decoded.ip_option(OPT_REQUESTED_IP), Some(lease.ip));
        assert_eq!(decoded.ip_option(OPT_SERVER_ID), lease.server);
        assert_eq!(decoded.xid, lease.xid);
    }
}
