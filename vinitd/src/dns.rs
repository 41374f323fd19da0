//! Local caching resolver on 127.0.0.1:53.
//!
//! Fronts the upstream servers learned from DHCP and the image config
//! (deduplicated, first-seen order). Queries fan out to all upstreams in
//! parallel and the first answer wins; responses are cached by question
//! with the TTL clamped to [60 s, 600 s]. Runs over both UDP and TCP.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Semaphore;
use vinitd_shared::{VinitdError, VinitdResult};

use crate::console::announce;
use crate::instance::Vinitd;
use crate::util::unique_ips;

pub const DEFAULT_DNS_ADDR: &str = "127.0.0.1:53";

const MIN_TTL: u32 = 60;
const MAX_TTL: u32 = 600;
const UDP_BUFFER: usize = 65536;
const MAX_CONCURRENT_RESOLVES: usize = 10;
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(3);

pub fn clamp_ttl(ttl: u32) -> u32 {
    ttl.clamp(MIN_TTL, MAX_TTL)
}

/// Skip over an encoded name starting at `pos`. Compression pointers end
/// the name immediately.
fn skip_name(msg: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *msg.get(pos)? as usize;
        if len == 0 {
            return Some(pos + 1);
        }
        if len & 0xc0 == 0xc0 {
            return Some(pos + 2);
        }
        pos += 1 + len;
    }
}

/// The question section bytes, used as the cache key.
pub fn question_key(msg: &[u8]) -> Option<&[u8]> {
    if msg.len() < 12 {
        return None;
    }
    let qdcount = u16::from_be_bytes([msg[4], msg[5]]) as usize;
    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(msg, pos)?;
        pos += 4; // qtype + qclass
    }
    msg.get(12..pos)
}

/// Smallest TTL across the answer records of a response.
pub fn min_answer_ttl(msg: &[u8]) -> Option<u32> {
    if msg.len() < 12 {
        return None;
    }
    let qdcount = u16::from_be_bytes([msg[4], msg[5]]) as usize;
    let ancount = u16::from_be_bytes([msg[6], msg[7]]) as usize;

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(msg, pos)?;
        pos += 4;
    }

    let mut min: Option<u32> = None;
    for _ in 0..ancount {
        pos = skip_name(msg, pos)?;
        if pos + 10 > msg.len() {
            return min;
        }
        let ttl = u32::from_be_bytes([msg[pos + 4], msg[pos + 5], msg[pos + 6], msg[pos + 7]]);
        let rdlen = u16::from_be_bytes([msg[pos + 8], msg[pos + 9]]) as usize;
        pos += 10 + rdlen;
        min = Some(min.map_or(ttl, |m| m.min(ttl)));
    }
    min
}

struct CacheEntry {
    payload: Vec<u8>,
    expires: Instant,
}

struct DnsProxy {
    upstreams: Vec<Ipv4Addr>,
    cache: Mutex<HashMap<Vec<u8>, CacheEntry>>,
    limiter: Semaphore,
}

impl DnsProxy {
    fn new(upstreams: Vec<Ipv4Addr>) -> Arc<DnsProxy> {
        Arc::new(DnsProxy {
            upstreams,
            cache: Mutex::new(HashMap::new()),
            limiter: Semaphore::new(MAX_CONCURRENT_RESOLVES),
        })
    }

    fn cache_lookup(&self, key: &[u8], query_id: [u8; 2]) -> Option<Vec<u8>> {
        let mut cache = self.cache.lock();
        let entry = cache.get(key)?;
        if entry.expires < Instant::now() {
            cache.remove(key);
            return None;
        }
        let mut payload = entry.payload.clone();
        payload[0] = query_id[0];
        payload[1] = query_id[1];
        Some(payload)
    }

    fn cache_store(&self, key: Vec<u8>, payload: Vec<u8>) {
        let ttl = clamp_ttl(min_answer_ttl(&payload).unwrap_or(MIN_TTL));
        self.cache.lock().insert(
            key,
            CacheEntry {
                payload,
                expires: Instant::now() + Duration::from_secs(u64::from(ttl)),
            },
        );
    }

    /// Race all upstreams; first complete answer wins.
    async fn resolve_upstream(&self, query: &[u8]) -> Option<Vec<u8>> {
        let _permit = self.limiter.acquire().await.ok()?;

        let mut tasks = futures::stream::FuturesUnordered::new();
        for upstream in &self.upstreams {
            let upstream = *upstream;
            let query = query.to_vec();
            tasks.push(async move {
                let sock = UdpSocket::bind("0.0.0.0:0").await.ok()?;
                sock.connect((upstream, 53)).await.ok()?;
                sock.send(&query).await.ok()?;
                let mut buf = vec![0u8; UDP_BUFFER];
                let n = tokio::time::timeout(UPSTREAM_TIMEOUT, sock.recv(&mut buf))
                    .await
                    .ok()?
                    .ok()?;
                buf.truncate(n);
                Some(buf)
            });
        }

        use futures::StreamExt;
        while let Some(result) = tasks.next().await {
            if let Some(payload) = result {
                return Some(payload);
            }
        }
        None
    }

    async fn handle_query(self: &Arc<DnsProxy>, query: &[u8]) -> Option<Vec<u8>> {
        if query.len() < 12 {
            return None;
        }
        let key = question_key(query)?.to_vec();
        let query_id = [query[0], query[1]];

        if let Some(hit) = self.cache_lookup(&key, query_id) {
            return Some(hit);
        }

        let payload = self.resolve_upstream(query).await?;
        self.cache_store(key, payload.clone());
        Some(payload)
    }

    async fn serve_udp(self: Arc<DnsProxy>, sock: UdpSocket) {
        let sock = Arc::new(sock);
        let mut buf = vec![0u8; UDP_BUFFER];
        loop {
            let Ok((n, peer)) = sock.recv_from(&mut buf).await else {
                continue;
            };
            let query = buf[..n].to_vec();
            let proxy = self.clone();
            let sock = sock.clone();
            tokio::spawn(async move {
                if let Some(reply) = proxy.handle_query(&query).await {
                    let _ = sock.send_to(&reply, peer).await;
                }
            });
        }
    }

    async fn serve_tcp(self: Arc<DnsProxy>, listener: TcpListener) {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                continue;
            };
            let proxy = self.clone();
            tokio::spawn(async move {
                let mut len_buf = [0u8; 2];
                if stream.read_exact(&mut len_buf).await.is_err() {
                    return;
                }
                let len = u16::from_be_bytes(len_buf) as usize;
                let mut query = vec![0u8; len];
                if stream.read_exact(&mut query).await.is_err() {
                    return;
                }
                if let Some(reply) = proxy.handle_query(&query).await {
                    let _ = stream
                        .write_all(&(reply.len() as u16).to_be_bytes())
                        .await;
                    let _ = stream.write_all(&reply).await;
                }
            });
        }
    }
}

/// Start the local resolver. The configured DNS servers only come into
/// play when DHCP provided none; either way the list is deduplicated.
/// With no upstreams at all the resolver stays off.
pub async fn start_dns(v: &Arc<Vinitd>, addr: &str, verbose: bool) -> VinitdResult<()> {
    let envs = v.envs_snapshot();

    {
        let configured = v.vcfg.read().system.dns.clone();
        let mut dns = v.dns.lock();
        if dns.is_empty() {
            for entry in configured {
                let mut entry = entry;
                for (k, val) in &envs {
                    entry = entry.replace(&format!("${}", k), val);
                }
                if let Ok(ip) = entry.parse::<Ipv4Addr>() {
                    dns.push(ip);
                }
            }
        }
        *dns = unique_ips(std::mem::take(&mut *dns));
    }

    let upstreams = v.dns.lock().clone();

    if verbose {
        if upstreams.is_empty() {
            announce("dns\t\t: none");
        } else {
            let names: Vec<String> = upstreams.iter().map(|i| i.to_string()).collect();
            announce(&format!("dns\t\t: {}", names.join(", ")));
        }
    }

    if upstreams.is_empty() {
        return Ok(());
    }

    let udp = UdpSocket::bind(addr)
        .await
        .map_err(|e| VinitdError::Network(format!("can not bind dns udp {}: {}", addr, e)))?;
    let tcp = TcpListener::bind(addr)
        .await
        .map_err(|e| VinitdError::Network(format!("can not bind dns tcp {}: {}", addr, e)))?;

    let proxy = DnsProxy::new(upstreams);
    tokio::spawn(proxy.clone().serve_udp(udp));
    tokio::spawn(proxy.serve_tcp(tcp));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One question for example.com A plus one answer with the given TTL.
    fn dns_response(id: [u8; 2], ttl: u32) -> Vec<u8> {
        let mut m = Vec::new();
        m.extend_from_slice(&id);
        m.extend_from_slice(&[0x81, 0x80]); // response flags
        m.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        m.extend_from_slice(&1u16.to_be_bytes()); // ancount
        m.extend_from_slice(&0u16.to_be_bytes());
        m.extend_from_slice(&0u16.to_be_bytes());
        // question: example.com A IN
        m.push(7);
        m.extend_from_slice(b"example");
        m.push(3);
        m.extend_from_slice(b"com");
        m.push(0);
        m.extend_from_slice(&1u16.to_be_bytes());
        m.extend_from_slice(&1u16.to_be_bytes());
        // answer: pointer to name, A IN ttl rdlen rdata
        m.extend_from_slice(&[0xc0, 0x0c]);
        m.extend_from_slice(&1u16.to_be_bytes());
        m.extend_from_slice(&1u16.to_be_bytes());
        m.extend_from_slice(&ttl.to_be_bytes());
        m.extend_from_slice(&4u16.to_be_bytes());
        m.extend_from_slice(&[93, 184, 216, 34]);
        m
    }

    #[test]
    fn test_clamp_ttl() {
        assert_eq!(clamp_ttl(1), 60);
        assert_eq!(clamp_ttl(60), 60);
        assert_eq!(clamp_ttl(300), 300);
        assert_eq!(clamp_ttl(86400), 600);
    }

    #[test]
    fn test_question_key_stable_across_ids() {
        let a = dns_response([1, 2], 300);
        let b = dns_response([9, 9], 300);
        assert_eq!(question_key(&a).unwrap(), question_key(&b).unwrap());
        assert!(question_key(&[0u8; 4]).is_none());
    }

    #[test]
    fn test_min_answer_ttl() {
        let m = dns_response([0, 1], 123);
        assert_eq!(min_answer_ttl(&m), Some(123));
        // no answers
        let mut q = dns_response([0, 1], 0);
        q[6] = 0;
        q[7] = 0;
        assert_eq!(min_answer_ttl(&q[..33]), None);
    }

    #[test]
    fn test_cache_patches_query_id() {
        let proxy = DnsProxy::new(vec!["192.0.2.53".parse().unwrap()]);
        let stored = dns_response([1, 1], 300);
        let key = question_key(&stored).unwrap().to_vec();
        proxy.cache_store(key.clone(), stored);

        let hit = proxy.cache_lookup(&key, [7, 7]).unwrap();
        assert_eq!(&hit[..2], &[7, 7]);
        assert!(proxy.cache_lookup(b"missing", [0, 0]).is_none());
    }

    #[test]
    fn test_cache_expiry() {
        let proxy = DnsProxy::new(vec!["192.0.2.53".parse().unwrap()]);
        let payload = dns_response([1, 1], 300);
        let key = question_key(&payload).unwrap().to_vec();
        proxy.cache.lock().insert(
            key.clone(),
            CacheEntry {
                payload,
                expires: Instant::now() - Duration::from_secs(1),
            },
        );
        assert!(proxy.cache_lookup(&key, [1, 1]).is_none());
    }
}
