//! Mapped-DNS collaborator: a process-singleton responder the UDP receive
//! callback consults with a three-field predicate `(address, port, is_ipv4)`
//! before falling back to a real session. The engine only ever needs
//! `get`/`handle`/the config getters; this module provides a small
//! in-memory reference implementation sufficient for tests, guarded by a
//! plain `std::sync::Mutex` independent of the stack's own lock.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use crate::config::MappedDnsConfig;

/// A synthetic DNS responder bound to an anycast `(address, port)` and an
/// IPv4 `network/netmask` it hands addresses out from.
pub struct MappedDns {
    config: MappedDnsConfig,
    cache: Mutex<HashMap<Vec<u8>, Ipv4Addr>>,
    next_host: Mutex<u32>,
}

impl MappedDns {
    pub fn new(config: MappedDnsConfig) -> Self {
        MappedDns {
            config,
            cache: Mutex::new(HashMap::new()),
            next_host: Mutex::new(1),
        }
    }

    pub fn map_address(&self) -> Ipv4Addr {
        self.config.map_address
    }

    pub fn map_port(&self) -> u16 {
        self.config.map_port
    }

    pub fn network(&self) -> Ipv4Addr {
        self.config.network
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.config.netmask
    }

    pub fn cache_size(&self) -> usize {
        self.config.cache_size
    }

    /// True when `(address, port)` is this responder's configured anycast
    /// target over IPv4 — the exact predicate the UDP receive callback
    /// checks before routing to this collaborator instead of a session.
    pub fn matches(&self, address: Ipv4Addr, port: u16) -> bool {
        address == self.config.map_address && port == self.config.map_port
    }

    /// Answer a DNS query in place, synthesizing an address from the
    /// configured network/netmask and caching it by query name. Returns the
    /// reply length, or `0` if the query cannot be parsed (no reply).
    pub fn handle(&self, query: &[u8]) -> Vec<u8> {
        let Some(name) = extract_question_name(query) else {
            return Vec::new();
        };

        let mut cache = self.cache.lock().unwrap();
        if cache.len() >= self.config.cache_size {
            cache.clear();
        }
        let addr = *cache.entry(name).or_insert_with(|| self.allocate_address());

        build_a_record_reply(query, addr)
    }

    fn allocate_address(&self) -> Ipv4Addr {
        let mut next = self.next_host.lock().unwrap();
        let network = u32::from(self.config.network);
        let netmask = u32::from(self.config.netmask);
        let host_bits = !netmask;
        let host = *next & host_bits;
        *next = next.wrapping_add(1);
        Ipv4Addr::from(network | host)
    }
}

fn extract_question_name(query: &[u8]) -> Option<Vec<u8>> {
    if query.len() < 12 {
        return None;
    }
    let mut i = 12;
    let start = i;
    while i < query.len() && query[i] != 0 {
        let len = query[i] as usize;
        i += 1 + len;
    }
    if i >= query.len() {
        return None;
    }
    Some(query[start..=i].to_vec())
}

fn build_a_record_reply(query: &[u8], addr: Ipv4Addr) -> Vec<u8> {
    let mut reply = query.to_vec();
    // Flip QR bit, set RA/RCODE=0 in the header.
    if reply.len() >= 4 {
        reply[2] |= 0x80;
        reply[3] = 0x80;
    }
    reply[6..8].copy_from_slice(&1u16.to_be_bytes()); // ANCOUNT = 1

    // Answer: name pointer to offset 12, type A, class IN, TTL, rdlength, rdata.
    reply.extend_from_slice(&[0xc0, 0x0c]);
    reply.extend_from_slice(&1u16.to_be_bytes()); // TYPE A
    reply.extend_from_slice(&1u16.to_be_bytes()); // CLASS IN
    reply.extend_from_slice(&60u32.to_be_bytes()); // TTL
    reply.extend_from_slice(&4u16.to_be_bytes()); // RDLENGTH
    reply.extend_from_slice(&addr.octets());
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MappedDnsConfig {
        MappedDnsConfig {
            map_address: Ipv4Addr::new(198, 18, 0, 1),
            map_port: 53,
            network: Ipv4Addr::new(198, 18, 0, 0),
            netmask: Ipv4Addr::new(255, 254, 0, 0),
            cache_size: 4,
        }
    }

    fn sample_query() -> Vec<u8> {
        let mut q = vec![0u8; 12];
        q.extend_from_slice(&[3, b'f', b'o', b'o', 3, b'c', b'o', b'm', 0]);
        q.extend_from_slice(&1u16.to_be_bytes());
        q.extend_from_slice(&1u16.to_be_bytes());
        q
    }

    #[test]
    fn matches_only_the_configured_anycast_target() {
        let dns = MappedDns::new(config());
        assert!(dns.matches(Ipv4Addr::new(198, 18, 0, 1), 53));
        assert!(!dns.matches(Ipv4Addr::new(198, 18, 0, 1), 54));
        assert!(!dns.matches(Ipv4Addr::new(1, 1, 1, 1), 53));
    }

    #[test]
    fn repeated_queries_for_the_same_name_return_the_same_address() {
        let dns = MappedDns::new(config());
        let query = sample_query();
        let reply1 = dns.handle(&query);
        let reply2 = dns.handle(&query);
        assert!(!reply1.is_empty());
        assert_eq!(&reply1[reply1.len() - 4..], &reply2[reply2.len() - 4..]);
    }

    #[test]
    fn malformed_query_yields_no_reply() {
        let dns = MappedDns::new(config());
        assert!(dns.handle(&[0u8; 4]).is_empty());
    }
}
