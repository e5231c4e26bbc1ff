//! A small first-party TCP/IP stack standing in for the lwIP dependency
//! `hev-socks5-tunnel.c` links against (`netif.input`/`tcp_accept_handler`/
//! `udp_recv_handler` shape). It is
//! deliberately not RFC-complete: just enough of the three-way handshake,
//! FIN teardown and UDP admission to drive the accept/receive callback
//! contract the engine depends on. All methods assume the caller already
//! holds the stack lock (`gateway::StackHandle::with_stack`); `Stack` itself
//! has no internal synchronization.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use crate::packet::PacketBuf;
use crate::pool::buffer::BufferPool;

pub type ConnId = u64;

const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

const TCP_FLAG_FIN: u8 = 0x01;
const TCP_FLAG_SYN: u8 = 0x02;
const TCP_FLAG_RST: u8 = 0x04;
const TCP_FLAG_ACK: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    SynReceived,
    Established,
    FinWait,
    Closed,
}

pub struct TcpCb {
    pub id: ConnId,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: TcpState,
    pub last_activity: Instant,
    seq: u32,
    ack: u32,
    inbound: VecDeque<u8>,
}

pub struct UdpCb {
    pub id: ConnId,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

type AcceptHandler = dyn Fn(&mut Stack, ConnId) + Send + Sync;
type UdpRecvHandler = dyn Fn(&mut Stack, ConnId, &[u8]) + Send + Sync;
type OutputHook = dyn Fn(PacketBuf) + Send + Sync;

/// The embedded stack: one listening TCP slot, one listening UDP slot, a
/// table of live TCP control blocks, and a table of one-shot UDP admission
/// records (kept only long enough for the session to send its reply).
pub struct Stack {
    /// When set, every inbound SYN is accepted as if addressed locally,
    /// regardless of its destination address/port (spec.md §4.8: "treat all
    /// inbound TCP as if it terminated locally regardless of destination
    /// address" — the gateway's whole purpose is transparent interception,
    /// so this is a wildcard accept, not a single bound port).
    pub tcp_listening: bool,
    pub udp_listening: bool,
    tcp_conns: HashMap<ConnId, TcpCb>,
    udp_conns: HashMap<ConnId, UdpCb>,
    next_id: ConnId,
    output: Option<Box<OutputHook>>,
    accept_handler: Option<Box<AcceptHandler>>,
    udp_handler: Option<Box<UdpRecvHandler>>,
    buffers: Arc<BufferPool>,
}

impl Stack {
    pub fn new(buffers: Arc<BufferPool>) -> Self {
        Stack {
            tcp_listening: false,
            udp_listening: false,
            tcp_conns: HashMap::new(),
            udp_conns: HashMap::new(),
            next_id: 1,
            output: None,
            accept_handler: None,
            udp_handler: None,
            buffers,
        }
    }

    pub fn listen_tcp(&mut self) {
        self.tcp_listening = true;
    }

    pub fn listen_udp(&mut self) {
        self.udp_listening = true;
    }

    pub fn set_output<F>(&mut self, hook: F)
    where
        F: Fn(PacketBuf) + Send + Sync + 'static,
    {
        self.output = Some(Box::new(hook));
    }

    pub fn set_accept_handler<F>(&mut self, handler: F)
    where
        F: Fn(&mut Stack, ConnId) + Send + Sync + 'static,
    {
        self.accept_handler = Some(Box::new(handler));
    }

    pub fn set_udp_handler<F>(&mut self, handler: F)
    where
        F: Fn(&mut Stack, ConnId, &[u8]) + Send + Sync + 'static,
    {
        self.udp_handler = Some(Box::new(handler));
    }

    pub fn tcp_cb(&self, id: ConnId) -> Option<&TcpCb> {
        self.tcp_conns.get(&id)
    }

    /// Pop whatever bytes have arrived for `id` since the last read.
    pub fn tcp_read(&mut self, id: ConnId) -> Vec<u8> {
        match self.tcp_conns.get_mut(&id) {
            Some(cb) => cb.inbound.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Write `data` back down the connection, emitting one PSH+ACK segment.
    pub fn tcp_write(&mut self, id: ConnId, data: &[u8]) {
        let Some(cb) = self.tcp_conns.get_mut(&id) else {
            return;
        };
        let seq = cb.seq;
        cb.seq = cb.seq.wrapping_add(data.len() as u32);
        let (local, remote, ack) = (cb.local, cb.remote, cb.ack);
        self.emit_tcp(local, remote, seq, ack, TCP_FLAG_ACK, data);
    }

    /// Close the connection gracefully: send FIN+ACK and mark `FinWait`.
    pub fn tcp_close(&mut self, id: ConnId) {
        let Some(cb) = self.tcp_conns.get_mut(&id) else {
            return;
        };
        cb.state = TcpState::FinWait;
        let (local, remote, seq, ack) = (cb.local, cb.remote, cb.seq, cb.ack);
        cb.seq = cb.seq.wrapping_add(1);
        self.emit_tcp(local, remote, seq, ack, TCP_FLAG_FIN | TCP_FLAG_ACK, &[]);
    }

    pub fn tcp_remove(&mut self, id: ConnId) {
        self.tcp_conns.remove(&id);
    }

    pub fn udp_cb(&self, id: ConnId) -> Option<&UdpCb> {
        self.udp_conns.get(&id)
    }

    /// Send one reply datagram back to the admission's source, then forget
    /// the one-shot record: this stack models UDP as stateless admission
    /// events, not persistent flows (spec.md's Non-goals already exclude
    /// guaranteed in-order/lossless UDP delivery beyond SOCKS5 UDP associate).
    pub fn udp_write(&mut self, id: ConnId, data: &[u8]) {
        let Some(cb) = self.udp_conns.remove(&id) else {
            return;
        };
        let Some(output) = self.output.as_ref() else {
            return;
        };
        let Some(bytes) = build_udp_datagram(cb.local, cb.remote, data) else {
            return;
        };
        let Some(ptr) = self.buffers.allocate() else {
            tracing::warn!("buffer pool exhausted, dropping udp reply");
            return;
        };
        // Safety: see `emit_tcp`.
        let mut packet = unsafe { PacketBuf::from_raw(ptr, bytes.len()) };
        packet.as_mut_slice().copy_from_slice(&bytes);
        output(packet);
    }

    pub fn udp_remove(&mut self, id: ConnId) {
        self.udp_conns.remove(&id);
    }

    /// Walk live control blocks for retransmit/keepalive bookkeeping. Coarse
    /// and second-granularity, not a full RTO estimator (see spec note in
    /// `stack`'s module doc).
    pub fn tcp_tmr(&mut self) {
        self.tcp_conns
            .retain(|_, cb| cb.state != TcpState::Closed);
    }

    /// Parse just enough of an IPv4 + TCP/UDP header to route the packet.
    /// The incoming packet's pool slot is always released here: everything
    /// the stack needs is copied out into connection state before this
    /// returns, matching the orchestrator's assumption (spec.md §4.9) that
    /// it only has to free the packet itself on an `input` failure.
    pub fn input(&mut self, mut pkt: PacketBuf) -> Result<(), ()> {
        let result = self.parse_and_route(pkt.as_slice());
        self.buffers.free(pkt.as_mut_slice().as_mut_ptr());
        result
    }

    fn parse_and_route(&mut self, bytes: &[u8]) -> Result<(), ()> {
        if bytes.len() < 20 || bytes[0] >> 4 != 4 {
            return Err(());
        }
        let ihl = ((bytes[0] & 0x0f) as usize) * 4;
        if bytes.len() < ihl + 4 {
            return Err(());
        }
        let protocol = bytes[9];
        let src_ip = Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]);
        let dst_ip = Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]);
        let payload = &bytes[ihl..];

        match protocol {
            PROTO_TCP => self.input_tcp(src_ip, dst_ip, payload),
            PROTO_UDP => self.input_udp(src_ip, dst_ip, payload),
            _ => Err(()),
        }
    }

    fn input_tcp(&mut self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr, seg: &[u8]) -> Result<(), ()> {
        if seg.len() < 20 {
            return Err(());
        }
        let src_port = u16::from_be_bytes([seg[0], seg[1]]);
        let dst_port = u16::from_be_bytes([seg[2], seg[3]]);
        let seq = u32::from_be_bytes([seg[4], seg[5], seg[6], seg[7]]);
        let flags = seg[13];
        let data_offset = ((seg[12] >> 4) as usize) * 4;
        let data = seg.get(data_offset..).unwrap_or(&[]);

        let remote = SocketAddr::new(IpAddr::V4(src_ip), src_port);
        let local = SocketAddr::new(IpAddr::V4(dst_ip), dst_port);

        if let Some(id) = self.find_tcp(remote, local) {
            let cb = self.tcp_conns.get_mut(&id).unwrap();
            cb.last_activity = Instant::now();
            if flags & TCP_FLAG_RST != 0 {
                cb.state = TcpState::Closed;
                return Ok(());
            }
            if flags & TCP_FLAG_FIN != 0 {
                cb.ack = seq.wrapping_add(1);
                cb.state = TcpState::Closed;
                return Ok(());
            }
            if !data.is_empty() {
                cb.inbound.extend(data.iter().copied());
                cb.ack = seq.wrapping_add(data.len() as u32);
            }
            return Ok(());
        }

        if flags & TCP_FLAG_SYN != 0 && self.tcp_listening {
            let id = self.next_id;
            self.next_id += 1;
            let iss = 0u32;
            self.tcp_conns.insert(
                id,
                TcpCb {
                    id,
                    local,
                    remote,
                    state: TcpState::SynReceived,
                    last_activity: Instant::now(),
                    seq: iss.wrapping_add(1),
                    ack: seq.wrapping_add(1),
                    inbound: VecDeque::new(),
                },
            );
            self.emit_tcp(local, remote, iss, seq.wrapping_add(1), TCP_FLAG_SYN | TCP_FLAG_ACK, &[]);
            if let Some(cb) = self.tcp_conns.get_mut(&id) {
                cb.state = TcpState::Established;
            }
            if let Some(handler) = self.accept_handler.take() {
                handler(self, id);
                self.accept_handler = Some(handler);
            }
            return Ok(());
        }

        Err(())
    }

    fn input_udp(&mut self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr, dgram: &[u8]) -> Result<(), ()> {
        if dgram.len() < 8 {
            return Err(());
        }
        let src_port = u16::from_be_bytes([dgram[0], dgram[1]]);
        let dst_port = u16::from_be_bytes([dgram[2], dgram[3]]);
        if !self.udp_listening {
            return Err(());
        }
        let payload = &dgram[8..];
        let id = self.next_id;
        self.next_id += 1;
        let remote = SocketAddr::new(IpAddr::V4(src_ip), src_port);
        let local = SocketAddr::new(IpAddr::V4(dst_ip), dst_port);
        self.udp_conns.insert(id, UdpCb { id, local, remote });

        if let Some(handler) = self.udp_handler.take() {
            handler(self, id, payload);
            self.udp_handler = Some(handler);
        }
        Ok(())
    }

    fn find_tcp(&self, remote: SocketAddr, local: SocketAddr) -> Option<ConnId> {
        self.tcp_conns
            .values()
            .find(|cb| cb.remote == remote && cb.local == local)
            .map(|cb| cb.id)
    }

    fn emit_tcp(&self, local: SocketAddr, remote: SocketAddr, seq: u32, ack: u32, flags: u8, data: &[u8]) {
        let Some(output) = self.output.as_ref() else {
            return;
        };
        let Some(bytes) = build_tcp_segment(local, remote, seq, ack, flags, data) else {
            return;
        };
        let Some(ptr) = self.buffers.allocate() else {
            tracing::warn!("buffer pool exhausted, dropping synthesized tcp segment");
            return;
        };
        // Safety: `ptr` was just claimed from `self.buffers` and is not
        // visible to any other thread until ownership passes to `output`.
        let mut packet = unsafe { PacketBuf::from_raw(ptr, bytes.len()) };
        packet.as_mut_slice().copy_from_slice(&bytes);
        output(packet);
    }
}

fn build_tcp_segment(
    local: SocketAddr,
    remote: SocketAddr,
    seq: u32,
    ack: u32,
    flags: u8,
    data: &[u8],
) -> Option<Vec<u8>> {
    let (SocketAddr::V4(local), SocketAddr::V4(remote)) = (local, remote) else {
        return None;
    };

    let mut tcp = vec![0u8; 20 + data.len()];
    tcp[0..2].copy_from_slice(&local.port().to_be_bytes());
    tcp[2..4].copy_from_slice(&remote.port().to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = 5 << 4;
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&0xffffu16.to_be_bytes());
    tcp[20..].copy_from_slice(data);

    let total_len = 20 + tcp.len();
    let mut ip = vec![0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    ip[8] = 64;
    ip[9] = PROTO_TCP;
    ip[12..16].copy_from_slice(&local.ip().octets());
    ip[16..20].copy_from_slice(&remote.ip().octets());

    ip.extend_from_slice(&tcp);
    Some(ip)
}

fn build_udp_datagram(local: SocketAddr, remote: SocketAddr, data: &[u8]) -> Option<Vec<u8>> {
    let (SocketAddr::V4(local), SocketAddr::V4(remote)) = (local, remote) else {
        return None;
    };

    let mut udp = vec![0u8; 8 + data.len()];
    udp[0..2].copy_from_slice(&local.port().to_be_bytes());
    udp[2..4].copy_from_slice(&remote.port().to_be_bytes());
    udp[4..6].copy_from_slice(&(udp.len() as u16).to_be_bytes());
    udp[8..].copy_from_slice(data);

    let total_len = 20 + udp.len();
    let mut ip = vec![0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    ip[8] = 64;
    ip[9] = PROTO_UDP;
    ip[12..16].copy_from_slice(&local.ip().octets());
    ip[16..20].copy_from_slice(&remote.ip().octets());

    ip.extend_from_slice(&udp);
    Some(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn syn_segment(src_port: u16, dst_port: u16) -> Vec<u8> {
        build_tcp_segment(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), src_port),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), dst_port),
            100,
            0,
            TCP_FLAG_SYN,
            &[],
        )
        .unwrap()
    }

    fn test_packet(buffers: &BufferPool, bytes: &[u8]) -> PacketBuf {
        let ptr = buffers.allocate().unwrap();
        let mut pkt = unsafe { PacketBuf::from_raw(ptr, bytes.len()) };
        pkt.as_mut_slice().copy_from_slice(bytes);
        pkt
    }

    #[test]
    fn syn_to_any_destination_triggers_accept_once_listening() {
        let buffers = Arc::new(BufferPool::new(8));
        let mut stack = Stack::new(buffers.clone());
        stack.listen_tcp();
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let accepted_clone = accepted.clone();
        stack.set_accept_handler(move |_stack, id| accepted_clone.lock().unwrap().push(id));
        stack.set_output(|_pkt| {});

        // Destination port is arbitrary: the gateway intercepts regardless
        // of the original destination (spec.md §4.8).
        let bytes = syn_segment(4000, 9999);
        let pkt = test_packet(&buffers, &bytes);
        stack.input(pkt).unwrap();

        assert_eq!(accepted.lock().unwrap().len(), 1);
        assert_eq!(stack.tcp_conns.len(), 1);
    }

    #[test]
    fn syn_before_listen_tcp_is_rejected() {
        let buffers = Arc::new(BufferPool::new(8));
        let mut stack = Stack::new(buffers.clone());
        let bytes = syn_segment(4000, 9999);
        let pkt = test_packet(&buffers, &bytes);
        assert!(stack.input(pkt).is_err());
    }
}
