//! A minimal SOCKS5 client: just enough of RFC 1928's no-auth handshake and
//! the CONNECT/UDP ASSOCIATE commands to drive a session body to completion
//! against a real upstream. The engine only ever sees this through the
//! [`Socks5Client`] trait — the handshake/forwarding loop itself is out of
//! scope per spec.md §1, so this stays deliberately small.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};

use crate::pool::connection::ConnectionPool;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_IPV6: u8 = 0x04;

/// A UDP association: the local socket to send/receive framed datagrams on,
/// plus the relay address the server expects each datagram addressed to.
pub struct UdpAssociate {
    pub socket: UdpSocket,
    pub relay_addr: SocketAddr,
}

/// The SOCKS5 client contract a session body drives after obtaining a pooled
/// fd. Out of scope per spec.md §1; kept behind a trait so the engine never
/// depends on a specific client's internals.
pub trait Socks5Client: Send + Sync {
    fn connect_tcp(&self, pool: &ConnectionPool, target: SocketAddr) -> io::Result<TcpStream>;
    fn associate_udp(&self, pool: &ConnectionPool, target: SocketAddr) -> io::Result<UdpAssociate>;
}

/// Talks RFC 1928 no-auth directly to a configured upstream SOCKS5 server.
pub struct DirectSocks5Client {
    server: SocketAddr,
}

impl DirectSocks5Client {
    pub fn new(server: SocketAddr) -> Self {
        DirectSocks5Client { server }
    }

    fn handshake(&self, stream: &mut TcpStream) -> io::Result<()> {
        stream.write_all(&[VERSION, 1, METHOD_NO_AUTH])?;
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply)?;
        if reply[0] != VERSION || reply[1] != METHOD_NO_AUTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "socks5 server rejected no-auth negotiation",
            ));
        }
        Ok(())
    }

    fn send_request(&self, stream: &mut TcpStream, cmd: u8, target: SocketAddr) -> io::Result<SocketAddr> {
        let mut request = vec![VERSION, cmd, 0x00];
        encode_address(&mut request, target);
        stream.write_all(&request)?;

        let mut header = [0u8; 4];
        stream.read_exact(&mut header)?;
        if header[0] != VERSION {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad socks5 reply version"));
        }
        if header[1] != 0x00 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("socks5 server returned error code {}", header[1]),
            ));
        }

        decode_bound_address(stream, header[3])
    }
}

impl Socks5Client for DirectSocks5Client {
    fn connect_tcp(&self, pool: &ConnectionPool, target: SocketAddr) -> io::Result<TcpStream> {
        let mut stream = pool.get(self.server)?;
        stream.set_nonblocking(false)?;
        self.handshake(&mut stream)?;
        self.send_request(&mut stream, CMD_CONNECT, target)?;
        stream.set_nonblocking(true)?;
        Ok(stream)
    }

    fn associate_udp(&self, pool: &ConnectionPool, target: SocketAddr) -> io::Result<UdpAssociate> {
        let mut stream = pool.get(self.server)?;
        stream.set_nonblocking(false)?;
        self.handshake(&mut stream)?;
        let relay_addr = self.send_request(&mut stream, CMD_UDP_ASSOCIATE, target)?;

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(relay_addr)?;
        // The control TCP connection must stay open for the life of the
        // association; leak it into the pool under the server address so a
        // later `release` (driven by the session body) can reclaim it.
        pool.release(stream, self.server);

        Ok(UdpAssociate { socket, relay_addr })
    }
}

fn encode_address(out: &mut Vec<u8>, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            out.push(ATYP_IPV4);
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
        }
        SocketAddr::V6(v6) => {
            out.push(ATYP_IPV6);
            out.extend_from_slice(&v6.ip().octets());
            out.extend_from_slice(&v6.port().to_be_bytes());
        }
    }
}

fn decode_bound_address(stream: &mut TcpStream, atyp: u8) -> io::Result<SocketAddr> {
    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf)?;
            let ip = std::net::Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Ok(SocketAddr::from((ip, port)))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = std::net::Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Ok(SocketAddr::from((ip, port)))
        }
        0x03 => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "domain-name bound address not supported",
        )),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown socks5 address type {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_ipv4_target() {
        let mut out = Vec::new();
        encode_address(&mut out, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(out, vec![ATYP_IPV4, 127, 0, 0, 1, 0x1f, 0x90]);
    }

    #[test]
    fn encodes_ipv6_target() {
        let mut out = Vec::new();
        encode_address(&mut out, "[::1]:80".parse().unwrap());
        assert_eq!(out[0], ATYP_IPV6);
        assert_eq!(out.len(), 1 + 16 + 2);
    }
}
