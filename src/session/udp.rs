//! UDP session body: relays one datagram upstream through a SOCKS5 UDP
//! associate and writes back whatever reply arrives before the association
//! is torn down. The embedded stack models UDP as one-shot admission events
//! rather than persistent flows (see `stack`'s module doc), so each
//! `UdpSession` handles exactly one round trip.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::gateway::StackHandle;
use crate::pool::connection::ConnectionPool;
use crate::socks5::Socks5Client;
use crate::stack::ConnId;

pub struct UdpSession {
    pub id: u64,
    conn_id: ConnId,
    stack: Arc<StackHandle>,
    pool: Arc<ConnectionPool>,
    socks5: Arc<dyn Socks5Client>,
    target: SocketAddr,
    payload: Vec<u8>,
}

impl UdpSession {
    pub fn new(
        id: u64,
        conn_id: ConnId,
        stack: Arc<StackHandle>,
        pool: Arc<ConnectionPool>,
        socks5: Arc<dyn Socks5Client>,
        target: SocketAddr,
        payload: Vec<u8>,
    ) -> Self {
        UdpSession {
            id,
            conn_id,
            stack,
            pool,
            socks5,
            target,
            payload,
        }
    }

    pub fn run(self) {
        let associate = match self.socks5.associate_udp(&self.pool, self.target) {
            Ok(associate) => associate,
            Err(err) => {
                tracing::warn!(session = self.id, error = %err, "udp associate failed");
                self.stack.with_stack(|s| s.udp_remove(self.conn_id));
                return;
            }
        };

        if associate.socket.send(&self.payload).is_err() {
            self.stack.with_stack(|s| s.udp_remove(self.conn_id));
            return;
        }

        let _ = associate.socket.set_read_timeout(Some(Duration::from_millis(500)));
        let mut buf = [0u8; 4096];
        match associate.socket.recv(&mut buf) {
            Ok(n) if n > 0 => {
                self.stack.with_stack(|s| s.udp_write(self.conn_id, &buf[..n]));
            }
            _ => {
                self.stack.with_stack(|s| s.udp_remove(self.conn_id));
            }
        }
    }
}
