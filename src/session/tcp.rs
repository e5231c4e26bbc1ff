//! TCP session body: copies bytes between the stack-side control block and
//! a pooled upstream SOCKS5 connection until EOF or error. This is
//! deliberately the smallest loop that exercises the accept/registry/
//! worker-pool contract — the real forwarding loop is out of scope
//! (spec.md §1).

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::gateway::StackHandle;
use crate::pool::connection::ConnectionPool;
use crate::session::registry::TerminationFlag;
use crate::socks5::Socks5Client;
use crate::stack::ConnId;

pub struct TcpSession {
    pub id: u64,
    conn_id: ConnId,
    stack: Arc<StackHandle>,
    pool: Arc<ConnectionPool>,
    socks5: Arc<dyn Socks5Client>,
    target: SocketAddr,
    termination: TerminationFlag,
}

impl TcpSession {
    pub fn new(
        id: u64,
        conn_id: ConnId,
        stack: Arc<StackHandle>,
        pool: Arc<ConnectionPool>,
        socks5: Arc<dyn Socks5Client>,
        target: SocketAddr,
        termination: TerminationFlag,
    ) -> Self {
        TcpSession {
            id,
            conn_id,
            stack,
            pool,
            socks5,
            target,
            termination,
        }
    }

    /// Run the session body to completion: connect upstream, then shuttle
    /// bytes in both directions until FIN, RST, upstream EOF, or the
    /// registry marks this session for termination.
    pub fn run(self) {
        let mut upstream = match self.socks5.connect_tcp(&self.pool, self.target) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(session = self.id, error = %err, "tcp session upstream connect failed");
                self.stack.with_stack(|s| s.tcp_close(self.conn_id));
                return;
            }
        };

        loop {
            if self.termination.is_marked() {
                tracing::debug!(session = self.id, "tcp session terminated by registry cap");
                break;
            }

            let inbound = self.stack.with_stack(|s| s.tcp_read(self.conn_id));
            if !inbound.is_empty() && upstream.write_all(&inbound).is_err() {
                break;
            }

            let mut buf = [0u8; 4096];
            match upstream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.stack.with_stack(|s| s.tcp_write(self.conn_id, &buf[..n])),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }

            let closed = self
                .stack
                .with_stack(|s| s.tcp_cb(self.conn_id).map(|cb| cb.state))
                .map(|state| state == crate::stack::TcpState::Closed)
                .unwrap_or(true);
            if closed {
                break;
            }

            std::thread::sleep(Duration::from_millis(5));
        }

        self.stack.with_stack(|s| {
            s.tcp_close(self.conn_id);
            s.tcp_remove(self.conn_id);
        });
    }
}
