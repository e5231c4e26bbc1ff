//! Wires every other component together: owns start/stop, dispatches the
//! stack's accept/receive callbacks onto the adaptive worker pool, and
//! exposes the process lifecycle API of spec.md §6
//! (`init`/`run`/`stop`/`stats`/`fini`). Grounded in the global-state glue of
//! `original_source/hev-socks5-tunnel.c` (`tcp_accept_handler`,
//! `udp_recv_handler`, `hev_socks5_tunnel_run`/`_stop`/`_stats`), adapted so
//! ownership lives in one struct instead of file-scope statics.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::TunnelConfig;
use crate::dns::MappedDns;
use crate::error::{Result, TunnelError};
use crate::gateway::{Gateway, StackHandle};
use crate::packet::PacketNode;
use crate::pool::adaptive::{AdaptivePool, AdaptivePoolConfig};
use crate::pool::buffer::BufferPool;
use crate::pool::connection::ConnectionPool;
use crate::session::registry::next_session_id;
use crate::session::{tcp::TcpSession, udp::UdpSession, Session, SessionRegistry};
use crate::socks5::Socks5Client;
use crate::stack::{ConnId, Stack};
use crate::stats::TunnelStats;
use crate::tun_device::TunDevice;
use crate::tunnel_io::TunnelIo;

/// Everything the accept/receive callbacks need to build and dispatch a
/// session, bundled so the closures registered on [`Stack`] don't have to
/// capture a dozen separate `Arc`s.
struct Dispatch {
    running: Arc<AtomicBool>,
    registry: Arc<SessionRegistry>,
    workers: Arc<AdaptivePool>,
    connections: Arc<ConnectionPool>,
    socks5: Arc<dyn Socks5Client>,
    dns: Option<Arc<MappedDns>>,
}

impl Dispatch {
    fn submit(&self, session_id: u64, session: Session) {
        let registry = self.registry.clone();
        let result = self.workers.submit(Box::new(move || {
            session.run();
            registry.remove(session_id);
        }));
        if result.is_err() {
            tracing::error!(session_id, "failed to submit session to worker pool");
            self.registry.remove(session_id);
        }
    }
}

/// Wires the buffer pool, TUN I/O engine, embedded stack, session registry
/// and adaptive worker pool into one running gateway, per spec.md §4.9.
pub struct Orchestrator<D: TunDevice + Send + Sync + 'static> {
    config: TunnelConfig,
    tunnel_io: Arc<TunnelIo<D>>,
    gateway: Mutex<Gateway>,
    gateway_running: Arc<AtomicBool>,
    registry: Arc<SessionRegistry>,
    workers: Arc<AdaptivePool>,
    connections: Arc<ConnectionPool>,
    buffers: Arc<BufferPool>,
    /// Flips to `false` on `stop()`; read by the accept/receive callbacks so
    /// a packet already in flight is rejected instead of spawning a session
    /// after shutdown has been requested.
    dispatch_running: Arc<AtomicBool>,
    /// Whether `run()` has ever started the engine; `stats()` reports zeros
    /// until this is true, per spec.md §6.
    started: AtomicBool,
}

impl<D: TunDevice + Send + Sync + 'static> Orchestrator<D> {
    /// Build the gateway over an already-open TUN device. Opening/closing
    /// the device itself, and running post-up/pre-down scripts, are the
    /// CLI's job (spec.md §1 puts the platform TUN open/close syscalls out
    /// of scope for this core).
    pub fn init(device: D, config: TunnelConfig, socks5: Arc<dyn Socks5Client>) -> Result<Self> {
        if config.tunnel_mtu == 0 {
            return Err(TunnelError::Configuration("tunnel_mtu must be non-zero".into()));
        }

        let buffers = Arc::new(BufferPool::new(crate::pool::buffer::MAX_BUFFERS));
        let tunnel_io = Arc::new(TunnelIo::new(device, config.tunnel_mtu as usize, buffers.clone()));

        let stack = Stack::new(buffers.clone());
        let write_hook = {
            let tunnel_io = tunnel_io.clone();
            move |pkt| {
                if tunnel_io.write(PacketNode::new(pkt, 0)).is_err() {
                    tracing::warn!("dropped outbound packet: writer queue full");
                }
            }
        };
        let gateway = Gateway::init(stack, write_hook);
        let gateway_running = gateway.running_handle();

        let registry = Arc::new(SessionRegistry::new(config.max_session_count));
        let connections = Arc::new(ConnectionPool::new());
        let adaptive_config = AdaptivePoolConfig {
            max_threads: if config.worker_threads == 0 {
                crate::support::default_worker_count()
            } else {
                config.worker_threads
            },
            ..AdaptivePoolConfig::default()
        };
        let workers = Arc::new(AdaptivePool::new(adaptive_config));
        let dns = config.mapped_dns.clone().map(|cfg| Arc::new(MappedDns::new(cfg)));
        let dispatch_running = Arc::new(AtomicBool::new(true));

        let dispatch = Arc::new(Dispatch {
            running: dispatch_running.clone(),
            registry: registry.clone(),
            workers: workers.clone(),
            connections: connections.clone(),
            socks5,
            dns,
        });

        let stack_handle = gateway.stack.clone();
        gateway.stack.with_stack(|s| {
            let handle = stack_handle.clone();
            let dispatch_for_accept = dispatch.clone();
            s.set_accept_handler(move |s, conn_id| {
                accept_tcp(s, conn_id, &handle, &dispatch_for_accept);
            });

            let handle = stack_handle.clone();
            s.set_udp_handler(move |s, conn_id, payload| {
                receive_udp(s, conn_id, payload, &handle, &dispatch);
            });
        });

        let read_stack = gateway.stack.clone();
        tunnel_io.set_read_callback(move |pkt| {
            read_stack.with_stack(|s| {
                let _ = s.input(pkt);
            });
        });

        Ok(Orchestrator {
            config,
            tunnel_io,
            gateway: Mutex::new(gateway),
            gateway_running,
            registry,
            workers,
            connections,
            buffers,
            dispatch_running,
            started: AtomicBool::new(false),
        })
    }

    /// Start the timer thread and the TUN I/O engine, then block until the
    /// timer thread exits (i.e. until [`Orchestrator::stop`] is observed).
    pub fn run(&self) -> Result<()> {
        self.started.store(true, Ordering::Release);
        self.tunnel_io.start()?;

        let handle = {
            let mut gateway = self.gateway.lock().unwrap();
            gateway.start_timer();
            gateway.take_timer_handle()
        };

        tracing::info!(tunnel_name = %self.config.tunnel_name, "tunnel running");
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        tracing::info!("tunnel stopped");
        Ok(())
    }

    /// Signal shutdown. Safe to call from any thread: flips two atomic
    /// flags and calls the I/O engine's own `stop`, which is the only lock
    /// acquisition on this path (spec.md §6).
    pub fn stop(&self) {
        self.dispatch_running.store(false, Ordering::Release);
        self.gateway_running.store(false, Ordering::Release);
        self.tunnel_io.stop();
    }

    /// Aggregate statistics, or all-zero if the engine was never started.
    pub fn stats(&self) -> TunnelStats {
        if !self.started.load(Ordering::Acquire) {
            return TunnelStats::default();
        }
        TunnelStats {
            tunnel_io: self.tunnel_io.stats(),
            connection_pool: self.connections.stats(),
            buffer_pool_allocated: self.buffers.allocated(),
            buffer_pool_peak: self.buffers.peak(),
            session_count: self.registry.len(),
            worker_queue_depth: self.workers.queue_depth(),
        }
    }

    /// Tear everything down in reverse construction order: stop, join the
    /// timer if it is still running, drop the worker pool (drains its
    /// queue), clear the session registry.
    pub fn fini(&self) {
        self.stop();
        if let Some(handle) = self.gateway.lock().unwrap().take_timer_handle() {
            let _ = handle.join();
        }
        self.registry.clear();
        tracing::info!("tunnel finalized");
    }
}

impl<D: TunDevice + Send + Sync + 'static> Drop for Orchestrator<D> {
    fn drop(&mut self) {
        self.fini();
    }
}

fn accept_tcp(s: &mut Stack, conn_id: ConnId, stack_handle: &Arc<StackHandle>, dispatch: &Arc<Dispatch>) {
    if !dispatch.running.load(Ordering::Acquire) {
        s.tcp_close(conn_id);
        s.tcp_remove(conn_id);
        return;
    }

    let Some(target) = s.tcp_cb(conn_id).map(|cb| cb.local) else {
        return;
    };

    let session_id = next_session_id();
    let termination = dispatch.registry.insert(session_id);
    let session = Session::Tcp(TcpSession::new(
        session_id,
        conn_id,
        stack_handle.clone(),
        dispatch.connections.clone(),
        dispatch.socks5.clone(),
        target,
        termination,
    ));
    dispatch.submit(session_id, session);
}

fn receive_udp(
    s: &mut Stack,
    conn_id: ConnId,
    payload: &[u8],
    stack_handle: &Arc<StackHandle>,
    dispatch: &Arc<Dispatch>,
) {
    if !dispatch.running.load(Ordering::Acquire) {
        s.udp_remove(conn_id);
        return;
    }

    let Some(cb) = s.udp_cb(conn_id) else {
        return;
    };
    let (local, remote) = (cb.local, cb.remote);

    if let (Some(dns), IpAddr::V4(addr)) = (dispatch.dns.as_ref(), local.ip()) {
        if dns.matches(addr, local.port()) {
            let reply = dns.handle(payload);
            if !reply.is_empty() {
                s.udp_write(conn_id, &reply);
            } else {
                s.udp_remove(conn_id);
            }
            return;
        }
    }

    let session_id = next_session_id();
    // UDP sessions are one-shot admission events (see `stack`'s module doc)
    // and never check a `TerminationFlag`; the registry entry still exists
    // so `max_session_count` accounting stays accurate for UDP too.
    let _termination = dispatch.registry.insert(session_id);
    let session = Session::Udp(UdpSession::new(
        session_id,
        conn_id,
        stack_handle.clone(),
        dispatch.connections.clone(),
        dispatch.socks5.clone(),
        remote,
        payload.to_vec(),
    ));
    dispatch.submit(session_id, session);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{LoopbackSocks5Client, LoopbackTun};
    use std::net::Ipv4Addr;
    use std::time::{Duration, Instant};

    fn test_config() -> TunnelConfig {
        TunnelConfig {
            tunnel_name: "tun-test".into(),
            tunnel_mtu: 1500,
            tunnel_ipv4_address: None,
            tunnel_ipv6_address: None,
            post_up_script: None,
            pre_down_script: None,
            max_session_count: 0,
            socks5_server: "127.0.0.1:1".parse().unwrap(),
            mapped_dns: None,
            worker_threads: 2,
        }
    }

    fn syn_segment(src_port: u16, dst_port: u16, dst_ip: Ipv4Addr) -> Vec<u8> {
        let mut seg = vec![0u8; 20];
        seg[0..2].copy_from_slice(&src_port.to_be_bytes());
        seg[2..4].copy_from_slice(&dst_port.to_be_bytes());
        seg[12] = 5 << 4;
        seg[13] = 0x02; // SYN

        let total_len = 20 + seg.len();
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        ip[8] = 64;
        ip[9] = 6; // TCP
        ip[12..16].copy_from_slice(&[10, 0, 0, 2]);
        ip[16..20].copy_from_slice(&dst_ip.octets());
        ip.extend_from_slice(&seg);
        ip
    }

    #[test]
    fn stats_are_zero_before_run() {
        let device = LoopbackTun::new();
        let orchestrator =
            Orchestrator::init(device, test_config(), Arc::new(LoopbackSocks5Client)).unwrap();
        let stats = orchestrator.stats();
        assert_eq!(stats.session_count, 0);
        assert_eq!(stats.tunnel_io.rx_packets, 0);
    }

    #[test]
    fn injected_syn_is_accepted_registered_and_eventually_unregistered() {
        let device = LoopbackTun::new();
        let orchestrator =
            Orchestrator::init(device.clone(), test_config(), Arc::new(LoopbackSocks5Client)).unwrap();
        orchestrator.tunnel_io.start().unwrap();

        // Port 9 (discard) is refused immediately when nothing is bound,
        // so the session body fails fast instead of blocking this test.
        let bytes = syn_segment(4000, 9, Ipv4Addr::new(127, 0, 0, 1));
        device.inject(&bytes);

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if orchestrator.registry.len() == 0 && device.take_written().is_some() {
                break;
            }
            if Instant::now() > deadline {
                panic!("session was never registered and unregistered in time");
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        orchestrator.tunnel_io.stop();
    }
}
