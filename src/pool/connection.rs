//! Bounded cache of idle outbound TCP sockets, keyed by destination,
//! mirroring `hev_connection_pool` upstream. `get`/`release` are the two
//! hot-path operations; liveness is probed with a non-blocking one-byte
//! `MSG_PEEK` before a cached fd is handed back out.

use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Fixed pool capacity (`CONN_POOL_SIZE` upstream).
pub const POOL_SIZE: usize = 128;
/// Idle timeout before a slot is considered stale (`CONN_IDLE_TIMEOUT` upstream).
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct Slot {
    stream: Option<TcpStream>,
    addr: Option<SocketAddr>,
    created_at: Instant,
    last_used_at: Instant,
    use_count: u64,
    in_use: bool,
}

impl Slot {
    fn empty() -> Self {
        let now = Instant::now();
        Slot {
            stream: None,
            addr: None,
            created_at: now,
            last_used_at: now,
            use_count: 0,
            in_use: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionPoolStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
}

impl ConnectionPoolStats {
    pub fn hit_rate(&self) -> f32 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.cache_hits as f32 / self.total_requests as f32
        }
    }
}

struct State {
    slots: Vec<Slot>,
    stats: ConnectionPoolStats,
}

pub struct ConnectionPool {
    state: Mutex<State>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        let slots = (0..POOL_SIZE).map(|_| Slot::empty()).collect();
        ConnectionPool {
            state: Mutex::new(State {
                slots,
                stats: ConnectionPoolStats::default(),
            }),
        }
    }

    /// Get a connected (or connecting) non-blocking socket to `addr`,
    /// reusing an idle cached one when possible.
    pub fn get(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
        {
            let mut state = self.state.lock().unwrap();
            state.stats.total_requests += 1;

            let now = Instant::now();
            let mut found_index = state.slots.iter().enumerate().find_map(|(i, slot)| {
                if !slot.in_use
                    && slot.addr == Some(addr)
                    && now.duration_since(slot.last_used_at) < IDLE_TIMEOUT
                {
                    Some(i)
                } else {
                    None
                }
            });

            while let Some(i) = found_index {
                let alive = peek_alive(state.slots[i].stream.as_ref().unwrap());
                if alive {
                    let slot = &mut state.slots[i];
                    slot.in_use = true;
                    slot.last_used_at = now;
                    slot.use_count += 1;
                    state.stats.cache_hits += 1;
                    // Safety of the reuse contract lives in `release`; cloning
                    // the fd is not an option for `TcpStream`, so callers get a
                    // `try_clone`'d handle and the slot keeps its own.
                    return state.slots[i].stream.as_ref().unwrap().try_clone();
                }

                // Dead: evict and keep scanning for another candidate.
                let slot = &mut state.slots[i];
                slot.stream = None;
                slot.addr = None;
                slot.in_use = false;
                state.stats.evictions += 1;

                found_index = state.slots.iter().enumerate().find_map(|(j, slot)| {
                    if !slot.in_use
                        && slot.addr == Some(addr)
                        && now.duration_since(slot.last_used_at) < IDLE_TIMEOUT
                    {
                        Some(j)
                    } else {
                        None
                    }
                });
            }
        }

        // Miss: dial without holding the pool lock. `hev_connection_pool_get`
        // (hev-connection-pool.c) unlocks before connecting and only
        // re-locks to bump `cache_misses`, so one slow dial never serializes
        // every other caller behind it.
        let stream = connect_nonblocking(addr)?;
        self.state.lock().unwrap().stats.cache_misses += 1;
        Ok(stream)
    }

    /// Return a socket to the pool, either updating its existing slot or
    /// inserting into the first empty one. If the pool is full, the socket
    /// is simply dropped (closed) and counted as an eviction.
    pub fn release(&self, stream: TcpStream, addr: SocketAddr) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        if let Some(slot) = state
            .slots
            .iter_mut()
            .find(|s| s.addr == Some(addr) && s.in_use)
        {
            slot.stream = Some(stream);
            slot.in_use = false;
            slot.last_used_at = now;
            return;
        }

        if let Some(slot) = state.slots.iter_mut().find(|s| s.addr.is_none()) {
            slot.stream = Some(stream);
            slot.addr = Some(addr);
            slot.created_at = now;
            slot.last_used_at = now;
            slot.in_use = false;
            slot.use_count = 0;
            return;
        }

        state.stats.evictions += 1;
        // `stream` drops here, closing the fd.
    }

    /// Close and clear the slot holding `fd`, if any.
    pub fn remove(&self, fd: RawFd) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state
            .slots
            .iter_mut()
            .find(|s| s.stream.as_ref().map(|s| s.as_raw_fd()) == Some(fd))
        {
            slot.stream = None;
            slot.addr = None;
            slot.in_use = false;
            state.stats.evictions += 1;
        }
    }

    /// Close and clear every idle, expired slot.
    pub fn cleanup(&self) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        for slot in state.slots.iter_mut() {
            if !slot.in_use
                && slot.addr.is_some()
                && now.duration_since(slot.last_used_at) >= IDLE_TIMEOUT
            {
                slot.stream = None;
                slot.addr = None;
            }
        }
    }

    pub fn stats(&self) -> ConnectionPoolStats {
        self.state.lock().unwrap().stats
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Open a non-blocking socket and start a connect to `addr`, tolerating
/// `EINPROGRESS`/`EWOULDBLOCK` as success (spec.md §4.5: "open a new
/// non-blocking TCP socket, begin a connect (tolerating 'in progress')").
/// The caller negotiates SOCKS5 once the socket is writable.
fn connect_nonblocking(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    // Safety: `domain`/`SOCK_STREAM`/`0` are valid arguments; the return
    // value is checked below before the fd is used for anything.
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }

    // Safety: `fd` was just created above and is not shared with anything
    // else yet.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    let set_ok = flags >= 0
        && unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } >= 0;
    if !set_ok {
        let err = std::io::Error::last_os_error();
        // Safety: `fd` is still owned here; no `TcpStream` has taken it.
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let result = match addr {
        SocketAddr::V4(v4) => {
            let sockaddr = sockaddr_in_from(v4);
            // Safety: `sockaddr` is a valid, correctly sized `sockaddr_in`
            // and `fd` is the socket just created above.
            unsafe {
                libc::connect(
                    fd,
                    &sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
        }
        SocketAddr::V6(v6) => {
            let sockaddr = sockaddr_in6_from(v6);
            // Safety: see above, `sockaddr_in6` variant.
            unsafe {
                libc::connect(
                    fd,
                    &sockaddr as *const libc::sockaddr_in6 as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
        }
    };

    if result < 0 {
        let err = std::io::Error::last_os_error();
        let in_progress = err.kind() == std::io::ErrorKind::WouldBlock
            || err.raw_os_error() == Some(libc::EINPROGRESS);
        if !in_progress {
            // Safety: `fd` is still owned here; no `TcpStream` has taken it.
            unsafe { libc::close(fd) };
            return Err(err);
        }
    }

    // Safety: `fd` is a valid, open, non-blocking socket, connecting or
    // connected, and is not owned by anything else; `TcpStream` becomes its
    // sole owner from here.
    Ok(unsafe { TcpStream::from_raw_fd(fd) })
}

fn sockaddr_in_from(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(*addr.ip()).to_be(),
        },
        sin_zero: [0; 8],
    }
}

fn sockaddr_in6_from(addr: SocketAddrV6) -> libc::sockaddr_in6 {
    libc::sockaddr_in6 {
        sin6_family: libc::AF_INET6 as libc::sa_family_t,
        sin6_port: addr.port().to_be(),
        sin6_flowinfo: addr.flowinfo(),
        sin6_addr: libc::in6_addr {
            s6_addr: addr.ip().octets(),
        },
        sin6_scope_id: addr.scope_id(),
    }
}

fn peek_alive(stream: &TcpStream) -> bool {
    let fd = stream.as_raw_fd();
    let mut byte: u8 = 0;
    // Safety: `fd` is a valid, open socket borrowed from `stream` for the
    // duration of this call; `recv` with `MSG_PEEK` does not consume data.
    let n = unsafe {
        libc::recv(
            fd,
            &mut byte as *mut u8 as *mut libc::c_void,
            1,
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };

    if n > 0 {
        return true;
    }
    if n == 0 {
        return false; // peer closed
    }
    let errno = std::io::Error::last_os_error();
    matches!(
        errno.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn stats_invariant_holds() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let pool = ConnectionPool::new();

        let s1 = pool.get(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        pool.release(s1, addr);
        drop(accepted);

        // Peer closed: next get() should evict the dead slot and miss.
        let _s2 = pool.get(addr).unwrap();
        let _accepted2 = listener.accept().unwrap();

        let stats = pool.stats();
        assert_eq!(stats.cache_hits + stats.cache_misses, stats.total_requests);
    }

    #[test]
    fn release_without_matching_slot_inserts_into_empty() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let pool = ConnectionPool::new();
        let stream = TcpStream::connect(addr).unwrap();
        let _accepted = listener.accept().unwrap();

        pool.release(stream, addr);
        assert_eq!(pool.stats().evictions, 0);
    }
}
