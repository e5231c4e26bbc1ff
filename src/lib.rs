//! `tunwire`: a user-space TCP/IP gateway that terminates IP traffic from a
//! host TUN device, reconstructs TCP and UDP flows in user space, and
//! proxies each flow through a remote SOCKS5 server.
//!
//! The packet/flow engine — buffer pool, SPSC ring, fixed and adaptive
//! worker pools, connection pool, TUN I/O engine, session registry, the
//! embedded stack and its timer, and the orchestrator tying them together —
//! lives in [`pool`], [`ring`], [`tunnel_io`], [`session`], [`stack`],
//! [`gateway`] and [`orchestrator`]. Everything else ([`config`], [`error`],
//! [`logging`], [`dns`], [`socks5`]) is the ambient stack a deployable
//! binary needs around that core; see `src/bin/tunwire.rs` for how the
//! binary wires it all together.

pub mod config;
pub mod dns;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod orchestrator;
pub mod packet;
pub mod pool;
pub mod ring;
pub mod session;
pub mod socks5;
pub mod stack;
pub mod stats;
pub mod support;
pub mod tun_device;
pub mod tunnel_io;

/// In-memory test doubles (loopback TUN device, echoing SOCKS5 client) used
/// by this crate's own tests. Not part of the public contract; kept `pub`
/// only so other modules' `#[cfg(test)]` blocks can reach it across module
/// boundaries.
#[cfg(test)]
pub mod test_support;
