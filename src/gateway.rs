//! The process-singleton gateway interface: binds the embedded [`Stack`] to
//! a loopback-addressed virtual interface, installs the accept/receive
//! handlers, wires the stack's output hook to the TUN I/O write path, and
//! runs the protocol timer thread. Grounded in `gateway_init`/`gateway_fini`
//! and `timer_thread_func` in `original_source/hev-socks5-tunnel.c`.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::stack::Stack;

/// Milliseconds between protocol timer ticks (`TCP_TMR_INTERVAL` upstream).
pub const TCP_TMR_INTERVAL: Duration = Duration::from_millis(250);

/// Owns the single, non-reentrant stack behind a plain mutex. Every access
/// goes through [`StackHandle::with_stack`], so no caller can hold a guard
/// across a blocking call or another lock acquisition — there is no way to
/// extract the guard itself.
pub struct StackHandle {
    stack: Mutex<Stack>,
}

impl StackHandle {
    pub fn new(stack: Stack) -> Arc<Self> {
        Arc::new(StackHandle {
            stack: Mutex::new(stack),
        })
    }

    pub fn with_stack<R>(&self, f: impl FnOnce(&mut Stack) -> R) -> R {
        let mut guard = self.stack.lock().unwrap();
        f(&mut guard)
    }
}

/// Loopback addresses the virtual interface presents; all inbound TCP is
/// treated as if it terminated locally regardless of destination address
/// (spec.md §4.8).
pub const LOOPBACK_V4: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
pub const LOOPBACK_V6: Ipv6Addr = Ipv6Addr::LOCALHOST;

pub struct Gateway {
    pub stack: Arc<StackHandle>,
    running: Arc<AtomicBool>,
    timer: Option<JoinHandle<()>>,
}

impl Gateway {
    /// Bring up the virtual interface: listening TCP/UDP control blocks,
    /// output hook wired to `write_hook`. Does not start the timer thread;
    /// call [`Gateway::start_timer`] once the orchestrator is otherwise
    /// ready to dispatch callbacks.
    pub fn init(
        stack: Stack,
        write_hook: impl Fn(crate::packet::PacketBuf) + Send + Sync + 'static,
    ) -> Self {
        let mut stack = stack;
        stack.listen_tcp();
        stack.listen_udp();
        stack.set_output(write_hook);

        tracing::info!("gateway interface up");

        Gateway {
            stack: StackHandle::new(stack),
            running: Arc::new(AtomicBool::new(false)),
            timer: None,
        }
    }

    /// Spawn the dedicated timer thread: ticks the stack's TCP timer every
    /// `TCP_TMR_INTERVAL`.
    pub fn start_timer(&mut self) {
        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        let stack = self.stack.clone();
        let handle = thread::Builder::new()
            .name("tunwire-timer".into())
            .spawn(move || {
                let mut tick: u64 = 0;
                while running.load(Ordering::Acquire) {
                    thread::sleep(TCP_TMR_INTERVAL);
                    if !running.load(Ordering::Acquire) {
                        break;
                    }
                    stack.with_stack(|s| s.tcp_tmr());
                    tick = tick.wrapping_add(1);
                    if tick % 4 == 0 {
                        tracing::trace!("reassembly/neighbor-discovery tick");
                    }
                }
            })
            .expect("failed to spawn timer thread");
        self.timer = Some(handle);
        tracing::info!("timer thread started");
    }

    pub fn fini(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.timer.take() {
            let _ = handle.join();
        }
        tracing::info!("gateway interface down");
    }

    /// The timer thread's `running` flag, shared so a caller can request
    /// shutdown (`store(false, ...)`) without acquiring any lock — the
    /// orchestrator's `stop()` relies on this to stay lock-free per spec.md
    /// §6 ("performs no allocation and no lock acquisition beyond the I/O
    /// engine's own stop").
    pub fn running_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Take ownership of the timer's `JoinHandle` so a caller can join it
    /// outside of whatever lock guards this `Gateway`. Returns `None` if the
    /// timer was never started or has already been taken.
    pub fn take_timer_handle(&mut self) -> Option<JoinHandle<()>> {
        self.timer.take()
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.fini();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::buffer::BufferPool;
    use std::sync::Arc as StdArc;

    #[test]
    fn timer_ticks_without_panicking() {
        let buffers = StdArc::new(BufferPool::new(4));
        let stack = Stack::new(buffers);
        let mut gateway = Gateway::init(stack, |_pkt| {});
        gateway.start_timer();
        thread::sleep(Duration::from_millis(30));
        gateway.fini();
    }
}
