//! Reader and writer thread groups moving IP datagrams between the TUN fd
//! and the embedded stack, grounded in `hev-tunnel-io.h`'s
//! "Multi-threaded TUN I/O Management" surface. The writer side is a
//! bounded mutex+condvar queue rather than the lock-free SPSC ring: there
//! are up to two writer threads draining it, so a true SPSC ring does not
//! apply (see `ring.rs`'s doc comment for the same reasoning on the
//! adaptive pool's queue).

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::TunnelError;
use crate::packet::{PacketBuf, PacketNode};
use crate::pool::buffer::BufferPool;
use crate::tun_device::TunDevice;

pub const WRITE_BATCH_SIZE: usize = 16;
pub const WRITE_QUEUE_SIZE: usize = 4096;

#[derive(Debug, Default)]
pub struct TunnelIoStats {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

type ReadCallback = dyn Fn(PacketBuf) + Send + Sync;

struct Counters {
    rx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    tx_packets: AtomicU64,
    tx_bytes: AtomicU64,
}

struct Inner<D: TunDevice> {
    device: D,
    mtu: usize,
    running: AtomicBool,
    write_queue: Mutex<VecDeque<PacketNode>>,
    write_cond: Condvar,
    read_cb: Mutex<Option<Box<ReadCallback>>>,
    buffers: Arc<BufferPool>,
    counters: Counters,
}

/// Owns the reader/writer thread fan-out for one TUN device. `start`/`stop`
/// take `&self` so this type can live behind a plain `Arc` shared with the
/// gateway's output hook, which only ever needs `write`.
pub struct TunnelIo<D: TunDevice + Send + Sync + 'static> {
    inner: Arc<Inner<D>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    writers: Mutex<Vec<JoinHandle<()>>>,
}

impl<D: TunDevice + Send + Sync + 'static> TunnelIo<D> {
    pub fn new(device: D, mtu: usize, buffers: Arc<BufferPool>) -> Self {
        let inner = Arc::new(Inner {
            device,
            mtu,
            running: AtomicBool::new(false),
            write_queue: Mutex::new(VecDeque::new()),
            write_cond: Condvar::new(),
            read_cb: Mutex::new(None),
            buffers,
            counters: Counters {
                rx_packets: AtomicU64::new(0),
                rx_bytes: AtomicU64::new(0),
                tx_packets: AtomicU64::new(0),
                tx_bytes: AtomicU64::new(0),
            },
        });

        TunnelIo {
            inner,
            readers: Mutex::new(Vec::new()),
            writers: Mutex::new(Vec::new()),
        }
    }

    pub fn set_read_callback<F>(&self, callback: F)
    where
        F: Fn(PacketBuf) + Send + Sync + 'static,
    {
        *self.inner.read_cb.lock().unwrap() = Some(Box::new(callback));
    }

    pub fn start(&self) -> Result<(), TunnelError> {
        self.inner.running.store(true, Ordering::Release);
        let num_readers = crate::support::default_io_thread_count();
        let num_writers = crate::support::default_io_thread_count();

        let mut readers = self.readers.lock().unwrap();
        for id in 0..num_readers {
            let inner = self.inner.clone();
            let handle = thread::Builder::new()
                .name(format!("tunwire-reader-{id}"))
                .spawn(move || reader_loop(id, inner))
                .map_err(|e| TunnelError::FatalIo(io::Error::other(e.to_string())))?;
            readers.push(handle);
        }

        let mut writers = self.writers.lock().unwrap();
        for id in 0..num_writers {
            let inner = self.inner.clone();
            let handle = thread::Builder::new()
                .name(format!("tunwire-writer-{id}"))
                .spawn(move || writer_loop(id, inner))
                .map_err(|e| TunnelError::FatalIo(io::Error::other(e.to_string())))?;
            writers.push(handle);
        }

        tracing::info!(num_readers, num_writers, "tunnel I/O started");
        Ok(())
    }

    /// Stop and join readers first, then writers, matching the upstream
    /// shutdown order.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        {
            let _q = self.inner.write_queue.lock().unwrap();
            self.inner.write_cond.notify_all();
        }
        for handle in self.readers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        for handle in self.writers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        tracing::info!("tunnel I/O stopped");
    }

    /// Queue a packet for writing. Rejects with the packet back if the
    /// write queue is at capacity.
    pub fn write(&self, node: PacketNode) -> Result<(), PacketNode> {
        let mut queue = self.inner.write_queue.lock().unwrap();
        if queue.len() >= WRITE_QUEUE_SIZE {
            tracing::warn!("tunnel I/O write queue full, dropping packet");
            return Err(node);
        }
        queue.push_back(node);
        self.inner.write_cond.notify_one();
        Ok(())
    }

    pub fn stats(&self) -> TunnelIoStats {
        TunnelIoStats {
            rx_packets: self.inner.counters.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.inner.counters.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.inner.counters.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.inner.counters.tx_bytes.load(Ordering::Relaxed),
        }
    }
}

impl<D: TunDevice + Send + Sync + 'static> Drop for TunnelIo<D> {
    fn drop(&mut self) {
        if self.inner.running.load(Ordering::Acquire) {
            self.stop();
        }
    }
}

fn reader_loop<D: TunDevice>(id: usize, inner: Arc<Inner<D>>) {
    let mut scratch = vec![0u8; inner.mtu + 4];
    tracing::debug!(id, "tun reader started");

    while inner.running.load(Ordering::Acquire) {
        match inner.device.read(&mut scratch) {
            Ok(0) => continue,
            Ok(n) => {
                let Some(ptr) = inner.buffers.allocate() else {
                    tracing::warn!("buffer pool exhausted, dropping inbound packet");
                    continue;
                };
                // Safety: `ptr` was just claimed from `inner.buffers` and is
                // not visible to any other thread until this `PacketBuf`
                // goes out of scope or its ownership is transferred.
                let mut packet = unsafe { PacketBuf::from_raw(ptr, n) };
                packet.as_mut_slice().copy_from_slice(&scratch[..n]);

                inner.counters.rx_packets.fetch_add(1, Ordering::Relaxed);
                inner
                    .counters
                    .rx_bytes
                    .fetch_add(n as u64, Ordering::Relaxed);

                let cb = inner.read_cb.lock().unwrap();
                match cb.as_ref() {
                    Some(callback) => callback(packet),
                    None => inner.buffers.free(packet.into_raw()),
                }
            }
            Err(err) => match TunnelError::from_tun_read(err) {
                TunnelError::TransientIo(_) => {
                    thread::sleep(Duration::from_millis(1));
                }
                fatal => {
                    tracing::error!(id, error = %fatal, "tun reader aborting");
                    break;
                }
            },
        }
    }
    tracing::debug!(id, "tun reader stopped");
}

fn writer_loop<D: TunDevice>(id: usize, inner: Arc<Inner<D>>) {
    tracing::debug!(id, "tun writer started");
    loop {
        let mut batch = Vec::with_capacity(WRITE_BATCH_SIZE);
        {
            let mut queue = inner.write_queue.lock().unwrap();
            loop {
                if !queue.is_empty() {
                    break;
                }
                if !inner.running.load(Ordering::Acquire) {
                    break;
                }
                let (guard, _timeout) = inner
                    .write_cond
                    .wait_timeout(queue, Duration::from_millis(1))
                    .unwrap();
                queue = guard;
            }

            if queue.is_empty() && !inner.running.load(Ordering::Acquire) {
                break;
            }

            for _ in 0..WRITE_BATCH_SIZE {
                match queue.pop_front() {
                    Some(node) => batch.push(node),
                    None => break,
                }
            }
        }

        for mut node in batch {
            let len = node.buf.len();
            match inner.device.write(node.buf.as_mut_slice()) {
                Ok(_) => {
                    inner.counters.tx_packets.fetch_add(1, Ordering::Relaxed);
                    inner
                        .counters
                        .tx_bytes
                        .fetch_add(len as u64, Ordering::Relaxed);
                }
                Err(err) => {
                    if !matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) {
                        tracing::warn!(id, error = %err, "tun write failed, dropping packet");
                    }
                }
            }
            inner.buffers.free(node.buf.into_raw());
        }
    }
    tracing::debug!(id, "tun writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::LoopbackTun;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn loopback_write_then_read_roundtrips() {
        let buffers = Arc::new(BufferPool::new(16));
        let device = LoopbackTun::new();
        let mut io = TunnelIo::new(device, 1500, buffers.clone());

        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();
        io.set_read_callback(move |pkt| {
            received_clone.fetch_add(pkt.len(), Ordering::SeqCst);
        });

        io.start().unwrap();

        let ptr = buffers.allocate().unwrap();
        let mut packet = unsafe { PacketBuf::from_raw(ptr, 4) };
        packet.as_mut_slice().copy_from_slice(&[1, 2, 3, 4]);
        io.inner.device.inject(packet.as_slice());
        io.write(PacketNode::new(packet, 0)).unwrap();

        thread::sleep(Duration::from_millis(50));
        io.stop();

        assert!(received.load(Ordering::SeqCst) > 0);
    }
}
