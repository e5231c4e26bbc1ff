//! Small platform-support helpers: CPU counting and the thread-count
//! heuristics the engine derives from it. Stands in for the optional
//! CPU/NUMA/SIMD/io_uring/eBPF accelerators in spec.md's component table;
//! this crate only implements the portable subset those accelerators would
//! otherwise short-circuit.

/// Number of logical CPUs, clamped to at least 1.
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// `clamp(2 * cores, 2, 64)`, the fixed worker pool's default thread count.
pub fn default_worker_count() -> usize {
    (2 * cpu_count()).clamp(2, 64)
}

/// Reader/writer thread fan-out for the TUN I/O engine: 1 below 4 cores,
/// else 2.
pub fn default_io_thread_count() -> usize {
    if cpu_count() < 4 {
        1
    } else {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_is_bounded() {
        let n = default_worker_count();
        assert!((2..=64).contains(&n));
    }

    #[test]
    fn io_thread_count_is_one_or_two() {
        assert!(matches!(default_io_thread_count(), 1 | 2));
    }
}
