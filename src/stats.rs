//! Aggregate counters surfaced by `Orchestrator::stats`, pulling from each
//! component's own statistics rather than duplicating state.

use crate::pool::connection::ConnectionPoolStats;
use crate::tunnel_io::TunnelIoStats;

#[derive(Debug, Default)]
pub struct TunnelStats {
    pub tunnel_io: TunnelIoStats,
    pub connection_pool: ConnectionPoolStats,
    pub buffer_pool_allocated: usize,
    pub buffer_pool_peak: usize,
    pub session_count: usize,
    pub worker_queue_depth: usize,
}
