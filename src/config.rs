//! Cadences and limits for the engine's pollers and workers.
//!
//! Every timer in the pipeline reads its period from here so that tests can
//! shrink the cadences without touching the components themselves.

/// Tunable knobs for the capture/attribution/aggregation pipeline.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the process index re-enumerates the OS process table.
    pub process_poll_ms: u64,
    /// How often the socket index re-runs netstat.
    pub connection_poll_ms: u64,
    /// How often socket entries are reconciled against the process index.
    pub connection_sync_ms: u64,
    /// How often the packet processing loop drains the capture queue.
    pub packet_process_ms: u64,
    /// Idle threshold after which non-listener UDP mappings are evicted.
    pub udp_stale_ms: i64,
    /// Wall-clock bound on a netstat invocation.
    pub netstat_timeout_ms: u64,
    /// Wall-clock bound on an lsof invocation (macOS pid fallback).
    pub lsof_timeout_ms: u64,
    /// How many processing cycles an unattributed packet is retried.
    pub retry_max: u8,
    /// Upstream geolocation calls issued concurrently per batch.
    pub geo_batch: usize,
    /// Sleep between geolocation batches.
    pub geo_rate_limit_ms: u64,
    /// Upper bound a geolocation caller waits before receiving an empty result.
    pub geo_caller_timeout_ms: u64,
    /// Kernel capture buffer per interface.
    pub capture_buffer_bytes: i32,
    /// Per-packet receive buffer (max frame copied out of the kernel buffer).
    pub capture_snaplen: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            process_poll_ms: 1000,
            connection_poll_ms: 300,
            connection_sync_ms: 1000,
            packet_process_ms: 100,
            udp_stale_ms: 30_000,
            netstat_timeout_ms: 5000,
            lsof_timeout_ms: 2000,
            retry_max: 3,
            geo_batch: 10,
            geo_rate_limit_ms: 700,
            geo_caller_timeout_ms: 30_000,
            capture_buffer_bytes: 0x00A0_0000,
            capture_snaplen: 65_535,
        }
    }
}
