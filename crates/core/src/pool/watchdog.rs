//! Periodic pool pressure and leak checks
//!
//! The watchdog runs independently of run outcomes. Each check compares the
//! pool footprint with the configured cap and forces a cleanup when it is
//! exceeded, and tracks the live buffer count (created minus destroyed) to
//! report growth that steady-state reuse should not produce.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use super::ResourcePool;
use crate::config::PoolConfig;

/// Outcome of one watchdog check
#[derive(Debug, Clone, Serialize)]
pub struct MemoryReport {
    /// Pool bytes before any cleanup
    pub bytes_before: usize,
    /// Pool bytes after cleanup
    pub bytes_after: usize,
    /// Buffers destroyed by this check
    pub buffers_freed: usize,
    /// Live buffers (created minus destroyed) at check time
    pub outstanding: u64,
    /// Footprint exceeded the configured cap
    pub over_capacity: bool,
    /// Live buffer count crossed the threshold or kept rising
    pub leak_suspected: bool,
}

/// Periodic pool monitor
#[derive(Debug)]
pub struct MemoryWatchdog {
    config: PoolConfig,
    last_check: Option<Instant>,
    history: VecDeque<u64>,
    checks: u64,
}

impl MemoryWatchdog {
    /// Create a watchdog from pool settings
    pub fn new(config: PoolConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.leak_trend_window),
            config,
            last_check: None,
            checks: 0,
        }
    }

    /// Check interval
    pub fn interval(&self) -> Duration {
        self.config.memory_check_interval()
    }

    /// Number of checks performed
    pub fn checks(&self) -> u64 {
        self.checks
    }

    /// Run a check if the interval has elapsed since the previous one
    pub fn poll(&mut self, pool: &ResourcePool, now: Instant) -> Option<MemoryReport> {
        match self.last_check {
            Some(last) if now.saturating_duration_since(last) < self.interval() => None,
            _ => Some(self.check(pool, now)),
        }
    }

    /// Run a check unconditionally
    pub fn check(&mut self, pool: &ResourcePool, now: Instant) -> MemoryReport {
        self.last_check = Some(now);
        self.checks += 1;

        let bytes_before = pool.estimate_bytes();
        let outstanding = pool.metrics().outstanding();

        if self.history.len() == self.config.leak_trend_window {
            self.history.pop_front();
        }
        self.history.push_back(outstanding);

        let rising = self.history.len() == self.config.leak_trend_window
            && self.history.iter().zip(self.history.iter().skip(1)).all(|(a, b)| b > a);
        let leak_suspected = outstanding > self.config.leak_outstanding_threshold || rising;
        let over_capacity = bytes_before > self.config.max_pool_size_bytes;

        let mut buffers_freed = 0;
        if over_capacity {
            tracing::warn!(
                "Pool footprint {:.1} MB exceeds cap {:.1} MB, forcing cleanup",
                mb(bytes_before),
                mb(self.config.max_pool_size_bytes)
            );
            buffers_freed += pool.force_cleanup();
        }
        if leak_suspected {
            tracing::warn!(
                "Possible buffer leak: {} live buffers (threshold {}, rising: {})",
                outstanding,
                self.config.leak_outstanding_threshold,
                rising
            );
            if self.config.enable_automatic_cleanup && !over_capacity {
                buffers_freed += pool.force_cleanup();
            }
            self.history.clear();
        }

        let bytes_after = pool.estimate_bytes();
        tracing::debug!(
            "Memory check #{}: {:.1} MB -> {:.1} MB, {} live buffers",
            self.checks,
            mb(bytes_before),
            mb(bytes_after),
            outstanding
        );

        MemoryReport {
            bytes_before,
            bytes_after,
            buffers_freed,
            outstanding,
            over_capacity,
            leak_suspected,
        }
    }
}

fn mb(bytes: usize) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}
