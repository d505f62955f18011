//! Image buffer pool
//!
//! Buffers are bucketed by (resolution, format). Acquiring reuses a released
//! buffer from the matching bucket when one exists and allocates otherwise;
//! releasing moves the buffer back into its bucket without freeing it. Only
//! [`ResourcePool::force_cleanup`] (memory pressure) and
//! [`ResourcePool::release_all`] (teardown) actually destroy buffers.
//!
//! Every tracked buffer is either in the available buckets or in the in-use
//! set, never both.

pub mod watchdog;

pub use watchdog::{MemoryReport, MemoryWatchdog};

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::data::{BufferId, FilterMode, ImageBuffer, PixelFormat, Resolution};
use crate::{Error, Result};

/// Bucket key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    /// Buffer resolution
    pub resolution: Resolution,
    /// Buffer format
    pub format: PixelFormat,
}

impl PoolKey {
    /// Create a key
    pub fn new(resolution: Resolution, format: PixelFormat) -> Self {
        Self { resolution, format }
    }

    /// Bytes one buffer of this key accounts for
    pub fn byte_size(&self) -> usize {
        self.resolution.pixel_count() * self.format.bytes_per_pixel()
    }
}

/// Pool metrics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolMetrics {
    /// Buffers waiting in the available buckets
    pub available_buffers: usize,
    /// Buffers currently handed out
    pub in_use_buffers: usize,
    /// Bytes held by available buffers
    pub bytes_available: usize,
    /// Bytes held by in-use buffers
    pub bytes_in_use: usize,
    /// Buffers allocated since creation
    pub total_created: u64,
    /// Acquisitions served from a bucket
    pub total_reused: u64,
    /// Releases back into a bucket
    pub total_released: u64,
    /// Buffers destroyed by cleanup or teardown
    pub total_destroyed: u64,
    /// Releases of buffers the pool did not hand out
    pub unknown_releases: u64,
}

impl PoolMetrics {
    /// Buffers allocated and not yet destroyed
    pub fn outstanding(&self) -> u64 {
        self.total_created.saturating_sub(self.total_destroyed)
    }

    /// Total tracked bytes
    pub fn total_bytes(&self) -> usize {
        self.bytes_available + self.bytes_in_use
    }
}

#[derive(Default)]
struct PoolState {
    available: HashMap<PoolKey, Vec<ImageBuffer>>,
    in_use: HashMap<BufferId, PoolKey>,
    total_created: u64,
    total_reused: u64,
    total_released: u64,
    total_destroyed: u64,
    unknown_releases: u64,
    closed: bool,
}

impl PoolState {
    fn take(&mut self, key: &PoolKey) -> Option<ImageBuffer> {
        let stack = self.available.get_mut(key)?;
        let buf = stack.pop()?;
        if stack.is_empty() {
            self.available.remove(key);
        }
        Some(buf)
    }

    fn available_count(&self) -> usize {
        self.available.values().map(Vec::len).sum()
    }

    fn available_bytes(&self) -> usize {
        self.available
            .iter()
            .map(|(key, stack)| key.byte_size() * stack.len())
            .sum()
    }

    fn in_use_bytes(&self) -> usize {
        self.in_use.values().map(PoolKey::byte_size).sum()
    }

    fn drain_available(&mut self) -> usize {
        let mut freed = 0usize;
        for (_, stack) in self.available.drain() {
            freed += stack.len();
        }
        self.total_destroyed += freed as u64;
        freed
    }
}

/// Pool of reusable image buffers
pub struct ResourcePool {
    state: Mutex<PoolState>,
}

impl Default for ResourcePool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl ResourcePool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Acquire a buffer wrapped in a guard that releases it on drop
    pub fn acquire(
        self: &Arc<Self>,
        resolution: Resolution,
        format: PixelFormat,
    ) -> Result<PooledImage> {
        let buffer = self.acquire_detached(resolution, format)?;
        Ok(PooledImage {
            buffer,
            pool: Arc::clone(self),
        })
    }

    /// Acquire a buffer the caller must hand back through [`ResourcePool::release`]
    ///
    /// Reused buffers keep their previous contents; callers clear them when
    /// they need a blank buffer.
    pub fn acquire_detached(
        &self,
        resolution: Resolution,
        format: PixelFormat,
    ) -> Result<ImageBuffer> {
        let key = PoolKey::new(resolution, format);
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::ShutDown);
        }

        let mut buffer = match state.take(&key) {
            Some(buffer) => {
                state.total_reused += 1;
                buffer
            }
            None => {
                let buffer = ImageBuffer::new(resolution, format)?;
                state.total_created += 1;
                tracing::debug!(
                    "Allocated pool buffer {:?} {} {:?} ({} bytes)",
                    buffer.id(),
                    resolution,
                    format,
                    key.byte_size()
                );
                buffer
            }
        };
        buffer.set_filter_mode(FilterMode::Point);
        state.in_use.insert(buffer.id(), key);
        Ok(buffer)
    }

    /// Return a buffer to its bucket
    ///
    /// A buffer the pool does not recognise is destroyed instead.
    pub fn release(&self, buffer: ImageBuffer) {
        let mut state = self.state.lock();
        match state.in_use.remove(&buffer.id()) {
            Some(key) => {
                state.total_released += 1;
                if state.closed {
                    state.total_destroyed += 1;
                } else {
                    state.available.entry(key).or_default().push(buffer);
                }
            }
            None => {
                state.unknown_releases += 1;
                if state.closed {
                    tracing::debug!("Destroying buffer {:?} released after teardown", buffer.id());
                } else {
                    tracing::warn!(
                        "Released buffer {:?} ({}) is not tracked by the pool, destroying it",
                        buffer.id(),
                        buffer.resolution()
                    );
                }
            }
        }
    }

    /// Destroy every available buffer, returning how many were freed
    pub fn force_cleanup(&self) -> usize {
        let mut state = self.state.lock();
        let bytes = state.available_bytes();
        let freed = state.drain_available();
        if freed > 0 {
            tracing::info!(
                "Pool cleanup destroyed {} buffers ({:.1} MB)",
                freed,
                bytes as f64 / (1024.0 * 1024.0)
            );
        }
        freed
    }

    /// Destroy available buffers of a single key
    pub fn trim(&self, resolution: Resolution, format: PixelFormat) -> usize {
        let mut state = self.state.lock();
        let freed = state
            .available
            .remove(&PoolKey::new(resolution, format))
            .map(|stack| stack.len())
            .unwrap_or(0);
        state.total_destroyed += freed as u64;
        freed
    }

    /// Sum of `width * height * bytes_per_pixel` over available and in-use buffers
    pub fn estimate_bytes(&self) -> usize {
        let state = self.state.lock();
        state.available_bytes() + state.in_use_bytes()
    }

    /// Buffers currently handed out
    pub fn in_use_count(&self) -> usize {
        self.state.lock().in_use.len()
    }

    /// Buffers waiting for reuse
    pub fn available_count(&self) -> usize {
        self.state.lock().available_count()
    }

    /// Whether [`ResourcePool::release_all`] has run
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Metrics snapshot
    pub fn metrics(&self) -> PoolMetrics {
        let state = self.state.lock();
        PoolMetrics {
            available_buffers: state.available_count(),
            in_use_buffers: state.in_use.len(),
            bytes_available: state.available_bytes(),
            bytes_in_use: state.in_use_bytes(),
            total_created: state.total_created,
            total_reused: state.total_reused,
            total_released: state.total_released,
            total_destroyed: state.total_destroyed,
            unknown_releases: state.unknown_releases,
        }
    }

    /// Teardown: destroy available buffers, stop tracking in-use ones and
    /// refuse further acquisitions
    ///
    /// Returns the number of buffers that were still in use. Those are
    /// destroyed when their holders release them.
    pub fn release_all(&self) -> usize {
        let mut state = self.state.lock();
        let freed = state.drain_available();
        let leaked = state.in_use.len();
        state.in_use.clear();
        state.total_destroyed += leaked as u64;
        state.closed = true;

        if leaked > 0 {
            tracing::warn!(
                "Pool teardown with {} buffers still in use ({} available destroyed)",
                leaked,
                freed
            );
        } else {
            tracing::debug!("Pool teardown destroyed {} available buffers", freed);
        }
        leaked
    }
}

/// Buffer on loan from a [`ResourcePool`]
///
/// Dropping the guard releases the buffer, so every exit path of a run
/// (success, error, cancellation) returns what it acquired.
pub struct PooledImage {
    buffer: ImageBuffer,
    pool: Arc<ResourcePool>,
}

impl Deref for PooledImage {
    type Target = ImageBuffer;

    fn deref(&self) -> &ImageBuffer {
        &self.buffer
    }
}

impl DerefMut for PooledImage {
    fn deref_mut(&mut self) -> &mut ImageBuffer {
        &mut self.buffer
    }
}

impl fmt::Debug for PooledImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledImage")
            .field("id", &self.buffer.id())
            .field("resolution", &self.buffer.resolution())
            .field("format", &self.buffer.format())
            .finish()
    }
}

impl Drop for PooledImage {
    fn drop(&mut self) {
        let buffer = std::mem::replace(&mut self.buffer, ImageBuffer::placeholder());
        self.pool.release(buffer);
    }
}
