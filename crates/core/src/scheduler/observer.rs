//! Mask update fan-out
//!
//! Every successful run publishes one [`MaskUpdate`] into a bounded
//! broadcast ring shared by all subscriptions. Publishing never blocks a run.
//! A subscription that falls more than `mask_queue_depth` updates behind
//! skips the oldest ones, so a stalled consumer pins at most that many masks.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::time::Instant;

use crate::data::{ImageBuffer, Resolution};
use crate::reconstruct::Degradation;
use crate::{Error, Result};

/// Mask values above this count towards coverage
pub const COVERAGE_THRESHOLD: f32 = 0.1;

/// A freshly published display mask
#[derive(Debug)]
pub struct MaskUpdate {
    /// Run that produced the mask
    pub run_id: u64,
    /// Frame number of the source frame
    pub frame_number: u64,
    /// Display-resolution mask (copy owned by the update)
    pub mask: ImageBuffer,
    /// When the mask was published
    pub produced_at: Instant,
    /// Working resolution the frame was converted at
    pub working_resolution: Resolution,
    /// Optional stages that did not contribute
    pub degradation: Degradation,
    /// Fraction of mask values above [`COVERAGE_THRESHOLD`]
    pub coverage: f32,
    /// Trigger-to-publish processing time
    pub latency: Duration,
}

/// Receiving end of a mask subscription
#[derive(Debug)]
pub struct MaskSubscription {
    id: u64,
    rx: broadcast::Receiver<Arc<MaskUpdate>>,
    active: Arc<AtomicBool>,
    skipped: u64,
}

impl MaskSubscription {
    /// Subscription identifier, for [`crate::FrameScheduler::unsubscribe`]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Updates this subscription missed by falling behind
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Wait for the next update; `None` once unsubscribed or shut down
    pub async fn recv(&mut self) -> Option<Arc<MaskUpdate>> {
        loop {
            if !self.active.load(Ordering::Acquire) {
                return None;
            }
            match self.rx.recv().await {
                Ok(update) => return self.active.load(Ordering::Acquire).then_some(update),
                Err(RecvError::Lagged(missed)) => self.record_lag(missed),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next update if one is queued
    pub fn try_recv(&mut self) -> Option<Arc<MaskUpdate>> {
        loop {
            if !self.active.load(Ordering::Acquire) {
                return None;
            }
            match self.rx.try_recv() {
                Ok(update) => return Some(update),
                Err(TryRecvError::Lagged(missed)) => self.record_lag(missed),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain every queued update
    pub fn drain(&mut self) -> Vec<Arc<MaskUpdate>> {
        let mut updates = Vec::new();
        while let Some(update) = self.try_recv() {
            updates.push(update);
        }
        updates
    }

    fn record_lag(&mut self, missed: u64) {
        self.skipped += missed;
        tracing::debug!("Subscription {} fell behind, skipped {} masks", self.id, missed);
    }
}

struct ObserverList {
    next_id: u64,
    sender: Option<broadcast::Sender<Arc<MaskUpdate>>>,
    active: HashMap<u64, Arc<AtomicBool>>,
}

/// Registered mask observers
pub(crate) struct ObserverRegistry {
    inner: Mutex<ObserverList>,
}

impl ObserverRegistry {
    /// Registry retaining at most `depth` undelivered updates
    pub(crate) fn new(depth: usize) -> Self {
        let (sender, _) = broadcast::channel(depth.max(1));
        Self {
            inner: Mutex::new(ObserverList {
                next_id: 0,
                sender: Some(sender),
                active: HashMap::new(),
            }),
        }
    }

    pub(crate) fn subscribe(&self) -> Result<MaskSubscription> {
        let mut inner = self.inner.lock();
        let rx = match inner.sender.as_ref() {
            Some(sender) => sender.subscribe(),
            None => return Err(Error::ShutDown),
        };
        let id = inner.next_id;
        inner.next_id += 1;
        let active = Arc::new(AtomicBool::new(true));
        inner.active.insert(id, Arc::clone(&active));
        Ok(MaskSubscription {
            id,
            rx,
            active,
            skipped: 0,
        })
    }

    pub(crate) fn unsubscribe(&self, id: u64) -> bool {
        match self.inner.lock().active.remove(&id) {
            Some(flag) => {
                flag.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Deliver to every live subscription, returns the subscriber count
    pub(crate) fn publish(&self, update: Arc<MaskUpdate>) -> usize {
        let mut inner = self.inner.lock();
        // A flag only the registry still holds belongs to a dropped subscription
        inner.active.retain(|_, flag| Arc::strong_count(flag) > 1);
        if inner.active.is_empty() {
            return 0;
        }
        match inner.sender.as_ref() {
            Some(sender) => {
                // No receivers left is not an error for the run
                let _ = sender.send(update);
                inner.active.len()
            }
            None => 0,
        }
    }

    /// Drop the sender so receivers observe the end of the stream
    pub(crate) fn close(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.sender = None;
        let count = inner.active.len();
        for flag in inner.active.values() {
            flag.store(false, Ordering::Release);
        }
        inner.active.clear();
        count
    }

    /// Live subscriptions
    pub(crate) fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.active.retain(|_, flag| Arc::strong_count(flag) > 1);
        inner.active.len()
    }
}
