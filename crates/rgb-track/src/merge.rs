//! Multi-producer, single-consumer delta queue.
//!
//! Producers ([`DeltaSender`]) are cheap clones handed to workers; pushing
//! never blocks. The single [`MergeQueue`] consumer lives on the tick thread
//! and drains in push order. `drain` takes `&mut self`, so ownership alone
//! rules out a second consumer.
//!
//! The queue neither reorders nor coalesces. Grouping an observer's deltas
//! into unit order is the apply phase's job.

use std::sync::Arc;

use crossbeam::queue::SegQueue;

use crate::delta::Delta;

/// Create a connected sender/queue pair.
#[must_use]
pub fn merge_queue() -> (DeltaSender, MergeQueue) {
    let inner = Arc::new(SegQueue::new());
    (
        DeltaSender {
            inner: Arc::clone(&inner),
        },
        MergeQueue { inner },
    )
}

/// Producer handle. Safe to use from any thread.
#[derive(Clone)]
pub struct DeltaSender {
    inner: Arc<SegQueue<Delta>>,
}

impl DeltaSender {
    /// Enqueue a delta. Lock-free; never blocks.
    pub fn push(&self, delta: Delta) {
        self.inner.push(delta);
    }
}

impl core::fmt::Debug for DeltaSender {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeltaSender")
            .field("queued", &self.inner.len())
            .finish()
    }
}

/// Consumer side, owned by the tick thread.
pub struct MergeQueue {
    inner: Arc<SegQueue<Delta>>,
}

impl MergeQueue {
    /// Another producer for this queue.
    #[must_use]
    pub fn sender(&self) -> DeltaSender {
        DeltaSender {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Take every delta pushed so far, in push order. Never blocks.
    ///
    /// A push racing with the drain lands in this batch or the next one,
    /// never nowhere.
    pub fn drain(&mut self) -> Vec<Delta> {
        let mut drained = Vec::with_capacity(self.inner.len());
        while let Some(delta) = self.inner.pop() {
            drained.push(delta);
        }
        drained
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl core::fmt::Debug for MergeQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MergeQueue")
            .field("queued", &self.inner.len())
            .finish()
    }
}
