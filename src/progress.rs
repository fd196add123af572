//! Lane allocation for concurrent progress reporting.
//!
//! Each harvest window and title lookup takes a lane number so that log lines
//! from interleaved tasks can be told apart. The allocator is injected at
//! construction; clones share one counter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct PositionAllocator {
    next: Arc<AtomicUsize>,
}

impl PositionAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next unused lane.
    pub fn next(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of lanes handed out so far.
    pub fn allocated(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }

    /// Start again from zero. Only meaningful between runs.
    pub fn reset(&self) {
        self.next.store(0, Ordering::Relaxed);
    }
}
