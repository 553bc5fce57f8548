use crate::error::{RelayError, RelayResult};
use crate::measurement::Measurement;

pub const DEFAULT_SOFT_LIMIT: usize = 1000;
pub const DEFAULT_HARD_LIMIT: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    soft: usize,
    hard: usize,
}

impl BufferLimits {
    pub fn new(soft: usize, hard: usize) -> RelayResult<Self> {
        if soft >= hard {
            return Err(RelayError::InvalidBufferLimits { soft, hard });
        }
        Ok(Self { soft, hard })
    }

    pub fn soft(&self) -> usize {
        self.soft
    }

    pub fn hard(&self) -> usize {
        self.hard
    }
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            soft: DEFAULT_SOFT_LIMIT,
            hard: DEFAULT_HARD_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Stored; `early_flush` is set once the soft limit is exceeded.
    Accepted { len: usize, early_flush: bool },
    /// Buffer is at the hard limit; the newest measurement was discarded.
    Dropped,
}

/// FIFO holding area between producers and the flush cycle.
///
/// The buffer only reports the soft-limit condition; scheduling an early
/// flush is the caller's job.
#[derive(Debug)]
pub struct WriteBuffer {
    items: Vec<Measurement>,
    limits: BufferLimits,
}

impl WriteBuffer {
    pub fn new(limits: BufferLimits) -> Self {
        Self {
            items: Vec::new(),
            limits,
        }
    }

    pub fn limits(&self) -> BufferLimits {
        self.limits
    }

    pub fn push(&mut self, measurement: Measurement) -> PushOutcome {
        if self.items.len() >= self.limits.hard {
            return PushOutcome::Dropped;
        }
        self.items.push(measurement);
        let len = self.items.len();
        PushOutcome::Accepted {
            len,
            early_flush: len > self.limits.soft,
        }
    }

    /// Takes everything, leaving a fresh empty buffer behind for producers.
    pub fn drain_all(&mut self) -> Vec<Measurement> {
        std::mem::take(&mut self.items)
    }

    /// Re-queues a failed batch behind whatever arrived meanwhile. The hard
    /// limit is not applied here; new pushes are refused until it drains.
    pub fn requeue(&mut self, batch: Vec<Measurement>) {
        self.items.extend(batch);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
