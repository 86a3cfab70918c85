//! Bounded sample queue shared between a graph's streaming thread and the
//! application side of a frame exchange.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::FlowError;
use crate::frame::Sample;

/// Outcome of [`FrameQueue::pop`].
#[derive(Debug)]
pub enum Popped {
    Sample(Sample),
    Timeout,
    /// Producer finished and the queue is drained.
    EndOfStream,
    /// The queue was flushed by teardown.
    Flushing,
}

/// A sample the queue refused, handed back so the producer may retry.
#[derive(Debug)]
pub struct Rejected {
    pub reason: FlowError,
    pub sample: Sample,
}

/// Counters for leak and backpressure checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    pub popped: u64,
    /// Samples discarded because the queue was full in leaky mode.
    pub dropped: u64,
    pub queued: usize,
}

struct QueueState {
    items: VecDeque<Sample>,
    eos: bool,
    flushing: bool,
    stats: QueueStats,
}

/// Bounded FIFO with end-of-stream and flushing flags.
///
/// In leaky mode a full queue discards its oldest sample instead of
/// blocking the producer.
pub struct FrameQueue {
    state: Mutex<QueueState>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
    leaky: bool,
}

impl FrameQueue {
    pub fn new(capacity: usize, leaky: bool) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.max(1)),
                eos: false,
                flushing: false,
                stats: QueueStats::default(),
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity: capacity.max(1),
            leaky,
        }
    }

    /// Queue a sample, waiting up to `timeout` for room (`None` waits until
    /// room frees up or the queue is flushed).
    pub fn push(&self, sample: Sample, timeout: Option<Duration>) -> Result<(), Rejected> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state.flushing {
                return Err(Rejected {
                    reason: FlowError::Flushing,
                    sample,
                });
            }
            if state.eos {
                return Err(Rejected {
                    reason: FlowError::EndOfStream,
                    sample,
                });
            }
            if state.items.len() < self.capacity || self.leaky {
                if state.items.len() >= self.capacity {
                    state.items.pop_front();
                    state.stats.dropped += 1;
                }
                state.items.push_back(sample);
                state.stats.pushed += 1;
                self.readable.notify_one();
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    if self.writable.wait_until(&mut state, deadline).timed_out()
                        && state.items.len() >= self.capacity
                        && !state.flushing
                    {
                        return Err(Rejected {
                            reason: FlowError::Full,
                            sample,
                        });
                    }
                }
                None => self.writable.wait(&mut state),
            }
        }
    }

    /// Take the oldest sample, waiting up to `timeout` (`None` waits forever).
    pub fn pop(&self, timeout: Option<Duration>) -> Popped {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state.flushing {
                return Popped::Flushing;
            }
            if let Some(sample) = state.items.pop_front() {
                state.stats.popped += 1;
                self.writable.notify_all();
                return Popped::Sample(sample);
            }
            if state.eos {
                return Popped::EndOfStream;
            }
            match deadline {
                Some(deadline) => {
                    if self.readable.wait_until(&mut state, deadline).timed_out()
                        && state.items.is_empty()
                        && !state.eos
                        && !state.flushing
                    {
                        return Popped::Timeout;
                    }
                }
                None => self.readable.wait(&mut state),
            }
        }
    }

    /// Mark the end of the stream. Queued samples can still be popped.
    pub fn end_of_stream(&self) {
        let mut state = self.state.lock();
        state.eos = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// While flushing, queued samples are discarded and every waiter
    /// returns immediately.
    pub fn set_flushing(&self, flushing: bool) {
        let mut state = self.state.lock();
        state.flushing = flushing;
        if flushing {
            state.items.clear();
        }
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// Clear samples and flags for a fresh run.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.items.clear();
        state.eos = false;
        state.flushing = false;
        self.writable.notify_all();
    }

    /// Wait up to `timeout` for the consumer to take every queued sample.
    /// Returns `true` once the queue is empty or flushing.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.items.is_empty() && !state.flushing {
            if self.writable.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.items.is_empty() || state.flushing
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            queued: state.items.len(),
            ..state.stats
        }
    }
}
