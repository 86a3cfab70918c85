use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::exchange::queue::{FrameQueue, Popped};
use crate::frame::{FrameBuffer, Sample};
use crate::graph::PipelineGraph;

/// Outcome of [`PullExchange::pull`].
#[derive(Debug)]
pub enum Pulled<'a> {
    Frame(FrameGuard<'a>),
    Timeout,
    /// No more frames will arrive, either because the source finished or
    /// because the graph was torn down.
    EndOfStream,
}

/// Application side of an `appsink` in pull mode.
///
/// At most one frame is out at a time: a [`FrameGuard`] borrows the
/// exchange mutably, so the next `pull` only compiles once the previous
/// frame is released.
pub struct PullExchange {
    graph: PipelineGraph,
    queue: Arc<FrameQueue>,
    released: u64,
}

impl PullExchange {
    pub(crate) fn new(graph: PipelineGraph, queue: Arc<FrameQueue>) -> Self {
        Self {
            graph,
            queue,
            released: 0,
        }
    }

    /// Wait up to `timeout` (`None` waits until a frame, end-of-stream or
    /// teardown) for the next frame.
    ///
    /// Returns the engine error instead of `EndOfStream` when the stream
    /// ended because of a failure.
    pub fn pull(&mut self, timeout: Option<Duration>) -> Result<Pulled<'_>> {
        match self.queue.pop(timeout) {
            Popped::Sample(sample) => Ok(Pulled::Frame(FrameGuard {
                sample,
                released: &mut self.released,
            })),
            Popped::Timeout => Ok(Pulled::Timeout),
            Popped::EndOfStream | Popped::Flushing => match self.graph.fault() {
                Some(err) => Err(err),
                None => Ok(Pulled::EndOfStream),
            },
        }
    }

    /// Pull with the graph's configured
    /// [`pull_timeout`](crate::GraphConfig::pull_timeout).
    pub fn pull_next(&mut self) -> Result<Pulled<'_>> {
        let timeout = self.graph.config().pull_timeout;
        self.pull(timeout)
    }

    /// Number of frames pulled and released so far.
    pub fn released(&self) -> u64 {
        self.released
    }

    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }
}

/// A pulled frame. Released when dropped.
#[derive(Debug)]
pub struct FrameGuard<'a> {
    sample: Sample,
    released: &'a mut u64,
}

impl FrameGuard<'_> {
    /// Borrowed view, valid while the guard lives.
    pub fn frame(&self) -> FrameBuffer<'_> {
        self.sample.view()
    }

    pub fn sequence(&self) -> u64 {
        self.sample.sequence
    }

    /// Copy the frame so it can outlive the guard.
    pub fn to_owned_copy(&self) -> FrameBuffer<'static> {
        self.sample.view().to_owned_copy()
    }

    /// Release explicitly. Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        *self.released += 1;
        tracing::trace!(sequence = self.sample.sequence, "frame released");
    }
}
