use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::bus::{Bus, GraphId, Message};
use crate::error::{FlowError, RelayError, Result};
use crate::exchange::queue::{FrameQueue, Popped};
use crate::format::PixelFormat;
use crate::frame::FrameBuffer;
use crate::graph::{PipelineGraph, State};
use crate::stage::Properties;

/// Returned by a frame callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Stop delivery and end the stream.
    Stop,
}

/// Handle to an `appsink` delivering frames to a callback.
///
/// Frames are delivered one at a time on a single dispatch thread, in the
/// order the sink received them. Delivery ends at end-of-stream, teardown,
/// [`Flow::Stop`], or if the callback panics (reported as an engine error).
#[derive(Debug)]
pub struct FrameCallback {
    handle: Option<JoinHandle<()>>,
    delivered: Arc<AtomicU64>,
}

impl FrameCallback {
    pub(crate) fn spawn<F>(
        graph: GraphId,
        queue: Arc<FrameQueue>,
        bus: Bus,
        sink: String,
        mut callback: F,
    ) -> Result<Self>
    where
        F: FnMut(&FrameBuffer<'_>) -> Flow + Send + 'static,
    {
        let delivered = Arc::new(AtomicU64::new(0));
        let counter = delivered.clone();

        let handle = thread::Builder::new()
            .name(format!("{graph}-frames"))
            .spawn(move || {
                loop {
                    let sample = match queue.pop(None) {
                        Popped::Sample(sample) => sample,
                        Popped::Timeout => continue,
                        Popped::EndOfStream | Popped::Flushing => break,
                    };
                    let flow = catch_unwind(AssertUnwindSafe(|| callback(&sample.view())));
                    match flow {
                        Ok(Flow::Continue) => {
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Flow::Stop) => {
                            counter.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(%graph, stage = %sink, "frame callback requested stop");
                            queue.set_flushing(true);
                            bus.post(Message::EndOfStream);
                            break;
                        }
                        Err(_) => {
                            tracing::error!(%graph, stage = %sink, "frame callback panicked");
                            queue.set_flushing(true);
                            bus.post_error(Some(&sink), "frame callback panicked");
                            break;
                        }
                    }
                }
                tracing::trace!(%graph, "frame dispatch finished");
            })?;

        Ok(Self {
            handle: Some(handle),
            delivered,
        })
    }

    /// Frames handed to the callback so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for delivery to end. Returns immediately when called from the
    /// callback itself.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }
}

/// Application side of an `appsrc`.
///
/// Borrowed frames are copied as they enter the graph; owned frames are
/// moved in without a copy. Either way the caller keeps no claim on the
/// data after [`push`](Self::push) returns.
pub struct FrameInjector {
    graph: PipelineGraph,
    queue: Arc<FrameQueue>,
    timeout: Duration,
    format: Option<PixelFormat>,
    width: Option<u32>,
    height: Option<u32>,
    next_sequence: u64,
}

impl FrameInjector {
    pub(crate) fn new(
        graph: PipelineGraph,
        queue: Arc<FrameQueue>,
        timeout: Duration,
        constraints: &Properties,
    ) -> Self {
        Self {
            graph,
            queue,
            timeout,
            format: constraints.str("format").and_then(|f| f.parse().ok()),
            width: constraints.int("width").and_then(|w| u32::try_from(w).ok()),
            height: constraints.int("height").and_then(|h| u32::try_from(h).ok()),
            next_sequence: 0,
        }
    }

    /// Hand a frame to the graph.
    ///
    /// Fails with [`FlowError::NotPlaying`] without blocking unless the
    /// graph is playing, and with [`FlowError::Full`] if no room frees up
    /// within the configured push timeout.
    pub fn push(&mut self, frame: FrameBuffer<'_>) -> Result<()> {
        if self.graph.state() != State::Playing {
            return Err(RelayError::Flow(FlowError::NotPlaying));
        }
        self.check(&frame)?;

        let mut sample = frame.into_sample();
        sample.sequence = self.next_sequence;
        self.queue
            .push(sample, Some(self.timeout))
            .map_err(|rejected| RelayError::Flow(rejected.reason))?;
        self.next_sequence += 1;
        Ok(())
    }

    /// Signal that no more frames will be pushed.
    pub fn end_of_stream(&self) {
        self.queue.end_of_stream();
    }

    /// Frames accepted so far.
    pub fn pushed(&self) -> u64 {
        self.next_sequence
    }

    fn check(&self, frame: &FrameBuffer<'_>) -> Result<()> {
        let mismatch = |what: &str, want: String, got: String| {
            RelayError::InvalidFrame(format!("source expects {what} {want}, got {got}"))
        };
        if let Some(format) = self.format.filter(|f| *f != frame.format()) {
            return Err(mismatch("format", format.to_string(), frame.format().to_string()));
        }
        if let Some(width) = self.width.filter(|w| *w != frame.width()) {
            return Err(mismatch("width", width.to_string(), frame.width().to_string()));
        }
        if let Some(height) = self.height.filter(|h| *h != frame.height()) {
            return Err(mismatch("height", height.to_string(), frame.height().to_string()));
        }
        Ok(())
    }
}
