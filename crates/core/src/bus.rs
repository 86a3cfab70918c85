//! Per-graph notification bus.
//!
//! Engines post [`Message`]s on a graph's [`Bus`]; an
//! [`EventLoop`](crate::EventLoop) attaches to the bus to receive them.
//! Messages posted before anything attached are held and delivered on
//! attach, so nothing is lost between `build()` and `watch()`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::graph::State;

static GRAPH_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one graph instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphId(u64);

impl GraphId {
    pub(crate) fn next() -> Self {
        Self(GRAPH_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph-{}", self.0)
    }
}

/// Lifecycle and error notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// The source ran dry and every frame has been delivered.
    EndOfStream,
    /// Fatal engine failure.
    Error {
        stage: Option<String>,
        message: String,
    },
    StateChanged { old: State, new: State },
}

/// A message tagged with the graph that posted it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub graph: GraphId,
    pub message: Message,
}

/// Last engine error seen on a bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub stage: Option<String>,
    pub message: String,
}

enum Target {
    Pending(Vec<Message>),
    Attached(Sender<Envelope>),
    Closed,
}

struct BusInner {
    target: Mutex<Target>,
    fault: Mutex<Option<Fault>>,
}

/// Posting side of a graph's notifications. Cheap to clone.
#[derive(Clone)]
pub struct Bus {
    graph: GraphId,
    inner: Arc<BusInner>,
}

impl Bus {
    pub(crate) fn new(graph: GraphId) -> Self {
        Self {
            graph,
            inner: Arc::new(BusInner {
                target: Mutex::new(Target::Pending(Vec::new())),
                fault: Mutex::new(None),
            }),
        }
    }

    pub fn graph(&self) -> GraphId {
        self.graph
    }

    pub fn post(&self, message: Message) {
        if let Message::Error { stage, message } = &message {
            let mut fault = self.inner.fault.lock();
            if fault.is_none() {
                *fault = Some(Fault {
                    stage: stage.clone(),
                    message: message.clone(),
                });
            }
        }

        let mut target = self.inner.target.lock();
        match &mut *target {
            Target::Pending(queue) => queue.push(message),
            Target::Attached(tx) => {
                if tx
                    .send(Envelope {
                        graph: self.graph,
                        message,
                    })
                    .is_err()
                {
                    tracing::trace!(graph = %self.graph, "event loop gone, detaching bus");
                    *target = Target::Closed;
                }
            }
            Target::Closed => {
                tracing::trace!(graph = %self.graph, ?message, "message after bus close dropped");
            }
        }
    }

    pub fn post_error(&self, stage: Option<&str>, message: impl Into<String>) {
        self.post(Message::Error {
            stage: stage.map(str::to_string),
            message: message.into(),
        });
    }

    /// Route messages to an event loop, flushing anything held so far.
    pub(crate) fn attach(&self, tx: Sender<Envelope>) {
        let mut target = self.inner.target.lock();
        let pending = match std::mem::replace(&mut *target, Target::Attached(tx.clone())) {
            Target::Pending(queue) => queue,
            Target::Attached(_) => Vec::new(),
            Target::Closed => {
                *target = Target::Closed;
                return;
            }
        };
        for message in pending {
            let _ = tx.send(Envelope {
                graph: self.graph,
                message,
            });
        }
    }

    /// Stop routing. Later posts are dropped.
    pub(crate) fn close(&self) {
        *self.inner.target.lock() = Target::Closed;
    }

    pub fn fault(&self) -> Option<Fault> {
        self.inner.fault.lock().clone()
    }
}
