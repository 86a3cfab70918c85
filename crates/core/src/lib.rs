//! Orchestration core for live video relays.
//!
//! A [`PipelineGraph`] is a linear chain of stages built from a launch
//! description such as `testsrc num-buffers=10 ! videoconvert ! appsink`.
//! Applications drive it through its state machine, exchange frames with it
//! at the `appsink`/`appsrc` ends, and hand it to an [`EventLoop`] which
//! tears it down on end-of-stream or error. A [`SessionServer`] exposes
//! descriptions to network clients, one session per client.
//!
//! Stage behavior comes from an [`Engine`]. [`LocalEngine`] runs a small
//! built-in element set in-process.

pub mod bus;
pub mod catalog;
pub mod description;
pub mod engine;
pub mod error;
pub mod event_loop;
pub mod exchange;
pub mod format;
pub mod frame;
pub mod graph;
pub mod mount;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stage;
pub mod transport;

pub use bus::{Bus, GraphId, Message};
pub use catalog::Factory;
pub use description::Description;
pub use engine::{Driver, Engine, LocalEngine, Ports, StateChange};
pub use error::{FlowError, RelayError, Result};
pub use event_loop::{EventLoop, ExitReason, LoopExit, StopHandle};
pub use exchange::{
    Flow, FrameCallback, FrameGuard, FrameInjector, FrameQueue, Popped, PullExchange, Pulled,
    QueueStats, Rejected,
};
pub use format::PixelFormat;
pub use frame::{FrameBuffer, FrameInfo, Ownership, Sample};
pub use graph::{GraphConfig, PipelineGraph, State};
pub use mount::{FanoutPolicy, MountPolicy};
pub use server::{ServerConfig, SessionServer};
pub use session::{SessionInfo, SessionState};
pub use stage::{Element, Properties, PropertyValue, Stage, StageKind, StageSpec};
