//! Frame exchange between a graph and the application.
//!
//! Frames leave a graph at its `appsink` in one of two mutually exclusive
//! ways:
//!
//! - [`PullExchange`]: the application pulls, receiving a scoped
//!   [`FrameGuard`] that releases the frame when dropped.
//! - [`FrameCallback`]: the graph pushes each frame to a callback on a
//!   single dispatch thread, in capture order.
//!
//! Frames enter a graph at its `appsrc` through a [`FrameInjector`].

mod pull;
mod push;
mod queue;

pub use pull::{FrameGuard, PullExchange, Pulled};
pub use push::{Flow, FrameCallback, FrameInjector};
pub use queue::{FrameQueue, Popped, QueueStats, Rejected};
