//! Media engine abstraction.
//!
//! The orchestration core never moves pixels itself. An [`Engine`] creates
//! the element behind each stage and assembles a validated chain into a
//! [`Driver`] that the graph steps through its lifecycle. Engines post
//! end-of-stream and errors on the graph's [`Bus`], and exchange frames with
//! the application through the [`Ports`] queues.
//!
//! [`LocalEngine`] runs raw-video chains in-process. Engines backed by a
//! real media framework live in their own crates.

mod local;

pub use local::LocalEngine;

use std::sync::Arc;

use crate::bus::Bus;
use crate::catalog::Factory;
use crate::error::Result;
use crate::exchange::FrameQueue;
use crate::graph::State;
use crate::stage::{Element, Properties, Stage};

/// Result of a successful state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    Success,
    /// The engine accepted the change and will finish it in the background.
    Async,
}

/// Queues connecting a graph's application-facing stages to the engine.
#[derive(Clone, Default)]
pub struct Ports {
    /// Filled by the engine at an `appsink`.
    pub sink: Option<Arc<FrameQueue>>,
    /// Drained by the engine at an `appsrc`.
    pub source: Option<Arc<FrameQueue>>,
}

/// A media framework capable of running stage chains.
pub trait Engine: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Whether this engine can run stages of the given type.
    fn supports(&self, factory: &Factory) -> bool;

    /// Create the element for one stage. Properties are already type-checked.
    fn make_element(
        &self,
        stage: &str,
        factory: &'static Factory,
        properties: &Properties,
    ) -> Result<Box<dyn Element>>;

    /// Link built stages into a runnable chain.
    fn assemble(&self, stages: &[Stage], ports: Ports, bus: Bus) -> Result<Box<dyn Driver>>;
}

/// An assembled chain, owned by exactly one graph.
///
/// Dropping the driver releases every engine resource it holds.
pub trait Driver: Send {
    /// Perform one lifecycle step between adjacent states.
    fn change_state(&mut self, from: State, to: State) -> Result<StateChange>;
}
