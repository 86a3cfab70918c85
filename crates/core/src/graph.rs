//! Pipeline graphs: a validated, linked chain of stages and its lifecycle.
//!
//! ```text
//! NULL <-> READY <-> PAUSED <-> PLAYING
//! ```
//!
//! Transitions always walk through adjacent states. Errors are not a state:
//! an engine error is posted on the graph's bus and the
//! [`EventLoop`](crate::EventLoop) answers it by tearing the graph down.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::bus::{Bus, GraphId, Message};
use crate::catalog::{self, AppPort};
use crate::description::Description;
use crate::engine::{Driver, Engine, Ports, StateChange};
use crate::error::{RelayError, Result};
use crate::exchange::{Flow, FrameCallback, FrameInjector, FrameQueue, PullExchange, QueueStats};
use crate::frame::FrameBuffer;
use crate::stage::{PropertyValue, Stage, StageKind, StageSpec};

/// Lifecycle state of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Null,
    Ready,
    Paused,
    Playing,
}

impl State {
    /// The adjacent state one step closer to `target`.
    pub fn step_towards(self, target: State) -> State {
        use State::*;
        if self < target {
            match self {
                Null => Ready,
                Ready => Paused,
                Paused | Playing => Playing,
            }
        } else if self > target {
            match self {
                Playing => Paused,
                Paused => Ready,
                Ready | Null => Null,
            }
        } else {
            self
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Null => "NULL",
            Self::Ready => "READY",
            Self::Paused => "PAUSED",
            Self::Playing => "PLAYING",
        })
    }
}

/// Tunables applied to every graph.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// How long an injected frame may wait for room before
    /// [`FlowError::Full`](crate::FlowError::Full) is returned.
    pub push_timeout: Duration,
    /// `appsink` queue depth when the stage does not set `max-buffers`.
    pub sink_capacity: usize,
    /// `appsrc` queue depth when the stage does not set `max-buffers`.
    pub source_capacity: usize,
    /// Timeout used by [`PullExchange::pull_next`]. `None` waits for a frame
    /// or the end of the stream.
    pub pull_timeout: Option<Duration>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            push_timeout: Duration::from_millis(100),
            sink_capacity: 4,
            source_capacity: 8,
            pull_timeout: Some(Duration::from_secs(1)),
        }
    }
}

struct GraphCore {
    stages: Vec<Stage>,
    driver: Option<Box<dyn Driver>>,
}

struct GraphInner {
    id: GraphId,
    config: GraphConfig,
    core: Mutex<GraphCore>,
    state: RwLock<State>,
    bus: Bus,
    ports: Ports,
    sink_name: Option<String>,
    sink_claim: Mutex<Option<&'static str>>,
    source_claimed: AtomicBool,
    torn_down: AtomicBool,
}

impl GraphInner {
    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        // Unblock pulls, pushes and the streaming thread before stopping it.
        for queue in [&self.ports.sink, &self.ports.source].into_iter().flatten() {
            queue.set_flushing(true);
        }

        let mut core = self.core.lock();
        let previous = *self.state.read();
        let mut current = previous;
        if let Some(driver) = core.driver.as_mut() {
            while current != State::Null {
                let next = current.step_towards(State::Null);
                if let Err(e) = driver.change_state(current, next) {
                    tracing::warn!(graph = %self.id, error = %e, "state change failed during teardown");
                }
                current = next;
            }
        }
        *self.state.write() = State::Null;
        core.driver = None;
        core.stages.clear();
        drop(core);

        if previous != State::Null {
            self.bus.post(Message::StateChanged {
                old: previous,
                new: State::Null,
            });
        }
        self.bus.close();
        tracing::info!(graph = %self.id, from = %previous, "graph torn down");
    }
}

impl Drop for GraphInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// A built chain of stages.
///
/// Cloning is cheap and yields another handle to the same graph. The graph
/// is torn down when [`teardown`](Self::teardown) is called or when the last
/// handle is dropped.
#[derive(Clone)]
pub struct PipelineGraph {
    inner: Arc<GraphInner>,
}

impl PipelineGraph {
    /// Validate `specs`, create every stage and link the chain.
    ///
    /// The first stage must be a source, the last a sink, and everything in
    /// between a filter or codec. Each link is format-checked. On any
    /// failure nothing is left allocated.
    pub fn build(engine: &dyn Engine, specs: &[StageSpec], config: GraphConfig) -> Result<Self> {
        if specs.len() < 2 {
            return Err(RelayError::config(
                "description",
                "a chain needs at least a source and a sink",
            ));
        }

        let id = GraphId::next();
        let last = specs.len() - 1;
        let mut names = HashSet::new();
        let mut stages: Vec<Stage> = Vec::with_capacity(specs.len());
        let mut upstream = None;

        for (index, spec) in specs.iter().enumerate() {
            let name = spec
                .name
                .clone()
                .unwrap_or_else(|| format!("{}{index}", spec.factory));
            let factory = catalog::lookup(&spec.factory).ok_or_else(|| {
                RelayError::config(&name, format!("unknown stage type '{}'", spec.factory))
            })?;
            if !engine.supports(factory) {
                return Err(RelayError::config(
                    &name,
                    format!("{} is not available in the {} engine", factory.name, engine.name()),
                ));
            }
            if !names.insert(name.clone()) {
                return Err(RelayError::config(&name, "duplicate stage name"));
            }

            let position_ok = match index {
                0 => factory.kind == StageKind::Source,
                i if i == last => factory.kind == StageKind::Sink,
                _ => matches!(factory.kind, StageKind::Filter | StageKind::Codec),
            };
            if !position_ok {
                return Err(RelayError::config(
                    &name,
                    format!("a {:?} stage cannot sit at position {index}", factory.kind),
                ));
            }

            let properties = factory.check_properties(&name, &spec.properties)?;
            let output = factory.negotiate(upstream, &properties).map_err(|reason| {
                match stages.last() {
                    Some(prev) => RelayError::config(
                        &name,
                        format!("cannot link {} -> {name}: {reason}", prev.name()),
                    ),
                    None => RelayError::config(&name, reason),
                }
            })?;
            let element = engine.make_element(&name, factory, &properties)?;
            stages.push(Stage::new(name, factory, properties, upstream, output, element));
            upstream = Some(output);
        }

        let ports = Ports {
            sink: stages
                .last()
                .filter(|s| s.factory().app_port == Some(AppPort::Sink))
                .map(|s| {
                    let props = s.properties();
                    let capacity = props
                        .int("max-buffers")
                        .filter(|n| *n > 0)
                        .map_or(config.sink_capacity, |n| n as usize);
                    Arc::new(FrameQueue::new(capacity, props.bool("drop").unwrap_or(false)))
                }),
            source: stages
                .first()
                .filter(|s| s.factory().app_port == Some(AppPort::Source))
                .map(|s| {
                    let capacity = s
                        .properties()
                        .int("max-buffers")
                        .filter(|n| *n > 0)
                        .map_or(config.source_capacity, |n| n as usize);
                    Arc::new(FrameQueue::new(capacity, false))
                }),
        };
        let sink_name = ports
            .sink
            .as_ref()
            .and_then(|_| stages.last())
            .map(|s| s.name().to_string());

        let bus = Bus::new(id);
        let driver = engine.assemble(&stages, ports.clone(), bus.clone())?;

        tracing::info!(
            graph = %id,
            engine = engine.name(),
            stages = stages.len(),
            "graph built"
        );

        Ok(Self {
            inner: Arc::new(GraphInner {
                id,
                config,
                core: Mutex::new(GraphCore {
                    stages,
                    driver: Some(driver),
                }),
                state: RwLock::new(State::Null),
                bus,
                ports,
                sink_name,
                sink_claim: Mutex::new(None),
                source_claimed: AtomicBool::new(false),
                torn_down: AtomicBool::new(false),
            }),
        })
    }

    /// Parse a launch description and build it.
    pub fn from_description(
        engine: &dyn Engine,
        description: &str,
        config: GraphConfig,
    ) -> Result<Self> {
        let description = Description::parse(description)?;
        Self::build(engine, &description.stages, config)
    }

    pub fn id(&self) -> GraphId {
        self.inner.id
    }

    pub fn state(&self) -> State {
        *self.inner.state.read()
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.torn_down.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &GraphConfig {
        &self.inner.config
    }

    /// Walk the lifecycle to `target`, one adjacent state at a time.
    ///
    /// A refused step leaves the graph in the last state it reached and
    /// returns [`RelayError::StateChange`]. Returns [`StateChange::Async`] if
    /// any step completes in the background.
    pub fn set_state(&self, target: State) -> Result<StateChange> {
        if self.is_torn_down() {
            return Err(RelayError::TornDown);
        }
        let mut core = self.inner.core.lock();
        let GraphCore { stages, driver } = &mut *core;
        let driver = driver.as_mut().ok_or(RelayError::TornDown)?;

        let mut current = self.state();
        let mut outcome = StateChange::Success;
        while current != target {
            let next = current.step_towards(target);
            match driver.change_state(current, next) {
                Ok(StateChange::Async) => outcome = StateChange::Async,
                Ok(StateChange::Success) => {}
                Err(e) => {
                    tracing::warn!(graph = %self.id(), from = %current, to = %next, error = %e, "state change refused");
                    return Err(e);
                }
            }

            if next == State::Playing || current == State::Playing {
                for stage in stages.iter_mut() {
                    stage.set_locked(next == State::Playing);
                }
            }
            // Back in READY the exchange queues start over, so a finished
            // stream can be played again.
            if current == State::Paused && next == State::Ready {
                for queue in [&self.inner.ports.sink, &self.inner.ports.source]
                    .into_iter()
                    .flatten()
                {
                    queue.reset();
                }
            }
            *self.inner.state.write() = next;
            tracing::debug!(graph = %self.id(), from = %current, to = %next, "state changed");
            self.inner.bus.post(Message::StateChanged {
                old: current,
                new: next,
            });
            current = next;
        }
        Ok(outcome)
    }

    /// Stop the graph and release every stage and engine resource.
    ///
    /// Pending pulls and pushes return immediately. Safe to call more than
    /// once and from any thread, including frame callbacks.
    pub fn teardown(&self) {
        self.inner.teardown();
    }

    /// Change a stage property. Fails once the graph is playing.
    pub fn configure(&self, stage: &str, property: &str, value: PropertyValue) -> Result<()> {
        let mut core = self.inner.core.lock();
        if self.is_torn_down() {
            return Err(RelayError::TornDown);
        }
        let stage = core
            .stages
            .iter_mut()
            .find(|s| s.name() == stage)
            .ok_or_else(|| RelayError::config(stage, "no such stage in this graph"))?;
        stage.configure(property, value)
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.inner
            .core
            .lock()
            .stages
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Description that rebuilds this graph with its current configuration.
    pub fn description(&self) -> Result<Description> {
        let core = self.inner.core.lock();
        if core.stages.is_empty() {
            return Err(RelayError::TornDown);
        }
        Ok(Description::new(core.stages.iter().map(Stage::spec).collect()))
    }

    /// First engine error reported for this graph, if any.
    pub fn fault(&self) -> Option<RelayError> {
        self.inner.bus.fault().map(|f| RelayError::Engine {
            stage: f.stage,
            message: f.message,
        })
    }

    /// Queue counters of the `appsink`, if the graph has one.
    pub fn sink_stats(&self) -> Option<QueueStats> {
        self.inner.ports.sink.as_ref().map(|q| q.stats())
    }

    pub(crate) fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    fn claim_sink(&self, mode: &'static str) -> Result<Arc<FrameQueue>> {
        let queue = self
            .inner
            .ports
            .sink
            .clone()
            .ok_or_else(|| RelayError::config("sink", "graph does not end in an appsink"))?;
        let mut claim = self.inner.sink_claim.lock();
        if let Some(existing) = *claim {
            return Err(RelayError::ExchangeClaimed(existing));
        }
        *claim = Some(mode);
        Ok(queue)
    }

    /// Take the pull side of the `appsink`.
    pub fn pull_exchange(&self) -> Result<PullExchange> {
        let queue = self.claim_sink("pull")?;
        Ok(PullExchange::new(self.clone(), queue))
    }

    /// Deliver every `appsink` frame to `callback` on a dedicated thread.
    ///
    /// The frame passed to the callback is only valid during the call; use
    /// [`FrameBuffer::to_owned_copy`] to keep it. Returning [`Flow::Stop`]
    /// ends the stream.
    pub fn connect_frames<F>(&self, callback: F) -> Result<FrameCallback>
    where
        F: FnMut(&FrameBuffer<'_>) -> Flow + Send + 'static,
    {
        let queue = self.claim_sink("callback")?;
        let sink = self.inner.sink_name.clone().unwrap_or_default();
        FrameCallback::spawn(self.id(), queue, self.inner.bus.clone(), sink, callback)
    }

    /// Take the injection side of the `appsrc`.
    pub fn injector(&self) -> Result<FrameInjector> {
        let queue = self
            .inner
            .ports
            .source
            .clone()
            .ok_or_else(|| RelayError::config("source", "graph does not start with an appsrc"))?;
        if self.inner.source_claimed.swap(true, Ordering::SeqCst) {
            return Err(RelayError::ExchangeClaimed("inject"));
        }
        let constraints = {
            let core = self.inner.core.lock();
            core.stages.first().map(|s| s.properties().clone()).unwrap_or_default()
        };
        Ok(FrameInjector::new(
            self.clone(),
            queue,
            self.inner.config.push_timeout,
            &constraints,
        ))
    }
}

impl fmt::Debug for PipelineGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineGraph")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LocalEngine;

    fn specs(text: &str) -> Vec<StageSpec> {
        Description::parse(text).unwrap().stages
    }

    #[test]
    fn step_towards_walks_adjacent_states() {
        assert_eq!(State::Null.step_towards(State::Playing), State::Ready);
        assert_eq!(State::Ready.step_towards(State::Playing), State::Paused);
        assert_eq!(State::Paused.step_towards(State::Playing), State::Playing);
        assert_eq!(State::Playing.step_towards(State::Null), State::Paused);
        assert_eq!(State::Paused.step_towards(State::Null), State::Ready);
        assert_eq!(State::Ready.step_towards(State::Null), State::Null);
        assert_eq!(State::Paused.step_towards(State::Paused), State::Paused);
    }

    #[test]
    fn build_names_stages_by_position() {
        let engine = LocalEngine::new();
        let graph = PipelineGraph::build(
            &engine,
            &specs("testsrc ! identity name=tap ! appsink"),
            GraphConfig::default(),
        )
        .unwrap();
        assert_eq!(graph.stage_names(), ["testsrc0", "tap", "appsink2"]);
        assert_eq!(graph.state(), State::Null);
    }

    #[test]
    fn build_rejects_bad_chains() {
        let engine = LocalEngine::new();
        let cfg = GraphConfig::default;

        let err = PipelineGraph::build(&engine, &specs("testsrc ! nosuch ! appsink"), cfg()).unwrap_err();
        assert!(err.to_string().contains("unknown stage type"), "{err}");

        let err = PipelineGraph::build(&engine, &specs("appsink ! testsrc"), cfg()).unwrap_err();
        assert!(matches!(err, RelayError::Configuration { .. }));

        let err = PipelineGraph::build(
            &engine,
            &specs("testsrc name=a ! identity name=a ! appsink"),
            cfg(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"), "{err}");

        let err = PipelineGraph::build(&engine, &specs("rtspsrc ! appsink"), cfg()).unwrap_err();
        assert!(matches!(err, RelayError::Configuration { .. }));

        assert_eq!(engine.live_elements(), 0);
    }

    #[test]
    fn configure_is_refused_while_playing() {
        let engine = LocalEngine::new();
        let graph = PipelineGraph::build(
            &engine,
            &specs("testsrc is-live=true framerate=100 ! fakesink"),
            GraphConfig::default(),
        )
        .unwrap();
        graph
            .configure("testsrc0", "width", PropertyValue::Int(32))
            .unwrap();
        graph.set_state(State::Playing).unwrap();
        let err = graph
            .configure("testsrc0", "width", PropertyValue::Int(16))
            .unwrap_err();
        assert!(matches!(err, RelayError::StageLocked(_)));

        graph.set_state(State::Paused).unwrap();
        graph
            .configure("testsrc0", "width", PropertyValue::Int(16))
            .unwrap();
        graph.teardown();
    }

    #[test]
    fn teardown_is_idempotent() {
        let engine = LocalEngine::new();
        let graph =
            PipelineGraph::build(&engine, &specs("testsrc ! appsink"), GraphConfig::default())
                .unwrap();
        graph.set_state(State::Paused).unwrap();
        graph.teardown();
        graph.teardown();
        assert!(graph.is_torn_down());
        assert_eq!(graph.state(), State::Null);
        assert!(matches!(
            graph.set_state(State::Playing),
            Err(RelayError::TornDown)
        ));
        assert_eq!(engine.live_elements(), 0);
    }

    #[test]
    fn pull_and_callback_are_exclusive() {
        let engine = LocalEngine::new();
        let graph =
            PipelineGraph::build(&engine, &specs("testsrc ! appsink"), GraphConfig::default())
                .unwrap();
        let _pull = graph.pull_exchange().unwrap();
        let err = graph.connect_frames(|_| Flow::Continue).unwrap_err();
        assert!(matches!(err, RelayError::ExchangeClaimed("pull")));
        graph.teardown();
    }
}
