//! Dispatch of graph notifications.
//!
//! One [`EventLoop`] watches any number of graphs. End-of-stream and errors
//! are answered by tearing the posting graph down; errors are logged and
//! collected so the caller can report them once the loop returns.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, select};
use parking_lot::Mutex;

use crate::bus::{Envelope, GraphId, Message};
use crate::error::{RelayError, Result};
use crate::graph::{PipelineGraph, State};

/// Longest wait between checks for graphs torn down outside the loop.
const PRUNE_INTERVAL: Duration = Duration::from_millis(100);

type Observer = Box<dyn FnMut(GraphId, &Message) + Send>;

/// Why [`EventLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Every watched graph terminated.
    Idle,
    /// [`StopHandle::stop`] was called.
    Stopped,
    /// The run deadline passed.
    TimedOut,
}

/// Summary of one [`EventLoop::run`] call.
#[derive(Debug)]
pub struct LoopExit {
    pub reason: ExitReason,
    /// Engine errors reported while the loop ran, in arrival order.
    pub errors: Vec<RelayError>,
}

/// Stops a running [`EventLoop`]. Usable from any thread, including signal
/// handlers and frame callbacks.
#[derive(Clone)]
pub struct StopHandle {
    tx: Sender<()>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Receives lifecycle messages from watched graphs and reacts to them.
pub struct EventLoop {
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    graphs: Mutex<HashMap<GraphId, PipelineGraph>>,
    exit_when_idle: bool,
    observer: Mutex<Option<Observer>>,
}

impl EventLoop {
    /// A loop that returns once every watched graph has terminated.
    pub fn new() -> Self {
        Self::with_idle_exit(true)
    }

    /// A loop that keeps running with no graphs until stopped. Used by
    /// servers whose graphs come and go with client sessions.
    pub fn persistent() -> Self {
        Self::with_idle_exit(false)
    }

    fn with_idle_exit(exit_when_idle: bool) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        Self {
            tx,
            rx,
            stop_tx,
            stop_rx,
            graphs: Mutex::new(HashMap::new()),
            exit_when_idle,
            observer: Mutex::new(None),
        }
    }

    /// Start receiving `graph`'s messages. Anything it posted before this
    /// call is delivered first.
    pub fn watch(&self, graph: &PipelineGraph) {
        self.graphs.lock().insert(graph.id(), graph.clone());
        graph.bus().attach(self.tx.clone());
        tracing::debug!(graph = %graph.id(), "watching graph");
    }

    /// Forget a graph without tearing it down.
    pub fn unwatch(&self, graph: GraphId) -> Option<PipelineGraph> {
        self.graphs.lock().remove(&graph)
    }

    pub fn watched(&self) -> usize {
        self.graphs.lock().len()
    }

    /// Called for every message before the loop acts on it.
    pub fn on_message<F>(&self, observer: F)
    where
        F: FnMut(GraphId, &Message) + Send + 'static,
    {
        *self.observer.lock() = Some(Box::new(observer));
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Block dispatching messages until stopped or, for a non-persistent
    /// loop, until no watched graph is left.
    pub fn run(&self) -> LoopExit {
        self.run_until(None)
    }

    /// Like [`run`](Self::run), but give up after `timeout`.
    pub fn run_for(&self, timeout: Duration) -> LoopExit {
        self.run_until(Some(Instant::now() + timeout))
    }

    fn run_until(&self, deadline: Option<Instant>) -> LoopExit {
        let mut errors = Vec::new();
        let reason = loop {
            if self.prune() == 0 && self.exit_when_idle {
                self.drain(&mut errors);
                break ExitReason::Idle;
            }
            let timeout = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(left) => left.min(PRUNE_INTERVAL),
                    None => break ExitReason::TimedOut,
                },
                None => PRUNE_INTERVAL,
            };

            select! {
                recv(self.stop_rx) -> _ => {
                    self.drain(&mut errors);
                    break ExitReason::Stopped;
                }
                recv(self.rx) -> envelope => {
                    if let Ok(envelope) = envelope {
                        self.dispatch(envelope, &mut errors);
                    }
                }
                default(timeout) => {}
            }
        };
        tracing::debug!(?reason, errors = errors.len(), "event loop exited");
        LoopExit { reason, errors }
    }

    /// Dispatch messages until `graph` terminates, `timeout` passes or the
    /// loop is stopped.
    ///
    /// Returns `Ok(true)` once the graph ended or was torn down, `Ok(false)`
    /// on timeout or [`StopHandle::stop`], and the graph's engine error if
    /// it failed. Other watched graphs keep being serviced meanwhile.
    pub fn wait_for_termination(&self, graph: &PipelineGraph, timeout: Duration) -> Result<bool> {
        if !graph.is_torn_down() && !self.graphs.lock().contains_key(&graph.id()) {
            self.watch(graph);
        }
        let deadline = Instant::now() + timeout;
        let mut errors = Vec::new();
        loop {
            self.prune();
            if !self.graphs.lock().contains_key(&graph.id()) {
                break;
            }
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(false);
            };
            select! {
                recv(self.stop_rx) -> _ => {
                    self.drain(&mut errors);
                    tracing::debug!(graph = %graph.id(), "wait for termination stopped");
                    return Ok(false);
                }
                recv(self.rx) -> envelope => {
                    if let Ok(envelope) = envelope {
                        self.dispatch(envelope, &mut errors);
                    }
                }
                default(left.min(PRUNE_INTERVAL)) => {}
            }
        }
        match graph.fault() {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }

    /// Forget graphs torn down outside the loop. Returns how many remain.
    fn prune(&self) -> usize {
        let mut graphs = self.graphs.lock();
        graphs.retain(|id, graph| {
            let live = !graph.is_torn_down();
            if !live {
                tracing::debug!(graph = %id, "torn-down graph released");
            }
            live
        });
        graphs.len()
    }

    /// Handle whatever is already queued without blocking.
    fn drain(&self, errors: &mut Vec<RelayError>) {
        while let Ok(envelope) = self.rx.try_recv() {
            self.dispatch(envelope, errors);
        }
    }

    fn dispatch(&self, envelope: Envelope, errors: &mut Vec<RelayError>) {
        let Envelope { graph, message } = envelope;
        if let Some(observer) = self.observer.lock().as_mut() {
            observer(graph, &message);
        }

        match message {
            Message::StateChanged { old, new } => {
                tracing::debug!(%graph, %old, %new, "state changed");
                if new == State::Null {
                    let mut graphs = self.graphs.lock();
                    if graphs.get(&graph).is_some_and(PipelineGraph::is_torn_down) {
                        graphs.remove(&graph);
                    }
                }
            }
            Message::EndOfStream => {
                tracing::info!(%graph, "end of stream");
                self.terminate(graph);
            }
            Message::Error { stage, message } => {
                tracing::error!(
                    %graph,
                    stage = stage.as_deref().unwrap_or("pipeline"),
                    %message,
                    "engine error"
                );
                errors.push(RelayError::Engine { stage, message });
                self.terminate(graph);
            }
        }
    }

    fn terminate(&self, graph: GraphId) {
        let removed = self.graphs.lock().remove(&graph);
        if let Some(graph) = removed {
            graph.teardown();
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::engine::LocalEngine;
    use crate::graph::GraphConfig;

    fn graph(engine: &LocalEngine, text: &str) -> PipelineGraph {
        PipelineGraph::from_description(engine, text, GraphConfig::default()).unwrap()
    }

    #[test]
    fn eos_tears_down_and_loop_goes_idle() {
        let engine = LocalEngine::new();
        let g = graph(&engine, "testsrc num-buffers=3 width=8 height=8 ! fakesink");
        let events = EventLoop::new();
        events.watch(&g);
        g.set_state(State::Playing).unwrap();

        let exit = events.run_for(Duration::from_secs(5));
        assert_eq!(exit.reason, ExitReason::Idle);
        assert!(exit.errors.is_empty());
        assert!(g.is_torn_down());
        assert_eq!(engine.live_elements(), 0);
    }

    #[test]
    fn errors_are_collected() {
        let engine = LocalEngine::new();
        let g = graph(
            &engine,
            "testsrc width=8 height=8 ! identity name=tap error-after=2 ! fakesink",
        );
        let events = EventLoop::new();
        events.watch(&g);
        g.set_state(State::Playing).unwrap();

        let exit = events.run_for(Duration::from_secs(5));
        assert_eq!(exit.reason, ExitReason::Idle);
        assert_eq!(exit.errors.len(), 1);
        assert!(matches!(
            &exit.errors[0],
            RelayError::Engine { stage: Some(s), .. } if s == "tap"
        ));
        assert!(g.is_torn_down());
    }

    #[test]
    fn stop_from_another_thread() {
        let engine = LocalEngine::new();
        let g = graph(&engine, "testsrc is-live=true framerate=50 ! fakesink");
        let events = EventLoop::new();
        events.watch(&g);
        g.set_state(State::Playing).unwrap();

        let stop = events.stop_handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stop.stop();
        });
        let exit = events.run_for(Duration::from_secs(5));
        stopper.join().unwrap();
        assert_eq!(exit.reason, ExitReason::Stopped);
        assert!(!g.is_torn_down());
        g.teardown();
    }

    #[test]
    fn wait_for_termination_reports_eos_and_errors() {
        let engine = LocalEngine::new();
        let events = EventLoop::new();

        let finishing = graph(&engine, "testsrc num-buffers=2 width=8 height=8 ! fakesink");
        finishing.set_state(State::Playing).unwrap();
        assert!(events.wait_for_termination(&finishing, Duration::from_secs(5)).unwrap());

        let failing = graph(&engine, "testsrc width=8 height=8 ! identity error-after=1 ! fakesink");
        failing.set_state(State::Playing).unwrap();
        let err = events
            .wait_for_termination(&failing, Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, RelayError::Engine { .. }));

        let endless = graph(&engine, "testsrc is-live=true width=8 height=8 ! fakesink");
        endless.set_state(State::Playing).unwrap();
        assert!(!events.wait_for_termination(&endless, Duration::from_millis(50)).unwrap());
        endless.teardown();
    }

    #[test]
    fn teardown_outside_the_loop_releases_the_graph() {
        let engine = LocalEngine::new();
        let events = EventLoop::new();

        let idle = graph(&engine, "testsrc ! fakesink");
        events.watch(&idle);
        idle.teardown();
        let exit = events.run_for(Duration::from_millis(300));
        assert_eq!(exit.reason, ExitReason::Idle);
        assert_eq!(events.watched(), 0);

        let early = graph(&engine, "testsrc ! fakesink");
        early.teardown();
        events.watch(&early);
        assert_eq!(events.run_for(Duration::from_millis(300)).reason, ExitReason::Idle);
    }

    #[test]
    fn teardown_while_running_wakes_the_loop() {
        let engine = LocalEngine::new();
        let g = graph(&engine, "testsrc ! fakesink");
        let events = EventLoop::new();
        events.watch(&g);

        let remote = g.clone();
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.teardown();
        });
        let started = Instant::now();
        let exit = events.run();
        closer.join().unwrap();
        assert_eq!(exit.reason, ExitReason::Idle);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn stop_ends_wait_for_termination() {
        let engine = LocalEngine::new();
        let g = graph(&engine, "testsrc is-live=true framerate=50 width=8 height=8 ! fakesink");
        g.set_state(State::Playing).unwrap();
        let events = EventLoop::new();

        let stop = events.stop_handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stop.stop();
        });
        let started = Instant::now();
        let ended = events.wait_for_termination(&g, Duration::from_secs(60)).unwrap();
        stopper.join().unwrap();
        assert!(!ended);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!g.is_torn_down());
        g.teardown();
    }

    #[test]
    fn persistent_loop_times_out_when_empty() {
        let events = EventLoop::persistent();
        let exit = events.run_for(Duration::from_millis(20));
        assert_eq!(exit.reason, ExitReason::TimedOut);
    }

    #[test]
    fn observer_sees_state_changes() {
        let engine = LocalEngine::new();
        let g = graph(&engine, "testsrc num-buffers=1 width=8 height=8 ! fakesink");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let events = EventLoop::new();
        {
            let seen = seen.clone();
            events.on_message(move |_, m| seen.lock().push(m.clone()));
        }
        g.set_state(State::Playing).unwrap();
        events.watch(&g);
        events.run_for(Duration::from_secs(5));

        let seen = seen.lock();
        assert!(seen.contains(&Message::StateChanged {
            old: State::Paused,
            new: State::Playing
        }));
        assert!(seen.contains(&Message::EndOfStream));
    }
}
