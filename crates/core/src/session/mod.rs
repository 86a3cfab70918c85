//! Client sessions of a [`SessionServer`](crate::SessionServer).
//!
//! A session pairs one client connection with the graph feeding it. It is
//! created when the client sends `PLAY` and destroyed by `TEARDOWN`, client
//! disconnect, or the end of its stream.
//!
//! ```text
//! PLAY            -> Playing
//! TEARDOWN        -> (removed)
//! TCP disconnect  -> (removed, via cleanup)
//! EOS / error     -> Ended -> (removed, via cleanup)
//! end_session     -> Ended -> (removed, via cleanup)
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::bus::GraphId;
use crate::graph::PipelineGraph;

/// Default session timeout advertised in the `Session` header.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Frames are being delivered.
    Playing,
    /// The graph behind the session finished or failed.
    Ended,
}

/// One client's live stream.
#[derive(Debug)]
pub struct Session {
    /// Random 16-char hex identifier.
    pub id: String,
    pub mount: String,
    pub peer: SocketAddr,
    pub timeout_secs: u64,
    graph: RwLock<Option<PipelineGraph>>,
    closed: AtomicBool,
}

impl Session {
    pub fn new(mount: &str, peer: SocketAddr) -> Self {
        Session {
            id: format!("{:016X}", rand::random::<u64>()),
            mount: mount.to_string(),
            peer,
            timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            graph: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Attach the graph feeding this session. For shared mounts this is the
    /// mount's common graph.
    pub fn set_graph(&self, graph: PipelineGraph) {
        tracing::debug!(session_id = %self.id, graph = %graph.id(), "graph attached");
        *self.graph.write() = Some(graph);
    }

    pub fn graph(&self) -> Option<PipelineGraph> {
        self.graph.read().clone()
    }

    /// Mark the session ended; its connection winds down on the next pass.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn state(&self) -> SessionState {
        if self.closed.load(Ordering::SeqCst) {
            return SessionState::Ended;
        }
        match &*self.graph.read() {
            Some(graph) if graph.is_torn_down() => SessionState::Ended,
            _ => SessionState::Playing,
        }
    }

    /// `Session` response header value, e.g. `"00000000DEADBEEF;timeout=60"`.
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout_secs)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            mount: self.mount.clone(),
            peer: self.peer,
            graph: self.graph.read().as_ref().map(PipelineGraph::id),
            state: self.state(),
        }
    }
}

/// Snapshot of a session for listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub mount: String,
    pub peer: SocketAddr,
    pub graph: Option<GraphId>,
    pub state: SessionState,
}

/// Thread-safe registry of active sessions.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a session for a client of `mount`.
    pub fn create_session(&self, mount: &str, peer: SocketAddr) -> Arc<Session> {
        let session = Arc::new(Session::new(mount, peer));
        let total = {
            let mut sessions = self.sessions.write();
            sessions.insert(session.id.clone(), session.clone());
            sessions.len()
        };
        tracing::debug!(session_id = %session.id, mount, %peer, total_sessions = total, "session created");
        session
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, total_sessions = self.len(), "session removed");
        }
        removed
    }

    /// Remove every session, returning them.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.write().drain().map(|(_, s)| s).collect()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self.sessions.read().values().map(|s| s.info()).collect();
        sessions.sort_by(|a, b| a.mount.cmp(&b.mount).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
