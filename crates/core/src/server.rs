use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::engine::Engine;
use crate::error::{RelayError, Result};
use crate::event_loop::{EventLoop, StopHandle};
use crate::graph::{GraphConfig, PipelineGraph};
use crate::mount::{FanoutPolicy, Mount, MountPolicy, MountRegistry};
use crate::session::{SessionInfo, SessionManager};
use crate::transport::tcp;

/// Server-level configuration shared by every connection.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface the listeners bind to.
    pub host: String,
    /// How long a client may stay connected without starting a session.
    pub handshake_timeout: Duration,
    /// Frames buffered per subscriber of a shared mount before it starts
    /// missing frames.
    pub fanout_depth: usize,
    pub fanout: FanoutPolicy,
    /// A client that cannot take a frame within this time is dropped.
    pub write_timeout: Duration,
    /// Settings for every graph the server builds.
    pub graph: GraphConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            handshake_timeout: Duration::from_secs(5),
            fanout_depth: 8,
            fanout: FanoutPolicy::default(),
            write_timeout: Duration::from_secs(2),
            graph: GraphConfig::default(),
        }
    }
}

/// Everything a connection needs to serve its client.
pub(crate) struct ServerContext {
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) events: Arc<EventLoop>,
    pub(crate) sessions: SessionManager,
    pub(crate) config: ServerConfig,
}

struct Listener {
    addr: SocketAddr,
    mounts: MountRegistry,
    thread: Option<JoinHandle<()>>,
}

/// Serves pipeline descriptions to network clients.
///
/// Each [`bind`](Self::bind) exposes a description under a mount path on a
/// TCP port. A client that plays the mount gets its own graph (or a seat on
/// the mount's shared graph) and receives the frames reaching its sink.
/// Sessions are independent: one client going away never disturbs another.
pub struct SessionServer {
    ctx: Arc<ServerContext>,
    running: Arc<AtomicBool>,
    listeners: Mutex<HashMap<u16, Listener>>,
    event_stop: StopHandle,
    event_thread: Mutex<Option<JoinHandle<()>>>,
}

impl SessionServer {
    pub fn new(engine: Arc<dyn Engine>) -> Result<Self> {
        Self::with_config(engine, ServerConfig::default())
    }

    pub fn with_config(engine: Arc<dyn Engine>, config: ServerConfig) -> Result<Self> {
        let events = Arc::new(EventLoop::persistent());
        let event_stop = events.stop_handle();
        let event_thread = {
            let events = events.clone();
            thread::Builder::new()
                .name("relay-events".to_string())
                .spawn(move || {
                    let exit = events.run();
                    tracing::debug!(reason = ?exit.reason, errors = exit.errors.len(), "server event loop exited");
                })?
        };

        tracing::info!(engine = engine.name(), host = %config.host, "session server created");
        Ok(Self {
            ctx: Arc::new(ServerContext {
                engine,
                events,
                sessions: SessionManager::new(),
                config,
            }),
            running: Arc::new(AtomicBool::new(true)),
            listeners: Mutex::new(HashMap::new()),
            event_stop,
            event_thread: Mutex::new(Some(event_thread)),
        })
    }

    /// Expose `description` at `mount` on `port`, one graph per session.
    ///
    /// Port `0` picks a free port; the returned address says which.
    pub fn bind(&self, mount: &str, description: &str, port: u16) -> Result<SocketAddr> {
        self.bind_with_policy(mount, description, port, MountPolicy::Exclusive)
    }

    /// Like [`bind`](Self::bind) with an explicit session policy.
    pub fn bind_with_policy(
        &self,
        mount: &str,
        description: &str,
        port: u16,
        policy: MountPolicy,
    ) -> Result<SocketAddr> {
        let bind_error = |reason: String| RelayError::Bind {
            target: mount.to_string(),
            reason,
        };
        if !self.running.load(Ordering::SeqCst) {
            return Err(bind_error("server is stopped".to_string()));
        }
        if !mount.starts_with('/') {
            return Err(bind_error("mount path must start with '/'".to_string()));
        }
        self.validate(description).map_err(|e| bind_error(e.to_string()))?;

        let mut listeners = self.listeners.lock();
        if port != 0
            && let Some(listener) = listeners.get(&port)
        {
            listener.mounts.add(Mount::new(mount, description, policy))?;
            tracing::info!(%mount, addr = %listener.addr, "mount bound");
            return Ok(listener.addr);
        }

        let target = format!("{}:{port}", self.ctx.config.host);
        let socket = TcpListener::bind(&target).map_err(|e| RelayError::Bind {
            target: target.clone(),
            reason: e.to_string(),
        })?;
        socket.set_nonblocking(true)?;
        let addr = socket.local_addr()?;

        let mounts = MountRegistry::new();
        mounts.add(Mount::new(mount, description, policy))?;

        let thread = {
            let ctx = self.ctx.clone();
            let mounts = mounts.clone();
            let running = self.running.clone();
            thread::Builder::new()
                .name(format!("relay-accept-{}", addr.port()))
                .spawn(move || tcp::accept_loop(socket, ctx, mounts, running))?
        };

        tracing::info!(%mount, %addr, ?policy, "session server listening");
        listeners.insert(
            addr.port(),
            Listener {
                addr,
                mounts,
                thread: Some(thread),
            },
        );
        Ok(addr)
    }

    /// Build the description once so a broken one fails at bind time rather
    /// than when the first client arrives.
    fn validate(&self, description: &str) -> Result<()> {
        let graph = PipelineGraph::from_description(
            &*self.ctx.engine,
            description,
            self.ctx.config.graph.clone(),
        )?;
        let ends_in_appsink = graph.sink_stats().is_some();
        graph.teardown();
        if !ends_in_appsink {
            return Err(RelayError::config(
                "description",
                "a served description must end in appsink",
            ));
        }
        Ok(())
    }

    /// Snapshot of the live sessions, ordered by mount.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.ctx.sessions.list()
    }

    /// End one session from the server side. Its client connection is
    /// closed and the graph released as if the client had left.
    pub fn end_session(&self, id: &str) -> Result<()> {
        let session = self
            .ctx
            .sessions
            .get_session(id)
            .ok_or_else(|| RelayError::SessionNotFound(id.to_string()))?;
        session.close();
        tracing::info!(session_id = %id, mount = %session.mount, "session ended by server");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop accepting, end every session and join the server's threads.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("session server stopping");

        let listeners: Vec<Listener> = self.listeners.lock().drain().map(|(_, l)| l).collect();
        for mut listener in listeners {
            if let Some(thread) = listener.thread.take() {
                let _ = thread.join();
            }
            for mount in listener.mounts.all() {
                mount.close_feed();
            }
        }

        for session in self.ctx.sessions.drain() {
            if let Some(graph) = session.graph() {
                graph.teardown();
            }
        }

        self.event_stop.stop();
        if let Some(thread) = self.event_thread.lock().take() {
            let _ = thread.join();
        }
        tracing::info!("session server stopped");
    }
}

impl Drop for SessionServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LocalEngine;

    fn server() -> SessionServer {
        SessionServer::new(Arc::new(LocalEngine::new())).unwrap()
    }

    #[test]
    fn bind_rejects_unknown_stage() {
        let server = server();
        let err = server.bind("/bad", "nosuchthing ! appsink", 0).unwrap_err();
        assert!(matches!(err, RelayError::Bind { .. }));
    }

    #[test]
    fn bind_requires_appsink_at_the_end() {
        let server = server();
        let err = server.bind("/x", "testsrc ! fakesink", 0).unwrap_err();
        assert!(matches!(err, RelayError::Bind { .. }));
    }

    #[test]
    fn bind_rejects_relative_mount() {
        let server = server();
        assert!(server.bind("test", "testsrc ! appsink", 0).is_err());
    }

    #[test]
    fn mounts_share_a_port() {
        let server = server();
        let addr = server.bind("/a", "testsrc ! appsink", 0).unwrap();
        let again = server
            .bind_with_policy("/b", "testsrc ! appsink", addr.port(), MountPolicy::Shared)
            .unwrap();
        assert_eq!(addr, again);

        let dup = server.bind("/a", "testsrc ! appsink", addr.port()).unwrap_err();
        assert!(matches!(dup, RelayError::Bind { .. }));
        server.stop();
        assert!(!server.is_running());
    }

    #[test]
    fn port_in_use_is_a_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let server = SessionServer::with_config(
            Arc::new(LocalEngine::new()),
            ServerConfig {
                host: "127.0.0.1".to_string(),
                ..ServerConfig::default()
            },
        )
        .unwrap();
        let err = server.bind("/a", "testsrc ! appsink", port).unwrap_err();
        assert!(matches!(err, RelayError::Bind { target, .. } if target.ends_with(&port.to_string())));
    }
}
