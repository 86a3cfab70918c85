use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Receiver;

use crate::error::Result;
use crate::exchange::{Flow, FrameCallback};
use crate::frame::FrameBuffer;
use crate::graph::{PipelineGraph, State};
use crate::mount::{Mount, MountPolicy, MountRegistry};
use crate::protocol::request::Request;
use crate::protocol::response::Response;
use crate::server::ServerContext;
use crate::session::{Session, SessionState};
use crate::transport::tcp::ClientWriter;

/// Work deferred until the `PLAY` response is on the wire, so that no
/// frame can overtake it.
enum Pending {
    Start(PipelineGraph),
    Forward(Receiver<FrameBuffer<'static>>),
}

struct Active {
    session: Arc<Session>,
    mount: Arc<Mount>,
    pending: Option<Pending>,
    _callback: Option<FrameCallback>,
}

/// Handles control requests for a single client connection.
///
/// A connection carries at most one session at a time.
pub struct MethodHandler {
    ctx: Arc<ServerContext>,
    mounts: MountRegistry,
    peer: SocketAddr,
    writer: ClientWriter,
    active: Option<Active>,
}

impl MethodHandler {
    pub(crate) fn new(
        ctx: Arc<ServerContext>,
        mounts: MountRegistry,
        peer: SocketAddr,
        writer: ClientWriter,
    ) -> Self {
        MethodHandler {
            ctx,
            mounts,
            peer,
            writer,
            active: None,
        }
    }

    pub fn has_session(&self) -> bool {
        self.active.is_some()
    }

    /// Whether the graph feeding this connection has terminated.
    pub fn stream_ended(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.session.state() == SessionState::Ended)
    }

    pub fn handle(&mut self, request: &Request) -> Response {
        let cseq = request.cseq().unwrap_or("0");

        let response = match request.method.as_str() {
            "OPTIONS" => Response::ok().header(
                "Public",
                "OPTIONS, DESCRIBE, PLAY, TEARDOWN, GET_PARAMETER",
            ),
            "DESCRIBE" => self.handle_describe(request),
            "PLAY" => self.handle_play(request),
            "TEARDOWN" => self.handle_teardown(request),
            "GET_PARAMETER" => self.handle_get_parameter(request),
            _ => {
                tracing::warn!(peer = %self.peer, method = %request.method, %cseq, "unsupported method");
                Response::not_implemented()
            }
        };
        response.header("CSeq", cseq)
    }

    fn handle_describe(&self, request: &Request) -> Response {
        match self.mounts.resolve_from_uri(&request.uri) {
            Ok(mount) => Response::ok()
                .header("Content-Base", &request.uri)
                .body("text/plain", mount.description().to_string()),
            Err(e) => {
                tracing::warn!(uri = %request.uri, error = %e, "DESCRIBE refused");
                Response::not_found()
            }
        }
    }

    fn handle_play(&mut self, request: &Request) -> Response {
        if let Some(active) = &self.active {
            return match request.session_id() {
                Some(id) if id != active.session.id => Response::session_not_found(),
                _ => Response::ok().header("Session", &active.session.session_header_value()),
            };
        }

        let mount = match self.mounts.resolve_from_uri(&request.uri) {
            Ok(mount) => mount,
            Err(e) => {
                tracing::warn!(uri = %request.uri, peer = %self.peer, error = %e, "PLAY refused");
                return Response::not_found();
            }
        };

        let session = self.ctx.sessions.create_session(mount.path(), self.peer);
        match self.prepare(&mount, &session) {
            Ok((pending, callback)) => {
                tracing::info!(
                    session_id = %session.id,
                    mount = %mount.path(),
                    peer = %self.peer,
                    policy = ?mount.policy(),
                    "session created via PLAY"
                );
                let response =
                    Response::ok().header("Session", &session.session_header_value());
                self.active = Some(Active {
                    session,
                    mount,
                    pending: Some(pending),
                    _callback: callback,
                });
                response
            }
            Err(e) => {
                tracing::error!(mount = %mount.path(), peer = %self.peer, error = %e, "failed to start session");
                self.ctx.sessions.remove_session(&session.id);
                Response::internal_error()
            }
        }
    }

    fn prepare(
        &self,
        mount: &Mount,
        session: &Session,
    ) -> Result<(Pending, Option<FrameCallback>)> {
        match mount.policy() {
            MountPolicy::Exclusive => {
                let graph = mount.instantiate(&self.ctx)?;
                let writer = self.writer.clone();
                let session_id = session.id.clone();
                let callback = graph.connect_frames(move |frame| match writer.send_frame(frame) {
                    Ok(()) => Flow::Continue,
                    Err(e) => {
                        tracing::debug!(session_id = %session_id, error = %e, "client write failed");
                        Flow::Stop
                    }
                });
                let callback = match callback {
                    Ok(callback) => callback,
                    Err(e) => {
                        graph.teardown();
                        return Err(e);
                    }
                };
                self.ctx.events.watch(&graph);
                session.set_graph(graph.clone());
                Ok((Pending::Start(graph), Some(callback)))
            }
            MountPolicy::Shared => {
                let (graph, frames) = mount.join_feed(&self.ctx, &session.id)?;
                session.set_graph(graph);
                Ok((Pending::Forward(frames), None))
            }
        }
    }

    /// Start delivery for a session created by the last request.
    pub(crate) fn activate(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        match active.pending.take() {
            Some(Pending::Start(graph)) => {
                if let Err(e) = graph.set_state(State::Playing) {
                    tracing::error!(session_id = %active.session.id, error = %e, "session graph failed to start");
                    graph.teardown();
                }
            }
            Some(Pending::Forward(frames)) => {
                let writer = self.writer.clone();
                let session_id = active.session.id.clone();
                let spawned = thread::Builder::new()
                    .name(format!("relay-{session_id}"))
                    .spawn(move || {
                        for frame in frames.iter() {
                            if let Err(e) = writer.send_frame(&frame) {
                                tracing::debug!(session_id = %session_id, error = %e, "client write failed");
                                break;
                            }
                        }
                    });
                if let Err(e) = spawned {
                    tracing::error!(session_id = %active.session.id, error = %e, "failed to spawn forwarder");
                }
            }
            None => {}
        }
    }

    fn handle_teardown(&mut self, request: &Request) -> Response {
        let matches = match (&self.active, request.session_id()) {
            (Some(active), Some(id)) => active.session.id == id,
            _ => false,
        };
        if !matches {
            tracing::warn!(peer = %self.peer, session = ?request.session_id(), "TEARDOWN for unknown session");
            return Response::session_not_found();
        }
        self.close();
        Response::ok()
    }

    /// Keepalive.
    fn handle_get_parameter(&self, request: &Request) -> Response {
        tracing::trace!(peer = %self.peer, "GET_PARAMETER keepalive");
        match (&self.active, request.session_id()) {
            (Some(active), Some(id)) if active.session.id == id => {
                Response::ok().header("Session", &active.session.session_header_value())
            }
            _ => Response::ok(),
        }
    }

    /// End this connection's session, if any, leaving every other session
    /// untouched.
    pub fn close(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let id = &active.session.id;
        match active.mount.policy() {
            MountPolicy::Exclusive => {
                if let Some(graph) = active.session.graph() {
                    self.ctx.events.unwatch(graph.id());
                    graph.teardown();
                }
            }
            MountPolicy::Shared => active.mount.leave_feed(id),
        }
        self.ctx.sessions.remove_session(id);
        tracing::info!(session_id = %id, mount = %active.mount.path(), peer = %self.peer, "session closed");
    }
}
