use std::io::{self, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::frame::FrameBuffer;
use crate::mount::MountRegistry;
use crate::protocol::request::read_head;
use crate::protocol::{MethodHandler, Request, Response};
use crate::server::ServerContext;
use crate::transport::framing::{VIDEO_CHANNEL, write_frame};

/// Poll interval for the accept loop and for connection reads.
const POLL: Duration = Duration::from_millis(50);

/// Non-blocking TCP accept loop for one port.
///
/// Checks the `running` flag between accepts so that
/// [`SessionServer::stop`](crate::SessionServer::stop) can end it promptly.
pub(crate) fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    mounts: MountRegistry,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let ctx = ctx.clone();
                let mounts = mounts.clone();
                let running = running.clone();
                let spawned = thread::Builder::new()
                    .name("relay-conn".to_string())
                    .spawn(move || Connection::handle(stream, ctx, mounts, running));
                if let Err(e) = spawned {
                    tracing::error!(error = %e, "failed to spawn connection thread");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(POLL);
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// Write half of a client connection, shared by the control responder and
/// whichever thread delivers frames.
#[derive(Clone)]
pub(crate) struct ClientWriter {
    stream: Arc<Mutex<TcpStream>>,
}

impl ClientWriter {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream: Arc::new(Mutex::new(stream)),
        }
    }

    pub(crate) fn send_response(&self, response: &Response) -> io::Result<()> {
        self.stream.lock().write_all(response.serialize().as_bytes())
    }

    pub(crate) fn send_frame(&self, frame: &FrameBuffer<'_>) -> io::Result<()> {
        write_frame(&mut *self.stream.lock(), VIDEO_CHANNEL, frame)
    }

    fn shutdown(&self) {
        let _ = self.stream.lock().shutdown(Shutdown::Both);
    }
}

/// A single client connection with its own lifecycle.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: ClientWriter,
    handler: MethodHandler,
    peer_addr: SocketAddr,
    handshake_deadline: Instant,
}

impl Connection {
    fn handle(
        stream: TcpStream,
        ctx: Arc<ServerContext>,
        mounts: MountRegistry,
        running: Arc<AtomicBool>,
    ) {
        let Ok(peer_addr) = stream.peer_addr() else {
            return;
        };
        tracing::info!(%peer_addr, "client connected");

        if let Err(e) = stream
            .set_read_timeout(Some(POLL))
            .and_then(|()| stream.set_write_timeout(Some(ctx.config.write_timeout)))
            .and_then(|()| stream.set_nodelay(true))
        {
            tracing::warn!(%peer_addr, error = %e, "failed to configure socket");
            return;
        }
        let Ok(reader_stream) = stream.try_clone() else {
            return;
        };

        let writer = ClientWriter::new(stream);
        let handshake_deadline = Instant::now() + ctx.config.handshake_timeout;
        let handler = MethodHandler::new(ctx, mounts, peer_addr, writer.clone());

        let mut conn = Connection {
            reader: BufReader::new(reader_stream),
            writer,
            handler,
            peer_addr,
            handshake_deadline,
        };

        let reason = conn.run(&running);
        conn.cleanup();

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// Request/response loop. Returns the reason for exiting.
    fn run(&mut self, running: &AtomicBool) -> &'static str {
        let mut head = String::new();
        while running.load(Ordering::SeqCst) {
            if !self.handler.has_session() && Instant::now() >= self.handshake_deadline {
                return "handshake timeout";
            }
            if self.handler.stream_ended() {
                return "stream ended";
            }

            match read_head(&mut self.reader, &mut head) {
                Ok(false) => return "connection closed by client",
                Ok(true) => {}
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    continue;
                }
                Err(_) => return "read error",
            }

            let text = std::mem::take(&mut head);
            let response = match Request::parse(&text) {
                Ok(request) => {
                    tracing::debug!(
                        peer = %self.peer_addr,
                        method = %request.method,
                        uri = %request.uri,
                        "request"
                    );
                    self.handler.handle(&request)
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                    Response::bad_request()
                }
            };
            tracing::debug!(peer = %self.peer_addr, status = response.status_code, "response");

            if self.writer.send_response(&response).is_err() {
                return "write error";
            }
            self.handler.activate();
        }

        "server shutting down"
    }

    fn cleanup(&mut self) {
        self.handler.close();
        self.writer.shutdown();
    }
}
