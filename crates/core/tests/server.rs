//! Session server over real TCP connections on loopback.
//!
//! Each client performs the control handshake and then reads interleaved
//! frames off the same connection.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use relay::transport::{WireFrame, read_frame};
use relay::{LocalEngine, MountPolicy, RelayError, ServerConfig, SessionServer};

const LIVE: &str = "testsrc is-live=true framerate=60 width=16 height=8 ! appsink";

fn server() -> SessionServer {
    SessionServer::with_config(
        Arc::new(LocalEngine::new()),
        ServerConfig {
            host: "127.0.0.1".to_string(),
            ..ServerConfig::default()
        },
    )
    .expect("create server")
}

struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    cseq: u32,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Client {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
            cseq: 0,
        }
    }

    /// Send one request and return the status code, headers and body.
    fn request(&mut self, method: &str, uri: &str, extra: &str) -> (u16, String, String) {
        self.cseq += 1;
        let text = format!("{method} {uri} RTSP/1.0\r\nCSeq: {}\r\n{extra}\r\n", self.cseq);
        self.writer.write_all(text.as_bytes()).unwrap();

        let mut head = String::new();
        loop {
            let mut line = String::new();
            assert!(self.reader.read_line(&mut line).unwrap() > 0, "connection closed");
            if line == "\r\n" {
                break;
            }
            head.push_str(&line);
        }
        let status = head
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap();
        let body_len = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .map_or(0, |v| v.trim().parse::<usize>().unwrap());
        let mut body = vec![0u8; body_len];
        self.reader.read_exact(&mut body).unwrap();
        (status, head, String::from_utf8(body).unwrap())
    }

    fn play(&mut self, uri: &str) -> String {
        let (status, head, _) = self.request("PLAY", uri, "");
        assert_eq!(status, 200, "PLAY failed: {head}");
        head.lines()
            .find_map(|l| l.strip_prefix("Session: "))
            .map(|v| v.split(';').next().unwrap_or(v).to_string())
            .expect("Session header")
    }

    fn frame(&mut self) -> WireFrame {
        read_frame(&mut self.reader).expect("frame")
    }
}

#[test]
fn options_and_describe() {
    let server = server();
    let addr = server.bind("/test", LIVE, 0).unwrap();
    let mut client = Client::connect(addr);

    let (status, head, _) = client.request("OPTIONS", "*", "");
    assert_eq!(status, 200);
    assert!(head.contains("Public: OPTIONS, DESCRIBE, PLAY, TEARDOWN, GET_PARAMETER"));
    assert!(head.contains("CSeq: 1"));

    let (status, _, body) = client.request("DESCRIBE", &format!("rtsp://{addr}/test"), "");
    assert_eq!(status, 200);
    assert_eq!(body, LIVE);
}

#[test]
fn unknown_mount_is_not_found() {
    let server = server();
    let addr = server.bind("/test", LIVE, 0).unwrap();
    let mut client = Client::connect(addr);

    let (status, _, _) = client.request("PLAY", &format!("rtsp://{addr}/nope"), "");
    assert_eq!(status, 404);
    assert!(server.sessions().is_empty());
}

#[test]
fn malformed_request_gets_bad_request() {
    let server = server();
    let addr = server.bind("/test", LIVE, 0).unwrap();
    let mut client = Client::connect(addr);

    client.writer.write_all(b"garbage\r\n\r\n").unwrap();
    let mut line = String::new();
    client.reader.read_line(&mut line).unwrap();
    assert!(line.starts_with("RTSP/1.0 400"), "got {line:?}");
}

#[test]
fn play_streams_frames_until_teardown() {
    let server = server();
    let addr = server.bind("/test", LIVE, 0).unwrap();
    let uri = format!("rtsp://{addr}/test");
    let mut client = Client::connect(addr);

    let session = client.play(&uri);
    let first = client.frame();
    let second = client.frame();
    assert_eq!((first.info.width, first.info.height), (16, 8));
    assert!(second.sequence > first.sequence);
    assert_eq!(server.sessions().len(), 1);
    assert_eq!(server.sessions()[0].id, session);

    // Frames may still be in flight; send TEARDOWN and skip to its response.
    client
        .writer
        .write_all(format!("TEARDOWN {uri} RTSP/1.0\r\nCSeq: 9\r\nSession: {session}\r\n\r\n").as_bytes())
        .unwrap();
    let mut marker = [0u8; 1];
    loop {
        client.reader.read_exact(&mut marker).unwrap();
        if marker[0] == b'R' {
            break;
        }
        let mut rest = [0u8; 5];
        client.reader.read_exact(&mut rest).unwrap();
        let len = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
        let mut skip = vec![0u8; len];
        client.reader.read_exact(&mut skip).unwrap();
    }
    let mut status = String::new();
    client.reader.read_line(&mut status).unwrap();
    assert!(status.starts_with("TSP/1.0 200"), "got R{status}");

    wait_until(|| server.sessions().is_empty());
}

#[test]
fn exclusive_sessions_are_independent() {
    let server = server();
    let addr = server.bind("/test", LIVE, 0).unwrap();
    let uri = format!("rtsp://{addr}/test");

    let mut clients: Vec<Client> = (0..3).map(|_| Client::connect(addr)).collect();
    let sessions: Vec<String> = clients.iter_mut().map(|c| c.play(&uri)).collect();
    assert_eq!(server.sessions().len(), 3);
    let graphs: Vec<_> = server.sessions().iter().filter_map(|s| s.graph).collect();
    assert_eq!(graphs.len(), 3);
    assert!(graphs.iter().all(|g| graphs.iter().filter(|o| *o == g).count() == 1));

    for client in &mut clients {
        client.frame();
    }

    // Client 2 drops its connection without a TEARDOWN.
    let gone = clients.remove(1);
    drop(gone);
    wait_until(|| server.sessions().len() == 2);
    let remaining: Vec<String> = server.sessions().into_iter().map(|s| s.id).collect();
    assert!(remaining.contains(&sessions[0]));
    assert!(remaining.contains(&sessions[2]));

    for client in &mut clients {
        let before = client.frame().sequence;
        let after = client.frame().sequence;
        assert!(after > before);
    }
}

#[test]
fn shared_mount_fans_out_one_graph() {
    let server = server();
    let addr = server
        .bind_with_policy("/shared", LIVE, 0, MountPolicy::Shared)
        .unwrap();
    let uri = format!("rtsp://{addr}/shared");

    let mut a = Client::connect(addr);
    let mut b = Client::connect(addr);
    a.play(&uri);
    b.play(&uri);

    let sessions = server.sessions();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].graph, sessions[1].graph);

    let fa = a.frame();
    let fb = b.frame();
    assert_eq!(fa.info, fb.info);

    drop(a);
    wait_until(|| server.sessions().len() == 1);
    let before = b.frame().sequence;
    assert!(b.frame().sequence > before);
}

#[test]
fn finite_stream_ends_the_session() {
    let server = server();
    let addr = server
        .bind("/short", "testsrc num-buffers=3 width=4 height=4 ! appsink", 0)
        .unwrap();
    let mut client = Client::connect(addr);
    client.play(&format!("rtsp://{addr}/short"));

    for expected in 0..3 {
        assert_eq!(client.frame().sequence, expected);
    }
    wait_until(|| server.sessions().is_empty());

    // The server closes the connection once the graph is gone.
    let mut rest = Vec::new();
    let _ = client.reader.read_to_end(&mut rest);
    assert!(rest.is_empty());
}

#[test]
fn end_session_closes_one_client() {
    let server = server();
    let addr = server.bind("/test", LIVE, 0).unwrap();
    let uri = format!("rtsp://{addr}/test");
    let mut kept = Client::connect(addr);
    let mut ended = Client::connect(addr);
    kept.play(&uri);
    let id = ended.play(&uri);
    ended.frame();

    server.end_session(&id).unwrap();
    wait_until(|| server.sessions().len() == 1);
    assert_ne!(server.sessions()[0].id, id);

    // Frames already queued may arrive before the server closes the socket.
    let mut rest = Vec::new();
    let _ = ended.reader.read_to_end(&mut rest);
    kept.frame();

    assert!(matches!(
        server.end_session(&id),
        Err(RelayError::SessionNotFound(missing)) if missing == id
    ));
}

#[test]
fn bind_errors_are_reported() {
    let server = server();
    assert!(matches!(
        server.bind("/x", "testsrc ! nosuchstage ! appsink", 0),
        Err(RelayError::Bind { .. })
    ));
    assert!(matches!(
        server.bind("/x", "testsrc ! fakesink", 0),
        Err(RelayError::Bind { .. })
    ));
}

#[test]
fn stop_ends_sessions_and_closes_connections() {
    let server = server();
    let addr = server.bind("/test", LIVE, 0).unwrap();
    let mut client = Client::connect(addr);
    client.play(&format!("rtsp://{addr}/test"));
    client.frame();

    server.stop();
    assert!(server.sessions().is_empty());
    assert!(TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_err());
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(10));
    }
}
