/// A control response.
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 2\r\n
/// Session: 00000000DEADBEEF;timeout=60\r\n
/// \r\n
/// ```
///
/// Built by chaining [`header`](Self::header) and [`body`](Self::body);
/// `Content-Length` is added when a body is present.
#[must_use]
#[derive(Debug)]
pub struct Response {
    pub status_code: u16,
    pub status_text: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Option<(String, String)>,
}

/// Sent in the `Server` header of every response.
pub const SERVER_AGENT: &str = concat!("streamrelay/", env!("CARGO_PKG_VERSION"));

impl Response {
    pub fn new(status_code: u16, status_text: &'static str) -> Self {
        Response {
            status_code,
            status_text,
            headers: vec![("Server".to_string(), SERVER_AGENT.to_string())],
            body: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    pub fn session_not_found() -> Self {
        Self::new(454, "Session Not Found")
    }

    pub fn internal_error() -> Self {
        Self::new(500, "Internal Server Error")
    }

    pub fn not_implemented() -> Self {
        Self::new(501, "Not Implemented")
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, content_type: &str, body: String) -> Self {
        self.body = Some((content_type.to_string(), body));
        self
    }

    pub fn serialize(&self) -> String {
        let mut out = format!("RTSP/1.0 {} {}\r\n", self.status_code, self.status_text);
        for (name, value) in &self.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        match &self.body {
            Some((content_type, body)) => {
                out.push_str(&format!(
                    "Content-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
                    body.len()
                ));
                out.push_str(body);
            }
            None => out.push_str("\r\n"),
        }
        out
    }
}
